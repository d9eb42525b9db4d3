use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::config::{StrategyConfig, StrategyConfigError};
use crate::context::ExecutionContext;
use crate::strategy::{ExecutionStrategy, StrategyScope};

struct ServiceScopes {
    scope: StrategyScope,
    methods: BTreeMap<String, StrategyScope>,
}

/// 路由策略解析器
///
/// 为 (服务, 方法) 给出生效的执行策略：方法级覆盖服务级，服务级覆盖服务器级，
/// 服务器级覆盖全局默认值。所有作用域在构造时一次性解析。
pub struct StrategyResolver {
    context: Arc<ExecutionContext>,
    server: StrategyScope,
    services: BTreeMap<String, ServiceScopes>,
}

impl StrategyResolver {
    pub fn new(
        context: Arc<ExecutionContext>,
        config: &StrategyConfig,
    ) -> Result<Self, StrategyConfigError> {
        let server = config.server.to_scope(&context)?;

        let mut services = BTreeMap::new();
        for (name, service) in &config.services {
            let mut methods = BTreeMap::new();
            for (method, scope) in &service.methods {
                methods.insert(method.clone(), scope.to_scope(&context)?);
            }
            services.insert(
                name.clone(),
                ServiceScopes {
                    scope: service.scope().to_scope(&context)?,
                    methods,
                },
            );
        }

        Ok(Self {
            context,
            server,
            services,
        })
    }

    pub fn context(&self) -> &Arc<ExecutionContext> {
        &self.context
    }

    /// 服务器级策略（用于接受连接等不属于任何路由的边界）
    pub fn server_strategy(&self) -> ExecutionStrategy {
        self.context.resolve([&self.server])
    }

    pub fn resolve(&self, service: &str, method: &str) -> ExecutionStrategy {
        let mut scopes = vec![&self.server];
        if let Some(service_scopes) = self.services.get(service) {
            scopes.push(&service_scopes.scope);
            if let Some(method_scope) = service_scopes.methods.get(method) {
                scopes.push(method_scope);
            }
        }

        let strategy = self.context.resolve(scopes);
        debug!(service, method, strategy = ?strategy, "Resolved execution strategy");
        strategy
    }
}
