use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::info;

use crate::executor::{ExecutorConfig, ExecutorError, OffloadExecutor};
use crate::strategy::{ExecutionStrategy, StrategyScope};

/// 执行上下文
///
/// 在启动时显式构建、在退出时显式关闭，持有所有命名执行器和全局默认策略。
/// 组件在构造时接收它，而不是访问进程级单例。
pub struct ExecutionContext {
    default_executor: Arc<OffloadExecutor>,
    executors: BTreeMap<String, Arc<OffloadExecutor>>,
    global: StrategyScope,
}

impl ExecutionContext {
    pub fn builder() -> ExecutionContextBuilder {
        ExecutionContextBuilder::new()
    }

    pub fn default_executor(&self) -> &Arc<OffloadExecutor> {
        &self.default_executor
    }

    /// 按名称查找执行器（包括默认执行器）
    pub fn executor(&self, name: &str) -> Option<&Arc<OffloadExecutor>> {
        if self.default_executor.name() == name {
            return Some(&self.default_executor);
        }
        self.executors.get(name)
    }

    pub fn executor_names(&self) -> Vec<&str> {
        std::iter::once(self.default_executor.name())
            .chain(self.executors.keys().map(String::as_str))
            .collect()
    }

    pub fn global_scope(&self) -> &StrategyScope {
        &self.global
    }

    pub(crate) fn with_global_scope(mut self, scope: StrategyScope) -> Self {
        self.global = scope;
        self
    }

    /// 只应用全局默认值的策略
    pub fn strategy(&self) -> ExecutionStrategy {
        self.resolve(std::iter::empty())
    }

    /// 在全局默认值之上按从宽到窄的顺序叠加 `scopes`
    pub fn resolve<'a, I>(&'a self, scopes: I) -> ExecutionStrategy
    where
        I: IntoIterator<Item = &'a StrategyScope>,
    {
        ExecutionStrategy::resolve(
            &self.default_executor,
            std::iter::once(&self.global).chain(scopes),
        )
    }

    /// 关闭所有执行器
    pub fn close(&self) {
        info!(executors = self.executors.len() + 1, "Closing execution context");
        for executor in self.executors.values() {
            executor.close();
        }
        self.default_executor.close();
    }

    pub fn is_closed(&self) -> bool {
        self.default_executor.is_shutdown()
            && self.executors.values().all(|executor| executor.is_shutdown())
    }
}

/// 执行上下文构建器
pub struct ExecutionContextBuilder {
    default_executor: ExecutorConfig,
    executors: Vec<ExecutorConfig>,
    global: StrategyScope,
}

impl ExecutionContextBuilder {
    pub fn new() -> Self {
        Self {
            default_executor: ExecutorConfig::default(),
            executors: Vec::new(),
            global: StrategyScope::offload_all(),
        }
    }

    pub fn with_default_executor(mut self, config: ExecutorConfig) -> Self {
        self.default_executor = config;
        self
    }

    pub fn with_executor(mut self, config: ExecutorConfig) -> Self {
        self.executors.push(config);
        self
    }

    pub fn with_global_strategy(mut self, scope: StrategyScope) -> Self {
        self.global = scope;
        self
    }

    pub fn build(self) -> Result<ExecutionContext, ExecutorError> {
        let default_executor = OffloadExecutor::new(self.default_executor)?;

        let mut executors: BTreeMap<String, Arc<OffloadExecutor>> = BTreeMap::new();
        for config in self.executors {
            if config.name == default_executor.name() || executors.contains_key(&config.name) {
                let name = config.name;
                default_executor.close();
                executors.values().for_each(|executor| {
                    executor.close();
                });
                return Err(ExecutorError::InvalidConfig(format!(
                    "duplicate executor name `{}`",
                    name
                )));
            }
            match OffloadExecutor::new(config) {
                Ok(executor) => {
                    executors.insert(executor.name().to_string(), executor);
                }
                Err(err) => {
                    default_executor.close();
                    executors.values().for_each(|executor| {
                        executor.close();
                    });
                    return Err(err);
                }
            }
        }

        Ok(ExecutionContext {
            default_executor,
            executors,
            global: self.global,
        })
    }
}

impl Default for ExecutionContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::{Dispatch, OffloadPoint};

    fn config(name: &str) -> ExecutorConfig {
        ExecutorConfig {
            name: name.to_string(),
            worker_threads: 1,
            shutdown_grace_ms: 100,
        }
    }

    #[test]
    fn test_context_builder() {
        let context = ExecutionContext::builder()
            .with_default_executor(config("ctx-default"))
            .with_executor(config("ctx-blocking"))
            .build()
            .unwrap();

        assert_eq!(context.executor_names(), vec!["ctx-default", "ctx-blocking"]);
        assert!(context.executor("ctx-blocking").is_some());
        assert!(context.executor("ctx-default").is_some());
        assert!(context.executor("missing").is_none());

        let strategy = context.strategy();
        assert_eq!(strategy.executor().unwrap().name(), "ctx-default");
        assert_eq!(strategy.dispatch(OffloadPoint::ResponseBody), Dispatch::Offload);

        context.close();
        assert!(context.is_closed());
    }

    #[test]
    fn test_global_scope_is_broadest() {
        let context = ExecutionContext::builder()
            .with_default_executor(config("ctx-global"))
            .with_global_strategy(StrategyScope::offload_none())
            .build()
            .unwrap();

        let route = StrategyScope::new().offload(OffloadPoint::RequestBody);
        let strategy = context.resolve([&route]);

        assert!(strategy.is_offloaded(OffloadPoint::RequestBody));
        assert!(!strategy.is_offloaded(OffloadPoint::ResponseBody));
        assert!(context.strategy().offloads_nothing());

        context.close();
    }

    #[test]
    fn test_duplicate_executor_names_rejected() {
        let result = ExecutionContext::builder()
            .with_default_executor(config("ctx-dup"))
            .with_executor(config("ctx-dup"))
            .build();

        assert!(matches!(result, Err(ExecutorError::InvalidConfig(_))));
    }
}
