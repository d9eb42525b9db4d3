use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use config::{Config, File, FileFormat};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::context::ExecutionContext;
use crate::executor::{ExecutorConfig, ExecutorError};
use crate::strategy::{Dispatch, OffloadPoint, StrategyScope, UnknownOffloadPoint};

#[derive(Debug, Error)]
pub enum StrategyConfigError {
    #[error(transparent)]
    UnknownPoint(#[from] UnknownOffloadPoint),

    #[error("Unknown executor: {0}")]
    UnknownExecutor(String),

    #[error("Executor error: {0}")]
    Executor(#[from] ExecutorError),
}

/// 作用域的快捷模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OffloadMode {
    OffloadAll,
    OffloadNone,
}

/// 单个作用域的配置
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ScopeConfig {
    #[serde(default)]
    pub mode: Option<OffloadMode>,
    /// 投递点名称 -> inline / offload，覆盖 `mode`
    #[serde(default)]
    pub points: BTreeMap<String, Dispatch>,
    #[serde(default)]
    pub executor: Option<String>,
}

impl ScopeConfig {
    /// 转换为策略作用域，执行器名称在 `context` 中查找
    pub fn to_scope(&self, context: &ExecutionContext) -> Result<StrategyScope, StrategyConfigError> {
        let mut scope = match self.mode {
            Some(OffloadMode::OffloadAll) => StrategyScope::offload_all(),
            Some(OffloadMode::OffloadNone) => StrategyScope::offload_none(),
            None => StrategyScope::new(),
        };

        for (name, dispatch) in &self.points {
            scope = scope.with(name.parse::<OffloadPoint>()?, *dispatch);
        }

        if let Some(name) = &self.executor {
            let executor = context
                .executor(name)
                .ok_or_else(|| StrategyConfigError::UnknownExecutor(name.clone()))?;
            scope = scope.with_executor(executor.clone());
        }

        Ok(scope)
    }

    fn check(&self, executors: &BTreeSet<&str>) -> Result<(), StrategyConfigError> {
        for name in self.points.keys() {
            name.parse::<OffloadPoint>()?;
        }
        match &self.executor {
            Some(name) if !executors.contains(name.as_str()) => {
                Err(StrategyConfigError::UnknownExecutor(name.clone()))
            }
            _ => Ok(()),
        }
    }
}

/// 服务（类）级配置及其方法级覆盖
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub mode: Option<OffloadMode>,
    #[serde(default)]
    pub points: BTreeMap<String, Dispatch>,
    #[serde(default)]
    pub executor: Option<String>,
    #[serde(default)]
    pub methods: BTreeMap<String, ScopeConfig>,
}

impl ServiceConfig {
    pub fn scope(&self) -> ScopeConfig {
        ScopeConfig {
            mode: self.mode,
            points: self.points.clone(),
            executor: self.executor.clone(),
        }
    }
}

/// 执行策略配置
///
/// ```toml
/// [default_executor]
/// name = "flux-offload"
/// worker_threads = 8
///
/// [[executors]]
/// name = "blocking"
///
/// [server]
/// mode = "offload_none"
///
/// [services.greeter]
/// points = { response_body = "offload" }
///
/// [services.greeter.methods.stream_hello]
/// mode = "offload_all"
/// executor = "blocking"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct StrategyConfig {
    #[serde(default)]
    pub default_executor: ExecutorConfig,
    #[serde(default)]
    pub executors: Vec<ExecutorConfig>,
    /// 全局默认作用域；未设置时全部转移
    #[serde(default)]
    pub default: ScopeConfig,
    #[serde(default)]
    pub server: ScopeConfig,
    #[serde(default)]
    pub services: BTreeMap<String, ServiceConfig>,
}

impl StrategyConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// 检查投递点名称与执行器引用
    pub fn check(&self) -> Result<(), StrategyConfigError> {
        self.default_executor.validate()?;
        let mut names = BTreeSet::new();
        names.insert(self.default_executor.name.as_str());
        for executor in &self.executors {
            executor.validate()?;
            if !names.insert(executor.name.as_str()) {
                return Err(ExecutorError::InvalidConfig(format!(
                    "duplicate executor name `{}`",
                    executor.name
                ))
                .into());
            }
        }

        self.default.check(&names)?;
        self.server.check(&names)?;
        for service in self.services.values() {
            service.scope().check(&names)?;
            for method in service.methods.values() {
                method.check(&names)?;
            }
        }
        Ok(())
    }

    /// 按配置构建执行上下文
    pub fn build_context(&self) -> Result<ExecutionContext, StrategyConfigError> {
        self.check()?;

        let mut builder =
            ExecutionContext::builder().with_default_executor(self.default_executor.clone());
        for executor in &self.executors {
            builder = builder.with_executor(executor.clone());
        }
        let context = builder.build()?;

        // 全局作用域引用的执行器要在上下文构建之后才能解析
        let global = match self.default.to_scope(&context) {
            Ok(global) => global,
            Err(err) => {
                context.close();
                return Err(err);
            }
        };
        Ok(context.with_global_scope(global))
    }
}

/// 执行策略配置加载器
pub struct StrategyConfigLoader {
    path: PathBuf,
}

impl StrategyConfigLoader {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// 加载配置；文件不存在时返回默认配置
    pub fn load(&self) -> Result<StrategyConfig> {
        if !self.path.exists() {
            return Ok(StrategyConfig::default());
        }

        let config = Config::builder()
            .add_source(File::new(
                self.path.to_str().ok_or_else(|| anyhow!("Invalid config path"))?,
                FileFormat::Toml,
            ))
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// 加载并验证配置
    pub fn validate(&self) -> Result<StrategyConfig> {
        let config = self.load()?;
        config
            .check()
            .map_err(|err| anyhow!("{}: {}", self.path.display(), err))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    const CONFIG: &str = r#"
[default_executor]
name = "cfg-offload"
worker_threads = 2
shutdown_grace_ms = 100

[[executors]]
name = "cfg-blocking"
worker_threads = 1

[server]
mode = "offload_none"

[services.greeter]
points = { response_body = "offload" }

[services.greeter.methods.stream_hello]
mode = "offload_all"
executor = "cfg-blocking"
"#;

    #[test]
    fn test_load_missing_file_returns_default() {
        let dir = tempdir().unwrap();
        let loader = StrategyConfigLoader::new(dir.path().join("strategy.toml"));

        let config = loader.load().unwrap();
        assert_eq!(config, StrategyConfig::default());
        assert_eq!(config.default_executor.name, "flux-offload");
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("strategy.toml");
        fs::write(&path, CONFIG).unwrap();

        let config = StrategyConfigLoader::new(&path).validate().unwrap();

        assert_eq!(config.default_executor.worker_threads, 2);
        assert_eq!(config.executors.len(), 1);
        assert_eq!(config.server.mode, Some(OffloadMode::OffloadNone));
        let greeter = &config.services["greeter"];
        assert_eq!(greeter.points["response_body"], Dispatch::Offload);
        assert_eq!(
            greeter.methods["stream_hello"].executor.as_deref(),
            Some("cfg-blocking")
        );
    }

    #[test]
    fn test_unknown_point_fails_validation() {
        let config = StrategyConfig::from_toml_str(
            r#"
[server]
points = { request_trailers = "inline" }
"#,
        )
        .unwrap();

        assert!(matches!(
            config.check(),
            Err(StrategyConfigError::UnknownPoint(_))
        ));
    }

    #[test]
    fn test_unknown_executor_fails_validation() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("strategy.toml");
        fs::write(
            &path,
            r#"
[services.greeter.methods.hello]
executor = "missing"
"#,
        )
        .unwrap();

        let err = StrategyConfigLoader::new(&path).validate().unwrap_err();
        assert!(err.to_string().contains("Unknown executor: missing"));
    }

    #[test]
    fn test_build_context_from_config() {
        let config = StrategyConfig::from_toml_str(CONFIG).unwrap();
        let context = config.build_context().unwrap();

        assert!(context.executor("cfg-blocking").is_some());
        assert_eq!(context.default_executor().name(), "cfg-offload");

        context.close();
    }
}
