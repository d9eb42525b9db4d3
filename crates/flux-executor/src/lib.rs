pub mod config;
pub mod context;
pub mod executor;
pub mod resolver;
pub mod strategy;

pub use config::{
    OffloadMode, ScopeConfig, ServiceConfig, StrategyConfig, StrategyConfigError,
    StrategyConfigLoader,
};
pub use context::{ExecutionContext, ExecutionContextBuilder};
pub use executor::{ExecutorConfig, ExecutorError, OffloadExecutor, OffloadExecutorBuilder};
pub use resolver::StrategyResolver;
pub use strategy::{Dispatch, ExecutionStrategy, OffloadPoint, StrategyScope, UnknownOffloadPoint};
