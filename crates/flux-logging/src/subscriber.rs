use thiserror::Error;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use crate::config::{LogFormat, LoggingConfig};

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("Invalid log filter `{filter}`: {reason}")]
    InvalidFilter { filter: String, reason: String },

    #[error("Failed to install subscriber: {0}")]
    InitError(String),
}

/// 构建过滤器；设置了 `RUST_LOG` 时以环境变量为准
pub fn build_filter(config: &LoggingConfig) -> Result<EnvFilter, LoggingError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }

    let filter = config.filter();
    EnvFilter::try_new(&filter).map_err(|e| LoggingError::InvalidFilter {
        filter,
        reason: e.to_string(),
    })
}

/// 安装全局 subscriber
///
/// 进程内只能安装一次，重复调用返回 `InitError`。
pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingError> {
    let filter = build_filter(config)?;
    let registry = tracing_subscriber::registry().with(filter);

    let result = match config.format {
        LogFormat::Pretty => registry
            .with(fmt::layer().with_thread_names(config.thread_names))
            .try_init(),
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_thread_names(config.thread_names),
            )
            .try_init(),
    };

    result.map_err(|e| LoggingError::InitError(e.to_string()))
}

/// 测试用：输出到测试捕获，已安装时静默忽略
pub fn init_test_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_test_writer().with_thread_names(true))
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_directive_rejected() {
        std::env::remove_var("RUST_LOG");
        let config = LoggingConfig::default().with_directive("flux_lifecycle=notalevel");

        let err = build_filter(&config).unwrap_err();
        assert!(matches!(err, LoggingError::InvalidFilter { .. }));
    }

    #[test]
    fn test_second_init_fails() {
        init_test_logging();

        let result = init_logging(&LoggingConfig::default());
        assert!(matches!(result, Err(LoggingError::InitError(_))));
    }
}
