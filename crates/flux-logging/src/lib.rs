pub mod config;
pub mod subscriber;

pub use config::{LogFormat, LogLevel, LoggingConfig};
pub use subscriber::{build_filter, init_logging, init_test_logging, LoggingError};
