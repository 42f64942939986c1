//! Tracing subscriber bootstrap.

use crate::config::{LogConfig, LogFormat};

/// Initialize the global tracing subscriber from the log configuration.
///
/// `RUST_LOG` wins over the configured level when set.
pub fn init(config: &LogConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.level));

    match config.format {
        LogFormat::Json => {
            tracing_subscriber::fmt().with_env_filter(filter).json().init();
        }
        LogFormat::Text => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
}
