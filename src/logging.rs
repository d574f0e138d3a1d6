//! Subscriber setup for binaries and tests embedding the crate.
//!
//! Library code only emits `tracing` events. Installing a subscriber is the
//! host process's call; this helper is the one place that does it.

use tracing_subscriber::fmt;
use tracing_subscriber::EnvFilter;

use crate::error::{HsmError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl LogFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "pretty" | "plain" => Some(Self::Text),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

fn parse_level(level: &str) -> Result<tracing::Level> {
    match level.to_ascii_lowercase().as_str() {
        "trace" => Ok(tracing::Level::TRACE),
        "debug" => Ok(tracing::Level::DEBUG),
        "info" => Ok(tracing::Level::INFO),
        "warn" => Ok(tracing::Level::WARN),
        "error" => Ok(tracing::Level::ERROR),
        _ => Err(HsmError::Configuration(format!("invalid log level: {}", level))),
    }
}

/// Install a global subscriber writing to stderr.
///
/// `RUST_LOG` wins over `level`. Fails if `level` is unknown or a subscriber
/// is already installed.
pub fn init_tracing(level: &str, format: LogFormat) -> Result<()> {
    let level = parse_level(level)?;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_ascii_lowercase()));

    let subscriber = fmt()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_env_filter(filter);

    let installed = match format {
        LogFormat::Json => subscriber.json().try_init(),
        LogFormat::Text => subscriber.try_init(),
    };
    installed.map_err(|e| HsmError::Configuration(format!("tracing already initialised: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_unknown_level() {
        assert!(matches!(
            init_tracing("verbose", LogFormat::Text),
            Err(HsmError::Configuration(_))
        ));
        assert_eq!(LogFormat::parse("JSON"), Some(LogFormat::Json));
        assert_eq!(LogFormat::parse("xml"), None);
    }
}
