//! Logging bootstrap
//!
//! TigerStyle: Explicit telemetry configuration, one global subscriber.
//!
//! Installs a `tracing-subscriber` fmt layer filtered by `RUST_LOG` (falling
//! back to the configured level). Library code only emits events; binaries and
//! tests decide whether to call [`init_telemetry`].

use crate::error::{Error, Result};

/// Default log level filter
const LOG_LEVEL_DEFAULT: &str = "info";

/// Telemetry configuration
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name recorded in the startup event
    pub service_name: String,
    /// Whether to output events to stdout
    pub stdout_enabled: bool,
    /// Log level filter
    pub log_level: String,
    /// Whether to print the thread name of each event
    pub thread_names: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "softbus".to_string(),
            stdout_enabled: true,
            log_level: LOG_LEVEL_DEFAULT.to_string(),
            thread_names: true,
        }
    }
}

impl TelemetryConfig {
    /// Create a new configuration with the given service name
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Default::default()
        }
    }

    /// Disable stdout output
    pub fn without_stdout(mut self) -> Self {
        self.stdout_enabled = false;
        self
    }

    /// Set the log level filter
    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    /// Omit thread names from events
    pub fn without_thread_names(mut self) -> Self {
        self.thread_names = false;
        self
    }

    /// Create from environment variables
    ///
    /// Reads:
    /// - `SOFTBUS_SERVICE_NAME`: Service name (default: "softbus")
    /// - `RUST_LOG`: Log level filter (default: "info")
    pub fn from_env() -> Self {
        let service_name =
            std::env::var("SOFTBUS_SERVICE_NAME").unwrap_or_else(|_| "softbus".to_string());
        let log_level =
            std::env::var("RUST_LOG").unwrap_or_else(|_| LOG_LEVEL_DEFAULT.to_string());

        Self {
            service_name,
            log_level,
            ..Default::default()
        }
    }
}

/// Initialize the global tracing subscriber
///
/// # Example
///
/// ```rust,ignore
/// use softbus_core::telemetry::{init_telemetry, TelemetryConfig};
///
/// let _guard = init_telemetry(TelemetryConfig::new("my-app").with_log_level("debug"))?;
/// ```
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard> {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let fmt_layer = if config.stdout_enabled {
        Some(tracing_subscriber::fmt::layer().with_thread_names(config.thread_names))
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| Error::invalid_state(format!("failed to initialize tracing subscriber: {}", e)))?;

    tracing::info!(service = %config.service_name, "Telemetry initialized");

    Ok(TelemetryGuard { _private: () })
}

/// Returned by [`init_telemetry`]; keep it alive for the process lifetime
#[derive(Debug)]
pub struct TelemetryGuard {
    _private: (),
}
