//! Logging infrastructure for the pwalauncher gateway.
//!
//! This crate provides:
//! - Structured JSON (or pretty) logging to stdout via `tracing-subscriber`
//! - Standard audit event names and `log_*!` macros that stamp them
//!
//! # Usage
//!
//! ```ignore
//! use pwalauncher_telemetry::{Telemetry, TelemetryConfig};
//!
//! let config = TelemetryConfig::new().with_log_level("info");
//! let telemetry = Telemetry::init(config)?;
//! ```

pub mod config;
pub mod logging;

pub use config::{LogFormat, TelemetryConfig};
pub use logging::events;

use thiserror::Error;

/// Telemetry errors.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Failed to initialize logging.
    #[error("failed to initialize logging: {0}")]
    LoggingInit(String),
}

/// Main telemetry handle.
pub struct Telemetry {
    config: TelemetryConfig,
}

impl Telemetry {
    /// Initialize telemetry with the given configuration.
    ///
    /// Installs the global subscriber; fails if one is already installed.
    pub fn init(config: TelemetryConfig) -> Result<Self, TelemetryError> {
        logging::init_logging(&config)?;
        Ok(Self { config })
    }

    /// Build a handle without touching the global subscriber.
    ///
    /// Use this when logging is already initialized (e.g., in tests).
    pub fn without_logging(config: TelemetryConfig) -> Self {
        Self { config }
    }

    /// Get the telemetry configuration.
    pub fn config(&self) -> &TelemetryConfig {
        &self.config
    }
}
