//! Structured logging with JSON output.
//!
//! Logs go to stdout as one JSON object per line; every audit event carries an
//! `event` field with one of the names in [`events`].

use crate::{LogFormat, TelemetryConfig, TelemetryError};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Initialize the logging subsystem.
///
/// Sets up tracing-subscriber with either JSON or pretty format,
/// respecting the configured log level.
pub fn init_logging(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    // Build the env filter from config or RUST_LOG
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    match config.log_format {
        LogFormat::Json => init_json_logging(filter),
        LogFormat::Pretty => init_pretty_logging(filter),
    }
}

/// Initialize JSON logging for production.
fn init_json_logging(filter: EnvFilter) -> Result<(), TelemetryError> {
    let json_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_current_span(true)
        .with_span_list(false)
        .with_file(false)
        .with_line_number(false)
        .flatten_event(true)
        .with_filter(filter);

    tracing_subscriber::registry()
        .with(json_layer)
        .try_init()
        .map_err(|e: tracing_subscriber::util::TryInitError| {
            TelemetryError::LoggingInit(e.to_string())
        })
}

/// Initialize pretty logging for development.
fn init_pretty_logging(filter: EnvFilter) -> Result<(), TelemetryError> {
    let pretty_layer = fmt::layer()
        .pretty()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_filter(filter);

    tracing_subscriber::registry()
        .with(pretty_layer)
        .try_init()
        .map_err(|e: tracing_subscriber::util::TryInitError| {
            TelemetryError::LoggingInit(e.to_string())
        })
}

/// Standard log event names.
pub mod events {
    /// Gateway is starting up.
    pub const STARTUP: &str = "startup";

    /// Gateway is shutting down.
    pub const SHUTDOWN: &str = "shutdown";

    /// Configuration file has been loaded and validated.
    pub const CONFIG_LOADED: &str = "config_loaded";

    /// A listener is bound and accepting connections.
    pub const LISTENING: &str = "listening";

    /// An access gate rejected (or redirected) a request.
    pub const GATE_REJECTED: &str = "gate_rejected";

    /// A TLS connection failed the client certificate pin.
    pub const PIN_REJECTED: &str = "pin_rejected";

    /// Forwarding to a target failed.
    pub const UPSTREAM_ERROR: &str = "upstream_error";

    /// An upgraded (WebSocket) stream was spliced to a target.
    pub const UPGRADE_OPENED: &str = "upgrade_opened";

    /// An upgraded stream ended.
    pub const UPGRADE_CLOSED: &str = "upgrade_closed";

    /// The static fallback served a file.
    pub const STATIC_SERVED: &str = "static_served";

    /// An event was broadcast to relay subscribers.
    pub const RELAY_BROADCAST: &str = "relay_broadcast";

    /// A relay subscriber connected or disconnected.
    pub const RELAY_SUBSCRIBER: &str = "relay_subscriber";

    /// A request failed inside the gateway itself.
    pub const INTERNAL_ERROR: &str = "internal_error";
}

/// Helper macros for structured logging with standard fields.
///
/// These wrap the tracing macros to ensure consistent field naming.
#[macro_export]
macro_rules! log_startup {
    ($($field:tt)*) => {
        tracing::info!(
            event = $crate::logging::events::STARTUP,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_shutdown {
    ($($field:tt)*) => {
        tracing::info!(
            event = $crate::logging::events::SHUTDOWN,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_config_loaded {
    ($($field:tt)*) => {
        tracing::info!(
            event = $crate::logging::events::CONFIG_LOADED,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_listening {
    ($($field:tt)*) => {
        tracing::info!(
            event = $crate::logging::events::LISTENING,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_gate_rejected {
    ($($field:tt)*) => {
        tracing::warn!(
            event = $crate::logging::events::GATE_REJECTED,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_pin_rejected {
    ($($field:tt)*) => {
        tracing::warn!(
            event = $crate::logging::events::PIN_REJECTED,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_upstream_error {
    ($($field:tt)*) => {
        tracing::error!(
            event = $crate::logging::events::UPSTREAM_ERROR,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_static_served {
    ($($field:tt)*) => {
        tracing::info!(
            event = $crate::logging::events::STATIC_SERVED,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_relay_broadcast {
    ($($field:tt)*) => {
        tracing::info!(
            event = $crate::logging::events::RELAY_BROADCAST,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_internal_error {
    ($($field:tt)*) => {
        tracing::error!(
            event = $crate::logging::events::INTERNAL_ERROR,
            $($field)*
        )
    };
}
