//! pwalauncher gateway library.
//!
//! The `pwalauncher` binary is a thin wrapper over [`server`]; the modules
//! are public so integration tests can drive the pipeline in-process.

pub mod anywhere;
pub mod config;
pub mod cors;
pub mod error;
pub mod fallback;
pub mod gate;
pub mod pin;
pub mod proxy;
pub mod relay;
pub mod response;
pub mod server;
pub mod tls;

pub use config::{ConfigError, GatewayConfig, SessionSecret};
pub use error::GatewayError;
pub use server::{Gateway, GatewayServer, ListenerKind, ServerError};
