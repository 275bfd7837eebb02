//! pwalauncher edge gateway.
//!
//! Terminates TLS, screens requests through the access gates, multiplexes
//! backends under path prefixes and serves the SPA fallback.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;

use pwalauncher_lib::server::panic_message;
use pwalauncher_lib::{Gateway, GatewayConfig, GatewayServer};
use pwalauncher_telemetry::{
    log_config_loaded, log_shutdown, log_startup, LogFormat, Telemetry, TelemetryConfig,
};

#[derive(Parser, Debug)]
#[command(name = "pwalauncher", about = "Edge gateway for progressive web apps", version)]
struct Cli {
    /// Configuration file (YAML or JSON).
    #[arg(default_value = "pwalauncher.yaml", env = "PWALAUNCHER_CONFIG")]
    config: PathBuf,

    /// Log level.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log format (json or pretty).
    #[arg(long, default_value = "json")]
    log_format: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let Some(log_format) = LogFormat::parse(&cli.log_format) else {
        eprintln!(
            "error: invalid log format '{}' (expected json or pretty)",
            cli.log_format
        );
        return ExitCode::from(1);
    };

    let telemetry_config = TelemetryConfig::new()
        .with_log_level(cli.log_level.as_str())
        .with_log_format(log_format);
    let telemetry = match Telemetry::init(telemetry_config) {
        Ok(telemetry) => telemetry,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::from(1);
        }
    };

    // Panics outside request handling are logged before the default hook runs.
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        tracing::error!(
            event = pwalauncher_telemetry::events::INTERNAL_ERROR,
            kind = "panic",
            error = %panic_message(info.payload()),
            location = ?info.location(),
            "panic"
        );
        default_hook(info);
    }));

    log_startup!(
        service = %telemetry.config().service_name,
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "pwalauncher starting"
    );

    match run(&cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            tracing::error!(error = %message, "pwalauncher failed to start");
            eprintln!("error: {}", message);
            ExitCode::from(1)
        }
    }
}

async fn run(cli: &Cli) -> Result<(), String> {
    let config = GatewayConfig::load(&cli.config).map_err(|e| e.to_string())?;
    log_config_loaded!(
        path = %cli.config.display(),
        numbered = config.ports.len(),
        named = config.proxy.len(),
        tls = config.ssl.is_some(),
        "configuration loaded"
    );

    let gateway = Arc::new(Gateway::new(config).map_err(|e| e.to_string())?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = GatewayServer::bind(gateway, shutdown_rx)
        .await
        .map_err(|e| e.to_string())?;

    tokio::spawn(async move {
        wait_for_signal().await;
        let _ = shutdown_tx.send(true);
    });

    server.run().await;
    log_shutdown!("pwalauncher stopped");
    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => tracing::info!("received SIGINT"),
                    _ = sigterm.recv() => tracing::info!("received SIGTERM"),
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to register SIGTERM handler");
                let _ = ctrl_c.await;
                tracing::info!("received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
        tracing::info!("received SIGINT");
    }
}
