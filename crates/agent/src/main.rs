//! Relay agent
//!
//! A long-lived daemon that holds a WebSocket session to its control
//! server, executes the commands it is assigned, and reports results
//! back. It reconnects on its own and survives server restarts; only a
//! rejected token or an explicit retry limit makes it give up.

mod autostart;
mod backoff;
mod config;
mod runtime;
mod session;
mod transport;

use std::process::ExitCode;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Cli;
use crate::runtime::AgentRuntime;
use crate::session::SessionError;

fn init_tracing(level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(format!(
                    "{level},tungstenite=warn,tokio_tungstenite=warn"
                ))
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = match config::load(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("relay-agent: {e}");
            return ExitCode::from(1);
        }
    };

    init_tracing(&config.log_level);
    info!(
        "relay-agent {} starting as {:?}",
        env!("CARGO_PKG_VERSION"),
        config.name
    );

    if let Err(e) = autostart::sync(&config) {
        warn!("Autostart configuration failed: {}", e);
    }

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received interrupt, shutting down");
            signal_token.cancel();
        }
    });

    match AgentRuntime::new(config, shutdown).run().await {
        Ok(()) => {
            info!("Shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e @ SessionError::AuthRejected { .. }) => {
            error!("{}", e);
            ExitCode::from(2)
        }
        Err(e) => {
            error!("{}", e);
            ExitCode::from(1)
        }
    }
}
