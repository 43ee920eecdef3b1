//! parleyd - parley peer messaging daemon
//!
//! Opens a TCP endpoint, answers the built-in handlers and logs every
//! peer event until interrupted.

use clap::Parser;
use parleyd::config::Config;
use parleyd::node::Node;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn init_tracing(config: &Config) {
    let level = if config.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("parleyd={level},parley_net={level},parley_core={level}"))
    });

    if config.log_format == "json" {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Parse configuration
    let config = Config::parse();
    init_tracing(&config);

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        return ExitCode::FAILURE;
    }

    info!(
        "parleyd v{} - peer {} on {}",
        env!("CARGO_PKG_VERSION"),
        config.id,
        config.listen
    );

    let node = match Node::new(&config) {
        Ok(node) => node,
        Err(e) => {
            error!("Failed to initialize node: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
    };

    if let Err(e) = node.run(shutdown).await {
        error!("Node error: {:#}", e);
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
