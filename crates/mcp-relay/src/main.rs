use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;

use relay_config::{RelayConfig, RuntimeOptions, TomlServiceStore};
use relay_server::build_state;

mod cli;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing (output to stderr, initialize only once)
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init()
        .ok();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve { config, bind, port } => serve(&config, &bind, port).await,
    }
}

async fn serve(config_path: &Path, bind: &str, port: u16) -> Result<()> {
    let config = RelayConfig::load(config_path)?;
    let store = Arc::new(TomlServiceStore::new(&config));
    let options = Arc::new(RuntimeOptions::from_file(&config.options));

    let state = build_state(store, options);
    state.manager.initialize().await?;
    tracing::info!(
        services = state.manager.get_all_services().len(),
        "service manager initialized"
    );

    let addr: SocketAddr = format!("{bind}:{port}")
        .parse()
        .with_context(|| format!("invalid bind address '{bind}:{port}'"))?;

    let advertised = match state.manager.options().server_address() {
        address if address.is_empty() => format!("http://{addr}"),
        address => address,
    };
    tracing::info!(base = %format!("{advertised}/proxy"), "client endpoints served under");

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
            signal_token.cancel();
        }
    });

    let result = relay_server::run(addr, state.clone(), shutdown).await;
    state.manager.shutdown().await;
    result
}
