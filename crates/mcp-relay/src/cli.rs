use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "mcp-relay",
    version,
    about = "Multi-tenant aggregating proxy for MCP upstreams"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the proxy server.
    Serve {
        /// Path to the TOML config file.
        #[arg(long, default_value = "mcp-relay.toml")]
        config: PathBuf,
        /// Address to bind.
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,
        /// Port to bind.
        #[arg(long, default_value_t = 8787)]
        port: u16,
    },
}
