use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "doubleteam")]
#[command(about = "Message ingest with primary stream and durable overflow", long_about = None)]
pub struct Cli {
    /// Configuration file (default: $DOUBLETEAM_CONFIG or config/doubleteam.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the HTTP ingest server
    Server(ServerArgs),
    /// Replay overflow batches into the primary stream
    Restore(RestoreArgs),
}

#[derive(clap::Args, Debug)]
pub struct ServerArgs {
    /// Address to bind the HTTP server to (overrides server.bind_addr)
    #[arg(long)]
    pub address: Option<SocketAddr>,
}

#[derive(clap::Args, Debug)]
pub struct RestoreArgs {
    /// Replay batches written up to this RFC 3339 time (default: now)
    #[arg(long)]
    pub until: Option<DateTime<Utc>>,
}
