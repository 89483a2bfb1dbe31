mod cli;
mod restore;
mod server;

use clap::Parser;
use cli::{Cli, Commands};
use doubleteam::config::Config;
use doubleteam::observability;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();

    let config = observability::with_startup_logging(|| Config::load_with(cli.config))?;
    observability::init_tracing(&config.log.level);

    match cli.command {
        Commands::Server(args) => server::run(config, args.address).await?,
        Commands::Restore(args) => restore::run(config, args.until).await?,
    }

    Ok(())
}
