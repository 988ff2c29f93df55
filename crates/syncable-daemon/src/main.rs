//! syncable: inspect, edit and synchronize on-disk syncable stores.

use anyhow::Result;
use clap::Parser;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use syncable_daemon::{Command, Config, StoreArgs};

#[derive(Parser, Debug)]
#[command(name = "syncable")]
#[command(about = "Hierarchical content-addressed store with hash-tree sync")]
struct Cli {
    #[command(flatten)]
    args: StoreArgs,

    #[command(subcommand)]
    command: Command,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if cli.args.verbose {
        "debug,syncable_core=debug,syncable_daemon=debug"
    } else {
        "info,syncable_core=info,syncable_daemon=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = Config::from_args(&cli.args)?;
    debug!("Store directory: {:?}", config.store_path);

    let output = syncable_daemon::run(&config, cli.command).await?;
    if !output.is_empty() {
        println!("{}", output);
    }
    Ok(())
}
