use anyhow::Result;
use clap::Parser;
use std::path::Path;

use jsjail::cli::{self, Cli, Commands};
use jsjail::config::Config;

fn main() -> Result<()> {
    let cli = Cli::parse();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    let config = Config::load(cli.config.as_deref().map(Path::new))?;

    // Initialize logging
    let log_level = if cli.verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .init();

    match cli.command {
        Commands::Run(args) => cli::run::run(args, &config).await,
        Commands::Helpers => cli::helpers::run(&config),
        Commands::Config(args) => cli::config::run(args, &config, cli.config.as_deref()),
    }
}
