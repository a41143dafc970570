pub mod config;
pub mod helpers;
pub mod run;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "jsjail")]
#[command(author, version, about = "Run helpers and untrusted code in a disposable V8 sandbox")]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to config file
    #[arg(short, long, global = true, env = "JSJAIL_CONFIG")]
    pub config: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute code in a fresh sandbox and print its log output
    Run(run::RunArgs),

    /// List trusted helpers
    Helpers,

    /// Configuration management
    Config(config::ConfigArgs),
}
