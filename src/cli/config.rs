use anyhow::Result;
use clap::{Args, Subcommand};

use crate::config::Config;

#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show {
        /// Output format: toml (default) or json
        #[arg(short, long, default_value = "toml")]
        format: String,
    },

    /// Show config file path
    Path,
}

pub fn run(args: ConfigArgs, config: &Config, explicit_path: Option<&str>) -> Result<()> {
    match args.command {
        ConfigCommands::Show { format } => show_config(config, &format),
        ConfigCommands::Path => show_path(explicit_path),
    }
}

fn show_config(config: &Config, format: &str) -> Result<()> {
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(config)?),
        "toml" => println!("{}", toml::to_string_pretty(config)?),
        other => anyhow::bail!("Unknown format: {} (expected toml or json)", other),
    }
    Ok(())
}

fn show_path(explicit_path: Option<&str>) -> Result<()> {
    match explicit_path {
        Some(path) => println!("{}", path),
        None => println!("{}", Config::config_path()?.display()),
    }
    Ok(())
}
