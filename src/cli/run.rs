use anyhow::{Context, Result};
use clap::Args;
use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::Config;
use crate::sandbox::{CancellationToken, ExecuteOptions, Executor};

#[derive(Args)]
pub struct RunArgs {
    /// Code file to execute ("-" reads stdin)
    pub file: String,

    /// Helper to prepend (repeatable, order preserved)
    #[arg(long = "helper", value_name = "NAME")]
    pub helpers: Vec<String>,

    /// Working directory the sandbox may read from (default: current directory)
    #[arg(long)]
    pub cwd: Option<PathBuf>,

    /// Cancel the run after this many milliseconds (default: from config)
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// V8 heap ceiling in bytes (default: from config)
    #[arg(long)]
    pub memory_limit: Option<usize>,
}

pub async fn run(args: RunArgs, config: &Config) -> Result<()> {
    let code = read_code(&args.file)?;
    let cwd = match args.cwd {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    };
    let timeout = Duration::from_millis(args.timeout_ms.unwrap_or(config.sandbox.timeout_ms));

    let executor = Executor::from_config(&config.sandbox);
    let cancel = CancellationToken::new();

    // Deadline timer and Ctrl-C both fire the same token.
    let deadline = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {
                    warn!(timeout_ms = timeout.as_millis() as u64, "Deadline reached, cancelling");
                    cancel.cancel();
                }
                _ = tokio::signal::ctrl_c() => {
                    warn!("Interrupted, cancelling");
                    cancel.cancel();
                }
                _ = cancel.cancelled() => {}
            }
        })
    };

    let mut options = ExecuteOptions::new(cwd, cancel.clone());
    options.memory_limit_bytes = args.memory_limit;

    debug!(file = %args.file, helpers = ?args.helpers, "Running");
    let result = executor.execute(&args.helpers, &code, options).await;

    cancel.cancel();
    if let Err(e) = deadline.await {
        warn!("Deadline task failed: {}", e);
    }

    let output = result?;
    if !output.is_empty() {
        println!("{}", output);
    }
    Ok(())
}

fn read_code(file: &str) -> Result<String> {
    if file == "-" {
        let mut code = String::new();
        std::io::stdin()
            .read_to_string(&mut code)
            .context("Failed to read code from stdin")?;
        return Ok(code);
    }
    std::fs::read_to_string(file).with_context(|| format!("Failed to read {}", file))
}
