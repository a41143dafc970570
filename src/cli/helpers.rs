use anyhow::Result;

use crate::config::Config;
use crate::sandbox::HelperLoader;

pub fn run(config: &Config) -> Result<()> {
    let loader = HelperLoader::new(config.sandbox.helpers_path());
    let names = loader.list()?;

    if names.is_empty() {
        println!("No helpers found in {}", loader.root().display());
        return Ok(());
    }

    for name in names {
        println!("{}", name);
    }
    Ok(())
}
