//! Config command implementation.

use anyhow::{Context, Result};

use tether_core::config::Config;

use super::{ConfigAction, ConfigArgs};

/// Run the config command.
pub fn run(args: &ConfigArgs, config: &Config) -> Result<()> {
    match args.action {
        ConfigAction::Show => {
            let rendered = config.to_toml().context("Failed to render configuration")?;
            print!("{}", rendered);
            println!(
                "# download_dir resolves to {}",
                config.storage.resolved_download_dir().display()
            );
        }
        ConfigAction::Path => println!("{}", Config::config_path().display()),
    }
    Ok(())
}
