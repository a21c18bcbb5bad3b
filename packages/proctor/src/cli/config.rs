use anyhow::{Context, Result};

use crate::config::ProctorConfig;

/// Print the configuration after defaults, proctor.toml and env are layered.
pub fn config_command(config: &ProctorConfig) -> Result<()> {
    let rendered =
        toml::to_string_pretty(&config.file).context("Failed to render configuration")?;
    println!("# data dir: {}", config.data_dir.display());
    print!("{}", rendered);
    Ok(())
}
