use anyhow::{Context, Result};
use proctor_sync::{FileConfig, SyncConfig, load_config};
use std::path::PathBuf;
use tracing::debug;

/// Resolved locations plus the layered tunables.
pub struct ProctorConfig {
    pub data_dir: PathBuf,
    /// File-backed recovery tickets, one JSON file per ticket
    pub tickets_dir: PathBuf,
    pub file: FileConfig,
}

impl ProctorConfig {
    pub fn new(custom_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match custom_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .context("Could not find home directory")?
                .join(".proctor"),
        };

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {:?}", data_dir))?;

        let tickets_dir = data_dir.join("tickets");
        std::fs::create_dir_all(&tickets_dir)
            .with_context(|| format!("Failed to create tickets directory: {:?}", tickets_dir))?;

        let file: FileConfig = load_config(&data_dir)
            .extract()
            .context("Failed to load proctor configuration")?;

        debug!("Data directory: {}", data_dir.display());

        Ok(Self {
            data_dir,
            tickets_dir,
            file,
        })
    }

    pub fn sync(&self) -> SyncConfig {
        SyncConfig::from_file(&self.file)
    }
}
