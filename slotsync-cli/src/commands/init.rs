//! `slotsync init <source-dir>`

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use slotsync_core::config;

/// Write `~/.slotsync/config.yaml` pointing at a source directory.
#[derive(Args, Debug)]
pub struct InitArgs {
    /// Directory holding the reservation sheets.
    pub source_dir: PathBuf,
}

impl InitArgs {
    pub fn run(self) -> Result<()> {
        let home = super::home_dir()?;
        let source_dir = self
            .source_dir
            .canonicalize()
            .with_context(|| format!("cannot resolve path '{}'", self.source_dir.display()))?;

        let config = config::init_at(&home, source_dir)
            .context("failed to write slotsync config")?;

        println!("✓ Watching '{}'", config.source_dir.display());
        println!(
            "  {} partition(s) mapped; edit {} to change them",
            config.partitions.len(),
            config::config_path_at(&home).display()
        );
        Ok(())
    }
}
