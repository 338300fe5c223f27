//! `slotsync diff <file>` — preview the change set for one sheet.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;

use slotsync_core::{config, Change, ChangeKind, SlotCounts};
use slotsync_sync::SyncPipeline;

/// Arguments for `slotsync diff`.
#[derive(Args, Debug)]
pub struct DiffArgs {
    /// Source sheet to diff against the store.
    pub file: PathBuf,
}

impl DiffArgs {
    pub fn run(self) -> Result<()> {
        let home = super::home_dir()?;
        let config = config::load_at(&home).context("failed to load config")?;
        let pipeline =
            SyncPipeline::from_config(&config, &home, true).context("invalid sync configuration")?;

        let rt = super::runtime()?;
        let diff = rt
            .block_on(async {
                let cancel = super::interrupt_token();
                pipeline.diff_file(&self.file, &cancel).await
            })
            .with_context(|| format!("diff failed for '{}'", self.file.display()))?;

        if diff.extraction.excluded > 0 {
            println!(
                "{}",
                format!(
                    "{} row(s) excluded: partition not resolved",
                    diff.extraction.excluded
                )
                .yellow()
            );
        }
        if diff.changes.is_empty() {
            println!("No differences for '{}'.", diff.file.display());
            return Ok(());
        }

        for change in &diff.changes {
            println!("{}", render_change(change));
        }
        let counts = diff.changes.counts();
        println!(
            "{} insert(s), {} update(s), {} delete(s)",
            counts.inserts, counts.updates, counts.deletes
        );
        Ok(())
    }
}

fn render_change(change: &Change) -> String {
    match change.kind {
        ChangeKind::Insert => format!(
            "+ {} {}",
            change.key,
            slots(change.after.as_ref())
        )
        .green()
        .to_string(),
        ChangeKind::Update => format!(
            "~ {} {} -> {}",
            change.key,
            slots(change.before.as_ref()),
            slots(change.after.as_ref())
        )
        .yellow()
        .to_string(),
        ChangeKind::Delete => format!(
            "- {} {}",
            change.key,
            slots(change.before.as_ref())
        )
        .red()
        .to_string(),
    }
}

fn slots(counts: Option<&SlotCounts>) -> String {
    let Some(counts) = counts else {
        return "{}".to_string();
    };
    let inner: Vec<String> = counts
        .iter()
        .map(|(slot, count)| format!("{slot}={count}"))
        .collect();
    format!("{{{}}}", inner.join(", "))
}
