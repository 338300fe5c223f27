//! `slotsync sync` — one foreground cycle.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Args;
use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};
use tokio_util::sync::CancellationToken;

use slotsync_core::{config, ClassifiedError, CycleSummary, ErrorCode, TaskStatus};
use slotsync_notifier::{notifier_from_config, Notifier};
use slotsync_sync::{CycleError, SyncPipeline};

/// Arguments for `slotsync sync`.
#[derive(Args, Debug)]
pub struct SyncArgs {
    /// Compute change sets without applying, auditing or notifying.
    #[arg(long)]
    pub dry_run: bool,

    /// Print the cycle summary as JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Tabled)]
struct OutcomeRow {
    #[tabled(rename = "file")]
    file: String,
    #[tabled(rename = "partition")]
    partition: String,
    #[tabled(rename = "status")]
    status: String,
    #[tabled(rename = "+/~/-")]
    changes: String,
    #[tabled(rename = "attempts")]
    attempts: u32,
    #[tabled(rename = "error")]
    error: String,
}

impl SyncArgs {
    pub fn run(self) -> Result<()> {
        let home = super::home_dir()?;
        let config = config::load_at(&home).context("failed to load config")?;
        let pipeline = SyncPipeline::from_config(&config, &home, self.dry_run)
            .context("invalid sync configuration")?;
        let notifier = notifier_from_config(&config).context("invalid notification settings")?;
        let notify_timeout = config.request_timeout();

        let rt = super::runtime()?;
        let result = rt.block_on(async {
            let cancel = super::interrupt_token();
            let result = pipeline.run_cycle(&cancel).await;
            if !self.dry_run {
                let summary = match &result {
                    Ok(summary) => summary,
                    Err(err) => err.summary(),
                };
                if let Err(err) = deliver(notifier.as_ref(), summary, notify_timeout).await {
                    eprintln!("{} {err}", "notification failed:".yellow());
                }
            }
            result
        });

        match result {
            Ok(summary) => {
                self.print(&summary)?;
                Ok(())
            }
            Err(CycleError::Discovery { error, .. }) => {
                Err(error).context("source discovery failed")
            }
            Err(err) => {
                let message = err.to_string();
                self.print(&err.into_summary())?;
                bail!(message)
            }
        }
    }

    fn print(&self, summary: &CycleSummary) -> Result<()> {
        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(summary).context("failed to render summary JSON")?
            );
            return Ok(());
        }
        print_summary(summary);
        Ok(())
    }
}

/// Send `summary` on its own token, bounded by `timeout`. An interrupted
/// cycle is still reported.
async fn deliver(
    notifier: &dyn Notifier,
    summary: &CycleSummary,
    timeout: Duration,
) -> Result<(), ClassifiedError> {
    let cancel = CancellationToken::new();
    match tokio::time::timeout(timeout, notifier.send(summary, &cancel)).await {
        Ok(sent) => sent,
        Err(_) => {
            cancel.cancel();
            Err(ClassifiedError::notification(
                ErrorCode::Timeout,
                format!("notification timed out after {}s", timeout.as_secs_f32()),
            ))
        }
    }
}

fn print_summary(summary: &CycleSummary) {
    let prefix = if summary.dry_run { "[dry-run] " } else { "" };
    if let Some(error) = &summary.error {
        println!("{prefix}cycle {} failed: {error}", summary.cycle_id);
        return;
    }
    if summary.outcomes.is_empty() {
        println!("{prefix}No source sheets found.");
        return;
    }

    let rows: Vec<OutcomeRow> = summary
        .outcomes
        .iter()
        .map(|o| OutcomeRow {
            file: o
                .file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| o.file.display().to_string()),
            partition: o
                .partition
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".to_string()),
            status: colorize_status(o.status),
            changes: format!(
                "{}/{}/{}",
                o.changes.inserts, o.changes.updates, o.changes.deletes
            ),
            attempts: o.attempts,
            error: o
                .error
                .as_ref()
                .map(|e| e.message.clone())
                .unwrap_or_default(),
        })
        .collect();

    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");

    let applied = if summary.dry_run {
        format!(
            "{} change(s) would be applied",
            summary.inserts + summary.updates + summary.deletes
        )
    } else {
        format!("{} change(s) applied", summary.changes_applied)
    };
    println!(
        "{prefix}cycle {}: {} succeeded, {} skipped, {} failed; {applied}",
        summary.cycle_id, summary.succeeded, summary.skipped_unresolved, summary.failed
    );
    if summary.fatal {
        println!("{}", "systemic failure: cycle stopped early".red().bold());
    }
}

fn colorize_status(status: TaskStatus) -> String {
    match status {
        TaskStatus::Success => status.to_string().green().to_string(),
        TaskStatus::SkippedUnresolved => status.to_string().yellow().to_string(),
        TaskStatus::Failed => status.to_string().red().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Refuses to deliver on a cancelled token, like the webhook does.
    #[derive(Default)]
    struct TokenCheckingNotifier {
        delivered: AtomicUsize,
        hang: bool,
    }

    #[async_trait]
    impl Notifier for TokenCheckingNotifier {
        async fn send(
            &self,
            _summary: &CycleSummary,
            cancel: &CancellationToken,
        ) -> Result<(), ClassifiedError> {
            if self.hang {
                std::future::pending::<()>().await;
            }
            if cancel.is_cancelled() {
                return Err(ClassifiedError::notification(ErrorCode::Cancelled, "cancelled"));
            }
            self.delivered.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn interrupted_cycle_is_still_notified() {
        let interrupt = CancellationToken::new();
        interrupt.cancel();
        let notifier = TokenCheckingNotifier::default();
        let summary = CycleSummary::new("c-1", Utc::now(), false);

        deliver(&notifier, &summary, Duration::from_secs(5)).await.unwrap();
        assert_eq!(notifier.delivered.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stalled_notification_is_bounded() {
        let notifier = TokenCheckingNotifier {
            hang: true,
            ..TokenCheckingNotifier::default()
        };
        let summary = CycleSummary::new("c-2", Utc::now(), false);

        let err = deliver(&notifier, &summary, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::Timeout);
    }
}
