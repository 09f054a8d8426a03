//! `kbsync sync`: run one sync attempt, or republish missing halves.

use anyhow::{bail, Context, Result};
use clap::Args;
use colored::Colorize;

use kbsync_core::{settings, types::ConfigId, SyncStatus};
use kbsync_sync::{RetryReport, SyncEngine, SyncReport};

/// Arguments for `kbsync sync`.
#[derive(Args, Debug)]
pub struct SyncArgs {
    /// Configuration id to sync.
    pub config_id: String,

    /// Only republish the missing backend copies of the latest generation.
    #[arg(long)]
    pub retry_failed: bool,
}

impl SyncArgs {
    pub fn run(self) -> Result<()> {
        let home = super::home_dir()?;
        let id = ConfigId::from(self.config_id);
        let settings = settings::load_at(&home).context("failed to load settings")?;
        let engine = SyncEngine::from_home(&home, settings).context("failed to build engine")?;

        if self.retry_failed {
            let report = super::block_on(engine.retry_failed_uploads(&id))?
                .with_context(|| format!("retry failed for '{id}'"))?;
            print_retry(&report);
            return Ok(());
        }

        let report = super::block_on(engine.sync(&id))?
            .with_context(|| format!("sync failed for '{id}'"))?;
        print_report(&report);
        if report.status == SyncStatus::Error {
            bail!("sync of '{id}' ended with status error");
        }
        Ok(())
    }
}

fn status_label(status: SyncStatus) -> String {
    let label = status.to_string();
    match status {
        SyncStatus::Synced => label.green().bold().to_string(),
        SyncStatus::Error => label.red().bold().to_string(),
        SyncStatus::NeedsManualReview => label.magenta().bold().to_string(),
        SyncStatus::Syncing => label.yellow().to_string(),
        SyncStatus::Idle => label.bright_black().to_string(),
    }
}

fn print_report(report: &SyncReport) {
    println!("'{}' → {}", report.config_id, status_label(report.status));
    let Some(generation) = &report.generation else {
        println!("  nothing to publish");
        return;
    };

    println!(
        "  generation {generation}: {} document(s), {} published, {} degraded, {} failed",
        report.documents,
        report.published,
        report.degraded.len(),
        report.failed.len()
    );
    for name in &report.degraded {
        println!("  ~  {name} (one backend only)");
    }
    for name in &report.failed {
        println!("  ✗  {name}");
    }

    match &report.patch {
        Some(patch) if patch.success => {
            println!("  attach: {}", patch.reason);
            if patch.verification.as_ref().is_some_and(|v| !v.is_clean()) {
                println!("  {} verification reported problems", "!".yellow());
            }
        }
        Some(patch) => println!("  attach: {}", patch.error_text()),
        None if report.status == SyncStatus::Syncing => {
            println!("  no remote assistant; documents published but not attached")
        }
        None => {}
    }

    if report.deleted_records > 0 {
        println!("  retired {} old file record(s)", report.deleted_records);
    }
    for err in &report.cleanup_errors {
        println!("  {} cleanup: {err}", "!".yellow());
    }
}

fn print_retry(report: &RetryReport) {
    let Some(generation) = &report.generation else {
        println!("'{}' has no published generation yet", report.config_id);
        return;
    };
    println!(
        "'{}' generation {generation}: {} retried, {} recovered",
        report.config_id, report.retried, report.recovered
    );
    for name in &report.still_failing {
        println!("  ✗  {name} still missing a backend copy");
    }
    for name in &report.skipped_changed {
        println!("  ·  {name} changed since upload; run a full sync");
    }
    if let Some(patch) = &report.patch {
        let attach = if patch.success {
            patch.reason.to_string()
        } else {
            patch.error_text()
        };
        println!("  re-attach: {attach} → {}", status_label(report.status));
    }
    if report.deleted_records > 0 {
        println!("  retired {} old file record(s)", report.deleted_records);
    }
    for err in &report.cleanup_errors {
        println!("  {} cleanup: {err}", "!".yellow());
    }
}
