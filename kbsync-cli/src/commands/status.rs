//! `kbsync status`: sync visibility across configurations.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Args;
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

use kbsync_core::{
    store,
    types::{ConfigurationRecord, FileRecord, RemoteSchema, SyncStatus},
};

/// Arguments for `kbsync status`.
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

impl StatusArgs {
    pub fn run(self) -> Result<()> {
        let home = super::home_dir()?;
        let records = store::list_configs_at(&home).context("failed to list configurations")?;
        let rows = records
            .iter()
            .map(|record| build_row(&home, record))
            .collect::<Result<Vec<_>>>()?;

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&rows).context("failed to serialize status JSON")?
            );
            return Ok(());
        }

        print_table(rows);
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
struct ConfigStatus {
    config_id: String,
    business: String,
    assistant_id: Option<String>,
    status: SyncStatus,
    version: u64,
    remote_schema: Option<RemoteSchema>,
    generation: Option<String>,
    documents: usize,
    attachable: usize,
    missing_copies: usize,
    last_synced_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

#[derive(Tabled)]
struct StatusTableRow {
    #[tabled(rename = "config")]
    config: String,
    #[tabled(rename = "business")]
    business: String,
    #[tabled(rename = "status")]
    status: String,
    #[tabled(rename = "version")]
    version: u64,
    #[tabled(rename = "files")]
    files: String,
    #[tabled(rename = "last sync")]
    last_sync: String,
    #[tabled(rename = "detail")]
    detail: String,
}

fn build_row(home: &Path, record: &ConfigurationRecord) -> Result<ConfigStatus> {
    let files = store::load_file_records_at(home, &record.id)
        .with_context(|| format!("failed to load file records for '{}'", record.id))?;
    let generation = files.iter().map(|f| f.generation.clone()).max();
    let current: Vec<&FileRecord> = files
        .iter()
        .filter(|f| Some(&f.generation) == generation.as_ref())
        .collect();

    Ok(ConfigStatus {
        config_id: record.id.0.clone(),
        business: record.business.name.clone(),
        assistant_id: record.business.assistant_id.clone(),
        status: record.sync.status,
        version: record.version,
        remote_schema: record.sync.remote_schema,
        generation,
        documents: current.len(),
        attachable: current.iter().filter(|f| f.is_attachable()).count(),
        missing_copies: current.iter().filter(|f| f.needs_retry()).count(),
        last_synced_at: record.sync.last_synced_at,
        last_error: record.sync.last_error.clone(),
    })
}

fn print_table(rows: Vec<ConfigStatus>) {
    let synced = rows
        .iter()
        .filter(|r| r.status == SyncStatus::Synced)
        .count();
    let attention = rows
        .iter()
        .filter(|r| matches!(r.status, SyncStatus::Error | SyncStatus::NeedsManualReview))
        .count();
    println!(
        "kbsync v{} | {} configurations | {} synced | {} need attention",
        env!("CARGO_PKG_VERSION"),
        rows.len(),
        synced,
        attention,
    );

    if rows.is_empty() {
        println!("No configurations.");
        return;
    }

    let needs_retry = rows.iter().any(|r| r.missing_copies > 0);
    let table_rows: Vec<StatusTableRow> = rows
        .into_iter()
        .map(|row| StatusTableRow {
            files: format!("{}/{}", row.attachable, row.documents),
            last_sync: row
                .last_synced_at
                .map(format_age)
                .unwrap_or_else(|| "never".to_string()),
            detail: detail(&row),
            status: status_label(row.status),
            config: row.config_id,
            business: row.business,
            version: row.version,
        })
        .collect();
    let mut table = Table::new(table_rows);
    table.with(Style::rounded());
    println!("{table}");

    if needs_retry {
        println!("Run 'kbsync sync <config_id> --retry-failed' to republish missing copies.");
    }
}

fn status_label(status: SyncStatus) -> String {
    let label = status.to_string().to_uppercase();
    match status {
        SyncStatus::Synced => label.green().bold().to_string(),
        SyncStatus::Error => label.red().bold().to_string(),
        SyncStatus::NeedsManualReview => label.magenta().bold().to_string(),
        SyncStatus::Syncing => label.yellow().bold().to_string(),
        SyncStatus::Idle => label.bright_black().bold().to_string(),
    }
}

fn detail(row: &ConfigStatus) -> String {
    if let Some(err) = &row.last_error {
        return truncate(err, 60);
    }
    if row.assistant_id.is_none() {
        return "no assistant".to_string();
    }
    if row.missing_copies > 0 {
        return format!("{} missing copies", row.missing_copies);
    }
    match row.remote_schema {
        Some(schema) => format!("{schema:?} schema").to_lowercase(),
        None => String::new(),
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max.saturating_sub(1)).collect();
    out.push('…');
    out
}

fn format_age(at: DateTime<Utc>) -> String {
    let secs = (Utc::now() - at).num_seconds().max(0);
    match secs {
        0..=59 => format!("{secs}s ago"),
        60..=3_599 => format!("{}m ago", secs / 60),
        3_600..=86_399 => format!("{}h ago", secs / 3_600),
        _ => format!("{}d ago", secs / 86_400),
    }
}
