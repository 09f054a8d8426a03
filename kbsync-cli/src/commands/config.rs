//! `kbsync config put` and `kbsync config list`

use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand};
use serde_json::Value;

use kbsync_core::{
    store,
    types::{Business, BusinessId, ConfigId},
};

/// Manage configuration records under `~/.kbsync/configs`.
#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Create a configuration or replace its payload (bumps the version).
    Put(PutArgs),

    /// List configuration records.
    List,
}

#[derive(Args, Debug)]
pub struct PutArgs {
    /// Configuration id (file stem under ~/.kbsync/configs).
    pub config_id: String,

    /// Owning business id; namespaces document and object names.
    #[arg(long)]
    pub business_id: String,

    /// Business display name.
    #[arg(long)]
    pub business_name: String,

    /// Remote assistant id to attach the knowledge base to.
    #[arg(long)]
    pub assistant: Option<String>,

    /// Industry tag.
    #[arg(long)]
    pub industry: Option<String>,

    /// JSON file holding the configuration payload.
    #[arg(long, value_name = "FILE")]
    pub payload: PathBuf,
}

pub fn run(cmd: ConfigCommand) -> Result<()> {
    match cmd {
        ConfigCommand::Put(args) => put(args),
        ConfigCommand::List => list(),
    }
}

fn put(args: PutArgs) -> Result<()> {
    let home = super::home_dir()?;
    if args.config_id.trim().is_empty() || args.config_id.contains(|c: char| c == '/' || c == '\\') {
        bail!("invalid configuration id '{}'", args.config_id);
    }

    let raw = fs::read_to_string(&args.payload)
        .with_context(|| format!("cannot read payload '{}'", args.payload.display()))?;
    let payload: Value = serde_json::from_str(&raw)
        .with_context(|| format!("payload '{}' is not valid JSON", args.payload.display()))?;
    if !payload.is_object() {
        bail!("payload must be a JSON object");
    }

    let id = ConfigId::from(args.config_id);
    let business = Business {
        id: BusinessId::from(args.business_id),
        name: args.business_name,
        assistant_id: args.assistant,
    };
    let record = store::put_payload_at(&home, &id, business, args.industry, payload)
        .with_context(|| format!("failed to save configuration '{id}'"))?;

    println!("✓ Saved '{}' (version {})", record.id, record.version);
    println!("  {}", store::config_path_at(&home, &record.id).display());
    Ok(())
}

fn list() -> Result<()> {
    let home = super::home_dir()?;
    let records = store::list_configs_at(&home).context("failed to list configurations")?;

    if records.is_empty() {
        println!("No configurations.");
        println!("Run: kbsync config put <config_id> --business-id <id> --business-name <name> --payload <file.json>");
        return Ok(());
    }

    for record in &records {
        let assistant = record
            .business
            .assistant_id
            .as_deref()
            .unwrap_or("no assistant");
        println!(
            "{}  {} [{}]  v{}  {}",
            record.id, record.business.name, record.business.id.0, record.version, assistant
        );
    }
    Ok(())
}
