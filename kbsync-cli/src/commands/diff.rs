//! `kbsync diff <config_id>`: unified diff against the archived copies.

use anyhow::{Context, Result};
use clap::Args;

use kbsync_core::{settings, types::ConfigId};
use kbsync_sync::SyncEngine;

/// Arguments for `kbsync diff`.
#[derive(Args, Debug)]
pub struct DiffArgs {
    /// Configuration id to diff.
    pub config_id: String,
}

impl DiffArgs {
    pub fn run(self) -> Result<()> {
        let home = super::home_dir()?;
        let id = ConfigId::from(self.config_id);
        let settings = settings::load_at(&home).context("failed to load settings")?;
        let engine = SyncEngine::from_home(&home, settings).context("failed to build engine")?;

        let result = super::block_on(engine.diff(&id))?
            .with_context(|| format!("diff failed for '{id}'"))?;

        if result.is_clean() {
            println!(
                "No differences for '{}' ({} document(s) unchanged).",
                result.config_id, result.unchanged
            );
            return Ok(());
        }

        for diff in result.diffs {
            if !diff.archived {
                println!("# {} has no archived copy yet", diff.name);
            }
            print!("{}", diff.unified_diff);
            if !diff.unified_diff.ends_with('\n') {
                println!();
            }
        }
        Ok(())
    }
}
