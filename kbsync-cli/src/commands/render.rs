//! `kbsync render <config_id> [--out <dir>]`: preview generated documents.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;

use kbsync_core::{store, types::ConfigId};
use kbsync_renderer::Generator;

/// Arguments for `kbsync render`.
#[derive(Args, Debug)]
pub struct RenderArgs {
    /// Configuration id to render.
    pub config_id: String,

    /// Write the documents into this directory instead of printing them.
    #[arg(long, value_name = "DIR")]
    pub out: Option<PathBuf>,
}

impl RenderArgs {
    pub fn run(self) -> Result<()> {
        let home = super::home_dir()?;
        let id = ConfigId::from(self.config_id);
        let record = store::load_config_at(&home, &id)
            .with_context(|| format!("failed to load configuration '{id}'"))?;
        let documents = generator_at(&home)?
            .generate(&record)
            .with_context(|| format!("render failed for '{id}'"))?;

        if documents.is_empty() {
            println!("'{id}' has no populated sections; nothing would be published.");
            return Ok(());
        }

        match self.out {
            Some(dir) => {
                fs::create_dir_all(&dir)
                    .with_context(|| format!("cannot create '{}'", dir.display()))?;
                for doc in &documents {
                    let path = dir.join(&doc.name);
                    fs::write(&path, &doc.content)
                        .with_context(|| format!("cannot write '{}'", path.display()))?;
                    println!("  ✎  {} ({} bytes)", path.display(), doc.byte_size());
                }
                println!("✓ {} document(s) written for '{id}'", documents.len());
            }
            None => {
                for doc in &documents {
                    println!("==> {} ({}, {} bytes) <==", doc.name, doc.mime_type, doc.byte_size());
                    print!("{}", doc.content);
                    if !doc.content.ends_with('\n') {
                        println!();
                    }
                }
            }
        }
        Ok(())
    }
}

/// Generator honouring user template overrides in `~/.kbsync/templates`.
fn generator_at(home: &Path) -> Result<Generator> {
    let templates = store::root_at(home).join("templates");
    let generator = if templates.is_dir() {
        Generator::with_templates(&templates)
            .with_context(|| format!("invalid templates in '{}'", templates.display()))?
    } else {
        Generator::new().context("failed to load built-in templates")?
    };
    Ok(generator)
}
