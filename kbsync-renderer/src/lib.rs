//! # kbsync-renderer
//!
//! Deterministic document generator: turns one configuration record into
//! knowledge-base documents (markdown per section, JSON for the photo index).
//!
//! ## Usage
//!
//! ```rust,no_run
//! use kbsync_renderer::{Generator, ScratchDir};
//! use kbsync_core::types::ConfigurationRecord;
//!
//! fn stage_all(record: &ConfigurationRecord) {
//!     if let Ok(generator) = Generator::new() {
//!         if let Ok(documents) = generator.generate(record) {
//!             for doc in &documents {
//!                 println!("{}: {} bytes", doc.name, doc.content.len());
//!             }
//!             if let Ok(scratch) = ScratchDir::new() {
//!                 let _ = scratch.stage(&documents);
//!             }
//!         }
//!     }
//! }
//! ```

pub mod context;
pub mod engine;
pub mod error;
pub mod scratch;

pub use context::DocumentContext;
pub use engine::{document_name, GeneratedDocument, Generator, TemplateEngine};
pub use error::RenderError;
pub use scratch::{ScratchDir, StagedDocument};
