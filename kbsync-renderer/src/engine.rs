//! Tera rendering engine: [`TemplateEngine`] and the document [`Generator`].
//!
//! # Section mapping
//!
//! | Section               | Output name                         | MIME               |
//! |-----------------------|-------------------------------------|--------------------|
//! | Pricing/availability  | `<biz>_pricing_availability.md`     | `text/markdown`    |
//! | Establishment         | `<biz>_establishment.md`            | `text/markdown`    |
//! | Supplementary         | `<biz>_supplementary.md`            | `text/markdown`    |
//! | FAQ                   | `<biz>_faq.md`                      | `text/markdown`    |
//! | Photo index           | `<biz>_photo_index.json`            | `application/json` |
//!
//! `<biz>` is the sanitized business id, so names never collide across tenants.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::{Map, Value};
use tera::Tera;

use kbsync_core::types::{ConfigurationRecord, DocumentSection};

use crate::context::{is_populated, section_values, DocumentContext};
use crate::error::{io_err, RenderError};

// ---------------------------------------------------------------------------
// Embedded templates: baked into the binary at compile time via include_str!
// ---------------------------------------------------------------------------

const TPLS: &[(&str, &str)] = &[
    ("shared/_header.tera", include_str!("templates/_partials/header.tera")),
    ("shared/_blocks.tera", include_str!("templates/_partials/blocks.tera")),
    (
        "sections/pricing_availability.md.tera",
        include_str!("templates/pricing_availability.md.tera"),
    ),
    (
        "sections/establishment.md.tera",
        include_str!("templates/establishment.md.tera"),
    ),
    (
        "sections/supplementary.md.tera",
        include_str!("templates/supplementary.md.tera"),
    ),
    ("sections/faq.md.tera", include_str!("templates/faq.md.tera")),
];

// ---------------------------------------------------------------------------
// Template loading helpers
// ---------------------------------------------------------------------------

fn normalize_template_name(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/").to_lowercase()
}

fn collect_template_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), RenderError> {
    let entries = std::fs::read_dir(dir).map_err(|e| io_err(dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| io_err(dir, e))?;
        let path = entry.path();
        let meta = entry.metadata().map_err(|e| io_err(&path, e))?;
        if meta.is_dir() {
            collect_template_files(&path, out)?;
        } else if meta.is_file() {
            out.push(path);
        }
    }
    Ok(())
}

fn load_user_templates(dir: &Path) -> Result<Vec<(String, String)>, RenderError> {
    if !dir.exists() {
        return Ok(vec![]);
    }
    let mut files = Vec::new();
    collect_template_files(dir, &mut files)?;
    files.sort();
    let mut templates = Vec::new();
    for path in files {
        if path.extension().and_then(|s| s.to_str()) != Some("tera") {
            continue;
        }
        let rel = path.strip_prefix(dir).unwrap_or(path.as_path());
        let name = normalize_template_name(rel);
        let contents = std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
        templates.push((name, contents));
    }
    Ok(templates)
}

fn build_tera(user_template_dir: Option<&Path>) -> Result<Tera, RenderError> {
    let mut templates: HashMap<String, String> = HashMap::new();
    for (name, content) in TPLS {
        templates.insert(
            normalize_template_name(Path::new(name)),
            (*content).to_string(),
        );
    }
    if let Some(dir) = user_template_dir {
        for (name, content) in load_user_templates(dir)? {
            templates.insert(name, content);
        }
    }

    let mut tera = Tera::default();
    let items: Vec<(String, String)> = templates.into_iter().collect();
    tera.add_raw_templates(items)?;
    Ok(tera)
}

/// Template used for a markdown section; `None` for the JSON photo index.
fn template_name(section: DocumentSection) -> Option<&'static str> {
    match section {
        DocumentSection::PricingAvailability => Some("sections/pricing_availability.md.tera"),
        DocumentSection::Establishment => Some("sections/establishment.md.tera"),
        DocumentSection::Supplementary => Some("sections/supplementary.md.tera"),
        DocumentSection::Faq => Some("sections/faq.md.tera"),
        DocumentSection::PhotoIndex => None,
    }
}

/// Collapse runs of blank lines and end with exactly one newline.
fn tidy_markdown(raw: &str) -> String {
    let normalized = raw.replace("\r\n", "\n").replace('\r', "\n");
    let mut out = String::with_capacity(normalized.len());
    let mut blank_run = 0usize;
    for line in normalized.lines() {
        let line = line.trim_end();
        if line.is_empty() {
            blank_run += 1;
            if blank_run > 1 || out.is_empty() {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(line);
        out.push('\n');
    }
    let trimmed = out.trim_end_matches('\n').len();
    out.truncate(trimmed);
    out.push('\n');
    out
}

// ---------------------------------------------------------------------------
// GeneratedDocument
// ---------------------------------------------------------------------------

/// One rendered document, ready to stage and publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedDocument {
    pub section: DocumentSection,
    /// Tenant-namespaced file name.
    pub name: String,
    pub content: String,
    pub mime_type: &'static str,
}

impl GeneratedDocument {
    pub fn byte_size(&self) -> u64 {
        self.content.len() as u64
    }
}

/// Tenant-namespaced output name for `section`.
pub fn document_name(record: &ConfigurationRecord, section: DocumentSection) -> String {
    format!(
        "{}_{}.{}",
        record.business.id.sanitized(),
        section.slug(),
        section.extension()
    )
}

// ---------------------------------------------------------------------------
// TemplateEngine
// ---------------------------------------------------------------------------

/// Tera-based engine for rendering templates with optional user overrides.
///
/// `user_template_dir` may contain `.tera` files that override embedded defaults.
/// Template names are normalised to lowercase and relative paths.
pub struct TemplateEngine {
    tera: Tera,
}

impl TemplateEngine {
    /// Construct a new [`TemplateEngine`], loading embedded templates plus any
    /// overrides found in `user_template_dir`.
    pub fn new(user_template_dir: Option<&Path>) -> Result<Self, RenderError> {
        let tera = build_tera(user_template_dir)?;
        Ok(TemplateEngine { tera })
    }

    /// Render one markdown section.
    pub fn render(
        &self,
        ctx: &DocumentContext,
        section: DocumentSection,
    ) -> Result<String, RenderError> {
        let Some(name) = template_name(section) else {
            return Ok(String::new());
        };
        let tera_ctx = ctx.to_tera_context()?;
        let raw = self.tera.render(name, &tera_ctx)?;
        Ok(tidy_markdown(&raw))
    }
}

// ---------------------------------------------------------------------------
// Photo index
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct PhotoIndex<'a> {
    business_id: &'a str,
    business_name: &'a str,
    photos: Vec<Value>,
}

/// Normalise one photo entry: bare strings become `{"url": …}`, objects are
/// stripped of empty fields.
fn normalize_photo(value: &Value) -> Option<Value> {
    match value {
        Value::String(url) if !url.trim().is_empty() => {
            let mut map = Map::new();
            map.insert("url".to_string(), Value::String(url.trim().to_string()));
            Some(Value::Object(map))
        }
        Value::Object(map) => {
            let kept: Map<String, Value> = map
                .iter()
                .filter(|(_, v)| is_populated(v))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            (!kept.is_empty()).then_some(Value::Object(kept))
        }
        _ => None,
    }
}

fn render_photo_index(record: &ConfigurationRecord) -> Result<Option<String>, RenderError> {
    let mut photos = Vec::new();
    for (_, value) in section_values(record, DocumentSection::PhotoIndex) {
        match value {
            Value::Array(items) => photos.extend(items.iter().filter_map(normalize_photo)),
            Value::Object(map) => {
                // `{"lobby": "https://…"}` style: key becomes the caption.
                for (caption, entry) in map {
                    if let Some(Value::Object(mut photo)) = normalize_photo(entry) {
                        photo
                            .entry("caption".to_string())
                            .or_insert_with(|| Value::String(caption.clone()));
                        photos.push(Value::Object(photo));
                    }
                }
            }
            other => photos.extend(normalize_photo(other)),
        }
    }
    if photos.is_empty() {
        return Ok(None);
    }
    let index = PhotoIndex {
        business_id: &record.business.id.0,
        business_name: &record.business.name,
        photos,
    };
    let mut json = serde_json::to_string_pretty(&index)?;
    json.push('\n');
    Ok(Some(json))
}

// ---------------------------------------------------------------------------
// Generator
// ---------------------------------------------------------------------------

/// Pure transformation from a configuration record to its documents.
///
/// Create once with [`Generator::new`] and reuse. Output is byte-identical for
/// identical input.
pub struct Generator {
    engine: TemplateEngine,
}

impl Generator {
    /// Construct a new [`Generator`] with embedded templates.
    pub fn new() -> Result<Self, RenderError> {
        Ok(Generator {
            engine: TemplateEngine::new(None)?,
        })
    }

    /// Construct a [`Generator`] whose templates may be overridden from `dir`.
    pub fn with_templates(dir: &Path) -> Result<Self, RenderError> {
        Ok(Generator {
            engine: TemplateEngine::new(Some(dir))?,
        })
    }

    /// Render every populated section, in [`DocumentSection::all`] order.
    ///
    /// Sections without content are omitted; an empty result means there is
    /// nothing to publish.
    pub fn generate(
        &self,
        record: &ConfigurationRecord,
    ) -> Result<Vec<GeneratedDocument>, RenderError> {
        let mut documents = Vec::new();
        for section in DocumentSection::all() {
            if let Some(doc) = self.generate_section(record, *section)? {
                documents.push(doc);
            }
        }
        Ok(documents)
    }

    /// Render one section, or `None` when it has no content.
    pub fn generate_section(
        &self,
        record: &ConfigurationRecord,
        section: DocumentSection,
    ) -> Result<Option<GeneratedDocument>, RenderError> {
        let content = match section {
            DocumentSection::PhotoIndex => render_photo_index(record)?,
            _ => match DocumentContext::for_section(record, section) {
                Some(ctx) => Some(self.engine.render(&ctx, section)?),
                None => None,
            },
        };
        Ok(content.map(|content| GeneratedDocument {
            section,
            name: document_name(record, section),
            content,
            mime_type: section.mime_type(),
        }))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use kbsync_core::types::{Business, BusinessId, ConfigId, SyncState};
    use serde_json::json;

    fn make_record(business_id: &str, payload: Value) -> ConfigurationRecord {
        let now = Utc::now();
        ConfigurationRecord {
            id: ConfigId::from("cfg"),
            business: Business {
                id: BusinessId::from(business_id),
                name: "Acme Spa".to_string(),
                assistant_id: None,
            },
            industry: None,
            version: 1,
            payload,
            sync: SyncState::default(),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn generator_new_succeeds() {
        Generator::new().expect("Generator::new should succeed with embedded templates");
    }

    #[test]
    fn empty_payload_yields_no_documents() {
        let generator = Generator::new().unwrap();
        let docs = generator.generate(&make_record("acme", json!({}))).unwrap();
        assert!(docs.is_empty());
    }

    #[test]
    fn names_are_namespaced_by_sanitized_business_id() {
        let generator = Generator::new().unwrap();
        let record = make_record("acme/east side", json!({"faq": {"Parking?": "Yes"}}));
        let docs = generator.generate(&record).unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].name, "acme_east_side_faq.md");
    }

    #[test]
    fn photo_index_is_valid_json() {
        let generator = Generator::new().unwrap();
        let record = make_record(
            "acme",
            json!({"photos": ["https://cdn/x.jpg", {"url": "https://cdn/y.jpg", "caption": ""}]}),
        );
        let docs = generator.generate(&record).unwrap();
        assert_eq!(docs[0].section, DocumentSection::PhotoIndex);
        assert_eq!(docs[0].mime_type, "application/json");
        let parsed: Value = serde_json::from_str(&docs[0].content).expect("valid JSON");
        assert_eq!(parsed["photos"].as_array().map(Vec::len), Some(2));
        assert!(parsed["photos"][1].get("caption").is_none(), "empty fields dropped");
    }

    #[test]
    fn keyed_photos_use_key_as_caption() {
        let generator = Generator::new().unwrap();
        let record = make_record("acme", json!({"photos": {"lobby": "https://cdn/l.jpg"}}));
        let doc = generator
            .generate_section(&record, DocumentSection::PhotoIndex)
            .unwrap()
            .expect("photo index");
        let parsed: Value = serde_json::from_str(&doc.content).unwrap();
        assert_eq!(parsed["photos"][0]["caption"], "lobby");
    }

    #[test]
    fn markdown_contains_business_and_values() {
        let generator = Generator::new().unwrap();
        let record = make_record(
            "acme",
            json!({"pricing": {"massage": "80 EUR"}, "availability": {"monday": "9-17"}}),
        );
        let doc = generator
            .generate_section(&record, DocumentSection::PricingAvailability)
            .unwrap()
            .expect("doc");
        assert!(doc.content.starts_with("# Acme Spa: Pricing & availability\n"));
        assert!(doc.content.contains("**Massage:** 80 EUR"));
        assert!(doc.content.contains("## Availability"));
        assert!(doc.content.contains("**Monday:** 9-17"));
    }

    #[test]
    fn tidy_markdown_collapses_blank_runs() {
        assert_eq!(tidy_markdown("\n\na\n\n\n\nb  \r\n\n"), "a\n\nb\n");
    }

    #[test]
    fn no_crlf_in_rendered_output() {
        let generator = Generator::new().unwrap();
        let record = make_record(
            "acme",
            json!({"supplementary": {"notes": "line one\r\nline two"}}),
        );
        for doc in generator.generate(&record).unwrap() {
            assert!(!doc.content.contains('\r'), "{} contains CR", doc.name);
        }
    }
}
