//! Template context: serializable rendering payload built from one section
//! of a [`ConfigurationRecord`].
//!
//! The configuration payload is an opaque JSON document, so the context
//! flattens it into headed blocks of labelled items. `serde_json::Map` keeps
//! keys sorted, which makes the flattening (and therefore the rendered
//! output) deterministic.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use kbsync_core::types::{ConfigurationRecord, DocumentSection};

use crate::error::RenderError;

/// Deepest markdown heading the flattening will emit.
const MAX_HEADING_LEVEL: usize = 6;

/// Rendering payload for one document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentContext {
    pub business: BusinessCtx,
    pub section: SectionCtx,
    pub blocks: Vec<BlockCtx>,
    /// Question/answer pairs, only filled for the FAQ section.
    pub faqs: Vec<FaqCtx>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusinessCtx {
    pub id: String,
    pub name: String,
    pub industry: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SectionCtx {
    pub slug: String,
    pub title: String,
}

/// A headed group of items. `marker` is the markdown heading prefix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockCtx {
    pub marker: String,
    pub title: String,
    pub items: Vec<ItemCtx>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemCtx {
    pub label: Option<String>,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaqCtx {
    pub question: String,
    pub answer: String,
}

/// Human-readable section title.
pub fn section_title(section: DocumentSection) -> &'static str {
    match section {
        DocumentSection::PricingAvailability => "Pricing & availability",
        DocumentSection::Establishment => "Establishment information",
        DocumentSection::Supplementary => "Supplementary information",
        DocumentSection::Faq => "Frequently asked questions",
        DocumentSection::PhotoIndex => "Photo index",
    }
}

/// Whether `value` carries any content worth publishing.
///
/// Null, blank strings and containers holding only such values are empty.
pub fn is_populated(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.trim().is_empty(),
        Value::Array(items) => items.iter().any(is_populated),
        Value::Object(map) => map.values().any(is_populated),
        Value::Bool(_) | Value::Number(_) => true,
    }
}

/// Populated payload entries feeding `section`, in payload-key order.
pub fn section_values<'a>(
    record: &'a ConfigurationRecord,
    section: DocumentSection,
) -> Vec<(&'static str, &'a Value)> {
    section
        .payload_keys()
        .iter()
        .filter_map(|key| record.payload.get(*key).map(|v| (*key, v)))
        .filter(|(_, v)| is_populated(v))
        .collect()
}

impl DocumentContext {
    /// Build the context for `section`, or `None` when it has no content.
    pub fn for_section(record: &ConfigurationRecord, section: DocumentSection) -> Option<Self> {
        let values = section_values(record, section);
        if values.is_empty() {
            return None;
        }

        let mut blocks = Vec::new();
        let mut faqs = Vec::new();
        for (key, value) in &values {
            if section == DocumentSection::Faq {
                if let Some(pairs) = extract_faqs(value) {
                    faqs.extend(pairs);
                    continue;
                }
            }
            flatten(&humanize(key), value, 2, &mut blocks);
        }

        Some(DocumentContext {
            business: BusinessCtx {
                id: record.business.id.0.clone(),
                name: record.business.name.clone(),
                industry: record.industry.clone().filter(|i| !i.trim().is_empty()),
            },
            section: SectionCtx {
                slug: section.slug().to_string(),
                title: section_title(section).to_string(),
            },
            blocks,
            faqs,
        })
    }

    /// Convert to a [`tera::Context`] for rendering.
    pub fn to_tera_context(&self) -> Result<tera::Context, RenderError> {
        tera::Context::from_serialize(self).map_err(RenderError::from)
    }
}

/// `opening_hours` / `openingHours` / `opening-hours` → `Opening hours`.
pub fn humanize(key: &str) -> String {
    let mut words = String::with_capacity(key.len() + 4);
    let mut prev_lower = false;
    for c in key.chars() {
        if c == '_' || c == '-' {
            words.push(' ');
            prev_lower = false;
            continue;
        }
        if c.is_uppercase() && prev_lower {
            words.push(' ');
        }
        prev_lower = c.is_lowercase() || c.is_ascii_digit();
        words.extend(c.to_lowercase());
    }
    let collapsed = words.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut chars = collapsed.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(true) => Some("yes".to_string()),
        Value::Bool(false) => Some("no".to_string()),
        _ => None,
    }
}

fn heading(level: usize) -> String {
    "#".repeat(level.min(MAX_HEADING_LEVEL))
}

/// Title for the `index`-th element of an array of objects.
fn element_title(parent: &str, index: usize, map: &Map<String, Value>) -> String {
    ["name", "title", "label"]
        .iter()
        .filter_map(|k| map.get(*k).and_then(scalar_text))
        .find(|t| !t.is_empty())
        .unwrap_or_else(|| format!("{parent} {}", index + 1))
}

fn flatten(title: &str, value: &Value, level: usize, out: &mut Vec<BlockCtx>) {
    match value {
        Value::Object(map) => {
            let items: Vec<ItemCtx> = map
                .iter()
                .filter(|(_, v)| is_populated(v))
                .filter_map(|(k, v)| {
                    scalar_text(v).map(|text| ItemCtx {
                        label: Some(humanize(k)),
                        value: text,
                    })
                })
                .collect();
            out.push(BlockCtx {
                marker: heading(level),
                title: title.to_string(),
                items,
            });
            for (k, v) in map {
                if is_populated(v) && scalar_text(v).is_none() {
                    flatten(&humanize(k), v, level + 1, out);
                }
            }
        }
        Value::Array(elements) => {
            let mut items = Vec::new();
            let mut nested = Vec::new();
            for (i, element) in elements.iter().enumerate().filter(|(_, v)| is_populated(v)) {
                match (scalar_text(element), element) {
                    (Some(text), _) => items.push(ItemCtx {
                        label: None,
                        value: text,
                    }),
                    (None, Value::Object(map)) => {
                        nested.push((element_title(title, i, map), element));
                    }
                    (None, other) => nested.push((format!("{title} {}", i + 1), other)),
                }
            }
            out.push(BlockCtx {
                marker: heading(level),
                title: title.to_string(),
                items,
            });
            for (sub_title, element) in nested {
                flatten(&sub_title, element, level + 1, out);
            }
        }
        scalar => {
            if let Some(text) = scalar_text(scalar) {
                out.push(BlockCtx {
                    marker: heading(level),
                    title: title.to_string(),
                    items: vec![ItemCtx {
                        label: None,
                        value: text,
                    }],
                });
            }
        }
    }
}

/// Question/answer pairs from either `[{question, answer}]` or `{question: answer}`.
///
/// Returns `None` when the shape is not recognisable as a FAQ list, so the
/// caller can fall back to generic blocks.
fn extract_faqs(value: &Value) -> Option<Vec<FaqCtx>> {
    let field = |map: &Map<String, Value>, keys: &[&str]| {
        keys.iter()
            .filter_map(|k| map.get(*k).and_then(scalar_text))
            .find(|t| !t.is_empty())
    };
    match value {
        Value::Array(elements) => elements
            .iter()
            .filter(|e| is_populated(e))
            .map(|element| {
                let map = element.as_object()?;
                Some(FaqCtx {
                    question: field(map, &["question", "q"])?,
                    answer: field(map, &["answer", "a"]).unwrap_or_default(),
                })
            })
            .collect(),
        Value::Object(map) => map
            .iter()
            .filter(|(_, v)| is_populated(v))
            .map(|(question, answer)| {
                Some(FaqCtx {
                    question: question.trim().to_string(),
                    answer: scalar_text(answer)?,
                })
            })
            .collect(),
        _ => None,
    }
}
