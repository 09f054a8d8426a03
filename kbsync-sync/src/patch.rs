//! Assistant patch protocol.
//!
//! Attaches freshly uploaded files to the remote assistant:
//!
//! 1. nothing to attach → `nothing_to_do`, no network call
//! 2. `POST /tool` query tool over the file ids → `query_tool_creation_failed`
//! 3. `GET /assistant/{id}` schema probe → `get_failed` / `unsupported_schema`
//! 4. set-union merge of `model.toolIds`, minus the superseded query tool
//! 5. `PATCH` with exponential backoff → `validation_rejected` / `patch_failed`
//! 6. verification GETs, diagnostic only
//!
//! Only step 5 retries. Every path ends in a [`PatchOutcome`]; the protocol
//! itself never returns an error.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use kbsync_core::settings::Settings;
use kbsync_core::types::RemoteSchema;

use crate::api::{AssistantApi, QueryToolRequest};

/// Why the protocol ended where it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchReason {
    Attached,
    NothingToDo,
    QueryToolCreationFailed,
    GetFailed,
    UnsupportedSchema,
    ValidationRejected,
    PatchFailed,
}

impl PatchReason {
    /// Failures that automated retry will not fix.
    pub fn needs_manual_review(&self) -> bool {
        matches!(
            self,
            PatchReason::UnsupportedSchema | PatchReason::ValidationRejected
        )
    }
}

impl fmt::Display for PatchReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PatchReason::Attached => "attached",
            PatchReason::NothingToDo => "nothing_to_do",
            PatchReason::QueryToolCreationFailed => "query_tool_creation_failed",
            PatchReason::GetFailed => "get_failed",
            PatchReason::UnsupportedSchema => "unsupported_schema",
            PatchReason::ValidationRejected => "validation_rejected",
            PatchReason::PatchFailed => "patch_failed",
        };
        f.write_str(s)
    }
}

/// Post-PATCH checks. Never affects [`PatchOutcome::success`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verification {
    /// Tool ids the re-fetched assistant does not list.
    pub missing_tool_ids: Vec<String>,
    /// File ids the query tool does not report.
    pub missing_file_ids: Vec<String>,
    /// Verification calls that failed outright.
    pub errors: Vec<String>,
}

impl Verification {
    pub fn is_clean(&self) -> bool {
        self.missing_tool_ids.is_empty()
            && self.missing_file_ids.is_empty()
            && self.errors.is_empty()
    }
}

/// Terminal result of one protocol run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchOutcome {
    pub success: bool,
    pub reason: PatchReason,
    /// Raw remote answer (assistant document or error text) for operators.
    pub remote_response: Option<Value>,
    pub detected_schema: Option<RemoteSchema>,
    /// Query tool created during this run.
    pub query_tool_id: Option<String>,
    pub verification: Option<Verification>,
}

impl PatchOutcome {
    fn failed(reason: PatchReason, remote_response: Option<Value>) -> Self {
        Self {
            success: false,
            reason,
            remote_response,
            detected_schema: None,
            query_tool_id: None,
            verification: None,
        }
    }

    /// Text suitable for the configuration's last-error field.
    pub fn error_text(&self) -> String {
        match &self.remote_response {
            Some(Value::String(s)) => format!("{}: {s}", self.reason),
            Some(v) => format!("{}: {v}", self.reason),
            None => self.reason.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Pure helpers
// ---------------------------------------------------------------------------

/// `Acme Spa & Wellness!` → `acme_spa_wellness`.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.trim().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('_') && !slug.is_empty() {
            slug.push('_');
        }
    }
    while slug.ends_with('_') {
        slug.pop();
    }
    if slug.is_empty() {
        slug.push_str("business");
    }
    slug
}

/// Deterministic query-tool name for a business.
pub fn query_tool_name(business_name: &str) -> String {
    format!("knowledge_base_query_{}", slugify(business_name))
}

/// Classify the assistant document; `None` when neither field exists.
pub fn detect_schema(assistant: &Value) -> Option<RemoteSchema> {
    let has = |key: &str| assistant.get(key).is_some_and(|v| !v.is_null());
    match (has("model"), has("knowledgeBase")) {
        (true, true) => Some(RemoteSchema::Classic),
        (false, false) => None,
        _ => Some(RemoteSchema::Inline),
    }
}

/// `model.toolIds` of an assistant document.
pub fn existing_tool_ids(assistant: &Value) -> Vec<String> {
    assistant
        .pointer("/model/toolIds")
        .and_then(Value::as_array)
        .map(|ids| {
            ids.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Set union: existing order kept, new ids appended, no duplicates.
pub fn merge_tool_ids(existing: &[String], new: &[String]) -> Vec<String> {
    let mut merged: Vec<String> = Vec::with_capacity(existing.len() + new.len());
    for id in existing.iter().chain(new) {
        if !merged.contains(id) {
            merged.push(id.clone());
        }
    }
    merged
}

/// Delay after failed attempt `attempt` (0-based): `base × 2^attempt`.
///
/// Sleeps happen only between attempts, so `max_retries` attempts wait
/// `max_retries - 1` times: with 3 attempts and a 1s base that is 1s then
/// 2s, and the `4s` slot is never reached.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt))
}

/// `{ model: { ...existing, toolIds } }`
pub fn patch_body(assistant: &Value, tool_ids: &[String]) -> Value {
    let mut model = assistant
        .get("model")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_else(Map::new);
    model.insert("toolIds".to_string(), json!(tool_ids));
    json!({ "model": Value::Object(model) })
}

fn error_value(e: &crate::error::ApiError) -> Value {
    match e.body() {
        Some(body) => serde_json::from_str(body).unwrap_or_else(|_| Value::String(e.to_string())),
        None => Value::String(e.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Protocol
// ---------------------------------------------------------------------------

/// One attach request.
#[derive(Debug, Clone, Default)]
pub struct AttachRequest<'a> {
    pub assistant_id: &'a str,
    pub business_name: &'a str,
    /// Vendor file ids to expose through a query tool.
    pub file_ids: &'a [String],
    /// Tool ids to attach directly.
    pub tool_ids: &'a [String],
    /// Previously attached query tools to drop from `model.toolIds` in the
    /// same PATCH; they point at the generation being replaced.
    pub superseded_tool_ids: &'a [String],
}

pub struct PatchProtocol<'a> {
    api: &'a dyn AssistantApi,
    max_retries: u32,
    backoff_base: Duration,
    provider: String,
}

impl<'a> PatchProtocol<'a> {
    pub fn new(api: &'a dyn AssistantApi, settings: &Settings) -> Self {
        Self {
            api,
            max_retries: settings.patch_max_retries.max(1),
            backoff_base: settings.patch_backoff_base(),
            provider: settings.query_tool_provider.clone(),
        }
    }

    pub async fn attach(&self, req: AttachRequest<'_>) -> PatchOutcome {
        if req.file_ids.is_empty() && req.tool_ids.is_empty() {
            tracing::debug!("assistant {}: nothing to attach", req.assistant_id);
            return PatchOutcome {
                success: true,
                reason: PatchReason::NothingToDo,
                remote_response: None,
                detected_schema: None,
                query_tool_id: None,
                verification: None,
            };
        }

        let mut new_ids: Vec<String> = req.tool_ids.to_vec();
        let mut query_tool_id = None;
        if !req.file_ids.is_empty() {
            let request = QueryToolRequest {
                name: query_tool_name(req.business_name),
                description: format!("Knowledge base for {}", req.business_name),
                provider: self.provider.clone(),
                file_ids: req.file_ids.to_vec(),
            };
            match self.api.create_query_tool(&request).await {
                Ok(id) => {
                    tracing::info!("created query tool {} ({id})", request.name);
                    new_ids.push(id.clone());
                    query_tool_id = Some(id);
                }
                Err(e) => {
                    tracing::error!("query tool creation failed: {e}");
                    return PatchOutcome::failed(
                        PatchReason::QueryToolCreationFailed,
                        Some(error_value(&e)),
                    );
                }
            }
        }

        let assistant = match self.api.get_assistant(req.assistant_id).await {
            Ok(doc) => doc,
            Err(e) => {
                tracing::error!("assistant {} probe failed: {e}", req.assistant_id);
                let mut outcome = PatchOutcome::failed(PatchReason::GetFailed, Some(error_value(&e)));
                outcome.query_tool_id = query_tool_id;
                return outcome;
            }
        };

        let Some(schema) = detect_schema(&assistant) else {
            tracing::warn!(
                "assistant {} exposes neither model nor knowledgeBase",
                req.assistant_id
            );
            let mut outcome = PatchOutcome::failed(PatchReason::UnsupportedSchema, Some(assistant));
            outcome.query_tool_id = query_tool_id;
            return outcome;
        };
        if schema == RemoteSchema::Inline {
            tracing::warn!(
                "assistant {} uses the inline schema; attempting attach anyway",
                req.assistant_id
            );
        }

        let kept: Vec<String> = existing_tool_ids(&assistant)
            .into_iter()
            .filter(|id| !req.superseded_tool_ids.contains(id) || new_ids.contains(id))
            .collect();
        let merged = merge_tool_ids(&kept, &new_ids);
        let body = patch_body(&assistant, &merged);

        let mut outcome = match self.patch_with_retry(req.assistant_id, &body).await {
            Ok(response) => PatchOutcome {
                success: true,
                reason: PatchReason::Attached,
                remote_response: Some(response),
                detected_schema: Some(schema),
                query_tool_id: query_tool_id.clone(),
                verification: None,
            },
            Err(mut failed) => {
                failed.detected_schema = Some(schema);
                failed.query_tool_id = query_tool_id;
                return failed;
            }
        };

        outcome.verification = Some(
            self.verify(req.assistant_id, &new_ids, query_tool_id.as_deref(), req.file_ids)
                .await,
        );
        outcome
    }

    async fn patch_with_retry(&self, assistant_id: &str, body: &Value) -> Result<Value, PatchOutcome> {
        let mut last_error = None;
        for attempt in 0..self.max_retries {
            match self.api.patch_assistant(assistant_id, body).await {
                Ok(response) => {
                    tracing::info!("assistant {assistant_id} patched on attempt {}", attempt + 1);
                    return Ok(response);
                }
                Err(e) if e.is_schema_rejection() => {
                    tracing::warn!("assistant {assistant_id} rejected the patch: {e}");
                    return Err(PatchOutcome::failed(
                        PatchReason::ValidationRejected,
                        Some(error_value(&e)),
                    ));
                }
                Err(e) => {
                    tracing::warn!(
                        "assistant {assistant_id} patch attempt {}/{} failed: {e}",
                        attempt + 1,
                        self.max_retries
                    );
                    last_error = Some(error_value(&e));
                    if attempt + 1 < self.max_retries {
                        tokio::time::sleep(backoff_delay(self.backoff_base, attempt)).await;
                    }
                }
            }
        }
        Err(PatchOutcome::failed(PatchReason::PatchFailed, last_error))
    }

    async fn verify(
        &self,
        assistant_id: &str,
        new_ids: &[String],
        query_tool_id: Option<&str>,
        file_ids: &[String],
    ) -> Verification {
        let mut v = Verification::default();

        match self.api.get_assistant(assistant_id).await {
            Ok(doc) => {
                let present = existing_tool_ids(&doc);
                v.missing_tool_ids = new_ids
                    .iter()
                    .filter(|id| !present.contains(id))
                    .cloned()
                    .collect();
            }
            Err(e) => v.errors.push(format!("assistant: {e}")),
        }

        if let Some(tool_id) = query_tool_id {
            match self.api.get_tool(tool_id).await {
                Ok(doc) => {
                    let reported: Vec<String> = doc
                        .pointer("/knowledgeBases/0/fileIds")
                        .and_then(Value::as_array)
                        .map(|ids| {
                            ids.iter()
                                .filter_map(Value::as_str)
                                .map(str::to_string)
                                .collect()
                        })
                        .unwrap_or_default();
                    v.missing_file_ids = file_ids
                        .iter()
                        .filter(|id| !reported.contains(id))
                        .cloned()
                        .collect();
                }
                Err(e) => v.errors.push(format!("tool {tool_id}: {e}")),
            }
        }

        if v.is_clean() {
            tracing::debug!("assistant {assistant_id}: attach verified");
        } else {
            tracing::warn!("assistant {assistant_id}: verification mismatch {v:?}");
        }
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::FakeAssistantApi;
    use rstest::rstest;

    fn ids(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    fn settings() -> Settings {
        Settings::default()
    }

    fn classic(tool_ids: &[&str]) -> Value {
        json!({
            "id": "a1",
            "model": {"provider": "openai", "model": "gpt-4o", "toolIds": tool_ids},
            "knowledgeBase": {"provider": "google"}
        })
    }

    #[rstest]
    #[case(&[], &["t1"], &["t1"])]
    #[case(&["a", "b"], &["c"], &["a", "b", "c"])]
    #[case(&["a", "b"], &["b", "a"], &["a", "b"])]
    #[case(&["a", "b"], &["c", "c"], &["a", "b", "c"])]
    fn merge_is_ordered_set_union(
        #[case] existing: &[&str],
        #[case] new: &[&str],
        #[case] expected: &[&str],
    ) {
        assert_eq!(merge_tool_ids(&ids(existing), &ids(new)), ids(expected));
    }

    #[test]
    fn merging_twice_is_idempotent() {
        let once = merge_tool_ids(&ids(&["a"]), &ids(&["t1"]));
        let twice = merge_tool_ids(&once, &ids(&["t1"]));
        assert_eq!(once, twice);
    }

    #[test]
    fn backoff_doubles_from_base() {
        let base = Duration::from_secs(1);
        let delays: Vec<u64> = (0..4).map(|n| backoff_delay(base, n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8]);
    }

    #[rstest]
    #[case(json!({"model": {}, "knowledgeBase": {}}), Some(RemoteSchema::Classic))]
    #[case(json!({"model": {}}), Some(RemoteSchema::Inline))]
    #[case(json!({"knowledgeBase": {}}), Some(RemoteSchema::Inline))]
    #[case(json!({"model": null, "name": "x"}), None)]
    #[case(json!({}), None)]
    fn schema_detection(#[case] doc: Value, #[case] expected: Option<RemoteSchema>) {
        assert_eq!(detect_schema(&doc), expected);
    }

    #[test]
    fn slug_is_stable() {
        assert_eq!(slugify("Acme Spa & Wellness!"), "acme_spa_wellness");
        assert_eq!(query_tool_name("  "), "knowledge_base_query_business");
    }

    #[test]
    fn patch_body_keeps_existing_model_fields() {
        let body = patch_body(&classic(&["old"]), &ids(&["old", "new"]));
        assert_eq!(body["model"]["provider"], "openai");
        assert_eq!(body["model"]["toolIds"], json!(["old", "new"]));
        assert!(body.get("knowledgeBase").is_none());
    }

    #[tokio::test]
    async fn empty_request_makes_no_network_call() {
        let api = FakeAssistantApi::default();
        let outcome = PatchProtocol::new(&api, &settings())
            .attach(AttachRequest {
                assistant_id: "a1",
                business_name: "Acme",
                ..Default::default()
            })
            .await;
        assert!(outcome.success);
        assert_eq!(outcome.reason, PatchReason::NothingToDo);
        assert!(api.calls().is_empty());
    }

    #[tokio::test]
    async fn classic_attach_appends_query_tool_and_verifies() {
        let api = FakeAssistantApi::default().with_assistant("a1", classic(&["existing"]));
        let files = ids(&["file-9"]);
        let outcome = PatchProtocol::new(&api, &settings())
            .attach(AttachRequest {
                assistant_id: "a1",
                business_name: "Acme Spa",
                file_ids: &files,
                tool_ids: &[],
                ..Default::default()
            })
            .await;

        assert!(outcome.success, "{outcome:?}");
        assert_eq!(outcome.reason, PatchReason::Attached);
        assert_eq!(outcome.detected_schema, Some(RemoteSchema::Classic));
        let tool_id = outcome.query_tool_id.clone().expect("tool id");
        let tool = api.tool(&tool_id).expect("tool");
        assert_eq!(tool["function"]["name"], "knowledge_base_query_acme_spa");

        let assistant = api.assistant("a1").expect("assistant");
        assert_eq!(
            existing_tool_ids(&assistant),
            vec!["existing".to_string(), tool_id]
        );
        assert!(outcome.verification.expect("verification").is_clean());
    }

    #[tokio::test]
    async fn superseded_query_tool_is_replaced_in_one_patch() {
        let api = FakeAssistantApi::default().with_assistant("a1", classic(&["manual", "tool-old"]));
        let files = ids(&["file-9"]);
        let superseded = ids(&["tool-old"]);
        let outcome = PatchProtocol::new(&api, &settings())
            .attach(AttachRequest {
                assistant_id: "a1",
                business_name: "Acme",
                file_ids: &files,
                tool_ids: &[],
                superseded_tool_ids: &superseded,
            })
            .await;

        assert!(outcome.success, "{outcome:?}");
        let tool_id = outcome.query_tool_id.expect("tool id");
        let assistant = api.assistant("a1").expect("assistant");
        assert_eq!(
            existing_tool_ids(&assistant),
            vec!["manual".to_string(), tool_id]
        );
        let patches = api.calls().iter().filter(|c| c.starts_with("PATCH")).count();
        assert_eq!(patches, 1);
    }

    #[tokio::test]
    async fn tool_creation_failure_stops_before_probe() {
        let api = FakeAssistantApi::default().with_assistant("a1", classic(&[]));
        api.fail_tool_creation();
        let files = ids(&["f1"]);
        let outcome = PatchProtocol::new(&api, &settings())
            .attach(AttachRequest {
                assistant_id: "a1",
                business_name: "Acme",
                file_ids: &files,
                tool_ids: &[],
                ..Default::default()
            })
            .await;
        assert!(!outcome.success);
        assert_eq!(outcome.reason, PatchReason::QueryToolCreationFailed);
        assert_eq!(api.calls(), vec!["POST /tool".to_string()]);
    }

    #[tokio::test]
    async fn probe_failure_is_fatal() {
        let api = FakeAssistantApi::default();
        api.fail_get();
        let tools = ids(&["t1"]);
        let outcome = PatchProtocol::new(&api, &settings())
            .attach(AttachRequest {
                assistant_id: "a1",
                business_name: "Acme",
                file_ids: &[],
                tool_ids: &tools,
                ..Default::default()
            })
            .await;
        assert_eq!(outcome.reason, PatchReason::GetFailed);
        assert!(!api.calls().iter().any(|c| c.starts_with("PATCH")));
    }

    #[tokio::test]
    async fn unsupported_schema_keeps_raw_response() {
        let raw = json!({"id": "a1", "name": "bare"});
        let api = FakeAssistantApi::default().with_assistant("a1", raw.clone());
        let tools = ids(&["t1"]);
        let outcome = PatchProtocol::new(&api, &settings())
            .attach(AttachRequest {
                assistant_id: "a1",
                business_name: "Acme",
                file_ids: &[],
                tool_ids: &tools,
                ..Default::default()
            })
            .await;
        assert_eq!(outcome.reason, PatchReason::UnsupportedSchema);
        assert!(outcome.reason.needs_manual_review());
        assert_eq!(outcome.remote_response, Some(raw));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_back_off_exponentially() {
        let api = FakeAssistantApi::default().with_assistant("a1", classic(&[]));
        api.script_patch_errors(vec![
            (503, "unavailable".to_string()),
            (503, "unavailable".to_string()),
        ]);
        let tools = ids(&["t1"]);
        let started = tokio::time::Instant::now();
        let outcome = PatchProtocol::new(&api, &settings())
            .attach(AttachRequest {
                assistant_id: "a1",
                business_name: "Acme",
                file_ids: &[],
                tool_ids: &tools,
                ..Default::default()
            })
            .await;
        assert!(outcome.success);
        // 1s after attempt 0, 2s after attempt 1.
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_report_patch_failed() {
        let api = FakeAssistantApi::default().with_assistant("a1", classic(&[]));
        api.script_patch_errors(vec![(500, "boom".to_string()); 3]);
        let tools = ids(&["t1"]);
        let outcome = PatchProtocol::new(&api, &settings())
            .attach(AttachRequest {
                assistant_id: "a1",
                business_name: "Acme",
                file_ids: &[],
                tool_ids: &tools,
                ..Default::default()
            })
            .await;
        assert_eq!(outcome.reason, PatchReason::PatchFailed);
        let patches = api.calls().iter().filter(|c| c.starts_with("PATCH")).count();
        assert_eq!(patches, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn should_not_exist_short_circuits_retries() {
        let api = FakeAssistantApi::default().with_assistant("a1", json!({"model": {}}));
        api.script_patch_errors(vec![
            (400, r#"{"message":["model.toolIds should not exist"]}"#.to_string()),
            (503, "never reached".to_string()),
        ]);
        let tools = ids(&["t1"]);
        let started = tokio::time::Instant::now();
        let outcome = PatchProtocol::new(&api, &settings())
            .attach(AttachRequest {
                assistant_id: "a1",
                business_name: "Acme",
                file_ids: &[],
                tool_ids: &tools,
                ..Default::default()
            })
            .await;
        assert_eq!(outcome.reason, PatchReason::ValidationRejected);
        assert_eq!(outcome.detected_schema, Some(RemoteSchema::Inline));
        assert_eq!(started.elapsed(), Duration::ZERO);
        let patches = api.calls().iter().filter(|c| c.starts_with("PATCH")).count();
        assert_eq!(patches, 1);
    }

    #[tokio::test]
    async fn verification_failure_does_not_flip_success() {
        let api = FakeAssistantApi::default().with_assistant("a1", classic(&[]));
        api.fail_verification();
        let files = ids(&["f1"]);
        let outcome = PatchProtocol::new(&api, &settings())
            .attach(AttachRequest {
                assistant_id: "a1",
                business_name: "Acme",
                file_ids: &files,
                tool_ids: &[],
                ..Default::default()
            })
            .await;
        assert!(outcome.success);
        let verification = outcome.verification.expect("verification");
        assert_eq!(verification.errors.len(), 2);
    }
}
