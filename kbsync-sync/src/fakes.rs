//! In-memory fakes of [`AssistantApi`] and [`ObjectStore`].
//!
//! Compiled for this crate's unit tests and, behind the `test-util` feature,
//! for integration tests that exercise the engine without network access. Every vendor call
//! is appended to a call log (`"GET /assistant/a1"`), so tests can assert on
//! what was, and was not, sent.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::api::{AssistantApi, QueryToolRequest};
use crate::error::{ApiError, ObjectStoreError};
use crate::object_store::ObjectStore;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// FakeAssistantApi
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ApiState {
    calls: Vec<String>,
    next_id: u64,
    assistants: HashMap<String, Value>,
    tools: HashMap<String, Value>,
    uploaded: Vec<(String, String)>,
    deleted: Vec<String>,
    failing_uploads: HashSet<String>,
    failing_deletes: HashSet<String>,
    fail_get: bool,
    fail_tool_creation: bool,
    fail_verification: bool,
    /// Scripted PATCH failures, consumed one per attempt.
    patch_errors: VecDeque<(u16, String)>,
    patch_bodies: Vec<Value>,
}

/// Scriptable in-memory vendor.
#[derive(Default)]
pub struct FakeAssistantApi {
    state: Mutex<ApiState>,
}

impl FakeAssistantApi {
    /// Register assistant `id` with the given resource document.
    pub fn with_assistant(self, id: &str, doc: Value) -> Self {
        self.set_assistant(id, doc);
        self
    }

    /// Replace the remote document of assistant `id`.
    pub fn set_assistant(&self, id: &str, doc: Value) {
        lock(&self.state).assistants.insert(id.to_string(), doc);
    }

    pub fn fail_upload(&self, name: &str) {
        lock(&self.state).failing_uploads.insert(name.to_string());
    }

    pub fn clear_upload_failures(&self) {
        lock(&self.state).failing_uploads.clear();
    }

    pub fn fail_delete(&self, file_id: &str) {
        lock(&self.state).failing_deletes.insert(file_id.to_string());
    }

    pub fn fail_get(&self) {
        lock(&self.state).fail_get = true;
    }

    pub fn fail_tool_creation(&self) {
        lock(&self.state).fail_tool_creation = true;
    }

    /// Make the verification GETs (issued after a successful PATCH) fail.
    pub fn fail_verification(&self) {
        lock(&self.state).fail_verification = true;
    }

    /// Fail the next PATCH attempts with these `(status, body)` answers.
    pub fn script_patch_errors<I>(&self, errors: I)
    where
        I: IntoIterator<Item = (u16, String)>,
    {
        lock(&self.state).patch_errors.extend(errors);
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.state).calls.clone()
    }

    /// `(name, vendor id)` of every successful upload, in order.
    pub fn uploaded(&self) -> Vec<(String, String)> {
        lock(&self.state).uploaded.clone()
    }

    pub fn uploaded_names(&self) -> Vec<String> {
        self.uploaded().into_iter().map(|(name, _)| name).collect()
    }

    pub fn deleted(&self) -> Vec<String> {
        lock(&self.state).deleted.clone()
    }

    pub fn patch_bodies(&self) -> Vec<Value> {
        lock(&self.state).patch_bodies.clone()
    }

    pub fn assistant(&self, id: &str) -> Option<Value> {
        lock(&self.state).assistants.get(id).cloned()
    }

    pub fn tool(&self, id: &str) -> Option<Value> {
        lock(&self.state).tools.get(id).cloned()
    }

    fn not_found(method: &'static str, path: String) -> ApiError {
        ApiError::Status {
            method,
            path,
            status: 404,
            body: r#"{"message":"Not Found"}"#.to_string(),
        }
    }
}

#[async_trait]
impl AssistantApi for FakeAssistantApi {
    async fn upload_file(
        &self,
        name: &str,
        _mime_type: &str,
        _content: Vec<u8>,
    ) -> Result<String, ApiError> {
        let mut state = lock(&self.state);
        state.calls.push("POST /file".to_string());
        if state.failing_uploads.contains(name) {
            return Err(ApiError::Status {
                method: "POST",
                path: "/file".to_string(),
                status: 500,
                body: "upload rejected".to_string(),
            });
        }
        state.next_id += 1;
        let id = format!("file-{}", state.next_id);
        state.uploaded.push((name.to_string(), id.clone()));
        Ok(id)
    }

    async fn delete_file(&self, file_id: &str) -> Result<(), ApiError> {
        let mut state = lock(&self.state);
        let path = format!("/file/{file_id}");
        state.calls.push(format!("DELETE {path}"));
        if state.failing_deletes.contains(file_id) {
            return Err(ApiError::Transport {
                method: "DELETE",
                path,
                message: "connection reset".to_string(),
            });
        }
        state.deleted.push(file_id.to_string());
        Ok(())
    }

    async fn get_assistant(&self, assistant_id: &str) -> Result<Value, ApiError> {
        let mut state = lock(&self.state);
        let path = format!("/assistant/{assistant_id}");
        state.calls.push(format!("GET {path}"));
        let verifying = !state.patch_bodies.is_empty();
        if state.fail_get || (verifying && state.fail_verification) {
            return Err(ApiError::Transport {
                method: "GET",
                path,
                message: "timed out".to_string(),
            });
        }
        state
            .assistants
            .get(assistant_id)
            .cloned()
            .ok_or_else(|| Self::not_found("GET", path))
    }

    async fn patch_assistant(&self, assistant_id: &str, body: &Value) -> Result<Value, ApiError> {
        let mut state = lock(&self.state);
        let path = format!("/assistant/{assistant_id}");
        state.calls.push(format!("PATCH {path}"));
        if let Some((status, body)) = state.patch_errors.pop_front() {
            return Err(ApiError::Status {
                method: "PATCH",
                path,
                status,
                body,
            });
        }
        state.patch_bodies.push(body.clone());
        let Some(doc) = state.assistants.get_mut(assistant_id) else {
            return Err(Self::not_found("PATCH", path));
        };
        if let (Some(target), Some(patch)) = (doc.as_object_mut(), body.as_object()) {
            for (k, v) in patch {
                target.insert(k.clone(), v.clone());
            }
        }
        Ok(doc.clone())
    }

    async fn create_query_tool(&self, request: &QueryToolRequest) -> Result<String, ApiError> {
        let mut state = lock(&self.state);
        state.calls.push("POST /tool".to_string());
        if state.fail_tool_creation {
            return Err(ApiError::Status {
                method: "POST",
                path: "/tool".to_string(),
                status: 422,
                body: "invalid knowledge base".to_string(),
            });
        }
        state.next_id += 1;
        let id = format!("tool-{}", state.next_id);
        let mut doc = request.to_body();
        if let Some(obj) = doc.as_object_mut() {
            obj.insert("id".to_string(), json!(id));
        }
        state.tools.insert(id.clone(), doc);
        Ok(id)
    }

    async fn get_tool(&self, tool_id: &str) -> Result<Value, ApiError> {
        let mut state = lock(&self.state);
        let path = format!("/tool/{tool_id}");
        state.calls.push(format!("GET {path}"));
        if state.fail_verification {
            return Err(ApiError::Transport {
                method: "GET",
                path,
                message: "timed out".to_string(),
            });
        }
        state
            .tools
            .get(tool_id)
            .cloned()
            .ok_or_else(|| Self::not_found("GET", path))
    }
}

// ---------------------------------------------------------------------------
// MemoryObjectStore
// ---------------------------------------------------------------------------

#[derive(Default)]
struct StoreState {
    objects: BTreeMap<String, (Vec<u8>, String)>,
    failing_puts: HashSet<String>,
    deleted: Vec<String>,
}

/// In-memory [`ObjectStore`].
#[derive(Default)]
pub struct MemoryObjectStore {
    state: Mutex<StoreState>,
}

impl MemoryObjectStore {
    pub fn fail_put(&self, key: &str) {
        lock(&self.state).failing_puts.insert(key.to_string());
    }

    pub fn clear_put_failures(&self) {
        lock(&self.state).failing_puts.clear();
    }

    pub fn contains(&self, key: &str) -> bool {
        lock(&self.state).objects.contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        lock(&self.state).objects.keys().cloned().collect()
    }

    pub fn content_type(&self, key: &str) -> Option<String> {
        lock(&self.state).objects.get(key).map(|(_, ct)| ct.clone())
    }

    pub fn deleted(&self) -> Vec<String> {
        lock(&self.state).deleted.clone()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    fn backend_tag(&self) -> &'static str {
        "memory"
    }

    async fn put(
        &self,
        key: &str,
        content: Vec<u8>,
        content_type: &str,
    ) -> Result<(), ObjectStoreError> {
        let mut state = lock(&self.state);
        if state.failing_puts.contains(key) {
            return Err(ObjectStoreError::Status {
                op: "put",
                key: key.to_string(),
                status: 503,
            });
        }
        state
            .objects
            .insert(key.to_string(), (content, content_type.to_string()));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ObjectStoreError> {
        Ok(lock(&self.state).objects.get(key).map(|(c, _)| c.clone()))
    }

    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError> {
        let mut state = lock(&self.state);
        state.objects.remove(key);
        state.deleted.push(key.to_string());
        Ok(())
    }

    async fn head(&self, key: &str) -> Result<bool, ObjectStoreError> {
        Ok(self.contains(key))
    }
}
