//! Vendor assistant API: [`AssistantApi`] seam and its reqwest client.
//!
//! Endpoints used (HTTP + JSON, bearer auth):
//!
//! | Call                    | Purpose                                  |
//! |-------------------------|------------------------------------------|
//! | `POST /file`            | multipart upload, returns `{ id }`       |
//! | `DELETE /file/{id}`     | retire an old-generation file            |
//! | `GET /assistant/{id}`   | schema probe and verification            |
//! | `PATCH /assistant/{id}` | attach tool ids                          |
//! | `POST /tool`            | create the knowledge-base query tool     |
//! | `GET /tool/{id}`        | verification only                        |

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Client, Method, RequestBuilder};
use serde_json::{json, Value};

use kbsync_core::settings::Settings;

use crate::error::ApiError;

/// Body of `POST /tool` for a knowledge-base query tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryToolRequest {
    pub name: String,
    pub description: String,
    pub provider: String,
    pub file_ids: Vec<String>,
}

impl QueryToolRequest {
    pub fn to_body(&self) -> Value {
        json!({
            "type": "query",
            "function": { "name": self.name },
            "knowledgeBases": [{
                "provider": self.provider,
                "name": self.name,
                "description": self.description,
                "fileIds": self.file_ids,
            }],
        })
    }
}

/// Everything the sync engine needs from the vendor.
#[async_trait]
pub trait AssistantApi: Send + Sync {
    /// Upload one document; returns the vendor file id.
    async fn upload_file(
        &self,
        name: &str,
        mime_type: &str,
        content: Vec<u8>,
    ) -> Result<String, ApiError>;

    async fn delete_file(&self, file_id: &str) -> Result<(), ApiError>;

    async fn get_assistant(&self, assistant_id: &str) -> Result<Value, ApiError>;

    /// Returns the vendor's response body.
    async fn patch_assistant(&self, assistant_id: &str, body: &Value) -> Result<Value, ApiError>;

    /// Returns the new tool id.
    async fn create_query_tool(&self, request: &QueryToolRequest) -> Result<String, ApiError>;

    async fn get_tool(&self, tool_id: &str) -> Result<Value, ApiError>;
}

// ---------------------------------------------------------------------------
// HttpAssistantApi
// ---------------------------------------------------------------------------

/// reqwest-backed [`AssistantApi`]. Configuration is injected once at
/// construction; nothing is read from the environment afterwards.
pub struct HttpAssistantApi {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpAssistantApi {
    pub fn new(settings: &Settings) -> Result<Self, ApiError> {
        Self::with_timeout(
            &settings.vendor_base_url,
            settings.vendor_api_key.clone(),
            settings.http_timeout(),
        )
    }

    pub fn with_timeout(
        base_url: &str,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ApiError::Transport {
                method: "INIT",
                path: base_url.to_string(),
                message: e.to_string(),
            })?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn auth_headers(&self) -> Result<HeaderMap, ApiError> {
        let token = self.api_key.as_deref().ok_or(ApiError::MissingApiKey)?;
        let mut headers = HeaderMap::new();
        let value = HeaderValue::from_str(&format!("Bearer {token}")).map_err(|e| {
            ApiError::InvalidResponse {
                path: "authorization header".to_string(),
                message: e.to_string(),
            }
        })?;
        headers.insert(AUTHORIZATION, value);
        Ok(headers)
    }

    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder, ApiError> {
        let url = format!("{}{}", self.base_url, path);
        Ok(self
            .client
            .request(method, url)
            .headers(self.auth_headers()?))
    }

    /// Send `req`, map non-2xx to [`ApiError::Status`] and parse the body as
    /// JSON (`Value::Null` for an empty body).
    async fn send(
        &self,
        method: &'static str,
        path: &str,
        req: RequestBuilder,
    ) -> Result<Value, ApiError> {
        let resp = req.send().await.map_err(|e| ApiError::Transport {
            method,
            path: path.to_string(),
            message: e.to_string(),
        })?;
        let status = resp.status();
        let text = resp.text().await.map_err(|e| ApiError::Transport {
            method,
            path: path.to_string(),
            message: format!("read body failed: {e}"),
        })?;
        if !status.is_success() {
            return Err(ApiError::Status {
                method,
                path: path.to_string(),
                status: status.as_u16(),
                body: text,
            });
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| ApiError::InvalidResponse {
            path: path.to_string(),
            message: e.to_string(),
        })
    }
}

fn id_field(path: &str, body: &Value) -> Result<String, ApiError> {
    body.get("id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ApiError::InvalidResponse {
            path: path.to_string(),
            message: "response has no `id`".to_string(),
        })
}

#[async_trait]
impl AssistantApi for HttpAssistantApi {
    async fn upload_file(
        &self,
        name: &str,
        mime_type: &str,
        content: Vec<u8>,
    ) -> Result<String, ApiError> {
        let path = "/file";
        let part = reqwest::multipart::Part::bytes(content)
            .file_name(name.to_string())
            .mime_str(mime_type)
            .map_err(|e| ApiError::InvalidResponse {
                path: path.to_string(),
                message: format!("invalid mime type {mime_type}: {e}"),
            })?;
        let form = reqwest::multipart::Form::new().part("file", part);
        let req = self.request(Method::POST, path)?.multipart(form);
        let body = self.send("POST", path, req).await?;
        id_field(path, &body)
    }

    async fn delete_file(&self, file_id: &str) -> Result<(), ApiError> {
        let path = format!("/file/{file_id}");
        let req = self.request(Method::DELETE, &path)?;
        self.send("DELETE", &path, req).await.map(|_| ())
    }

    async fn get_assistant(&self, assistant_id: &str) -> Result<Value, ApiError> {
        let path = format!("/assistant/{assistant_id}");
        let req = self.request(Method::GET, &path)?;
        self.send("GET", &path, req).await
    }

    async fn patch_assistant(&self, assistant_id: &str, body: &Value) -> Result<Value, ApiError> {
        let path = format!("/assistant/{assistant_id}");
        let req = self.request(Method::PATCH, &path)?.json(body);
        self.send("PATCH", &path, req).await
    }

    async fn create_query_tool(&self, request: &QueryToolRequest) -> Result<String, ApiError> {
        let path = "/tool";
        let req = self.request(Method::POST, path)?.json(&request.to_body());
        let body = self.send("POST", path, req).await?;
        id_field(path, &body)
    }

    async fn get_tool(&self, tool_id: &str) -> Result<Value, ApiError> {
        let path = format!("/tool/{tool_id}");
        let req = self.request(Method::GET, &path)?;
        self.send("GET", &path, req).await
    }
}
