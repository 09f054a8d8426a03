//! Durable object store: the second publishing backend.
//!
//! Keys are `archives/{sanitized_business_id}/{file_name}`. Two backends:
//! [`HttpObjectStore`] for S3-compatible endpoints and [`LocalObjectStore`]
//! for a plain directory (the default, under `~/.kbsync/archive`).

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, StatusCode};

use kbsync_core::settings::{ObjectStoreSettings, Settings};
use kbsync_core::types::BusinessId;

use crate::error::{store_io_err, ObjectStoreError};

/// Object key for a document of `business`.
pub fn object_key(business: &BusinessId, file_name: &str) -> String {
    format!("archives/{}/{}", business.sanitized(), file_name)
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    fn backend_tag(&self) -> &'static str;

    async fn put(&self, key: &str, content: Vec<u8>, content_type: &str)
        -> Result<(), ObjectStoreError>;

    /// `None` when the key does not exist.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ObjectStoreError>;

    /// Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError>;

    async fn head(&self, key: &str) -> Result<bool, ObjectStoreError>;
}

/// Build the configured store.
pub fn from_settings(settings: &Settings, home: &Path) -> Result<Arc<dyn ObjectStore>, ObjectStoreError> {
    match settings.object_store_or_default(home) {
        ObjectStoreSettings::Local { root } => Ok(Arc::new(LocalObjectStore::new(root))),
        ObjectStoreSettings::Http { base_url, token } => Ok(Arc::new(HttpObjectStore::new(
            &base_url,
            token,
            RetryPolicy::default(),
            settings.http_timeout(),
        )?)),
    }
}

/// Reject absolute keys and keys that climb out of the store root.
fn validate_key(key: &str) -> Result<(), ObjectStoreError> {
    let path = Path::new(key);
    let ok = !key.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if ok {
        Ok(())
    } else {
        Err(ObjectStoreError::InvalidKey(key.to_string()))
    }
}

// ---------------------------------------------------------------------------
// LocalObjectStore
// ---------------------------------------------------------------------------

pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, ObjectStoreError> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    fn backend_tag(&self) -> &'static str {
        "local"
    }

    async fn put(
        &self,
        key: &str,
        content: Vec<u8>,
        _content_type: &str,
    ) -> Result<(), ObjectStoreError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| store_io_err(parent, e))?;
        }
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, content)
            .await
            .map_err(|e| store_io_err(&tmp, e))?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(store_io_err(&path, e));
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ObjectStoreError> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(store_io_err(&path, e)),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(store_io_err(&path, e)),
        }
    }

    async fn head(&self, key: &str) -> Result<bool, ObjectStoreError> {
        let path = self.path_for(key)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(store_io_err(&path, e)),
        }
    }
}

// ---------------------------------------------------------------------------
// HttpObjectStore
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_ms: 200,
        }
    }
}

/// S3-compatible store: `PUT/GET/DELETE/HEAD {base_url}/{key}`.
pub struct HttpObjectStore {
    base_url: String,
    token: Option<String>,
    retry: RetryPolicy,
    client: Client,
}

impl HttpObjectStore {
    pub fn new(
        base_url: &str,
        token: Option<String>,
        retry: RetryPolicy,
        timeout: Duration,
    ) -> Result<Self, ObjectStoreError> {
        let client = Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| ObjectStoreError::Transport {
                op: "init",
                key: base_url.to_string(),
                message: e.to_string(),
            })?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            retry,
            client,
        })
    }

    fn url(&self, key: &str) -> Result<String, ObjectStoreError> {
        validate_key(key)?;
        Ok(format!("{}/{}", self.base_url, key))
    }

    fn auth_headers(&self) -> Result<HeaderMap, ObjectStoreError> {
        let mut headers = HeaderMap::new();
        if let Some(token) = &self.token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|_| ObjectStoreError::InvalidKey("authorization header".to_string()))?;
            headers.insert(AUTHORIZATION, value);
        }
        Ok(headers)
    }

    /// Send the request built by `build`, retrying transport errors and 5xx
    /// with linear backoff. 4xx answers are returned as-is.
    async fn send_with_retry<F>(
        &self,
        op: &'static str,
        key: &str,
        build: F,
    ) -> Result<reqwest::Response, ObjectStoreError>
    where
        F: Fn() -> reqwest::RequestBuilder + Send + Sync,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match build().send().await {
                Ok(resp) if !resp.status().is_server_error() => return Ok(resp),
                Ok(resp) => {
                    if attempt >= self.retry.max_attempts {
                        return Err(ObjectStoreError::Status {
                            op,
                            key: key.to_string(),
                            status: resp.status().as_u16(),
                        });
                    }
                }
                Err(e) => {
                    if attempt >= self.retry.max_attempts {
                        return Err(ObjectStoreError::Transport {
                            op,
                            key: key.to_string(),
                            message: e.to_string(),
                        });
                    }
                }
            }
            tracing::debug!("object store {op} {key}: retrying (attempt {attempt})");
            tokio::time::sleep(Duration::from_millis(
                self.retry.base_backoff_ms.saturating_mul(attempt as u64),
            ))
            .await;
        }
    }
}

fn status_err(op: &'static str, key: &str, status: StatusCode) -> ObjectStoreError {
    ObjectStoreError::Status {
        op,
        key: key.to_string(),
        status: status.as_u16(),
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    fn backend_tag(&self) -> &'static str {
        "http"
    }

    async fn put(
        &self,
        key: &str,
        content: Vec<u8>,
        content_type: &str,
    ) -> Result<(), ObjectStoreError> {
        let url = self.url(key)?;
        let mut headers = self.auth_headers()?;
        let ct = HeaderValue::from_str(content_type)
            .map_err(|_| ObjectStoreError::InvalidKey(content_type.to_string()))?;
        headers.insert(CONTENT_TYPE, ct);
        let resp = self
            .send_with_retry("put", key, || {
                self.client
                    .put(&url)
                    .headers(headers.clone())
                    .body(content.clone())
            })
            .await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(status_err("put", key, resp.status()))
        }
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ObjectStoreError> {
        let url = self.url(key)?;
        let headers = self.auth_headers()?;
        let resp = self
            .send_with_retry("get", key, || self.client.get(&url).headers(headers.clone()))
            .await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => resp
                .bytes()
                .await
                .map(|b| Some(b.to_vec()))
                .map_err(|e| ObjectStoreError::Transport {
                    op: "get",
                    key: key.to_string(),
                    message: format!("read body failed: {e}"),
                }),
            s => Err(status_err("get", key, s)),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError> {
        let url = self.url(key)?;
        let headers = self.auth_headers()?;
        let resp = self
            .send_with_retry("delete", key, || {
                self.client.delete(&url).headers(headers.clone())
            })
            .await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(()),
            s if s.is_success() => Ok(()),
            s => Err(status_err("delete", key, s)),
        }
    }

    async fn head(&self, key: &str) -> Result<bool, ObjectStoreError> {
        let url = self.url(key)?;
        let headers = self.auth_headers()?;
        let resp = self
            .send_with_retry("head", key, || self.client.head(&url).headers(headers.clone()))
            .await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(false),
            s if s.is_success() => Ok(true),
            s => Err(status_err("head", key, s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn object_key_uses_sanitized_business_id() {
        let key = object_key(&BusinessId::from("acme spa/east"), "acme_spa_east_faq.md");
        assert_eq!(key, "archives/acme_spa_east/acme_spa_east_faq.md");
    }

    #[test]
    fn keys_cannot_escape_the_root() {
        assert!(validate_key("archives/acme/faq.md").is_ok());
        assert!(validate_key("../etc/passwd").is_err());
        assert!(validate_key("/abs/path").is_err());
        assert!(validate_key("").is_err());
    }

    #[tokio::test]
    async fn local_store_put_get_head_delete() {
        let dir = TempDir::new().expect("root");
        let store = LocalObjectStore::new(dir.path());
        let key = "archives/acme/acme_faq.md";

        assert!(!store.head(key).await.expect("head"));
        assert_eq!(store.get(key).await.expect("get"), None);

        store
            .put(key, b"# FAQ\n".to_vec(), "text/markdown")
            .await
            .expect("put");
        assert!(store.head(key).await.expect("head"));
        assert_eq!(
            store.get(key).await.expect("get").as_deref(),
            Some(&b"# FAQ\n"[..])
        );

        store.delete(key).await.expect("delete");
        store.delete(key).await.expect("second delete is a no-op");
        assert!(!store.head(key).await.expect("head"));
    }
}
