//! HTTP client for the server of record.

use std::fmt;
use std::marker::PhantomData;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::IF_MATCH;
use reqwest::{Response, StatusCode};
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use quote_core::{ServerDocument, SyncDocument};

use super::RemoteDocuments;
use crate::error::{SyncError, SyncResult};

/// Longest error body kept in a `ServerStatus` message.
const MAX_ERROR_BODY: usize = 256;

/// [`RemoteDocuments`] over HTTP.
///
/// ```text
/// GET {base}/quotation/q-1          → ServerDocument<Quotation>
/// PUT {base}/quotation/q-1          ← document + versionNumber, If-Match
/// ```
pub struct HttpRemote<T> {
    client: reqwest::Client,
    base: Url,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for HttpRemote<T> {
    fn clone(&self) -> Self {
        HttpRemote {
            client: self.client.clone(),
            base: self.base.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: SyncDocument> fmt::Debug for HttpRemote<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpRemote")
            .field("entity_type", &T::ENTITY_TYPE)
            .field("base", &self.base.as_str())
            .finish()
    }
}

impl<T: SyncDocument> HttpRemote<T> {
    /// Creates a client for `base_url` with a per-request timeout.
    pub fn new(base_url: &str, timeout: Duration) -> SyncResult<Self> {
        let base = Url::parse(base_url)?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(SyncError::InvalidUrl(format!(
                "Server URL must start with http:// or https://, got: {}",
                base_url
            )));
        }
        if base.cannot_be_a_base() {
            return Err(SyncError::InvalidUrl(format!("Not a base URL: {}", base_url)));
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::InvalidConfig(e.to_string()))?;

        Ok(HttpRemote {
            client,
            base,
            _marker: PhantomData,
        })
    }

    /// Returns the base URL.
    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn document_url(&self, id: &str) -> SyncResult<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| SyncError::InvalidUrl(self.base.to_string()))?
            .pop_if_empty()
            .push(T::ENTITY_TYPE)
            .push(id);
        Ok(url)
    }

    /// Maps non-success responses to errors.
    async fn check(&self, response: Response, id: &str, expected: Option<i64>) -> SyncResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        match status {
            StatusCode::NOT_FOUND => Err(SyncError::NotFound {
                entity_type: T::ENTITY_TYPE.to_string(),
                id: id.to_string(),
            }),
            StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => {
                // Servers may report their current version in the body
                let actual = response
                    .json::<Value>()
                    .await
                    .ok()
                    .and_then(|body| body.get("versionNumber").and_then(Value::as_i64))
                    .unwrap_or(-1);
                Err(SyncError::VersionMismatch {
                    entity_id: id.to_string(),
                    expected: expected.unwrap_or(-1),
                    actual,
                })
            }
            _ => {
                let mut message = response.text().await.unwrap_or_default();
                if message.len() > MAX_ERROR_BODY {
                    let cut = (0..=MAX_ERROR_BODY)
                        .rev()
                        .find(|i| message.is_char_boundary(*i))
                        .unwrap_or(0);
                    message.truncate(cut);
                }
                warn!(status = status.as_u16(), entity_id = %id, "Server error");
                Err(SyncError::ServerStatus {
                    status: status.as_u16(),
                    message,
                })
            }
        }
    }
}

#[async_trait]
impl<T: SyncDocument> RemoteDocuments<T> for HttpRemote<T> {
    async fn fetch(&self, id: &str) -> SyncResult<ServerDocument<T>> {
        let url = self.document_url(id)?;
        debug!(url = %url, "GET document");

        let response = self.client.get(url).send().await?;
        let response = self.check(response, id, None).await?;
        Ok(response.json::<ServerDocument<T>>().await?)
    }

    async fn store(&self, doc: &T, expected_version: i64) -> SyncResult<ServerDocument<T>> {
        let url = self.document_url(doc.id())?;

        let mut body = serde_json::to_value(doc)?;
        match body.as_object_mut() {
            Some(fields) => {
                fields.insert("versionNumber".to_string(), Value::from(expected_version));
            }
            None => {
                return Err(SyncError::SerializationFailed(format!(
                    "{} does not serialize to a JSON object",
                    T::ENTITY_TYPE
                )))
            }
        }

        debug!(url = %url, expected_version, "PUT document");

        let response = self
            .client
            .put(url)
            .header(IF_MATCH, format!("\"{}\"", expected_version))
            .json(&body)
            .send()
            .await?;
        let response = self.check(response, doc.id(), Some(expected_version)).await?;
        Ok(response.json::<ServerDocument<T>>().await?)
    }

    async fn ping(&self) -> SyncResult<()> {
        // Any HTTP answer means the server is reachable
        self.client.get(self.base.clone()).send().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quote_core::Quotation;

    #[test]
    fn test_document_url() {
        let remote = HttpRemote::<Quotation>::new("http://localhost:8080/api/", Duration::from_secs(1)).unwrap();
        assert_eq!(
            remote.document_url("q-1").unwrap().as_str(),
            "http://localhost:8080/api/quotation/q-1"
        );

        let remote = HttpRemote::<Quotation>::new("http://localhost:8080/api", Duration::from_secs(1)).unwrap();
        assert_eq!(
            remote.document_url("q-1").unwrap().as_str(),
            "http://localhost:8080/api/quotation/q-1"
        );
    }

    #[test]
    fn test_rejects_non_http_urls() {
        assert!(HttpRemote::<Quotation>::new("ws://localhost:8080", Duration::from_secs(1)).is_err());
        assert!(HttpRemote::<Quotation>::new("not a url", Duration::from_secs(1)).is_err());
    }
}
