//! OCR client (intake support): a concrete `OcrClient` behind
//! `loanserve-core::intake`'s narrow trait.
//!
//! Real OCR provider SDKs are explicitly out of scope. The stub
//! here returns reflowed text/key-values deterministically from whatever
//! bytes it's given — enough to drive intake end to end in tests and
//! self-hosted deployments without a scanning backend configured — and the
//! HTTP variant forwards to a provider that speaks a simple
//! bytes-in/text-and-kv-out JSON contract.

use async_trait::async_trait;
use loanserve_core::error::CoreError;
use loanserve_core::intake::OcrClient;
use std::collections::BTreeMap;

/// Treats the input bytes as already-UTF8 text (lossy otherwise) and returns
/// them unchanged; key-value extraction returns nothing. Good enough for
/// deployments and tests that feed in plain text or already-reflowed content
/// and have no scanner backend configured.
pub struct PassthroughOcrClient;

#[async_trait]
impl OcrClient for PassthroughOcrClient {
    async fn extract_text(&self, bytes: &[u8]) -> Result<String, CoreError> {
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    async fn extract_key_values(&self, _bytes: &[u8]) -> Result<BTreeMap<String, String>, CoreError> {
        Ok(BTreeMap::new())
    }
}

/// Calls an HTTP OCR provider that accepts raw bytes and returns
/// `{"text": "...", "key_values": {...}}`.
pub struct HttpOcrClient {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpOcrClient {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }

    async fn call(&self, bytes: &[u8]) -> Result<serde_json::Value, CoreError> {
        let response = self
            .client
            .post(&self.endpoint)
            .body(bytes.to_vec())
            .send()
            .await
            .map_err(|e| CoreError::Transient(format!("ocr request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(CoreError::Transient(format!("ocr provider returned status {}", response.status())));
        }

        response
            .json()
            .await
            .map_err(|e| CoreError::Transient(format!("ocr response was not valid json: {e}")))
    }
}

#[async_trait]
impl OcrClient for HttpOcrClient {
    async fn extract_text(&self, bytes: &[u8]) -> Result<String, CoreError> {
        let body = self.call(bytes).await?;
        Ok(body["text"].as_str().unwrap_or_default().to_string())
    }

    async fn extract_key_values(&self, bytes: &[u8]) -> Result<BTreeMap<String, String>, CoreError> {
        let body = self.call(bytes).await?;
        let mut out = BTreeMap::new();
        if let Some(obj) = body["key_values"].as_object() {
            for (k, v) in obj {
                out.insert(k.clone(), v.as_str().unwrap_or_default().to_string());
            }
        }
        Ok(out)
    }
}
