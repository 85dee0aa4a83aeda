//! AI extraction client: a concrete `LlmClient` behind
//! `loanserve-core::extract::ai`'s narrow trait.
//!
//! Grounded on `noahbclarkson-financial-history-builder`'s `GeminiClient`
//! wrapping pattern (src-llm-extractor.rs): one HTTP call per prompt,
//! provider-specific request shaping kept entirely inside the adapter so the
//! core extraction logic only ever sees "give me a completion for this
//! prompt". A deterministic stub variant backs tests and stand-alone
//! deployments without a configured provider key.

use async_trait::async_trait;
use loanserve_core::error::CoreError;
use loanserve_core::extract::LlmClient;

/// Calls an OpenAI-compatible chat completions endpoint. Kept provider-agnostic
/// (base URL + API key are both configuration) rather than naming a specific
/// vendor SDK.
pub struct HttpLlmClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl HttpLlmClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn complete(&self, prompt: &str, prompt_version: &str) -> Result<String, CoreError> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({
                "model": self.model,
                "messages": [{"role": "user", "content": prompt}],
                "temperature": 0,
            }))
            .send()
            .await
            .map_err(|e| CoreError::Transient(format!("llm request failed (prompt_version={prompt_version}): {e}")))?;

        if !response.status().is_success() {
            return Err(CoreError::Transient(format!("llm provider returned status {}", response.status())));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| CoreError::Transient(format!("llm response was not valid json: {e}")))?;

        body["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| CoreError::Integrity("llm response missing choices[0].message.content".to_string()))
    }
}

/// Deterministic stand-in for tests and key-less deployments: always returns
/// an empty JSON object, so extraction proceeds with zero AI-sourced
/// candidates rather than failing outright.
pub struct StubLlmClient;

#[async_trait]
impl LlmClient for StubLlmClient {
    async fn complete(&self, _prompt: &str, _prompt_version: &str) -> Result<String, CoreError> {
        Ok("{}".to_string())
    }
}
