//! AI Extractor: posts a versioned prompt for one doc type to an external
//! LLM and validates the JSON response against a strict per-doc-type schema.
//!
//! Grounded on `other_examples/.../src-llm-extractor.rs` (FinancialExtractor):
//! a narrow client trait so the transport is swappable, strict JSON-schema
//! validation on the response with the raw text preserved for diagnosis on
//! failure, and only ever filling in fields the deterministic pass missed.

use crate::error::CoreError;
use crate::types::{Candidate, CandidateSource, DocType, Evidence, FieldValue};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// Evidence the LLM must attach per extracted field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiFieldEvidence {
    pub doc_id: String,
    pub page: Option<u32>,
    pub text_hash: String,
    pub snippet: Option<String>,
    pub bounding_box: Option<[f64; 4]>,
}

/// The expected shape of an LLM response: `{docType, promptVersion, data, evidence}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiExtractorResponse {
    pub doc_type: String,
    pub prompt_version: String,
    pub data: HashMap<String, Value>,
    pub evidence: HashMap<String, AiFieldEvidence>,
    /// Per-field confidence, clamped to [0, 1] on ingestion.
    #[serde(default)]
    pub confidence: HashMap<String, f32>,
}

/// Narrow transport trait; any concrete LLM provider implements this in the
/// adapters layer. A schema-validation failure must surface as
/// `CoreError::Validation` (non-retryable); network/5xx/429 as
/// `CoreError::Transient` (retryable) — the trait itself stays transport-agnostic
/// and lets the implementor make that call.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, prompt: &str, prompt_version: &str) -> Result<String, CoreError>;
}

/// The doc-type-specific set of fields a prompt pack is allowed to return.
/// Closed-schema validation (`additionalProperties: false`): any key outside
/// this set fails validation.
fn schema_fields(doc_type: DocType) -> &'static [&'static str] {
    match doc_type {
        DocType::Note => &["loan_amount", "interest_rate", "borrower_name", "maturity_date", "origination_date"],
        DocType::Cd => &["closing_date", "cash_to_close"],
        DocType::Hoi => &["annual_premium", "coverage_required"],
        DocType::Flood => &["flood_zone", "flood_insurance_required"],
        DocType::Appraisal => &["appraised_value"],
        DocType::Deed => &["property_address"],
        DocType::Le => &["estimated_closing_costs", "loan_term_months"],
        DocType::Mismo | DocType::Csv | DocType::Json | DocType::Pdf => &[],
    }
}

fn prompt_pack(doc_type: DocType, text_slices: &[String], prompt_version: &str) -> String {
    let fields = schema_fields(doc_type).join(", ");
    format!(
        "Extract the following fields from this {} document, responding with strict JSON \
         matching schema version {prompt_version}: {fields}.\n\nDocument text:\n{}",
        doc_type.as_str(),
        text_slices.join("\n---\n")
    )
}

/// Validates an `AiExtractorResponse` against the doc type's field set: every
/// key in `data` must be a known field (`additionalProperties: false`), and
/// every key with data must carry matching evidence.
fn validate_response(doc_type: DocType, response: &AiExtractorResponse) -> Result<(), CoreError> {
    let allowed: HashSet<&str> = schema_fields(doc_type).iter().copied().collect();

    for key in response.data.keys() {
        if !allowed.contains(key.as_str()) {
            return Err(CoreError::Validation(format!(
                "ai extractor response contains unknown field '{key}' for doc type {}",
                doc_type.as_str()
            )));
        }
        if !response.evidence.contains_key(key) {
            return Err(CoreError::Validation(format!(
                "ai extractor response is missing evidence for field '{key}'"
            )));
        }
    }

    Ok(())
}

fn json_to_field_value(value: &Value) -> FieldValue {
    match value {
        Value::String(s) => FieldValue::Text(s.clone()),
        Value::Number(n) => match n.to_string().parse::<rust_decimal::Decimal>() {
            Ok(d) => FieldValue::Number(d),
            Err(_) => FieldValue::Null,
        },
        Value::Bool(b) => FieldValue::Boolean(*b),
        Value::Null => FieldValue::Null,
        other => FieldValue::Text(other.to_string()),
    }
}

/// Orchestrates one AI extraction pass for a document: builds the prompt, calls
/// the LLM, parses and validates the response, and wraps it into `Candidate`s
/// — but only for keys `already_present` doesn't contain, since the AI
/// extractor never overrides a deterministic hit in the same document.
pub struct AiExtractor<'a, C: LlmClient> {
    client: &'a C,
    prompt_version: String,
}

impl<'a, C: LlmClient> AiExtractor<'a, C> {
    pub fn new(client: &'a C, prompt_version: impl Into<String>) -> Self {
        Self {
            client,
            prompt_version: prompt_version.into(),
        }
    }

    pub async fn extract(
        &self,
        doc_type: DocType,
        doc_id: &str,
        text_slices: &[String],
        already_present: &HashSet<String>,
    ) -> Result<Vec<Candidate>, CoreError> {
        let missing_fields: HashSet<&str> = schema_fields(doc_type)
            .iter()
            .copied()
            .filter(|f| !already_present.contains(*f))
            .collect();

        if missing_fields.is_empty() {
            return Ok(Vec::new());
        }

        let prompt = prompt_pack(doc_type, text_slices, &self.prompt_version);
        let raw = self.client.complete(&prompt, &self.prompt_version).await?;

        let response: AiExtractorResponse = serde_json::from_str(&raw).map_err(|e| {
            CoreError::Validation(format!("ai extractor response failed to parse: {e}; raw={raw}"))
        })?;

        if response.prompt_version != self.prompt_version {
            return Err(CoreError::Validation(format!(
                "ai extractor prompt version mismatch: expected {}, got {}",
                self.prompt_version, response.prompt_version
            )));
        }

        validate_response(doc_type, &response)?;

        let candidates = response
            .data
            .iter()
            .filter(|(key, _)| missing_fields.contains(key.as_str()))
            .filter_map(|(key, value)| {
                let evidence = response.evidence.get(key)?;
                let confidence = response.confidence.get(key).copied().unwrap_or(1.0).clamp(0.0, 1.0);
                Some(Candidate {
                    key: key.clone(),
                    value: json_to_field_value(value),
                    source: CandidateSource::AiDoc,
                    confidence,
                    doc_type: Some(doc_type),
                    doc_id: Some(doc_id.to_string()),
                    page: evidence.page,
                    evidence: Some(Evidence {
                        text_hash: evidence.text_hash.clone(),
                        snippet: evidence.snippet.clone(),
                    }),
                    extractor_version: Some(self.prompt_version.clone()),
                    timestamp: Utc::now(),
                })
            })
            .collect();

        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct ScriptedClient {
        responses: Mutex<Vec<Result<String, CoreError>>>,
    }

    #[async_trait]
    impl LlmClient for ScriptedClient {
        async fn complete(&self, _prompt: &str, _prompt_version: &str) -> Result<String, CoreError> {
            self.responses.lock().unwrap().pop().unwrap()
        }
    }

    fn valid_response_json() -> String {
        serde_json::json!({
            "docType": "NOTE",
            "promptVersion": "v1",
            "data": {"interest_rate": 7.125},
            "evidence": {
                "interest_rate": {"docId": "doc-1", "page": 2, "textHash": "abc", "snippet": "7.125%"}
            },
            "confidence": {"interest_rate": 0.93}
        })
        .to_string()
    }

    #[tokio::test]
    async fn only_extracts_missing_fields() {
        let client = ScriptedClient {
            responses: Mutex::new(vec![Ok(valid_response_json())]),
        };
        let extractor = AiExtractor::new(&client, "v1");
        let mut present = HashSet::new();
        present.insert("loan_amount".to_string());
        present.insert("borrower_name".to_string());
        present.insert("maturity_date".to_string());
        present.insert("origination_date".to_string());

        let candidates = extractor
            .extract(DocType::Note, "doc-1", &["text".to_string()], &present)
            .await
            .unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].key, "interest_rate");
        assert_eq!(candidates[0].source, CandidateSource::AiDoc);
    }

    #[tokio::test]
    async fn skips_call_when_nothing_missing() {
        let client = ScriptedClient {
            responses: Mutex::new(vec![]),
        };
        let extractor = AiExtractor::new(&client, "v1");
        let mut present = HashSet::new();
        for field in schema_fields(DocType::Note) {
            present.insert(field.to_string());
        }
        let candidates = extractor
            .extract(DocType::Note, "doc-1", &["text".to_string()], &present)
            .await
            .unwrap();
        assert!(candidates.is_empty());
    }

    #[tokio::test]
    async fn unknown_field_fails_validation() {
        let bad = serde_json::json!({
            "docType": "NOTE",
            "promptVersion": "v1",
            "data": {"not_a_real_field": "x"},
            "evidence": {"not_a_real_field": {"docId": "doc-1", "page": 1, "textHash": "abc"}}
        })
        .to_string();
        let client = ScriptedClient {
            responses: Mutex::new(vec![Ok(bad)]),
        };
        let extractor = AiExtractor::new(&client, "v1");
        let result = extractor
            .extract(DocType::Note, "doc-1", &["text".to_string()], &HashSet::new())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn network_failure_propagates_as_transient() {
        let client = ScriptedClient {
            responses: Mutex::new(vec![Err(CoreError::Transient("upstream 503".to_string()))]),
        };
        let extractor = AiExtractor::new(&client, "v1");
        let result = extractor
            .extract(DocType::Note, "doc-1", &["text".to_string()], &HashSet::new())
            .await;
        assert!(matches!(result, Err(CoreError::Transient(_))));
    }
}
