//! Core data model: loan candidates, documents, candidates, datapoints,
//! and the vendor cache/audit rows shared across adapters.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Lifecycle of a loan being ingested.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LoanStatus {
    Ingesting,
    Validated,
    Conflicts,
    Accepted,
    Rejected,
}

/// A loan candidate owns its documents, datapoints, candidates, lineage and exports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoanCandidate {
    pub tenant_id: String,
    pub loan_id: String,
    pub status: LoanStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LoanCandidate {
    pub fn urn(&self) -> String {
        format!("urn:loan:{}", self.loan_id)
    }

    pub fn new(tenant_id: impl Into<String>, loan_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            tenant_id: tenant_id.into(),
            loan_id: loan_id.into(),
            status: LoanStatus::Ingesting,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Recognized document types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum DocType {
    Note,
    Cd,
    Hoi,
    Flood,
    Appraisal,
    Deed,
    Le,
    Mismo,
    Csv,
    Json,
    Pdf,
}

impl DocType {
    pub fn as_str(self) -> &'static str {
        match self {
            DocType::Note => "NOTE",
            DocType::Cd => "CD",
            DocType::Hoi => "HOI",
            DocType::Flood => "FLOOD",
            DocType::Appraisal => "APPRAISAL",
            DocType::Deed => "DEED",
            DocType::Le => "LE",
            DocType::Mismo => "MISMO",
            DocType::Csv => "CSV",
            DocType::Json => "JSON",
            DocType::Pdf => "PDF",
        }
    }
}

/// Owned by a LoanCandidate; the SHA-256 of bytes is the idempotency key for re-uploads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub tenant_id: String,
    pub doc_id: String,
    pub loan_id: String,
    pub storage_uri: String,
    pub sha256: String,
    pub doc_type: DocType,
    pub page_count: u32,
    pub created_at: DateTime<Utc>,
}

/// Where a proposed value came from, ranked by the authority matrix.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CandidateSource {
    InvestorDirective,
    EscrowInstruction,
    ManualEntry,
    VendorApi,
    DocumentParse,
    AiDoc,
    Ocr,
}

impl CandidateSource {
    pub fn as_str(self) -> &'static str {
        match self {
            CandidateSource::InvestorDirective => "investor_directive",
            CandidateSource::EscrowInstruction => "escrow_instruction",
            CandidateSource::ManualEntry => "manual_entry",
            CandidateSource::VendorApi => "vendor_api",
            CandidateSource::DocumentParse => "document_parse",
            CandidateSource::AiDoc => "ai_doc",
            CandidateSource::Ocr => "ocr",
        }
    }
}

/// What ultimately supplied the value behind a Datapoint, a slightly
/// wider vocabulary than CandidateSource because it also covers pass-through payloads.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AutofilledFrom {
    InvestorDirective,
    EscrowInstruction,
    Document,
    Vendor,
    User,
    Payload,
}

/// A JSON-ish scalar, narrow enough to cover every extracted/overlaid field value
/// without resorting to a raw `serde_json::Value` bag throughout the core:
/// "replace dynamic any/object payloads with tagged sum types plus a narrow JSON
/// value type at the edges").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum FieldValue {
    Text(String),
    Number(Decimal),
    Boolean(bool),
    Date(String),
    Null,
}

impl FieldValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<Decimal> {
        match self {
            FieldValue::Number(d) => Some(*d),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }
}

impl std::fmt::Display for FieldValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldValue::Text(s) => write!(f, "{s}"),
            FieldValue::Number(d) => write!(f, "{d}"),
            FieldValue::Boolean(b) => write!(f, "{b}"),
            FieldValue::Date(d) => write!(f, "{d}"),
            FieldValue::Null => write!(f, "null"),
        }
    }
}

/// Evidence snippet backing a candidate value prior to lineage assembly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evidence {
    pub text_hash: String,
    pub snippet: Option<String>,
}

/// A proposed value for a datapoint, prior to resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub key: String,
    pub value: FieldValue,
    pub source: CandidateSource,
    /// 0.0..=1.0
    pub confidence: f32,
    pub doc_type: Option<DocType>,
    pub doc_id: Option<String>,
    pub page: Option<u32>,
    pub evidence: Option<Evidence>,
    pub extractor_version: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Candidate {
    /// Stable key used to identify a candidate inside `conflicting_sources` lists:
    /// `<source>_<unix millis>`.
    pub fn source_key(&self) -> String {
        format!("{}_{}", self.source.as_str(), self.timestamp.timestamp_millis())
    }
}

/// The currently authoritative value for `(loan_id, key)`. Only one row
/// exists per key; it is replaced only when a new candidate wins the authority matrix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Datapoint {
    pub tenant_id: String,
    pub loan_id: String,
    pub key: String,
    pub value: FieldValue,
    pub normalized_value: Option<FieldValue>,
    pub confidence: f32,
    pub ingest_source: CandidateSource,
    pub autofilled_from: AutofilledFrom,
    pub evidence_doc_id: Option<String>,
    pub evidence_page: Option<u32>,
    pub evidence_text_hash: Option<String>,
    pub extractor_version: Option<String>,
    pub prompt_version: Option<String>,
    pub authority_priority: f64,
    pub updated_at: DateTime<Utc>,
}

/// Severity of a validation defect: below the HITL threshold is `error`, between the HITL and accept thresholds is `warning`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum DefectSeverity {
    Warning,
    Error,
}

/// A recorded validation failure for a resolved datapoint (4: "failed
/// validation produces a defect record, not a silent rewrite").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Defect {
    pub loan_id: String,
    pub key: String,
    pub severity: DefectSeverity,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// Cache row keyed by `(tenant_id, vendor, key)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VendorCacheEntry {
    pub tenant_id: String,
    pub vendor: String,
    pub key: String,
    pub payload: serde_json::Value,
    pub expires_at: DateTime<Utc>,
}

/// Append-only per-call audit row for vendor HTTP traffic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VendorAuditEntry {
    pub tenant_id: String,
    pub vendor: String,
    pub endpoint: String,
    pub status: Option<u16>,
    pub request: serde_json::Value,
    pub response: serde_json::Value,
    pub latency_ms: u64,
    pub timestamp: DateTime<Utc>,
}

/// Directive overlays applied during intake (6 step 5), keyed by canonical field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectiveOverlay {
    pub key: String,
    pub value: FieldValue,
}

pub type DirectiveMap = BTreeMap<String, FieldValue>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loan_urn_format() {
        let loan = LoanCandidate::new("tenant-1", "abc123");
        assert_eq!(loan.urn(), "urn:loan:abc123");
        assert_eq!(loan.status, LoanStatus::Ingesting);
    }

    #[test]
    fn source_key_is_stable_and_sortable() {
        let candidate = Candidate {
            key: "loan_amount".to_string(),
            value: FieldValue::Number(Decimal::new(250_000, 0)),
            source: CandidateSource::DocumentParse,
            confidence: 0.9,
            doc_type: Some(DocType::Note),
            doc_id: Some("doc-1".to_string()),
            page: Some(1),
            evidence: None,
            extractor_version: Some("v1".to_string()),
            timestamp: Utc::now(),
        };
        assert!(candidate.source_key().starts_with("document_parse_"));
    }

    #[test]
    fn field_value_display() {
        assert_eq!(FieldValue::Boolean(true).to_string(), "true");
        assert_eq!(FieldValue::Null.to_string(), "null");
    }
}
