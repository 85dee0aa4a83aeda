//! Document Intake Worker: the orchestration that turns one uploaded
//! document into Candidates, lineage, resolved Datapoints and defects.
//!
//! This module defines the narrow repository/OCR ports it needs; concrete
//! implementations (Postgres repository, OCR provider) live in
//! `loanserve-adapters`. The worker itself is a `Worker` impl so it inherits
//! retry/timeout/DLQ/idempotency from the runtime for free.

use crate::audit::{AuditEvent, AuditLedger};
use crate::authority::{self, group_by_key};
use crate::error::CoreError;
use crate::extract::ai::AiExtractor;
use crate::extract::deterministic::extract_deterministic;
use crate::extract::LlmClient;
use crate::lineage::{DocumentReference, LineageTracker};
use crate::runtime::{Worker, WorkItem, WorkResult};
use crate::types::{
    AutofilledFrom, Candidate, CandidateSource, Datapoint, Defect, DefectSeverity, DocType,
    Document, FieldValue, LoanCandidate, LoanStatus,
};
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::str::FromStr;

/// Incoming work item payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntakeWorkPayload {
    pub document_id: String,
    pub file_path: String,
    pub file_type: DocType,
    pub loan_urn: String,
    pub tenant_id: String,
    #[serde(default)]
    pub escrow_instructions: BTreeMap<String, FieldValue>,
    #[serde(default)]
    pub investor_directives: BTreeMap<String, FieldValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntakeOutcome {
    pub loan_id: String,
    pub status: LoanStatus,
    pub decisions: usize,
    pub defects: usize,
}

/// Persistence port. Every method is scoped to a tenant; row-level tenant
/// filtering is the implementor's responsibility.
#[async_trait]
pub trait LoanRepository: Send + Sync {
    async fn get_or_create_loan(&self, tenant_id: &str, loan_id: &str) -> Result<LoanCandidate, CoreError>;
    async fn find_document_by_sha256(&self, tenant_id: &str, sha256: &str) -> Result<Option<Document>, CoreError>;
    async fn create_document(&self, document: Document) -> Result<(), CoreError>;
    async fn get_datapoint(&self, tenant_id: &str, loan_id: &str, key: &str) -> Result<Option<Datapoint>, CoreError>;
    async fn upsert_datapoint(&self, datapoint: Datapoint) -> Result<(), CoreError>;
    async fn save_defect(&self, defect: Defect) -> Result<(), CoreError>;
    async fn set_loan_status(&self, tenant_id: &str, loan_id: &str, status: LoanStatus) -> Result<(), CoreError>;
    async fn load_document_bytes(&self, file_path: &str) -> Result<Vec<u8>, CoreError>;
    async fn load_ocr_text(&self, document_id: &str) -> Result<String, CoreError>;
}

/// OCR port. `extract_key_values` covers the FORMS/TABLES structural path
/// (6 step 3); `extract_text` backs the reflowed-text path C6 needs.
#[async_trait]
pub trait OcrClient: Send + Sync {
    async fn extract_text(&self, bytes: &[u8]) -> Result<String, CoreError>;
    async fn extract_key_values(&self, bytes: &[u8]) -> Result<BTreeMap<String, String>, CoreError>;
}

fn normalize_field_name(raw: &str) -> String {
    raw.trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect::<String>()
        .split('_')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("_")
}

const MISMO_TAGS: &[(&str, &str)] = &[
    ("BaseLoanAmount", "loan_amount"),
    ("NoteRatePercent", "interest_rate"),
    ("IndividualFullName", "borrower_name"),
    ("AddressLineText", "property_address"),
];

fn extract_mismo_fields(xml: &str) -> BTreeMap<String, String> {
    use quick_xml::events::Event;
    use quick_xml::reader::Reader;

    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);
    let mut fields = BTreeMap::new();
    let mut current_tag: Option<String> = None;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                current_tag = MISMO_TAGS
                    .iter()
                    .find(|(tag, _)| *tag == name)
                    .map(|(_, canonical)| canonical.to_string());
            }
            Ok(Event::Text(t)) => {
                if let Some(tag) = current_tag.take() {
                    if let Ok(text) = t.unescape() {
                        fields.insert(tag, text.to_string());
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(_) => break,
            _ => {}
        }
        buf.clear();
    }

    fields
}

fn extract_csv_fields(csv_text: &str) -> BTreeMap<String, String> {
    let mut reader = csv::ReaderBuilder::new().from_reader(csv_text.as_bytes());
    let headers: Vec<String> = reader
        .headers()
        .map(|h| h.iter().map(normalize_field_name).collect())
        .unwrap_or_default();

    let mut fields = BTreeMap::new();
    if let Some(Ok(record)) = reader.records().next() {
        for (header, value) in headers.iter().zip(record.iter()) {
            fields.insert(header.clone(), value.to_string());
        }
    }
    fields
}

fn extract_json_fields(json_text: &str) -> BTreeMap<String, String> {
    let parsed: Value = match serde_json::from_str(json_text) {
        Ok(v) => v,
        Err(_) => return BTreeMap::new(),
    };

    let object = match parsed {
        Value::Array(mut items) if !items.is_empty() => items.remove(0),
        other => other,
    };

    let mut fields = BTreeMap::new();
    if let Value::Object(map) = object {
        for (key, value) in map {
            let rendered = match value {
                Value::String(s) => s,
                Value::Null => continue,
                other => other.to_string(),
            };
            fields.insert(normalize_field_name(&key), rendered);
        }
    }
    fields
}

fn guess_value_kind(raw: &str) -> FieldValue {
    if let Ok(decimal) = Decimal::from_str(raw) {
        return FieldValue::Number(decimal);
    }
    if raw.eq_ignore_ascii_case("true") {
        return FieldValue::Boolean(true);
    }
    if raw.eq_ignore_ascii_case("false") {
        return FieldValue::Boolean(false);
    }
    FieldValue::Text(raw.to_string())
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Confidence thresholds gating the HITL (human-in-the-loop) defect rule
/// (§6/§8): below `hitl_threshold` is an `error`-severity defect, between
/// `hitl_threshold` and `accept_threshold` is a `warning`, at or above
/// `accept_threshold` is no defect at all.
#[derive(Debug, Clone, Copy)]
pub struct ConfidenceThresholds {
    pub accept_threshold: f32,
    pub hitl_threshold: f32,
}

impl Default for ConfidenceThresholds {
    fn default() -> Self {
        Self {
            accept_threshold: 0.80,
            hitl_threshold: 0.60,
        }
    }
}

/// Validation results for a single resolved Datapoint (4 validation table).
fn validate_datapoints(
    datapoints: &BTreeMap<String, Datapoint>,
    loan_id: &str,
    thresholds: &ConfidenceThresholds,
) -> Vec<Defect> {
    let mut defects = Vec::new();
    let now = Utc::now();

    for datapoint in datapoints.values() {
        if datapoint.confidence < thresholds.hitl_threshold {
            defects.push(Defect {
                loan_id: loan_id.to_string(),
                key: datapoint.key.clone(),
                severity: DefectSeverity::Error,
                message: format!(
                    "{} confidence {:.2} is below hitl_threshold {:.2}",
                    datapoint.key, datapoint.confidence, thresholds.hitl_threshold
                ),
                created_at: now,
            });
        } else if datapoint.confidence < thresholds.accept_threshold {
            defects.push(Defect {
                loan_id: loan_id.to_string(),
                key: datapoint.key.clone(),
                severity: DefectSeverity::Warning,
                message: format!(
                    "{} confidence {:.2} is below accept_threshold {:.2}",
                    datapoint.key, datapoint.confidence, thresholds.accept_threshold
                ),
                created_at: now,
            });
        }
    }

    if let Some(amount) = datapoints.get("loan_amount").and_then(|d| d.value.as_number()) {
        if amount <= Decimal::ZERO || amount > Decimal::from(10_000_000) {
            defects.push(Defect {
                loan_id: loan_id.to_string(),
                key: "loan_amount".to_string(),
                severity: DefectSeverity::Error,
                message: format!("loan_amount {amount} is outside (0, 10000000]"),
                created_at: now,
            });
        }
    }

    if let Some(rate) = datapoints.get("interest_rate").and_then(|d| d.value.as_number()) {
        if rate < Decimal::ZERO || rate > Decimal::from(50) {
            defects.push(Defect {
                loan_id: loan_id.to_string(),
                key: "interest_rate".to_string(),
                severity: DefectSeverity::Error,
                message: format!("interest_rate {rate} is outside [0, 50]"),
                created_at: now,
            });
        }
    }

    if let (Some(maturity), Some(origination)) = (
        datapoints.get("maturity_date").and_then(|d| d.value.as_text()),
        datapoints.get("origination_date").and_then(|d| d.value.as_text()),
    ) {
        if maturity <= origination {
            defects.push(Defect {
                loan_id: loan_id.to_string(),
                key: "maturity_date".to_string(),
                severity: DefectSeverity::Error,
                message: format!("maturity_date {maturity} must be after origination_date {origination}"),
                created_at: now,
            });
        }
    }

    if let Some(name) = datapoints.get("borrower_name").and_then(|d| d.value.as_text()) {
        if name.trim().len() < 2 {
            defects.push(Defect {
                loan_id: loan_id.to_string(),
                key: "borrower_name".to_string(),
                severity: DefectSeverity::Warning,
                message: "borrower_name is implausibly short".to_string(),
                created_at: now,
            });
        }
    }

    defects
}

fn autofilled_from_for(source: CandidateSource) -> AutofilledFrom {
    match source {
        CandidateSource::InvestorDirective => AutofilledFrom::InvestorDirective,
        CandidateSource::EscrowInstruction => AutofilledFrom::EscrowInstruction,
        CandidateSource::ManualEntry => AutofilledFrom::User,
        CandidateSource::VendorApi => AutofilledFrom::Vendor,
        CandidateSource::DocumentParse | CandidateSource::AiDoc | CandidateSource::Ocr => AutofilledFrom::Document,
    }
}

fn directive_candidates(directives: &BTreeMap<String, FieldValue>, source: CandidateSource) -> Vec<Candidate> {
    let now = Utc::now();
    directives
        .iter()
        .map(|(key, value)| Candidate {
            key: key.clone(),
            value: value.clone(),
            source,
            confidence: 1.0,
            doc_type: None,
            doc_id: None,
            page: None,
            evidence: None,
            extractor_version: None,
            timestamp: now,
        })
        .collect()
}

fn raw_structured_candidates(doc_type: DocType, doc_id: &str, fields: &BTreeMap<String, String>) -> Vec<Candidate> {
    let now = Utc::now();
    fields
        .iter()
        .map(|(key, raw_value)| Candidate {
            key: key.clone(),
            value: guess_value_kind(raw_value),
            source: CandidateSource::DocumentParse,
            confidence: 0.8,
            doc_type: Some(doc_type),
            doc_id: Some(doc_id.to_string()),
            page: None,
            evidence: Some(crate::types::Evidence {
                text_hash: sha256_hex(raw_value.as_bytes()),
                snippet: Some(raw_value.clone()),
            }),
            extractor_version: Some("structured-raw-v1".to_string()),
            timestamp: now,
        })
        .collect()
}

/// Document Intake Worker. `R` is the persistence port, `O` the OCR port, `A`
/// the LLM client the AI extractor uses.
pub struct DocumentIntakeWorker<R: LoanRepository, O: OcrClient, A: LlmClient> {
    repository: R,
    ocr: O,
    llm_client: A,
    prompt_version: String,
    thresholds: ConfidenceThresholds,
}

impl<R: LoanRepository, O: OcrClient, A: LlmClient> DocumentIntakeWorker<R, O, A> {
    pub fn new(
        repository: R,
        ocr: O,
        llm_client: A,
        prompt_version: impl Into<String>,
        thresholds: ConfidenceThresholds,
    ) -> Self {
        Self {
            repository,
            ocr,
            llm_client,
            prompt_version: prompt_version.into(),
            thresholds,
        }
    }

    async fn raw_fields_for(&self, payload: &IntakeWorkPayload, bytes: &[u8], ocr_text: &str) -> Result<BTreeMap<String, String>, CoreError> {
        match payload.file_type {
            DocType::Csv => Ok(extract_csv_fields(&String::from_utf8_lossy(bytes))),
            DocType::Json => Ok(extract_json_fields(&String::from_utf8_lossy(bytes))),
            DocType::Mismo => Ok(extract_mismo_fields(&String::from_utf8_lossy(bytes))),
            DocType::Pdf => self.ocr.extract_key_values(bytes).await,
            _ => Ok(BTreeMap::new()),
        }
    }

    pub async fn run(
        &self,
        audit: &mut AuditLedger,
        lineage: &mut LineageTracker,
        payload: IntakeWorkPayload,
    ) -> Result<IntakeOutcome, CoreError> {
        let loan = self
            .repository
            .get_or_create_loan(&payload.tenant_id, &payload.loan_urn)
            .await?;

        let bytes = self.repository.load_document_bytes(&payload.file_path).await?;
        let sha256 = sha256_hex(&bytes);

        if self
            .repository
            .find_document_by_sha256(&payload.tenant_id, &sha256)
            .await?
            .is_none()
        {
            self.repository
                .create_document(Document {
                    tenant_id: payload.tenant_id.clone(),
                    doc_id: payload.document_id.clone(),
                    loan_id: loan.loan_id.clone(),
                    storage_uri: payload.file_path.clone(),
                    sha256: sha256.clone(),
                    doc_type: payload.file_type,
                    page_count: 0,
                    created_at: Utc::now(),
                })
                .await?;
        }

        let ocr_text = match payload.file_type {
            DocType::Pdf => self.ocr.extract_text(&bytes).await?,
            _ => self.repository.load_ocr_text(&payload.document_id).await.unwrap_or_default(),
        };

        let raw_fields = self.raw_fields_for(&payload, &bytes, &ocr_text).await?;
        let mut candidates = raw_structured_candidates(payload.file_type, &payload.document_id, &raw_fields);
        candidates.extend(extract_deterministic(payload.file_type, &payload.document_id, &ocr_text));

        let already_present: HashSet<String> = candidates.iter().map(|c| c.key.clone()).collect();
        let ai_extractor = AiExtractor::new(&self.llm_client, self.prompt_version.clone());
        let ai_candidates = ai_extractor
            .extract(payload.file_type, &payload.document_id, &[ocr_text.clone()], &already_present)
            .await
            .unwrap_or_default();
        candidates.extend(ai_candidates);

        candidates.extend(directive_candidates(&payload.investor_directives, CandidateSource::InvestorDirective));

        let directive_keys: HashSet<String> = payload.investor_directives.keys().cloned().collect();
        let escrow_not_overridden: BTreeMap<String, FieldValue> = payload
            .escrow_instructions
            .iter()
            .filter(|(key, _)| !directive_keys.contains(*key))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        candidates.extend(directive_candidates(&escrow_not_overridden, CandidateSource::EscrowInstruction));

        for candidate in &candidates {
            lineage.record(
                candidate.key.clone(),
                candidate.value.to_string(),
                candidate.source.as_str().to_string(),
                candidate.doc_id.clone(),
                candidate.extractor_version.clone(),
                None,
                candidate.evidence.as_ref().map(|e| {
                    DocumentReference::new(candidate.doc_id.clone().unwrap_or_default(), e.snippet.clone().unwrap_or_default())
                }),
                vec![],
            )?;
        }

        let now = Utc::now();
        let groups = group_by_key(candidates);
        let mut resolved_datapoints: BTreeMap<String, Datapoint> = BTreeMap::new();
        let mut decisions = 0usize;

        for (key, group) in groups {
            let Some(decision) = authority::resolve(&key, &group, now) else {
                continue;
            };
            decisions += 1;

            audit.append(AuditEvent::new(
                payload.tenant_id.clone(),
                "AI_PIPELINE.AUTHORITY_DECISION",
                "authority_matrix",
                loan.urn(),
                serde_json::to_value(&decision)?,
            ));

            let stored = self
                .repository
                .get_datapoint(&payload.tenant_id, &loan.loan_id, &key)
                .await?;
            let should_write = match &stored {
                Some(existing) => decision.authority_priority >= existing.authority_priority,
                None => true,
            };

            if !should_write {
                continue;
            }

            let source_candidate = group.iter().find(|c| c.value == decision.winner_value && c.source == decision.winner);

            let datapoint = Datapoint {
                tenant_id: payload.tenant_id.clone(),
                loan_id: loan.loan_id.clone(),
                key: key.clone(),
                value: decision.winner_value.clone(),
                normalized_value: Some(decision.winner_value.clone()),
                confidence: decision.confidence,
                ingest_source: decision.winner,
                autofilled_from: autofilled_from_for(decision.winner),
                evidence_doc_id: source_candidate.and_then(|c| c.doc_id.clone()),
                evidence_page: source_candidate.and_then(|c| c.page),
                evidence_text_hash: source_candidate.and_then(|c| c.evidence.as_ref()).map(|e| e.text_hash.clone()),
                extractor_version: source_candidate.and_then(|c| c.extractor_version.clone()),
                prompt_version: None,
                authority_priority: decision.authority_priority,
                updated_at: now,
            };

            self.repository.upsert_datapoint(datapoint.clone()).await?;
            resolved_datapoints.insert(key, datapoint);
        }

        let defects = validate_datapoints(&resolved_datapoints, &loan.loan_id, &self.thresholds);
        for defect in &defects {
            self.repository.save_defect(defect.clone()).await?;
        }

        let status = if defects.iter().any(|d| d.severity == DefectSeverity::Error) {
            LoanStatus::Conflicts
        } else {
            LoanStatus::Validated
        };
        self.repository
            .set_loan_status(&payload.tenant_id, &loan.loan_id, status)
            .await?;

        Ok(IntakeOutcome {
            loan_id: loan.loan_id,
            status,
            decisions,
            defects: defects.len(),
        })
    }
}

#[async_trait]
impl<R: LoanRepository, O: OcrClient, A: LlmClient> Worker for DocumentIntakeWorker<R, O, A> {
    fn name(&self) -> &str {
        "document_intake_worker"
    }

    async fn execute(&self, payload: &Value, _work_item: &WorkItem, _execution_id: &str) -> WorkResult {
        let intake_payload: IntakeWorkPayload = match serde_json::from_value(payload.clone()) {
            Ok(p) => p,
            Err(e) => return WorkResult::terminal_failure(format!("malformed intake payload: {e}")),
        };

        let mut audit = AuditLedger::new();
        let mut lineage = LineageTracker::new();

        match self.run(&mut audit, &mut lineage, intake_payload).await {
            Ok(outcome) => match serde_json::to_value(&outcome) {
                Ok(value) => WorkResult::ok(value),
                Err(e) => WorkResult::terminal_failure(format!("failed to serialize intake outcome: {e}")),
            },
            Err(err) => {
                if err.is_retryable() {
                    WorkResult::retryable_failure(err.to_string())
                } else {
                    WorkResult::terminal_failure(err.to_string())
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorClass;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[test]
    fn normalize_field_name_lowercases_and_snakes() {
        assert_eq!(normalize_field_name("Loan Amount"), "loan_amount");
        assert_eq!(normalize_field_name("BaseLoanAmount"), "baseloanamount");
    }

    #[test]
    fn extract_csv_fields_normalizes_headers() {
        let csv_text = "Loan Amount,Borrower Name\n250000,Jane Doe\n";
        let fields = extract_csv_fields(csv_text);
        assert_eq!(fields.get("loan_amount").map(|s| s.as_str()), Some("250000"));
        assert_eq!(fields.get("borrower_name").map(|s| s.as_str()), Some("Jane Doe"));
    }

    #[test]
    fn extract_json_fields_takes_first_array_element() {
        let json_text = r#"[{"loanAmount": "250000"}, {"loanAmount": "999"}]"#;
        let fields = extract_json_fields(json_text);
        assert_eq!(fields.get("loanamount").map(|s| s.as_str()), Some("250000"));
    }

    #[test]
    fn extract_mismo_fields_reads_canonical_tags() {
        let xml = "<LOAN><BaseLoanAmount>250000</BaseLoanAmount><NoteRatePercent>7.125</NoteRatePercent></LOAN>";
        let fields = extract_mismo_fields(xml);
        assert_eq!(fields.get("loan_amount").map(|s| s.as_str()), Some("250000"));
        assert_eq!(fields.get("interest_rate").map(|s| s.as_str()), Some("7.125"));
    }

    #[test]
    fn validate_datapoints_flags_out_of_range_amount() {
        let mut datapoints = BTreeMap::new();
        datapoints.insert(
            "loan_amount".to_string(),
            Datapoint {
                tenant_id: "tenant-1".to_string(),
                loan_id: "loan-1".to_string(),
                key: "loan_amount".to_string(),
                value: FieldValue::Number(Decimal::from(20_000_000)),
                normalized_value: None,
                confidence: 1.0,
                ingest_source: CandidateSource::DocumentParse,
                autofilled_from: AutofilledFrom::Document,
                evidence_doc_id: None,
                evidence_page: None,
                evidence_text_hash: None,
                extractor_version: None,
                prompt_version: None,
                authority_priority: 600.0,
                updated_at: Utc::now(),
            },
        );
        let defects = validate_datapoints(&datapoints, "loan-1", &ConfidenceThresholds::default());
        assert_eq!(defects.len(), 1);
        assert_eq!(defects[0].severity, DefectSeverity::Error);
    }

    fn confidence_datapoint(confidence: f32) -> Datapoint {
        Datapoint {
            tenant_id: "tenant-1".to_string(),
            loan_id: "loan-1".to_string(),
            key: "borrower_name".to_string(),
            value: FieldValue::Text("Jane Doe".to_string()),
            normalized_value: None,
            confidence,
            ingest_source: CandidateSource::AiDoc,
            autofilled_from: AutofilledFrom::Document,
            evidence_doc_id: None,
            evidence_page: None,
            evidence_text_hash: None,
            extractor_version: None,
            prompt_version: None,
            authority_priority: 500.0,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn confidence_below_hitl_threshold_is_an_error_defect() {
        let mut datapoints = BTreeMap::new();
        datapoints.insert("borrower_name".to_string(), confidence_datapoint(0.59));
        let defects = validate_datapoints(&datapoints, "loan-1", &ConfidenceThresholds::default());
        assert_eq!(defects.len(), 1);
        assert_eq!(defects[0].severity, DefectSeverity::Error);
    }

    #[test]
    fn confidence_between_thresholds_is_a_warning_defect() {
        let mut datapoints = BTreeMap::new();
        datapoints.insert("borrower_name".to_string(), confidence_datapoint(0.79));
        let defects = validate_datapoints(&datapoints, "loan-1", &ConfidenceThresholds::default());
        assert_eq!(defects.len(), 1);
        assert_eq!(defects[0].severity, DefectSeverity::Warning);
    }

    #[test]
    fn confidence_at_or_above_accept_threshold_has_no_defect() {
        let mut datapoints = BTreeMap::new();
        datapoints.insert("borrower_name".to_string(), confidence_datapoint(0.81));
        let defects = validate_datapoints(&datapoints, "loan-1", &ConfidenceThresholds::default());
        assert!(defects.is_empty());
    }

    struct FakeRepository {
        loans: Mutex<HashMap<String, LoanCandidate>>,
        documents: Mutex<HashMap<String, Document>>,
        datapoints: Mutex<HashMap<(String, String), Datapoint>>,
        defects: Mutex<Vec<Defect>>,
        bytes: Vec<u8>,
    }

    #[async_trait]
    impl LoanRepository for FakeRepository {
        async fn get_or_create_loan(&self, tenant_id: &str, loan_id: &str) -> Result<LoanCandidate, CoreError> {
            let mut loans = self.loans.lock().unwrap();
            Ok(loans
                .entry(loan_id.to_string())
                .or_insert_with(|| LoanCandidate::new(tenant_id, loan_id))
                .clone())
        }

        async fn find_document_by_sha256(&self, _tenant_id: &str, sha256: &str) -> Result<Option<Document>, CoreError> {
            Ok(self.documents.lock().unwrap().get(sha256).cloned())
        }

        async fn create_document(&self, document: Document) -> Result<(), CoreError> {
            self.documents.lock().unwrap().insert(document.sha256.clone(), document);
            Ok(())
        }

        async fn get_datapoint(&self, _tenant_id: &str, loan_id: &str, key: &str) -> Result<Option<Datapoint>, CoreError> {
            Ok(self.datapoints.lock().unwrap().get(&(loan_id.to_string(), key.to_string())).cloned())
        }

        async fn upsert_datapoint(&self, datapoint: Datapoint) -> Result<(), CoreError> {
            self.datapoints
                .lock()
                .unwrap()
                .insert((datapoint.loan_id.clone(), datapoint.key.clone()), datapoint);
            Ok(())
        }

        async fn save_defect(&self, defect: Defect) -> Result<(), CoreError> {
            self.defects.lock().unwrap().push(defect);
            Ok(())
        }

        async fn set_loan_status(&self, tenant_id: &str, loan_id: &str, status: LoanStatus) -> Result<(), CoreError> {
            let mut loans = self.loans.lock().unwrap();
            if let Some(loan) = loans.get_mut(loan_id) {
                loan.status = status;
            } else {
                let mut loan = LoanCandidate::new(tenant_id, loan_id);
                loan.status = status;
                loans.insert(loan_id.to_string(), loan);
            }
            Ok(())
        }

        async fn load_document_bytes(&self, _file_path: &str) -> Result<Vec<u8>, CoreError> {
            Ok(self.bytes.clone())
        }

        async fn load_ocr_text(&self, _document_id: &str) -> Result<String, CoreError> {
            Ok(String::new())
        }
    }

    struct NoopOcr;

    #[async_trait]
    impl OcrClient for NoopOcr {
        async fn extract_text(&self, _bytes: &[u8]) -> Result<String, CoreError> {
            Ok(String::new())
        }

        async fn extract_key_values(&self, _bytes: &[u8]) -> Result<BTreeMap<String, String>, CoreError> {
            Ok(BTreeMap::new())
        }
    }

    struct NoopLlm;

    #[async_trait]
    impl LlmClient for NoopLlm {
        async fn complete(&self, _prompt: &str, _prompt_version: &str) -> Result<String, CoreError> {
            Err(CoreError::Transient("no llm configured in test".to_string()))
        }
    }

    #[tokio::test]
    async fn csv_intake_resolves_datapoints_and_validates_status() {
        let repository = FakeRepository {
            loans: Mutex::new(HashMap::new()),
            documents: Mutex::new(HashMap::new()),
            datapoints: Mutex::new(HashMap::new()),
            defects: Mutex::new(Vec::new()),
            bytes: b"Loan Amount,Borrower Name\n250000,Jane Doe\n".to_vec(),
        };
        let worker = DocumentIntakeWorker::new(repository, NoopOcr, NoopLlm, "v1", ConfidenceThresholds::default());

        let payload = IntakeWorkPayload {
            document_id: "doc-1".to_string(),
            file_path: "s3://bucket/doc-1.csv".to_string(),
            file_type: DocType::Csv,
            loan_urn: "loan-1".to_string(),
            tenant_id: "tenant-1".to_string(),
            escrow_instructions: BTreeMap::new(),
            investor_directives: BTreeMap::new(),
        };

        let mut audit = AuditLedger::new();
        let mut lineage = LineageTracker::new();
        let outcome = worker.run(&mut audit, &mut lineage, payload).await.unwrap();

        assert_eq!(outcome.status, LoanStatus::Validated);
        assert!(outcome.decisions >= 2);
        assert!(!audit.entries().is_empty());
    }

    #[tokio::test]
    async fn investor_directive_overrides_document_parse() {
        let repository = FakeRepository {
            loans: Mutex::new(HashMap::new()),
            documents: Mutex::new(HashMap::new()),
            datapoints: Mutex::new(HashMap::new()),
            defects: Mutex::new(Vec::new()),
            bytes: b"Loan Amount\n250000\n".to_vec(),
        };
        let worker = DocumentIntakeWorker::new(repository, NoopOcr, NoopLlm, "v1", ConfidenceThresholds::default());

        let mut directives = BTreeMap::new();
        directives.insert("loan_amount".to_string(), FieldValue::Number(Decimal::from(300_000)));

        let payload = IntakeWorkPayload {
            document_id: "doc-1".to_string(),
            file_path: "s3://bucket/doc-1.csv".to_string(),
            file_type: DocType::Csv,
            loan_urn: "loan-1".to_string(),
            tenant_id: "tenant-1".to_string(),
            escrow_instructions: BTreeMap::new(),
            investor_directives: directives,
        };

        let mut audit = AuditLedger::new();
        let mut lineage = LineageTracker::new();
        let outcome = worker.run(&mut audit, &mut lineage, payload).await.unwrap();
        let stored = worker
            .repository
            .get_datapoint("tenant-1", &outcome.loan_id, "loan_amount")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.value, FieldValue::Number(Decimal::from(300_000)));
        assert_eq!(stored.ingest_source, CandidateSource::InvestorDirective);
    }
}
