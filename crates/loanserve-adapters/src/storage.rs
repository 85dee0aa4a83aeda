//! Storage adapters: object store and the Postgres-backed `LoanRepository`.
//!
//! `PgPoolOptions` builds the pool, `CREATE TABLE IF NOT EXISTS` bootstraps
//! the schema on first connect, and `Row::try_get` maps each column to a
//! domain error on failure.

use crate::vendor::VendorStore;
use async_trait::async_trait;
use chrono::Utc;
use loanserve_core::error::CoreError;
use loanserve_core::intake::LoanRepository;
use loanserve_core::types::{Datapoint, Defect, DefectSeverity, Document, LoanCandidate, LoanStatus, VendorAuditEntry, VendorCacheEntry};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::sync::Mutex;

/// Narrow object-store port used for document bytes, CSV reports and export
/// artifacts. Production deployments back this with whatever bucket the
/// operator already runs; a local filesystem implementation covers
/// self-hosted and test deployments without pulling in a cloud SDK the rest
/// of this stack has no other use for.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, uri: &str, bytes: Vec<u8>) -> Result<(), CoreError>;
    async fn get(&self, uri: &str) -> Result<Vec<u8>, CoreError>;
}

#[derive(Debug, Default)]
pub struct InMemoryObjectStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn put(&self, uri: &str, bytes: Vec<u8>) -> Result<(), CoreError> {
        self.objects.lock().unwrap().insert(uri.to_string(), bytes);
        Ok(())
    }

    async fn get(&self, uri: &str) -> Result<Vec<u8>, CoreError> {
        self.objects
            .lock()
            .unwrap()
            .get(uri)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("object {uri} not found")))
    }
}

pub struct LocalFsObjectStore {
    base_dir: std::path::PathBuf,
}

impl LocalFsObjectStore {
    pub fn new(base_dir: impl Into<std::path::PathBuf>) -> Self {
        Self { base_dir: base_dir.into() }
    }

    fn path_for(&self, uri: &str) -> std::path::PathBuf {
        self.base_dir.join(uri.trim_start_matches('/'))
    }
}

#[async_trait]
impl ObjectStore for LocalFsObjectStore {
    async fn put(&self, uri: &str, bytes: Vec<u8>) -> Result<(), CoreError> {
        let path = self.path_for(uri);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| CoreError::Transient(format!("object store mkdir failed: {e}")))?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| CoreError::Transient(format!("object store write failed: {e}")))
    }

    async fn get(&self, uri: &str) -> Result<Vec<u8>, CoreError> {
        tokio::fs::read(self.path_for(uri))
            .await
            .map_err(|e| CoreError::NotFound(format!("object {uri} not found: {e}")))
    }
}

/// In-memory `LoanRepository`, used in tests and as the default for local
/// development without a database.
#[derive(Default)]
pub struct InMemoryLoanRepository {
    loans: Mutex<HashMap<(String, String), LoanCandidate>>,
    documents_by_sha: Mutex<HashMap<(String, String), Document>>,
    datapoints: Mutex<HashMap<(String, String, String), Datapoint>>,
    defects: Mutex<Vec<Defect>>,
    ocr_cache: Mutex<HashMap<String, String>>,
    bytes: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemoryLoanRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_bytes(&self, file_path: &str, bytes: Vec<u8>) {
        self.bytes.lock().unwrap().insert(file_path.to_string(), bytes);
    }

    pub fn seed_ocr_text(&self, document_id: &str, text: &str) {
        self.ocr_cache.lock().unwrap().insert(document_id.to_string(), text.to_string());
    }
}

#[async_trait]
impl LoanRepository for InMemoryLoanRepository {
    async fn get_or_create_loan(&self, tenant_id: &str, loan_id: &str) -> Result<LoanCandidate, CoreError> {
        let mut loans = self.loans.lock().unwrap();
        Ok(loans
            .entry((tenant_id.to_string(), loan_id.to_string()))
            .or_insert_with(|| LoanCandidate::new(tenant_id, loan_id))
            .clone())
    }

    async fn find_document_by_sha256(&self, tenant_id: &str, sha256: &str) -> Result<Option<Document>, CoreError> {
        Ok(self
            .documents_by_sha
            .lock()
            .unwrap()
            .get(&(tenant_id.to_string(), sha256.to_string()))
            .cloned())
    }

    async fn create_document(&self, document: Document) -> Result<(), CoreError> {
        self.documents_by_sha
            .lock()
            .unwrap()
            .insert((document.tenant_id.clone(), document.sha256.clone()), document);
        Ok(())
    }

    async fn get_datapoint(&self, tenant_id: &str, loan_id: &str, key: &str) -> Result<Option<Datapoint>, CoreError> {
        Ok(self
            .datapoints
            .lock()
            .unwrap()
            .get(&(tenant_id.to_string(), loan_id.to_string(), key.to_string()))
            .cloned())
    }

    async fn upsert_datapoint(&self, datapoint: Datapoint) -> Result<(), CoreError> {
        self.datapoints.lock().unwrap().insert(
            (datapoint.tenant_id.clone(), datapoint.loan_id.clone(), datapoint.key.clone()),
            datapoint,
        );
        Ok(())
    }

    async fn save_defect(&self, defect: Defect) -> Result<(), CoreError> {
        self.defects.lock().unwrap().push(defect);
        Ok(())
    }

    async fn set_loan_status(&self, tenant_id: &str, loan_id: &str, status: LoanStatus) -> Result<(), CoreError> {
        let mut loans = self.loans.lock().unwrap();
        let entry = loans
            .entry((tenant_id.to_string(), loan_id.to_string()))
            .or_insert_with(|| LoanCandidate::new(tenant_id, loan_id));
        entry.status = status;
        Ok(())
    }

    async fn load_document_bytes(&self, file_path: &str) -> Result<Vec<u8>, CoreError> {
        self.bytes
            .lock()
            .unwrap()
            .get(file_path)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("document bytes not found at {file_path}")))
    }

    async fn load_ocr_text(&self, document_id: &str) -> Result<String, CoreError> {
        Ok(self.ocr_cache.lock().unwrap().get(document_id).cloned().unwrap_or_default())
    }
}

/// Postgres-backed `LoanRepository`.
pub struct PgLoanRepository {
    pool: PgPool,
}

impl PgLoanRepository {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, CoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await
            .map_err(|e| CoreError::Transient(format!("postgres connect failed: {e}")))?;
        let repository = Self { pool };
        repository.ensure_schema().await?;
        Ok(repository)
    }

    async fn ensure_schema(&self) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS loan_candidates (
                tenant_id TEXT NOT NULL,
                loan_id TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (tenant_id, loan_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::Fatal(format!("schema create failed for loan_candidates: {e}")))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                tenant_id TEXT NOT NULL,
                doc_id TEXT NOT NULL,
                loan_id TEXT NOT NULL,
                storage_uri TEXT NOT NULL,
                sha256 TEXT NOT NULL,
                doc_type TEXT NOT NULL,
                page_count INT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (tenant_id, doc_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::Fatal(format!("schema create failed for documents: {e}")))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_documents_sha256 ON documents (tenant_id, sha256)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::Fatal(format!("index create failed for documents: {e}")))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS datapoints (
                tenant_id TEXT NOT NULL,
                loan_id TEXT NOT NULL,
                key TEXT NOT NULL,
                value JSONB NOT NULL,
                normalized_value JSONB NULL,
                confidence REAL NOT NULL,
                ingest_source TEXT NOT NULL,
                autofilled_from TEXT NOT NULL,
                evidence_doc_id TEXT NULL,
                evidence_page INT NULL,
                evidence_text_hash TEXT NULL,
                extractor_version TEXT NULL,
                prompt_version TEXT NULL,
                authority_priority DOUBLE PRECISION NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (tenant_id, loan_id, key)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::Fatal(format!("schema create failed for datapoints: {e}")))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS defects (
                loan_id TEXT NOT NULL,
                key TEXT NOT NULL,
                severity TEXT NOT NULL,
                message TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::Fatal(format!("schema create failed for defects: {e}")))?;

        Ok(())
    }
}

fn severity_to_str(severity: DefectSeverity) -> &'static str {
    match severity {
        DefectSeverity::Warning => "warning",
        DefectSeverity::Error => "error",
    }
}

fn parse_severity(value: &str) -> Result<DefectSeverity, CoreError> {
    match value {
        "warning" => Ok(DefectSeverity::Warning),
        "error" => Ok(DefectSeverity::Error),
        other => Err(CoreError::Integrity(format!("unknown defect severity '{other}' in postgres"))),
    }
}

#[async_trait]
impl LoanRepository for PgLoanRepository {
    async fn get_or_create_loan(&self, tenant_id: &str, loan_id: &str) -> Result<LoanCandidate, CoreError> {
        if let Some(row) = sqlx::query(
            "SELECT tenant_id, loan_id, status, created_at, updated_at FROM loan_candidates WHERE tenant_id = $1 AND loan_id = $2",
        )
        .bind(tenant_id)
        .bind(loan_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CoreError::Transient(format!("postgres select failed: {e}")))?
        {
            let status_str: String = row
                .try_get("status")
                .map_err(|e| CoreError::Integrity(format!("postgres decode status failed: {e}")))?;
            return Ok(LoanCandidate {
                tenant_id: row
                    .try_get("tenant_id")
                    .map_err(|e| CoreError::Integrity(format!("postgres decode tenant_id failed: {e}")))?,
                loan_id: row
                    .try_get("loan_id")
                    .map_err(|e| CoreError::Integrity(format!("postgres decode loan_id failed: {e}")))?,
                status: parse_loan_status(&status_str)?,
                created_at: row
                    .try_get("created_at")
                    .map_err(|e| CoreError::Integrity(format!("postgres decode created_at failed: {e}")))?,
                updated_at: row
                    .try_get("updated_at")
                    .map_err(|e| CoreError::Integrity(format!("postgres decode updated_at failed: {e}")))?,
            });
        }

        let loan = LoanCandidate::new(tenant_id, loan_id);
        sqlx::query(
            "INSERT INTO loan_candidates (tenant_id, loan_id, status, created_at, updated_at) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(&loan.tenant_id)
        .bind(&loan.loan_id)
        .bind(loan_status_to_str(loan.status))
        .bind(loan.created_at)
        .bind(loan.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::Transient(format!("postgres insert failed: {e}")))?;

        Ok(loan)
    }

    async fn find_document_by_sha256(&self, tenant_id: &str, sha256: &str) -> Result<Option<Document>, CoreError> {
        let row = sqlx::query(
            "SELECT tenant_id, doc_id, loan_id, storage_uri, sha256, doc_type, page_count, created_at FROM documents WHERE tenant_id = $1 AND sha256 = $2",
        )
        .bind(tenant_id)
        .bind(sha256)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CoreError::Transient(format!("postgres select failed: {e}")))?;

        let Some(row) = row else { return Ok(None) };
        let doc_type_str: String = row
            .try_get("doc_type")
            .map_err(|e| CoreError::Integrity(format!("postgres decode doc_type failed: {e}")))?;

        Ok(Some(Document {
            tenant_id: row.try_get("tenant_id").map_err(|e| CoreError::Integrity(e.to_string()))?,
            doc_id: row.try_get("doc_id").map_err(|e| CoreError::Integrity(e.to_string()))?,
            loan_id: row.try_get("loan_id").map_err(|e| CoreError::Integrity(e.to_string()))?,
            storage_uri: row.try_get("storage_uri").map_err(|e| CoreError::Integrity(e.to_string()))?,
            sha256: row.try_get("sha256").map_err(|e| CoreError::Integrity(e.to_string()))?,
            doc_type: parse_doc_type(&doc_type_str)?,
            page_count: row.try_get::<i32, _>("page_count").map_err(|e| CoreError::Integrity(e.to_string()))? as u32,
            created_at: row.try_get("created_at").map_err(|e| CoreError::Integrity(e.to_string()))?,
        }))
    }

    async fn create_document(&self, document: Document) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO documents (tenant_id, doc_id, loan_id, storage_uri, sha256, doc_type, page_count, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (tenant_id, doc_id) DO NOTHING
            "#,
        )
        .bind(&document.tenant_id)
        .bind(&document.doc_id)
        .bind(&document.loan_id)
        .bind(&document.storage_uri)
        .bind(&document.sha256)
        .bind(document.doc_type.as_str())
        .bind(document.page_count as i32)
        .bind(document.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::Transient(format!("postgres insert failed: {e}")))?;
        Ok(())
    }

    async fn get_datapoint(&self, tenant_id: &str, loan_id: &str, key: &str) -> Result<Option<Datapoint>, CoreError> {
        let row = sqlx::query(
            r#"
            SELECT tenant_id, loan_id, key, value, normalized_value, confidence, ingest_source,
                   autofilled_from, evidence_doc_id, evidence_page, evidence_text_hash,
                   extractor_version, prompt_version, authority_priority, updated_at
            FROM datapoints WHERE tenant_id = $1 AND loan_id = $2 AND key = $3
            "#,
        )
        .bind(tenant_id)
        .bind(loan_id)
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CoreError::Transient(format!("postgres select failed: {e}")))?;

        let Some(row) = row else { return Ok(None) };
        row_to_datapoint(row).map(Some)
    }

    async fn upsert_datapoint(&self, datapoint: Datapoint) -> Result<(), CoreError> {
        let value = serde_json::to_value(&datapoint.value)?;
        let normalized_value = match &datapoint.normalized_value {
            Some(v) => Some(serde_json::to_value(v)?),
            None => None,
        };

        sqlx::query(
            r#"
            INSERT INTO datapoints (
                tenant_id, loan_id, key, value, normalized_value, confidence, ingest_source,
                autofilled_from, evidence_doc_id, evidence_page, evidence_text_hash,
                extractor_version, prompt_version, authority_priority, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (tenant_id, loan_id, key) DO UPDATE SET
                value = EXCLUDED.value,
                normalized_value = EXCLUDED.normalized_value,
                confidence = EXCLUDED.confidence,
                ingest_source = EXCLUDED.ingest_source,
                autofilled_from = EXCLUDED.autofilled_from,
                evidence_doc_id = EXCLUDED.evidence_doc_id,
                evidence_page = EXCLUDED.evidence_page,
                evidence_text_hash = EXCLUDED.evidence_text_hash,
                extractor_version = EXCLUDED.extractor_version,
                prompt_version = EXCLUDED.prompt_version,
                authority_priority = EXCLUDED.authority_priority,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&datapoint.tenant_id)
        .bind(&datapoint.loan_id)
        .bind(&datapoint.key)
        .bind(value)
        .bind(normalized_value)
        .bind(datapoint.confidence)
        .bind(datapoint.ingest_source.as_str())
        .bind(autofilled_from_to_str(datapoint.autofilled_from))
        .bind(&datapoint.evidence_doc_id)
        .bind(datapoint.evidence_page.map(|p| p as i32))
        .bind(&datapoint.evidence_text_hash)
        .bind(&datapoint.extractor_version)
        .bind(&datapoint.prompt_version)
        .bind(datapoint.authority_priority)
        .bind(datapoint.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::Transient(format!("postgres upsert failed: {e}")))?;
        Ok(())
    }

    async fn save_defect(&self, defect: Defect) -> Result<(), CoreError> {
        sqlx::query(
            "INSERT INTO defects (loan_id, key, severity, message, created_at) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(&defect.loan_id)
        .bind(&defect.key)
        .bind(severity_to_str(defect.severity))
        .bind(&defect.message)
        .bind(defect.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::Transient(format!("postgres insert failed: {e}")))?;
        Ok(())
    }

    async fn set_loan_status(&self, tenant_id: &str, loan_id: &str, status: LoanStatus) -> Result<(), CoreError> {
        sqlx::query(
            "UPDATE loan_candidates SET status = $1, updated_at = now() WHERE tenant_id = $2 AND loan_id = $3",
        )
        .bind(loan_status_to_str(status))
        .bind(tenant_id)
        .bind(loan_id)
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::Transient(format!("postgres update failed: {e}")))?;
        Ok(())
    }

    async fn load_document_bytes(&self, _file_path: &str) -> Result<Vec<u8>, CoreError> {
        Err(CoreError::Fatal(
            "PgLoanRepository does not load document bytes directly; use an ObjectStore".to_string(),
        ))
    }

    async fn load_ocr_text(&self, _document_id: &str) -> Result<String, CoreError> {
        Ok(String::new())
    }
}

fn row_to_datapoint(row: sqlx::postgres::PgRow) -> Result<Datapoint, CoreError> {
    let ingest_source_str: String = row
        .try_get("ingest_source")
        .map_err(|e| CoreError::Integrity(format!("postgres decode ingest_source failed: {e}")))?;
    let autofilled_from_str: String = row
        .try_get("autofilled_from")
        .map_err(|e| CoreError::Integrity(format!("postgres decode autofilled_from failed: {e}")))?;
    let value_json: serde_json::Value = row
        .try_get("value")
        .map_err(|e| CoreError::Integrity(format!("postgres decode value failed: {e}")))?;
    let normalized_value_json: Option<serde_json::Value> = row
        .try_get("normalized_value")
        .map_err(|e| CoreError::Integrity(format!("postgres decode normalized_value failed: {e}")))?;

    Ok(Datapoint {
        tenant_id: row.try_get("tenant_id").map_err(|e| CoreError::Integrity(e.to_string()))?,
        loan_id: row.try_get("loan_id").map_err(|e| CoreError::Integrity(e.to_string()))?,
        key: row.try_get("key").map_err(|e| CoreError::Integrity(e.to_string()))?,
        value: serde_json::from_value(value_json)?,
        normalized_value: normalized_value_json.map(serde_json::from_value).transpose()?,
        confidence: row.try_get("confidence").map_err(|e| CoreError::Integrity(e.to_string()))?,
        ingest_source: parse_candidate_source(&ingest_source_str)?,
        autofilled_from: parse_autofilled_from(&autofilled_from_str)?,
        evidence_doc_id: row.try_get("evidence_doc_id").map_err(|e| CoreError::Integrity(e.to_string()))?,
        evidence_page: row
            .try_get::<Option<i32>, _>("evidence_page")
            .map_err(|e| CoreError::Integrity(e.to_string()))?
            .map(|p| p as u32),
        evidence_text_hash: row.try_get("evidence_text_hash").map_err(|e| CoreError::Integrity(e.to_string()))?,
        extractor_version: row.try_get("extractor_version").map_err(|e| CoreError::Integrity(e.to_string()))?,
        prompt_version: row.try_get("prompt_version").map_err(|e| CoreError::Integrity(e.to_string()))?,
        authority_priority: row.try_get("authority_priority").map_err(|e| CoreError::Integrity(e.to_string()))?,
        updated_at: row.try_get("updated_at").map_err(|e| CoreError::Integrity(e.to_string()))?,
    })
}

fn loan_status_to_str(status: LoanStatus) -> &'static str {
    match status {
        LoanStatus::Ingesting => "ingesting",
        LoanStatus::Validated => "validated",
        LoanStatus::Conflicts => "conflicts",
        LoanStatus::Accepted => "accepted",
        LoanStatus::Rejected => "rejected",
    }
}

fn parse_loan_status(value: &str) -> Result<LoanStatus, CoreError> {
    match value {
        "ingesting" => Ok(LoanStatus::Ingesting),
        "validated" => Ok(LoanStatus::Validated),
        "conflicts" => Ok(LoanStatus::Conflicts),
        "accepted" => Ok(LoanStatus::Accepted),
        "rejected" => Ok(LoanStatus::Rejected),
        other => Err(CoreError::Integrity(format!("unknown loan status '{other}' in postgres"))),
    }
}

fn parse_doc_type(value: &str) -> Result<loanserve_core::types::DocType, CoreError> {
    use loanserve_core::types::DocType;
    match value {
        "NOTE" => Ok(DocType::Note),
        "CD" => Ok(DocType::Cd),
        "HOI" => Ok(DocType::Hoi),
        "FLOOD" => Ok(DocType::Flood),
        "APPRAISAL" => Ok(DocType::Appraisal),
        "DEED" => Ok(DocType::Deed),
        "LE" => Ok(DocType::Le),
        "MISMO" => Ok(DocType::Mismo),
        "CSV" => Ok(DocType::Csv),
        "JSON" => Ok(DocType::Json),
        "PDF" => Ok(DocType::Pdf),
        other => Err(CoreError::Integrity(format!("unknown doc type '{other}' in postgres"))),
    }
}

fn autofilled_from_to_str(value: loanserve_core::types::AutofilledFrom) -> &'static str {
    use loanserve_core::types::AutofilledFrom;
    match value {
        AutofilledFrom::InvestorDirective => "investor_directive",
        AutofilledFrom::EscrowInstruction => "escrow_instruction",
        AutofilledFrom::Document => "document",
        AutofilledFrom::Vendor => "vendor",
        AutofilledFrom::User => "user",
        AutofilledFrom::Payload => "payload",
    }
}

fn parse_autofilled_from(value: &str) -> Result<loanserve_core::types::AutofilledFrom, CoreError> {
    use loanserve_core::types::AutofilledFrom;
    match value {
        "investor_directive" => Ok(AutofilledFrom::InvestorDirective),
        "escrow_instruction" => Ok(AutofilledFrom::EscrowInstruction),
        "document" => Ok(AutofilledFrom::Document),
        "vendor" => Ok(AutofilledFrom::Vendor),
        "user" => Ok(AutofilledFrom::User),
        "payload" => Ok(AutofilledFrom::Payload),
        other => Err(CoreError::Integrity(format!("unknown autofilled_from '{other}' in postgres"))),
    }
}

fn parse_candidate_source(value: &str) -> Result<loanserve_core::types::CandidateSource, CoreError> {
    use loanserve_core::types::CandidateSource;
    match value {
        "investor_directive" => Ok(CandidateSource::InvestorDirective),
        "escrow_instruction" => Ok(CandidateSource::EscrowInstruction),
        "manual_entry" => Ok(CandidateSource::ManualEntry),
        "vendor_api" => Ok(CandidateSource::VendorApi),
        "document_parse" => Ok(CandidateSource::DocumentParse),
        "ai_doc" => Ok(CandidateSource::AiDoc),
        "ocr" => Ok(CandidateSource::Ocr),
        other => Err(CoreError::Integrity(format!("unknown candidate source '{other}' in postgres"))),
    }
}

/// In-memory `VendorStore`: a shared (per-tenant) cache plus an append-only
/// audit log, the same in-memory/Postgres duality as every other repository
/// in this file.
#[derive(Default)]
pub struct InMemoryVendorStore {
    cache: Mutex<HashMap<(String, String, String), VendorCacheEntry>>,
    audit: Mutex<Vec<VendorAuditEntry>>,
}

impl InMemoryVendorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn audit_log(&self) -> Vec<VendorAuditEntry> {
        self.audit.lock().unwrap().clone()
    }
}

#[async_trait]
impl VendorStore for InMemoryVendorStore {
    async fn get_cached(&self, tenant_id: &str, vendor: &str, key: &str) -> Result<Option<serde_json::Value>, CoreError> {
        let cache = self.cache.lock().unwrap();
        Ok(cache
            .get(&(tenant_id.to_string(), vendor.to_string(), key.to_string()))
            .filter(|entry| entry.expires_at > Utc::now())
            .map(|entry| entry.payload.clone()))
    }

    async fn put_cached(&self, entry: VendorCacheEntry) -> Result<(), CoreError> {
        self.cache.lock().unwrap().insert(
            (entry.tenant_id.clone(), entry.vendor.clone(), entry.key.clone()),
            entry,
        );
        Ok(())
    }

    async fn record_audit(&self, entry: VendorAuditEntry) -> Result<(), CoreError> {
        self.audit.lock().unwrap().push(entry);
        Ok(())
    }
}

/// Postgres-backed `VendorStore`. Cache rows expire by `expires_at > now()`
/// audit rows are append-only, never updated.
pub struct PgVendorStore {
    pool: PgPool,
}

impl PgVendorStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, CoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await
            .map_err(|e| CoreError::Transient(format!("postgres connect failed: {e}")))?;
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    async fn ensure_schema(&self) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS vendor_cache (
                tenant_id TEXT NOT NULL,
                vendor TEXT NOT NULL,
                key TEXT NOT NULL,
                payload JSONB NOT NULL,
                expires_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (tenant_id, vendor, key)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::Fatal(format!("schema create failed for vendor_cache: {e}")))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS vendor_audit (
                tenant_id TEXT NOT NULL,
                vendor TEXT NOT NULL,
                endpoint TEXT NOT NULL,
                status INT NULL,
                request JSONB NOT NULL,
                response JSONB NOT NULL,
                latency_ms BIGINT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::Fatal(format!("schema create failed for vendor_audit: {e}")))?;

        Ok(())
    }
}

#[async_trait]
impl VendorStore for PgVendorStore {
    async fn get_cached(&self, tenant_id: &str, vendor: &str, key: &str) -> Result<Option<serde_json::Value>, CoreError> {
        let row = sqlx::query(
            "SELECT payload FROM vendor_cache WHERE tenant_id = $1 AND vendor = $2 AND key = $3 AND expires_at > now()",
        )
        .bind(tenant_id)
        .bind(vendor)
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CoreError::Transient(format!("postgres select failed: {e}")))?;

        let Some(row) = row else { return Ok(None) };
        Ok(Some(
            row.try_get("payload")
                .map_err(|e| CoreError::Integrity(format!("postgres decode payload failed: {e}")))?,
        ))
    }

    async fn put_cached(&self, entry: VendorCacheEntry) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO vendor_cache (tenant_id, vendor, key, payload, expires_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (tenant_id, vendor, key) DO UPDATE SET
                payload = EXCLUDED.payload,
                expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(&entry.tenant_id)
        .bind(&entry.vendor)
        .bind(&entry.key)
        .bind(&entry.payload)
        .bind(entry.expires_at)
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::Transient(format!("postgres upsert failed: {e}")))?;
        Ok(())
    }

    async fn record_audit(&self, entry: VendorAuditEntry) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO vendor_audit (tenant_id, vendor, endpoint, status, request, response, latency_ms, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(&entry.tenant_id)
        .bind(&entry.vendor)
        .bind(&entry.endpoint)
        .bind(entry.status.map(|s| s as i32))
        .bind(&entry.request)
        .bind(&entry.response)
        .bind(entry.latency_ms as i64)
        .bind(entry.timestamp)
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::Transient(format!("postgres insert failed: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn vendor_cache_expires_by_expires_at() {
        let store = InMemoryVendorStore::new();
        store
            .put_cached(VendorCacheEntry {
                tenant_id: "tenant-1".to_string(),
                vendor: "flood".to_string(),
                key: "FLOOD:abc".to_string(),
                payload: serde_json::json!({"zone": "X"}),
                expires_at: Utc::now() - chrono::Duration::minutes(1),
            })
            .await
            .unwrap();
        let cached = store.get_cached("tenant-1", "flood", "FLOOD:abc").await.unwrap();
        assert!(cached.is_none());
    }

    #[tokio::test]
    async fn vendor_cache_hit_returns_payload() {
        let store = InMemoryVendorStore::new();
        store
            .put_cached(VendorCacheEntry {
                tenant_id: "tenant-1".to_string(),
                vendor: "flood".to_string(),
                key: "FLOOD:abc".to_string(),
                payload: serde_json::json!({"zone": "X"}),
                expires_at: Utc::now() + chrono::Duration::minutes(5),
            })
            .await
            .unwrap();
        let cached = store.get_cached("tenant-1", "flood", "FLOOD:abc").await.unwrap();
        assert_eq!(cached.unwrap()["zone"], "X");
    }

    #[tokio::test]
    async fn vendor_audit_is_append_only() {
        let store = InMemoryVendorStore::new();
        store
            .record_audit(VendorAuditEntry {
                tenant_id: "tenant-1".to_string(),
                vendor: "flood".to_string(),
                endpoint: "flood_determination".to_string(),
                status: Some(200),
                request: serde_json::json!({}),
                response: serde_json::json!({}),
                latency_ms: 12,
                timestamp: Utc::now(),
            })
            .await
            .unwrap();
        assert_eq!(store.audit_log().len(), 1);
    }

    #[tokio::test]
    async fn in_memory_object_store_round_trips() {
        let store = InMemoryObjectStore::new();
        store.put("exports/loan-1.xml", b"hello".to_vec()).await.unwrap();
        let bytes = store.get("exports/loan-1.xml").await.unwrap();
        assert_eq!(bytes, b"hello");
    }

    #[tokio::test]
    async fn in_memory_object_store_missing_object_errors() {
        let store = InMemoryObjectStore::new();
        assert!(store.get("nope").await.is_err());
    }

    #[tokio::test]
    async fn in_memory_repository_creates_loan_once() {
        let repository = InMemoryLoanRepository::new();
        let first = repository.get_or_create_loan("tenant-1", "loan-1").await.unwrap();
        let second = repository.get_or_create_loan("tenant-1", "loan-1").await.unwrap();
        assert_eq!(first.created_at, second.created_at);
    }

    #[test]
    fn loan_status_round_trips() {
        for status in [
            LoanStatus::Ingesting,
            LoanStatus::Validated,
            LoanStatus::Conflicts,
            LoanStatus::Accepted,
            LoanStatus::Rejected,
        ] {
            assert_eq!(parse_loan_status(loan_status_to_str(status)).unwrap(), status);
        }
    }
}
