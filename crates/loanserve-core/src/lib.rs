//! Domain core for the loan servicing ingest, extraction, conflict-resolution,
//! remittance and export pipeline.
//!
//! This crate holds the pure and deterministic parts of the system: data
//! model, authority matrix, lineage tracking, extractors, the self-healing
//! worker contract, and the remittance/export math. Everything that touches
//! the outside world (storage, HTTP, queues, notification providers) lives in
//! `loanserve-adapters` behind traits defined here.

#![deny(unsafe_code)]

pub mod audit;
pub mod authority;
pub mod error;
pub mod export;
pub mod extract;
pub mod intake;
pub mod lineage;
pub mod outbox;
pub mod remittance;
pub mod runtime;
pub mod types;

pub use audit::{AuditEvent, AuditLedger, AuditLedgerEntry, AuditSink};
pub use authority::{group_by_key, resolve, Decision};
pub use error::{classify_http_status, CoreError, ErrorClass, FailureClass};
pub use export::{Export, ExportEngine, ExportMapping, ExportResult, ExportStatus};
pub use extract::{extract_deterministic, AiExtractor, AiExtractorResponse, LlmClient, RuleHit};
pub use intake::{ConfidenceThresholds, DocumentIntakeWorker, IntakeOutcome, IntakeWorkPayload};
pub use lineage::{DocumentReference, IntegrityReport, LineageRecord, LineageTracker, Transformation, TransformationType};
pub use outbox::{Notification, NotificationWorker, OutboxMessage, OutboxStatus};
pub use remittance::{
    gl_entries_for_payout, render_loan_activity_csv, GlEntry, GlSide, InvestorHolding, Payout,
    PayoutState, PayoutWebhookPayload, RemittanceEngine, RemittanceItem, RemittanceOutcome,
    RemittanceRun,
};
pub use runtime::{
    idempotency_key, is_retryable_message, retry_delay, should_retry, DeadLetter,
    DeadLetterQueue, RetryConfig, WorkItem, WorkResult, Worker, WorkerHealth, WorkerRuntime,
};
pub use types::{
    AutofilledFrom, Candidate, CandidateSource, Datapoint, Defect, DefectSeverity, DirectiveMap,
    DirectiveOverlay, DocType, Document, Evidence, FieldValue, LoanCandidate, LoanStatus,
    VendorAuditEntry, VendorCacheEntry,
};
