//! Append-only audit log. Every other component writes here; the ledger is the
//! system of record for provenance, not a side channel for operator convenience.
//!
//! No in-place mutation is exposed: every entry commits a blake3 digest over
//! itself plus the previous entry's hash, and `verify_chain` detects
//! tampering by recomputation.

use crate::error::CoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A single audit record. `event_type` is a dotted namespace (e.g.
/// `AI_PIPELINE.AUTHORITY_DECISION`, `WORK_DLQ`) rather than a closed enum,
/// since the event catalog is open-ended and new components add new event
/// types without the ledger needing to change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub tenant_id: String,
    pub event_type: String,
    pub actor_type: String,
    pub actor_id: Option<String>,
    pub resource_urn: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(
        tenant_id: impl Into<String>,
        event_type: impl Into<String>,
        actor_type: impl Into<String>,
        resource_urn: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            event_type: event_type.into(),
            actor_type: actor_type.into(),
            actor_id: None,
            resource_urn: resource_urn.into(),
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn with_actor(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }
}

/// A hash-chained ledger entry wrapping one `AuditEvent`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLedgerEntry {
    pub entry_id: String,
    pub index: u64,
    pub event: AuditEvent,
    pub previous_hash: Option<String>,
    pub entry_hash: String,
}

/// Durable mirror hook implemented by the adapters layer (Postgres, etc). The
/// in-process `AuditLedger` below is authoritative for hash-chain verification;
/// sinks only need to persist what they're given.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, entry: &AuditLedgerEntry) -> Result<(), CoreError>;
}

/// In-memory, hash-chained, append-only audit log.
#[derive(Debug, Default, Clone)]
pub struct AuditLedger {
    entries: Vec<AuditLedgerEntry>,
}

impl AuditLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted entries and verify hash-chain integrity immediately.
    pub fn from_entries(entries: Vec<AuditLedgerEntry>) -> Result<Self, CoreError> {
        let ledger = Self { entries };
        for (expected_index, entry) in ledger.entries.iter().enumerate() {
            if entry.index != expected_index as u64 {
                return Err(CoreError::Integrity(format!(
                    "audit ledger index gap at position {expected_index} (found {})",
                    entry.index
                )));
            }
        }
        if !ledger.verify_chain() {
            return Err(CoreError::Integrity(
                "persisted audit ledger hash-chain verification failed".to_string(),
            ));
        }
        Ok(ledger)
    }

    pub fn entries(&self) -> &[AuditLedgerEntry] {
        &self.entries
    }

    pub fn find_entry(&self, entry_id: &str) -> Option<&AuditLedgerEntry> {
        self.entries.iter().find(|e| e.entry_id == entry_id)
    }

    pub fn append(&mut self, event: AuditEvent) -> AuditLedgerEntry {
        let entry = self.build_entry(event);
        self.entries.push(entry.clone());
        entry
    }

    fn build_entry(&self, event: AuditEvent) -> AuditLedgerEntry {
        let index = self.entries.len() as u64;
        let previous_hash = self.entries.last().map(|e| e.entry_hash.clone());
        let entry_hash = compute_entry_hash(index, &event, previous_hash.as_deref());
        AuditLedgerEntry {
            entry_id: Uuid::new_v4().to_string(),
            index,
            event,
            previous_hash,
            entry_hash,
        }
    }

    pub fn verify_chain(&self) -> bool {
        let mut previous_hash: Option<String> = None;
        for entry in &self.entries {
            let expected = compute_entry_hash(entry.index, &entry.event, previous_hash.as_deref());
            if entry.entry_hash != expected || entry.previous_hash != previous_hash {
                return false;
            }
            previous_hash = Some(entry.entry_hash.clone());
        }
        true
    }
}

fn compute_entry_hash(index: u64, event: &AuditEvent, previous_hash: Option<&str>) -> String {
    let material = serde_json::json!({
        "index": index,
        "event": event,
        "previous_hash": previous_hash,
    });
    let bytes = serde_json::to_vec(&material).unwrap_or_default();
    blake3::hash(&bytes).to_hex().to_string()
}
