//! Lineage Tracker: append-only provenance for every stored value.
//!
//! A hash-chained ledger generalized from a linear chain to a DAG: each
//! lineage record can name multiple parents (`derived_from`), so merged or
//! computed values trace back to every input.

use crate::error::CoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Where a stored value's source text physically lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentReference {
    pub doc_id: String,
    pub page: Option<u32>,
    pub bounding_box: Option<[f64; 4]>,
    pub source_text: String,
    pub text_hash: String,
}

impl DocumentReference {
    pub fn new(doc_id: impl Into<String>, source_text: impl Into<String>) -> Self {
        let source_text = source_text.into();
        let text_hash = hash_text(&source_text);
        Self {
            doc_id: doc_id.into(),
            page: None,
            bounding_box: None,
            source_text,
            text_hash,
        }
    }
}

fn hash_text(text: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransformationType {
    Normalization,
    Validation,
    FormatConversion,
    Calculation,
    Merge,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transformation {
    #[serde(rename = "type")]
    pub kind: TransformationType,
    pub description: String,
    pub input_value: String,
    pub output_value: String,
    pub rule: String,
    pub timestamp: DateTime<Utc>,
}

/// One provenance node. `lineage_id` is derived from its own content so two
/// records built from identical inputs collide on purpose (idempotent re-derivation).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineageRecord {
    pub lineage_id: String,
    pub field_name: String,
    pub value: String,
    pub source: String,
    pub doc_id: Option<String>,
    pub extractor_version: Option<String>,
    pub prompt_version: Option<String>,
    pub document_reference: Option<DocumentReference>,
    pub derived_from: Vec<String>,
    pub transformations: Vec<Transformation>,
    pub created_at: DateTime<Utc>,
}

/// `lineageId` = SHA-256 of (fieldName, value, source, docId?, extractorVersion?,
/// promptVersion?), truncated, plus a timestamp suffix so repeated derivations of
/// the same logical fact at different times remain distinguishable.
pub fn compute_lineage_id(
    field_name: &str,
    value: &str,
    source: &str,
    doc_id: Option<&str>,
    extractor_version: Option<&str>,
    prompt_version: Option<&str>,
    timestamp: DateTime<Utc>,
) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(field_name.as_bytes());
    hasher.update(value.as_bytes());
    hasher.update(source.as_bytes());
    hasher.update(doc_id.unwrap_or("").as_bytes());
    hasher.update(extractor_version.unwrap_or("").as_bytes());
    hasher.update(prompt_version.unwrap_or("").as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("{}-{}", &digest[..16], timestamp.timestamp_millis())
}

/// Result of `verify_integrity`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub ok: bool,
    pub issues: Vec<String>,
    pub verified_hashes: u32,
    pub total_hashes: u32,
}

/// Append-only store of lineage records, keyed by `lineage_id`. Mutation methods
/// only ever add rows; there is deliberately no update or delete.
#[derive(Debug, Default)]
pub struct LineageTracker {
    records: HashMap<String, LineageRecord>,
    insertion_order: Vec<String>,
}

impl LineageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(
        &mut self,
        field_name: impl Into<String>,
        value: impl Into<String>,
        source: impl Into<String>,
        doc_id: Option<String>,
        extractor_version: Option<String>,
        prompt_version: Option<String>,
        document_reference: Option<DocumentReference>,
        derived_from: Vec<String>,
    ) -> Result<LineageRecord, CoreError> {
        for parent in &derived_from {
            if !self.records.contains_key(parent) {
                return Err(CoreError::Validation(format!(
                    "cannot derive lineage from unknown parent {parent}"
                )));
            }
        }

        let field_name = field_name.into();
        let value = value.into();
        let source = source.into();
        let now = Utc::now();
        let lineage_id = compute_lineage_id(
            &field_name,
            &value,
            &source,
            doc_id.as_deref(),
            extractor_version.as_deref(),
            prompt_version.as_deref(),
            now,
        );

        let entry = LineageRecord {
            lineage_id: lineage_id.clone(),
            field_name,
            value,
            source,
            doc_id,
            extractor_version,
            prompt_version,
            document_reference,
            derived_from,
            transformations: Vec::new(),
            created_at: now,
        };

        self.records.insert(lineage_id.clone(), entry.clone());
        self.insertion_order.push(lineage_id);
        Ok(entry)
    }

    /// Appends a transformation to an existing record in place. This does not
    /// violate append-only semantics at the store level: the record's identity
    /// (`lineage_id`) never changes, and transformations themselves only append.
    pub fn add_transformation(
        &mut self,
        lineage_id: &str,
        transformation: Transformation,
    ) -> Result<(), CoreError> {
        let record = self
            .records
            .get_mut(lineage_id)
            .ok_or_else(|| CoreError::NotFound(format!("lineage {lineage_id} not found")))?;
        record.transformations.push(transformation);
        Ok(())
    }

    pub fn get(&self, lineage_id: &str) -> Option<&LineageRecord> {
        self.records.get(lineage_id)
    }

    /// Recomputes `SHA256(sourceText)` for this node and every ancestor.
    pub fn verify_integrity(&self, lineage_id: &str) -> IntegrityReport {
        let mut issues = Vec::new();
        let mut verified = 0u32;
        let mut total = 0u32;
        let mut visited: HashSet<String> = HashSet::new();
        let mut stack = vec![lineage_id.to_string()];

        while let Some(current) = stack.pop() {
            if !visited.insert(current.clone()) {
                continue;
            }
            match self.records.get(&current) {
                None => issues.push(format!("missing lineage record {current}")),
                Some(record) => {
                    if let Some(doc_ref) = &record.document_reference {
                        total += 1;
                        if hash_text(&doc_ref.source_text) == doc_ref.text_hash {
                            verified += 1;
                        } else {
                            issues.push(format!("text hash mismatch at {current}"));
                        }
                    }
                    stack.extend(record.derived_from.iter().cloned());
                }
            }
        }

        IntegrityReport {
            ok: issues.is_empty(),
            issues,
            verified_hashes: verified,
            total_hashes: total,
        }
    }

    /// Full ancestor chain, cycle-safe via a visited set, nearest ancestors first.
    pub fn chain(&self, lineage_id: &str) -> Vec<LineageRecord> {
        let mut visited: HashSet<String> = HashSet::new();
        let mut result = Vec::new();
        let mut queue = vec![lineage_id.to_string()];

        while let Some(current) = queue.pop() {
            if !visited.insert(current.clone()) {
                continue;
            }
            if let Some(record) = self.records.get(&current) {
                result.push(record.clone());
                queue.extend(record.derived_from.iter().cloned());
            }
        }
        result
    }

    /// Human-readable narrative: source, transformations in timestamp order, final value.
    pub fn explain(&self, lineage_id: &str) -> Result<String, CoreError> {
        let record = self
            .records
            .get(lineage_id)
            .ok_or_else(|| CoreError::NotFound(format!("lineage {lineage_id} not found")))?;

        let mut narrative = format!(
            "{} originated from {} (doc={:?})",
            record.field_name, record.source, record.doc_id
        );

        let mut ordered_transformations = record.transformations.clone();
        ordered_transformations.sort_by_key(|t| t.timestamp);
        for transformation in &ordered_transformations {
            narrative.push_str(&format!(
                "; {:?}: {} ({} -> {})",
                transformation.kind,
                transformation.description,
                transformation.input_value,
                transformation.output_value
            ));
        }

        narrative.push_str(&format!("; final value = {}", record.value));
        Ok(narrative)
    }

    pub fn len(&self) -> usize {
        self.insertion_order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.insertion_order.is_empty()
    }
}
