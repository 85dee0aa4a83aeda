//! Authority Matrix: a pure function resolving N candidate values for one
//! field into a single winner plus a decision record.
//!
//! A base priority table keyed on source, overridable per specific field,
//! folded through a scoring formula into a deterministic multi-level
//! tie-break. Resolution never touches I/O or the clock beyond what's already
//! on the candidates.

use crate::types::{Candidate, CandidateSource};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

fn base_priority(source: CandidateSource) -> f64 {
    match source {
        CandidateSource::InvestorDirective => 1000.0,
        CandidateSource::EscrowInstruction => 900.0,
        CandidateSource::ManualEntry => 800.0,
        CandidateSource::VendorApi => 700.0,
        CandidateSource::DocumentParse => 600.0,
        CandidateSource::AiDoc => 500.0,
        CandidateSource::Ocr => 400.0,
    }
}

/// Field-specific priority overrides. Overrides replace the base priority
/// outright for that `(key, source)` pair; they never merge with it.
fn field_override(key: &str, source: CandidateSource) -> Option<f64> {
    match (key, source) {
        ("property_address", CandidateSource::VendorApi) => Some(1000.0),
        ("borrower_name", CandidateSource::ManualEntry) => Some(1000.0),
        ("payment_date", CandidateSource::EscrowInstruction) => Some(1000.0),
        _ => None,
    }
}

fn resolved_base_priority(key: &str, source: CandidateSource) -> f64 {
    field_override(key, source).unwrap_or_else(|| base_priority(source))
}

/// `p_eff = p_base + 0.1 * p_base * confidence - min(ageDays/30, 1) * 0.05 * p_base`.
fn effective_priority(p_base: f64, confidence: f32, age_days: f64) -> f64 {
    let confidence = confidence as f64;
    let age_factor = (age_days / 30.0).min(1.0);
    p_base + 0.1 * p_base * confidence - age_factor * 0.05 * p_base
}

/// Decision record emitted for one resolved field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub key: String,
    pub winner: CandidateSource,
    pub winner_value: crate::types::FieldValue,
    pub reason: String,
    pub conflicting_sources: Vec<String>,
    pub authority_rule: String,
    pub confidence: f32,
    pub authority_priority: f64,
}

/// A scored candidate, kept internal to resolution; `p_eff` and the tie-break
/// fields are computed once up front so ordering is a single deterministic sort.
struct Scored<'a> {
    candidate: &'a Candidate,
    p_eff: f64,
}

/// Resolves one field's candidates into a `Decision`. `now` is passed explicitly
/// so resolution stays a pure function of its inputs (the caller supplies the
/// evaluation instant, typically `Utc::now()` at call time).
pub fn resolve(key: &str, candidates: &[Candidate], now: DateTime<Utc>) -> Option<Decision> {
    if candidates.is_empty() {
        return None;
    }

    let scored: Vec<Scored> = candidates
        .iter()
        .map(|c| {
            let p_base = resolved_base_priority(key, c.source);
            let age_days = (now - c.timestamp).num_seconds() as f64 / 86_400.0;
            let age_days = age_days.max(0.0);
            Scored {
                candidate: c,
                p_eff: effective_priority(p_base, c.confidence, age_days),
            }
        })
        .collect();

    let mut ordered: Vec<&Scored> = scored.iter().collect();
    ordered.sort_by(|a, b| {
        b.p_eff
            .partial_cmp(&a.p_eff)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                b.candidate
                    .confidence
                    .partial_cmp(&a.candidate.confidence)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| b.candidate.timestamp.cmp(&a.candidate.timestamp))
            .then_with(|| {
                b.candidate
                    .source_key()
                    .cmp(&a.candidate.source_key())
            })
    });

    let winner = ordered[0];
    let conflicting_sources: Vec<String> = candidates
        .iter()
        .map(|c| c.source_key())
        .filter(|sk| sk != &winner.candidate.source_key())
        .collect();

    let authority_rule = if candidates.len() == 1 {
        "no_conflict".to_string()
    } else if field_override(key, winner.candidate.source).is_some() {
        format!("field_override_{}", winner.candidate.source.as_str())
    } else {
        format!("general_hierarchy_{}", winner.candidate.source.as_str())
    };

    Some(Decision {
        key: key.to_string(),
        winner: winner.candidate.source,
        winner_value: winner.candidate.value.clone(),
        reason: format!(
            "{} won with p_eff={:.4} among {} candidate(s)",
            winner.candidate.source.as_str(),
            winner.p_eff,
            candidates.len()
        ),
        conflicting_sources,
        authority_rule,
        confidence: winner.candidate.confidence,
        authority_priority: winner.p_eff,
    })
}

/// Groups a flat candidate list by field key, preserving first-seen key order
/// so callers get deterministic iteration without depending on a HashMap's order.
pub fn group_by_key(candidates: Vec<Candidate>) -> Vec<(String, Vec<Candidate>)> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<Candidate>> = HashMap::new();
    for candidate in candidates {
        if !groups.contains_key(&candidate.key) {
            order.push(candidate.key.clone());
        }
        groups.entry(candidate.key.clone()).or_default().push(candidate);
    }
    order
        .into_iter()
        .map(|key| {
            let values = groups.remove(&key).unwrap_or_default();
            (key, values)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DocType, FieldValue};
    use chrono::Duration;
    use rust_decimal::Decimal;

    fn candidate(
        source: CandidateSource,
        confidence: f32,
        value: &str,
        timestamp: DateTime<Utc>,
    ) -> Candidate {
        Candidate {
            key: "loan_amount".to_string(),
            value: FieldValue::Text(value.to_string()),
            source,
            confidence,
            doc_type: Some(DocType::Note),
            doc_id: Some("doc-1".to_string()),
            page: Some(1),
            evidence: None,
            extractor_version: Some("det-v1".to_string()),
            timestamp,
        }
    }

    #[test]
    fn single_candidate_is_no_conflict() {
        let now = Utc::now();
        let candidates = vec![candidate(CandidateSource::DocumentParse, 0.8, "1", now)];
        let decision = resolve("loan_amount", &candidates, now).unwrap();
        assert_eq!(decision.authority_rule, "no_conflict");
        assert_eq!(decision.winner, CandidateSource::DocumentParse);
    }

    #[test]
    fn higher_base_priority_wins_at_equal_confidence() {
        let now = Utc::now();
        let candidates = vec![
            candidate(CandidateSource::DocumentParse, 0.8, "doc", now),
            candidate(CandidateSource::ManualEntry, 0.8, "manual", now),
        ];
        let decision = resolve("loan_amount", &candidates, now).unwrap();
        assert_eq!(decision.winner, CandidateSource::ManualEntry);
        assert_eq!(decision.conflicting_sources.len(), 1);
    }

    #[test]
    fn field_override_can_flip_the_winner() {
        let now = Utc::now();
        let candidates = vec![
            candidate(CandidateSource::ManualEntry, 0.9, "manual", now),
            candidate(CandidateSource::VendorApi, 0.9, "vendor", now),
        ];
        let decision = resolve("property_address", &candidates, now).unwrap();
        assert_eq!(decision.winner, CandidateSource::VendorApi);
    }

    #[test]
    fn age_penalty_can_flip_a_near_tie() {
        let now = Utc::now();
        let old = now - Duration::days(30);
        let candidates = vec![
            candidate(CandidateSource::DocumentParse, 0.5, "old", old),
            candidate(CandidateSource::AiDoc, 0.99, "fresh", now),
        ];
        let decision = resolve("loan_amount", &candidates, now).unwrap();
        assert_eq!(decision.winner, CandidateSource::AiDoc);
    }

    #[test]
    fn tie_break_falls_through_confidence_then_timestamp_then_source_key() {
        let now = Utc::now();
        let earlier = now - Duration::seconds(5);
        let candidates = vec![
            candidate(CandidateSource::DocumentParse, 0.8, "a", earlier),
            candidate(CandidateSource::DocumentParse, 0.8, "b", now),
        ];
        let decision = resolve("loan_amount", &candidates, now).unwrap();
        assert_eq!(decision.winner_value, FieldValue::Text("b".to_string()));
    }

    #[test]
    fn resolution_is_deterministic_across_repeated_calls() {
        let now = Utc::now();
        let candidates = vec![
            candidate(CandidateSource::DocumentParse, 0.8, "doc", now),
            candidate(CandidateSource::VendorApi, 0.7, "vendor", now),
            candidate(CandidateSource::Ocr, 0.6, "ocr", now),
        ];
        let first = resolve("loan_amount", &candidates, now).unwrap();
        let second = resolve("loan_amount", &candidates, now).unwrap();
        assert_eq!(first.winner, second.winner);
        assert_eq!(first.authority_rule, second.authority_rule);
    }

    #[test]
    fn investor_directive_wins_over_document_parse_with_general_hierarchy_rule() {
        let now = Utc::now();
        let candidates = vec![
            Candidate {
                value: FieldValue::Number(Decimal::from(250_000)),
                ..candidate(CandidateSource::DocumentParse, 0.9, "250000", now)
            },
            Candidate {
                value: FieldValue::Number(Decimal::from(260_000)),
                ..candidate(CandidateSource::InvestorDirective, 1.0, "260000", now)
            },
        ];
        let decision = resolve("loan_amount", &candidates, now).unwrap();
        assert_eq!(decision.winner, CandidateSource::InvestorDirective);
        assert_eq!(decision.winner_value, FieldValue::Number(Decimal::from(260_000)));
        assert_eq!(decision.authority_rule, "general_hierarchy_investor_directive");
        assert_eq!(decision.conflicting_sources.len(), 1);
    }

    #[test]
    fn group_by_key_preserves_first_seen_order() {
        let now = Utc::now();
        let mut a = candidate(CandidateSource::DocumentParse, 0.8, "a", now);
        a.key = "borrower_name".to_string();
        let b = candidate(CandidateSource::DocumentParse, 0.8, "b", now);
        let grouped = group_by_key(vec![a, b]);
        assert_eq!(grouped[0].0, "borrower_name");
        assert_eq!(grouped[1].0, "loan_amount");
    }
}
