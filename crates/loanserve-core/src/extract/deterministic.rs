//! Deterministic Extractor: ordered regex rules over OCR text, scoped by a
//! proximity window around a label and a separate value pattern, composed
//! together. Confidence is always 1.0 — these hits are auditable and
//! reproducible by construction, never probabilistic.

use crate::types::{Candidate, CandidateSource, DocType, Evidence, FieldValue};
use chrono::{NaiveDate, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

/// A raw hit before it becomes a `Candidate`.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleHit {
    pub key: String,
    pub value: FieldValue,
    pub evidence_text: String,
}

/// How a matched string becomes a typed value.
#[derive(Debug, Clone, Copy)]
enum Normalizer {
    Money,
    Percent,
    Integer,
    Boolean,
    Date,
    Raw,
}

fn normalize(normalizer: Normalizer, raw: &str) -> FieldValue {
    match normalizer {
        Normalizer::Money => normalize_money(raw),
        Normalizer::Percent => normalize_percent(raw),
        Normalizer::Integer => normalize_integer(raw),
        Normalizer::Boolean => normalize_boolean(raw),
        Normalizer::Date => normalize_date(raw),
        Normalizer::Raw => FieldValue::Text(raw.trim().to_string()),
    }
}

/// Strip non-digit/dot, collapse repeated dots to one, parse as a float.
fn normalize_money(raw: &str) -> FieldValue {
    parse_stripped_number(raw)
}

/// Same stripping rule as money; e.g. `"7.125%"` -> `7.125`.
fn normalize_percent(raw: &str) -> FieldValue {
    parse_stripped_number(raw)
}

fn parse_stripped_number(raw: &str) -> FieldValue {
    use std::str::FromStr;

    let stripped: String = raw.chars().filter(|c| c.is_ascii_digit() || *c == '.').collect();
    let collapsed = collapse_dots(&stripped);
    match rust_decimal::Decimal::from_str(&collapsed) {
        Ok(d) => FieldValue::Number(d),
        Err(_) => FieldValue::Null,
    }
}

fn collapse_dots(input: &str) -> String {
    let mut seen_dot = false;
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        if c == '.' {
            if seen_dot {
                continue;
            }
            seen_dot = true;
        }
        out.push(c);
    }
    out
}

static FIRST_INT: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").unwrap());

fn normalize_integer(raw: &str) -> FieldValue {
    match FIRST_INT.find(raw) {
        Some(m) => match m.as_str().parse::<i64>() {
            Ok(n) => FieldValue::Number(rust_decimal::Decimal::from(n)),
            Err(_) => FieldValue::Null,
        },
        None => FieldValue::Null,
    }
}

fn normalize_boolean(raw: &str) -> FieldValue {
    let lowered = raw.trim().to_lowercase();
    if lowered.contains("not required") || lowered == "no" {
        FieldValue::Boolean(false)
    } else if lowered.contains("required") || lowered == "yes" {
        FieldValue::Boolean(true)
    } else {
        FieldValue::Null
    }
}

static ISO_DATE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d{4})-(\d{2})-(\d{2})$").unwrap());
static SLASH_DATE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d{1,2})/(\d{1,2})/(\d{2}|\d{4})$").unwrap());
static LONG_DATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([A-Za-z]+)\s+(\d{1,2}),\s*(\d{4})$").unwrap());
static DASH_MON_DATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{1,2})[- ]([A-Za-z]{3,})[- ](\d{4})$").unwrap());

fn month_number(name: &str) -> Option<u32> {
    const NAMES: [&str; 12] = [
        "january", "february", "march", "april", "may", "june", "july", "august", "september",
        "october", "november", "december",
    ];
    let lowered = name.to_lowercase();
    NAMES
        .iter()
        .position(|m| m.starts_with(&lowered) || lowered.starts_with(m))
        .map(|i| (i + 1) as u32)
}

fn resolve_two_digit_year(year: u32) -> u32 {
    if year < 100 {
        2000 + year
    } else {
        year
    }
}

/// Accepts `YYYY-MM-DD`, `M/D/YY[YY]`, `Month D, YYYY`, `D[-space]Mon[-space]YYYY`.
/// Output canonical `YYYY-MM-DD` or null.
fn normalize_date(raw: &str) -> FieldValue {
    let trimmed = raw.trim();

    if let Some(caps) = ISO_DATE.captures(trimmed) {
        let year: i32 = caps[1].parse().unwrap_or(0);
        let month: u32 = caps[2].parse().unwrap_or(0);
        let day: u32 = caps[3].parse().unwrap_or(0);
        return build_date(year, month, day);
    }

    if let Some(caps) = SLASH_DATE.captures(trimmed) {
        let month: u32 = caps[1].parse().unwrap_or(0);
        let day: u32 = caps[2].parse().unwrap_or(0);
        let raw_year: u32 = caps[3].parse().unwrap_or(0);
        let year = resolve_two_digit_year(raw_year);
        return build_date(year as i32, month, day);
    }

    if let Some(caps) = LONG_DATE.captures(trimmed) {
        if let Some(month) = month_number(&caps[1]) {
            let day: u32 = caps[2].parse().unwrap_or(0);
            let year: i32 = caps[3].parse().unwrap_or(0);
            return build_date(year, month, day);
        }
    }

    if let Some(caps) = DASH_MON_DATE.captures(trimmed) {
        if let Some(month) = month_number(&caps[2]) {
            let day: u32 = caps[1].parse().unwrap_or(0);
            let year: i32 = caps[3].parse().unwrap_or(0);
            return build_date(year, month, day);
        }
    }

    FieldValue::Null
}

fn build_date(year: i32, month: u32, day: u32) -> FieldValue {
    match NaiveDate::from_ymd_opt(year, month, day) {
        Some(date) => FieldValue::Date(date.format("%Y-%m-%d").to_string()),
        None => FieldValue::Null,
    }
}

/// One extraction rule: find `label` within `window_chars` of the start, then
/// require `value_pattern` to match inside that window, then normalize.
struct Rule {
    key: &'static str,
    window: Regex,
    value_pattern: Regex,
    normalizer: Normalizer,
}

fn rule(key: &'static str, label_pattern: &str, window_chars: usize, value_pattern: &str, normalizer: Normalizer) -> Rule {
    let window = Regex::new(&format!(r"(?is){label_pattern}(?P<window>.{{0,{window_chars}}})")).unwrap();
    Rule {
        key,
        window,
        value_pattern: Regex::new(&format!(r"(?is){value_pattern}")).unwrap(),
        normalizer,
    }
}

fn note_rules() -> Vec<Rule> {
    vec![
        rule("loan_amount", r"NOTE\s+AMOUNT", 400, r"[\$]?[\d,]+(?:\.\d+)?", Normalizer::Money),
        rule("interest_rate", r"INTEREST\s+RATE", 200, r"[\d.]+\s*%", Normalizer::Percent),
        rule("origination_date", r"DATE\s+OF\s+NOTE", 200, r"[A-Za-z0-9/,.\- ]{6,20}", Normalizer::Date),
        rule("borrower_name", r"BORROWER(?:'S)?\s+NAME", 200, r"[A-Za-z .,'-]{3,80}", Normalizer::Raw),
        rule(
            "maturity_date",
            r"MATURITY\s+DATE",
            200,
            r"[A-Za-z0-9/,.\- ]{6,20}",
            Normalizer::Date,
        ),
    ]
}

fn cd_rules() -> Vec<Rule> {
    vec![
        rule("closing_date", r"CLOSING\s+DATE", 200, r"[A-Za-z0-9/,.\- ]{6,20}", Normalizer::Date),
        rule("cash_to_close", r"CASH\s+TO\s+CLOSE", 200, r"[\$]?[\d,]+(?:\.\d+)?", Normalizer::Money),
    ]
}

fn hoi_rules() -> Vec<Rule> {
    vec![
        rule("annual_premium", r"ANNUAL\s+PREMIUM", 200, r"[\$]?[\d,]+(?:\.\d+)?", Normalizer::Money),
        rule("coverage_required", r"COVERAGE", 200, r"(?:NOT\s+)?REQUIRED|YES|NO", Normalizer::Boolean),
    ]
}

fn flood_rules() -> Vec<Rule> {
    vec![
        rule("flood_zone", r"FLOOD\s+ZONE", 100, r"[A-Za-z0-9]{1,4}", Normalizer::Raw),
        rule("flood_insurance_required", r"FLOOD\s+INSURANCE", 200, r"(?:NOT\s+)?REQUIRED|YES|NO", Normalizer::Boolean),
    ]
}

fn appraisal_rules() -> Vec<Rule> {
    vec![rule(
        "appraised_value",
        r"APPRAISED\s+VALUE",
        200,
        r"[\$]?[\d,]+(?:\.\d+)?",
        Normalizer::Money,
    )]
}

fn deed_rules() -> Vec<Rule> {
    vec![rule("property_address", r"PROPERTY\s+ADDRESS", 300, r"[A-Za-z0-9 .,#-]{5,120}", Normalizer::Raw)]
}

fn le_rules() -> Vec<Rule> {
    vec![
        rule("estimated_closing_costs", r"ESTIMATED\s+CLOSING\s+COSTS", 200, r"[\$]?[\d,]+(?:\.\d+)?", Normalizer::Money),
        rule("loan_term_months", r"LOAN\s+TERM", 100, r"\d+", Normalizer::Integer),
    ]
}

fn rules_for(doc_type: DocType) -> Vec<Rule> {
    match doc_type {
        DocType::Note => note_rules(),
        DocType::Cd => cd_rules(),
        DocType::Hoi => hoi_rules(),
        DocType::Flood => flood_rules(),
        DocType::Appraisal => appraisal_rules(),
        DocType::Deed => deed_rules(),
        DocType::Le => le_rules(),
        DocType::Mismo | DocType::Csv | DocType::Json | DocType::Pdf => Vec::new(),
    }
}

/// Runs every rule for `doc_type` against `text`, returning unique hits
/// (first-wins per key, in rule order).
pub fn extract_hits(doc_type: DocType, text: &str) -> Vec<RuleHit> {
    let mut hits = Vec::new();
    let mut seen_keys = std::collections::HashSet::new();

    for rule in rules_for(doc_type) {
        if seen_keys.contains(rule.key) {
            continue;
        }
        let Some(window_caps) = rule.window.captures(text) else {
            continue;
        };
        let Some(full_match) = window_caps.get(0) else {
            continue;
        };
        let Some(window_match) = window_caps.name("window") else {
            continue;
        };
        let Some(value_match) = rule.value_pattern.find(window_match.as_str()) else {
            continue;
        };

        let raw_value = value_match.as_str();
        let value = normalize(rule.normalizer, raw_value);
        let span_end = window_match.start() + value_match.end();
        let evidence_text = text[full_match.start()..span_end].trim().to_string();
        seen_keys.insert(rule.key);
        hits.push(RuleHit {
            key: rule.key.to_string(),
            value,
            evidence_text,
        });
    }

    hits
}

/// Wraps rule hits into `Candidate`s with source `document_parse`, confidence 1.0.
pub fn extract_deterministic(doc_type: DocType, doc_id: &str, text: &str) -> Vec<Candidate> {
    extract_hits(doc_type, text)
        .into_iter()
        .map(|hit| Candidate {
            key: hit.key,
            value: hit.value,
            source: CandidateSource::DocumentParse,
            confidence: 1.0,
            doc_type: Some(doc_type),
            doc_id: Some(doc_id.to_string()),
            page: None,
            evidence: Some(Evidence {
                text_hash: {
                    use sha2::{Digest, Sha256};
                    let mut hasher = Sha256::new();
                    hasher.update(hit.evidence_text.as_bytes());
                    hex::encode(hasher.finalize())
                },
                snippet: Some(hit.evidence_text),
            }),
            extractor_version: Some("deterministic-v1".to_string()),
            timestamp: Utc::now(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn money_normalizer_strips_currency_and_commas() {
        assert_eq!(normalize_money("$250,000.50"), FieldValue::Number("250000.50".parse().unwrap()));
    }

    #[test]
    fn money_normalizer_collapses_repeated_dots() {
        match normalize_money("250..50") {
            FieldValue::Number(n) => assert_eq!(n.to_string(), "250.50"),
            other => panic!("expected number, got {other:?}"),
        }
    }

    #[test]
    fn percent_normalizer_parses_plain_float() {
        assert_eq!(normalize_percent("7.125%"), FieldValue::Number("7.125".parse().unwrap()));
    }

    #[test]
    fn integer_normalizer_takes_first_match() {
        assert_eq!(normalize_integer("360 months"), FieldValue::Number(360.into()));
    }

    #[test]
    fn boolean_normalizer_handles_required_and_not_required() {
        assert_eq!(normalize_boolean("Required"), FieldValue::Boolean(true));
        assert_eq!(normalize_boolean("Not Required"), FieldValue::Boolean(false));
        assert_eq!(normalize_boolean("maybe"), FieldValue::Null);
    }

    #[test]
    fn date_normalizer_handles_all_four_formats() {
        assert_eq!(normalize_date("2025-09-01"), FieldValue::Date("2025-09-01".to_string()));
        assert_eq!(normalize_date("9/1/25"), FieldValue::Date("2025-09-01".to_string()));
        assert_eq!(normalize_date("9/1/2025"), FieldValue::Date("2025-09-01".to_string()));
        assert_eq!(normalize_date("September 1, 2025"), FieldValue::Date("2025-09-01".to_string()));
        assert_eq!(normalize_date("1-Sep-2025"), FieldValue::Date("2025-09-01".to_string()));
    }

    #[test]
    fn date_normalizer_rejects_junk() {
        assert_eq!(normalize_date("whenever"), FieldValue::Null);
    }

    #[test]
    fn extract_hits_respects_proximity_window() {
        let text = "NOTE AMOUNT is specified below. $250,000.00 is the principal.";
        let hits = extract_hits(DocType::Note, text);
        let amount = hits.iter().find(|h| h.key == "loan_amount").unwrap();
        assert_eq!(amount.value, FieldValue::Number("250000.00".parse().unwrap()));
    }

    #[test]
    fn evidence_text_spans_label_through_value() {
        let text = "NOTE AMOUNT is specified below. $250,000.00 is the principal.";
        let hits = extract_hits(DocType::Note, text);
        let amount = hits.iter().find(|h| h.key == "loan_amount").unwrap();
        assert_eq!(
            amount.evidence_text,
            "NOTE AMOUNT is specified below. $250,000.00"
        );
    }

    #[test]
    fn extract_hits_is_first_wins_per_key() {
        let text = "NOTE AMOUNT: $100,000.00 NOTE AMOUNT: $200,000.00";
        let hits = extract_hits(DocType::Note, text);
        let amount = hits.iter().find(|h| h.key == "loan_amount").unwrap();
        assert_eq!(amount.value, FieldValue::Number("100000.00".parse().unwrap()));
    }

    #[test]
    fn extract_deterministic_sets_confidence_to_one() {
        let candidates = extract_deterministic(DocType::Note, "doc-1", "NOTE AMOUNT: $250,000.00");
        assert!(candidates.iter().all(|c| c.confidence == 1.0));
    }

    #[test]
    fn unknown_structured_doc_types_have_no_rules() {
        assert!(extract_hits(DocType::Json, "anything").is_empty());
    }
}
