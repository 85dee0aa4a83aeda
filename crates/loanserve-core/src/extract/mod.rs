//! Extraction (C6 deterministic, C7 AI): both extractors consume document text
//! and produce `Candidate` rows; neither one talks to storage directly.

pub mod ai;
pub mod deterministic;

pub use ai::{AiExtractor, AiExtractorResponse, LlmClient};
pub use deterministic::{extract_deterministic, RuleHit};
