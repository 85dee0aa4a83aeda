//! Self-Healing Worker Runtime. Every asynchronous unit of work in this
//! system is a `Worker`; this module supplies the idempotency cache, timeout
//! race, retry/backoff, DLQ handoff and health reporting around it so workers
//! themselves only implement `execute`.
//!
//! A thin trait for the unit of work, a generic struct composing the
//! cross-cutting concerns around it, `tokio::select!` for racing against a
//! timeout rather than hand-rolled polling.

use crate::audit::{AuditEvent, AuditLedger};
use crate::error::{CoreError, ErrorClass, FailureClass};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

/// Identifies one unit of dispatched work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    pub tenant_id: String,
    pub work_type: String,
    pub correlation_id: String,
    pub payload: Value,
    pub attempt: u32,
}

/// What a `Worker::execute` call reports back to the runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkResult {
    pub success: bool,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub should_retry: bool,
}

impl WorkResult {
    pub fn ok(result: Value) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
            should_retry: false,
        }
    }

    pub fn retryable_failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error.into()),
            should_retry: true,
        }
    }

    pub fn terminal_failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error.into()),
            should_retry: false,
        }
    }
}

/// The unit-of-work contract every asynchronous worker implements. No
/// inheritance, no base class: just this interface, composed with the runtime.
#[async_trait]
pub trait Worker: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, payload: &Value, work_item: &WorkItem, execution_id: &str) -> WorkResult;
}

#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub backoff_multiplier: f64,
    pub max_delay: Duration,
    pub timeout: Duration,
    pub dlq_enabled: bool,
    pub idempotency_enabled: bool,
    pub cache_capacity: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_millis(30_000),
            timeout: Duration::from_millis(60_000),
            dlq_enabled: true,
            idempotency_enabled: true,
            cache_capacity: 1000,
        }
    }
}

/// `delay(n) = min(baseDelay * multiplier^(n-1), maxDelay)`, n is 1-indexed attempt number.
pub fn retry_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let n = attempt.max(1) as i32;
    let scaled = config.base_delay.as_millis() as f64 * config.backoff_multiplier.powi(n - 1);
    let capped = scaled.min(config.max_delay.as_millis() as f64);
    Duration::from_millis(capped.max(0.0) as u64)
}

/// `H(workerName, type, payload, correlationId)`, blake3-hex, a stable cache key
/// independent of wall-clock or attempt number so retries of the same logical
/// work hit the cache.
pub fn idempotency_key(worker_name: &str, work_type: &str, payload: &Value, correlation_id: &str) -> String {
    let material = serde_json::json!({
        "worker": worker_name,
        "type": work_type,
        "payload": payload,
        "correlation_id": correlation_id,
    });
    let bytes = serde_json::to_vec(&material).unwrap_or_default();
    blake3::hash(&bytes).to_hex().to_string()
}

/// Bounded LRU-by-insertion idempotency cache; eviction count is exposed for
/// health reporting.
struct IdempotencyCache {
    capacity: usize,
    entries: HashMap<String, WorkResult>,
    order: VecDeque<String>,
    evictions: u64,
}

impl IdempotencyCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::new(),
            order: VecDeque::new(),
            evictions: 0,
        }
    }

    fn get(&self, key: &str) -> Option<WorkResult> {
        self.entries.get(key).cloned()
    }

    fn insert(&mut self, key: String, result: WorkResult) {
        if self.entries.contains_key(&key) {
            return;
        }
        if self.capacity > 0 && self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
                self.evictions += 1;
            }
        }
        self.order.push_back(key.clone());
        self.entries.insert(key, result);
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// An item that exhausted retries, ready for durable, operator-replayable storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub work_item: WorkItem,
    pub execution_id: String,
    pub final_error: String,
    pub failed_at: chrono::DateTime<chrono::Utc>,
}

/// In-process DLQ sink. A durable sink (Postgres-backed) is expected to wrap or
/// replace this in the adapters layer; the runtime only needs `push`/`replay`.
#[derive(Debug, Default)]
pub struct DeadLetterQueue {
    items: Mutex<Vec<DeadLetter>>,
}

impl DeadLetterQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, item: DeadLetter) {
        self.items.lock().unwrap().push(item);
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pulls a DLQ item back out for replay. The returned `WorkItem` has its
    /// attempt counter reset to 0, matching the "replayed DLQ item starts
    /// fresh" operator policy; a caller wanting to preserve the original
    /// attempt count can read it off the `DeadLetter` before requeuing.
    pub fn replay(&self, work_id: &str) -> Option<WorkItem> {
        let mut items = self.items.lock().unwrap();
        let index = items.iter().position(|d| d.work_item.id == work_id)?;
        let dead = items.remove(index);
        let mut work_item = dead.work_item;
        work_item.attempt = 0;
        Some(work_item)
    }

    pub fn entries(&self) -> Vec<DeadLetter> {
        self.items.lock().unwrap().clone()
    }
}

/// `{workerName, isHealthy, cacheSize, config}`, mirrored per worker so a
/// runtime-wide registry (outside this module) can aggregate them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHealth {
    pub worker_name: String,
    pub is_healthy: bool,
    pub cache_size: usize,
    pub cache_evictions: u64,
    pub dlq_size: usize,
    pub max_attempts: u32,
}

/// Composes idempotency, timeout, retry/backoff, DLQ and audit emission around
/// one `Worker` implementation.
pub struct WorkerRuntime<W: Worker> {
    worker: W,
    config: RetryConfig,
    cache: Mutex<IdempotencyCache>,
    dlq: DeadLetterQueue,
}

impl<W: Worker> WorkerRuntime<W> {
    pub fn new(worker: W, config: RetryConfig) -> Self {
        let cache = Mutex::new(IdempotencyCache::new(config.cache_capacity));
        Self {
            worker,
            config,
            cache,
            dlq: DeadLetterQueue::new(),
        }
    }

    pub fn dlq(&self) -> &DeadLetterQueue {
        &self.dlq
    }

    pub fn health(&self) -> WorkerHealth {
        let cache = self.cache.lock().unwrap();
        WorkerHealth {
            worker_name: self.worker.name().to_string(),
            is_healthy: true,
            cache_size: cache.len(),
            cache_evictions: cache.evictions,
            dlq_size: self.dlq.len(),
            max_attempts: self.config.max_attempts,
        }
    }

    /// Drives one `WorkItem` to completion or DLQ, emitting audit events at
    /// each transition. `execution_id` is supplied by the caller (typically a
    /// fresh uuid per attempt) so callers can correlate their own logs.
    pub async fn dispatch(
        &self,
        audit: &mut AuditLedger,
        work_item: WorkItem,
        execution_id: &str,
    ) -> WorkResult {
        audit.append(AuditEvent::new(
            work_item.tenant_id.clone(),
            "WORK_STARTED",
            "worker_runtime",
            format!("urn:work:{}", work_item.id),
            serde_json::json!({"worker": self.worker.name(), "execution_id": execution_id, "attempt": work_item.attempt}),
        ));

        let key = idempotency_key(
            self.worker.name(),
            &work_item.work_type,
            &work_item.payload,
            &work_item.correlation_id,
        );

        if self.config.idempotency_enabled {
            let cached = self.cache.lock().unwrap().get(&key);
            if let Some(cached) = cached {
                audit.append(AuditEvent::new(
                    work_item.tenant_id.clone(),
                    "WORK_CACHED",
                    "worker_runtime",
                    format!("urn:work:{}", work_item.id),
                    serde_json::json!({"worker": self.worker.name(), "execution_id": execution_id}),
                ));
                return cached;
            }
        }

        let started = std::time::Instant::now();
        let raced = tokio::time::timeout(
            self.config.timeout,
            self.worker.execute(&work_item.payload, &work_item, execution_id),
        )
        .await;

        let result = match raced {
            Ok(result) => result,
            Err(_) => WorkResult::retryable_failure(format!(
                "work timed out after {}ms",
                self.config.timeout.as_millis()
            )),
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        if result.success {
            if self.config.idempotency_enabled {
                self.cache.lock().unwrap().insert(key, result.clone());
            }
            audit.append(AuditEvent::new(
                work_item.tenant_id.clone(),
                "WORK_COMPLETED",
                "worker_runtime",
                format!("urn:work:{}", work_item.id),
                serde_json::json!({"worker": self.worker.name(), "execution_id": execution_id, "duration_ms": duration_ms}),
            ));
            return result;
        }

        let next_attempt = work_item.attempt + 1;
        let can_retry = result.should_retry && next_attempt < self.config.max_attempts;

        if can_retry {
            audit.append(AuditEvent::new(
                work_item.tenant_id.clone(),
                "WORK_FAILED",
                "worker_runtime",
                format!("urn:work:{}", work_item.id),
                serde_json::json!({
                    "worker": self.worker.name(),
                    "execution_id": execution_id,
                    "duration_ms": duration_ms,
                    "error": result.error,
                    "next_attempt": next_attempt,
                }),
            ));
            return result;
        }

        audit.append(AuditEvent::new(
            work_item.tenant_id.clone(),
            "WORK_ERROR",
            "worker_runtime",
            format!("urn:work:{}", work_item.id),
            serde_json::json!({
                "worker": self.worker.name(),
                "execution_id": execution_id,
                "duration_ms": duration_ms,
                "error": result.error,
            }),
        ));

        if self.config.dlq_enabled {
            self.dlq.push(DeadLetter {
                work_item: work_item.clone(),
                execution_id: execution_id.to_string(),
                final_error: result.error.clone().unwrap_or_default(),
                failed_at: chrono::Utc::now(),
            });
            audit.append(AuditEvent::new(
                work_item.tenant_id.clone(),
                "WORK_DLQ",
                "worker_runtime",
                format!("urn:work:{}", work_item.id),
                serde_json::json!({"worker": self.worker.name(), "execution_id": execution_id}),
            ));
        }

        result
    }
}

/// Default retryable classification over error messages for workers that
/// return opaque strings instead of typed errors: network resets,
/// DNS failures, 429/5xx, explicit broker-unavailability, "rate limit".
pub fn is_retryable_message(message: &str) -> bool {
    let lowered = message.to_lowercase();
    const RETRYABLE_MARKERS: &[&str] = &[
        "connection reset",
        "timed out",
        "timeout",
        "dns",
        "429",
        "rate limit",
        "broker unavailable",
        "deadlock",
    ];
    const HTTP_5XX: std::ops::Range<u32> = 500..600;

    if RETRYABLE_MARKERS.iter().any(|m| lowered.contains(m)) {
        return true;
    }
    if let Some(status) = extract_leading_status(&lowered) {
        return HTTP_5XX.contains(&status);
    }
    false
}

fn extract_leading_status(text: &str) -> Option<u32> {
    text.split_whitespace()
        .find_map(|token| token.trim_matches(|c: char| !c.is_ascii_digit()).parse::<u32>().ok())
        .filter(|n| (100..600).contains(n))
}

/// Maps a typed `ErrorClass` onto `should_retry`, used by workers that have a
/// real `CoreError` rather than a bare string.
pub fn should_retry(error: &impl ErrorClass) -> bool {
    matches!(error.class(), FailureClass::Transient)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysFails {
        retryable: bool,
    }

    #[async_trait]
    impl Worker for AlwaysFails {
        fn name(&self) -> &str {
            "always_fails"
        }

        async fn execute(&self, _payload: &Value, _work_item: &WorkItem, _execution_id: &str) -> WorkResult {
            if self.retryable {
                WorkResult::retryable_failure("transient blip")
            } else {
                WorkResult::terminal_failure("bad schema")
            }
        }
    }

    struct Succeeds;

    #[async_trait]
    impl Worker for Succeeds {
        fn name(&self) -> &str {
            "succeeds"
        }

        async fn execute(&self, payload: &Value, _work_item: &WorkItem, _execution_id: &str) -> WorkResult {
            WorkResult::ok(payload.clone())
        }
    }

    fn sample_item() -> WorkItem {
        WorkItem {
            id: "work-1".to_string(),
            tenant_id: "tenant-1".to_string(),
            work_type: "intake".to_string(),
            correlation_id: "corr-1".to_string(),
            payload: serde_json::json!({"doc_id": "doc-1"}),
            attempt: 0,
        }
    }

    #[test]
    fn retry_delay_grows_exponentially_and_caps() {
        let config = RetryConfig {
            base_delay: Duration::from_millis(1000),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_millis(3000),
            ..Default::default()
        };
        assert_eq!(retry_delay(&config, 1), Duration::from_millis(1000));
        assert_eq!(retry_delay(&config, 2), Duration::from_millis(2000));
        assert_eq!(retry_delay(&config, 3), Duration::from_millis(3000));
        assert_eq!(retry_delay(&config, 4), Duration::from_millis(3000));
    }

    #[test]
    fn idempotency_key_is_stable_for_identical_inputs() {
        let payload = serde_json::json!({"a": 1});
        let first = idempotency_key("w", "t", &payload, "c");
        let second = idempotency_key("w", "t", &payload, "c");
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn successful_work_is_cached_and_not_re_executed() {
        let runtime = WorkerRuntime::new(Succeeds, RetryConfig::default());
        let mut audit = AuditLedger::new();
        let item = sample_item();
        let first = runtime.dispatch(&mut audit, item.clone(), "exec-1").await;
        assert!(first.success);
        let second = runtime.dispatch(&mut audit, item, "exec-2").await;
        assert!(second.success);
        let events: Vec<&str> = audit.entries().iter().map(|e| e.event.event_type.as_str()).collect();
        assert!(events.contains(&"WORK_CACHED"));
    }

    #[tokio::test]
    async fn non_retryable_failure_goes_straight_to_dlq() {
        let runtime = WorkerRuntime::new(AlwaysFails { retryable: false }, RetryConfig::default());
        let mut audit = AuditLedger::new();
        let result = runtime.dispatch(&mut audit, sample_item(), "exec-1").await;
        assert!(!result.success);
        assert_eq!(runtime.dlq().len(), 1);
    }

    #[tokio::test]
    async fn retryable_failure_stays_off_dlq_until_attempts_exhausted() {
        let config = RetryConfig {
            max_attempts: 2,
            ..Default::default()
        };
        let runtime = WorkerRuntime::new(AlwaysFails { retryable: true }, config);
        let mut audit = AuditLedger::new();
        let mut item = sample_item();

        let first = runtime.dispatch(&mut audit, item.clone(), "exec-1").await;
        assert!(first.should_retry);
        assert_eq!(runtime.dlq().len(), 0);

        item.attempt = 1;
        let second = runtime.dispatch(&mut audit, item, "exec-2").await;
        assert!(!second.should_retry);
        assert_eq!(runtime.dlq().len(), 1);
    }

    #[tokio::test]
    async fn dlq_replay_resets_attempt_counter() {
        let runtime = WorkerRuntime::new(AlwaysFails { retryable: false }, RetryConfig::default());
        let mut audit = AuditLedger::new();
        let mut item = sample_item();
        item.attempt = 2;
        runtime.dispatch(&mut audit, item.clone(), "exec-1").await;
        let replayed = runtime.dlq().replay(&item.id).unwrap();
        assert_eq!(replayed.attempt, 0);
        assert!(runtime.dlq().is_empty());
    }

    #[test]
    fn retryable_message_classification() {
        assert!(is_retryable_message("connection reset by peer"));
        assert!(is_retryable_message("upstream returned 503"));
        assert!(is_retryable_message("rate limit exceeded"));
        assert!(!is_retryable_message("schema validation failed"));
        assert!(!is_retryable_message("not found"));
    }
}
