//! Vendor Adapter Layer: shared HTTP client with retry/backoff/circuit
//! breaker, plus four concrete vendor adapters (UCDP/SSR, Flood, Title, HOI).
//!
//! One narrow trait per external capability, one concrete struct per
//! provider. The shared client's circuit breaker is a three-state machine
//! (closed/open/half-open): trips after `circuit_failure_threshold`
//! consecutive failures, allows one probe call through after
//! `circuit_cooldown_ms`.

use async_trait::async_trait;
use loanserve_core::error::CoreError;
use loanserve_core::types::{VendorAuditEntry, VendorCacheEntry};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// A vendor call's four steps: key -> cache lookup -> network
/// call -> cache + audit write. Implementations of `VendorStore` own the
/// cache and audit persistence; the client only computes timings and bodies.
#[async_trait]
pub trait VendorStore: Send + Sync {
    async fn get_cached(&self, tenant_id: &str, vendor: &str, key: &str) -> Result<Option<Value>, CoreError>;
    async fn put_cached(&self, entry: VendorCacheEntry) -> Result<(), CoreError>;
    async fn record_audit(&self, entry: VendorAuditEntry) -> Result<(), CoreError>;
}

/// Auth scheme a vendor endpoint expects on its request.
#[derive(Debug, Clone)]
pub enum VendorAuth {
    Bearer(String),
    ApiKeyHeader(String),
}

#[derive(Debug, Clone)]
pub struct VendorConfig {
    pub base_url: String,
    pub auth: VendorAuth,
    pub timeout_ms: u64,
    pub retries: u32,
    pub cache_ttl_minutes: i64,
    pub circuit_failure_threshold: u32,
    pub circuit_cooldown_ms: u64,
}

/// Closed/Open/Half-Open circuit state, tripped after
/// `circuit_failure_threshold` consecutive failures and probed again after
/// `circuit_cooldown_ms` has elapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

struct CircuitBreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// Per-vendor circuit breaker. One instance guards one `VendorHttpClient`;
/// the shared client holds one breaker per vendor it's configured for.
pub struct CircuitBreaker {
    failure_threshold: u32,
    cooldown: Duration,
    inner: Mutex<CircuitBreakerState>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold,
            cooldown,
            inner: Mutex::new(CircuitBreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
        }
    }

    /// Returns `Err` if the circuit is open and the cooldown hasn't elapsed;
    /// otherwise lets the call proceed (transitioning Open -> HalfOpen once
    /// the cooldown passes, so exactly one probe call is allowed through).
    fn guard(&self) -> Result<(), CoreError> {
        let mut state = self.inner.lock().unwrap();
        match state.state {
            CircuitState::Closed => Ok(()),
            CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let elapsed = state.opened_at.map(|t| t.elapsed()).unwrap_or(Duration::MAX);
                if elapsed >= self.cooldown {
                    state.state = CircuitState::HalfOpen;
                    Ok(())
                } else {
                    Err(CoreError::Transient("circuit breaker open for vendor".to_string()))
                }
            }
        }
    }

    fn record_success(&self) {
        let mut state = self.inner.lock().unwrap();
        state.consecutive_failures = 0;
        state.state = CircuitState::Closed;
        state.opened_at = None;
    }

    fn record_failure(&self) {
        let mut state = self.inner.lock().unwrap();
        state.consecutive_failures += 1;
        if state.state == CircuitState::HalfOpen || state.consecutive_failures >= self.failure_threshold {
            state.state = CircuitState::Open;
            state.opened_at = Some(Instant::now());
        }
    }
}

/// Shared HTTP client used by every vendor adapter: retry with linear
/// backoff `300*(n+1)` ms between attempts, JSON-safe decode
/// with a `{"raw": text}` fallback, and the circuit breaker above.
pub struct VendorHttpClient {
    http: reqwest::Client,
    breaker: CircuitBreaker,
}

impl VendorHttpClient {
    pub fn new(config: &VendorConfig) -> Result<Self, CoreError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| CoreError::Fatal(format!("failed to build vendor http client: {e}")))?;
        Ok(Self {
            http,
            breaker: CircuitBreaker::new(config.circuit_failure_threshold, Duration::from_millis(config.circuit_cooldown_ms)),
        })
    }

    /// Performs one vendor GET, auditing every attempt regardless of outcome.
    /// Returns the decoded JSON body plus latency, for the caller to cache.
    pub async fn call(
        &self,
        config: &VendorConfig,
        path: &str,
        auth: &VendorAuth,
    ) -> Result<(Value, u64, Option<u16>), CoreError> {
        self.breaker.guard()?;

        let url = format!("{}{}", config.base_url.trim_end_matches('/'), path);
        let mut last_err: Option<CoreError> = None;

        for attempt in 0..=config.retries {
            let started = Instant::now();
            let mut request = self.http.get(&url);
            request = match auth {
                VendorAuth::Bearer(token) => request.bearer_auth(token),
                VendorAuth::ApiKeyHeader(key) => request.header("X-API-KEY", key),
            };

            let outcome = request.send().await;
            let latency_ms = started.elapsed().as_millis() as u64;

            match outcome {
                Ok(response) => {
                    let status = response.status().as_u16();
                    let text = response.text().await.unwrap_or_default();
                    let body: Value = serde_json::from_str(&text)
                        .unwrap_or_else(|_| serde_json::json!({ "raw": text }));

                    if (200..300).contains(&status) {
                        self.breaker.record_success();
                        return Ok((body, latency_ms, Some(status)));
                    }

                    self.breaker.record_failure();
                    last_err = Some(CoreError::Transient(format!("vendor returned status {status}")));
                }
                Err(e) => {
                    self.breaker.record_failure();
                    last_err = Some(CoreError::Transient(format!("vendor request failed: {e}")));
                }
            }

            if attempt < config.retries {
                tokio::time::sleep(Duration::from_millis(300 * (attempt as u64 + 1))).await;
            }
        }

        Err(last_err.unwrap_or_else(|| CoreError::Transient("vendor call exhausted retries".to_string())))
    }
}

fn sha256_prefix(input: &str, len: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest.chars().take(len).collect()
}

/// One vendor call orchestrated end to end: cache lookup, network call on
/// miss, cache + audit write. Shared by all four adapters below.
async fn fetch_with_cache(
    store: &dyn VendorStore,
    client: &VendorHttpClient,
    config: &VendorConfig,
    tenant_id: &str,
    vendor: &str,
    cache_key: &str,
    path: &str,
    endpoint: &str,
) -> Result<Value, CoreError> {
    if let Some(cached) = store.get_cached(tenant_id, vendor, cache_key).await? {
        return Ok(cached);
    }

    let request_meta = serde_json::json!({ "path": path });
    let result = client.call(config, path, &config.auth).await;

    let (body, latency_ms, status) = match &result {
        Ok((body, latency_ms, status)) => (body.clone(), *latency_ms, *status),
        Err(_) => (Value::Null, 0, None),
    };

    store
        .record_audit(VendorAuditEntry {
            tenant_id: tenant_id.to_string(),
            vendor: vendor.to_string(),
            endpoint: endpoint.to_string(),
            status,
            request: request_meta,
            response: body.clone(),
            latency_ms,
            timestamp: chrono::Utc::now(),
        })
        .await?;

    let (body, _latency_ms, _status) = result?;

    store
        .put_cached(VendorCacheEntry {
            tenant_id: tenant_id.to_string(),
            vendor: vendor.to_string(),
            key: cache_key.to_string(),
            payload: body.clone(),
            expires_at: chrono::Utc::now() + chrono::Duration::minutes(config.cache_ttl_minutes),
        })
        .await?;

    Ok(body)
}

/// UCDP/SSR (Bearer). Cache key: `"SSR:<appraisalId>"`.
pub struct UcdpSsrAdapter<'a> {
    pub store: &'a dyn VendorStore,
    pub client: VendorHttpClient,
    pub config: VendorConfig,
}

impl<'a> UcdpSsrAdapter<'a> {
    pub async fn submission_status(&self, tenant_id: &str, appraisal_id: &str) -> Result<Value, CoreError> {
        let cache_key = format!("SSR:{appraisal_id}");
        fetch_with_cache(
            self.store,
            &self.client,
            &self.config,
            tenant_id,
            "ucdp_ssr",
            &cache_key,
            &format!("/ssr/{appraisal_id}"),
            "ssr_submission_status",
        )
        .await
    }
}

/// Flood determination (X-API-KEY). Cache key:
/// `"FLOOD:<sha256(address)[0..16]>"`.
pub struct FloodAdapter<'a> {
    pub store: &'a dyn VendorStore,
    pub client: VendorHttpClient,
    pub config: VendorConfig,
}

impl<'a> FloodAdapter<'a> {
    pub async fn determination(&self, tenant_id: &str, address: &str) -> Result<Value, CoreError> {
        let cache_key = format!("FLOOD:{}", sha256_prefix(address, 16));
        fetch_with_cache(
            self.store,
            &self.client,
            &self.config,
            tenant_id,
            "flood",
            &cache_key,
            &format!("/determination?address={}", urlencode(address)),
            "flood_determination",
        )
        .await
    }
}

/// Title verification (X-API-KEY). Cache key: `"TITLE:<loanId>"`.
pub struct TitleAdapter<'a> {
    pub store: &'a dyn VendorStore,
    pub client: VendorHttpClient,
    pub config: VendorConfig,
}

impl<'a> TitleAdapter<'a> {
    pub async fn verify(&self, tenant_id: &str, loan_id: &str) -> Result<Value, CoreError> {
        let cache_key = format!("TITLE:{loan_id}");
        fetch_with_cache(
            self.store,
            &self.client,
            &self.config,
            tenant_id,
            "title",
            &cache_key,
            &format!("/title/{loan_id}"),
            "title_verify",
        )
        .await
    }
}

/// HOI verification (X-API-KEY). Cache key: `"HOI:<loanId>"`.
pub struct HoiAdapter<'a> {
    pub store: &'a dyn VendorStore,
    pub client: VendorHttpClient,
    pub config: VendorConfig,
}

impl<'a> HoiAdapter<'a> {
    pub async fn verify(&self, tenant_id: &str, loan_id: &str) -> Result<Value, CoreError> {
        let cache_key = format!("HOI:{loan_id}");
        fetch_with_cache(
            self.store,
            &self.client,
            &self.config,
            tenant_id,
            "hoi",
            &cache_key,
            &format!("/hoi/{loan_id}"),
            "hoi_verify",
        )
        .await
    }
}

fn urlencode(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_string() } else { format!("%{:02X}", c as u32) })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn circuit_breaker_opens_after_threshold_failures() {
        let breaker = CircuitBreaker::new(3, Duration::from_millis(50));
        assert!(breaker.guard().is_ok());
        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.guard().is_ok());
        breaker.record_failure();
        assert!(breaker.guard().is_err());
    }

    #[test]
    fn circuit_breaker_half_opens_after_cooldown() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(10));
        breaker.record_failure();
        assert!(breaker.guard().is_err());
        std::thread::sleep(Duration::from_millis(20));
        assert!(breaker.guard().is_ok());
    }

    #[test]
    fn circuit_breaker_recovers_on_success() {
        let breaker = CircuitBreaker::new(2, Duration::from_millis(10));
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        assert!(breaker.guard().is_ok());
    }

    #[test]
    fn flood_cache_key_uses_truncated_address_hash() {
        let key = sha256_prefix("123 Main St", 16);
        assert_eq!(key.len(), 16);
        assert_eq!(key, sha256_prefix("123 Main St", 16));
    }
}
