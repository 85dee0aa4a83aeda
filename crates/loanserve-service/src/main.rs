//! Worker host process: parses configuration, wires adapters into core
//! workers, and runs the outbox dispatcher to completion or until shutdown.
//!
//! No REST/gRPC surface: this system's external interfaces are storage paths
//! and outbound webhooks, not an inbound HTTP API.

use clap::{Parser, ValueEnum};
use loanserve_adapters::{
    InMemoryLoanRepository, InMemoryObjectStore, InMemoryOutboxRepository, InMemoryVendorStore,
    InProcessQueueBroker, LocalFsObjectStore, LoggingMailSender, LoggingSmsSender,
    OutboxDispatchWorker, PassthroughOcrClient, PgLoanRepository, PgVendorStore, StubLlmClient,
};
use loanserve_core::intake::ConfidenceThresholds;
use loanserve_core::runtime::{RetryConfig, WorkItem, Worker};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StorageMode {
    Auto,
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Cadence {
    Monthly,
    Weekly,
}

/// Every recognized configuration key lives here as a CLI flag; clap's `env`
/// attribute lets an operator set the same value via environment variable
/// without pulling in a separate `config` crate.
#[derive(Debug, Parser)]
#[command(name = "loanserved", version, about = "Loan servicing worker host")]
struct Cli {
    /// Loan/document/datapoint/vendor-cache storage backend.
    #[arg(long, value_enum, default_value_t = StorageMode::Auto, env = "LOANSERVE_STORAGE")]
    storage: StorageMode,
    /// PostgreSQL url for loan/datapoint/vendor-cache persistence.
    #[arg(long, env = "LOANSERVE_DATABASE_URL")]
    database_url: Option<String>,
    /// Max PostgreSQL pool connections.
    #[arg(long, default_value_t = 5, env = "LOANSERVE_PG_MAX_CONNECTIONS")]
    pg_max_connections: u32,
    /// Base directory for the local-filesystem object store fallback.
    #[arg(long, default_value = "loanserve-data/objects", env = "LOANSERVE_OBJECT_STORE_DIR")]
    object_store_dir: PathBuf,

    /// Worker runtime: max retry attempts before DLQ.
    #[arg(long, default_value_t = 3, env = "LOANSERVE_MAX_RETRIES")]
    max_retries: u32,
    /// Worker runtime: base retry delay in milliseconds.
    #[arg(long, default_value_t = 1000, env = "LOANSERVE_RETRY_DELAY_MS")]
    retry_delay_ms: u64,
    /// Worker runtime: exponential backoff multiplier.
    #[arg(long, default_value_t = 2.0, env = "LOANSERVE_BACKOFF_MULTIPLIER")]
    backoff_multiplier: f64,
    /// Worker runtime: retry delay ceiling in milliseconds.
    #[arg(long, default_value_t = 30_000, env = "LOANSERVE_MAX_RETRY_DELAY_MS")]
    max_retry_delay_ms: u64,
    /// Worker runtime: per-attempt timeout in milliseconds.
    #[arg(long, default_value_t = 60_000, env = "LOANSERVE_TIMEOUT_MS")]
    timeout_ms: u64,
    /// Worker runtime: route exhausted retries to the dead-letter queue.
    #[arg(long, default_value_t = true, env = "LOANSERVE_DLQ_ENABLED")]
    dlq_enabled: bool,
    /// Worker runtime: dedupe re-delivered work by idempotency key.
    #[arg(long, default_value_t = true, env = "LOANSERVE_IDEMPOTENCY_ENABLED")]
    idempotency_enabled: bool,
    /// Worker runtime: idempotency cache capacity (LRU-bounded).
    #[arg(long, default_value_t = 1000, env = "LOANSERVE_CACHE_CAPACITY")]
    cache_capacity: usize,

    /// Remittance cadence.
    #[arg(long, value_enum, default_value_t = Cadence::Monthly, env = "LOANSERVE_REMITTANCE_CADENCE")]
    remittance_cadence: Cadence,
    /// Remittance: business days of grace after period end before cutoff.
    #[arg(long, default_value_t = 2, env = "LOANSERVE_GRACE_DAYS_BUSINESS")]
    grace_days_business: i64,
    /// Remittance: default servicing fee in basis points.
    #[arg(long, default_value_t = 50, env = "LOANSERVE_SVC_FEE_BPS")]
    svc_fee_bps: i64,
    /// Remittance: default strip fee in basis points.
    #[arg(long, default_value_t = 0, env = "LOANSERVE_STRIP_BPS")]
    strip_bps: i64,
    /// Remittance: whether escrow passes through to the investor net.
    #[arg(long, default_value_t = false, env = "LOANSERVE_PASS_ESCROW")]
    pass_escrow: bool,
    /// Remittance: IANA timezone business-day arithmetic is computed in.
    #[arg(long, default_value = "America/New_York", env = "LOANSERVE_BUSINESS_TZ")]
    business_tz: String,
    /// Remittance: GL cash account number.
    #[arg(long, default_value = "1000-cash", env = "LOANSERVE_GL_CASH_ACCOUNT")]
    gl_cash_account: String,
    /// Remittance: GL investor-payable account number.
    #[arg(long, default_value = "2100-investor-payable", env = "LOANSERVE_GL_INVESTOR_PAYABLE_ACCOUNT")]
    gl_investor_payable_account: String,
    /// Remittance webhook URL; omit to disable webhook delivery.
    #[arg(long, env = "LOANSERVE_WEBHOOK_URL")]
    webhook_url: Option<String>,
    /// Remittance webhook HMAC signing secret.
    #[arg(long, env = "LOANSERVE_WEBHOOK_SECRET")]
    webhook_secret: Option<String>,

    /// Confidence threshold above which a candidate needs no human review.
    #[arg(long, default_value_t = 0.80, env = "LOANSERVE_ACCEPT_THRESHOLD")]
    accept_threshold: f64,
    /// Confidence threshold below which a candidate is an error-severity defect.
    #[arg(long, default_value_t = 0.60, env = "LOANSERVE_HITL_THRESHOLD")]
    hitl_threshold: f64,

    /// Path to the export mapper YAML config.
    #[arg(long, default_value = "config/export-mappers.yaml", env = "LOANSERVE_MAPPER_CONFIG_PATH")]
    mapper_config_path: PathBuf,
    /// Export mapper config version tag, recorded on each Export row.
    #[arg(long, default_value = "v1", env = "LOANSERVE_MAPPER_VERSION")]
    mapper_version: String,

    /// Vendor adapters: per-call timeout in milliseconds.
    #[arg(long, default_value_t = 10_000, env = "LOANSERVE_VENDOR_TIMEOUT_MS")]
    vendor_timeout_ms: u64,
    /// Vendor adapters: retry attempts beyond the first.
    #[arg(long, default_value_t = 2, env = "LOANSERVE_VENDOR_RETRIES")]
    vendor_retries: u32,
    /// Vendor adapters: cache TTL in minutes.
    #[arg(long, default_value_t = 60, env = "LOANSERVE_VENDOR_CACHE_TTL_MINUTES")]
    vendor_cache_ttl_minutes: i64,

    /// Outbox dispatcher poll interval in milliseconds.
    #[arg(long, default_value_t = 500, env = "LOANSERVE_OUTBOX_POLL_MS")]
    outbox_poll_ms: u64,
    /// Outbox dispatcher batch size per poll.
    #[arg(long, default_value_t = 50, env = "LOANSERVE_OUTBOX_BATCH_SIZE")]
    outbox_batch_size: usize,
}

/// Threads the two HITL confidence thresholds (§6/§8) from the CLI into the
/// document intake worker's `ConfidenceThresholds`, mirroring `build_retry_config`.
fn build_confidence_thresholds(cli: &Cli) -> ConfidenceThresholds {
    ConfidenceThresholds {
        accept_threshold: cli.accept_threshold as f32,
        hitl_threshold: cli.hitl_threshold as f32,
    }
}

fn build_retry_config(cli: &Cli) -> RetryConfig {
    RetryConfig {
        max_attempts: cli.max_retries,
        base_delay: Duration::from_millis(cli.retry_delay_ms),
        backoff_multiplier: cli.backoff_multiplier,
        max_delay: Duration::from_millis(cli.max_retry_delay_ms),
        timeout: Duration::from_millis(cli.timeout_ms),
        dlq_enabled: cli.dlq_enabled,
        idempotency_enabled: cli.idempotency_enabled,
        cache_capacity: cli.cache_capacity,
    }
}

/// Storage backend selected at startup. `Auto` prefers Postgres when a
/// database url is configured, otherwise falls back to memory; `Postgres`
/// with no url is a `Fatal` config error, which this binary treats as exit
/// code 1 before any worker runs.
enum Storage {
    Memory {
        _repository: std::sync::Arc<InMemoryLoanRepository>,
        _vendor_store: std::sync::Arc<InMemoryVendorStore>,
    },
    Postgres {
        _repository: std::sync::Arc<PgLoanRepository>,
        _vendor_store: std::sync::Arc<PgVendorStore>,
    },
}

async fn resolve_storage(cli: &Cli) -> anyhow::Result<Storage> {
    let resolved_url = cli.database_url.clone().or_else(|| std::env::var("DATABASE_URL").ok());

    let use_postgres = match cli.storage {
        StorageMode::Memory => false,
        StorageMode::Postgres => true,
        StorageMode::Auto => resolved_url.is_some(),
    };

    if !use_postgres {
        return Ok(Storage::Memory {
            _repository: std::sync::Arc::new(InMemoryLoanRepository::new()),
            _vendor_store: std::sync::Arc::new(InMemoryVendorStore::new()),
        });
    }

    let database_url = resolved_url
        .ok_or_else(|| anyhow::anyhow!("storage=postgres requires --database-url or DATABASE_URL"))?;

    let repository = PgLoanRepository::connect(&database_url, cli.pg_max_connections)
        .await
        .map_err(|e| anyhow::anyhow!("failed to connect loan repository: {e}"))?;
    let vendor_store = PgVendorStore::connect(&database_url, cli.pg_max_connections)
        .await
        .map_err(|e| anyhow::anyhow!("failed to connect vendor store: {e}"))?;

    Ok(Storage::Postgres {
        _repository: std::sync::Arc::new(repository),
        _vendor_store: std::sync::Arc::new(vendor_store),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "loanserve_service=info,info".to_string()))
        .init();

    let cli = Cli::parse();

    let storage = match resolve_storage(&cli).await {
        Ok(storage) => storage,
        Err(e) => {
            tracing::error!("fatal startup error: {e}");
            std::process::exit(1);
        }
    };
    match &storage {
        Storage::Memory { .. } => info!("loan storage backend: in-memory"),
        Storage::Postgres { .. } => info!("loan storage backend: postgres"),
    }

    let _object_store: Box<dyn loanserve_adapters::ObjectStore> = if matches!(storage, Storage::Memory { .. }) {
        Box::new(InMemoryObjectStore::new())
    } else {
        Box::new(LocalFsObjectStore::new(cli.object_store_dir.clone()))
    };

    let retry_config = build_retry_config(&cli);
    info!(
        max_attempts = retry_config.max_attempts,
        timeout_ms = retry_config.timeout.as_millis() as u64,
        "worker runtime configured"
    );

    let confidence_thresholds = build_confidence_thresholds(&cli);
    info!(
        accept_threshold = confidence_thresholds.accept_threshold,
        hitl_threshold = confidence_thresholds.hitl_threshold,
        "confidence thresholds configured"
    );

    let _mail_sender = LoggingMailSender::new();
    let _sms_sender = LoggingSmsSender::new();
    let _llm_client = StubLlmClient;
    let _ocr_client = PassthroughOcrClient;

    let outbox_repository = InMemoryOutboxRepository::new();
    let broker = InProcessQueueBroker::new();
    let dispatcher = OutboxDispatchWorker::new(outbox_repository, broker, cli.outbox_batch_size);

    info!(
        poll_ms = cli.outbox_poll_ms,
        batch_size = cli.outbox_batch_size,
        "starting outbox dispatch loop"
    );

    let mut poll_interval = tokio::time::interval(Duration::from_millis(cli.outbox_poll_ms));
    let mut shutdown = Box::pin(tokio::signal::ctrl_c());

    loop {
        tokio::select! {
            _ = poll_interval.tick() => {
                let work_item = WorkItem {
                    id: uuid::Uuid::new_v4().to_string(),
                    tenant_id: "system".to_string(),
                    work_type: "outbox_dispatch".to_string(),
                    correlation_id: uuid::Uuid::new_v4().to_string(),
                    payload: serde_json::json!({}),
                    attempt: 1,
                };
                let result = dispatcher.execute(&work_item.payload, &work_item, &work_item.id).await;
                if !result.success {
                    tracing::warn!(error = ?result.error, "outbox dispatch failed");
                }
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, exiting");
                break;
            }
        }
    }

    Ok(())
}
