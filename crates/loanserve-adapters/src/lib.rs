//! Trait implementations for everything outside the domain core's control:
//! object storage, Postgres-backed repositories, the vendor HTTP client and
//! its four adapters, the outbox queue broker, notification senders, and the
//! OCR/LLM/webhook clients. `loanserve-core` defines the ports; this crate
//! wires concrete backends behind them.

#![deny(unsafe_code)]

pub mod llm;
pub mod notify;
pub mod ocr;
pub mod queue;
pub mod storage;
pub mod vendor;
pub mod webhook;

pub use llm::{HttpLlmClient, StubLlmClient};
pub use notify::{HttpWebhookMailSender, HttpWebhookSmsSender, LoggingMailSender, LoggingSmsSender};
pub use ocr::{HttpOcrClient, PassthroughOcrClient};
pub use queue::{
    InMemoryOutboxRepository, InProcessQueueBroker, OutboxDispatchWorker, OutboxRepository,
    QueueBroker,
};
pub use storage::{
    InMemoryLoanRepository, InMemoryObjectStore, InMemoryVendorStore, LocalFsObjectStore,
    ObjectStore, PgLoanRepository, PgVendorStore,
};
pub use vendor::{
    CircuitBreaker, FloodAdapter, HoiAdapter, TitleAdapter, UcdpSsrAdapter, VendorAuth,
    VendorConfig, VendorHttpClient, VendorStore,
};
pub use webhook::{ExportWebhookPayload, WebhookSender};
