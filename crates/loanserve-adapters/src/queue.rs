//! Outbox dispatcher: a `QueueBroker` port plus a `Worker` that claims
//! unpublished outbox rows in insertion order and publishes them.
//!
//! Claim-then-mutate is atomic over the outbox repository port, so the same
//! dispatcher works unchanged against the in-memory test double and a
//! Postgres-backed implementation (`storage.rs`).

use async_trait::async_trait;
use loanserve_core::error::CoreError;
use loanserve_core::runtime::{WorkItem, WorkResult, Worker};
use loanserve_core::outbox::{OutboxMessage, OutboxStatus};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Mutex;

/// The publish side of the outbox pattern (7 / Open Question 1: a
/// single broker trait, one concrete in-process implementation — no dual
/// RabbitMQ topology, no connection-eviction admin surface).
#[async_trait]
pub trait QueueBroker: Send + Sync {
    async fn publish(&self, topic: &str, payload: Value) -> Result<(), CoreError>;
}

/// In-process broker: publishing means enqueuing into a bounded in-memory
/// queue per topic, which is enough for the single-process deployment this
/// system targets and for tests. No external connection to evict.
#[derive(Default)]
pub struct InProcessQueueBroker {
    published: Mutex<Vec<(String, Value)>>,
}

impl InProcessQueueBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&self) -> Vec<(String, Value)> {
        std::mem::take(&mut self.published.lock().unwrap())
    }
}

#[async_trait]
impl QueueBroker for InProcessQueueBroker {
    async fn publish(&self, topic: &str, payload: Value) -> Result<(), CoreError> {
        self.published.lock().unwrap().push((topic.to_string(), payload));
        Ok(())
    }
}

/// Repository port for the outbox table itself: claim-batch-in-order plus
/// mark-published. The dispatcher never holds a row lock across a publish
/// call — it claims, releases the claim implicitly by marking published or
/// leaving `published_at` null on failure, matching the outbox's "no
/// long-held row locks" rule.
#[async_trait]
pub trait OutboxRepository: Send + Sync {
    /// Claims up to `limit` unpublished rows in insertion order. A Postgres
    /// implementation does this with `SELECT ... FOR UPDATE SKIP LOCKED`; the
    /// in-memory one below just pops from the front of an ordered deque.
    async fn claim_batch(&self, limit: usize) -> Result<Vec<OutboxMessage>, CoreError>;
    async fn mark_published(&self, id: &str) -> Result<(), CoreError>;
    async fn mark_retry(&self, id: &str) -> Result<(), CoreError>;
    async fn mark_dlq(&self, id: &str) -> Result<(), CoreError>;
    async fn insert(&self, message: OutboxMessage) -> Result<(), CoreError>;
}

#[derive(Default)]
pub struct InMemoryOutboxRepository {
    rows: Mutex<VecDeque<OutboxMessage>>,
}

impl InMemoryOutboxRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OutboxRepository for InMemoryOutboxRepository {
    async fn claim_batch(&self, limit: usize) -> Result<Vec<OutboxMessage>, CoreError> {
        let mut rows = self.rows.lock().unwrap();
        let claimed: Vec<OutboxMessage> = rows
            .iter()
            .filter(|m| m.status == OutboxStatus::Queued || m.status == OutboxStatus::RetryScheduled)
            .take(limit)
            .cloned()
            .collect();
        for message in &claimed {
            if let Some(row) = rows.iter_mut().find(|m| m.id == message.id) {
                row.status = OutboxStatus::InFlight;
            }
        }
        Ok(claimed)
    }

    async fn mark_published(&self, id: &str) -> Result<(), CoreError> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(row) = rows.iter_mut().find(|m| m.id == id) {
            row.status = OutboxStatus::Completed;
            row.published_at = Some(chrono::Utc::now());
        }
        Ok(())
    }

    async fn mark_retry(&self, id: &str) -> Result<(), CoreError> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(row) = rows.iter_mut().find(|m| m.id == id) {
            row.attempts += 1;
            row.status = OutboxStatus::RetryScheduled;
        }
        Ok(())
    }

    async fn mark_dlq(&self, id: &str) -> Result<(), CoreError> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(row) = rows.iter_mut().find(|m| m.id == id) {
            row.status = OutboxStatus::Dlq;
        }
        Ok(())
    }

    async fn insert(&self, message: OutboxMessage) -> Result<(), CoreError> {
        self.rows.lock().unwrap().push_back(message);
        Ok(())
    }
}

/// Claims one batch of outbox rows and publishes each to the broker. On
/// broker failure the row remains unpublished and its attempt counter is
/// incremented. Wired as a `Worker` so it inherits the self-healing
/// runtime's retry/DLQ/timeout behavior from `WorkerRuntime`.
pub struct OutboxDispatchWorker<R: OutboxRepository, B: QueueBroker> {
    repository: R,
    broker: B,
    batch_size: usize,
}

impl<R: OutboxRepository, B: QueueBroker> OutboxDispatchWorker<R, B> {
    pub fn new(repository: R, broker: B, batch_size: usize) -> Self {
        Self { repository, broker, batch_size }
    }
}

#[async_trait]
impl<R: OutboxRepository, B: QueueBroker> Worker for OutboxDispatchWorker<R, B> {
    fn name(&self) -> &str {
        "outbox_dispatch"
    }

    async fn execute(&self, _payload: &Value, _work_item: &WorkItem, _execution_id: &str) -> WorkResult {
        let batch = match self.repository.claim_batch(self.batch_size).await {
            Ok(batch) => batch,
            Err(e) => return WorkResult::retryable_failure(e.to_string()),
        };

        let mut published = 0usize;
        for message in &batch {
            match self.broker.publish(&message.topic, message.payload.clone()).await {
                Ok(()) => {
                    if self.repository.mark_published(&message.id).await.is_ok() {
                        published += 1;
                    }
                }
                Err(_) => {
                    let _ = self.repository.mark_retry(&message.id).await;
                }
            }
        }

        WorkResult::ok(serde_json::json!({ "published": published, "claimed": batch.len() }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn claim_batch_respects_insertion_order_and_limit() {
        let repo = InMemoryOutboxRepository::new();
        repo.insert(OutboxMessage::new("tenant-1", "notify.email", serde_json::json!({"a": 1})))
            .await
            .unwrap();
        repo.insert(OutboxMessage::new("tenant-1", "notify.sms", serde_json::json!({"b": 2})))
            .await
            .unwrap();

        let batch = repo.claim_batch(1).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].topic, "notify.email");
    }

    #[tokio::test]
    async fn dispatcher_marks_published_on_broker_success() {
        let repo = InMemoryOutboxRepository::new();
        repo.insert(OutboxMessage::new("tenant-1", "notify.email", serde_json::json!({"a": 1})))
            .await
            .unwrap();
        let broker = InProcessQueueBroker::new();
        let worker = OutboxDispatchWorker::new(repo, broker, 10);

        let work_item = WorkItem {
            id: "wi-1".to_string(),
            tenant_id: "tenant-1".to_string(),
            work_type: "outbox_dispatch".to_string(),
            correlation_id: "corr-1".to_string(),
            payload: serde_json::json!({}),
            attempt: 1,
        };
        let result = worker.execute(&serde_json::json!({}), &work_item, "exec-1").await;
        assert!(result.success);
        assert_eq!(worker.broker.drain().len(), 1);
    }

    #[tokio::test]
    async fn dispatcher_leaves_row_unpublished_on_broker_failure() {
        struct FailingBroker;
        #[async_trait]
        impl QueueBroker for FailingBroker {
            async fn publish(&self, _topic: &str, _payload: Value) -> Result<(), CoreError> {
                Err(CoreError::Transient("broker down".to_string()))
            }
        }

        let repo = InMemoryOutboxRepository::new();
        repo.insert(OutboxMessage::new("tenant-1", "notify.email", serde_json::json!({"a": 1})))
            .await
            .unwrap();
        let worker = OutboxDispatchWorker::new(repo, FailingBroker, 10);

        let work_item = WorkItem {
            id: "wi-1".to_string(),
            tenant_id: "tenant-1".to_string(),
            work_type: "outbox_dispatch".to_string(),
            correlation_id: "corr-1".to_string(),
            payload: serde_json::json!({}),
            attempt: 1,
        };
        let result = worker.execute(&serde_json::json!({}), &work_item, "exec-1").await;
        assert!(result.success);
        let published: usize = result.result.unwrap()["published"].as_u64().unwrap() as usize;
        assert_eq!(published, 0);
    }
}
