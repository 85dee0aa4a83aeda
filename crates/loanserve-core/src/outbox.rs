//! Outbox Dispatcher & Notification Worker (C10, C11). Writers append an
//! `OutboxMessage` in the same DB transaction as the domain change; a
//! dispatcher (in adapters, against the `OutboxRepository` trait) claims
//! unpublished rows in insertion order and publishes them. Consumers are
//! ordinary `Worker` impls, idempotent on `message_id`.

use crate::error::{CoreError, ErrorClass};
use crate::runtime::{Worker, WorkItem, WorkResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Mutex;

/// Lifecycle of an outbox row, matching "queued -> in-flight -> {completed |
/// retry-scheduled | dlq}" at the message level.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Queued,
    InFlight,
    Completed,
    RetryScheduled,
    Dlq,
}

/// A row written in the same transaction as the domain change it describes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub id: String,
    pub tenant_id: String,
    pub topic: String,
    pub payload: Value,
    pub status: OutboxStatus,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
}

impl OutboxMessage {
    pub fn new(tenant_id: impl Into<String>, topic: impl Into<String>, payload: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: tenant_id.into(),
            topic: topic.into(),
            payload,
            status: OutboxStatus::Queued,
            attempts: 0,
            created_at: Utc::now(),
            published_at: None,
        }
    }
}

/// A notification destined for a human (email/SMS), produced by downstream
/// consumers reacting to outbox messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub message_id: String,
    pub tenant_id: String,
    pub channel: NotificationChannel,
    pub recipient: String,
    pub subject: Option<String>,
    pub body: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotificationChannel {
    Email,
    Sms,
}

/// Narrow sender interfaces implemented by the adapters layer; provider SDKs
/// are explicitly out of scope.
#[async_trait]
pub trait MailSender: Send + Sync {
    async fn send_mail(&self, recipient: &str, subject: &str, body: &str) -> Result<(), CoreError>;
}

#[async_trait]
pub trait SmsSender: Send + Sync {
    async fn send_sms(&self, recipient: &str, body: &str) -> Result<(), CoreError>;
}

/// A `Worker` that consumes outbox-originated notifications. Idempotent on
/// `message_id`: a notification already delivered for a given message id is a
/// no-op, tracked here with an in-process set (durable idempotency for a given
/// message id ultimately rests on the upstream `WorkerRuntime`'s cache plus
/// the outbox row's own uniqueness).
pub struct NotificationWorker<M: MailSender, S: SmsSender> {
    mailer: M,
    sms: S,
    delivered: Mutex<HashSet<String>>,
}

impl<M: MailSender, S: SmsSender> NotificationWorker<M, S> {
    pub fn new(mailer: M, sms: S) -> Self {
        Self {
            mailer,
            sms,
            delivered: Mutex::new(HashSet::new()),
        }
    }
}

#[async_trait]
impl<M: MailSender, S: SmsSender> Worker for NotificationWorker<M, S> {
    fn name(&self) -> &str {
        "notification_worker"
    }

    async fn execute(&self, payload: &Value, _work_item: &WorkItem, _execution_id: &str) -> WorkResult {
        let notification: Notification = match serde_json::from_value(payload.clone()) {
            Ok(n) => n,
            Err(e) => return WorkResult::terminal_failure(format!("malformed notification payload: {e}")),
        };

        {
            let mut delivered = self.delivered.lock().unwrap();
            if delivered.contains(&notification.message_id) {
                return WorkResult::ok(serde_json::json!({"skipped": true}));
            }
            delivered.insert(notification.message_id.clone());
        }

        let sent = match notification.channel {
            NotificationChannel::Email => {
                self.mailer
                    .send_mail(
                        &notification.recipient,
                        notification.subject.as_deref().unwrap_or(""),
                        &notification.body,
                    )
                    .await
            }
            NotificationChannel::Sms => self.sms.send_sms(&notification.recipient, &notification.body).await,
        };

        match sent {
            Ok(()) => WorkResult::ok(serde_json::json!({"delivered": true})),
            Err(err) => {
                self.delivered.lock().unwrap().remove(&notification.message_id);
                if err.is_retryable() {
                    WorkResult::retryable_failure(err.to_string())
                } else {
                    WorkResult::terminal_failure(err.to_string())
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct RecordingMailer {
        sent: StdMutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl MailSender for RecordingMailer {
        async fn send_mail(&self, recipient: &str, subject: &str, _body: &str) -> Result<(), CoreError> {
            self.sent.lock().unwrap().push((recipient.to_string(), subject.to_string()));
            Ok(())
        }
    }

    struct NoopSms;

    #[async_trait]
    impl SmsSender for NoopSms {
        async fn send_sms(&self, _recipient: &str, _body: &str) -> Result<(), CoreError> {
            Ok(())
        }
    }

    fn sample_work_item() -> WorkItem {
        WorkItem {
            id: "w-1".to_string(),
            tenant_id: "tenant-1".to_string(),
            work_type: "notification".to_string(),
            correlation_id: "corr-1".to_string(),
            payload: Value::Null,
            attempt: 0,
        }
    }

    #[tokio::test]
    async fn delivers_email_notification() {
        let worker = NotificationWorker::new(
            RecordingMailer { sent: StdMutex::new(Vec::new()) },
            NoopSms,
        );
        let notification = Notification {
            message_id: "msg-1".to_string(),
            tenant_id: "tenant-1".to_string(),
            channel: NotificationChannel::Email,
            recipient: "borrower@example.com".to_string(),
            subject: Some("Your loan is ready".to_string()),
            body: "details".to_string(),
        };
        let payload = serde_json::to_value(&notification).unwrap();
        let result = worker.execute(&payload, &sample_work_item(), "exec-1").await;
        assert!(result.success);
        assert_eq!(worker.mailer.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn repeated_message_id_is_idempotent_no_op() {
        let worker = NotificationWorker::new(
            RecordingMailer { sent: StdMutex::new(Vec::new()) },
            NoopSms,
        );
        let notification = Notification {
            message_id: "msg-1".to_string(),
            tenant_id: "tenant-1".to_string(),
            channel: NotificationChannel::Email,
            recipient: "borrower@example.com".to_string(),
            subject: None,
            body: "details".to_string(),
        };
        let payload = serde_json::to_value(&notification).unwrap();
        worker.execute(&payload, &sample_work_item(), "exec-1").await;
        let second = worker.execute(&payload, &sample_work_item(), "exec-2").await;
        assert_eq!(second.result, Some(serde_json::json!({"skipped": true})));
        assert_eq!(worker.mailer.sent.lock().unwrap().len(), 1);
    }
}
