//! Notification senders: concrete `MailSender`/`SmsSender`
//! implementations behind the narrow interfaces `loanserve-core::outbox`
//! defines. Provider SDKs are explicitly out of scope; this gives
//! every deployment a working local sender plus a documented extension point
//! for a real provider.

use async_trait::async_trait;
use loanserve_core::error::CoreError;
use loanserve_core::outbox::{MailSender, SmsSender};
use std::sync::Mutex;

/// Writes every send to an in-process log instead of a provider. Used for
/// local/self-hosted deployments and tests; a real deployment swaps this for
/// an SMTP or provider-API-backed sender behind the same trait.
#[derive(Default)]
pub struct LoggingMailSender {
    sent: Mutex<Vec<(String, String, String)>>,
}

impl LoggingMailSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<(String, String, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl MailSender for LoggingMailSender {
    async fn send_mail(&self, recipient: &str, subject: &str, body: &str) -> Result<(), CoreError> {
        tracing::info!(recipient, subject, "sending mail");
        self.sent
            .lock()
            .unwrap()
            .push((recipient.to_string(), subject.to_string(), body.to_string()));
        Ok(())
    }
}

#[derive(Default)]
pub struct LoggingSmsSender {
    sent: Mutex<Vec<(String, String)>>,
}

impl LoggingSmsSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl SmsSender for LoggingSmsSender {
    async fn send_sms(&self, recipient: &str, body: &str) -> Result<(), CoreError> {
        tracing::info!(recipient, "sending sms");
        self.sent.lock().unwrap().push((recipient.to_string(), body.to_string()));
        Ok(())
    }
}

/// A `reqwest`-backed sender for an HTTP email/SMS provider that exposes a
/// simple `POST {to, subject?, body}` webhook. Kept generic over "a provider"
/// rather than naming a specific vendor SDK, keeping to a narrow-interface
/// requirement.
pub struct HttpWebhookMailSender {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpWebhookMailSender {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl MailSender for HttpWebhookMailSender {
    async fn send_mail(&self, recipient: &str, subject: &str, body: &str) -> Result<(), CoreError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&serde_json::json!({ "to": recipient, "subject": subject, "body": body }))
            .send()
            .await
            .map_err(|e| CoreError::Transient(format!("mail webhook request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(CoreError::Transient(format!(
                "mail webhook returned status {}",
                response.status()
            )));
        }
        Ok(())
    }
}

pub struct HttpWebhookSmsSender {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpWebhookSmsSender {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl SmsSender for HttpWebhookSmsSender {
    async fn send_sms(&self, recipient: &str, body: &str) -> Result<(), CoreError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&serde_json::json!({ "to": recipient, "body": body }))
            .send()
            .await
            .map_err(|e| CoreError::Transient(format!("sms webhook request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(CoreError::Transient(format!(
                "sms webhook returned status {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn logging_mail_sender_records_every_send() {
        let sender = LoggingMailSender::new();
        sender.send_mail("jane@example.com", "Hello", "body text").await.unwrap();
        let sent = sender.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "jane@example.com");
    }

    #[tokio::test]
    async fn logging_sms_sender_records_every_send() {
        let sender = LoggingSmsSender::new();
        sender.send_sms("+15551234567", "reminder").await.unwrap();
        assert_eq!(sender.sent().len(), 1);
    }
}
