//! Outbound mail.
//!
//! Delivery itself is a provider concern; handlers only need a sender that accepts a
//! rendered message and returns the provider's message id.

use std::sync::Mutex;

use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use mailpulse_broadcasts::EmailContent;
use mailpulse_core::Contact;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MailError {
    #[error("recipient rejected: {0}")]
    Rejected(String),

    #[error("provider unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundEmail {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub html: String,
    pub text: Option<String>,
}

impl OutboundEmail {
    pub fn new(content: &EmailContent, to: impl Into<String>) -> Self {
        Self {
            from: content.from.clone(),
            to: to.into(),
            subject: content.subject.clone(),
            html: content.html.clone(),
            text: content.text.clone(),
        }
    }

    pub fn to_contact(content: &EmailContent, contact: &Contact) -> Self {
        Self::new(content, contact.email.clone())
    }
}

#[async_trait::async_trait]
pub trait MailSender: Send + Sync {
    /// Hand the message to the provider. Returns the provider's message id.
    async fn send(&self, email: &OutboundEmail) -> Result<String, MailError>;
}

/// Logs every message instead of delivering it.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingMailSender;

#[async_trait::async_trait]
impl MailSender for LoggingMailSender {
    async fn send(&self, email: &OutboundEmail) -> Result<String, MailError> {
        let message_id = Uuid::now_v7().to_string();
        info!(
            message_id = %message_id,
            from = %email.from,
            to = %email.to,
            subject = %email.subject,
            "email accepted"
        );
        Ok(message_id)
    }
}

/// In-memory sender for tests/dev.
///
/// Keeps every accepted message; addresses listed in `reject` fail with
/// [`MailError::Rejected`].
#[derive(Debug, Default)]
pub struct RecordingMailSender {
    sent: Mutex<Vec<OutboundEmail>>,
    reject: Mutex<Vec<String>>,
}

impl RecordingMailSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reject(&self, address: impl Into<String>) {
        if let Ok(mut reject) = self.reject.lock() {
            reject.push(address.into());
        }
    }

    pub fn sent(&self) -> Vec<OutboundEmail> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn sent_to(&self, address: &str) -> usize {
        self.sent().iter().filter(|e| e.to == address).count()
    }
}

#[async_trait::async_trait]
impl MailSender for RecordingMailSender {
    async fn send(&self, email: &OutboundEmail) -> Result<String, MailError> {
        let rejected = self
            .reject
            .lock()
            .map(|r| r.contains(&email.to))
            .map_err(|_| MailError::Unavailable("sender lock poisoned".into()))?;
        if rejected {
            return Err(MailError::Rejected(email.to.clone()));
        }

        let mut sent = self
            .sent
            .lock()
            .map_err(|_| MailError::Unavailable("sender lock poisoned".into()))?;
        sent.push(email.clone());
        Ok(format!("msg-{}", sent.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailpulse_core::AudienceId;

    #[tokio::test]
    async fn recording_sender_keeps_messages_and_rejects_listed_addresses() {
        let sender = RecordingMailSender::new();
        sender.reject("bounce@acme.io");
        let content = EmailContent::new("news@acme.io", "Hello", "<p>hi</p>");

        let ok = Contact::new(AudienceId::new(), "ada@acme.io");
        let id = sender.send(&OutboundEmail::to_contact(&content, &ok)).await.unwrap();
        assert_eq!(id, "msg-1");

        let err = sender
            .send(&OutboundEmail::new(&content, "bounce@acme.io"))
            .await
            .unwrap_err();
        assert_eq!(err, MailError::Rejected("bounce@acme.io".into()));

        assert_eq!(sender.sent_to("ada@acme.io"), 1);
        assert_eq!(sender.sent().len(), 1);
        assert_eq!(sender.sent()[0].subject, "Hello");
    }
}
