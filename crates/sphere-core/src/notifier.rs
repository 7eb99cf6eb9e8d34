//! Outbound email and SMS.

use async_trait::async_trait;
use std::sync::Mutex;
use thiserror::Error;
use tracing::info;

/// Failure reported by a [`Notifier`].
#[derive(Debug, Error)]
pub enum NotifierError {
    #[error("Email delivery to {to} failed: {reason}")]
    Email { to: String, reason: String },

    #[error("SMS delivery to {to} failed: {reason}")]
    Sms { to: String, reason: String },
}

/// Sends email and SMS on behalf of account flows.
///
/// Either call may fail. Callers decide whether a failure rolls anything back.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_email(&self, to: &str, subject: &str, html: &str) -> Result<(), NotifierError>;

    async fn send_sms(&self, to: &str, body: &str) -> Result<(), NotifierError>;
}

/// A [`Notifier`] that records outgoing mail in the log instead of sending it.
///
/// Bodies carry one-time secrets, so only the recipient and subject are logged.
/// The last body per channel is kept in memory for local development.
#[derive(Debug, Default)]
pub struct LogNotifier {
    last_email: Mutex<Option<(String, String)>>,
    last_sms: Mutex<Option<(String, String)>>,
}

impl LogNotifier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Recipient and body of the most recent email.
    #[must_use]
    pub fn last_email(&self) -> Option<(String, String)> {
        self.last_email.lock().ok().and_then(|g| g.clone())
    }

    /// Recipient and body of the most recent SMS.
    #[must_use]
    pub fn last_sms(&self) -> Option<(String, String)> {
        self.last_sms.lock().ok().and_then(|g| g.clone())
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn send_email(&self, to: &str, subject: &str, html: &str) -> Result<(), NotifierError> {
        info!(to = %to, subject = %subject, "Email queued");
        if let Ok(mut last) = self.last_email.lock() {
            *last = Some((to.to_string(), html.to_string()));
        }
        Ok(())
    }

    async fn send_sms(&self, to: &str, body: &str) -> Result<(), NotifierError> {
        info!(to = %to, "SMS queued");
        if let Ok(mut last) = self.last_sms.lock() {
            *last = Some((to.to_string(), body.to_string()));
        }
        Ok(())
    }
}
