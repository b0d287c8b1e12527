//! Outbound collaborators the runtime acts through: mail delivery and the
//! ops notification sink.

use std::sync::Mutex;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use parley_core::domain::thread::ThreadId;
use parley_core::errors::ApplicationError;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum MailError {
    #[error("mail transport rejected the message: {0}")]
    Rejected(String),
    #[error("mail transport unavailable: {0}")]
    Unavailable(String),
}

impl From<MailError> for ApplicationError {
    fn from(error: MailError) -> Self {
        ApplicationError::Integration(error.to_string())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMail {
    pub thread_id: ThreadId,
    pub to: String,
    pub subject: String,
    pub body: String,
}

#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, mail: &OutboundMail) -> Result<(), MailError>;

    async fn create_draft(&self, mail: &OutboundMail) -> Result<(), MailError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpsNoticeKind {
    Halt,
    HighValue,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpsNotice {
    pub kind: OpsNoticeKind,
    pub thread_id: ThreadId,
    pub correlation_id: String,
    pub summary: String,
    pub anchor_rate: Option<Decimal>,
}

/// Best-effort sink; a notification failure never fails the cycle.
#[async_trait]
pub trait OpsNotifier: Send + Sync {
    async fn notify(&self, notice: OpsNotice);
}

/// Transport that only logs. Used where no mail provider is wired in.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingMailTransport;

#[async_trait]
impl MailTransport for TracingMailTransport {
    async fn send(&self, mail: &OutboundMail) -> Result<(), MailError> {
        info!(
            event_name = "mail.sent",
            thread_id = %mail.thread_id,
            to = %mail.to,
            subject = %mail.subject,
            "reply sent"
        );
        Ok(())
    }

    async fn create_draft(&self, mail: &OutboundMail) -> Result<(), MailError> {
        info!(
            event_name = "mail.draft_created",
            thread_id = %mail.thread_id,
            to = %mail.to,
            subject = %mail.subject,
            "reply drafted"
        );
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct TracingOpsNotifier;

#[async_trait]
impl OpsNotifier for TracingOpsNotifier {
    async fn notify(&self, notice: OpsNotice) {
        warn!(
            event_name = "ops.notified",
            kind = ?notice.kind,
            thread_id = %notice.thread_id,
            correlation_id = %notice.correlation_id,
            summary = %notice.summary,
            "ops notification"
        );
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryKind {
    Sent,
    Drafted,
}

/// Keeps every delivery in memory. Can be switched to fail for tests.
#[derive(Default)]
pub struct RecordingMailTransport {
    deliveries: Mutex<Vec<(DeliveryKind, OutboundMail)>>,
    failure: Mutex<Option<MailError>>,
}

impl RecordingMailTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_with(&self, error: Option<MailError>) {
        if let Ok(mut failure) = self.failure.lock() {
            *failure = error;
        }
    }

    pub fn deliveries(&self) -> Vec<(DeliveryKind, OutboundMail)> {
        self.deliveries.lock().map(|deliveries| deliveries.clone()).unwrap_or_default()
    }

    fn record(&self, kind: DeliveryKind, mail: &OutboundMail) -> Result<(), MailError> {
        if let Some(error) = self.failure.lock().ok().and_then(|failure| failure.clone()) {
            return Err(error);
        }
        if let Ok(mut deliveries) = self.deliveries.lock() {
            deliveries.push((kind, mail.clone()));
        }
        Ok(())
    }
}

#[async_trait]
impl MailTransport for RecordingMailTransport {
    async fn send(&self, mail: &OutboundMail) -> Result<(), MailError> {
        self.record(DeliveryKind::Sent, mail)
    }

    async fn create_draft(&self, mail: &OutboundMail) -> Result<(), MailError> {
        self.record(DeliveryKind::Drafted, mail)
    }
}

#[derive(Default)]
pub struct RecordingOpsNotifier {
    notices: Mutex<Vec<OpsNotice>>,
}

impl RecordingOpsNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notices(&self) -> Vec<OpsNotice> {
        self.notices.lock().map(|notices| notices.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl OpsNotifier for RecordingOpsNotifier {
    async fn notify(&self, notice: OpsNotice) {
        if let Ok(mut notices) = self.notices.lock() {
            notices.push(notice);
        }
    }
}
