//! Fan-out delivery of one message to many recipients.
//!
//! Each recipient gets exactly one attempt per call, bounded by a timeout.
//! A failing recipient never affects the others. Up to `concurrency`
//! attempts run at once, and the report lists outcomes in input order.
//!
//! A recipient reported [`DeliveryError::Unreachable`] is unsubscribed
//! through the registry so later notifications skip them.

use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::error::DeliveryError;
use crate::progress::{DeliveryProgressEvent, DeliveryProgressReporter, NoProgress};
use crate::recipients::{Recipient, RecipientPatch, RecipientRegistry};
use crate::transport::Transport;

/// Outcome of one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Delivered,
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryDetail {
    pub recipient_id: i64,
    #[serde(flatten)]
    pub outcome: DeliveryOutcome,
}

/// Per-call delivery summary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub failed: usize,
    pub details: Vec<DeliveryDetail>,
}

/// Who an operator broadcast reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    /// Every non-blocked recipient with an address, subscribed or not.
    All,
    /// One recipient, even when blocked.
    One(i64),
}

pub struct Notifier {
    transport: Arc<dyn Transport>,
    registry: Arc<dyn RecipientRegistry>,
    send_timeout: Duration,
    concurrency: usize,
    progress: Arc<dyn DeliveryProgressReporter>,
}

impl Notifier {
    pub fn new(
        transport: Arc<dyn Transport>,
        registry: Arc<dyn RecipientRegistry>,
        send_timeout: Duration,
        concurrency: usize,
    ) -> Self {
        Self {
            transport,
            registry,
            send_timeout,
            concurrency: concurrency.max(1),
            progress: Arc::new(NoProgress),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn DeliveryProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    /// Subscribed, not blocked, and addressable.
    pub fn is_eligible(recipient: &Recipient) -> bool {
        recipient.subscribed && !recipient.blocked && recipient.chat_id.is_some()
    }

    /// Sends a change notification to every eligible recipient.
    pub async fn notify(&self, recipients: &[Recipient], message: &str) -> DeliveryReport {
        let targets = recipients
            .iter()
            .filter(|r| Self::is_eligible(r))
            .map(Target::from)
            .collect();
        self.deliver(targets, message).await
    }

    /// Sends an operator message.
    pub async fn broadcast(
        &self,
        recipients: &[Recipient],
        message: &str,
        audience: Audience,
    ) -> DeliveryReport {
        let targets = match audience {
            Audience::All => recipients
                .iter()
                .filter(|r| !r.blocked && r.chat_id.is_some())
                .map(Target::from)
                .collect(),
            Audience::One(id) => recipients
                .iter()
                .filter(|r| r.id == id)
                .map(Target::from)
                .collect(),
        };
        self.deliver(targets, message).await
    }

    async fn deliver(&self, targets: Vec<Target>, message: &str) -> DeliveryReport {
        let total = targets.len() as u64;
        self.progress.report(DeliveryProgressEvent::Started { total });

        // Attempts own their inputs so the stream stays `Send` for spawned callers.
        let message: Arc<str> = Arc::from(message);
        let attempts: Vec<_> = targets
            .into_iter()
            .map(|target| {
                attempt(
                    self.transport.clone(),
                    target,
                    message.clone(),
                    self.send_timeout,
                )
            })
            .collect();
        let mut attempts = stream::iter(attempts).buffered(self.concurrency);

        let mut report = DeliveryReport::default();
        while let Some((id, result)) = attempts.next().await {
            let outcome = match result {
                Ok(()) => {
                    report.delivered += 1;
                    DeliveryOutcome::Delivered
                }
                Err(err) => {
                    report.failed += 1;
                    tracing::warn!(recipient = id, error = %err, "delivery failed");
                    if err.is_unreachable() {
                        self.unsubscribe(id).await;
                    }
                    DeliveryOutcome::Failed {
                        reason: err.to_string(),
                    }
                }
            };
            report.details.push(DeliveryDetail {
                recipient_id: id,
                outcome,
            });
            self.progress.report(DeliveryProgressEvent::Sending {
                n: report.details.len() as u64,
                total,
                failed: report.failed as u64,
            });
        }

        tracing::info!(
            delivered = report.delivered,
            failed = report.failed,
            "delivery finished"
        );
        report
    }

    async fn unsubscribe(&self, id: i64) {
        match self.registry.update(id, RecipientPatch::subscribed(false)).await {
            Ok(_) => tracing::info!(recipient = id, "recipient unreachable, notifications disabled"),
            Err(e) => tracing::error!(recipient = id, error = %e, "failed to disable notifications"),
        }
    }
}

/// Address of one delivery target, detached from the registry record.
#[derive(Debug, Clone, Copy)]
struct Target {
    id: i64,
    chat_id: Option<i64>,
}

impl From<&Recipient> for Target {
    fn from(recipient: &Recipient) -> Self {
        Self {
            id: recipient.id,
            chat_id: recipient.chat_id,
        }
    }
}

async fn attempt(
    transport: Arc<dyn Transport>,
    target: Target,
    message: Arc<str>,
    send_timeout: Duration,
) -> (i64, Result<(), DeliveryError>) {
    let Some(chat_id) = target.chat_id else {
        return (target.id, Err(DeliveryError::NoAddress));
    };
    let result = match tokio::time::timeout(send_timeout, transport.send(chat_id, &message)).await {
        Ok(result) => result,
        Err(_) => Err(DeliveryError::Timeout),
    };
    (target.id, result)
}
