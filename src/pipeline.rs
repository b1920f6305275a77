//! One watch cycle.
//!
//! ```text
//! fetch ──▶ extract ──▶ detect ──┬─ unchanged ──▶ refresh current.json
//!                                └─ changed ────▶ append history + current.json
//!                                                   └──▶ notify subscribers
//! ```
//!
//! A fetch or extraction error ends the cycle before anything is written,
//! so the stored snapshot is never replaced by a failed extraction. An
//! unreadable `current.json` counts as no snapshot at all: the cycle
//! captures afresh and rewrites the pointer.

use chrono::{DateTime, Local, Utc};
use schedule_watch_core::detect::{detect, Change};
use schedule_watch_core::extract::{extract_schedule_with, Labels};
use schedule_watch_core::format::change_notice;
use schedule_watch_core::models::Snapshot;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{CycleError, PersistenceError};
use crate::fetch::Fetcher;
use crate::notify::{DeliveryReport, Notifier};
use crate::recipients::RecipientRegistry;
use crate::snapshot::SnapshotStore;

/// What happened to the change notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum NotifyStatus {
    /// Content did not change.
    Skipped,
    /// No transport token.
    NotConfigured,
    /// Dry run.
    Suppressed,
    /// The user registry could not be read.
    Failed { reason: String },
    Sent(DeliveryReport),
}

/// Result of a completed cycle.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub change: Change,
    pub snapshot: Snapshot,
    /// History file written, when content changed.
    pub history_file: Option<String>,
    pub notification: NotifyStatus,
}

impl CycleReport {
    pub fn changed(&self) -> bool {
        self.change.is_changed()
    }
}

/// Fetch → extract → detect → persist → notify.
pub struct Pipeline {
    fetcher: Arc<dyn Fetcher>,
    store: SnapshotStore,
    registry: Arc<dyn RecipientRegistry>,
    notifier: Option<Notifier>,
    labels: Labels,
    not_configured_reported: AtomicBool,
}

impl Pipeline {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        store: SnapshotStore,
        registry: Arc<dyn RecipientRegistry>,
        notifier: Option<Notifier>,
        labels: Labels,
    ) -> Self {
        Self {
            fetcher,
            store,
            registry,
            notifier,
            labels,
            not_configured_reported: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    /// Runs one cycle and persists its result.
    pub async fn run_cycle(&self) -> Result<CycleReport, CycleError> {
        self.execute(false).await
    }

    /// Fetches, extracts, and compares without writing or notifying.
    pub async fn dry_run(&self) -> Result<CycleReport, CycleError> {
        self.execute(true).await
    }

    async fn execute(&self, dry_run: bool) -> Result<CycleReport, CycleError> {
        tracing::debug!(source = %self.fetcher.describe(), "fetching schedule");
        let html = self.fetcher.fetch().await?;
        let document = extract_schedule_with(&html, &self.labels)?;
        let current = match self.store.current() {
            Ok(current) => current,
            Err(e @ PersistenceError::Malformed { .. }) => {
                tracing::warn!(error = %e, "current snapshot unreadable, capturing afresh");
                None
            }
            Err(e) => return Err(e.into()),
        };
        let change = detect(&document, current.as_ref());
        let snapshot = Snapshot::capture(document);

        if dry_run {
            return Ok(CycleReport {
                change,
                snapshot,
                history_file: None,
                notification: NotifyStatus::Suppressed,
            });
        }

        let (history_file, notification) = match &change {
            Change::Changed { changed_dates, .. } => {
                let name = self.store.put(&snapshot)?;
                tracing::info!(
                    file = %name,
                    hash = %snapshot.content_hash,
                    days = changed_dates.len(),
                    "schedule changed"
                );
                let notice = change_notice(&display_time(&snapshot.captured_at), changed_dates);
                (Some(name), self.notify(&notice).await)
            }
            Change::Unchanged { hash } => {
                self.store.set_current(&snapshot)?;
                tracing::info!(hash = %hash, "schedule unchanged");
                (None, NotifyStatus::Skipped)
            }
            Change::ExtractionFailed => {
                return Err(schedule_watch_core::extract::ExtractError::Empty.into());
            }
        };

        Ok(CycleReport {
            change,
            snapshot,
            history_file,
            notification,
        })
    }

    /// Never fails; registry errors become [`NotifyStatus::Failed`].
    async fn notify(&self, message: &str) -> NotifyStatus {
        let Some(notifier) = &self.notifier else {
            if !self.not_configured_reported.swap(true, Ordering::Relaxed) {
                tracing::warn!("notifications not configured, skipping delivery");
            }
            return NotifyStatus::NotConfigured;
        };
        match self.registry.all().await {
            Ok(recipients) => NotifyStatus::Sent(notifier.notify(&recipients, message).await),
            Err(e) => {
                tracing::error!(error = %e, "cannot read user registry, notification not sent");
                NotifyStatus::Failed {
                    reason: e.to_string(),
                }
            }
        }
    }
}

/// Local wall-clock time as shown to users: `12.09.2024 08:30`.
pub fn display_time(at: &DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%d.%m.%Y %H:%M").to_string()
}
