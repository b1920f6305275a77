//! Change detection between a freshly extracted document and the stored
//! current snapshot.

use crate::canonical::content_hash;
use crate::models::{ScheduleDocument, Snapshot};

/// Outcome of comparing a new document against the current snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    /// Content differs, or there was no previous snapshot.
    Changed {
        previous_hash: Option<String>,
        current_hash: String,
        /// Dates added or modified (new document order), then dates removed.
        changed_dates: Vec<String>,
    },
    Unchanged {
        hash: String,
    },
    /// The new document is empty and must not replace the stored one.
    ExtractionFailed,
}

impl Change {
    pub fn is_changed(&self) -> bool {
        matches!(self, Change::Changed { .. })
    }
}

/// Compares `new` against `current`. Never mutates either side.
pub fn detect(new: &ScheduleDocument, current: Option<&Snapshot>) -> Change {
    if new.is_empty() {
        return Change::ExtractionFailed;
    }
    let hash = content_hash(new);
    match current {
        Some(snapshot) if snapshot.content_hash == hash => Change::Unchanged { hash },
        Some(snapshot) => Change::Changed {
            previous_hash: Some(snapshot.content_hash.clone()),
            current_hash: hash,
            changed_dates: changed_dates(&snapshot.document, new),
        },
        None => Change::Changed {
            previous_hash: None,
            current_hash: hash,
            changed_dates: new.dates().cloned().collect(),
        },
    }
}

/// Dates whose day differs between `old` and `new`.
pub fn changed_dates(old: &ScheduleDocument, new: &ScheduleDocument) -> Vec<String> {
    let mut dates: Vec<String> = new
        .iter()
        .filter(|(date, day)| old.get(date) != Some(*day))
        .map(|(date, _)| date.clone())
        .collect();
    dates.extend(old.dates().filter(|d| !new.contains(d)).cloned());
    dates
}
