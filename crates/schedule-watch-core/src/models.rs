//! Schedule data model.
//!
//! A [`ScheduleDocument`] maps date keys (as printed by the source page,
//! e.g. `"12.09.2024"`) to [`Day`] records. Keys keep their source order.
//! A [`Snapshot`] pairs a document with its capture time and content hash.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::canonical::content_hash;

/// One lesson slot entry.
///
/// A free slot still produces a `Lesson` (with the configured free-slot
/// name and empty room/teacher) so the sequence stays positional.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lesson {
    pub lesson_number: String,
    pub name: String,
    pub auditorium: String,
    pub teacher: String,
    /// Set only when a slot is shared by two or more sub-groups.
    pub subgroup: Option<String>,
}

impl Lesson {
    /// A record with no room, teacher, or subgroup.
    pub fn placeholder(lesson_number: &str, name: &str) -> Self {
        Self {
            lesson_number: lesson_number.to_string(),
            name: name.to_string(),
            auditorium: String::new(),
            teacher: String::new(),
            subgroup: None,
        }
    }
}

/// Lessons for a single date, in source markup order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Day {
    pub weekday: String,
    pub lessons: Vec<Lesson>,
}

/// Date key → day, in source order.
///
/// Equality ignores key order; only the date/day pairs matter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScheduleDocument {
    days: IndexMap<String, Day>,
}

impl ScheduleDocument {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a day. A repeated date key replaces the earlier day in place.
    pub fn insert(&mut self, date: impl Into<String>, day: Day) {
        self.days.insert(date.into(), day);
    }

    pub fn get(&self, date: &str) -> Option<&Day> {
        self.days.get(date)
    }

    pub fn get_mut(&mut self, date: &str) -> Option<&mut Day> {
        self.days.get_mut(date)
    }

    pub fn contains(&self, date: &str) -> bool {
        self.days.contains_key(date)
    }

    pub fn len(&self) -> usize {
        self.days.len()
    }

    pub fn is_empty(&self) -> bool {
        self.days.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Day)> {
        self.days.iter()
    }

    pub fn dates(&self) -> impl Iterator<Item = &String> {
        self.days.keys()
    }

    /// Total number of lesson records across all days.
    pub fn lesson_count(&self) -> usize {
        self.days.values().map(|d| d.lessons.len()).sum()
    }
}

impl PartialEq for ScheduleDocument {
    fn eq(&self, other: &Self) -> bool {
        self.days.len() == other.days.len()
            && self
                .days
                .iter()
                .all(|(k, v)| other.days.get(k).is_some_and(|o| o == v))
    }
}

impl Eq for ScheduleDocument {}

/// A captured schedule with its content hash.
///
/// `content_hash` covers the document only, so two snapshots of the same
/// schedule taken at different times share a hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub captured_at: DateTime<Utc>,
    pub content_hash: String,
    pub document: ScheduleDocument,
}

impl Snapshot {
    /// Snapshot of `document` taken now.
    pub fn capture(document: ScheduleDocument) -> Self {
        Self::capture_at(document, Utc::now())
    }

    pub fn capture_at(document: ScheduleDocument, captured_at: DateTime<Utc>) -> Self {
        let content_hash = content_hash(&document);
        Self {
            captured_at,
            content_hash,
            document,
        }
    }
}
