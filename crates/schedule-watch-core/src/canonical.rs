//! Canonical serialization and content hashing.
//!
//! The canonical form of a document is compact JSON with every object's
//! keys sorted lexicographically at every depth. Two documents that are
//! structurally equal produce the same bytes regardless of the order in
//! which their days were inserted, so their hashes compare equal.

use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

use crate::models::{Day, Lesson, ScheduleDocument};

/// Canonical compact JSON for `doc`.
pub fn canonical_json(doc: &ScheduleDocument) -> String {
    sorted(document_value(doc)).to_string()
}

/// Hex-encoded SHA-256 of [`canonical_json`].
pub fn content_hash(doc: &ScheduleDocument) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(doc).as_bytes());
    format!("{:x}", hasher.finalize())
}

fn document_value(doc: &ScheduleDocument) -> Value {
    let mut days = Map::new();
    for (date, day) in doc.iter() {
        days.insert(date.clone(), day_value(day));
    }
    Value::Object(days)
}

fn day_value(day: &Day) -> Value {
    json!({
        "weekday": day.weekday,
        "lessons": day.lessons.iter().map(lesson_value).collect::<Vec<_>>(),
    })
}

fn lesson_value(lesson: &Lesson) -> Value {
    json!({
        "lesson_number": lesson.lesson_number,
        "name": lesson.name,
        "auditorium": lesson.auditorium,
        "teacher": lesson.teacher,
        "subgroup": lesson.subgroup,
    })
}

/// Rebuilds every object with its keys in sorted order.
fn sorted(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut out = Map::new();
            for (k, v) in entries {
                out.insert(k, sorted(v));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sorted).collect()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lesson(n: &str, name: &str) -> Lesson {
        Lesson {
            lesson_number: n.to_string(),
            name: name.to_string(),
            auditorium: "101".to_string(),
            teacher: "Ivanova".to_string(),
            subgroup: None,
        }
    }

    fn doc(order: &[&str]) -> ScheduleDocument {
        let mut doc = ScheduleDocument::new();
        for date in order {
            doc.insert(
                *date,
                Day {
                    weekday: format!("wd-{}", date),
                    lessons: vec![lesson("1", "Math"), lesson("2", "Physics")],
                },
            );
        }
        doc
    }

    #[test]
    fn test_hash_insensitive_to_insertion_order() {
        let a = doc(&["01.09", "02.09", "03.09"]);
        let b = doc(&["03.09", "01.09", "02.09"]);
        assert_eq!(content_hash(&a), content_hash(&b));
        assert_eq!(canonical_json(&a), canonical_json(&b));
    }

    #[test]
    fn test_hash_stable_across_calls() {
        let a = doc(&["01.09"]);
        let first = content_hash(&a);
        for _ in 0..3 {
            assert_eq!(content_hash(&a.clone()), first);
        }
        assert_eq!(first.len(), 64);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_hash_changes_with_content() {
        let a = doc(&["01.09"]);
        let mut b = a.clone();
        if let Some(day) = b.get_mut("01.09") {
            day.lessons[1].auditorium = "202".to_string();
        }
        assert_ne!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn test_canonical_json_sorts_nested_keys() {
        let json = canonical_json(&doc(&["01.09"]));
        assert!(json.starts_with("{\"01.09\":{\"lessons\":[{\"auditorium\":\"101\""));
        assert!(!json.contains('\n'));
        assert!(json.contains("\"subgroup\":null"));
    }

    #[test]
    fn test_lesson_order_is_significant() {
        let a = doc(&["01.09"]);
        let mut b = a.clone();
        if let Some(day) = b.get_mut("01.09") {
            day.lessons.reverse();
        }
        assert_ne!(content_hash(&a), content_hash(&b));
    }
}
