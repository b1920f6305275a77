//! Plain-text rendering for chat messages.

use crate::models::{Lesson, ScheduleDocument};

/// Maximum message length accepted by the chat provider, in characters.
pub const MESSAGE_LIMIT: usize = 4096;

/// Renders the whole schedule, one block per day.
///
/// ```text
/// 🕒 Расписание обновлено: 12.09.2024 08:30
///
/// 📅 12.09.2024 (Чт):
/// 🔢 1: Свободно
/// 🔢 2: Физика - 101 (👨‍🏫 Иванова И.И.) [Подгруппа 1]
/// ```
pub fn render_schedule(doc: &ScheduleDocument, updated: &str) -> String {
    let mut out = format!("🕒 Расписание обновлено: {}\n", updated);
    for (date, day) in doc.iter() {
        out.push_str(&format!("\n📅 {} ({}):\n", date, day.weekday));
        for lesson in &day.lessons {
            out.push_str(&render_lesson(lesson));
            out.push('\n');
        }
    }
    out
}

fn render_lesson(lesson: &Lesson) -> String {
    let mut line = format!("🔢 {}: {}", lesson.lesson_number, lesson.name);
    if !lesson.auditorium.is_empty() {
        line.push_str(&format!(" - {}", lesson.auditorium));
    }
    if !lesson.teacher.is_empty() {
        line.push_str(&format!(" (👨‍🏫 {})", lesson.teacher));
    }
    if let Some(subgroup) = &lesson.subgroup {
        line.push_str(&format!(" [{}]", subgroup));
    }
    line
}

/// Notification sent to subscribers when the schedule changes.
pub fn change_notice(updated: &str, changed_dates: &[String]) -> String {
    let mut out = format!("🔄 Расписание обновлено: {}\n", updated);
    if !changed_dates.is_empty() {
        out.push_str(&format!("Изменены дни: {}\n", changed_dates.join(", ")));
    }
    out.push_str("Используйте команду /check чтобы посмотреть изменения");
    out
}

/// Splits `text` into chunks of at most `limit` characters, preferring
/// line boundaries. Lines longer than `limit` are cut mid-line.
pub fn split_message(text: &str, limit: usize) -> Vec<String> {
    let limit = limit.max(1);
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;

    for line in text.split_inclusive('\n') {
        let line_len = line.chars().count();
        if current_len + line_len > limit && !current.is_empty() {
            parts.push(std::mem::take(&mut current));
            current_len = 0;
        }
        if line_len > limit {
            let chars: Vec<char> = line.chars().collect();
            for piece in chars.chunks(limit) {
                if current_len + piece.len() > limit {
                    parts.push(std::mem::take(&mut current));
                    current_len = 0;
                }
                current.extend(piece);
                current_len += piece.len();
            }
        } else {
            current.push_str(line);
            current_len += line_len;
        }
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts
}
