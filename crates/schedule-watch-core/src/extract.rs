//! Extraction of the published schedule table into a [`ScheduleDocument`].
//!
//! The source page is legacy, hand-written HTML. It contains one
//! `<table class="inf">` laid out like this:
//!
//! ```text
//! ┌──────────────────────┬─────┬───────────────────────────────────┐
//! │ td.hd[rowspan]       │ 1   │ td.nul                (free slot) │
//! │ "12.09.2024 Чт"      ├─────┼───────────────────────────────────┤
//! │                      │ 2   │ a.z1 a.z2 a.z3 [a.z1 a.z2 a.z3…]  │
//! ├──────────────────────┴─────┴───────────────────────────────────┤
//! │ td.hd0                                          (day separator)│
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! `z1` links carry the subject name, `z2` the room, `z3` the teacher.
//! Several `z1` links in one cell mean the slot is split between
//! sub-groups.
//!
//! Extraction runs in two passes. [`collect_rows`] walks the markup with a
//! lenient `quick-xml` reader (unquoted attributes, missing end tags, and
//! HTML entities are all tolerated) and collects the rows of the target
//! table. [`assemble`] then applies the row rules to build the document.

use quick_xml::escape::resolve_html5_entity;
use quick_xml::events::{BytesStart, BytesText, Event};
use quick_xml::Reader;

use crate::models::{Day, Lesson, ScheduleDocument};

/// Class of the schedule table.
const TABLE_CLASS: &str = "inf";
/// Day header cell class (combined with `rowspan`).
const DAY_HEADER_CLASS: &str = "hd";
/// Day separator cell class.
const SEPARATOR_CLASS: &str = "hd0";
/// Free slot detail cell class.
const FREE_CLASS: &str = "nul";
const NAME_CLASS: &str = "z1";
const ROOM_CLASS: &str = "z2";
const TEACHER_CLASS: &str = "z3";

/// Placeholder names written into lesson records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Labels {
    /// Name of a free slot.
    pub free_slot: String,
    /// Name used when a slot has content but no recognizable subject.
    pub unrecognized: String,
    /// Prefix of sub-group labels: `"<prefix> 1"`, `"<prefix> 2"`, …
    pub subgroup_prefix: String,
}

impl Default for Labels {
    fn default() -> Self {
        Self {
            free_slot: "Свободно".to_string(),
            unrecognized: "Неизвестно".to_string(),
            subgroup_prefix: "Подгруппа".to_string(),
        }
    }
}

/// Extraction failure. The caller keeps the previous snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractError {
    /// No `<table class="inf">` in the page.
    LayoutNotRecognized,
    /// The table was found but no day could be read from it.
    Empty,
    /// The markup broke off inside the table; rows after `position` are unknown.
    Malformed { position: u64, reason: String },
}

impl std::fmt::Display for ExtractError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExtractError::LayoutNotRecognized => {
                write!(f, "schedule table (class \"{}\") not found", TABLE_CLASS)
            }
            ExtractError::Empty => write!(f, "schedule table contains no days"),
            ExtractError::Malformed { position, reason } => write!(
                f,
                "schedule table is malformed at byte {}: {}",
                position, reason
            ),
        }
    }
}

impl std::error::Error for ExtractError {}

/// Extracts a schedule using the default [`Labels`].
pub fn extract_schedule(html: &str) -> Result<ScheduleDocument, ExtractError> {
    extract_schedule_with(html, &Labels::default())
}

/// Extracts a schedule from decoded page markup.
pub fn extract_schedule_with(
    html: &str,
    labels: &Labels,
) -> Result<ScheduleDocument, ExtractError> {
    let rows = collect_rows(html)?;
    let doc = assemble(&rows, labels);
    if doc.is_empty() {
        return Err(ExtractError::Empty);
    }
    Ok(doc)
}

#[derive(Debug, Default)]
struct RawLink {
    classes: Vec<String>,
    text: String,
}

#[derive(Debug, Default)]
struct RawCell {
    classes: Vec<String>,
    rowspan: bool,
    text: String,
    links: Vec<RawLink>,
}

#[derive(Debug, Default)]
struct RawRow {
    cells: Vec<RawCell>,
}

impl RawLink {
    fn has_class(&self, class: &str) -> bool {
        self.classes.iter().any(|c| c == class)
    }

    fn text(&self) -> String {
        normalize(&self.text)
    }
}

impl RawCell {
    fn has_class(&self, class: &str) -> bool {
        self.classes.iter().any(|c| c == class)
    }

    fn text(&self) -> String {
        normalize(&self.text)
    }
}

/// Open elements while walking the target table.
#[derive(Default)]
struct Cursor {
    rows: Vec<RawRow>,
    row: Option<RawRow>,
    cell: Option<RawCell>,
    link: Option<RawLink>,
}

impl Cursor {
    fn close_link(&mut self) {
        if let Some(link) = self.link.take() {
            if let Some(cell) = self.cell.as_mut() {
                cell.links.push(link);
            }
        }
    }

    fn close_cell(&mut self) {
        self.close_link();
        if let Some(cell) = self.cell.take() {
            self.row.get_or_insert_with(RawRow::default).cells.push(cell);
        }
    }

    fn close_row(&mut self) {
        self.close_cell();
        if let Some(row) = self.row.take() {
            self.rows.push(row);
        }
    }

    fn open_row(&mut self) {
        self.close_row();
        self.row = Some(RawRow::default());
    }

    fn open_cell(&mut self, start: &BytesStart) {
        self.close_cell();
        self.cell = Some(RawCell {
            classes: classes(start),
            rowspan: attr(start, "rowspan").is_some(),
            ..RawCell::default()
        });
    }

    fn open_link(&mut self, start: &BytesStart) {
        self.close_link();
        if self.cell.is_some() {
            self.link = Some(RawLink {
                classes: classes(start),
                ..RawLink::default()
            });
        }
    }

    fn push_text(&mut self, text: &str) {
        if let Some(link) = self.link.as_mut() {
            link.text.push(' ');
            link.text.push_str(text);
        }
        if let Some(cell) = self.cell.as_mut() {
            cell.text.push(' ');
            cell.text.push_str(text);
        }
    }

    fn finish(mut self) -> Vec<RawRow> {
        self.close_row();
        self.rows
    }
}

/// Collects the rows that belong directly to the first `table.inf`.
///
/// Rows of tables nested inside its cells are not collected; their text
/// still counts toward the enclosing cell. A parse error before the table
/// counts as a missing table. Inside it, the page is rejected rather than
/// returned partially.
fn collect_rows(html: &str) -> Result<Vec<RawRow>, ExtractError> {
    let mut reader = Reader::from_str(html);
    let config = reader.config_mut();
    config.check_end_names = false;
    config.allow_unmatched_ends = true;
    config.check_comments = false;

    // 0 = outside the target, 1 = directly inside it, >1 = nested tables.
    let mut depth = 0usize;
    let mut found = false;
    let mut cursor = Cursor::default();

    loop {
        let event = match reader.read_event() {
            Ok(event) => event,
            Err(e) if depth > 0 => {
                return Err(ExtractError::Malformed {
                    position: reader.error_position() as u64,
                    reason: e.to_string(),
                })
            }
            Err(_) => break,
        };
        match event {
            Event::Start(start) => {
                let name = tag_name(start.name().as_ref());
                match name.as_str() {
                    "table" if depth == 0 => {
                        if !found && classes(&start).iter().any(|c| c == TABLE_CLASS) {
                            found = true;
                            depth = 1;
                        }
                    }
                    "table" => depth += 1,
                    _ if depth == 0 => {}
                    "tr" if depth == 1 => cursor.open_row(),
                    "td" if depth == 1 => cursor.open_cell(&start),
                    "a" => cursor.open_link(&start),
                    "br" => cursor.push_text(" "),
                    _ => {}
                }
            }
            Event::Empty(start) if depth > 0 => {
                match tag_name(start.name().as_ref()).as_str() {
                    "td" if depth == 1 => {
                        cursor.open_cell(&start);
                        cursor.close_cell();
                    }
                    "br" => cursor.push_text(" "),
                    _ => {}
                }
            }
            Event::End(end) if depth > 0 => match tag_name(end.name().as_ref()).as_str() {
                "table" => {
                    depth -= 1;
                    if depth == 0 {
                        break;
                    }
                }
                "tr" if depth == 1 => cursor.close_row(),
                "td" if depth == 1 => cursor.close_cell(),
                "a" => cursor.close_link(),
                _ => {}
            },
            Event::Text(text) if depth > 0 => cursor.push_text(&decode_text(&text)),
            Event::Eof => break,
            _ => {}
        }
    }

    if found {
        Ok(cursor.finish())
    } else {
        Err(ExtractError::LayoutNotRecognized)
    }
}

/// Applies the row rules to the collected rows.
fn assemble(rows: &[RawRow], labels: &Labels) -> ScheduleDocument {
    let mut doc = ScheduleDocument::new();
    let mut current: Option<String> = None;

    for row in rows {
        let cells = &row.cells;
        let Some(first) = cells.first() else {
            continue;
        };
        if cells.len() == 1 && first.has_class(SEPARATOR_CLASS) {
            continue;
        }

        let slot = if first.rowspan && first.has_class(DAY_HEADER_CLASS) {
            let header = first.text();
            let mut parts = header.split_whitespace();
            if let (Some(date), Some(weekday)) = (parts.next(), parts.next()) {
                doc.insert(
                    date,
                    Day {
                        weekday: weekday.to_string(),
                        lessons: Vec::new(),
                    },
                );
                current = Some(date.to_string());
            }
            cells.get(1).zip(cells.get(2))
        } else if current.is_some() && cells.len() >= 2 {
            Some((&cells[0], &cells[1]))
        } else {
            None
        };

        if let (Some((number, details)), Some(date)) = (slot, current.as_deref()) {
            if let Some(day) = doc.get_mut(date) {
                day.lessons
                    .extend(resolve_slot(&number.text(), details, labels));
            }
        }
    }

    doc
}

/// Lesson records for one slot. Always at least one.
fn resolve_slot(number: &str, details: &RawCell, labels: &Labels) -> Vec<Lesson> {
    if details.has_class(FREE_CLASS) {
        return vec![Lesson::placeholder(number, &labels.free_slot)];
    }

    let mut records: Vec<Lesson> = Vec::new();
    for link in &details.links {
        if link.has_class(NAME_CLASS) {
            records.push(Lesson::placeholder(number, &link.text()));
        } else if link.has_class(ROOM_CLASS) {
            if let Some(open) = records.last_mut() {
                open.auditorium = link.text();
            }
        } else if link.has_class(TEACHER_CLASS) {
            if let Some(open) = records.last_mut() {
                open.teacher = link.text();
            }
        }
    }

    if records.is_empty() {
        return vec![Lesson::placeholder(number, &labels.unrecognized)];
    }
    if records.len() > 1 {
        for (i, record) in records.iter_mut().enumerate() {
            record.subgroup = Some(format!("{} {}", labels.subgroup_prefix, i + 1));
        }
    }
    records
}

fn tag_name(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).to_ascii_lowercase()
}

fn attr(start: &BytesStart, key: &str) -> Option<String> {
    start
        .html_attributes()
        .flatten()
        .find(|a| a.key.as_ref().eq_ignore_ascii_case(key.as_bytes()))
        .map(|a| String::from_utf8_lossy(&a.value).into_owned())
}

fn classes(start: &BytesStart) -> Vec<String> {
    attr(start, "class")
        .map(|v| v.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default()
}

/// Resolves entities; a stray `&` falls back to the raw text.
fn decode_text(text: &BytesText) -> String {
    match text.unescape_with(resolve_html5_entity) {
        Ok(s) => s.into_owned(),
        Err(_) => String::from_utf8_lossy(text).into_owned(),
    }
}

fn normalize(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
