//! # schedule-watch core
//!
//! Pure logic for schedule-watch: the schedule data model, extraction of
//! the published HTML table, canonical content hashing, change detection,
//! and plain-text rendering.
//!
//! This crate does no network or filesystem I/O and has no async runtime
//! dependency. The `schedule-watch` crate wires it to HTTP, disk, and the
//! messaging transport.
//!
//! ```text
//! html ──▶ extract ──▶ ScheduleDocument ──▶ canonical::content_hash
//!                              │
//!                              ▼
//!                 detect(new, current snapshot) ──▶ Change
//!                              │
//!                              ▼
//!                  format::change_notice / render_schedule
//! ```

pub mod canonical;
pub mod detect;
pub mod extract;
pub mod format;
pub mod models;
