//! # schedule-watch
//!
//! Polls a published class schedule page, detects content changes, keeps a
//! bounded snapshot history, and notifies subscribed users over Telegram.
//! An interactive bot answers schedule queries, and an operator dashboard
//! exposes history, users, logs, and the worker process over HTTP.
//!
//! ## Architecture
//!
//! ```text
//!             ┌───────────┐
//!             │ Scheduler │  every interval_secs
//!             └─────┬─────┘
//!                   ▼
//! ┌───────┐   ┌──────────┐   ┌──────────┐   ┌──────────────┐
//! │ Fetch │──▶│ Extract  │──▶│  Detect  │──▶│ SnapshotStore│
//! └───────┘   └──────────┘   └────┬─────┘   └──────┬───────┘
//!                                 │ changed        │ current.json
//!                                 ▼                ▼
//!                           ┌──────────┐     ┌──────────┐
//!                           │ Notifier │     │   Bot    │◀── users
//!                           └────┬─────┘     └────┬─────┘
//!                                └───▶ Transport ◀┘
//! ```
//!
//! Pure logic (data model, extraction, hashing, detection, rendering) lives
//! in the `schedule-watch-core` crate.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Typed errors per pipeline stage |
//! | [`logging`] | `tracing` subscriber setup |
//! | [`fetch`] | Page retrieval and legacy decoding |
//! | [`snapshot`] | Atomic on-disk snapshot history |
//! | [`recipients`] | User registry |
//! | [`transport`] | Telegram Bot API client |
//! | [`notify`] | Bounded fan-out delivery |
//! | [`progress`] | Delivery progress on stderr |
//! | [`pipeline`] | One fetch → notify cycle |
//! | [`scheduler`] | Periodic cycle execution |
//! | [`session`] | Transient per-user state |
//! | [`guard`] | Checks run before bot commands |
//! | [`bot`] | Bot commands and long polling |
//! | [`moderation`] | Blocking and unblocking users |
//! | [`supervisor`] | Worker process control |
//! | [`server`] | Operator dashboard |
//! | [`commands`] | CLI subcommands |

pub mod bot;
pub mod commands;
pub mod config;
pub mod error;
pub mod fetch;
pub mod guard;
pub mod logging;
pub mod moderation;
pub mod notify;
pub mod pipeline;
pub mod progress;
pub mod recipients;
pub mod scheduler;
pub mod server;
pub mod session;
pub mod snapshot;
pub mod supervisor;
pub mod transport;
