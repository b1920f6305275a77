//! Per-recipient transient state.
//!
//! Nothing here is persisted. Subscription and block state live in the
//! registry; a session only remembers request timestamps for the rate
//! limiter and the last keyboard shown.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Default)]
pub struct Session {
    /// Request times inside the current rate-limit window, oldest first.
    pub requests: VecDeque<Instant>,
    /// Subscription flag the visible keyboard was rendered with.
    pub keyboard_subscribed: Option<bool>,
}

impl Session {
    /// Drops timestamps older than `window` before `now`.
    pub fn expire(&mut self, now: Instant, window: Duration) {
        while let Some(front) = self.requests.front() {
            if now.duration_since(*front) >= window {
                self.requests.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Keyed storage of [`Session`]s.
pub trait SessionStore: Send + Sync {
    /// Runs `f` with exclusive access to the session of `id`, creating an
    /// empty one if needed.
    fn with_session<R>(&self, id: i64, f: impl FnOnce(&mut Session) -> R) -> R;
}

/// Sessions kept in process memory, lost on restart.
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    sessions: Mutex<HashMap<i64, Session>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<i64, Session>> {
        // a panic while holding the lock leaves plain data behind
        self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl SessionStore for InMemorySessionStore {
    fn with_session<R>(&self, id: i64, f: impl FnOnce(&mut Session) -> R) -> R {
        let mut sessions = self.lock();
        f(sessions.entry(id).or_default())
    }
}
