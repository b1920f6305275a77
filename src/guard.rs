//! Checks applied to every incoming bot message before it is dispatched.
//!
//! Guards run in registration order and the first denial wins, so the
//! standard pipeline rejects a blocked user before their request is
//! counted against the rate limit.
//!
//! | Guard | Denies when |
//! |-------|-------------|
//! | [`BlockedGuard`] | the registry marks the user blocked |
//! | [`RateLimitGuard`] | the user sent `limit` requests within `window` |

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::BotConfig;
use crate::recipients::Recipient;
use crate::session::SessionStore;

/// What a guard sees about one incoming message.
pub struct GuardContext<'a> {
    pub sender_id: i64,
    /// Registry record, if the sender is known.
    pub recipient: Option<&'a Recipient>,
    pub now: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    /// Message is dropped; `reply` is sent back to the sender.
    Deny { guard: &'static str, reply: String },
}

impl Verdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allow)
    }
}

pub trait Guard: Send + Sync {
    fn name(&self) -> &'static str;

    fn check(&self, ctx: &GuardContext<'_>) -> Verdict;
}

pub struct BlockedGuard;

impl Guard for BlockedGuard {
    fn name(&self) -> &'static str {
        "blocked"
    }

    fn check(&self, ctx: &GuardContext<'_>) -> Verdict {
        match ctx.recipient {
            Some(r) if r.blocked => Verdict::Deny {
                guard: self.name(),
                reply: "🚫 Вы заблокированы в этом боте.".to_string(),
            },
            _ => Verdict::Allow,
        }
    }
}

/// Sliding-window request limit per sender.
pub struct RateLimitGuard<S: SessionStore> {
    sessions: Arc<S>,
    limit: usize,
    window: Duration,
}

impl<S: SessionStore> RateLimitGuard<S> {
    pub fn new(sessions: Arc<S>, limit: usize, window: Duration) -> Self {
        Self {
            sessions,
            limit: limit.max(1),
            window,
        }
    }
}

impl<S: SessionStore> Guard for RateLimitGuard<S> {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    fn check(&self, ctx: &GuardContext<'_>) -> Verdict {
        let allowed = self.sessions.with_session(ctx.sender_id, |session| {
            session.expire(ctx.now, self.window);
            if session.requests.len() >= self.limit {
                false
            } else {
                session.requests.push_back(ctx.now);
                true
            }
        });
        if allowed {
            Verdict::Allow
        } else {
            Verdict::Deny {
                guard: self.name(),
                reply: format!(
                    "⚠️ Слишком много запросов. Подождите {} секунд.",
                    self.window.as_secs()
                ),
            }
        }
    }
}

/// Ordered list of guards.
#[derive(Default)]
pub struct GuardPipeline {
    guards: Vec<Box<dyn Guard>>,
}

impl GuardPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocked check, then rate limit.
    pub fn standard<S: SessionStore + 'static>(sessions: Arc<S>, config: &BotConfig) -> Self {
        let mut pipeline = Self::new();
        pipeline.register(Box::new(BlockedGuard));
        pipeline.register(Box::new(RateLimitGuard::new(
            sessions,
            config.rate_limit_requests,
            Duration::from_secs(config.rate_limit_window_secs),
        )));
        pipeline
    }

    pub fn register(&mut self, guard: Box<dyn Guard>) {
        self.guards.push(guard);
    }

    pub fn len(&self) -> usize {
        self.guards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guards.is_empty()
    }

    pub fn check(&self, ctx: &GuardContext<'_>) -> Verdict {
        for guard in &self.guards {
            let verdict = guard.check(ctx);
            if !verdict.is_allowed() {
                tracing::debug!(sender = ctx.sender_id, guard = guard.name(), "message denied");
                return verdict;
            }
        }
        Verdict::Allow
    }
}
