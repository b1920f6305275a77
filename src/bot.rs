//! Interactive bot.
//!
//! The bot long-polls for updates and answers four commands, each also
//! reachable through a keyboard button:
//!
//! | Command | Button | Action |
//! |---------|--------|--------|
//! | `/start` | | register the chat, show the keyboard |
//! | `/check` | 📅 Проверить расписание | send the current schedule |
//! | `/notif` | ✅/❌ Уведомления | toggle change notifications |
//! | `/info` | ℹ️ Информация о боте | describe the bot |
//!
//! Every message passes the [`GuardPipeline`] first. The registry is the
//! only source of subscription and block state; sessions hold nothing that
//! must survive a restart. When a subscription changes outside the chat
//! (an operator action, or an unreachable chat being unsubscribed), the
//! next reply re-sends the keyboard so its notification button is current.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

use schedule_watch_core::format::{render_schedule, split_message, MESSAGE_LIMIT};

use crate::error::DeliveryError;
use crate::guard::{GuardContext, GuardPipeline, Verdict};
use crate::pipeline::display_time;
use crate::recipients::{Recipient, RecipientPatch, RecipientRegistry};
use crate::session::SessionStore;
use crate::snapshot::SnapshotStore;
use crate::transport::{IncomingMessage, ReplyKeyboard, TelegramTransport, Update};

pub const BUTTON_CHECK: &str = "📅 Проверить расписание";
pub const BUTTON_NOTIFICATIONS_ON: &str = "✅ Уведомления";
pub const BUTTON_NOTIFICATIONS_OFF: &str = "❌ Уведомления";
pub const BUTTON_INFO: &str = "ℹ️ Информация о боте";

const INITIAL_BACKOFF_SECS: u64 = 5;
const MAX_BACKOFF_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Check,
    ToggleNotifications,
    Info,
    Unknown,
}

/// Maps message text to a command. `/cmd@botname args` is accepted.
pub fn parse_command(text: &str) -> Command {
    let text = text.trim();
    match text {
        BUTTON_CHECK => return Command::Check,
        BUTTON_NOTIFICATIONS_ON | BUTTON_NOTIFICATIONS_OFF => return Command::ToggleNotifications,
        BUTTON_INFO => return Command::Info,
        _ => {}
    }
    let Some(rest) = text.strip_prefix('/') else {
        return Command::Unknown;
    };
    let word = rest.split_whitespace().next().unwrap_or_default();
    let name = word.split('@').next().unwrap_or_default();
    match name.to_ascii_lowercase().as_str() {
        "start" => Command::Start,
        "check" => Command::Check,
        "notif" => Command::ToggleNotifications,
        "info" => Command::Info,
        _ => Command::Unknown,
    }
}

/// Main keyboard. The notifications button reflects the current state.
pub fn keyboard(subscribed: bool) -> ReplyKeyboard {
    ReplyKeyboard::column([
        BUTTON_CHECK,
        if subscribed {
            BUTTON_NOTIFICATIONS_ON
        } else {
            BUTTON_NOTIFICATIONS_OFF
        },
        BUTTON_INFO,
    ])
}

/// Messages to send back, in order. The keyboard goes with the last one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reply {
    pub texts: Vec<String>,
    pub keyboard: Option<ReplyKeyboard>,
}

impl Reply {
    fn text(text: impl Into<String>) -> Self {
        Self {
            texts: vec![text.into()],
            keyboard: None,
        }
    }

    fn with_keyboard(mut self, keyboard: ReplyKeyboard) -> Self {
        self.keyboard = Some(keyboard);
        self
    }
}

/// Turns one incoming message into a [`Reply`].
pub struct BotHandler<S: SessionStore> {
    registry: Arc<dyn RecipientRegistry>,
    store: SnapshotStore,
    guards: GuardPipeline,
    sessions: Arc<S>,
}

impl<S: SessionStore> BotHandler<S> {
    pub fn new(
        registry: Arc<dyn RecipientRegistry>,
        store: SnapshotStore,
        guards: GuardPipeline,
        sessions: Arc<S>,
    ) -> Self {
        Self {
            registry,
            store,
            guards,
            sessions,
        }
    }

    pub async fn handle(&self, message: &IncomingMessage) -> Reply {
        let Some(text) = message.text.as_deref() else {
            return Reply::default();
        };
        let sender_id = message.from.as_ref().map_or(message.chat.id, |f| f.id);
        let username = message.from.as_ref().and_then(|f| f.username.clone());

        let known = match self.registry.get(sender_id).await {
            Ok(r) => r,
            Err(e) => {
                tracing::error!(sender = sender_id, error = %e, "cannot read user record");
                None
            }
        };
        let ctx = GuardContext {
            sender_id,
            recipient: known.as_ref(),
            now: Instant::now(),
        };
        if let Verdict::Deny { reply, .. } = self.guards.check(&ctx) {
            return Reply::text(reply);
        }

        let recipient = match self
            .registry
            .update(sender_id, RecipientPatch::seen(username, message.chat.id))
            .await
        {
            Ok(r) => r,
            Err(e) => {
                tracing::error!(sender = sender_id, error = %e, "cannot update user record");
                return Reply::text("⚠️ Произошла ошибка, попробуйте позже");
            }
        };

        let command = parse_command(text);
        tracing::info!(user = %recipient.label(), ?command, "bot command");
        match command {
            Command::Start => self.keyboard_reply(
                &recipient,
                "👋 Привет! Я бот для отслеживания расписания. Выберите действие:",
                recipient.subscribed,
            ),
            Command::Check => self.refresh_keyboard(&recipient, self.schedule_reply()),
            Command::ToggleNotifications => self.toggle(&recipient).await,
            Command::Info => self.refresh_keyboard(
                &recipient,
                Reply::text(
                    "🤖 Бот расписания\n\n\
                     📝 Команды:\n\
                     /start - Главное меню\n\
                     /check - Показать расписание\n\
                     /notif - Переключить уведомления\n\n\
                     🔔 При изменениях в расписании я пришлю уведомление!",
                ),
            ),
            Command::Unknown => {
                self.keyboard_reply(&recipient, "❌ Неизвестная команда", recipient.subscribed)
            }
        }
    }

    fn keyboard_reply(&self, recipient: &Recipient, text: &str, subscribed: bool) -> Reply {
        self.sessions
            .with_session(recipient.id, |s| s.keyboard_subscribed = Some(subscribed));
        Reply::text(text).with_keyboard(keyboard(subscribed))
    }

    /// Attaches a new keyboard when the one last shown is stale.
    fn refresh_keyboard(&self, recipient: &Recipient, reply: Reply) -> Reply {
        let stale = self.sessions.with_session(recipient.id, |s| {
            let stale = s
                .keyboard_subscribed
                .is_some_and(|shown| shown != recipient.subscribed);
            if stale {
                s.keyboard_subscribed = Some(recipient.subscribed);
            }
            stale
        });
        if stale {
            reply.with_keyboard(keyboard(recipient.subscribed))
        } else {
            reply
        }
    }

    fn schedule_reply(&self) -> Reply {
        match self.store.current() {
            Ok(Some(snapshot)) => {
                let text = render_schedule(&snapshot.document, &display_time(&snapshot.captured_at));
                Reply {
                    texts: split_message(&text, MESSAGE_LIMIT),
                    keyboard: None,
                }
            }
            Ok(None) => Reply::text("⚠️ Расписание временно недоступно"),
            Err(e) => {
                tracing::error!(error = %e, "cannot read current schedule");
                Reply::text("⚠️ Расписание временно недоступно")
            }
        }
    }

    async fn toggle(&self, recipient: &Recipient) -> Reply {
        let subscribed = !recipient.subscribed;
        match self
            .registry
            .update(recipient.id, RecipientPatch::subscribed(subscribed))
            .await
        {
            Ok(updated) => {
                let text = if updated.subscribed {
                    "Уведомления ✅ активированы"
                } else {
                    "Уведомления ❌ деактивированы"
                };
                self.keyboard_reply(&updated, text, updated.subscribed)
            }
            Err(e) => {
                tracing::error!(user = recipient.id, error = %e, "cannot toggle notifications");
                Reply::text("⚠️ Произошла ошибка, попробуйте позже")
            }
        }
    }
}

/// Bot-side operations of the chat provider.
#[async_trait]
pub trait BotApi: Send + Sync {
    async fn get_updates(&self, offset: i64, poll_timeout_secs: u64)
        -> Result<Vec<Update>, DeliveryError>;

    async fn reply(
        &self,
        chat_id: i64,
        text: &str,
        keyboard: Option<&ReplyKeyboard>,
    ) -> Result<(), DeliveryError>;
}

#[async_trait]
impl BotApi for TelegramTransport {
    async fn get_updates(
        &self,
        offset: i64,
        poll_timeout_secs: u64,
    ) -> Result<Vec<Update>, DeliveryError> {
        TelegramTransport::get_updates(self, offset, poll_timeout_secs).await
    }

    async fn reply(
        &self,
        chat_id: i64,
        text: &str,
        keyboard: Option<&ReplyKeyboard>,
    ) -> Result<(), DeliveryError> {
        self.send_with_keyboard(chat_id, text, keyboard).await
    }
}

/// Long-poll loop. Returns when `shutdown` becomes `true`.
pub async fn run<S: SessionStore>(
    api: Arc<dyn BotApi>,
    handler: BotHandler<S>,
    poll_timeout_secs: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::info!("bot polling started");
    let mut offset = 0i64;
    let mut backoff_secs = INITIAL_BACKOFF_SECS;
    loop {
        if *shutdown.borrow() {
            break;
        }
        let polled = tokio::select! {
            r = api.get_updates(offset, poll_timeout_secs) => r,
            _ = shutdown.changed() => break,
        };
        match polled {
            Ok(updates) => {
                backoff_secs = INITIAL_BACKOFF_SECS;
                for update in updates {
                    offset = offset.max(update.update_id + 1);
                    let Some(message) = update.message else {
                        continue;
                    };
                    let reply = handler.handle(&message).await;
                    send_reply(api.as_ref(), message.chat.id, reply).await;
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "polling failed, retrying in {backoff_secs}s");
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(backoff_secs)) => {}
                    _ = shutdown.changed() => break,
                }
                backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
            }
        }
    }
    tracing::info!("bot polling stopped");
}

async fn send_reply(api: &dyn BotApi, chat_id: i64, reply: Reply) {
    let last = reply.texts.len().saturating_sub(1);
    for (i, text) in reply.texts.iter().enumerate() {
        let keyboard = if i == last { reply.keyboard.as_ref() } else { None };
        if let Err(e) = api.reply(chat_id, text, keyboard).await {
            tracing::warn!(chat = chat_id, error = %e, "reply failed");
            return;
        }
    }
}
