//! Blocking and unblocking users.
//!
//! Shared by the dashboard and the `users` CLI commands. The registry
//! change always happens first; the courtesy message to the user is sent
//! afterwards and its failure never undoes the change.

use serde::Serialize;

use crate::error::ModerationError;
use crate::recipients::{Recipient, RecipientPatch, RecipientRegistry};
use crate::transport::Transport;

pub const DEFAULT_BLOCK_REASON: &str = "Нарушение правил";

/// What happened to the message telling the user about the change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum NoticeStatus {
    Sent,
    NotConfigured,
    NoAddress,
    Failed { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct ModerationOutcome {
    pub user: Recipient,
    pub notice: NoticeStatus,
}

pub fn block_notice(reason: &str) -> String {
    format!("🚫 Вы были заблокированы в боте.\nПричина: {}", reason)
}

pub const UNBLOCK_NOTICE: &str = "✅ Ваша блокировка в боте снята!";

/// Blocks a known user. A blank reason falls back to [`DEFAULT_BLOCK_REASON`].
pub async fn block(
    registry: &dyn RecipientRegistry,
    transport: Option<&dyn Transport>,
    id: i64,
    reason: Option<&str>,
) -> Result<ModerationOutcome, ModerationError> {
    let reason = reason
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .unwrap_or(DEFAULT_BLOCK_REASON);
    ensure_known(registry, id).await?;
    let user = registry.update(id, RecipientPatch::block(reason)).await?;
    tracing::info!(user = %user.label(), reason, "user blocked");
    let notice = send_notice(transport, &user, &block_notice(reason)).await;
    Ok(ModerationOutcome { user, notice })
}

pub async fn unblock(
    registry: &dyn RecipientRegistry,
    transport: Option<&dyn Transport>,
    id: i64,
) -> Result<ModerationOutcome, ModerationError> {
    ensure_known(registry, id).await?;
    let user = registry.update(id, RecipientPatch::unblock()).await?;
    tracing::info!(user = %user.label(), "user unblocked");
    let notice = send_notice(transport, &user, UNBLOCK_NOTICE).await;
    Ok(ModerationOutcome { user, notice })
}

async fn ensure_known(registry: &dyn RecipientRegistry, id: i64) -> Result<(), ModerationError> {
    match registry.get(id).await? {
        Some(_) => Ok(()),
        None => Err(ModerationError::UnknownUser(id)),
    }
}

async fn send_notice(transport: Option<&dyn Transport>, user: &Recipient, text: &str) -> NoticeStatus {
    let Some(transport) = transport else {
        return NoticeStatus::NotConfigured;
    };
    let Some(chat_id) = user.chat_id else {
        return NoticeStatus::NoAddress;
    };
    match transport.send(chat_id, text).await {
        Ok(()) => NoticeStatus::Sent,
        Err(e) => {
            tracing::warn!(user = user.id, error = %e, "moderation notice not delivered");
            NoticeStatus::Failed {
                reason: e.to_string(),
            }
        }
    }
}
