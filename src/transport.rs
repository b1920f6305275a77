//! Message transport.
//!
//! [`Transport`] is the narrow seam the notifier and dashboard deliver
//! through. [`TelegramTransport`] implements it over the Telegram Bot API
//! and also exposes the long-poll `getUpdates` call used by the bot.
//!
//! Provider failures are classified into [`DeliveryError`]. A recipient who
//! blocked the bot, was deactivated, or whose chat no longer exists yields
//! [`DeliveryError::Unreachable`], which callers use to unsubscribe them.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::TransportConfig;
use crate::error::{ConfigError, DeliveryError};

/// Sends one text message to one chat.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, chat_id: i64, text: &str) -> Result<(), DeliveryError>;
}

/// Reply keyboard shown under the input field.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ReplyKeyboard {
    pub keyboard: Vec<Vec<KeyboardButton>>,
    pub resize_keyboard: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct KeyboardButton {
    pub text: String,
}

impl ReplyKeyboard {
    /// One button per row.
    pub fn column<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keyboard: labels
                .into_iter()
                .map(|l| vec![KeyboardButton { text: l.into() }])
                .collect(),
            resize_keyboard: true,
        }
    }
}

/// Incoming update from `getUpdates`.
#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<IncomingMessage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IncomingMessage {
    pub chat: Chat,
    #[serde(default)]
    pub from: Option<Sender>,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Sender {
    pub id: i64,
    #[serde(default)]
    pub username: Option<String>,
}

/// Envelope of every Bot API response.
#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    error_code: Option<u16>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: i64,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_markup: Option<&'a ReplyKeyboard>,
}

/// Telegram Bot API client.
pub struct TelegramTransport {
    client: reqwest::Client,
    base: String,
}

impl TelegramTransport {
    /// Fails with [`ConfigError::MissingToken`] when no token is set.
    pub fn new(config: &TransportConfig) -> Result<Self, ConfigError> {
        let token = config
            .token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(ConfigError::MissingToken)?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Ok(Self {
            client,
            base: format!("{}/bot{}", config.api_base.trim_end_matches('/'), token),
        })
    }

    /// Sends a message, optionally replacing the reply keyboard.
    pub async fn send_with_keyboard(
        &self,
        chat_id: i64,
        text: &str,
        keyboard: Option<&ReplyKeyboard>,
    ) -> Result<(), DeliveryError> {
        let body = SendMessage {
            chat_id,
            text,
            reply_markup: keyboard,
        };
        let request = self
            .client
            .post(format!("{}/sendMessage", self.base))
            .json(&body);
        self.call::<serde_json::Value>(request).await.map(|_| ())
    }

    /// Long-polls for updates after `offset`. The HTTP timeout is extended
    /// past the poll timeout so an idle poll is not reported as a failure.
    pub async fn get_updates(
        &self,
        offset: i64,
        poll_timeout_secs: u64,
    ) -> Result<Vec<Update>, DeliveryError> {
        let request = self
            .client
            .get(format!("{}/getUpdates", self.base))
            .query(&[
                ("offset", offset.to_string()),
                ("timeout", poll_timeout_secs.to_string()),
                ("allowed_updates", "[\"message\"]".to_string()),
            ])
            .timeout(Duration::from_secs(poll_timeout_secs + 10));
        Ok(self.call::<Vec<Update>>(request).await?.unwrap_or_default())
    }

    async fn call<T>(&self, request: reqwest::RequestBuilder) -> Result<Option<T>, DeliveryError>
    where
        T: for<'de> Deserialize<'de>,
    {
        let response = request.send().await.map_err(classify_reqwest)?;
        let status = response.status();
        let body = response.bytes().await.map_err(classify_reqwest)?;
        interpret_response(status, &body)
    }
}

/// Reads a Bot API envelope. A body that is not an envelope (a proxy's
/// HTML error page, say) is reported by its HTTP status.
fn interpret_response<T>(status: StatusCode, body: &[u8]) -> Result<Option<T>, DeliveryError>
where
    T: for<'de> Deserialize<'de>,
{
    let envelope: ApiResponse<T> = match serde_json::from_slice(body) {
        Ok(envelope) => envelope,
        Err(e) if status.is_success() => {
            return Err(DeliveryError::Network(format!("malformed response: {}", e)))
        }
        Err(_) => {
            return Err(DeliveryError::Rejected {
                status: status.as_u16(),
                description: status.canonical_reason().unwrap_or("error").to_string(),
            })
        }
    };
    if envelope.ok {
        return Ok(envelope.result);
    }
    Err(classify_api_error(
        envelope.error_code.unwrap_or(status.as_u16()),
        envelope.description.unwrap_or_default(),
    ))
}

#[async_trait]
impl Transport for TelegramTransport {
    async fn send(&self, chat_id: i64, text: &str) -> Result<(), DeliveryError> {
        self.send_with_keyboard(chat_id, text, None).await
    }
}

fn classify_reqwest(err: reqwest::Error) -> DeliveryError {
    if err.is_timeout() {
        DeliveryError::Timeout
    } else {
        DeliveryError::Network(err.to_string())
    }
}

/// Maps a Bot API error to a delivery error.
pub fn classify_api_error(status: u16, description: String) -> DeliveryError {
    let lower = description.to_lowercase();
    let unreachable = status == 403
        || lower.contains("bot was blocked")
        || lower.contains("user is deactivated")
        || lower.contains("chat not found");
    if unreachable {
        DeliveryError::Unreachable(description)
    } else {
        DeliveryError::Rejected {
            status,
            description,
        }
    }
}
