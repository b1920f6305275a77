//! The user registry.
//!
//! Each user is a JSON file `users_dir/<id>.json`. Files written by older
//! tooling use different field names (`notifications`, `banned`,
//! `ban_reason`) and sometimes store `chat_id` as a string; those records
//! are normalized on read and rewritten in the current shape on the next
//! update.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use crate::error::RegistryError;

/// A user known to the bot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub id: i64,
    #[serde(default)]
    pub username: Option<String>,
    /// Delivery address. Absent until the user has talked to the bot.
    #[serde(default, deserialize_with = "lenient_chat_id")]
    pub chat_id: Option<i64>,
    #[serde(default, alias = "notifications")]
    pub subscribed: bool,
    #[serde(default, alias = "banned")]
    pub blocked: bool,
    #[serde(default, alias = "ban_reason")]
    pub blocked_reason: Option<String>,
    #[serde(default = "Utc::now")]
    pub first_seen: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub last_seen: DateTime<Utc>,
}

impl Recipient {
    pub fn new(id: i64) -> Self {
        let now = Utc::now();
        Self {
            id,
            username: None,
            chat_id: None,
            subscribed: false,
            blocked: false,
            blocked_reason: None,
            first_seen: now,
            last_seen: now,
        }
    }

    /// Display name for logs and the dashboard.
    pub fn label(&self) -> String {
        match &self.username {
            Some(name) if !name.is_empty() => format!("@{} ({})", name, self.id),
            _ => self.id.to_string(),
        }
    }
}

/// Accepts a number, a numeric string, or null. Anything else reads as absent.
fn lenient_chat_id<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::Number(n)) => n.as_i64(),
        Some(serde_json::Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

/// Partial update. `None` fields are left unchanged.
#[derive(Debug, Clone, Default)]
pub struct RecipientPatch {
    pub username: Option<String>,
    pub chat_id: Option<i64>,
    pub subscribed: Option<bool>,
    pub blocked: Option<bool>,
    /// `Some(None)` clears the reason.
    pub blocked_reason: Option<Option<String>>,
    /// Refresh `last_seen`.
    pub touch: bool,
}

impl RecipientPatch {
    pub fn subscribed(value: bool) -> Self {
        Self {
            subscribed: Some(value),
            ..Self::default()
        }
    }

    pub fn block(reason: impl Into<String>) -> Self {
        Self {
            blocked: Some(true),
            blocked_reason: Some(Some(reason.into())),
            ..Self::default()
        }
    }

    pub fn unblock() -> Self {
        Self {
            blocked: Some(false),
            blocked_reason: Some(None),
            ..Self::default()
        }
    }

    /// Contact seen from an incoming message.
    pub fn seen(username: Option<String>, chat_id: i64) -> Self {
        Self {
            username,
            chat_id: Some(chat_id),
            touch: true,
            ..Self::default()
        }
    }

    pub fn apply(self, recipient: &mut Recipient) {
        if let Some(username) = self.username {
            recipient.username = Some(username);
        }
        if let Some(chat_id) = self.chat_id {
            recipient.chat_id = Some(chat_id);
        }
        if let Some(subscribed) = self.subscribed {
            recipient.subscribed = subscribed;
        }
        if let Some(blocked) = self.blocked {
            recipient.blocked = blocked;
        }
        if let Some(reason) = self.blocked_reason {
            recipient.blocked_reason = reason;
        }
        if self.touch {
            recipient.last_seen = Utc::now();
        }
    }
}

/// Storage of user records. The registry is the single source of truth
/// for subscription and block state.
#[async_trait]
pub trait RecipientRegistry: Send + Sync {
    /// Every record, ordered by id.
    async fn all(&self) -> Result<Vec<Recipient>, RegistryError>;

    async fn get(&self, id: i64) -> Result<Option<Recipient>, RegistryError>;

    /// Applies `patch`, creating a default record when `id` is unknown.
    async fn update(&self, id: i64, patch: RecipientPatch) -> Result<Recipient, RegistryError>;
}

/// One JSON file per user.
pub struct FileRecipientRegistry {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileRecipientRegistry {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    fn path_for(&self, id: i64) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    fn read(&self, path: &Path, id: i64) -> Result<Recipient, RegistryError> {
        let bytes = std::fs::read(path).map_err(|e| RegistryError::io(path, e))?;
        let mut recipient: Recipient =
            serde_json::from_slice(&with_id(&bytes, id)).map_err(|source| {
                RegistryError::Malformed {
                    path: path.to_path_buf(),
                    source,
                }
            })?;
        recipient.id = id;
        Ok(recipient)
    }

    fn write(&self, recipient: &Recipient) -> Result<(), RegistryError> {
        std::fs::create_dir_all(&self.dir).map_err(|e| RegistryError::io(&self.dir, e))?;
        let path = self.path_for(recipient.id);
        let body = serde_json::to_vec_pretty(recipient).map_err(|source| {
            RegistryError::Malformed {
                path: path.clone(),
                source,
            }
        })?;
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)
            .map_err(|e| RegistryError::io(&self.dir, e))?;
        tmp.write_all(&body)
            .map_err(|e| RegistryError::io(tmp.path(), e))?;
        tmp.persist(&path)
            .map_err(|e| RegistryError::io(&path, e.error))?;
        Ok(())
    }
}

/// Older records omit `id`; the file name carries it.
fn with_id(bytes: &[u8], id: i64) -> Vec<u8> {
    match serde_json::from_slice::<serde_json::Value>(bytes) {
        Ok(serde_json::Value::Object(mut map)) => {
            map.insert("id".to_string(), serde_json::Value::from(id));
            serde_json::to_vec(&map).unwrap_or_else(|_| bytes.to_vec())
        }
        _ => bytes.to_vec(),
    }
}

#[async_trait]
impl RecipientRegistry for FileRecipientRegistry {
    async fn all(&self) -> Result<Vec<Recipient>, RegistryError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let read_dir = std::fs::read_dir(&self.dir).map_err(|e| RegistryError::io(&self.dir, e))?;

        let mut out = Vec::new();
        for item in read_dir {
            let item = item.map_err(|e| RegistryError::io(&self.dir, e))?;
            let path = item.path();
            let Some(id) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_suffix(".json"))
                .and_then(|n| n.parse::<i64>().ok())
            else {
                continue;
            };
            match self.read(&path, id) {
                Ok(recipient) => out.push(recipient),
                Err(e) => tracing::warn!(error = %e, "skipping unreadable user record"),
            }
        }
        out.sort_by_key(|r| r.id);
        Ok(out)
    }

    async fn get(&self, id: i64) -> Result<Option<Recipient>, RegistryError> {
        let path = self.path_for(id);
        if !path.exists() {
            return Ok(None);
        }
        self.read(&path, id).map(Some)
    }

    async fn update(&self, id: i64, patch: RecipientPatch) -> Result<Recipient, RegistryError> {
        let _guard = self.write_lock.lock().await;
        let mut recipient = self.get(id).await?.unwrap_or_else(|| Recipient::new(id));
        patch.apply(&mut recipient);
        self.write(&recipient)?;
        Ok(recipient)
    }
}
