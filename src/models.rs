//! # Database models
//!
//! Data structures that map to the SQLite schema via **Diesel**, plus the small
//! closed vocabulary (roles, message kinds) used to interpret message rows.
//!
//! - [`User`]: a login identity with a salted secret verifier.
//! - [`Chat`]: one durable conversation thread, addressed externally by its
//!   `thread_id`.
//! - [`MessageRow`]: one persisted turn entry inside a chat.
//! - [`Attachment`]: an uploaded file registered against a `(user, chat)` pair.
//!
//! Rows are never handed to callers as loosely typed records: a message row is
//! turned into a [`ChatMessage`] (`Text` or `File`) before it reaches the
//! orchestration layer, and back again when it is persisted.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::NaiveDateTime;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// A login identity.
///
/// `hash_password` holds a PHC-formatted Argon2 verifier, never the secret.
#[derive(Queryable, Selectable, Identifiable, Debug, Clone, PartialEq)]
#[diesel(table_name = crate::schema::users)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct User {
    pub id: i32,
    pub username: String,
    pub hash_password: String,
    pub created_at: NaiveDateTime,
}

#[derive(Insertable)]
#[diesel(table_name = crate::schema::users)]
pub struct NewUser<'a> {
    pub username: &'a str,
    pub hash_password: &'a str,
    pub created_at: NaiveDateTime,
}

/// One independent conversation belonging to exactly one user.
///
/// ### Invariants
/// - `thread_id` is globally unique and never changes.
/// - `user_id` never changes.
/// - `updated_at` moves forward on rename, touch and every appended message.
#[derive(Queryable, Selectable, Identifiable, Associations, Debug, Clone, PartialEq)]
#[diesel(belongs_to(User))]
#[diesel(table_name = crate::schema::chats)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Chat {
    pub id: i32,
    pub user_id: i32,
    pub thread_id: String,
    pub title: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Insertable)]
#[diesel(table_name = crate::schema::chats)]
pub struct NewChat<'a> {
    pub user_id: i32,
    pub thread_id: &'a str,
    pub title: &'a str,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// One persisted entry of a chat.
///
/// `id` is the monotonic insertion sequence; it breaks ties between entries
/// sharing a `created_at`. `thread_id` duplicates the owning chat's external
/// identifier for lookups that only know the thread.
#[derive(Queryable, Selectable, Identifiable, Associations, Debug, Clone, PartialEq)]
#[diesel(belongs_to(Chat))]
#[diesel(table_name = crate::schema::messages)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct MessageRow {
    pub id: i32,
    pub content: String,
    pub role: String,
    pub kind: String,
    pub chat_id: i32,
    pub thread_id: String,
    pub created_at: NaiveDateTime,
}

#[derive(Insertable)]
#[diesel(table_name = crate::schema::messages)]
pub struct NewMessage<'a> {
    pub content: &'a str,
    pub role: &'a str,
    pub kind: &'a str,
    pub chat_id: i32,
    pub thread_id: &'a str,
    pub created_at: NaiveDateTime,
}

/// A file registered against a chat.
///
/// `sha256` is `None` when the stored bytes were unavailable at registration
/// time. `meta` is a JSON object serialized as text.
#[derive(Queryable, Selectable, Identifiable, Associations, Debug, Clone, PartialEq)]
#[diesel(belongs_to(Chat))]
#[diesel(table_name = crate::schema::files)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Attachment {
    pub id: i32,
    pub user_id: i32,
    pub chat_id: i32,
    pub original_name: String,
    pub stored_path: String,
    pub sha256: Option<String>,
    pub created_at: NaiveDateTime,
    pub meta: String,
}

impl Attachment {
    pub fn path(&self) -> &Path {
        Path::new(&self.stored_path)
    }

    /// Decode the metadata blob.
    pub fn metadata(&self) -> Result<serde_json::Value, StoreError> {
        Ok(serde_json::from_str(&self.meta)?)
    }
}

#[derive(Insertable)]
#[diesel(table_name = crate::schema::files)]
pub struct NewAttachment<'a> {
    pub user_id: i32,
    pub chat_id: i32,
    pub original_name: &'a str,
    pub stored_path: &'a str,
    pub sha256: Option<&'a str>,
    pub created_at: NaiveDateTime,
    pub meta: &'a str,
}

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            other => Err(StoreError::corrupt(format!("unknown role `{other}`"))),
        }
    }
}

/// Distinguishes plain text turns from file references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    File,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::File => "file",
        }
    }
}

impl FromStr for MessageKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(MessageKind::Text),
            "file" => Ok(MessageKind::File),
            other => Err(StoreError::corrupt(format!("unknown message kind `{other}`"))),
        }
    }
}

/// A conversation entry as the rest of the crate sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ChatMessage {
    Text { role: Role, text: String },
    File { role: Role, path: PathBuf },
}

impl ChatMessage {
    pub fn user_text(text: impl Into<String>) -> Self {
        ChatMessage::Text {
            role: Role::User,
            text: text.into(),
        }
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        ChatMessage::Text {
            role: Role::Assistant,
            text: text.into(),
        }
    }

    pub fn user_file(path: impl Into<PathBuf>) -> Self {
        ChatMessage::File {
            role: Role::User,
            path: path.into(),
        }
    }

    pub fn role(&self) -> Role {
        match self {
            ChatMessage::Text { role, .. } | ChatMessage::File { role, .. } => *role,
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            ChatMessage::Text { .. } => MessageKind::Text,
            ChatMessage::File { .. } => MessageKind::File,
        }
    }

    /// The persisted `content` column: the text, or the file path.
    pub fn content(&self) -> String {
        match self {
            ChatMessage::Text { text, .. } => text.clone(),
            ChatMessage::File { path, .. } => path.to_string_lossy().into_owned(),
        }
    }

    /// Rebuild a message from its `(role, kind, content)` columns.
    pub fn from_parts(role: &str, kind: &str, content: &str) -> Result<Self, StoreError> {
        let role = role.parse::<Role>()?;
        Ok(match kind.parse::<MessageKind>()? {
            MessageKind::Text => ChatMessage::Text {
                role,
                text: content.to_string(),
            },
            MessageKind::File => ChatMessage::File {
                role,
                path: PathBuf::from(content),
            },
        })
    }
}

impl TryFrom<&MessageRow> for ChatMessage {
    type Error = StoreError;

    fn try_from(row: &MessageRow) -> Result<Self, Self::Error> {
        ChatMessage::from_parts(&row.role, &row.kind, &row.content)
    }
}
