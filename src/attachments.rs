//! # Attachment registry
//!
//! Records which stored files belong to which `(user, chat)` pair.
//!
//! Registration is idempotent on content: the SHA-256 of the stored bytes is
//! part of a `(sha256, chat_id, user_id)` uniqueness constraint, so uploading
//! the same bytes twice into one chat yields a single row. The same bytes in a
//! different chat, or from a different user, are a distinct attachment.
//!
//! When the stored file cannot be read at registration time the hash is left
//! `NULL`. SQLite treats `NULL`s as distinct, so such rows are never deduplicated.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use chrono::Utc;
use diesel::prelude::*;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::Result;
use crate::models::{Attachment, NewAttachment};
use crate::schema::files;
use crate::store::Database;

const HASH_CHUNK: usize = 1 << 20;

/// Hex SHA-256 of a file, read in 1 MiB chunks.
pub fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut reader = BufReader::with_capacity(HASH_CHUNK, File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_CHUNK];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

impl Database {
    /// Register a stored file against a chat.
    ///
    /// Returns the new attachment id, or `None` when an attachment with the same
    /// content already exists for this `(chat, user)`.
    pub fn register_attachment(
        &mut self,
        user_id: i32,
        chat_id: i32,
        original_name: &str,
        stored_path: &Path,
        meta: &serde_json::Value,
    ) -> Result<Option<i32>> {
        let sha256 = match hash_file(stored_path) {
            Ok(digest) => Some(digest),
            Err(err) => {
                warn!(path = %stored_path.display(), error = %err, "stored file unreadable, registering without hash");
                None
            }
        };
        let meta = serde_json::to_string(meta)?;
        let stored = stored_path.to_string_lossy();

        let new_attachment = NewAttachment {
            user_id,
            chat_id,
            original_name,
            stored_path: &stored,
            sha256: sha256.as_deref(),
            created_at: Utc::now().naive_utc(),
            meta: &meta,
        };

        let id = diesel::insert_or_ignore_into(files::table)
            .values(&new_attachment)
            .returning(files::id)
            .get_result::<i32>(self.conn())
            .optional()?;

        match id {
            Some(id) => debug!(attachment_id = id, chat_id, original_name, "attachment registered"),
            None => debug!(chat_id, original_name, "duplicate attachment ignored"),
        }
        Ok(id)
    }

    /// Attachments of a chat, newest first, whose stored file still exists.
    pub fn list_for_chat(&mut self, chat_id: i32) -> Result<Vec<Attachment>> {
        let rows: Vec<Attachment> = files::table
            .filter(files::chat_id.eq(chat_id))
            .order((files::created_at.desc(), files::id.desc()))
            .select(Attachment::as_select())
            .load(self.conn())?;

        Ok(rows.into_iter().filter(|a| a.path().exists()).collect())
    }

    /// Attachments of a thread. Unknown threads have none.
    pub fn attachments_for_thread(&mut self, thread_id: &str) -> Result<Vec<Attachment>> {
        match self.chat_by_thread(thread_id)? {
            Some(chat) => self.list_for_chat(chat.id),
            None => Ok(Vec::new()),
        }
    }

    /// Number of registered rows for a user, regardless of file presence.
    pub fn attachment_count(&mut self, user_id: i32) -> Result<i64> {
        Ok(files::table
            .filter(files::user_id.eq(user_id))
            .count()
            .get_result(self.conn())?)
    }
}
