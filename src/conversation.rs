//! # Conversation store
//!
//! System of record for chats and their ordered messages.
//!
//! ## Ordering
//! - Chats are listed most recently active first (`updated_at` descending). The
//!   first entry is the chat a user lands on after logging in.
//! - Messages are returned in creation order. Entries written within the same
//!   clock tick are ordered by their insertion sequence (`id`), so the order
//!   callers appended them in is the order they read back.
//!
//! ## Missing threads
//! Thread ids arrive from the outside and may point at a chat that was just
//! deleted. Reads return empty results and thread-addressed writes (rename,
//! touch, delete) silently affect zero rows.

use chrono::{NaiveDateTime, Utc};
use diesel::prelude::*;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::models::{Chat, ChatMessage, MessageRow, NewChat, NewMessage};
use crate::schema::{chats, messages};
use crate::store::Database;

/// How many fresh thread ids `create_chat` tries before giving up.
pub const MAX_THREAD_ID_ATTEMPTS: usize = 16;

/// Title given to chats created without an explicit one.
pub const DEFAULT_TITLE_PREFIX: &str = "Chat";

/// A new opaque thread identifier (random UUIDv4).
pub fn new_thread_id() -> String {
    Uuid::new_v4().to_string()
}

fn now() -> NaiveDateTime {
    Utc::now().naive_utc()
}

impl Database {
    /// Create a chat with a fresh random thread id.
    pub fn create_chat(&mut self, user_id: i32, title: &str) -> Result<Chat> {
        self.create_chat_with(user_id, title, new_thread_id)
    }

    /// Create a chat drawing thread ids from `next_id`.
    ///
    /// Uniqueness is enforced by the store: when an insert collides with an
    /// existing thread id, another id is drawn, up to [`MAX_THREAD_ID_ATTEMPTS`].
    pub fn create_chat_with<F>(&mut self, user_id: i32, title: &str, mut next_id: F) -> Result<Chat>
    where
        F: FnMut() -> String,
    {
        for attempt in 1..=MAX_THREAD_ID_ATTEMPTS {
            let thread_id = next_id();
            let stamp = now();
            let new_chat = NewChat {
                user_id,
                thread_id: &thread_id,
                title,
                created_at: stamp,
                updated_at: stamp,
            };

            let inserted = diesel::insert_into(chats::table)
                .values(&new_chat)
                .returning(Chat::as_returning())
                .get_result(self.conn())
                .map_err(StoreError::from);

            match inserted {
                Ok(chat) => {
                    info!(user_id, thread_id = %chat.thread_id, title, "chat created");
                    return Ok(chat);
                }
                Err(err) if err.is_unique_violation() => {
                    debug!(attempt, thread_id, "thread id collision, drawing another");
                }
                Err(err) => return Err(err),
            }
        }

        Err(StoreError::ThreadIdExhausted(MAX_THREAD_ID_ATTEMPTS))
    }

    /// The user's chats, most recently active first.
    pub fn list_chats(&mut self, user_id: i32) -> Result<Vec<Chat>> {
        Ok(chats::table
            .filter(chats::user_id.eq(user_id))
            .order((chats::updated_at.desc(), chats::id.desc()))
            .select(Chat::as_select())
            .load(self.conn())?)
    }

    pub fn chat_by_thread(&mut self, thread_id: &str) -> Result<Option<Chat>> {
        Ok(chats::table
            .filter(chats::thread_id.eq(thread_id))
            .select(Chat::as_select())
            .first(self.conn())
            .optional()?)
    }

    pub fn chat_by_id(&mut self, id: i32) -> Result<Option<Chat>> {
        Ok(chats::table
            .find(id)
            .select(Chat::as_select())
            .first(self.conn())
            .optional()?)
    }

    /// Thread id of the user's most recently active chat.
    pub fn last_thread_for_user(&mut self, user_id: i32) -> Result<Option<String>> {
        Ok(chats::table
            .filter(chats::user_id.eq(user_id))
            .order((chats::updated_at.desc(), chats::id.desc()))
            .select(chats::thread_id)
            .first(self.conn())
            .optional()?)
    }

    /// `Chat N` with the smallest `N` not already used by one of the user's titles.
    pub fn next_default_title(&mut self, user_id: i32) -> Result<String> {
        let titles: Vec<String> = chats::table
            .filter(chats::user_id.eq(user_id))
            .select(chats::title)
            .load(self.conn())?;

        let mut n = 1;
        loop {
            let candidate = format!("{DEFAULT_TITLE_PREFIX} {n}");
            if !titles.contains(&candidate) {
                return Ok(candidate);
            }
            n += 1;
        }
    }

    /// Set the title and bump `updated_at`. Unknown threads are a no-op.
    pub fn rename_chat(&mut self, thread_id: &str, title: &str) -> Result<()> {
        let updated = diesel::update(chats::table.filter(chats::thread_id.eq(thread_id)))
            .set((chats::title.eq(title), chats::updated_at.eq(now())))
            .execute(self.conn())?;
        if updated == 0 {
            debug!(thread_id, "rename on unknown thread ignored");
        }
        Ok(())
    }

    /// Mark activity without changing content. Unknown threads are a no-op.
    pub fn touch_chat(&mut self, thread_id: &str) -> Result<()> {
        diesel::update(chats::table.filter(chats::thread_id.eq(thread_id)))
            .set(chats::updated_at.eq(now()))
            .execute(self.conn())?;
        Ok(())
    }

    /// Remove the chat; its messages and attachments go with it.
    ///
    /// Returns whether a chat was actually deleted.
    pub fn delete_chat(&mut self, thread_id: &str) -> Result<bool> {
        let deleted = diesel::delete(chats::table.filter(chats::thread_id.eq(thread_id)))
            .execute(self.conn())?;
        if deleted > 0 {
            info!(thread_id, "chat deleted");
        }
        Ok(deleted > 0)
    }

    /// Append an entry to `chat` and bump the chat's `updated_at`.
    ///
    /// Prior entries are never touched. Returns the new message id.
    pub fn append_message(&mut self, chat: &Chat, message: &ChatMessage) -> Result<i32> {
        let content = message.content();
        let stamp = now();
        let new_message = NewMessage {
            content: &content,
            role: message.role().as_str(),
            kind: message.kind().as_str(),
            chat_id: chat.id,
            thread_id: &chat.thread_id,
            created_at: stamp,
        };

        let id = self.conn().transaction(|conn| {
            let id = diesel::insert_into(messages::table)
                .values(&new_message)
                .returning(messages::id)
                .get_result::<i32>(conn)?;
            diesel::update(chats::table.find(chat.id))
                .set(chats::updated_at.eq(stamp))
                .execute(conn)?;
            Ok::<_, diesel::result::Error>(id)
        })?;

        debug!(thread_id = %chat.thread_id, message_id = id, kind = new_message.kind, "message appended");
        Ok(id)
    }

    /// Every entry of a chat in creation order. Unknown chats yield an empty list.
    pub fn load_history(&mut self, chat_id: i32) -> Result<Vec<MessageRow>> {
        Ok(messages::table
            .filter(messages::chat_id.eq(chat_id))
            .order((messages::created_at.asc(), messages::id.asc()))
            .select(MessageRow::as_select())
            .load(self.conn())?)
    }

    /// The transcript of a thread as typed messages.
    ///
    /// Rows that cannot be mapped (unknown role or kind) are skipped with a
    /// warning rather than failing the whole read.
    pub fn transcript(&mut self, thread_id: &str) -> Result<Vec<ChatMessage>> {
        let Some(chat) = self.chat_by_thread(thread_id)? else {
            return Ok(Vec::new());
        };

        let rows = self.load_history(chat.id)?;
        Ok(rows
            .iter()
            .filter_map(|row| match ChatMessage::try_from(row) {
                Ok(message) => Some(message),
                Err(err) => {
                    warn!(message_id = row.id, error = %err, "skipping unreadable message");
                    None
                }
            })
            .collect())
    }

    /// Maintenance: remove a single message. Not part of the conversational flow.
    pub fn delete_message(&mut self, message_id: i32) -> Result<bool> {
        let deleted = diesel::delete(messages::table.find(message_id)).execute(self.conn())?;
        Ok(deleted > 0)
    }

    /// Maintenance: rewrite a message's content in place.
    pub fn edit_message(&mut self, message_id: i32, content: &str) -> Result<bool> {
        let updated = diesel::update(messages::table.find(message_id))
            .set(messages::content.eq(content))
            .execute(self.conn())?;
        Ok(updated > 0)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use crate::models::Role;
    use crate::schema::{files, users};
    use crate::testing::{memory_db, seed_user};

    use super::*;

    #[test]
    fn thread_ids_are_unique_across_many_creations() {
        let mut db = memory_db();
        let user = seed_user(&mut db, "ana");

        let mut seen = HashSet::new();
        for i in 0..10_000 {
            let chat = db.create_chat(user, &format!("c{i}")).unwrap();
            assert!(seen.insert(chat.thread_id));
        }
    }

    #[test]
    fn colliding_thread_ids_are_redrawn() {
        let mut db = memory_db();
        let user = seed_user(&mut db, "ana");

        // An identifier space of three values, handed out with repeats.
        let mut draws = ["t0", "t0", "t0", "t1", "t0", "t1", "t2"].into_iter();
        let mut next = || draws.next().unwrap_or("t0").to_string();

        let a = db.create_chat_with(user, "a", &mut next).unwrap();
        let b = db.create_chat_with(user, "b", &mut next).unwrap();
        let c = db.create_chat_with(user, "c", &mut next).unwrap();
        assert_eq!(
            [a.thread_id, b.thread_id, c.thread_id],
            ["t0".to_string(), "t1".to_string(), "t2".to_string()]
        );

        let err = db.create_chat_with(user, "d", || "t1".to_string()).unwrap_err();
        assert!(matches!(err, StoreError::ThreadIdExhausted(MAX_THREAD_ID_ATTEMPTS)));
    }

    /// Identifier space cut to 4096 values and filled to about 98%, so most
    /// late creations hit a collision and some exhaust their redraws.
    #[test]
    fn small_identifier_space_never_yields_duplicates() {
        let mut db = memory_db();
        let user = seed_user(&mut db, "ana");

        let mut counter: u64 = 0;
        let mut next = move || {
            counter = counter.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            format!("{}", (counter >> 33) % 4096)
        };

        let mut seen = HashSet::new();
        let mut exhausted = 0;
        for i in 0..4_000 {
            match db.create_chat_with(user, &format!("c{i}"), &mut next) {
                Ok(chat) => assert!(seen.insert(chat.thread_id)),
                Err(StoreError::ThreadIdExhausted(_)) => exhausted += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        let stored: i64 = chats::table.count().get_result(db.conn()).unwrap();
        assert_eq!(stored as usize, seen.len());
        assert_eq!(seen.len() + exhausted, 4_000);
    }

    #[test]
    fn generated_thread_ids_do_not_repeat_over_a_million_draws() {
        let mut seen = HashSet::with_capacity(1_000_000);
        for _ in 0..1_000_000 {
            let id = Uuid::parse_str(&new_thread_id()).unwrap().as_u128();
            assert!(seen.insert(id));
        }
    }

    #[test]
    fn deleting_a_user_removes_their_chats_messages_and_files() {
        let mut db = memory_db();
        let ana = seed_user(&mut db, "ana");
        let bob = seed_user(&mut db, "bob");

        let dir = tempfile::tempdir().unwrap();
        for (user, name) in [(ana, "ana"), (bob, "bob")] {
            let chat = db.create_chat(user, "Chat 1").unwrap();
            db.append_message(&chat, &ChatMessage::user_text("hi")).unwrap();
            db.append_message(&chat, &ChatMessage::assistant_text("hello")).unwrap();
            let path = dir.path().join(format!("{name}.txt"));
            std::fs::write(&path, name.as_bytes()).unwrap();
            db.register_attachment(user, chat.id, "notes.txt", &path, &serde_json::json!({}))
                .unwrap();
        }

        let deleted = diesel::delete(users::table.find(ana)).execute(db.conn()).unwrap();
        assert_eq!(deleted, 1);

        let count = |db: &mut Database| -> (i64, i64, i64) {
            (
                chats::table.count().get_result(db.conn()).unwrap(),
                messages::table.count().get_result(db.conn()).unwrap(),
                files::table.count().get_result(db.conn()).unwrap(),
            )
        };
        // Only bob's rows remain.
        assert_eq!(count(&mut db), (1, 2, 1));
        assert!(db.list_chats(ana).unwrap().is_empty());
        assert_eq!(db.attachment_count(ana).unwrap(), 0);
        assert_eq!(db.list_chats(bob).unwrap().len(), 1);
    }

    #[test]
    fn history_preserves_append_order_despite_timestamp_ties() {
        let mut db = memory_db();
        let user = seed_user(&mut db, "ana");
        let chat = db.create_chat(user, "Chat 1").unwrap();

        let frozen = now();
        for i in 0..50 {
            let id = db.append_message(&chat, &ChatMessage::user_text(format!("m{i}"))).unwrap();
            // Force every row onto the same timestamp.
            diesel::update(messages::table.find(id))
                .set(messages::created_at.eq(frozen))
                .execute(db.conn())
                .unwrap();
        }

        let history = db.load_history(chat.id).unwrap();
        let contents: Vec<_> = history.iter().map(|m| m.content.clone()).collect();
        let expected: Vec<_> = (0..50).map(|i| format!("m{i}")).collect();
        assert_eq!(contents, expected);
        assert!(history.iter().all(|m| m.thread_id == chat.thread_id));
    }

    #[test]
    fn list_chats_puts_most_recent_activity_first() {
        let mut db = memory_db();
        let user = seed_user(&mut db, "ana");
        let first = db.create_chat(user, "first").unwrap();
        let second = db.create_chat(user, "second").unwrap();

        assert_eq!(db.list_chats(user).unwrap()[0].thread_id, second.thread_id);

        db.append_message(&first, &ChatMessage::user_text("hello")).unwrap();
        let listed = db.list_chats(user).unwrap();
        assert_eq!(listed[0].thread_id, first.thread_id);
        assert_eq!(db.last_thread_for_user(user).unwrap(), Some(first.thread_id));
    }

    #[test]
    fn list_chats_is_scoped_to_the_owner() {
        let mut db = memory_db();
        let ana = seed_user(&mut db, "ana");
        let bob = seed_user(&mut db, "bob");
        db.create_chat(ana, "mine").unwrap();

        assert!(db.list_chats(bob).unwrap().is_empty());
        assert_eq!(db.last_thread_for_user(bob).unwrap(), None);
    }

    #[test]
    fn rename_and_touch_are_noops_on_unknown_threads() {
        let mut db = memory_db();
        assert!(db.rename_chat("missing", "x").is_ok());
        assert!(db.touch_chat("missing").is_ok());
        assert!(!db.delete_chat("missing").unwrap());
        assert!(db.transcript("missing").unwrap().is_empty());
        assert!(db.load_history(12345).unwrap().is_empty());
    }

    #[test]
    fn rename_is_idempotent_and_bumps_activity() {
        let mut db = memory_db();
        let user = seed_user(&mut db, "ana");
        let old = db.create_chat(user, "old").unwrap();
        let newer = db.create_chat(user, "newer").unwrap();

        db.rename_chat(&old.thread_id, "Quarterly report").unwrap();
        db.rename_chat(&old.thread_id, "Quarterly report").unwrap();

        let listed = db.list_chats(user).unwrap();
        assert_eq!(listed[0].title, "Quarterly report");
        assert_eq!(listed[0].thread_id, old.thread_id);
        assert_eq!(listed[1].thread_id, newer.thread_id);
    }

    #[test]
    fn delete_cascades_to_messages_and_files_only_for_that_chat() {
        let mut db = memory_db();
        let user = seed_user(&mut db, "ana");
        let doomed = db.create_chat(user, "doomed").unwrap();
        let kept = db.create_chat(user, "kept").unwrap();

        let dir = tempfile::tempdir().unwrap();
        for chat in [&doomed, &kept] {
            db.append_message(chat, &ChatMessage::user_text("hi")).unwrap();
            db.append_message(chat, &ChatMessage::assistant_text("hello")).unwrap();
            let path = dir.path().join(format!("{}.txt", chat.thread_id));
            std::fs::write(&path, chat.thread_id.as_bytes()).unwrap();
            db.register_attachment(user, chat.id, "notes.txt", &path, &serde_json::json!({}))
                .unwrap();
        }

        assert!(db.delete_chat(&doomed.thread_id).unwrap());

        let doomed_messages: i64 = messages::table
            .filter(messages::chat_id.eq(doomed.id))
            .count()
            .get_result(db.conn())
            .unwrap();
        let doomed_files: i64 = files::table
            .filter(files::chat_id.eq(doomed.id))
            .count()
            .get_result(db.conn())
            .unwrap();
        assert_eq!((doomed_messages, doomed_files), (0, 0));

        assert_eq!(db.load_history(kept.id).unwrap().len(), 2);
        assert_eq!(db.list_for_chat(kept.id).unwrap().len(), 1);
        assert!(db.chat_by_thread(&doomed.thread_id).unwrap().is_none());
    }

    #[test]
    fn transcript_skips_unreadable_rows() {
        let mut db = memory_db();
        let user = seed_user(&mut db, "ana");
        let chat = db.create_chat(user, "Chat 1").unwrap();
        db.append_message(&chat, &ChatMessage::user_text("ok")).unwrap();
        let bad = db.append_message(&chat, &ChatMessage::assistant_text("?")).unwrap();
        diesel::update(messages::table.find(bad))
            .set(messages::role.eq("system"))
            .execute(db.conn())
            .unwrap();

        let transcript = db.transcript(&chat.thread_id).unwrap();
        assert_eq!(transcript, vec![ChatMessage::user_text("ok")]);
    }

    #[test]
    fn next_default_title_fills_the_first_gap() {
        let mut db = memory_db();
        let user = seed_user(&mut db, "ana");
        assert_eq!(db.next_default_title(user).unwrap(), "Chat 1");

        db.create_chat(user, "Chat 1").unwrap();
        db.create_chat(user, "Chat 3").unwrap();
        assert_eq!(db.next_default_title(user).unwrap(), "Chat 2");
    }

    #[test]
    fn maintenance_edit_and_drop() {
        let mut db = memory_db();
        let user = seed_user(&mut db, "ana");
        let chat = db.create_chat(user, "Chat 1").unwrap();
        let id = db.append_message(&chat, &ChatMessage::user_text("typo")).unwrap();

        assert!(db.edit_message(id, "fixed").unwrap());
        let history = db.load_history(chat.id).unwrap();
        assert_eq!(history[0].content, "fixed");
        assert_eq!(history[0].role, Role::User.as_str());

        assert!(db.delete_message(id).unwrap());
        assert!(!db.delete_message(id).unwrap());
        assert!(db.load_history(chat.id).unwrap().is_empty());
    }
}
