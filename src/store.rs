//! # Database handle
//!
//! [`Database`] owns a single [`SqliteConnection`] and guarantees the schema is
//! migrated before any other operation runs. The typed operations live next to
//! the data they own:
//!
//! - [`crate::identity`]: users and credential verification
//! - [`crate::conversation`]: chats and their ordered messages
//! - [`crate::attachments`]: uploaded files, deduplicated by content hash
//!
//! Every mutation is a single autocommitting unit of work (or one short
//! transaction when two rows must move together), so a failure between two
//! calls never leaves a half-written row behind.
//!
//! ```no_run
//! use gemis::store::Database;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut db = Database::open("gemis.db")?;
//! let user_id = db.create_user("ana", "correct horse battery staple")?;
//! let chat = db.create_chat(user_id, "Chat 1")?;
//! println!("new thread {}", chat.thread_id);
//! # Ok(()) }
//! ```

use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};
use tracing::{debug, info};

use crate::error::{Result, StoreError};
use crate::identity::SecretHasher;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

const CONNECTION_PRAGMAS: &str = "PRAGMA foreign_keys = ON; \
     PRAGMA journal_mode = WAL; \
     PRAGMA busy_timeout = 5000;";

/// Wrapper around the SQLite connection plus the secret hasher used for users.
pub struct Database {
    conn: SqliteConnection,
    pub(crate) hasher: SecretHasher,
}

impl Database {
    /// Open (or create) the database at `url` and apply pending migrations.
    ///
    /// `url` is anything diesel's SQLite backend accepts: a file path or
    /// `:memory:`. Parent directories of a file path are created.
    ///
    /// # Errors
    /// Fails if the connection cannot be established or the migrations cannot be
    /// applied. Callers treat this as fatal at startup.
    pub fn open(url: &str) -> Result<Self> {
        if url != ":memory:" {
            if let Some(parent) = std::path::Path::new(url).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
        }

        let mut conn =
            SqliteConnection::establish(url).map_err(|source| StoreError::Connection {
                url: url.to_string(),
                source,
            })?;

        conn.batch_execute(CONNECTION_PRAGMAS)?;

        let applied = conn
            .run_pending_migrations(MIGRATIONS)
            .map_err(|e| StoreError::Migration(e.to_string()))?;
        for version in &applied {
            debug!(%version, "applied migration");
        }

        info!(url, "database ready");

        Ok(Self {
            conn,
            hasher: SecretHasher::default(),
        })
    }

    /// Replace the hasher used when storing new secrets.
    pub fn with_hasher(mut self, hasher: SecretHasher) -> Self {
        self.hasher = hasher;
        self
    }

    /// Direct access to the connection for ad-hoc queries.
    pub fn conn(&mut self) -> &mut SqliteConnection {
        &mut self.conn
    }
}
