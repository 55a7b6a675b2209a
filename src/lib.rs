//! # Gemis (library root)
//!
//! Core plumbing for the **Gemis** CLI and library: a persisted multi-user chat
//! store plus a turn orchestrator that ingests uploaded documents and answers
//! with retrieval-grounded replies.
//!
//! - Store: [`store`] (connection, migrations), [`identity`] (users and
//!   secrets), [`conversation`] (chats and messages), [`attachments`].
//! - Documents and retrieval: [`extract`], [`embeddings`], [`retrieval`].
//! - Replies and titles: [`generation`].
//! - Sessions and turns: [`session`], [`service`], [`ingest`].
//! - CLI parsing and configuration: [`commands`], [`config`].
//!
//! ## Configuration directory
//! [`config_dir`] resolves the per-platform directory holding `config.yaml`,
//! and relative storage paths in the configuration are rooted there, e.g.:
//!
//! - macOS: `~/Library/Application Support/com.gemis.gemis`
//! - Linux (XDG): `~/.config/gemis`
//! - Windows: `C:\Users\<you>\AppData\Roaming\gemis\gemis\config`

use directories::ProjectDirs;
use std::error::Error;

pub mod attachments;
pub mod commands;
pub mod config;
pub mod conversation;
pub mod embeddings;
pub mod error;
pub mod extract;
pub mod generation;
pub mod identity;
pub mod ingest;
pub mod models;
pub mod retrieval;
pub mod schema;
pub mod service;
pub mod session;
pub mod store;

/// Return the per-platform configuration directory used by Gemis.
///
/// This uses [`directories::ProjectDirs`] with the application triple
/// `("com", "gemis", "gemis")`. The directory is **not** created here.
///
/// # Errors
/// Returns an error if the platform configuration directory cannot be determined
/// (which is rare but possible in heavily sandboxed environments).
///
/// # Examples
/// ```rust
/// let cfg = gemis::config_dir().expect("has a config dir");
/// println!("config at {}", cfg.display());
/// ```
pub fn config_dir() -> Result<std::path::PathBuf, Box<dyn Error>> {
    let proj_dirs =
        ProjectDirs::from("com", "gemis", "gemis").ok_or("Unable to determine config directory")?;
    Ok(proj_dirs.config_dir().to_path_buf())
}

/// Shared fixtures: an in-memory store with cheap hashing, and scripted
/// collaborators for driving turns without models or network.
#[cfg(test)]
pub(crate) mod testing {
    use std::path::{Path, PathBuf};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use tempfile::TempDir;

    use crate::extract::{ExtractError, TextExtractor};
    use crate::generation::{GenerationError, ReplyGenerator, ReplyRequest, TitleGenerator};
    use crate::identity::SecretHasher;
    use crate::ingest::UploadPolicy;
    use crate::retrieval::{Document, IndexError, Passage, RetrievalIndex, Scope};
    use crate::service::{ChatService, ChatView, ServiceSettings};
    use crate::session::SessionContext;
    use crate::store::Database;

    pub fn memory_db() -> Database {
        Database::open(":memory:")
            .unwrap()
            .with_hasher(SecretHasher::with_params(8, 1, 1).unwrap())
    }

    /// Create `name` with the secret `pw`.
    pub fn seed_user(db: &mut Database, name: &str) -> i32 {
        db.create_user(name, "pw").unwrap()
    }

    /// Which collaborator calls fail.
    #[derive(Debug, Clone, Default)]
    pub struct Script {
        pub fail_extract_for: Option<String>,
        pub fail_index: bool,
        pub fail_query: bool,
        pub fail_reply: bool,
        pub fail_title: bool,
    }

    struct FakeExtractor {
        fail_for: Option<String>,
    }

    impl TextExtractor for FakeExtractor {
        fn extract(&self, path: &Path) -> Result<Vec<String>, ExtractError> {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            if self.fail_for.as_deref() == Some(name.as_str()) {
                return Err(ExtractError::Unsupported(name));
            }
            Ok(vec![format!("contents of {name}"), "second page".to_string()])
        }
    }

    /// Keeps every added document and answers queries from the matching scope.
    struct RecordingIndex {
        documents: Arc<Mutex<Vec<Document>>>,
        fail_add: bool,
        fail_query: bool,
    }

    impl RetrievalIndex for RecordingIndex {
        fn add_documents(&self, documents: Vec<Document>) -> Result<usize, IndexError> {
            if self.fail_add {
                return Err(IndexError::Ann("scripted add failure"));
            }
            let count = documents.len();
            self.documents.lock().unwrap().extend(documents);
            Ok(count)
        }

        fn query(&self, scope: &Scope, _text: &str, top_k: usize) -> Result<Vec<Passage>, IndexError> {
            if self.fail_query {
                return Err(IndexError::Ann("scripted query failure"));
            }
            Ok(self
                .documents
                .lock()
                .unwrap()
                .iter()
                .filter(|d| {
                    d.metadata.user_id == scope.user_id && d.metadata.thread_id == scope.thread_id
                })
                .take(top_k)
                .map(|d| Passage {
                    text: d.text.clone(),
                    source: d.metadata.source.clone(),
                    distance: 0.0,
                })
                .collect())
        }
    }

    /// Replies `echo: <text>` and titles `Title: <seed>`.
    struct ScriptedGenerator {
        fail_reply: bool,
        fail_title: bool,
        requests: Arc<Mutex<Vec<ReplyRequest>>>,
        seeds: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl ReplyGenerator for ScriptedGenerator {
        async fn reply(&self, request: &ReplyRequest) -> Result<String, GenerationError> {
            self.requests.lock().unwrap().push(request.clone());
            if self.fail_reply {
                return Err(GenerationError::EmptyReply);
            }
            Ok(format!("echo: {}", request.text))
        }
    }

    #[async_trait]
    impl TitleGenerator for ScriptedGenerator {
        async fn title(&self, seed: &str) -> Result<String, GenerationError> {
            self.seeds.lock().unwrap().push(seed.to_string());
            if self.fail_title {
                return Err(GenerationError::EmptyReply);
            }
            Ok(format!("Title: {seed}"))
        }
    }

    /// A service over scripted collaborators plus handles to what they saw.
    pub struct Harness {
        pub service: ChatService,
        dir: TempDir,
        inbox: PathBuf,
        documents: Arc<Mutex<Vec<Document>>>,
        requests: Arc<Mutex<Vec<ReplyRequest>>>,
        seeds: Arc<Mutex<Vec<String>>>,
    }

    impl Harness {
        pub fn new(script: Script) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let inbox = dir.path().join("inbox");
            std::fs::create_dir_all(&inbox).unwrap();

            let documents = Arc::new(Mutex::new(Vec::new()));
            let requests = Arc::new(Mutex::new(Vec::new()));
            let seeds = Arc::new(Mutex::new(Vec::new()));
            let generator = Arc::new(ScriptedGenerator {
                fail_reply: script.fail_reply,
                fail_title: script.fail_title,
                requests: requests.clone(),
                seeds: seeds.clone(),
            });

            let settings = ServiceSettings {
                upload_policy: UploadPolicy::default(),
                upload_root: dir.path().join("uploads"),
                retrieval_top_k: 4,
                session_ttl_secs: 3600,
            };
            let service = ChatService::new(
                memory_db(),
                settings,
                Box::new(FakeExtractor {
                    fail_for: script.fail_extract_for,
                }),
                Box::new(RecordingIndex {
                    documents: documents.clone(),
                    fail_add: script.fail_index,
                    fail_query: script.fail_query,
                }),
                generator.clone(),
                generator,
            );

            Self {
                service,
                dir,
                inbox,
                documents,
                requests,
                seeds,
            }
        }

        /// Seed `name`, log in and select their latest chat.
        pub fn login(&mut self, name: &str) -> (SessionContext, ChatView) {
            seed_user(self.service.database(), name);
            let mut session = self.service.login(name, "pw").unwrap();
            let view = self.service.resume(&mut session).unwrap();
            (session, view)
        }

        /// Where test files are written before upload.
        pub fn inbox(&self) -> &Path {
            &self.inbox
        }

        pub fn upload_root(&self) -> PathBuf {
            self.dir.path().join("uploads")
        }

        pub fn documents(&self) -> Vec<Document> {
            self.documents.lock().unwrap().clone()
        }

        pub fn requests(&self) -> Vec<ReplyRequest> {
            self.requests.lock().unwrap().clone()
        }

        pub fn seeds(&self) -> Vec<String> {
            self.seeds.lock().unwrap().clone()
        }
    }

    /// A bare service for session-level tests; nothing is uploaded.
    pub fn service_with(script: Script) -> ChatService {
        Harness::new(script).service
    }
}
