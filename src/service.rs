//! # Chat service
//!
//! Session-level operations over the store and the external collaborators.
//!
//! [`ChatService`] owns the [`Database`] plus boxed collaborators for text
//! extraction, retrieval and generation. The front end holds one
//! [`SessionContext`] per logged-in user and passes it to every call.
//!
//! Turn submission lives in [`crate::ingest`].

use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::{EmbeddingBackend, GemisConfig};
use crate::embeddings::{BertEmbedder, Embedder, HashedEmbedder};
use crate::extract::{DocumentExtractor, ExtractError, TextExtractor};
use crate::generation::{
    GenerationError, OpenAiGenerator, ReplyGenerator, ReplyRequest, TitleGenerator,
};
use crate::ingest::UploadPolicy;
use crate::models::{Attachment, Chat, ChatMessage};
use crate::retrieval::{Document, IndexError, Passage, RetrievalIndex, Scope, VectorIndex};
use crate::session::{LoginError, SessionContext, SessionError, display_name};
use crate::store::Database;

/// Tunables of the service that do not belong to any single collaborator.
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub upload_policy: UploadPolicy,
    pub upload_root: PathBuf,
    pub retrieval_top_k: usize,
    pub session_ttl_secs: u64,
}

impl From<&GemisConfig> for ServiceSettings {
    fn from(config: &GemisConfig) -> Self {
        Self {
            upload_policy: UploadPolicy {
                allowed_extensions: config.allowed_extensions.clone(),
                max_file_size_mb: config.max_file_size_mb,
            },
            upload_root: config.upload_root.clone(),
            retrieval_top_k: config.retrieval_top_k,
            session_ttl_secs: config.session_ttl_secs,
        }
    }
}

/// What the front end shows for the selected chat.
#[derive(Debug, Clone)]
pub struct ChatView {
    pub thread_id: String,
    /// `None` when the selected thread no longer exists.
    pub title: Option<String>,
    /// All of the user's chats, most recently active first.
    pub chats: Vec<Chat>,
    pub transcript: Vec<ChatMessage>,
    pub attachments: Vec<Attachment>,
    pub greeting: String,
}

/// Stands in for every collaborator when only the store is needed. Each call fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct Detached;

impl TextExtractor for Detached {
    fn extract(&self, _path: &Path) -> Result<Vec<String>, ExtractError> {
        Err(ExtractError::Unavailable)
    }
}

impl RetrievalIndex for Detached {
    fn add_documents(&self, _documents: Vec<Document>) -> Result<usize, IndexError> {
        Err(IndexError::Unavailable)
    }

    fn query(&self, _scope: &Scope, _text: &str, _top_k: usize) -> Result<Vec<Passage>, IndexError> {
        Err(IndexError::Unavailable)
    }
}

#[async_trait]
impl ReplyGenerator for Detached {
    async fn reply(&self, _request: &ReplyRequest) -> Result<String, GenerationError> {
        Err(GenerationError::Unavailable)
    }
}

#[async_trait]
impl TitleGenerator for Detached {
    async fn title(&self, _seed: &str) -> Result<String, GenerationError> {
        Err(GenerationError::Unavailable)
    }
}

pub struct ChatService {
    pub(crate) db: Database,
    pub(crate) settings: ServiceSettings,
    pub(crate) extractor: Box<dyn TextExtractor>,
    pub(crate) index: Box<dyn RetrievalIndex>,
    pub(crate) replies: Arc<dyn ReplyGenerator>,
    pub(crate) titles: Arc<dyn TitleGenerator>,
}

impl ChatService {
    pub fn new(
        db: Database,
        settings: ServiceSettings,
        extractor: Box<dyn TextExtractor>,
        index: Box<dyn RetrievalIndex>,
        replies: Arc<dyn ReplyGenerator>,
        titles: Arc<dyn TitleGenerator>,
    ) -> Self {
        Self {
            db,
            settings,
            extractor,
            index,
            replies,
            titles,
        }
    }

    /// Wire the production collaborators from configuration.
    ///
    /// # Errors
    /// Failing to open the store, load the embedder or read the index snapshot
    /// is fatal.
    pub fn from_config(config: &GemisConfig) -> Result<Self, Box<dyn Error>> {
        let db = Database::open(&config.session_db_url)?;

        let embedder: Box<dyn Embedder> = match config.embedding_backend {
            EmbeddingBackend::Bert => Box::new(BertEmbedder::load()?),
            EmbeddingBackend::Hashed => Box::new(HashedEmbedder::default()),
        };
        let index = VectorIndex::open(embedder, &config.index_path)?;
        let generator = Arc::new(OpenAiGenerator::from_config(config)?);

        Ok(Self::new(
            db,
            ServiceSettings::from(config),
            Box::new(DocumentExtractor),
            Box::new(index),
            generator.clone(),
            generator,
        ))
    }

    /// Open only the store, for commands that never run a turn. Listing,
    /// history and chat management work; a submitted turn gets no reply.
    pub fn store_only(config: &GemisConfig) -> Result<Self, Box<dyn Error>> {
        let db = Database::open(&config.session_db_url)?;
        debug!(db = %config.session_db_url, "service opened without models");
        Ok(Self::new(
            db,
            ServiceSettings::from(config),
            Box::new(Detached),
            Box::new(Detached),
            Arc::new(Detached),
            Arc::new(Detached),
        ))
    }

    /// Direct store access for administrative commands.
    pub fn database(&mut self) -> &mut Database {
        &mut self.db
    }

    /// Authenticate and open a session. No chat is selected yet; call [`Self::resume`].
    pub fn login(&mut self, username: &str, secret: &str) -> Result<SessionContext, LoginError> {
        let username = username.trim();
        if username.is_empty() || secret.is_empty() {
            return Err(LoginError::MissingCredentials);
        }

        let (ok, _) = self.db.verify(username, secret);
        if !ok {
            return Err(LoginError::InvalidCredentials);
        }

        match self.db.user_id(username) {
            Ok(Some(user_id)) => {
                info!(user_id, username, "login");
                Ok(SessionContext::new(user_id, username, self.settings.session_ttl_secs))
            }
            Ok(None) => Err(LoginError::InvalidCredentials),
            Err(err) => {
                warn!(username, error = %err, "user lookup failed after verification");
                Err(LoginError::InvalidCredentials)
            }
        }
    }

    /// Select the most recently active chat, creating `Chat 1` for a user with none.
    pub fn resume(&mut self, session: &mut SessionContext) -> Result<ChatView, SessionError> {
        session.check()?;
        let thread_id = match self.db.last_thread_for_user(session.user_id())? {
            Some(thread_id) => thread_id,
            None => self.db.create_chat(session.user_id(), "Chat 1")?.thread_id,
        };
        session.select_thread(thread_id);
        self.view(session)
    }

    /// Create and select a new chat titled `Chat N`.
    pub fn new_chat(&mut self, session: &mut SessionContext) -> Result<ChatView, SessionError> {
        session.check()?;
        let title = self.db.next_default_title(session.user_id())?;
        let chat = self.db.create_chat(session.user_id(), &title)?;
        session.select_thread(chat.thread_id);
        self.view(session)
    }

    /// Select `thread_id`. A thread that does not exist selects an empty view.
    pub fn switch_chat(
        &mut self,
        session: &mut SessionContext,
        thread_id: &str,
    ) -> Result<ChatView, SessionError> {
        session.check()?;
        if let Some(chat) = self.db.chat_by_thread(thread_id)? {
            if chat.user_id != session.user_id() {
                return Err(SessionError::NotOwner(thread_id.to_string()));
            }
        }
        session.select_thread(thread_id);
        self.view(session)
    }

    /// Delete the selected chat and fall back to the most recent remaining one,
    /// or a fresh chat when none remain.
    pub fn delete_current_chat(
        &mut self,
        session: &mut SessionContext,
    ) -> Result<ChatView, SessionError> {
        let thread_id = session.current_thread()?;
        self.ensure_owner(session, &thread_id)?;
        self.db.delete_chat(&thread_id)?;

        match self.db.last_thread_for_user(session.user_id())? {
            Some(next) => {
                session.select_thread(next);
                self.view(session)
            }
            None => self.new_chat(session),
        }
    }

    /// Rename the selected chat. Blank titles are ignored.
    pub fn rename_current_chat(
        &mut self,
        session: &SessionContext,
        title: &str,
    ) -> Result<(), SessionError> {
        let thread_id = session.current_thread()?;
        self.ensure_owner(session, &thread_id)?;
        let title = title.trim();
        if !title.is_empty() {
            self.db.rename_chat(&thread_id, title)?;
        }
        Ok(())
    }

    pub fn chats(&mut self, session: &SessionContext) -> Result<Vec<Chat>, SessionError> {
        session.check()?;
        Ok(self.db.list_chats(session.user_id())?)
    }

    /// Attachments of the selected chat, newest first.
    pub fn files(&mut self, session: &SessionContext) -> Result<Vec<Attachment>, SessionError> {
        let thread_id = session.current_thread()?;
        self.ensure_owner(session, &thread_id)?;
        Ok(self.db.attachments_for_thread(&thread_id)?)
    }

    /// Persisted transcript of the selected chat.
    pub fn transcript(&mut self, session: &SessionContext) -> Result<Vec<ChatMessage>, SessionError> {
        let thread_id = session.current_thread()?;
        self.ensure_owner(session, &thread_id)?;
        Ok(self.db.transcript(&thread_id)?)
    }

    pub fn logout(&mut self, session: &mut SessionContext) {
        info!(user_id = session.user_id(), "logout");
        session.invalidate();
    }

    /// Refuse threads owned by someone else. Missing threads pass.
    pub(crate) fn ensure_owner(
        &mut self,
        session: &SessionContext,
        thread_id: &str,
    ) -> Result<(), SessionError> {
        match self.db.chat_by_thread(thread_id)? {
            Some(chat) if chat.user_id != session.user_id() => {
                Err(SessionError::NotOwner(thread_id.to_string()))
            }
            _ => Ok(()),
        }
    }

    fn view(&mut self, session: &SessionContext) -> Result<ChatView, SessionError> {
        let thread_id = session.current_thread()?;
        let chats = self.db.list_chats(session.user_id())?;
        let title = chats
            .iter()
            .find(|c| c.thread_id == thread_id)
            .map(|c| c.title.clone());

        Ok(ChatView {
            transcript: self.db.transcript(&thread_id)?,
            attachments: self.db.attachments_for_thread(&thread_id)?,
            greeting: format!(
                "Hello, {}! How can I help you today?",
                display_name(session.username())
            ),
            thread_id,
            title,
            chats,
        })
    }
}
