//! # Turn ingestion
//!
//! Runs one user turn: uploaded files first, then the text.
//!
//! ## Per-file state machine
//! ```text
//! received -> validated -> stored_locally -> registered -> extracted -> indexed -> complete
//!      \                \______________________________________________________/
//!       -> rejected                            -> failed
//! ```
//! Each step returns a [`StepError`]. A validation error rejects the file with
//! the reason shown verbatim; an infrastructure error fails it with
//! `Error processing <name>`. Either way the loop moves on to the next file and
//! the text portion of the turn still runs.
//!
//! The `file` history entry is written as soon as the bytes are stored, before
//! registration and indexing. A file that later fails keeps that entry, and a
//! registered attachment is never rolled back when indexing fails.
//!
//! Registering byte-identical content a second time is absorbed by the
//! attachment registry, but the file is still extracted and indexed.
//!
//! ## End of turn
//! - files completed and no text: a fixed acknowledgement is persisted as the
//!   assistant reply;
//! - text: the reply is generated, then the user text and the reply are
//!   persisted in that order.
//!
//! When the displayed history held one or two entries at the start of the turn
//! (after staging), the chat is retitled from the text or the uploaded names.
//!
//! Any other fault ends the turn with an apology appended to the displayed
//! history only. The store is not updated on that path.

use std::path::{Path, PathBuf};

use serde_json::json;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::attachments::hash_file;
use crate::error::StoreError;
use crate::extract::extension_of;
use crate::generation::{GenerationError, ReplyRequest};
use crate::models::{Attachment, Chat, ChatMessage};
use crate::retrieval::{Document, DocumentMetadata, Scope};
use crate::service::ChatService;
use crate::session::{SessionContext, SessionError};

pub const UPLOAD_ACK: &str = "Your files were uploaded successfully. How can I help you with them?";
pub const APOLOGY: &str =
    "Sorry, something went wrong while processing your message. Please try again.";
pub const TITLE_WARNING: &str = "Could not generate a title for this chat.";

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Which uploads are accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadPolicy {
    /// Lowercase extensions with their leading dot.
    pub allowed_extensions: Vec<String>,
    pub max_file_size_mb: u64,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self {
            allowed_extensions: vec![".pdf".to_string()],
            max_file_size_mb: 10,
        }
    }
}

impl UploadPolicy {
    /// Check extension then size. Returns the size in bytes.
    pub fn validate(&self, path: &Path) -> Result<u64, StepError> {
        let ext = extension_of(path);
        if !self
            .allowed_extensions
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(&ext))
        {
            return Err(StepError::Validation(format!(
                "File type not allowed. Accepted types: {}",
                self.allowed_extensions.join(", ")
            )));
        }

        let size = std::fs::metadata(path)
            .map_err(|e| StepError::Validation(format!("Could not validate file: {e}")))?
            .len();
        if size > self.max_file_size_mb.saturating_mul(BYTES_PER_MB) {
            return Err(StepError::Validation(format!(
                "File too large. Maximum size: {}MB",
                self.max_file_size_mb
            )));
        }
        Ok(size)
    }
}

/// Where one uploaded file ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    Received,
    Validated,
    StoredLocally,
    Registered,
    Extracted,
    Indexed,
    Complete,
    Rejected,
    Failed,
}

/// Per-step result of the file pipeline.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StepError {
    /// User-correctable; the reason is shown as is.
    #[error("{0}")]
    Validation(String),

    /// Storage, hashing, extraction or indexing fault.
    #[error("{0}")]
    Infrastructure(String),
}

impl StepError {
    fn infra(err: impl std::fmt::Display) -> Self {
        Self::Infrastructure(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FileOutcome {
    pub name: String,
    pub state: FileState,
    pub warning: Option<String>,
    /// Set when this upload created a new attachment row.
    pub attachment_id: Option<i32>,
}

/// One user submission.
#[derive(Debug, Clone, Default)]
pub struct Turn {
    pub text: String,
    pub files: Vec<PathBuf>,
}

impl Turn {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            files: Vec::new(),
        }
    }

    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.files.push(path.into());
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct TurnReport {
    pub files: Vec<FileOutcome>,
    /// Warnings to surface, in the order they happened.
    pub warnings: Vec<String>,
    /// The assistant entry appended to the displayed history.
    pub reply: Option<String>,
    pub title: Option<String>,
    /// The turn hit the apology path.
    pub faulted: bool,
    /// Attachments of the chat after the turn, newest first.
    pub attachments: Vec<Attachment>,
}

/// Faults that abort the turn.
#[derive(Error, Debug)]
pub enum TurnError {
    #[error("Unknown thread {0}")]
    UnknownThread(String),

    #[error("Thread {0} belongs to another user")]
    NotOwner(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Generation(#[from] GenerationError),
}

/// Append the submitted files, then the text if it is not blank.
pub fn stage_turn(history: &mut Vec<ChatMessage>, turn: &Turn) {
    for path in &turn.files {
        history.push(ChatMessage::user_file(path.clone()));
    }
    if !turn.text.trim().is_empty() {
        history.push(ChatMessage::user_text(turn.text.clone()));
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

impl ChatService {
    /// Run one turn on the session's selected chat.
    ///
    /// `history` is the displayed history. It gets the staged entries, then the
    /// reply or the apology.
    ///
    /// # Errors
    /// Only session failures (expired, nothing selected). Every other fault is
    /// reported in the [`TurnReport`].
    pub async fn submit_turn(
        &mut self,
        session: &SessionContext,
        history: &mut Vec<ChatMessage>,
        turn: Turn,
    ) -> Result<TurnReport, SessionError> {
        let thread_id = session.current_thread()?;
        stage_turn(history, &turn);

        let mut report = TurnReport::default();
        if let Err(err) = self
            .run_turn(session.user_id(), &thread_id, history, &turn, &mut report)
            .await
        {
            error!(thread_id, user_id = session.user_id(), error = %err, "turn failed");
            history.push(ChatMessage::assistant_text(APOLOGY));
            report.reply = Some(APOLOGY.to_string());
            report.faulted = true;
        }

        report.attachments = self
            .db
            .attachments_for_thread(&thread_id)
            .unwrap_or_else(|err| {
                warn!(thread_id, error = %err, "could not list attachments");
                Vec::new()
            });
        Ok(report)
    }

    async fn run_turn(
        &mut self,
        user_id: i32,
        thread_id: &str,
        history: &mut Vec<ChatMessage>,
        turn: &Turn,
        report: &mut TurnReport,
    ) -> Result<(), TurnError> {
        let chat = self
            .db
            .chat_by_thread(thread_id)?
            .ok_or_else(|| TurnError::UnknownThread(thread_id.to_string()))?;
        if chat.user_id != user_id {
            return Err(TurnError::NotOwner(thread_id.to_string()));
        }
        self.db.touch_chat(thread_id)?;

        let near_start = matches!(history.len(), 1 | 2);
        let text = turn.text.trim();

        let mut uploaded = Vec::new();
        for source in &turn.files {
            let outcome = self.ingest_file(user_id, &chat, source);
            if let Some(warning) = &outcome.warning {
                report.warnings.push(warning.clone());
            }
            if outcome.state == FileState::Complete {
                uploaded.push(outcome.name.clone());
            }
            report.files.push(outcome);
        }

        if !uploaded.is_empty() && text.is_empty() {
            if near_start {
                let seed = format!("files: {}", uploaded.join(", "));
                self.retitle(&chat, &seed, report).await;
            }
            self.db
                .append_message(&chat, &ChatMessage::assistant_text(UPLOAD_ACK))?;
            history.push(ChatMessage::assistant_text(UPLOAD_ACK));
            report.reply = Some(UPLOAD_ACK.to_string());
            return Ok(());
        }

        if !text.is_empty() {
            let prior = self.db.transcript(thread_id)?;
            let scope = Scope::new(user_id, thread_id);
            let passages = match self
                .index
                .query(&scope, text, self.settings.retrieval_top_k)
            {
                Ok(passages) => passages,
                Err(err) => {
                    warn!(thread_id, error = %err, "retrieval failed, replying without passages");
                    Vec::new()
                }
            };

            let request = ReplyRequest {
                user_id,
                thread_id: thread_id.to_string(),
                history: prior,
                passages,
                text: text.to_string(),
            };
            let answer = self.replies.reply(&request).await?;

            self.db.append_message(&chat, &ChatMessage::user_text(text))?;
            self.db
                .append_message(&chat, &ChatMessage::assistant_text(answer.clone()))?;
            history.push(ChatMessage::assistant_text(answer.clone()));
            report.reply = Some(answer);

            if near_start {
                self.retitle(&chat, text, report).await;
            }
        }

        Ok(())
    }

    /// Generate and persist a title. Failures only produce a warning.
    async fn retitle(&mut self, chat: &Chat, seed: &str, report: &mut TurnReport) {
        let title = match self.titles.title(seed).await {
            Ok(title) => title,
            Err(err) => {
                warn!(thread_id = %chat.thread_id, error = %err, "title generation failed");
                report.warnings.push(TITLE_WARNING.to_string());
                return;
            }
        };

        match self.db.rename_chat(&chat.thread_id, &title) {
            Ok(()) => {
                info!(thread_id = %chat.thread_id, title, "chat retitled");
                report.title = Some(title);
            }
            Err(err) => {
                warn!(thread_id = %chat.thread_id, error = %err, "could not store title");
                report.warnings.push(TITLE_WARNING.to_string());
            }
        }
    }

    /// Drive one file through the pipeline and report where it stopped.
    fn ingest_file(&mut self, user_id: i32, chat: &Chat, source: &Path) -> FileOutcome {
        let mut outcome = FileOutcome {
            name: file_name(source),
            state: FileState::Received,
            warning: None,
            attachment_id: None,
        };

        match self.run_file_steps(user_id, chat, source, &mut outcome) {
            Ok(()) => {
                outcome.state = FileState::Complete;
                debug!(file = %outcome.name, thread_id = %chat.thread_id, "file complete");
            }
            Err(StepError::Validation(reason)) => {
                info!(file = %outcome.name, reason, "file rejected");
                outcome.state = FileState::Rejected;
                outcome.warning = Some(reason);
            }
            Err(StepError::Infrastructure(cause)) => {
                warn!(file = %outcome.name, after = ?outcome.state, cause, "file failed");
                outcome.state = FileState::Failed;
                outcome.warning = Some(format!("Error processing {}", outcome.name));
            }
        }
        outcome
    }

    fn run_file_steps(
        &mut self,
        user_id: i32,
        chat: &Chat,
        source: &Path,
        outcome: &mut FileOutcome,
    ) -> Result<(), StepError> {
        let size = self.settings.upload_policy.validate(source)?;
        outcome.state = FileState::Validated;

        let stored = self.store_locally(user_id, &chat.thread_id, source, &outcome.name)?;
        self.db
            .append_message(chat, &ChatMessage::user_file(stored.clone()))
            .map_err(StepError::infra)?;
        outcome.state = FileState::StoredLocally;

        let meta = json!({ "source": source.to_string_lossy(), "size": size });
        outcome.attachment_id = self
            .db
            .register_attachment(user_id, chat.id, &outcome.name, &stored, &meta)
            .map_err(StepError::infra)?;
        if outcome.attachment_id.is_none() {
            debug!(file = %outcome.name, "content already registered for this chat");
        }
        outcome.state = FileState::Registered;

        let pages = self.extractor.extract(&stored).map_err(StepError::infra)?;
        outcome.state = FileState::Extracted;

        let document = Document {
            text: pages.join("\n"),
            metadata: DocumentMetadata {
                source: outcome.name.clone(),
                user_id,
                thread_id: chat.thread_id.clone(),
            },
        };
        self.index
            .add_documents(vec![document])
            .map_err(StepError::infra)?;
        outcome.state = FileState::Indexed;

        Ok(())
    }

    /// Copy `source` into `<upload_root>/<user_id>/thread_<thread_id>/`, under
    /// `name` unless that already holds different bytes.
    fn store_locally(
        &self,
        user_id: i32,
        thread_id: &str,
        source: &Path,
        name: &str,
    ) -> Result<PathBuf, StepError> {
        let dir = self
            .settings
            .upload_root
            .join(user_id.to_string())
            .join(format!("thread_{thread_id}"));
        std::fs::create_dir_all(&dir).map_err(StepError::infra)?;

        let (dest, copy) = upload_slot(&dir, source, name).map_err(StepError::infra)?;
        if copy {
            std::fs::copy(source, &dest).map_err(StepError::infra)?;
        }
        Ok(dest)
    }
}

/// Pick where `source` lands in `dir`: the first of `name`, `stem-1.ext`,
/// `stem-2.ext`, ... that is free or already holds the same bytes. The flag
/// says whether a copy is still needed.
fn upload_slot(dir: &Path, source: &Path, name: &str) -> std::io::Result<(PathBuf, bool)> {
    let original = Path::new(name);
    let stem = original
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string());
    let extension = original.extension().map(|e| e.to_string_lossy().into_owned());
    let source_real = source.canonicalize()?;
    let mut source_hash: Option<String> = None;

    for n in 0u32..=u32::MAX {
        let candidate = match (n, &extension) {
            (0, _) => dir.join(name),
            (_, Some(ext)) => dir.join(format!("{stem}-{n}.{ext}")),
            (_, None) => dir.join(format!("{stem}-{n}")),
        };
        if !candidate.exists() {
            return Ok((candidate, true));
        }
        if candidate.canonicalize()? == source_real {
            return Ok((candidate, false));
        }
        if source_hash.is_none() {
            source_hash = Some(hash_file(source)?);
        }
        if source_hash.as_deref() == Some(hash_file(&candidate)?.as_str()) {
            debug!(path = %candidate.display(), "same bytes already stored");
            return Ok((candidate, false));
        }
    }
    Err(std::io::Error::other(format!("no free name for {name}")))
}
