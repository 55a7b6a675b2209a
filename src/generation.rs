//! # Generation
//!
//! Reply and title generation against an OpenAI-compatible chat completions
//! endpoint, using `async-openai`.
//!
//! ## Reply prompt layout
//! 1. the configured system prompt,
//! 2. a second system message with the retrieved passages, when there are any,
//! 3. the persisted transcript of the chat, oldest first (file entries appear
//!    as `[uploaded file: <name>]`),
//! 4. the new user text.
//!
//! The transcript is trimmed from the oldest entry while the `cl100k` token
//! count of the whole prompt exceeds
//! `context_max_tokens - assistant_minimum_context_tokens`.

use async_openai::{
    Client,
    config::OpenAIConfig,
    error::OpenAIError,
    types::{
        ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequest, CreateChatCompletionRequestArgs,
    },
};
use async_trait::async_trait;
use thiserror::Error;
use tiktoken_rs::{CoreBPE, cl100k_base};
use tracing::debug;

use crate::config::GemisConfig;
use crate::models::{ChatMessage, Role};
use crate::retrieval::Passage;

/// Longest title kept, in characters.
pub const MAX_TITLE_CHARS: usize = 60;

const TITLE_INSTRUCTION: &str = "Write a short title (at most six words) for a conversation that starts \
     with the following message. Reply with the title only.";

#[derive(Error, Debug)]
pub enum GenerationError {
    #[error("OpenAI error: {0}")]
    OpenAi(#[from] OpenAIError),

    #[error("The model returned an empty reply")]
    EmptyReply,

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("No model endpoint is configured")]
    Unavailable,
}

/// Everything needed to answer one user turn.
#[derive(Debug, Clone)]
pub struct ReplyRequest {
    pub user_id: i32,
    pub thread_id: String,
    /// Persisted transcript before this turn.
    pub history: Vec<ChatMessage>,
    pub passages: Vec<Passage>,
    pub text: String,
}

#[async_trait]
pub trait ReplyGenerator: Send + Sync {
    async fn reply(&self, request: &ReplyRequest) -> Result<String, GenerationError>;
}

#[async_trait]
pub trait TitleGenerator: Send + Sync {
    /// A short title for a chat seeded by `seed` (user text or uploaded file names).
    async fn title(&self, seed: &str) -> Result<String, GenerationError>;
}

/// Both generators backed by one OpenAI-compatible client.
pub struct OpenAiGenerator {
    client: Client<OpenAIConfig>,
    model: String,
    title_model: String,
    system_prompt: String,
    stop_words: Vec<String>,
    prompt_budget: usize,
    reply_max_tokens: u32,
    bpe: CoreBPE,
}

impl OpenAiGenerator {
    pub fn from_config(config: &GemisConfig) -> Result<Self, GenerationError> {
        let openai_config = OpenAIConfig::new()
            .with_api_key(config.api_key.clone())
            .with_api_base(config.api_base.clone());
        let bpe = cl100k_base().map_err(|e| GenerationError::Tokenizer(e.to_string()))?;

        Ok(Self {
            client: Client::with_config(openai_config),
            model: config.model.clone(),
            title_model: config.title_model().to_string(),
            system_prompt: config.system_prompt.clone(),
            stop_words: config.stop_words.clone(),
            prompt_budget: config.prompt_budget(),
            reply_max_tokens: config.assistant_minimum_context_tokens,
            bpe,
        })
    }

    fn count_tokens(&self, text: &str) -> usize {
        self.bpe.encode_with_special_tokens(text).len()
    }

    /// The chat messages sent for `request`, after trimming to the token budget.
    pub fn build_messages(
        &self,
        request: &ReplyRequest,
    ) -> Result<Vec<ChatCompletionRequestMessage>, GenerationError> {
        let mut preamble = vec![self.system_prompt.clone()];
        if !request.passages.is_empty() {
            preamble.push(render_passages(&request.passages));
        }

        let transcript: Vec<(Role, String)> = request
            .history
            .iter()
            .map(|message| (message.role(), render_history_entry(message)))
            .collect();

        let fixed = preamble.iter().map(|p| self.count_tokens(p)).sum::<usize>()
            + self.count_tokens(&request.text);
        let mut history_tokens: Vec<usize> =
            transcript.iter().map(|(_, t)| self.count_tokens(t)).collect();
        let mut skip = 0;
        while skip < transcript.len()
            && fixed + history_tokens.iter().sum::<usize>() > self.prompt_budget
        {
            history_tokens[skip] = 0;
            skip += 1;
        }
        if skip > 0 {
            debug!(thread_id = %request.thread_id, dropped = skip, "trimmed transcript to token budget");
        }

        let mut messages: Vec<ChatCompletionRequestMessage> =
            Vec::with_capacity(preamble.len() + transcript.len() + 1);
        for content in preamble {
            messages.push(
                ChatCompletionRequestSystemMessageArgs::default()
                    .content(content)
                    .build()?
                    .into(),
            );
        }
        for (role, content) in transcript.into_iter().skip(skip) {
            messages.push(match role {
                Role::User => ChatCompletionRequestUserMessageArgs::default()
                    .content(content)
                    .build()?
                    .into(),
                Role::Assistant => ChatCompletionRequestAssistantMessageArgs::default()
                    .content(content)
                    .build()?
                    .into(),
            });
        }
        messages.push(
            ChatCompletionRequestUserMessageArgs::default()
                .content(request.text.clone())
                .build()?
                .into(),
        );
        Ok(messages)
    }

    #[allow(deprecated)]
    fn completion_request(
        &self,
        model: &str,
        messages: Vec<ChatCompletionRequestMessage>,
        max_tokens: u32,
    ) -> Result<CreateChatCompletionRequest, GenerationError> {
        let mut args = CreateChatCompletionRequestArgs::default();
        args.model(model).messages(messages).max_tokens(max_tokens);
        if !self.stop_words.is_empty() {
            args.stop(self.stop_words.clone());
        }
        Ok(args.build()?)
    }

    async fn complete(&self, request: CreateChatCompletionRequest) -> Result<String, GenerationError> {
        let response = self.client.chat().create(request).await?;
        let text: String = response
            .choices
            .into_iter()
            .filter_map(|choice| choice.message.content)
            .collect();
        Ok(text)
    }
}

#[async_trait]
impl ReplyGenerator for OpenAiGenerator {
    async fn reply(&self, request: &ReplyRequest) -> Result<String, GenerationError> {
        let messages = self.build_messages(request)?;
        let completion = self.completion_request(&self.model, messages, self.reply_max_tokens)?;
        debug!(thread_id = %request.thread_id, user_id = request.user_id, "requesting reply");

        let reply = self.complete(completion).await?;
        if reply.trim().is_empty() {
            return Err(GenerationError::EmptyReply);
        }
        Ok(reply.trim().to_string())
    }
}

#[async_trait]
impl TitleGenerator for OpenAiGenerator {
    async fn title(&self, seed: &str) -> Result<String, GenerationError> {
        let messages: Vec<ChatCompletionRequestMessage> = vec![
            ChatCompletionRequestSystemMessageArgs::default()
                .content(TITLE_INSTRUCTION)
                .build()?
                .into(),
            ChatCompletionRequestUserMessageArgs::default()
                .content(seed.to_string())
                .build()?
                .into(),
        ];
        let completion = self.completion_request(&self.title_model, messages, 24)?;
        let raw = self.complete(completion).await?;
        Ok(clean_title(&raw, seed))
    }
}

fn render_passages(passages: &[Passage]) -> String {
    let mut out = String::from("Relevant excerpts from the uploaded documents:\n");
    for passage in passages {
        out.push_str(&format!("\n[{}]\n{}\n", passage.source, passage.text.trim()));
    }
    out
}

fn render_history_entry(message: &ChatMessage) -> String {
    match message {
        ChatMessage::Text { text, .. } => text.clone(),
        ChatMessage::File { path, .. } => {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.to_string_lossy().into_owned());
            format!("[uploaded file: {name}]")
        }
    }
}

/// Normalise a model-produced title.
///
/// Keeps the first non-empty line, drops a leading `Title:` and surrounding
/// quotes, and caps the length. Falls back to `seed` when nothing is left.
pub fn clean_title(raw: &str, seed: &str) -> String {
    let line = raw.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or("");
    let line = line
        .strip_prefix("Title:")
        .or_else(|| line.strip_prefix("title:"))
        .unwrap_or(line)
        .trim();
    let quotes: &[char] = &['"', '\'', '“', '”', '‘', '’', '`', '*'];
    let line = line.trim_matches(quotes).trim();

    let chosen = if line.is_empty() { seed.trim() } else { line };
    truncate_chars(chosen, MAX_TITLE_CHARS)
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].trim_end().to_string(),
        None => text.to_string(),
    }
}
