//! # Embeddings
//!
//! Sentence embedding backends used by the retrieval index.
//!
//! - [`BertEmbedder`]: `all-MiniLM-L6-v2` run with Candle (pure Rust), fetched
//!   from the Hugging Face Hub on first use and cached by `hf-hub`.
//! - [`HashedEmbedder`]: an offline bag-of-words embedding. Each lowercased
//!   token is hashed with BLAKE3 into one of `dimension` buckets with a signed
//!   weight. Cheap and deterministic, good enough for lexical overlap.
//!
//! Both return L2-normalised vectors so Euclidean distance ranks like cosine.

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::bert::{BertModel, Config, DTYPE};
use hf_hub::{Repo, RepoType, api::sync::Api};
use tokenizers::Tokenizer;
use tracing::info;

use crate::retrieval::IndexError;

/// Model used by [`BertEmbedder`].
pub const BERT_MODEL_ID: &str = "sentence-transformers/all-MiniLM-L6-v2";
/// Output size of [`BERT_MODEL_ID`].
pub const BERT_DIMENSION: usize = 384;

/// Maps text to a fixed-size vector.
pub trait Embedder: Send + Sync {
    fn dimension(&self) -> usize;
    fn embed(&self, text: &str) -> Result<Vec<f32>, IndexError>;
}

/// Candle BERT sentence encoder.
pub struct BertEmbedder {
    model: BertModel,
    tokenizer: Tokenizer,
    device: Device,
}

impl BertEmbedder {
    /// Download (or reuse the cached) model files and load the weights.
    pub fn load() -> Result<Self, IndexError> {
        let device = Device::Cpu;
        let repo = Repo::with_revision(BERT_MODEL_ID.to_string(), RepoType::Model, "main".to_string());
        let api = Api::new().map_err(IndexError::embedding)?;
        let api_repo = api.repo(repo);

        let config_filename = api_repo.get("config.json").map_err(IndexError::embedding)?;
        let tokenizer_filename = api_repo.get("tokenizer.json").map_err(IndexError::embedding)?;
        let weights_filename = api_repo.get("model.safetensors").map_err(IndexError::embedding)?;

        let config = std::fs::read_to_string(config_filename)?;
        let config: Config = serde_json::from_str(&config).map_err(IndexError::embedding)?;
        let tokenizer = Tokenizer::from_file(tokenizer_filename).map_err(IndexError::embedding)?;

        // SAFETY: the safetensors file is owned by the hf-hub cache and not
        // modified while mapped.
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights_filename], DTYPE, &device)? };
        let model = BertModel::load(vb, &config)?;

        info!(model = BERT_MODEL_ID, "embedding model loaded");
        Ok(Self {
            model,
            tokenizer,
            device,
        })
    }

    fn encode(&self, text: &str) -> Result<Vec<f32>, IndexError> {
        let tokens = self
            .tokenizer
            .encode(text, true)
            .map_err(IndexError::embedding)?;

        let token_ids = Tensor::new(tokens.get_ids(), &self.device)?.unsqueeze(0)?;
        let token_type_ids = Tensor::new(tokens.get_type_ids(), &self.device)?.unsqueeze(0)?;
        let output = self.model.forward(&token_ids, &token_type_ids, None)?;

        // Mean pool over non-padding tokens: [1, seq, hidden] -> [hidden].
        let mask = Tensor::new(tokens.get_attention_mask(), &self.device)?
            .to_dtype(DType::F32)?
            .unsqueeze(0)?
            .unsqueeze(2)?;
        let sum = output.broadcast_mul(&mask)?.sum(1)?;
        let count = mask.sum(1)?.clamp(1f32, f32::INFINITY)?;
        let mean = sum.broadcast_div(&count)?.squeeze(0)?;

        let norm = mean.sqr()?.sum_all()?.sqrt()?;
        Ok(mean.broadcast_div(&norm)?.to_vec1::<f32>()?)
    }
}

impl Embedder for BertEmbedder {
    fn dimension(&self) -> usize {
        BERT_DIMENSION
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, IndexError> {
        self.encode(text)
    }
}

/// Offline token-bucket embedding.
#[derive(Debug, Clone)]
pub struct HashedEmbedder {
    dimension: usize,
}

impl HashedEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }
}

impl Default for HashedEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

impl Embedder for HashedEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, IndexError> {
        let mut vector = vec![0f32; self.dimension];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let digest = blake3::hash(token.to_lowercase().as_bytes());
            let bytes = digest.as_bytes();
            let bucket = u64::from_le_bytes([
                bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
            ]) as usize
                % self.dimension;
            let sign = if bytes[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|v| *v /= norm);
        }
        Ok(vector)
    }
}
