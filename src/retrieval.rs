//! # Retrieval index
//!
//! Document store consulted when generating replies, scoped per conversation.
//!
//! Callers only see the [`RetrievalIndex`] contract: push documents tagged with
//! `(source, user_id, thread_id)` and query passages for one `(user, thread)`
//! scope. Passages from other users or other threads are never returned.
//!
//! [`VectorIndex`] is the concrete implementation:
//! - each document is split into overlapping character windows,
//! - each window is embedded by an [`Embedder`],
//! - every `(user, thread)` scope owns its own HNSW index (`hora`), rebuilt
//!   whenever that scope receives new entries,
//! - after each successful add the full entry list is written as a `bincode`
//!   snapshot. Indexes are rebuilt from the snapshot on open.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use hora::core::ann_index::ANNIndex;
use hora::core::metrics::Metric;
use hora::index::hnsw_idx::HNSWIndex;
use hora::index::hnsw_params::HNSWParams;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::embeddings::Embedder;

/// Characters per chunk.
pub const CHUNK_SIZE: usize = 800;
/// Characters shared by consecutive chunks.
pub const CHUNK_OVERLAP: usize = 100;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Model error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("ANN index error: {0}")]
    Ann(&'static str),

    #[error("Vector has dimension {got}, index expects {expected}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Snapshot encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("Snapshot decode error: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    #[error("Index lock poisoned")]
    Poisoned,

    #[error("Retrieval index is not loaded")]
    Unavailable,
}

impl IndexError {
    pub fn embedding(err: impl std::fmt::Display) -> Self {
        Self::Embedding(err.to_string())
    }
}

/// Where a document came from and who may retrieve it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub source: String,
    pub user_id: i32,
    pub thread_id: String,
}

/// One logical document pushed into the index.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub text: String,
    pub metadata: DocumentMetadata,
}

/// The conversation a query is restricted to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Scope {
    pub user_id: i32,
    pub thread_id: String,
}

impl Scope {
    pub fn new(user_id: i32, thread_id: impl Into<String>) -> Self {
        Self {
            user_id,
            thread_id: thread_id.into(),
        }
    }
}

/// A retrieved chunk, closest first.
#[derive(Debug, Clone, PartialEq)]
pub struct Passage {
    pub text: String,
    pub source: String,
    pub distance: f32,
}

/// Write-mostly document store with scoped similarity queries.
pub trait RetrievalIndex: Send + Sync {
    /// Index `documents`. Returns the number of chunks added.
    fn add_documents(&self, documents: Vec<Document>) -> Result<usize, IndexError>;

    /// Up to `top_k` passages from `scope` closest to `text`.
    fn query(&self, scope: &Scope, text: &str, top_k: usize) -> Result<Vec<Passage>, IndexError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Entry {
    user_id: i32,
    thread_id: String,
    source: String,
    text: String,
    vector: Vec<f32>,
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    dimension: usize,
    entries: Vec<Entry>,
}

/// All entries of one scope plus the ANN index built over them.
struct Shelf {
    entries: Vec<Entry>,
    index: HNSWIndex<f32, usize>,
}

impl Shelf {
    fn build(dimension: usize, entries: Vec<Entry>) -> Result<Self, IndexError> {
        let mut index = HNSWIndex::<f32, usize>::new(dimension, &HNSWParams::<f32>::default());
        for (id, entry) in entries.iter().enumerate() {
            index.add(&entry.vector, id).map_err(IndexError::Ann)?;
        }
        index.build(Metric::Euclidean).map_err(IndexError::Ann)?;
        Ok(Self { entries, index })
    }
}

/// HNSW-backed [`RetrievalIndex`] with optional on-disk snapshot.
pub struct VectorIndex {
    embedder: Box<dyn Embedder>,
    snapshot_path: Option<PathBuf>,
    shelves: Mutex<HashMap<Scope, Shelf>>,
}

impl VectorIndex {
    /// An empty index that lives only in memory.
    pub fn in_memory(embedder: Box<dyn Embedder>) -> Self {
        Self {
            embedder,
            snapshot_path: None,
            shelves: Mutex::new(HashMap::new()),
        }
    }

    /// Open the index persisted at `path`, or start empty if there is none.
    ///
    /// # Errors
    /// Fails if the snapshot cannot be decoded or was written with an embedder of
    /// a different dimension.
    pub fn open(embedder: Box<dyn Embedder>, path: impl Into<PathBuf>) -> Result<Self, IndexError> {
        let path = path.into();
        let dimension = embedder.dimension();
        let mut shelves = HashMap::new();

        if path.exists() {
            let bytes = std::fs::read(&path)?;
            let (snapshot, _): (Snapshot, usize) =
                bincode::serde::decode_from_slice(&bytes, bincode::config::standard())?;
            if snapshot.dimension != dimension {
                return Err(IndexError::DimensionMismatch {
                    expected: dimension,
                    got: snapshot.dimension,
                });
            }

            let mut grouped: HashMap<Scope, Vec<Entry>> = HashMap::new();
            for entry in snapshot.entries {
                grouped
                    .entry(Scope::new(entry.user_id, entry.thread_id.clone()))
                    .or_default()
                    .push(entry);
            }
            for (scope, entries) in grouped {
                shelves.insert(scope, Shelf::build(dimension, entries)?);
            }
            info!(path = %path.display(), scopes = shelves.len(), "retrieval index loaded");
        }

        Ok(Self {
            embedder,
            snapshot_path: Some(path),
            shelves: Mutex::new(shelves),
        })
    }

    /// Write a snapshot of `entries`. A no-op for in-memory indexes.
    fn persist<'a>(&self, entries: impl Iterator<Item = &'a Entry>) -> Result<(), IndexError> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };

        let snapshot = Snapshot {
            dimension: self.embedder.dimension(),
            entries: entries.cloned().collect(),
        };
        let bytes = bincode::serde::encode_to_vec(&snapshot, bincode::config::standard())?;
        write_atomically(path, &bytes)?;
        debug!(path = %path.display(), entries = snapshot.entries.len(), "retrieval snapshot written");
        Ok(())
    }
}

fn write_atomically(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)
}

/// Split `text` into windows of `size` characters overlapping by `overlap`.
pub fn chunk_text(text: &str, size: usize, overlap: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    if chars.is_empty() || size == 0 {
        return Vec::new();
    }

    let step = size.saturating_sub(overlap).max(1);
    let mut chunks = Vec::new();
    let mut start = 0;
    loop {
        let end = (start + size).min(chars.len());
        let chunk: String = chars[start..end].iter().collect();
        if !chunk.trim().is_empty() {
            chunks.push(chunk);
        }
        if end == chars.len() {
            break;
        }
        start += step;
    }
    chunks
}

impl RetrievalIndex for VectorIndex {
    fn add_documents(&self, documents: Vec<Document>) -> Result<usize, IndexError> {
        let dimension = self.embedder.dimension();

        // Embed before taking the lock so a failing document leaves the index untouched.
        let mut incoming: HashMap<Scope, Vec<Entry>> = HashMap::new();
        for document in documents {
            let meta = document.metadata;
            for chunk in chunk_text(&document.text, CHUNK_SIZE, CHUNK_OVERLAP) {
                let vector = self.embedder.embed(&chunk)?;
                if vector.len() != dimension {
                    return Err(IndexError::DimensionMismatch {
                        expected: dimension,
                        got: vector.len(),
                    });
                }
                incoming
                    .entry(Scope::new(meta.user_id, meta.thread_id.clone()))
                    .or_default()
                    .push(Entry {
                        user_id: meta.user_id,
                        thread_id: meta.thread_id.clone(),
                        source: meta.source.clone(),
                        text: chunk,
                        vector,
                    });
            }
        }

        let added: usize = incoming.values().map(Vec::len).sum();
        if added == 0 {
            return Ok(0);
        }

        let mut shelves = self.shelves.lock().map_err(|_| IndexError::Poisoned)?;

        // Build the replacements aside; the live shelves change only once the
        // snapshot of the new state is on disk.
        let mut rebuilt: HashMap<Scope, Shelf> = HashMap::new();
        for (scope, new_entries) in incoming {
            let mut entries = shelves
                .get(&scope)
                .map(|shelf| shelf.entries.clone())
                .unwrap_or_default();
            entries.extend(new_entries);
            debug!(user_id = scope.user_id, thread_id = %scope.thread_id, entries = entries.len(), "rebuilding scope index");
            let shelf = Shelf::build(dimension, entries)?;
            rebuilt.insert(scope, shelf);
        }

        let untouched = shelves
            .iter()
            .filter(|(scope, _)| !rebuilt.contains_key(*scope))
            .flat_map(|(_, shelf)| shelf.entries.iter());
        let replaced = rebuilt.values().flat_map(|shelf| shelf.entries.iter());
        self.persist(untouched.chain(replaced))?;

        shelves.extend(rebuilt);
        Ok(added)
    }

    fn query(&self, scope: &Scope, text: &str, top_k: usize) -> Result<Vec<Passage>, IndexError> {
        if top_k == 0 {
            return Ok(Vec::new());
        }
        let query = self.embedder.embed(text)?;

        let shelves = self.shelves.lock().map_err(|_| IndexError::Poisoned)?;
        let Some(shelf) = shelves.get(scope) else {
            return Ok(Vec::new());
        };

        let k = top_k.min(shelf.entries.len());
        let mut passages: Vec<Passage> = shelf
            .index
            .search(&query, k)
            .into_iter()
            .filter_map(|id| shelf.entries.get(id))
            .map(|entry| Passage {
                text: entry.text.clone(),
                source: entry.source.clone(),
                distance: euclidean(&query, &entry.vector),
            })
            .collect();
        passages.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        Ok(passages)
    }
}

fn euclidean(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y).powi(2))
        .sum::<f32>()
        .sqrt()
}

#[cfg(test)]
mod tests {
    use crate::embeddings::HashedEmbedder;

    use super::*;

    fn doc(text: &str, source: &str, user_id: i32, thread_id: &str) -> Document {
        Document {
            text: text.to_string(),
            metadata: DocumentMetadata {
                source: source.to_string(),
                user_id,
                thread_id: thread_id.to_string(),
            },
        }
    }

    #[test]
    fn chunks_overlap_and_cover_the_text() {
        let text: String = ('a'..='z').cycle().take(25).collect();
        let chunks = chunk_text(&text, 10, 3);

        assert_eq!(chunks[0].chars().count(), 10);
        assert_eq!(&chunks[0][7..], &chunks[1][..3]);
        assert!(text.ends_with(chunks.last().unwrap().as_str()));
        assert!(chunk_text("   ", 10, 3).is_empty());
        assert_eq!(chunk_text("short", 10, 3), vec!["short".to_string()]);
    }

    #[test]
    fn chunking_respects_multibyte_characters() {
        let chunks = chunk_text("ééééé", 2, 0);
        assert_eq!(chunks, vec!["éé", "éé", "é"]);
    }

    #[test]
    fn queries_are_scoped_to_user_and_thread() {
        let index = VectorIndex::in_memory(Box::new(HashedEmbedder::default()));
        index
            .add_documents(vec![
                doc("revenue grew in the third quarter", "report.pdf", 1, "t1"),
                doc("revenue secrets of another thread", "other.pdf", 1, "t2"),
                doc("revenue secrets of another user", "bob.pdf", 2, "t1"),
            ])
            .unwrap();

        let passages = index.query(&Scope::new(1, "t1"), "revenue", 10).unwrap();
        assert_eq!(passages.len(), 1);
        assert_eq!(passages[0].source, "report.pdf");

        assert!(index.query(&Scope::new(3, "t9"), "revenue", 3).unwrap().is_empty());
    }

    #[test]
    fn closest_passage_comes_first() {
        let index = VectorIndex::in_memory(Box::new(HashedEmbedder::default()));
        index
            .add_documents(vec![
                doc("banana bread recipe with walnuts", "recipes.txt", 1, "t"),
                doc("quarterly revenue forecast and margins", "report.pdf", 1, "t"),
            ])
            .unwrap();
        index
            .add_documents(vec![doc("holiday schedule for the office", "hr.md", 1, "t")])
            .unwrap();

        let passages = index.query(&Scope::new(1, "t"), "revenue forecast", 3).unwrap();
        assert_eq!(passages.len(), 3);
        assert_eq!(passages[0].source, "report.pdf");
        assert!(passages.windows(2).all(|w| w[0].distance <= w[1].distance));
    }

    #[test]
    fn snapshot_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index/gemis_index.bin");

        {
            let index = VectorIndex::open(Box::new(HashedEmbedder::new(32)), &path).unwrap();
            let added = index
                .add_documents(vec![doc("persistent memory of the report", "r.pdf", 7, "t")])
                .unwrap();
            assert_eq!(added, 1);
        }

        let reopened = VectorIndex::open(Box::new(HashedEmbedder::new(32)), &path).unwrap();
        let passages = reopened.query(&Scope::new(7, "t"), "report", 1).unwrap();
        assert_eq!(passages[0].text, "persistent memory of the report");

        let mismatched = VectorIndex::open(Box::new(HashedEmbedder::new(16)), &path);
        assert!(matches!(
            mismatched,
            Err(IndexError::DimensionMismatch { expected: 16, got: 32 })
        ));
    }

    #[test]
    fn failed_snapshot_write_leaves_index_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"file").unwrap();

        let index =
            VectorIndex::open(Box::new(HashedEmbedder::new(32)), blocker.join("idx.bin")).unwrap();
        let result = index.add_documents(vec![doc("unsaved quarterly figures", "q.pdf", 1, "t")]);

        assert!(matches!(result, Err(IndexError::Io(_))));
        assert!(index.query(&Scope::new(1, "t"), "quarterly", 5).unwrap().is_empty());
    }

    #[test]
    fn failed_snapshot_write_keeps_earlier_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idx.bin");
        let index = VectorIndex::open(Box::new(HashedEmbedder::new(32)), &path).unwrap();
        index
            .add_documents(vec![doc("first saved report", "a.pdf", 1, "t")])
            .unwrap();

        // A directory where the temporary snapshot goes makes the write fail.
        std::fs::create_dir(path.with_extension("tmp")).unwrap();
        assert!(
            index
                .add_documents(vec![doc("second report never saved", "b.pdf", 1, "t")])
                .is_err()
        );

        let passages = index.query(&Scope::new(1, "t"), "report", 5).unwrap();
        assert_eq!(passages.len(), 1);
        assert_eq!(passages[0].source, "a.pdf");
    }

    #[test]
    fn blank_documents_add_nothing() {
        let index = VectorIndex::in_memory(Box::new(HashedEmbedder::default()));
        assert_eq!(index.add_documents(vec![doc("  \n ", "empty.txt", 1, "t")]).unwrap(), 0);
        assert_eq!(index.add_documents(Vec::new()).unwrap(), 0);
    }
}
