//! Domain types shared by the lexical, vector and hybrid engines.

use serde::{Deserialize, Serialize};

/// Project-relative path, the identity of a document.
pub type DocPath = String;

/// A source file handed to the engine by the indexing pipeline.
///
/// - `path`: project-relative path, `/`-separated
/// - `text`: full text payload
/// - `hash`: blake3 hex digest of `text`; a changed hash replaces the document
/// - `modified_ms`: last-modified time in unix milliseconds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Document {
    pub path: DocPath,
    pub text: String,
    pub hash: String,
    pub modified_ms: i64,
}

impl Document {
    pub fn new(path: impl Into<String>, text: impl Into<String>, modified_ms: i64) -> Self {
        let text = text.into();
        let hash = content_hash(&text);
        Self { path: path.into(), text, hash, modified_ms }
    }
}

pub fn content_hash(text: &str) -> String {
    blake3::hash(text.as_bytes()).to_hex().to_string()
}

/// Order-independent digest over `(path, hash)` pairs of a document set.
pub fn corpus_fingerprint(docs: &[Document]) -> String {
    let mut pairs: Vec<(&str, &str)> =
        docs.iter().map(|d| (d.path.as_str(), d.hash.as_str())).collect();
    pairs.sort_unstable();
    let mut hasher = blake3::Hasher::new();
    for (path, hash) in pairs {
        hasher.update(path.as_bytes());
        hasher.update(&[0]);
        hasher.update(hash.as_bytes());
        hasher.update(&[0]);
    }
    hasher.finalize().to_hex().to_string()
}

/// Indicates which engine produced a result.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SourceKind {
    Vector,
    Text,
}

/// The minimal surface returned by both engines.
///
/// `score` is engine-specific (BM25 or cosine similarity) but higher is
/// always better. Lists of hits are ordered best first.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchHit {
    pub path: DocPath,
    pub score: f32,
    pub source: SourceKind,
}

/// One row of a fused result list. Ranks are 1-based.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RankedResult {
    pub path: DocPath,
    pub score: f64,
    pub lexical_rank: Option<usize>,
    pub semantic_rank: Option<usize>,
}

/// Vectors for a batch of texts together with the backend that produced them.
#[derive(Debug, Clone, PartialEq)]
pub struct Embeddings {
    pub backend: String,
    pub vectors: Vec<Vec<f32>>,
}

impl Embeddings {
    pub fn dimension(&self) -> usize {
        self.vectors.first().map_or(0, Vec::len)
    }
}

/// Which lexical engine backs a snapshot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LexicalEngineKind {
    #[default]
    Tantivy,
    Memory,
}

/// Build facts persisted next to the ANN files of one index generation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexMetadata {
    pub format_version: u32,
    pub generation: u64,
    pub built_at_ms: i64,
    pub dimension: usize,
    pub backend: String,
    pub document_count: usize,
    pub tombstones: usize,
    pub corpus_fingerprint: String,
    pub lexical_engine: LexicalEngineKind,
}

/// Per-document bookkeeping kept in the metadata file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DocRecord {
    pub hash: String,
    pub modified_ms: i64,
}
