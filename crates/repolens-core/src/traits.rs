use std::path::PathBuf;

use crate::error::Result;
use crate::types::{Document, Embeddings, SearchHit};

/// Produces vectors for text through whatever backend is currently usable.
pub trait Embedder: Send + Sync {
    /// Embed a batch. Never fails as a whole: texts no backend can handle
    /// come back as zero vectors of the reported dimension.
    fn embed_batch(&self, texts: &[String]) -> Embeddings;

    fn embed(&self, text: &str) -> Vec<f32> {
        self.embed_batch(&[text.to_string()]).vectors.pop().unwrap_or_default()
    }

    /// Probe the chain if needed and return the backend that would serve
    /// the next batch.
    fn active_backend(&self) -> String;

    /// The cached selection, without probing. `None` before first use.
    fn selected_backend(&self) -> Option<String>;

    /// Dimension of the given backend, if it is part of the chain.
    fn dimension_of(&self, backend: &str) -> Option<usize>;
}

/// BM25-style keyword index keyed by document path.
pub trait LexicalIndex: Send + Sync {
    /// Insert or replace the document at `path`.
    fn upsert(&mut self, path: &str, text: &str) -> Result<()>;
    fn remove(&mut self, path: &str) -> Result<()>;
    /// Make pending writes visible to `search` and durable on disk.
    fn commit(&mut self) -> Result<()>;
    /// Top `k` hits, best first. Empty or stopword-only queries yield nothing.
    fn search(&self, query: &str, k: usize) -> Result<Vec<SearchHit>>;
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Supplies the current documents of a project.
pub trait DocumentSource: Send + Sync {
    fn documents(&self) -> Result<Vec<Document>>;
}

/// Maps project ids to source roots on disk.
pub trait ProjectRegistry: Send + Sync {
    fn root_of(&self, project_id: &str) -> Result<PathBuf>;
    fn projects(&self) -> Vec<String>;
}
