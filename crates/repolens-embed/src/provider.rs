//! Ordered embedding chain with a cached backend selection.

use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use repolens_core::config::{expand_path, EmbeddingConfig};
use repolens_core::traits::Embedder;
use repolens_core::types::Embeddings;
use repolens_core::{Error, Result};

use crate::backend::EmbeddingBackend;
use crate::hashed::HashedVectorizer;
use crate::local::LocalModelBackend;
use crate::service::ServiceBackend;

/// Owns the backend chain and remembers which link serves requests.
///
/// The first probe walks the chain in order and caches the first reachable
/// backend. A batch the selected backend fails falls through to the next
/// reachable link for that call only; the selection is kept, so the next
/// batch tries the preferred backend again. Texts the last link cannot
/// handle come back as zero vectors.
pub struct ProviderHandle {
    backends: Vec<Box<dyn EmbeddingBackend>>,
    selected: Mutex<Option<usize>>,
}

impl ProviderHandle {
    pub fn new(backends: Vec<Box<dyn EmbeddingBackend>>) -> Result<Self> {
        if backends.is_empty() {
            return Err(Error::InvalidConfig("embedding backend chain is empty".into()));
        }
        Ok(Self { backends, selected: Mutex::new(None) })
    }

    /// Build the chain named by `embedding.backends`.
    pub fn from_config(config: &EmbeddingConfig) -> Result<Self> {
        let mut backends: Vec<Box<dyn EmbeddingBackend>> = Vec::new();
        for name in &config.backends {
            match name.trim().to_lowercase().as_str() {
                "service" => {
                    let service = ServiceBackend::new(
                        &config.service_url,
                        &config.service_model,
                        Duration::from_millis(config.probe_timeout_ms),
                        Duration::from_millis(config.request_timeout_ms),
                    )
                    .map_err(|e| Error::InvalidConfig(e.to_string()))?;
                    backends.push(Box::new(service));
                }
                "local" => backends.push(Box::new(LocalModelBackend::new(
                    expand_path(&config.model_dir),
                    config.model_max_len,
                ))),
                "hashed" => {
                    backends.push(Box::new(HashedVectorizer::new(config.fallback_dimension)));
                }
                other => {
                    return Err(Error::InvalidConfig(format!("unknown embedding backend: {other}")));
                }
            }
        }
        Self::new(backends)
    }

    /// A chain holding only the deterministic vectorizer.
    pub fn hashed_only(dim: usize) -> Self {
        Self { backends: vec![Box::new(HashedVectorizer::new(dim))], selected: Mutex::new(None) }
    }

    pub fn backend_ids(&self) -> Vec<String> {
        self.backends.iter().map(|b| b.id().to_string()).collect()
    }

    /// Forget the cached selection; the next call probes the chain again.
    pub fn reset(&self) {
        *self.selected.lock() = None;
    }

    fn last(&self) -> usize {
        self.backends.len() - 1
    }

    fn first_reachable(&self, from: usize) -> usize {
        for idx in from..self.last() {
            if self.backends[idx].probe() {
                return idx;
            }
            debug!(backend = self.backends[idx].id(), "probe failed");
        }
        self.last()
    }

    fn ensure_selected(&self) -> usize {
        let mut selected = self.selected.lock();
        if let Some(idx) = *selected {
            return idx;
        }
        let idx = self.first_reachable(0);
        info!(backend = self.backends[idx].id(), "embedding backend selected");
        *selected = Some(idx);
        idx
    }

    /// Last link, one text at a time; failures become zero vectors.
    fn embed_each(&self, texts: &[String]) -> Embeddings {
        let backend = &self.backends[self.last()];
        let vectors: Vec<Vec<f32>> = texts
            .iter()
            .map(|text| match backend.embed_batch(std::slice::from_ref(text)) {
                Ok(mut v) if v.len() == 1 => v.pop().unwrap_or_default(),
                Ok(_) | Err(_) => {
                    warn!(
                        backend = backend.id(),
                        "embedding failed for one text, using zero vector"
                    );
                    Vec::new()
                }
            })
            .collect();
        let dim = vectors.iter().map(Vec::len).max().unwrap_or(0).max(backend.dim());
        let vectors = vectors
            .into_iter()
            .map(|v| if v.is_empty() { vec![0.0; dim] } else { v })
            .collect();
        Embeddings { backend: backend.id().to_string(), vectors }
    }
}

impl Embedder for ProviderHandle {
    fn embed_batch(&self, texts: &[String]) -> Embeddings {
        let start = self.ensure_selected();
        if texts.is_empty() {
            return Embeddings {
                backend: self.backends[start].id().to_string(),
                vectors: Vec::new(),
            };
        }
        let mut idx = start;
        while idx < self.last() {
            let backend = &self.backends[idx];
            match backend.embed_batch(texts) {
                Ok(vectors) if vectors.len() == texts.len() => {
                    if idx != start {
                        warn!(
                            selected = self.backends[start].id(),
                            used = backend.id(),
                            "batch served by fallback backend"
                        );
                    }
                    return Embeddings { backend: backend.id().to_string(), vectors };
                }
                Ok(vectors) => warn!(
                    backend = backend.id(),
                    expected = texts.len(),
                    got = vectors.len(),
                    "backend returned wrong number of vectors"
                ),
                Err(err) => warn!(backend = backend.id(), error = %err, "embedding backend failed"),
            }
            idx = self.first_reachable(idx + 1);
        }
        if idx != start {
            warn!(
                selected = self.backends[start].id(),
                used = self.backends[idx].id(),
                "batch served by last backend in chain"
            );
        }
        let last = &self.backends[idx];
        match last.embed_batch(texts) {
            Ok(vectors) if vectors.len() == texts.len() => {
                Embeddings { backend: last.id().to_string(), vectors }
            }
            _ => self.embed_each(texts),
        }
    }

    fn active_backend(&self) -> String {
        let idx = self.ensure_selected();
        self.backends[idx].id().to_string()
    }

    fn selected_backend(&self) -> Option<String> {
        self.selected.lock().map(|idx| self.backends[idx].id().to_string())
    }

    fn dimension_of(&self, backend: &str) -> Option<usize> {
        self.backends.iter().find(|b| b.id() == backend).map(|b| b.dim())
    }
}
