//! A single link of the embedding chain.
//!
//! Backends must return L2-normalised vectors of one fixed dimension for a
//! given `id`; `ProviderHandle` decides which link serves a batch.

use anyhow::Result;

pub trait EmbeddingBackend: Send + Sync {
    /// Stable identifier for the backend and model (e.g. `hashed:d384`).
    fn id(&self) -> &str;
    /// Embedding dimensionality, or 0 while still unknown.
    fn dim(&self) -> usize;
    /// Cheap reachability check. May load lazily held resources.
    fn probe(&self) -> bool;
    /// One vector per input text, in order.
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

pub fn l2_normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 1e-12 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}
