//! repolens-text
//!
//! Keyword relevance over per-document token bags. `TantivyLexicalIndex` is
//! the persisted engine; `MemoryLexicalIndex` is the plain BM25 fallback.

use std::path::Path;

use tracing::warn;

use repolens_core::config::LexicalConfig;
use repolens_core::error::Result;
use repolens_core::traits::LexicalIndex;
use repolens_core::types::LexicalEngineKind;

pub mod analyzer;
pub mod bm25;
pub mod tantivy_index;

pub use bm25::MemoryLexicalIndex;
pub use tantivy_index::TantivyLexicalIndex;

/// Create an empty index in `dir` with the configured engine. When tantivy
/// cannot be set up the in-memory engine is used instead; the returned kind
/// is the engine actually in use.
pub fn create_lexical(
    dir: &Path,
    config: &LexicalConfig,
) -> Result<(Box<dyn LexicalIndex>, LexicalEngineKind)> {
    if config.engine == LexicalEngineKind::Tantivy {
        match TantivyLexicalIndex::create(dir, config.summary_chars) {
            Ok(index) => return Ok((Box::new(index), LexicalEngineKind::Tantivy)),
            Err(err) => {
                warn!(
                    dir = %dir.display(),
                    error = %err,
                    "tantivy unavailable, using in-memory BM25"
                );
            }
        }
    }
    if dir.exists() {
        std::fs::remove_dir_all(dir)?;
    }
    std::fs::create_dir_all(dir)?;
    let index =
        MemoryLexicalIndex::new(Some(dir), config.bm25_k1, config.bm25_b, config.summary_chars);
    Ok((Box::new(index), LexicalEngineKind::Memory))
}

/// Open a persisted index written by `kind`.
pub fn open_lexical(
    dir: &Path,
    kind: LexicalEngineKind,
    config: &LexicalConfig,
) -> Result<Box<dyn LexicalIndex>> {
    Ok(match kind {
        LexicalEngineKind::Tantivy => {
            Box::new(TantivyLexicalIndex::open(dir, config.summary_chars)?)
        }
        LexicalEngineKind::Memory => Box::new(MemoryLexicalIndex::open(dir, config.summary_chars)?),
    })
}
