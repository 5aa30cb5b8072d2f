//! On-disk snapshot generations for one project.
//!
//! ```text
//! <index_root>/<project_id>/
//!     CURRENT          generation number of the live snapshot
//!     build.lock       fs2 advisory lock held while building
//!     gen-<n>/
//!         ann.graph    bincode HNSW graph
//!         ann.map.json path <-> id map
//!         meta.json    IndexMetadata + per-document manifest
//!         lexical/     tantivy directory or BM25 postings
//! ```
//!
//! A generation is written completely before `CURRENT` is renamed over to
//! point at it, so readers only ever see whole snapshots.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use walkdir::WalkDir;

use repolens_core::config::LexicalConfig;
use repolens_core::fsutil::{read_optional, write_atomic};
use repolens_core::traits::LexicalIndex;
use repolens_core::types::{DocRecord, IndexMetadata};
use repolens_core::{Error, Result};
use repolens_text::open_lexical;
use repolens_vector::AnnIndex;

pub const CURRENT_FILE: &str = "CURRENT";
pub const META_FILE: &str = "meta.json";
pub const LEXICAL_DIR: &str = "lexical";
pub const META_FORMAT_VERSION: u32 = 1;

/// Everything needed to answer queries for one project generation.
pub struct Snapshot {
    pub meta: IndexMetadata,
    pub documents: BTreeMap<String, DocRecord>,
    pub ann: AnnIndex,
    pub lexical: Box<dyn LexicalIndex>,
}

#[derive(Serialize, Deserialize)]
struct MetaFile {
    metadata: IndexMetadata,
    documents: BTreeMap<String, DocRecord>,
}

pub enum LoadOutcome {
    Missing,
    Corrupt(Error),
    Loaded(Snapshot),
}

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn project_dir(&self, project_id: &str) -> PathBuf {
        self.root.join(project_id)
    }

    pub fn generation_dir(&self, project_id: &str, generation: u64) -> PathBuf {
        self.project_dir(project_id).join(format!("gen-{generation}"))
    }

    pub fn current_generation(&self, project_id: &str) -> Result<Option<u64>> {
        let Some(raw) = read_optional(&self.project_dir(project_id).join(CURRENT_FILE))? else {
            return Ok(None);
        };
        let text = String::from_utf8_lossy(&raw);
        text.trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|e| Error::corrupt(format!("CURRENT is not a generation number: {e}")))
    }

    /// Generation numbers of every `gen-<n>` directory present, ascending.
    pub fn generations(&self, project_id: &str) -> Vec<u64> {
        let Ok(entries) = fs::read_dir(self.project_dir(project_id)) else {
            return Vec::new();
        };
        let mut gens: Vec<u64> = entries
            .filter_map(std::result::Result::ok)
            .filter(|e| e.path().is_dir())
            .filter_map(|e| {
                let name = e.file_name();
                name.to_str().and_then(|n| n.strip_prefix("gen-")).and_then(|n| n.parse().ok())
            })
            .collect();
        gens.sort_unstable();
        gens
    }

    /// A generation number no directory or pointer has used yet.
    pub fn next_generation(&self, project_id: &str) -> u64 {
        let on_disk = self.generations(project_id).last().copied().unwrap_or(0);
        let current = self.current_generation(project_id).ok().flatten().unwrap_or(0);
        on_disk.max(current) + 1
    }

    pub fn load(&self, project_id: &str, lexical: &LexicalConfig) -> LoadOutcome {
        let generation = match self.current_generation(project_id) {
            Ok(Some(g)) => g,
            Ok(None) => return LoadOutcome::Missing,
            Err(err) => return LoadOutcome::Corrupt(err),
        };
        match self.load_generation(project_id, generation, lexical) {
            Ok(snapshot) => LoadOutcome::Loaded(snapshot),
            Err(err) => LoadOutcome::Corrupt(err),
        }
    }

    fn load_generation(
        &self,
        project_id: &str,
        generation: u64,
        lexical: &LexicalConfig,
    ) -> Result<Snapshot> {
        let dir = self.generation_dir(project_id, generation);
        let raw = read_optional(&dir.join(META_FILE))?
            .ok_or_else(|| Error::corrupt(format!("{} has no {META_FILE}", dir.display())))?;
        let meta_file: MetaFile = serde_json::from_slice(&raw).map_err(Error::corrupt)?;
        let meta = meta_file.metadata;
        if meta.format_version != META_FORMAT_VERSION {
            return Err(Error::corrupt(format!(
                "unsupported metadata version {}",
                meta.format_version
            )));
        }
        if meta.generation != generation {
            return Err(Error::corrupt(format!(
                "metadata generation {} does not match CURRENT {generation}",
                meta.generation
            )));
        }

        let (ann, _) = AnnIndex::load(&dir, Some(generation))?
            .ok_or_else(|| Error::corrupt(format!("{} has no ann files", dir.display())))?;
        if ann.dimension() != meta.dimension || ann.len() != meta.document_count {
            return Err(Error::corrupt("ann index disagrees with metadata"));
        }
        if meta_file.documents.len() != meta.document_count {
            return Err(Error::corrupt("document manifest disagrees with metadata"));
        }

        let lexical = open_lexical(&dir.join(LEXICAL_DIR), meta.lexical_engine, lexical)?;
        if lexical.len() != meta.document_count {
            return Err(Error::corrupt("lexical index disagrees with metadata"));
        }
        debug!(project_id, generation, docs = meta.document_count, "snapshot loaded");
        Ok(Snapshot { meta, documents: meta_file.documents, ann, lexical })
    }

    /// Persist the ANN files and metadata of a snapshot whose lexical index
    /// was already committed into `dir/lexical`.
    pub fn write_generation(&self, dir: &Path, snapshot: &Snapshot) -> Result<()> {
        snapshot.ann.save(dir, snapshot.meta.generation)?;
        let meta_file =
            MetaFile { metadata: snapshot.meta.clone(), documents: snapshot.documents.clone() };
        write_atomic(&dir.join(META_FILE), &serde_json::to_vec_pretty(&meta_file)?)?;
        Ok(())
    }

    /// Point `CURRENT` at `generation`.
    pub fn publish(&self, project_id: &str, generation: u64) -> Result<()> {
        let pointer = self.project_dir(project_id).join(CURRENT_FILE);
        write_atomic(&pointer, generation.to_string().as_bytes())
    }

    /// Remove generation directories older than the newest `keep` ones
    /// before `current`; the current generation is never removed.
    pub fn collect_garbage(&self, project_id: &str, current: u64, keep: usize) {
        let older: Vec<u64> =
            self.generations(project_id).into_iter().filter(|g| *g < current).collect();
        let drop_count = older.len().saturating_sub(keep);
        for generation in older.into_iter().take(drop_count) {
            let dir = self.generation_dir(project_id, generation);
            match fs::remove_dir_all(&dir) {
                Ok(()) => debug!(project_id, generation, "old generation removed"),
                Err(err) => {
                    warn!(dir = %dir.display(), error = %err, "failed to remove old generation");
                }
            }
        }
    }

    /// Best-effort removal of a generation that was never published.
    pub fn discard(&self, dir: &Path) {
        if dir.exists() {
            if let Err(err) = fs::remove_dir_all(dir) {
                warn!(dir = %dir.display(), error = %err, "failed to remove unfinished generation");
            }
        }
    }
}

/// Copy a lexical directory into a new generation, skipping lock files.
pub fn copy_lexical_dir(from: &Path, to: &Path) -> Result<()> {
    if to.exists() {
        fs::remove_dir_all(to)?;
    }
    fs::create_dir_all(to)?;
    for entry in WalkDir::new(from).min_depth(1) {
        let entry = entry.map_err(|e| Error::Operation(e.to_string()))?;
        let rel = entry.path().strip_prefix(from).map_err(|e| Error::Operation(e.to_string()))?;
        let target = to.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else if entry.path().extension().and_then(|e| e.to_str()) != Some("lock") {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
