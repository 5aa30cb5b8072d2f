//! Filesystem document source: walks a project root and loads source files.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

use crate::config::CorpusConfig;
use crate::error::Result;
use crate::traits::DocumentSource;
use crate::types::Document;

pub struct FsDocumentSource {
    root: PathBuf,
    config: CorpusConfig,
}

impl FsDocumentSource {
    pub fn new(root: impl Into<PathBuf>, config: CorpusConfig) -> Self {
        Self { root: root.into(), config }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn is_skipped_dir(&self, entry: &DirEntry) -> bool {
        if entry.depth() == 0 || !entry.file_type().is_dir() {
            return false;
        }
        let name = entry.file_name().to_string_lossy();
        name.starts_with('.') || self.config.skip_dirs.iter().any(|d| d == name.as_ref())
    }

    fn wants(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|s| s.to_str())
            .is_some_and(|ext| self.config.extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)))
    }

    fn list_files(&self) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = WalkDir::new(&self.root)
            .into_iter()
            .filter_entry(|e| !self.is_skipped_dir(e))
            .filter_map(std::result::Result::ok)
            .filter(|e| e.file_type().is_file())
            .map(DirEntry::into_path)
            .filter(|p| self.wants(p))
            .collect();
        files.sort();
        files
    }

    /// Relative paths `documents` would load, without reading contents.
    pub fn candidate_paths(&self) -> Vec<String> {
        self.list_files()
            .into_iter()
            .filter(|p| fs::metadata(p).is_ok_and(|m| m.len() <= self.config.max_file_bytes))
            .map(|p| relative_path(&self.root, &p))
            .collect()
    }

    fn load(&self, file_path: &Path) -> Result<Option<Document>> {
        let meta = fs::metadata(file_path)?;
        if meta.len() > self.config.max_file_bytes {
            debug!(path = %file_path.display(), bytes = meta.len(), "skipping oversized file");
            return Ok(None);
        }
        let text = match fs::read_to_string(file_path) {
            Ok(content) => content,
            Err(_) => String::from_utf8_lossy(&fs::read(file_path)?).to_string(),
        };
        let modified_ms = meta
            .modified()
            .map(|t| DateTime::<Utc>::from(t).timestamp_millis())
            .unwrap_or(0);
        Ok(Some(Document::new(relative_path(&self.root, file_path), text, modified_ms)))
    }
}

impl DocumentSource for FsDocumentSource {
    fn documents(&self) -> Result<Vec<Document>> {
        let files = self.list_files();
        let mut docs = Vec::with_capacity(files.len());
        for path in files {
            match self.load(&path) {
                Ok(Some(doc)) => docs.push(doc),
                Ok(None) => {}
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "failed to read file, skipping");
                }
            }
        }
        debug!(root = %self.root.display(), count = docs.len(), "loaded documents");
        Ok(docs)
    }
}

/// `/`-separated path of `file` relative to `root`.
pub fn relative_path(root: &Path, file: &Path) -> String {
    let rel = file.strip_prefix(root).unwrap_or(file);
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
