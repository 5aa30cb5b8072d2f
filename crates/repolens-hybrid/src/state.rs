use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::store::Snapshot;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IndexState {
    Missing,
    Building,
    Fresh,
    Stale,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum StaleReason {
    IndexMissing,
    IndexCorrupt,
    DocumentChanged,
    DocumentAdded,
    DocumentRemoved,
    BackendChanged,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexStatus {
    pub project_id: String,
    pub state: IndexState,
    pub document_count: usize,
    pub dimension: usize,
    pub built_at_ms: Option<i64>,
    pub backend: Option<String>,
    pub generation: Option<u64>,
    pub tombstones: usize,
    pub tombstone_ratio: f64,
    pub stale_reasons: Vec<StaleReason>,
}

impl IndexStatus {
    pub(crate) fn missing(project_id: &str, reason: StaleReason, building: bool) -> Self {
        Self {
            project_id: project_id.to_string(),
            state: if building { IndexState::Building } else { IndexState::Missing },
            document_count: 0,
            dimension: 0,
            built_at_ms: None,
            backend: None,
            generation: None,
            tombstones: 0,
            tombstone_ratio: 0.0,
            stale_reasons: vec![reason],
        }
    }

    pub(crate) fn from_snapshot(
        project_id: &str,
        snapshot: &Snapshot,
        reasons: Vec<StaleReason>,
        building: bool,
    ) -> Self {
        let state = if building {
            IndexState::Building
        } else if reasons.is_empty() {
            IndexState::Fresh
        } else {
            IndexState::Stale
        };
        Self {
            project_id: project_id.to_string(),
            state,
            document_count: snapshot.meta.document_count,
            dimension: snapshot.meta.dimension,
            built_at_ms: Some(snapshot.meta.built_at_ms),
            backend: Some(snapshot.meta.backend.clone()),
            generation: Some(snapshot.meta.generation),
            tombstones: snapshot.ann.tombstones(),
            tombstone_ratio: snapshot.ann.tombstone_ratio(),
            stale_reasons: reasons,
        }
    }

    pub fn built_at(&self) -> Option<DateTime<Utc>> {
        self.built_at_ms.and_then(|ms| Utc.timestamp_millis_opt(ms).single())
    }
}

pub(crate) fn mtime_ms(path: &Path) -> Option<i64> {
    let modified = fs::metadata(path).and_then(|m| m.modified()).ok()?;
    Some(DateTime::<Utc>::from(modified).timestamp_millis())
}

/// A file changed if it is newer than the build, or if its mtime differs
/// from the one read with its text (an edit between read and build).
/// A recorded mtime of zero means the caller did not know it.
fn is_changed(mtime: i64, recorded: i64, built_at: i64) -> bool {
    mtime > built_at || (recorded != 0 && mtime != recorded)
}

/// Why `snapshot` no longer reflects the sources under `root`.
///
/// `current_paths` is the set of files a fresh walk would index, when known.
/// `active_backend` is the embedding backend currently selected, when known.
pub(crate) fn stale_reasons(
    snapshot: &Snapshot,
    root: Option<&Path>,
    current_paths: Option<&[String]>,
    active_backend: Option<&str>,
) -> Vec<StaleReason> {
    let mut reasons = BTreeSet::new();
    if let Some(root) = root {
        for (path, record) in &snapshot.documents {
            match mtime_ms(&root.join(path)) {
                None => {
                    reasons.insert(StaleReason::DocumentRemoved);
                }
                Some(mtime) if is_changed(mtime, record.modified_ms, snapshot.meta.built_at_ms) => {
                    reasons.insert(StaleReason::DocumentChanged);
                }
                Some(_) => {}
            }
        }
    }
    if let Some(paths) = current_paths {
        if paths.iter().any(|p| !snapshot.documents.contains_key(p)) {
            reasons.insert(StaleReason::DocumentAdded);
        }
    }
    if active_backend.is_some_and(|b| b != snapshot.meta.backend) {
        reasons.insert(StaleReason::BackendChanged);
    }
    reasons.into_iter().collect()
}
