//! Per-project index lifecycle: loading, freshness, rebuilds and queries.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use repolens_core::config::{expand_path, Settings};
use repolens_core::corpus::FsDocumentSource;
use repolens_core::registry::StaticRegistry;
use repolens_core::traits::{DocumentSource, Embedder, LexicalIndex, ProjectRegistry};
use repolens_core::types::{
    corpus_fingerprint, DocRecord, Document, IndexMetadata, RankedResult, SearchHit,
};
use repolens_core::{Error, Result};
use repolens_embed::ProviderHandle;
use repolens_text::{create_lexical, open_lexical};
use repolens_vector::{AnnIndex, HnswParams};

use crate::cancel::{BuildProgress, RebuildOptions};
use crate::fusion::FusionRanker;
use crate::lock::BuildLock;
use crate::recency::RecencyBoost;
use crate::state::{stale_reasons, IndexStatus, StaleReason};
use crate::store::{
    copy_lexical_dir, LoadOutcome, Snapshot, SnapshotStore, LEXICAL_DIR, META_FORMAT_VERSION,
};

/// Why a query answered the way it did, when that is not obvious.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum QueryReason {
    /// No usable index and build-on-demand is off.
    NotIndexed,
    /// The query could not be embedded with the backend the index was built
    /// with, so only the lexical signal was used.
    LexicalOnly { indexed_backend: String, query_backend: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryOutcome {
    pub results: Vec<RankedResult>,
    pub reason: Option<QueryReason>,
}

impl QueryOutcome {
    fn empty(reason: Option<QueryReason>) -> Self {
        Self { results: Vec::new(), reason }
    }
}

#[derive(Default)]
struct ProjectSlot {
    snapshot: RwLock<Option<Arc<Snapshot>>>,
    build_lock: Mutex<()>,
    building: AtomicBool,
    corrupt: AtomicBool,
}

/// Clears the building flag however the build ends.
struct BuildingGuard<'a>(&'a AtomicBool);

impl<'a> BuildingGuard<'a> {
    fn new(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for BuildingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

enum Attempt {
    Built(Snapshot),
    BackendSwitched { expected: String, got: String },
}

struct Changes<'a> {
    upserts: Vec<&'a Document>,
    removals: Vec<String>,
}

pub struct IndexManager {
    settings: Settings,
    store: SnapshotStore,
    embedder: Arc<dyn Embedder>,
    registry: Arc<dyn ProjectRegistry>,
    fusion: FusionRanker,
    recency: Option<RecencyBoost>,
    slots: RwLock<HashMap<String, Arc<ProjectSlot>>>,
}

impl IndexManager {
    pub fn new(
        settings: Settings,
        embedder: Arc<dyn Embedder>,
        registry: Arc<dyn ProjectRegistry>,
    ) -> Result<Self> {
        settings.validate()?;
        let store = SnapshotStore::new(expand_path(&settings.index.root));
        Ok(Self {
            fusion: FusionRanker::new(settings.fusion.rrf_k),
            recency: RecencyBoost::from_config(&settings.fusion),
            store,
            embedder,
            registry,
            settings,
            slots: RwLock::new(HashMap::new()),
        })
    }

    /// Wire the provider chain and the static registry from `settings`;
    /// relative project roots resolve against `base`.
    pub fn from_settings(settings: Settings, base: &Path) -> Result<Self> {
        let provider = ProviderHandle::from_config(&settings.embedding)?;
        let registry = StaticRegistry::new(settings.project_roots(base));
        Self::new(settings, Arc::new(provider), Arc::new(registry))
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    fn slot(&self, project_id: &str) -> Result<Arc<ProjectSlot>> {
        validate_project_id(project_id)?;
        if let Some(slot) = self.slots.read().get(project_id) {
            return Ok(Arc::clone(slot));
        }
        let mut slots = self.slots.write();
        Ok(Arc::clone(slots.entry(project_id.to_string()).or_default()))
    }

    /// The in-memory snapshot, loading it from disk on first use.
    fn current(&self, slot: &ProjectSlot, project_id: &str) -> Option<Arc<Snapshot>> {
        if let Some(snapshot) = slot.snapshot.read().as_ref() {
            return Some(Arc::clone(snapshot));
        }
        match self.store.load(project_id, &self.settings.lexical) {
            LoadOutcome::Loaded(snapshot) => {
                slot.corrupt.store(false, Ordering::SeqCst);
                let snapshot = Arc::new(snapshot);
                let mut guard = slot.snapshot.write();
                // A build may have published while we were loading.
                Some(Arc::clone(guard.get_or_insert_with(|| snapshot)))
            }
            LoadOutcome::Missing => None,
            LoadOutcome::Corrupt(err) => {
                if !slot.corrupt.swap(true, Ordering::SeqCst) {
                    warn!(
                        project_id,
                        error = %err,
                        "persisted index is unusable, treating as missing"
                    );
                }
                None
            }
        }
    }

    /// Documents of a registered project, read from its source root.
    pub fn project_documents(&self, project_id: &str) -> Result<Vec<Document>> {
        let root = self.registry.root_of(project_id)?;
        FsDocumentSource::new(root, self.settings.corpus.clone()).documents()
    }

    /// Rebuild from the registered source root, incrementally unless `options.full`.
    pub fn refresh(&self, project_id: &str, options: &RebuildOptions) -> Result<IndexMetadata> {
        let documents = self.project_documents(project_id)?;
        self.rebuild_with(project_id, &documents, options)
    }

    pub fn rebuild(
        &self,
        project_id: &str,
        documents: &[Document],
        full: bool,
    ) -> Result<IndexMetadata> {
        self.rebuild_with(project_id, documents, &RebuildOptions::full(full))
    }

    /// Build a new generation from `documents` and swap it in.
    ///
    /// Only one build per project runs at a time. A caller that had to wait
    /// gets the finished build's metadata if that build indexed the same
    /// corpus. A failed or cancelled build leaves the previous snapshot in
    /// place.
    pub fn rebuild_with(
        &self,
        project_id: &str,
        documents: &[Document],
        options: &RebuildOptions,
    ) -> Result<IndexMetadata> {
        let slot = self.slot(project_id)?;
        let fingerprint = corpus_fingerprint(documents);

        let (_guard, waited) = match slot.build_lock.try_lock() {
            Some(guard) => (guard, false),
            None => {
                debug!(project_id, "rebuild in progress, waiting");
                (slot.build_lock.lock(), true)
            }
        };
        let _building = BuildingGuard::new(&slot.building);
        let project_dir = self.store.project_dir(project_id);
        let _file_lock = BuildLock::acquire(&project_dir)?;

        let on_disk = self.store.current_generation(project_id).ok().flatten();
        let in_memory = slot.snapshot.read().as_ref().map(|s| s.meta.generation);
        if on_disk.is_some() && on_disk != in_memory {
            // Another process published since we last looked.
            *slot.snapshot.write() = None;
        }
        let previous = self.current(&slot, project_id);

        if let Some(prev) = &previous {
            let equivalent = prev.meta.corpus_fingerprint == fingerprint
                && self.embedder.selected_backend().as_deref() == Some(prev.meta.backend.as_str());
            if waited && equivalent {
                debug!(
                    project_id,
                    generation = prev.meta.generation,
                    "reusing build finished while waiting"
                );
                return Ok(prev.meta.clone());
            }
        }

        let docs = dedup_sorted(documents);
        let started = Utc::now().timestamp_millis();
        let mut full = options.full || previous.is_none();
        if !full {
            let active = self.embedder.active_backend();
            if let Some(prev) = &previous {
                if prev.meta.backend != active {
                    info!(
                        project_id,
                        from = %prev.meta.backend,
                        to = %active,
                        "embedding backend changed, full rebuild"
                    );
                    full = true;
                }
            }
        }

        let mut attempts = 0;
        let snapshot = loop {
            attempts += 1;
            let generation = self.store.next_generation(project_id);
            let dir = self.store.generation_dir(project_id, generation);
            let base = if full { None } else { previous.as_deref() };
            let result = self.build_generation(
                project_id,
                &docs,
                base,
                generation,
                &dir,
                started,
                &fingerprint,
                options,
            );
            match result {
                Ok(Attempt::Built(snapshot)) => break snapshot,
                Ok(Attempt::BackendSwitched { expected, got }) => {
                    self.store.discard(&dir);
                    if attempts >= 2 {
                        return Err(Error::BackendUnavailable(format!(
                            "embedding backend kept changing during rebuild ({expected} -> {got})"
                        )));
                    }
                    warn!(
                        project_id,
                        %expected,
                        %got,
                        "embedding backend switched mid-build, restarting as full rebuild"
                    );
                    full = true;
                }
                Err(err) => {
                    self.store.discard(&dir);
                    if matches!(err, Error::Cancelled) {
                        info!(project_id, "rebuild cancelled, previous index kept");
                    } else {
                        warn!(project_id, error = %err, "rebuild failed, previous index kept");
                    }
                    return Err(err);
                }
            }
        };

        let generation = snapshot.meta.generation;
        self.store.publish(project_id, generation)?;
        let meta = snapshot.meta.clone();
        *slot.snapshot.write() = Some(Arc::new(snapshot));
        slot.corrupt.store(false, Ordering::SeqCst);
        self.store.collect_garbage(project_id, generation, self.settings.index.keep_generations);
        info!(
            project_id,
            generation,
            documents = meta.document_count,
            tombstones = meta.tombstones,
            backend = %meta.backend,
            "index published"
        );
        Ok(meta)
    }

    #[allow(clippy::too_many_arguments)]
    fn build_generation(
        &self,
        project_id: &str,
        docs: &[&Document],
        base: Option<&Snapshot>,
        generation: u64,
        dir: &Path,
        started: i64,
        fingerprint: &str,
        options: &RebuildOptions,
    ) -> Result<Attempt> {
        if dir.exists() {
            std::fs::remove_dir_all(dir)?;
        }
        std::fs::create_dir_all(dir)?;
        let lexical_dir = dir.join(LEXICAL_DIR);
        let params = HnswParams::from(&self.settings.ann);

        let (changes, mut ann, mut lexical, engine, mut expected_backend) = match base {
            Some(prev) => {
                let changes = diff(prev, docs);
                let changed_share = (changes.upserts.len() + changes.removals.len()) as f64
                    / prev.documents.len().max(docs.len()).max(1) as f64;
                if changed_share > self.settings.index.incremental_threshold {
                    info!(project_id, changed_share, "change exceeds threshold, full rebuild");
                    return self.build_generation(
                        project_id,
                        docs,
                        None,
                        generation,
                        dir,
                        started,
                        fingerprint,
                        options,
                    );
                }
                copy_lexical_dir(&prev.dir_lexical(&self.store, project_id), &lexical_dir)?;
                let engine = prev.meta.lexical_engine;
                let lexical = open_lexical(&lexical_dir, engine, &self.settings.lexical)?;
                (changes, Some(prev.ann.clone()), lexical, engine, Some(prev.meta.backend.clone()))
            }
            None => {
                let (lexical, engine) = create_lexical(&lexical_dir, &self.settings.lexical)?;
                let changes = Changes { upserts: docs.to_vec(), removals: Vec::new() };
                (changes, None, lexical, engine, None)
            }
        };
        let full = base.is_none();
        info!(
            project_id,
            generation,
            full,
            upserts = changes.upserts.len(),
            removals = changes.removals.len(),
            "building index"
        );

        for path in &changes.removals {
            if let Some(ann) = ann.as_mut() {
                ann.remove(path);
            }
            lexical.remove(path)?;
        }

        let total = changes.upserts.len();
        let mut progress =
            BuildProgress { project_id: project_id.to_string(), full, embedded: 0, total };
        options.report(&progress);
        for batch in changes.upserts.chunks(self.settings.index.batch_size) {
            if options.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let texts: Vec<String> = batch.iter().map(|d| d.text.clone()).collect();
            let embeddings = self.embedder.embed_batch(&texts);
            let expected = expected_backend.get_or_insert_with(|| embeddings.backend.clone());
            if *expected != embeddings.backend {
                return Ok(Attempt::BackendSwitched {
                    expected: expected.clone(),
                    got: embeddings.backend,
                });
            }
            let dimension = embeddings.dimension();
            let index = ann.get_or_insert_with(|| AnnIndex::create(dimension, params));
            for (doc, vector) in batch.iter().zip(&embeddings.vectors) {
                index.add(&doc.path, vector)?;
                lexical.upsert(&doc.path, &doc.text)?;
            }
            progress.embedded += batch.len();
            options.report(&progress);
        }
        if options.is_cancelled() {
            return Err(Error::Cancelled);
        }
        lexical.commit()?;

        let backend = match expected_backend {
            Some(backend) => backend,
            None => self.embedder.active_backend(),
        };
        let mut ann = match ann {
            Some(ann) => ann,
            None => AnnIndex::create(self.embedder.dimension_of(&backend).unwrap_or(0), params),
        };
        if ann.tombstone_ratio() > self.settings.index.compaction_ratio {
            ann.rebuild();
        }

        let documents: BTreeMap<String, DocRecord> = docs
            .iter()
            .map(|d| {
                (d.path.clone(), DocRecord { hash: d.hash.clone(), modified_ms: d.modified_ms })
            })
            .collect();
        let meta = IndexMetadata {
            format_version: META_FORMAT_VERSION,
            generation,
            built_at_ms: started,
            dimension: ann.dimension(),
            backend,
            document_count: ann.len(),
            tombstones: ann.tombstones(),
            corpus_fingerprint: fingerprint.to_string(),
            lexical_engine: engine,
        };
        let snapshot = Snapshot { meta, documents, ann, lexical };
        self.store.write_generation(dir, &snapshot)?;
        Ok(Attempt::Built(snapshot))
    }

    /// Top `k` documents for `text`, fusing lexical and semantic rankings.
    pub fn query(&self, project_id: &str, text: &str, k: usize) -> Result<QueryOutcome> {
        let slot = self.slot(project_id)?;
        if k == 0 || text.trim().is_empty() {
            return Ok(QueryOutcome::empty(None));
        }

        let mut snapshot = self.current(&slot, project_id);
        if snapshot.is_none() {
            if !self.settings.index.build_on_demand {
                return Ok(QueryOutcome::empty(Some(QueryReason::NotIndexed)));
            }
            info!(project_id, "no index, building on demand");
            self.refresh(project_id, &RebuildOptions::full(true))?;
            snapshot = self.current(&slot, project_id);
        } else if self.settings.index.refresh_on_query && !slot.building.load(Ordering::SeqCst) {
            if let Some(current) = &snapshot {
                if !self.stale_reasons_for(project_id, current).is_empty() {
                    info!(project_id, "index stale, refreshing before query");
                    match self.refresh(project_id, &RebuildOptions::default()) {
                        Ok(_) => snapshot = self.current(&slot, project_id),
                        Err(err) => warn!(
                            project_id,
                            error = %err,
                            "refresh failed, answering from previous index"
                        ),
                    }
                }
            }
        }
        let Some(snapshot) = snapshot else {
            return Ok(QueryOutcome::empty(Some(QueryReason::NotIndexed)));
        };
        self.search_snapshot(&snapshot, text, k)
    }

    fn search_snapshot(&self, snapshot: &Snapshot, text: &str, k: usize) -> Result<QueryOutcome> {
        let depth = self.settings.fusion.candidate_depth.max(k);
        let embedded = self.embedder.embed_batch(&[text.to_string()]);
        let query_vector = embedded.vectors.first().cloned().unwrap_or_default();
        let compatible = embedded.backend == snapshot.meta.backend
            && query_vector.len() == snapshot.ann.dimension();

        let (semantic, lexical) = if compatible {
            let (semantic, lexical) = rayon::join(
                || snapshot.ann.search(&query_vector, depth),
                || snapshot.lexical.search(text, depth),
            );
            (semantic?, lexical?)
        } else {
            (Vec::<SearchHit>::new(), snapshot.lexical.search(text, depth)?)
        };
        debug!(lexical = lexical.len(), semantic = semantic.len(), "sub-searches done");

        let mut results = self.fusion.fuse(&lexical, &semantic);
        if let Some(boost) = &self.recency {
            let now = Utc::now().timestamp_millis();
            boost.apply(&mut results, |p| snapshot.documents.get(p).map(|d| d.modified_ms), now);
        }
        results.truncate(k);

        let reason = (!compatible).then(|| QueryReason::LexicalOnly {
            indexed_backend: snapshot.meta.backend.clone(),
            query_backend: embedded.backend,
        });
        Ok(QueryOutcome { results, reason })
    }

    fn project_root(&self, project_id: &str) -> Option<PathBuf> {
        self.registry.root_of(project_id).ok()
    }

    fn stale_reasons_for(&self, project_id: &str, snapshot: &Snapshot) -> Vec<StaleReason> {
        let root = self.project_root(project_id);
        let current_paths = root.as_ref().map(|r| {
            FsDocumentSource::new(r.clone(), self.settings.corpus.clone()).candidate_paths()
        });
        let active = self.embedder.selected_backend();
        stale_reasons(snapshot, root.as_deref(), current_paths.as_deref(), active.as_deref())
    }

    pub fn status(&self, project_id: &str) -> Result<IndexStatus> {
        let slot = self.slot(project_id)?;
        let building = slot.building.load(Ordering::SeqCst);
        match self.current(&slot, project_id) {
            Some(snapshot) => {
                let reasons = self.stale_reasons_for(project_id, &snapshot);
                Ok(IndexStatus::from_snapshot(project_id, &snapshot, reasons, building))
            }
            None => {
                let reason = if slot.corrupt.load(Ordering::SeqCst) {
                    StaleReason::IndexCorrupt
                } else {
                    StaleReason::IndexMissing
                };
                Ok(IndexStatus::missing(project_id, reason, building))
            }
        }
    }
}

impl Snapshot {
    fn dir_lexical(&self, store: &SnapshotStore, project_id: &str) -> PathBuf {
        store.generation_dir(project_id, self.meta.generation).join(LEXICAL_DIR)
    }
}

/// Documents by path, last one wins, in path order.
fn dedup_sorted(documents: &[Document]) -> Vec<&Document> {
    let by_path: BTreeMap<&str, &Document> =
        documents.iter().map(|d| (d.path.as_str(), d)).collect();
    by_path.into_values().collect()
}

fn diff<'a>(prev: &Snapshot, docs: &[&'a Document]) -> Changes<'a> {
    let upserts = docs
        .iter()
        .copied()
        .filter(|d| {
            prev.documents.get(&d.path).map_or(true, |r| r.hash != d.hash)
                || !prev.ann.contains(&d.path)
        })
        .collect();
    let current: std::collections::HashSet<&str> = docs.iter().map(|d| d.path.as_str()).collect();
    let removals =
        prev.documents.keys().filter(|p| !current.contains(p.as_str())).cloned().collect();
    Changes { upserts, removals }
}

fn validate_project_id(project_id: &str) -> Result<()> {
    let bad = project_id.is_empty()
        || project_id.starts_with('.')
        || project_id.contains(['/', '\\'])
        || project_id.contains("..");
    if bad {
        return Err(Error::UnknownProject(format!("invalid project id '{project_id}'")));
    }
    Ok(())
}
