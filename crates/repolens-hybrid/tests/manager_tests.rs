use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use repolens_core::config::Settings;
use repolens_core::registry::StaticRegistry;
use repolens_core::types::{Document, LexicalEngineKind};
use repolens_core::Error;
use repolens_embed::ProviderHandle;
use repolens_hybrid::{
    BuildProgress, CancelToken, IndexManager, IndexState, QueryReason, RebuildOptions, StaleReason,
};
use tempfile::TempDir;

const PROJECT: &str = "demo";

struct Fixture {
    index_dir: TempDir,
    source_dir: TempDir,
}

impl Fixture {
    fn new() -> Self {
        Self { index_dir: TempDir::new().unwrap(), source_dir: TempDir::new().unwrap() }
    }

    fn settings(&self, engine: LexicalEngineKind) -> Settings {
        let mut settings = Settings::default();
        settings.index.root = self.index_dir.path().to_string_lossy().into_owned();
        settings.lexical.engine = engine;
        settings.embedding.backends = vec!["hashed".to_string()];
        settings.embedding.fallback_dimension = 64;
        settings
    }

    fn manager_with(&self, settings: Settings, dim: usize) -> IndexManager {
        let registry = StaticRegistry::default().with_project(PROJECT, self.source_dir.path());
        IndexManager::new(settings, Arc::new(ProviderHandle::hashed_only(dim)), Arc::new(registry))
            .unwrap()
    }

    fn manager(&self, engine: LexicalEngineKind) -> IndexManager {
        self.manager_with(self.settings(engine), 64)
    }

    fn write_source(&self, rel: &str, text: &str) {
        let path = self.source_dir.path().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, text).unwrap();
    }
}

fn config_corpus() -> Vec<Document> {
    vec![
        Document::new("A.txt", "parses JSON config", 0),
        Document::new("B.txt", "parses YAML config", 0),
        Document::new("C.txt", "renders HTML template", 0),
    ]
}

fn numbered_corpus(n: usize) -> Vec<Document> {
    (0..n)
        .map(|i| {
            let body = format!("fn handler_{i}() {{ route_{i}(); }}");
            Document::new(format!("src/file_{i}.rs"), body, 0)
        })
        .collect()
}

fn rank_of(paths: &[String], path: &str) -> usize {
    paths.iter().position(|p| p == path).unwrap_or(usize::MAX)
}

fn set_mtime(path: &Path, when: SystemTime) {
    let file = fs::File::options().write(true).open(path).unwrap();
    file.set_modified(when).unwrap();
}

fn touch_future(path: &Path) {
    set_mtime(path, SystemTime::now() + Duration::from_secs(10));
}

fn now_ms() -> i64 {
    i64::try_from(SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_millis()).unwrap()
}

#[test]
fn configuration_query_prefers_parsers_with_both_engines() {
    for engine in [LexicalEngineKind::Memory, LexicalEngineKind::Tantivy] {
        let fx = Fixture::new();
        let manager = fx.manager(engine);
        let meta = manager.rebuild(PROJECT, &config_corpus(), true).unwrap();
        assert_eq!(meta.document_count, 3);

        let outcome = manager.query(PROJECT, "parse configuration", 3).unwrap();
        assert!(outcome.reason.is_none());
        let paths: Vec<String> = outcome.results.iter().map(|r| r.path.clone()).collect();
        let c = rank_of(&paths, "C.txt");
        assert!(rank_of(&paths, "A.txt") < c, "{engine:?}: {paths:?}");
        assert!(rank_of(&paths, "B.txt") < c, "{engine:?}: {paths:?}");
    }
}

#[test]
fn removed_document_disappears_from_results() {
    let fx = Fixture::new();
    let manager = fx.manager(LexicalEngineKind::Memory);
    let corpus = numbered_corpus(9).into_iter().chain(config_corpus()).collect::<Vec<_>>();
    manager.rebuild(PROJECT, &corpus, true).unwrap();
    let before = manager.query(PROJECT, "parses YAML config", 5).unwrap();
    assert!(before.results.iter().any(|r| r.path == "B.txt"));

    let without_b: Vec<Document> = corpus.into_iter().filter(|d| d.path != "B.txt").collect();
    let meta = manager.rebuild(PROJECT, &without_b, false).unwrap();
    assert_eq!(meta.document_count, 11);
    assert_eq!(meta.tombstones, 1, "small change is applied incrementally");

    let after = manager.query(PROJECT, "parses YAML config", 20).unwrap();
    assert!(after.results.iter().all(|r| r.path != "B.txt"));
}

#[test]
fn full_rebuild_twice_is_idempotent() {
    let fx = Fixture::new();
    let manager = fx.manager(LexicalEngineKind::Memory);
    let corpus = numbered_corpus(20);

    let first = manager.rebuild(PROJECT, &corpus, true).unwrap();
    let first_results = manager.query(PROJECT, "handler route", 10).unwrap();
    let second = manager.rebuild(PROJECT, &corpus, true).unwrap();
    let second_results = manager.query(PROJECT, "handler route", 10).unwrap();

    assert_eq!(first.document_count, second.document_count);
    assert_eq!(first.corpus_fingerprint, second.corpus_fingerprint);
    assert!(second.generation > first.generation);
    assert_eq!(first_results, second_results);
}

#[test]
fn incremental_threshold_selects_full_rebuild_for_large_changes() {
    let fx = Fixture::new();
    let manager = fx.manager(LexicalEngineKind::Memory);
    let mut corpus = numbered_corpus(10);
    manager.rebuild(PROJECT, &corpus, true).unwrap();

    corpus[0] = Document::new("src/file_0.rs", "fn renamed() {}", 0);
    let small = manager.rebuild(PROJECT, &corpus, false).unwrap();
    assert_eq!(small.tombstones, 1);
    assert_eq!(small.document_count, 10);

    for (i, doc) in corpus.iter_mut().enumerate().take(5) {
        *doc = Document::new(doc.path.clone(), format!("fn rewritten_{i}() {{}}"), 0);
    }
    let large = manager.rebuild(PROJECT, &corpus, false).unwrap();
    assert_eq!(large.tombstones, 0);
    assert_eq!(large.document_count, 10);

    let hits = manager.query(PROJECT, "rewritten", 3).unwrap();
    assert!(hits.results.iter().any(|r| r.path.starts_with("src/file_")));
}

#[test]
fn touching_a_file_flips_fresh_to_stale() {
    let fx = Fixture::new();
    fx.write_source("a.txt", "parses JSON config");
    fx.write_source("b.txt", "parses YAML config");
    let manager = fx.manager(LexicalEngineKind::Memory);
    manager.refresh(PROJECT, &RebuildOptions::full(true)).unwrap();

    let fresh = manager.status(PROJECT).unwrap();
    assert_eq!(fresh.state, IndexState::Fresh);
    assert!(fresh.stale_reasons.is_empty());

    touch_future(&fx.source_dir.path().join("a.txt"));
    let stale = manager.status(PROJECT).unwrap();
    assert_eq!(stale.state, IndexState::Stale);
    assert!(stale.stale_reasons.contains(&StaleReason::DocumentChanged));
    assert_eq!(stale.generation, fresh.generation, "status does not rebuild");
}

#[test]
fn added_and_removed_files_are_reported() {
    let fx = Fixture::new();
    fx.write_source("a.txt", "alpha");
    fx.write_source("b.txt", "bravo");
    let manager = fx.manager(LexicalEngineKind::Memory);
    manager.refresh(PROJECT, &RebuildOptions::full(true)).unwrap();

    fs::remove_file(fx.source_dir.path().join("b.txt")).unwrap();
    fx.write_source("c.txt", "charlie");
    let status = manager.status(PROJECT).unwrap();
    assert_eq!(status.state, IndexState::Stale);
    assert!(status.stale_reasons.contains(&StaleReason::DocumentRemoved));
    assert!(status.stale_reasons.contains(&StaleReason::DocumentAdded));

    manager.refresh(PROJECT, &RebuildOptions::default()).unwrap();
    assert_eq!(manager.status(PROJECT).unwrap().state, IndexState::Fresh);
}

#[test]
fn refresh_on_query_picks_up_changes() {
    let fx = Fixture::new();
    fx.write_source("a.txt", "parses JSON config");
    let mut settings = fx.settings(LexicalEngineKind::Memory);
    settings.index.refresh_on_query = true;
    let manager = fx.manager_with(settings, 64);
    manager.refresh(PROJECT, &RebuildOptions::full(true)).unwrap();

    fx.write_source("z.txt", "zeppelin hangar schedule");
    let outcome = manager.query(PROJECT, "zeppelin", 5).unwrap();
    assert_eq!(outcome.results.first().map(|r| r.path.as_str()), Some("z.txt"));
}

#[test]
fn missing_index_without_build_on_demand_is_empty() {
    let fx = Fixture::new();
    fx.write_source("a.txt", "parses JSON config");
    let mut settings = fx.settings(LexicalEngineKind::Memory);
    settings.index.build_on_demand = false;
    let manager = fx.manager_with(settings, 64);

    let outcome = manager.query(PROJECT, "config", 5).unwrap();
    assert!(outcome.results.is_empty());
    assert_eq!(outcome.reason, Some(QueryReason::NotIndexed));

    let status = manager.status(PROJECT).unwrap();
    assert_eq!(status.state, IndexState::Missing);
    assert_eq!(status.stale_reasons, vec![StaleReason::IndexMissing]);
}

#[test]
fn missing_index_is_built_on_first_query() {
    let fx = Fixture::new();
    fx.write_source("src/json.txt", "parses JSON config");
    fx.write_source("src/html.txt", "renders HTML template");
    let manager = fx.manager(LexicalEngineKind::Tantivy);

    let outcome = manager.query(PROJECT, "html template", 2).unwrap();
    assert_eq!(outcome.results.first().map(|r| r.path.as_str()), Some("src/html.txt"));
    assert_eq!(manager.status(PROJECT).unwrap().state, IndexState::Fresh);
}

#[test]
fn empty_query_and_zero_k_return_nothing() {
    let fx = Fixture::new();
    let manager = fx.manager(LexicalEngineKind::Memory);
    manager.rebuild(PROJECT, &config_corpus(), true).unwrap();
    assert!(manager.query(PROJECT, "   ", 5).unwrap().results.is_empty());
    assert!(manager.query(PROJECT, "config", 0).unwrap().results.is_empty());
    assert!(manager.query(PROJECT, "config", 1).unwrap().results.len() <= 1);
}

#[test]
fn empty_corpus_builds_and_answers_empty() {
    let fx = Fixture::new();
    let manager = fx.manager(LexicalEngineKind::Memory);
    let meta = manager.rebuild(PROJECT, &[], true).unwrap();
    assert_eq!(meta.document_count, 0);
    assert!(manager.query(PROJECT, "anything", 5).unwrap().results.is_empty());

    let meta = manager.rebuild(PROJECT, &config_corpus(), false).unwrap();
    assert_eq!(meta.document_count, 3);
    assert_eq!(meta.dimension, 64);
}

#[test]
fn snapshot_survives_restart() {
    let fx = Fixture::new();
    let first = fx.manager(LexicalEngineKind::Tantivy);
    let meta = first.rebuild(PROJECT, &config_corpus(), true).unwrap();
    let before = first.query(PROJECT, "parse configuration", 3).unwrap();
    drop(first);

    let second = fx.manager(LexicalEngineKind::Tantivy);
    let status = second.status(PROJECT).unwrap();
    assert_eq!(status.generation, Some(meta.generation));
    assert_eq!(status.document_count, 3);
    assert_eq!(second.query(PROJECT, "parse configuration", 3).unwrap(), before);
}

#[test]
fn cancelled_rebuild_keeps_previous_snapshot() {
    let fx = Fixture::new();
    let mut settings = fx.settings(LexicalEngineKind::Memory);
    settings.index.batch_size = 1;
    let manager = fx.manager_with(settings, 64);
    let original = manager.rebuild(PROJECT, &config_corpus(), true).unwrap();

    let token = CancelToken::new();
    let cancel_after_first = token.clone();
    let options = RebuildOptions {
        full: true,
        cancel: Some(token),
        progress: Some(Arc::new(move |p: &BuildProgress| {
            if p.embedded >= 1 {
                cancel_after_first.cancel();
            }
        })),
    };
    let err = manager.rebuild_with(PROJECT, &numbered_corpus(5), &options).unwrap_err();
    assert!(matches!(err, Error::Cancelled));

    let status = manager.status(PROJECT).unwrap();
    assert_eq!(status.generation, Some(original.generation));
    assert_eq!(status.document_count, 3);
    assert_eq!(manager.store().generations(PROJECT), vec![original.generation]);
    let outcome = manager.query(PROJECT, "parses YAML", 3).unwrap();
    assert!(outcome.results.iter().any(|r| r.path == "B.txt"));
}

#[test]
fn progress_reports_every_batch() {
    let fx = Fixture::new();
    let mut settings = fx.settings(LexicalEngineKind::Memory);
    settings.index.batch_size = 2;
    let manager = fx.manager_with(settings, 64);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let options = RebuildOptions {
        full: true,
        cancel: None,
        progress: Some(Arc::new(move |p: &BuildProgress| {
            sink.lock().unwrap().push((p.embedded, p.total));
        })),
    };
    manager.rebuild_with(PROJECT, &numbered_corpus(5), &options).unwrap();
    assert_eq!(*seen.lock().unwrap(), vec![(0, 5), (2, 5), (4, 5), (5, 5)]);
}

#[test]
fn queries_during_a_build_use_the_previous_snapshot() {
    let fx = Fixture::new();
    let manager = Arc::new(fx.manager(LexicalEngineKind::Memory));
    manager.rebuild(PROJECT, &config_corpus(), true).unwrap();

    let observed = Arc::new(Mutex::new(Vec::new()));
    let (inner, sink) = (Arc::clone(&manager), Arc::clone(&observed));
    let options = RebuildOptions {
        full: true,
        cancel: None,
        progress: Some(Arc::new(move |p: &BuildProgress| {
            if p.embedded == 0 {
                let state = inner.status(PROJECT).map(|s| s.state).ok();
                let hits =
                    inner.query(PROJECT, "parses YAML", 3).map(|o| o.results).unwrap_or_default();
                sink.lock().unwrap().push((state, hits.iter().any(|r| r.path == "B.txt")));
            }
        })),
    };
    manager.rebuild_with(PROJECT, &numbered_corpus(4), &options).unwrap();

    assert_eq!(*observed.lock().unwrap(), vec![(Some(IndexState::Building), true)]);
    let after = manager.query(PROJECT, "parses YAML", 3).unwrap();
    assert!(after.results.iter().all(|r| r.path != "B.txt"));
}

#[test]
fn concurrent_rebuilds_are_serialized() {
    let fx = Fixture::new();
    let manager = fx.manager(LexicalEngineKind::Tantivy);
    let corpus = numbered_corpus(30);

    let (a, b) = std::thread::scope(|s| {
        let a = s.spawn(|| manager.rebuild(PROJECT, &corpus, true));
        let b = s.spawn(|| manager.rebuild(PROJECT, &corpus, true));
        (a.join().unwrap(), b.join().unwrap())
    });
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.document_count, 30);
    assert_eq!(b.document_count, 30);

    let status = manager.status(PROJECT).unwrap();
    assert_eq!(status.generation, Some(a.generation.max(b.generation)));
    assert_eq!(status.document_count, 30);
}

#[test]
fn corrupt_pointer_is_treated_as_missing() {
    let fx = Fixture::new();
    fx.manager(LexicalEngineKind::Memory).rebuild(PROJECT, &config_corpus(), true).unwrap();
    fs::write(fx.index_dir.path().join(PROJECT).join("CURRENT"), "not-a-number").unwrap();

    let mut settings = fx.settings(LexicalEngineKind::Memory);
    settings.index.build_on_demand = false;
    let manager = fx.manager_with(settings, 64);
    let status = manager.status(PROJECT).unwrap();
    assert_eq!(status.state, IndexState::Missing);
    assert_eq!(status.stale_reasons, vec![StaleReason::IndexCorrupt]);
    assert_eq!(manager.query(PROJECT, "config", 3).unwrap().reason, Some(QueryReason::NotIndexed));

    let rebuilt = manager.rebuild(PROJECT, &config_corpus(), false).unwrap();
    assert_eq!(rebuilt.document_count, 3);
    let status = manager.status(PROJECT).unwrap();
    assert_eq!(status.generation, Some(rebuilt.generation));
    assert!(!status.stale_reasons.contains(&StaleReason::IndexCorrupt));
}

#[test]
fn changed_backend_falls_back_to_lexical_then_rebuilds() {
    let fx = Fixture::new();
    fx.manager_with(fx.settings(LexicalEngineKind::Memory), 64)
        .rebuild(PROJECT, &config_corpus(), true)
        .unwrap();

    let manager = fx.manager_with(fx.settings(LexicalEngineKind::Memory), 32);
    let outcome = manager.query(PROJECT, "parses YAML", 3).unwrap();
    assert_eq!(outcome.results.first().map(|r| r.path.as_str()), Some("B.txt"));
    assert!(outcome.results.iter().all(|r| r.semantic_rank.is_none()));
    assert!(matches!(outcome.reason, Some(QueryReason::LexicalOnly { .. })));
    assert!(manager.status(PROJECT).unwrap().stale_reasons.contains(&StaleReason::BackendChanged));

    let meta = manager.rebuild(PROJECT, &config_corpus(), false).unwrap();
    assert_eq!(meta.dimension, 32);
    assert_eq!(meta.backend, "hashed:d32");
    assert!(manager.query(PROJECT, "parses YAML", 3).unwrap().reason.is_none());
}

#[test]
fn invalid_project_ids_are_rejected() {
    let fx = Fixture::new();
    let manager = fx.manager(LexicalEngineKind::Memory);
    for id in ["", "../escape", "a/b", ".hidden"] {
        assert!(manager.status(id).is_err(), "{id:?}");
    }
}

#[test]
fn old_generations_are_collected() {
    let fx = Fixture::new();
    let manager = fx.manager(LexicalEngineKind::Memory);
    for _ in 0..4 {
        manager.rebuild(PROJECT, &config_corpus(), true).unwrap();
    }
    let gens = manager.store().generations(PROJECT);
    assert_eq!(gens.len(), 2, "current plus one kept: {gens:?}");
}

#[test]
fn stopword_only_query_returns_nothing() {
    for engine in [LexicalEngineKind::Memory, LexicalEngineKind::Tantivy] {
        let fx = Fixture::new();
        let manager = fx.manager(engine);
        manager.rebuild(PROJECT, &config_corpus(), true).unwrap();
        let outcome = manager.query(PROJECT, "how do I", 3).unwrap();
        assert!(outcome.results.is_empty(), "{engine:?}: {:?}", outcome.results);
        assert!(outcome.reason.is_none());
    }
}

#[test]
fn edit_between_read_and_build_is_stale() {
    let fx = Fixture::new();
    fx.write_source("a.txt", "parses JSON config");
    fx.write_source("b.txt", "parses YAML config");
    let a = fx.source_dir.path().join("a.txt");
    set_mtime(&a, SystemTime::now() - Duration::from_secs(60));
    let manager = fx.manager(LexicalEngineKind::Memory);

    let documents = manager.project_documents(PROJECT).unwrap();
    fx.write_source("a.txt", "renders HTML template");
    manager.rebuild_with(PROJECT, &documents, &RebuildOptions::full(true)).unwrap();

    let status = manager.status(PROJECT).unwrap();
    assert_eq!(status.state, IndexState::Stale);
    assert_eq!(status.stale_reasons, vec![StaleReason::DocumentChanged]);

    manager.refresh(PROJECT, &RebuildOptions::default()).unwrap();
    assert_eq!(manager.status(PROJECT).unwrap().state, IndexState::Fresh);
}

#[test]
fn recency_boost_lifts_recent_document_within_same_candidates() {
    let fx = Fixture::new();
    let day_ms = 86_400_000;
    let now = now_ms();
    let corpus = vec![
        Document::new("a.txt", "parses JSON config", now - 25 * day_ms),
        Document::new("b.txt", "parses JSON config", now),
        Document::new("c.txt", "renders HTML template", now - 40 * day_ms),
    ];
    fx.manager(LexicalEngineKind::Memory).rebuild(PROJECT, &corpus, true).unwrap();

    let plain =
        fx.manager(LexicalEngineKind::Memory).query(PROJECT, "parses JSON config", 3).unwrap();
    let mut settings = fx.settings(LexicalEngineKind::Memory);
    settings.fusion.recency_enabled = true;
    let boosted = fx.manager_with(settings, 64).query(PROJECT, "parses JSON config", 3).unwrap();

    let paths = |results: &[repolens_core::types::RankedResult]| {
        results.iter().map(|r| r.path.clone()).collect::<Vec<_>>()
    };
    let (plain_paths, boosted_paths) = (paths(&plain.results), paths(&boosted.results));
    assert_eq!(plain_paths.first().map(String::as_str), Some("a.txt"), "{plain_paths:?}");
    assert_eq!(boosted_paths.first().map(String::as_str), Some("b.txt"), "{boosted_paths:?}");

    let mut plain_set = plain_paths.clone();
    let mut boosted_set = boosted_paths.clone();
    plain_set.sort();
    boosted_set.sort();
    assert_eq!(plain_set, boosted_set);
}
