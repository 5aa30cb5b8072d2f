use std::fs;

use tempfile::TempDir;

use repolens_core::Error;
use repolens_vector::index::{GRAPH_FILE, MAP_FILE};
use repolens_vector::{AnnIndex, HnswParams};

fn params() -> HnswParams {
    HnswParams { m: 8, ef_construction: 64, ef_search: 16, seed: 42 }
}

fn vec_for(i: usize) -> Vec<f32> {
    let a = i as f32 * 0.37;
    vec![a.cos(), a.sin(), (i % 5) as f32 * 0.2, 1.0]
}

fn filled(n: usize) -> AnnIndex {
    let mut index = AnnIndex::create(4, params());
    for i in 0..n {
        index.add(&format!("doc{i}.rs"), &vec_for(i)).unwrap();
    }
    index
}

#[test]
fn removed_paths_never_come_back() {
    let mut index = filled(30);
    for i in (0..30).step_by(3) {
        assert!(index.remove(&format!("doc{i}.rs")));
    }
    assert_eq!(index.len(), 20);
    assert_eq!(index.tombstones(), 10);
    for i in 0..30 {
        let hits = index.search(&vec_for(i), 30).unwrap();
        assert_eq!(hits.len(), 20);
        for j in (0..30).step_by(3) {
            let dead = format!("doc{j}.rs");
            assert!(hits.iter().all(|h| h.path != dead), "{dead} returned");
        }
    }
}

#[test]
fn readding_a_path_replaces_its_vector() {
    let mut index = filled(5);
    index.add("doc0.rs", &vec_for(3)).unwrap();
    assert_eq!(index.len(), 5);
    assert_eq!(index.tombstones(), 1);
    let hits = index.search(&vec_for(3), 5).unwrap();
    let paths: Vec<&str> = hits.iter().map(|h| h.path.as_str()).collect();
    assert_eq!(paths.iter().filter(|p| **p == "doc0.rs").count(), 1);
    assert!(hits[0].score > 0.999);
}

#[test]
fn dimension_mismatch_is_rejected() {
    let mut index = filled(2);
    let err = index.add("bad.rs", &[1.0, 0.0]).unwrap_err();
    assert!(matches!(err, Error::DimensionMismatch { expected: 4, actual: 2 }));
    assert!(!index.contains("bad.rs"));
}

#[test]
fn empty_index_search_is_empty() {
    let index = AnnIndex::create(4, params());
    assert!(index.search(&[1.0, 0.0, 0.0, 0.0], 5).unwrap().is_empty());
    assert!(filled(3).search(&vec_for(1), 0).unwrap().is_empty());
}

#[test]
fn zero_query_matches_nothing() {
    let index = filled(10);
    assert!(index.search(&[0.0; 4], 5).unwrap().is_empty());
}

#[test]
fn rebuild_compacts_without_changing_results() {
    let mut index = filled(25);
    for i in 0..10 {
        index.remove(&format!("doc{i}.rs"));
    }
    let before = index.search(&vec_for(12), 15).unwrap();
    index.rebuild();
    assert_eq!(index.tombstones(), 0);
    assert_eq!(index.len(), 15);
    let after = index.search(&vec_for(12), 15).unwrap();
    let mut b: Vec<&str> = before.iter().map(|h| h.path.as_str()).collect();
    let mut a: Vec<&str> = after.iter().map(|h| h.path.as_str()).collect();
    b.sort_unstable();
    a.sort_unstable();
    assert_eq!(a, b);
}

#[test]
fn save_and_load_round_trip() {
    let tmp = TempDir::new().unwrap();
    let mut index = filled(12);
    index.remove("doc4.rs");
    index.save(tmp.path(), 7).unwrap();

    let (loaded, generation) = AnnIndex::load(tmp.path(), Some(7)).unwrap().expect("present");
    assert_eq!(generation, 7);
    assert_eq!(loaded.len(), 11);
    assert_eq!(loaded.tombstones(), 1);
    assert_eq!(loaded.search(&vec_for(2), 5).unwrap(), index.search(&vec_for(2), 5).unwrap());

    // ids keep increasing after reload
    let mut loaded = loaded;
    let id = loaded.add("new.rs", &vec_for(1)).unwrap();
    assert!(id >= 12);
}

#[test]
fn missing_files_load_as_none() {
    let tmp = TempDir::new().unwrap();
    assert!(AnnIndex::load(tmp.path(), None).unwrap().is_none());
}

#[test]
fn mismatched_or_damaged_files_are_corrupt() {
    let tmp = TempDir::new().unwrap();
    let a = tmp.path().join("a");
    let b = tmp.path().join("b");
    filled(3).save(&a, 1).unwrap();
    filled(3).save(&b, 2).unwrap();

    assert!(matches!(AnnIndex::load(&a, Some(2)), Err(Error::CorruptIndex(_))));

    fs::copy(b.join(MAP_FILE), a.join(MAP_FILE)).unwrap();
    assert!(matches!(AnnIndex::load(&a, None), Err(Error::CorruptIndex(_))));

    fs::write(b.join(GRAPH_FILE), b"not a graph").unwrap();
    assert!(matches!(AnnIndex::load(&b, None), Err(Error::CorruptIndex(_))));

    fs::remove_file(b.join(MAP_FILE)).unwrap();
    assert!(matches!(AnnIndex::load(&b, None), Err(Error::CorruptIndex(_))));
}
