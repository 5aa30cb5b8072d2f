//! Approximate nearest-neighbour index keyed by document path.
//!
//! Updates never touch the graph in place: re-adding a path inserts a new
//! node under a fresh id and leaves the old node as a tombstone, and removal
//! only drops the mapping. `rebuild` compacts the graph down to live ids.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use repolens_core::error::{Error, Result};
use repolens_core::fsutil::{read_optional, write_atomic};
use repolens_core::types::{SearchHit, SourceKind};

use crate::hnsw::{HnswGraph, HnswParams};
use crate::id_map::IdMap;

pub const GRAPH_FILE: &str = "ann.graph";
pub const MAP_FILE: &str = "ann.map.json";
pub const FORMAT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct GraphFile {
    format_version: u32,
    generation: u64,
    dimension: usize,
    graph: HnswGraph,
}

#[derive(Serialize, Deserialize)]
struct MapFile {
    format_version: u32,
    generation: u64,
    ids: IdMap,
}

#[derive(Clone)]
pub struct AnnIndex {
    dimension: usize,
    graph: HnswGraph,
    ids: IdMap,
}

impl AnnIndex {
    pub fn create(dimension: usize, params: HnswParams) -> Self {
        Self { dimension, graph: HnswGraph::new(params), ids: IdMap::default() }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn params(&self) -> HnswParams {
        self.graph.params()
    }

    /// Live documents.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Physical nodes no longer reachable through the path map.
    pub fn tombstones(&self) -> usize {
        self.graph.len().saturating_sub(self.ids.len())
    }

    pub fn tombstone_ratio(&self) -> f64 {
        if self.graph.is_empty() {
            0.0
        } else {
            self.tombstones() as f64 / self.graph.len() as f64
        }
    }

    pub fn contains(&self, path: &str) -> bool {
        self.ids.id_of(path).is_some()
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.ids.paths()
    }

    pub fn vector(&self, path: &str) -> Option<&[f32]> {
        self.ids.id_of(path).and_then(|id| self.graph.vector(id))
    }

    /// Insert `vector` for `path`, tombstoning any previous vector of the path.
    pub fn add(&mut self, path: &str, vector: &[f32]) -> Result<u64> {
        if vector.len() != self.dimension {
            return Err(Error::DimensionMismatch { expected: self.dimension, actual: vector.len() });
        }
        let (id, old) = self.ids.assign(path);
        if let Some(old) = old {
            debug!(path, old, id, "replacing vector");
        }
        self.graph.insert(id, normalized(vector));
        Ok(id)
    }

    /// Drop the mapping for `path`. Returns whether it was present.
    pub fn remove(&mut self, path: &str) -> bool {
        self.ids.remove(path).is_some()
    }

    /// The `k` nearest live documents by cosine similarity, best first.
    /// A zero query has no direction and matches nothing.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>> {
        if k == 0 || self.ids.is_empty() {
            return Ok(Vec::new());
        }
        if query.len() != self.dimension {
            return Err(Error::DimensionMismatch { expected: self.dimension, actual: query.len() });
        }
        if norm(query) <= ZERO_NORM {
            return Ok(Vec::new());
        }
        let q = normalized(query);
        let hits = self
            .graph
            .search(&q, k, |id| self.ids.is_live(id))
            .into_iter()
            .filter_map(|(id, sim)| {
                self.ids.path_of(id).map(|p| SearchHit {
                    path: p.to_string(),
                    score: sim,
                    source: SourceKind::Vector,
                })
            })
            .collect();
        Ok(hits)
    }

    /// Rebuild the graph from live ids only, dropping every tombstone.
    /// Ids and the path map are kept.
    pub fn rebuild(&mut self) {
        let before = self.graph.len();
        let mut graph = HnswGraph::new(self.graph.params());
        for id in self.ids.live_ids() {
            if let Some(v) = self.graph.vector(id) {
                graph.insert(id, v.to_vec());
            }
        }
        self.graph = graph;
        info!(before, after = self.graph.len(), "ann index compacted");
    }

    /// Write the graph and map files into `dir`, both stamped with `generation`.
    pub fn save(&self, dir: &Path, generation: u64) -> Result<()> {
        let graph_file = GraphFile {
            format_version: FORMAT_VERSION,
            generation,
            dimension: self.dimension,
            graph: self.graph.clone(),
        };
        let graph_bytes =
            bincode::serialize(&graph_file).map_err(|e| Error::Operation(e.to_string()))?;
        write_atomic(&dir.join(GRAPH_FILE), &graph_bytes)?;

        let map_file =
            MapFile { format_version: FORMAT_VERSION, generation, ids: self.ids.clone() };
        write_atomic(&dir.join(MAP_FILE), &serde_json::to_vec(&map_file)?)?;
        debug!(dir = %dir.display(), generation, live = self.len(), "ann index saved");
        Ok(())
    }

    /// Load the index saved in `dir`.
    ///
    /// Returns `Ok(None)` when neither file exists, and `CorruptIndex` when
    /// the files fail to parse or disagree with each other or with
    /// `expected_generation`.
    pub fn load(dir: &Path, expected_generation: Option<u64>) -> Result<Option<(Self, u64)>> {
        let graph_bytes = read_optional(&dir.join(GRAPH_FILE))?;
        let map_bytes = read_optional(&dir.join(MAP_FILE))?;
        let (graph_bytes, map_bytes) = match (graph_bytes, map_bytes) {
            (None, None) => return Ok(None),
            (Some(g), Some(m)) => (g, m),
            _ => return Err(Error::corrupt(format!("incomplete ann files in {}", dir.display()))),
        };
        let graph_file: GraphFile = bincode::deserialize(&graph_bytes).map_err(Error::corrupt)?;
        let map_file: MapFile = serde_json::from_slice(&map_bytes).map_err(Error::corrupt)?;

        if graph_file.format_version != FORMAT_VERSION
            || map_file.format_version != FORMAT_VERSION
        {
            return Err(Error::corrupt("unsupported ann format version"));
        }
        if graph_file.generation != map_file.generation {
            return Err(Error::corrupt(format!(
                "ann graph generation {} does not match map generation {}",
                graph_file.generation, map_file.generation
            )));
        }
        if let Some(expected) = expected_generation {
            if graph_file.generation != expected {
                return Err(Error::corrupt(format!(
                    "ann generation {} does not match expected {expected}",
                    graph_file.generation
                )));
            }
        }

        let mut graph = graph_file.graph;
        if !graph.reindex() || !map_file.ids.is_consistent() {
            return Err(Error::corrupt("ann graph or map is inconsistent"));
        }
        if let Some(missing) = map_file.ids.live_ids().find(|id| !graph.contains(*id)) {
            warn!(id = missing, "mapped id has no vector");
            return Err(Error::corrupt(format!("mapped id {missing} has no vector")));
        }
        let generation = graph_file.generation;
        Ok(Some((Self { dimension: graph_file.dimension, graph, ids: map_file.ids }, generation)))
    }
}

const ZERO_NORM: f32 = 1e-12;

fn norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

fn normalized(v: &[f32]) -> Vec<f32> {
    let n = norm(v);
    if n > ZERO_NORM {
        v.iter().map(|x| x / n).collect()
    } else {
        v.to_vec()
    }
}
