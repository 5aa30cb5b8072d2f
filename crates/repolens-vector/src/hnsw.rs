//! Hierarchical navigable small-world graph over L2-normalised vectors.
//!
//! Similarity is the dot product (cosine for unit vectors). Node levels are
//! drawn from an RNG seeded by the node id, so inserting the same ids in the
//! same order always yields the same graph.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, HashSet};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use repolens_core::config::AnnConfig;

const MAX_LEVEL: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HnswParams {
    /// Links per node above layer 0; layer 0 keeps twice as many.
    pub m: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
    pub seed: u64,
}

impl Default for HnswParams {
    fn default() -> Self {
        Self::from(&AnnConfig::default())
    }
}

impl From<&AnnConfig> for HnswParams {
    fn from(config: &AnnConfig) -> Self {
        Self {
            m: config.m.max(2),
            ef_construction: config.ef_construction.max(1),
            ef_search: config.ef_search.max(1),
            seed: config.seed,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Node {
    id: u64,
    vector: Vec<f32>,
    /// Neighbour slots, one list per layer the node lives on.
    links: Vec<Vec<u32>>,
}

#[derive(Debug, Clone, Copy)]
struct Scored {
    sim: f32,
    slot: u32,
}

impl PartialEq for Scored {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Scored {}

impl PartialOrd for Scored {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scored {
    // Higher similarity first; lower slot wins ties so order is reproducible.
    fn cmp(&self, other: &Self) -> Ordering {
        self.sim.total_cmp(&other.sim).then_with(|| other.slot.cmp(&self.slot))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HnswGraph {
    params: HnswParams,
    nodes: Vec<Node>,
    entry: Option<u32>,
    max_level: usize,
    #[serde(skip)]
    slots: HashMap<u64, u32>,
}

pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

impl HnswGraph {
    pub fn new(params: HnswParams) -> Self {
        Self { params, nodes: Vec::new(), entry: None, max_level: 0, slots: HashMap::new() }
    }

    pub fn params(&self) -> HnswParams {
        self.params
    }

    /// Physical node count, tombstoned nodes included.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.slots.contains_key(&id)
    }

    pub fn vector(&self, id: u64) -> Option<&[f32]> {
        self.slots.get(&id).map(|&slot| self.nodes[slot as usize].vector.as_slice())
    }

    pub fn ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.nodes.iter().map(|n| n.id)
    }

    /// Restore the id lookup after deserialisation. Returns false when the
    /// node table is inconsistent (duplicate ids or dangling links).
    pub fn reindex(&mut self) -> bool {
        self.slots.clear();
        let n = self.nodes.len();
        for (slot, node) in self.nodes.iter().enumerate() {
            let Ok(slot) = u32::try_from(slot) else {
                return false;
            };
            if self.slots.insert(node.id, slot).is_some() {
                return false;
            }
            if node.links.iter().flatten().any(|&l| l as usize >= n) {
                return false;
            }
        }
        self.entry.map_or(n == 0, |e| (e as usize) < n)
    }

    fn max_links(&self, layer: usize) -> usize {
        if layer == 0 {
            self.params.m * 2
        } else {
            self.params.m
        }
    }

    fn random_level(&self, id: u64) -> usize {
        let mut rng =
            StdRng::seed_from_u64(self.params.seed ^ id.wrapping_mul(0x9E37_79B9_7F4A_7C15));
        let ml = 1.0 / (self.params.m as f64).ln();
        let uniform: f64 = 1.0 - rng.gen::<f64>();
        ((-uniform.ln() * ml).floor() as usize).min(MAX_LEVEL)
    }

    fn sim(&self, query: &[f32], slot: u32) -> f32 {
        dot(query, &self.nodes[slot as usize].vector)
    }

    fn links(&self, slot: u32, layer: usize) -> &[u32] {
        self.nodes[slot as usize].links.get(layer).map_or(&[][..], Vec::as_slice)
    }

    fn greedy_closest(&self, query: &[f32], mut current: u32, layer: usize) -> u32 {
        let mut best = self.sim(query, current);
        loop {
            let mut moved = false;
            for &next in self.links(current, layer) {
                let s = self.sim(query, next);
                if s > best {
                    best = s;
                    current = next;
                    moved = true;
                }
            }
            if !moved {
                return current;
            }
        }
    }

    /// Best-first search on one layer; returns up to `ef` nodes, best first.
    fn search_layer(&self, query: &[f32], entry: u32, ef: usize, layer: usize) -> Vec<Scored> {
        let mut visited: HashSet<u32> = HashSet::new();
        visited.insert(entry);
        let first = Scored { sim: self.sim(query, entry), slot: entry };
        let mut candidates: BinaryHeap<Scored> = BinaryHeap::new();
        let mut results: BinaryHeap<Reverse<Scored>> = BinaryHeap::new();
        candidates.push(first);
        results.push(Reverse(first));

        while let Some(current) = candidates.pop() {
            let worst = results.peek().map_or(f32::NEG_INFINITY, |r| r.0.sim);
            if current.sim < worst && results.len() >= ef {
                break;
            }
            for &next in self.links(current.slot, layer) {
                if !visited.insert(next) {
                    continue;
                }
                let scored = Scored { sim: self.sim(query, next), slot: next };
                let worst = results.peek().map_or(f32::NEG_INFINITY, |r| r.0.sim);
                if results.len() < ef || scored.sim > worst {
                    candidates.push(scored);
                    results.push(Reverse(scored));
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }
        let mut out: Vec<Scored> = results.into_iter().map(|r| r.0).collect();
        out.sort_by(|a, b| b.cmp(a));
        out
    }

    /// Insert a normalised vector under `id`. Ids must be unique.
    pub fn insert(&mut self, id: u64, vector: Vec<f32>) {
        let level = self.random_level(id);
        let slot = u32::try_from(self.nodes.len()).unwrap_or(u32::MAX);
        self.nodes.push(Node { id, vector, links: vec![Vec::new(); level + 1] });
        self.slots.insert(id, slot);

        let Some(entry) = self.entry else {
            self.entry = Some(slot);
            self.max_level = level;
            return;
        };

        let query = self.nodes[slot as usize].vector.clone();
        let mut ep = entry;
        for layer in (level + 1..=self.max_level).rev() {
            ep = self.greedy_closest(&query, ep, layer);
        }
        for layer in (0..=level.min(self.max_level)).rev() {
            let found = self.search_layer(&query, ep, self.params.ef_construction, layer);
            let max_links = self.max_links(layer);
            let neighbours: Vec<u32> =
                found.iter().map(|s| s.slot).filter(|&s| s != slot).take(max_links).collect();
            self.nodes[slot as usize].links[layer] = neighbours.clone();
            for n in neighbours {
                self.link_back(n, slot, layer);
            }
            if let Some(best) = found.first() {
                ep = best.slot;
            }
        }
        if level > self.max_level {
            self.max_level = level;
            self.entry = Some(slot);
        }
    }

    fn link_back(&mut self, from: u32, to: u32, layer: usize) {
        let max_links = self.max_links(layer);
        let Some(links) = self.nodes[from as usize].links.get(layer) else {
            return;
        };
        let mut links = links.clone();
        links.push(to);
        if links.len() > max_links {
            let base = self.nodes[from as usize].vector.clone();
            let mut scored: Vec<Scored> =
                links.iter().map(|&s| Scored { sim: self.sim(&base, s), slot: s }).collect();
            scored.sort_by(|a, b| b.cmp(a));
            links = scored.into_iter().take(max_links).map(|s| s.slot).collect();
        }
        self.nodes[from as usize].links[layer] = links;
    }

    /// Up to `k` `(id, similarity)` pairs accepted by `is_live`, best first.
    /// The beam widens until `k` live nodes are found or the graph is exhausted.
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        is_live: impl Fn(u64) -> bool,
    ) -> Vec<(u64, f32)> {
        let Some(entry) = self.entry else {
            return Vec::new();
        };
        if k == 0 {
            return Vec::new();
        }
        let mut ep = entry;
        for layer in (1..=self.max_level).rev() {
            ep = self.greedy_closest(query, ep, layer);
        }
        let mut ef = self.params.ef_search.max(k);
        loop {
            let found = self.search_layer(query, ep, ef, 0);
            let live: Vec<(u64, f32)> = found
                .iter()
                .map(|s| (self.nodes[s.slot as usize].id, s.sim))
                .filter(|(id, _)| is_live(*id))
                .take(k)
                .collect();
            if live.len() >= k || ef >= self.nodes.len() {
                return live;
            }
            ef = (ef * 2).min(self.nodes.len());
        }
    }
}
