//! Reciprocal Rank Fusion of the lexical and semantic result lists.

use std::collections::HashMap;

use repolens_core::types::{RankedResult, SearchHit};

pub const DEFAULT_RRF_K: f64 = 60.0;

#[derive(Debug, Clone, Copy)]
pub struct FusionRanker {
    k: f64,
}

impl Default for FusionRanker {
    fn default() -> Self {
        Self { k: DEFAULT_RRF_K }
    }
}

impl FusionRanker {
    pub fn new(k: f64) -> Self {
        Self { k: k.max(0.0) }
    }

    pub fn k(&self) -> f64 {
        self.k
    }

    /// Fuse two best-first lists by rank only; raw scores are ignored.
    ///
    /// Each list contributes `1 / (k + rank)` (1-based rank) to a document.
    /// Equal totals keep candidate order: candidates are visited rank by
    /// rank, lexical before semantic at the same rank.
    pub fn fuse(&self, lexical: &[SearchHit], semantic: &[SearchHit]) -> Vec<RankedResult> {
        let mut slots: HashMap<&str, usize> = HashMap::new();
        let mut results: Vec<RankedResult> = Vec::with_capacity(lexical.len() + semantic.len());

        let depth = lexical.len().max(semantic.len());
        for rank in 1..=depth {
            for (list, is_lexical) in [(lexical, true), (semantic, false)] {
                let Some(hit) = list.get(rank - 1) else {
                    continue;
                };
                let slot = *slots.entry(hit.path.as_str()).or_insert_with(|| {
                    results.push(RankedResult {
                        path: hit.path.clone(),
                        score: 0.0,
                        lexical_rank: None,
                        semantic_rank: None,
                    });
                    results.len() - 1
                });
                let entry = &mut results[slot];
                let rank_field =
                    if is_lexical { &mut entry.lexical_rank } else { &mut entry.semantic_rank };
                // A path listed twice in one list counts once, at its best rank.
                if rank_field.is_none() {
                    *rank_field = Some(rank);
                    entry.score += 1.0 / (self.k + rank as f64);
                }
            }
        }

        results.sort_by(|a, b| b.score.total_cmp(&a.score));
        results
    }
}
