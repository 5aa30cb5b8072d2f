//! Bounded, linearly decaying boost for recently modified documents.

use std::cmp::Ordering;

use repolens_core::config::FusionConfig;
use repolens_core::types::RankedResult;

const DAY_MS: f64 = 86_400_000.0;

#[derive(Debug, Clone, Copy)]
pub struct RecencyBoost {
    window_ms: f64,
    max_boost: f64,
}

impl RecencyBoost {
    pub fn new(window_days: f64, max_boost: f64) -> Self {
        Self { window_ms: (window_days * DAY_MS).max(0.0), max_boost: max_boost.max(0.0) }
    }

    pub fn from_config(config: &FusionConfig) -> Option<Self> {
        config
            .recency_enabled
            .then(|| Self::new(config.recency_window_days, config.recency_max_boost))
    }

    /// `1 + max_boost * (1 - age / window)`, clamped to `[1, 1 + max_boost]`.
    /// Future timestamps count as age zero.
    pub fn factor(&self, age_ms: i64) -> f64 {
        if self.window_ms <= 0.0 {
            return 1.0;
        }
        let age = age_ms.max(0) as f64;
        1.0 + self.max_boost * (1.0 - age / self.window_ms).max(0.0)
    }

    /// Scale each score by its document's recency factor and re-sort.
    /// The candidate set is unchanged; equal scores keep their order.
    pub fn apply(
        &self,
        results: &mut [RankedResult],
        modified_ms: impl Fn(&str) -> Option<i64>,
        now_ms: i64,
    ) {
        for r in results.iter_mut() {
            if let Some(mtime) = modified_ms(&r.path) {
                r.score *= self.factor(now_ms.saturating_sub(mtime));
            }
        }
        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boost_is_bounded_and_monotone() {
        let boost = RecencyBoost::new(30.0, 0.2);
        let mut previous = f64::INFINITY;
        for day in 0..60 {
            let f = boost.factor(day * DAY_MS as i64);
            assert!((1.0..=1.2).contains(&f), "day {day}: {f}");
            assert!(f <= previous);
            previous = f;
        }
        assert!((boost.factor(0) - 1.2).abs() < 1e-12);
        assert!((boost.factor(15 * DAY_MS as i64) - 1.1).abs() < 1e-9);
        assert_eq!(boost.factor(45 * DAY_MS as i64), 1.0);
        assert!((boost.factor(-5_000) - 1.2).abs() < 1e-12);
    }

    #[test]
    fn apply_reorders_only_existing_candidates() {
        let now = 100 * DAY_MS as i64;
        let mut results = vec![
            RankedResult {
                path: "old".into(),
                score: 0.0165,
                lexical_rank: Some(1),
                semantic_rank: None,
            },
            RankedResult {
                path: "new".into(),
                score: 0.0160,
                lexical_rank: Some(2),
                semantic_rank: None,
            },
        ];
        let mtime = |p: &str| match p {
            "old" => Some(0),
            "new" => Some(now),
            _ => None,
        };
        RecencyBoost::new(30.0, 0.2).apply(&mut results, mtime, now);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].path, "new");
        assert!((results[1].score - 0.0165).abs() < 1e-12);
    }

    #[test]
    fn disabled_by_default() {
        assert!(RecencyBoost::from_config(&FusionConfig::default()).is_none());
    }
}
