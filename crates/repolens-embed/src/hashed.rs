//! Deterministic hashed TF-IDF vectorizer, the offline last resort.
//!
//! Features are word unigrams and boundary-marked character trigrams of each
//! word (`^pa`, `par`, ..., `se$`), so inflections like "parse"/"parses"
//! still overlap. Term frequency is sublinear (`1 + ln tf`) and weighted by
//! a fixed IDF prior: stopwords score zero and longer words score higher.
//! Features are hashed into a fixed number of buckets with XxHash64, using a
//! hash bit as the sign to keep collisions unbiased.

use std::collections::BTreeMap;
use std::hash::Hasher;

use anyhow::{bail, Result};
use twox_hash::XxHash64;

use repolens_core::tokens::{is_stop_word, word_tokens};

use crate::backend::{l2_normalize, EmbeddingBackend};

const WORD_WEIGHT: f32 = 1.0;
const TRIGRAM_WEIGHT: f32 = 0.5;
const HASH_SEED: u64 = 0;

pub struct HashedVectorizer {
    dim: usize,
    id: String,
}

impl HashedVectorizer {
    pub fn new(dim: usize) -> Self {
        Self { dim, id: format!("hashed:d{dim}") }
    }

    pub fn vectorize(&self, text: &str) -> Result<Vec<f32>> {
        if text.contains('\0') {
            bail!("input contains NUL bytes");
        }
        let mut v = vec![0f32; self.dim];
        if self.dim == 0 {
            return Ok(v);
        }
        for (feature, (weight, tf)) in features(text) {
            let value = weight * (1.0 + (tf as f32).ln());
            let h = hash(&feature);
            let idx = (h % self.dim as u64) as usize;
            if h >> 63 == 0 {
                v[idx] += value;
            } else {
                v[idx] -= value;
            }
        }
        l2_normalize(&mut v);
        Ok(v)
    }
}

impl EmbeddingBackend for HashedVectorizer {
    fn id(&self) -> &str {
        &self.id
    }

    fn dim(&self) -> usize {
        self.dim
    }

    fn probe(&self) -> bool {
        true
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        texts.iter().map(|t| self.vectorize(t)).collect()
    }
}

fn idf_prior(word: &str) -> f32 {
    1.0 + (word.chars().count().min(12) as f32) / 12.0
}

/// Feature key -> (weight, term frequency). Ordered so float sums are
/// accumulated in the same order on every run.
fn features(text: &str) -> BTreeMap<String, (f32, u32)> {
    let mut out: BTreeMap<String, (f32, u32)> = BTreeMap::new();
    for word in word_tokens(text) {
        if word.chars().count() < 2 || is_stop_word(&word) {
            continue;
        }
        let idf = idf_prior(&word);
        let entry = out.entry(format!("w:{word}")).or_insert((WORD_WEIGHT * idf, 0));
        entry.1 += 1;

        let padded: Vec<char> =
            std::iter::once('^').chain(word.chars()).chain(std::iter::once('$')).collect();
        for window in padded.windows(3) {
            let gram: String = window.iter().collect();
            let entry = out.entry(format!("c:{gram}")).or_insert((TRIGRAM_WEIGHT, 0));
            entry.1 += 1;
        }
    }
    out
}

fn hash(feature: &str) -> u64 {
    let mut hasher = XxHash64::with_seed(HASH_SEED);
    hasher.write(feature.as_bytes());
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    #[test]
    fn same_text_same_vector() {
        let v = HashedVectorizer::new(384);
        let a = v.vectorize("parse configuration files").unwrap();
        let b = v.vectorize("parse configuration files").unwrap();
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[test]
    fn inflections_share_trigrams() {
        let v = HashedVectorizer::new(384);
        let query = v.vectorize("parse configuration").unwrap();
        let json = v.vectorize("parses JSON config").unwrap();
        let html = v.vectorize("renders HTML template").unwrap();
        assert!(cosine(&query, &json) > cosine(&query, &html));
    }

    #[test]
    fn stopword_only_text_is_zero() {
        let v = HashedVectorizer::new(16);
        assert!(v.vectorize("the and of").unwrap().iter().all(|x| *x == 0.0));
    }

    #[test]
    fn nul_input_is_rejected() {
        assert!(HashedVectorizer::new(16).vectorize("bad\0input").is_err());
    }
}
