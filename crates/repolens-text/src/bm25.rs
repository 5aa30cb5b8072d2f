//! In-memory BM25 engine, persisted as JSON postings.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tantivy::tokenizer::TextAnalyzer;
use tracing::debug;

use repolens_core::error::{Error, Result};
use repolens_core::traits::LexicalIndex;
use repolens_core::types::{SearchHit, SourceKind};

use crate::analyzer::{analyze, build_analyzer, token_bag};

pub const POSTINGS_FILE: &str = "postings.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct DocStats {
    len: u32,
    terms: BTreeMap<String, u32>,
}

#[derive(Serialize, Deserialize)]
struct Persisted {
    k1: f32,
    b: f32,
    docs: BTreeMap<String, DocStats>,
}

pub struct MemoryLexicalIndex {
    dir: Option<PathBuf>,
    analyzer: TextAnalyzer,
    k1: f32,
    b: f32,
    summary_chars: usize,
    docs: BTreeMap<String, DocStats>,
    postings: HashMap<String, BTreeSet<String>>,
    total_len: u64,
}

impl MemoryLexicalIndex {
    /// An empty index; `dir` is where `commit` writes the postings, if any.
    pub fn new(dir: Option<&Path>, k1: f32, b: f32, summary_chars: usize) -> Self {
        Self {
            dir: dir.map(Path::to_path_buf),
            analyzer: build_analyzer(),
            k1,
            b,
            summary_chars,
            docs: BTreeMap::new(),
            postings: HashMap::new(),
            total_len: 0,
        }
    }

    pub fn open(dir: &Path, summary_chars: usize) -> Result<Self> {
        let raw = fs::read(dir.join(POSTINGS_FILE))?;
        let persisted: Persisted = serde_json::from_slice(&raw).map_err(Error::corrupt)?;
        let mut index = Self::new(Some(dir), persisted.k1, persisted.b, summary_chars);
        for (path, stats) in persisted.docs {
            index.insert_stats(path, stats);
        }
        Ok(index)
    }

    fn insert_stats(&mut self, path: String, stats: DocStats) {
        for term in stats.terms.keys() {
            self.postings.entry(term.clone()).or_default().insert(path.clone());
        }
        self.total_len += u64::from(stats.len);
        self.docs.insert(path, stats);
    }

    fn drop_doc(&mut self, path: &str) {
        if let Some(stats) = self.docs.remove(path) {
            self.total_len -= u64::from(stats.len);
            for term in stats.terms.keys() {
                if let Some(paths) = self.postings.get_mut(term) {
                    paths.remove(path);
                    if paths.is_empty() {
                        self.postings.remove(term);
                    }
                }
            }
        }
    }

    fn idf(&self, df: usize) -> f32 {
        let n = self.docs.len() as f32;
        let df = df as f32;
        (1.0 + (n - df + 0.5) / (df + 0.5)).ln()
    }
}

impl LexicalIndex for MemoryLexicalIndex {
    fn upsert(&mut self, path: &str, text: &str) -> Result<()> {
        self.drop_doc(path);
        let bag = token_bag(path, text, self.summary_chars);
        let terms = analyze(&mut self.analyzer, &bag);
        let mut stats = DocStats {
            len: u32::try_from(terms.len()).unwrap_or(u32::MAX),
            terms: BTreeMap::new(),
        };
        for term in terms {
            *stats.terms.entry(term).or_insert(0) += 1;
        }
        self.insert_stats(path.to_string(), stats);
        Ok(())
    }

    fn remove(&mut self, path: &str) -> Result<()> {
        self.drop_doc(path);
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        fs::create_dir_all(dir)?;
        let persisted = Persisted { k1: self.k1, b: self.b, docs: self.docs.clone() };
        let tmp = dir.join(format!("{POSTINGS_FILE}.tmp"));
        fs::write(&tmp, serde_json::to_vec(&persisted)?)?;
        fs::rename(&tmp, dir.join(POSTINGS_FILE))?;
        debug!(dir = %dir.display(), docs = self.docs.len(), "memory lexical index committed");
        Ok(())
    }

    fn search(&self, query: &str, k: usize) -> Result<Vec<SearchHit>> {
        if k == 0 || self.docs.is_empty() {
            return Ok(Vec::new());
        }
        let mut analyzer = self.analyzer.clone();
        let mut terms = analyze(&mut analyzer, query);
        terms.sort();
        terms.dedup();

        let avg_len = self.total_len as f32 / self.docs.len() as f32;
        let mut scores: BTreeMap<&str, f32> = BTreeMap::new();
        for term in &terms {
            let Some(paths) = self.postings.get(term) else {
                continue;
            };
            let idf = self.idf(paths.len());
            for path in paths {
                let Some(stats) = self.docs.get(path) else {
                    continue;
                };
                let tf = stats.terms.get(term).copied().unwrap_or(0) as f32;
                let norm = self.k1 * (1.0 - self.b + self.b * stats.len as f32 / avg_len.max(1e-6));
                *scores.entry(path.as_str()).or_insert(0.0) +=
                    idf * tf * (self.k1 + 1.0) / (tf + norm);
            }
        }

        let mut hits: Vec<SearchHit> = scores
            .into_iter()
            .map(|(path, score)| SearchHit {
                path: path.to_string(),
                score,
                source: SourceKind::Text,
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.path.cmp(&b.path)));
        hits.truncate(k);
        Ok(hits)
    }

    fn len(&self) -> usize {
        self.docs.len()
    }
}
