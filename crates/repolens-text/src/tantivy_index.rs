//! Persisted BM25 engine backed by tantivy.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tantivy::collector::TopDocs;
use tantivy::query::BooleanQuery;
use tantivy::schema::{Field, Value};
use tantivy::{doc, Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument, Term};
use tracing::debug;

use repolens_core::error::{Error, Result};
use repolens_core::traits::LexicalIndex;
use repolens_core::types::{SearchHit, SourceKind};

use crate::analyzer::{analyze, build_schema, register_analyzer, token_bag, BODY_FIELD, PATH_FIELD};

const WRITER_MEMORY: usize = 50_000_000;

pub struct TantivyLexicalIndex {
    dir: PathBuf,
    index: Index,
    /// Opened on first write so read-only snapshots never take the writer lock.
    writer: Mutex<Option<IndexWriter>>,
    reader: IndexReader,
    path_field: Field,
    body_field: Field,
    summary_chars: usize,
}

impl TantivyLexicalIndex {
    /// Create a fresh index in `dir`, wiping anything already there.
    pub fn create(dir: &Path, summary_chars: usize) -> Result<Self> {
        if dir.exists() {
            std::fs::remove_dir_all(dir)?;
        }
        std::fs::create_dir_all(dir)?;
        let index = Index::create_in_dir(dir, build_schema()).map_err(Error::lexical)?;
        Self::from_index(dir, index, summary_chars)
    }

    pub fn open(dir: &Path, summary_chars: usize) -> Result<Self> {
        let index = Index::open_in_dir(dir).map_err(Error::corrupt)?;
        Self::from_index(dir, index, summary_chars)
    }

    fn from_index(dir: &Path, index: Index, summary_chars: usize) -> Result<Self> {
        register_analyzer(&index);
        let schema = index.schema();
        let path_field = schema.get_field(PATH_FIELD).map_err(Error::corrupt)?;
        let body_field = schema.get_field(BODY_FIELD).map_err(Error::corrupt)?;
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()
            .map_err(Error::lexical)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            index,
            writer: Mutex::new(None),
            reader,
            path_field,
            body_field,
            summary_chars,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn writer(&mut self) -> Result<&mut IndexWriter> {
        let slot = self.writer.get_mut();
        if slot.is_none() {
            let writer: IndexWriter = self
                .index
                .writer_with_num_threads(1, WRITER_MEMORY)
                .map_err(Error::lexical)?;
            *slot = Some(writer);
        }
        slot.as_mut().ok_or_else(|| Error::lexical("index writer unavailable"))
    }

    fn query_terms(&self, query: &str) -> Result<Vec<Term>> {
        let mut analyzer = self.index.tokenizer_for_field(self.body_field).map_err(Error::lexical)?;
        let mut words = analyze(&mut analyzer, query);
        words.sort();
        words.dedup();
        Ok(words.into_iter().map(|w| Term::from_field_text(self.body_field, &w)).collect())
    }
}

impl LexicalIndex for TantivyLexicalIndex {
    fn upsert(&mut self, path: &str, text: &str) -> Result<()> {
        let (path_field, body_field) = (self.path_field, self.body_field);
        let document = doc!(
            path_field => path.to_string(),
            body_field => token_bag(path, text, self.summary_chars),
        );
        let writer = self.writer()?;
        writer.delete_term(Term::from_field_text(path_field, path));
        writer.add_document(document).map_err(Error::lexical)?;
        Ok(())
    }

    fn remove(&mut self, path: &str) -> Result<()> {
        let path_field = self.path_field;
        self.writer()?.delete_term(Term::from_field_text(path_field, path));
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        // The writer is released after each commit so the directory holds no
        // writer lock once a build is done.
        if let Some(mut writer) = self.writer.get_mut().take() {
            writer.commit().map_err(Error::lexical)?;
            writer.wait_merging_threads().map_err(Error::lexical)?;
        }
        self.reader.reload().map_err(Error::lexical)?;
        debug!(dir = %self.dir.display(), docs = self.len(), "lexical index committed");
        Ok(())
    }

    fn search(&self, query: &str, k: usize) -> Result<Vec<SearchHit>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let terms = self.query_terms(query)?;
        if terms.is_empty() {
            return Ok(Vec::new());
        }
        let searcher = self.reader.searcher();
        if searcher.num_docs() == 0 {
            return Ok(Vec::new());
        }
        let q = BooleanQuery::new_multiterms_query(terms);
        // Widen the window until every document tied with the k-th score is
        // in it, so the path tie-break applies across the cutoff.
        let mut limit = k;
        let top_docs = loop {
            let top_docs =
                searcher.search(&q, &TopDocs::with_limit(limit)).map_err(Error::lexical)?;
            let cutoff = top_docs.get(k - 1).map(|(score, _)| *score);
            let last = top_docs.last().map(|(score, _)| *score);
            match (cutoff, last) {
                (Some(cutoff), Some(last)) if top_docs.len() == limit && last >= cutoff => {
                    limit = limit.saturating_mul(2);
                }
                _ => break top_docs,
            }
        };
        let mut hits = Vec::with_capacity(top_docs.len());
        for (score, addr) in top_docs {
            let doc: TantivyDocument = searcher.doc(addr).map_err(Error::lexical)?;
            if let Some(path) = doc.get_first(self.path_field).and_then(|v| v.as_str()) {
                hits.push(SearchHit { path: path.to_string(), score, source: SourceKind::Text });
            }
        }
        hits.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.path.cmp(&b.path)));
        hits.truncate(k);
        Ok(hits)
    }

    fn len(&self) -> usize {
        usize::try_from(self.reader.searcher().num_docs()).unwrap_or(usize::MAX)
    }
}
