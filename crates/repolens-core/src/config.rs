//! Lightweight configuration loader and path helpers.
//!
//! Uses Figment to merge built-in defaults + `config.toml` + `config.<env>.toml`
//! + `APP_*` env vars (`__` separates nested keys, e.g.
//! `APP_INDEX__BUILD_ON_DEMAND=false`). Provides helpers to expand `~` and
//! `${VAR}` and to resolve relative paths against a known base directory.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::types::LexicalEngineKind;

pub struct Config {
    figment: Figment,
}

impl Config {
    pub fn load() -> Result<Self> {
        let env_name = env::var("RUST_ENV").unwrap_or_else(|_| "dev".to_string());

        let mut figment = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file("config.toml"));
        match env_name.as_str() {
            "dev" | "development" => figment = figment.merge(Toml::file("config.dev.toml")),
            "prod" | "production" => figment = figment.merge(Toml::file("config.prod.toml")),
            "test" | "testing" => figment = figment.merge(Toml::file("config.test.toml")),
            _ => {}
        }
        figment = figment.merge(Env::prefixed("APP_").split("__"));

        let config = Self { figment };
        config.settings()?.validate()?;
        Ok(config)
    }

    /// Wrap an explicit figment, mainly for tests and embedding callers.
    pub fn from_figment(figment: Figment) -> Self {
        Self { figment }
    }

    pub fn get<T>(&self, key: &str) -> Result<T>
    where
        T: serde::de::DeserializeOwned,
    {
        self.figment
            .extract_inner(key)
            .map_err(|e| Error::InvalidConfig(format!("Failed to get '{key}': {e}")))
    }

    pub fn settings(&self) -> Result<Settings> {
        self.figment
            .extract()
            .map_err(|e| Error::InvalidConfig(e.to_string()))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub index: IndexConfig,
    pub embedding: EmbeddingConfig,
    pub ann: AnnConfig,
    pub lexical: LexicalConfig,
    pub fusion: FusionConfig,
    pub corpus: CorpusConfig,
    /// Static project registry: project id -> source root.
    pub projects: BTreeMap<String, String>,
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.index.incremental_threshold) {
            return Err(Error::InvalidConfig(
                "index.incremental_threshold must be within [0, 1]".into(),
            ));
        }
        if self.index.batch_size == 0 {
            return Err(Error::InvalidConfig("index.batch_size must be greater than 0".into()));
        }
        if self.embedding.fallback_dimension == 0 {
            return Err(Error::InvalidConfig(
                "embedding.fallback_dimension must be greater than 0".into(),
            ));
        }
        if self.ann.m < 2 {
            return Err(Error::InvalidConfig("ann.m must be at least 2".into()));
        }
        if self.fusion.rrf_k < 0.0 {
            return Err(Error::InvalidConfig("fusion.rrf_k must not be negative".into()));
        }
        Ok(())
    }

    /// Source roots from `[projects]`, expanded and resolved against `base`.
    pub fn project_roots(&self, base: &Path) -> BTreeMap<String, PathBuf> {
        self.projects
            .iter()
            .map(|(id, root)| (id.clone(), resolve_with_base(base, root)))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IndexConfig {
    /// Directory holding one sub-directory per project.
    pub root: String,
    /// Build a missing index on the first query instead of answering "not indexed".
    pub build_on_demand: bool,
    /// Check staleness on every query and refresh before answering.
    pub refresh_on_query: bool,
    /// Changed share of the corpus above which a refresh becomes a full rebuild.
    pub incremental_threshold: f64,
    /// Tombstone share of the ANN graph above which it is compacted.
    pub compaction_ratio: f64,
    /// Documents embedded per batch; cancellation is checked between batches.
    pub batch_size: usize,
    /// Old generation directories kept after a successful swap.
    pub keep_generations: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            root: "~/.cache/repolens/indexes".to_string(),
            build_on_demand: true,
            refresh_on_query: false,
            incremental_threshold: 0.2,
            compaction_ratio: 0.3,
            batch_size: 32,
            keep_generations: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Ordered backend chain; unknown names are rejected at startup.
    pub backends: Vec<String>,
    pub service_url: String,
    pub service_model: String,
    pub probe_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub model_dir: String,
    pub model_max_len: usize,
    /// Dimension of the deterministic hashed vectorizer.
    pub fallback_dimension: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            backends: vec!["service".to_string(), "local".to_string(), "hashed".to_string()],
            service_url: "http://127.0.0.1:11434".to_string(),
            service_model: "nomic-embed-text".to_string(),
            probe_timeout_ms: 2_000,
            request_timeout_ms: 30_000,
            model_dir: "~/.cache/repolens/models/all-MiniLM-L6-v2".to_string(),
            model_max_len: 256,
            fallback_dimension: 384,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AnnConfig {
    pub m: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
    pub seed: u64,
}

impl Default for AnnConfig {
    fn default() -> Self {
        Self { m: 16, ef_construction: 200, ef_search: 64, seed: 0x5eed }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LexicalConfig {
    pub engine: LexicalEngineKind,
    pub bm25_k1: f32,
    pub bm25_b: f32,
    /// Leading characters of a document used as its summary in the token bag.
    pub summary_chars: usize,
}

impl Default for LexicalConfig {
    fn default() -> Self {
        Self {
            engine: LexicalEngineKind::Tantivy,
            bm25_k1: 1.2,
            bm25_b: 0.75,
            summary_chars: 2_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FusionConfig {
    pub rrf_k: f64,
    /// Hits requested from each signal before fusion.
    pub candidate_depth: usize,
    pub recency_enabled: bool,
    pub recency_window_days: f64,
    pub recency_max_boost: f64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            rrf_k: 60.0,
            candidate_depth: 50,
            recency_enabled: false,
            recency_window_days: 30.0,
            recency_max_boost: 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CorpusConfig {
    pub extensions: Vec<String>,
    pub max_file_bytes: u64,
    pub skip_dirs: Vec<String>,
}

impl Default for CorpusConfig {
    fn default() -> Self {
        let exts = [
            "rs", "py", "js", "ts", "tsx", "jsx", "go", "java", "kt", "c", "h", "cc", "cpp", "hpp",
            "cs", "rb", "php",
            "swift", "scala", "sh", "md", "txt", "toml", "yaml", "yml", "json",
        ];
        Self {
            extensions: exts.iter().map(|s| (*s).to_string()).collect(),
            max_file_bytes: 512 * 1024,
            skip_dirs: ["target", "node_modules", "dist", "build", "vendor"]
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
        }
    }
}

/// Expand a user-provided path string:
/// - Expands leading '~' to the user's home directory
/// - Expands ${VAR} and $VAR environment variables
/// - Returns a PathBuf without attempting to canonicalize
pub fn expand_path<S: AsRef<str>>(input: S) -> PathBuf {
    let s = input.as_ref();
    // Expand env vars first
    let expanded_env = shellexpand::env(s).unwrap_or(std::borrow::Cow::Borrowed(s));
    let expanded = shellexpand::tilde(&expanded_env);
    PathBuf::from(expanded.as_ref())
}

/// Resolve a possibly relative path against a given base directory after expansion.
/// If `p` is absolute, it's returned as-is; otherwise `base.join(p)` is returned.
pub fn resolve_with_base<S: AsRef<str>>(base: &Path, p: S) -> PathBuf {
    let p = expand_path(p);
    if p.is_absolute() { p } else { base.join(p) }
}
