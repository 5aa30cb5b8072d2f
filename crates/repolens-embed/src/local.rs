//! Small BERT-family sentence model run in-process with candle.
//!
//! The model directory holds `config.json`, `tokenizer.json` and either
//! `model.safetensors` or `pytorch_model.bin`. Loading happens on first
//! probe and is attempted once per process.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::bert::{BertModel, Config as BertConfig};
use parking_lot::Mutex;
use tokenizers::Tokenizer;
use tracing::{info, warn};

use crate::backend::EmbeddingBackend;
use crate::device::select_device;
use crate::pool::masked_mean_l2;
use crate::tokenize::tokenize_batch;

const PAD_ID: u32 = 0;

struct LoadedModel {
    model: BertModel,
    tokenizer: Tokenizer,
    device: Device,
}

pub struct LocalModelBackend {
    id: String,
    model_dir: PathBuf,
    max_len: usize,
    loaded: Mutex<Option<Arc<LoadedModel>>>,
    load_failed: AtomicBool,
    dim: AtomicUsize,
}

impl LocalModelBackend {
    pub fn new(model_dir: impl Into<PathBuf>, max_len: usize) -> Self {
        let model_dir = model_dir.into();
        let name = model_dir
            .file_name()
            .map_or_else(|| "model".to_string(), |n| n.to_string_lossy().to_string());
        Self {
            id: format!("local:{name}"),
            model_dir,
            max_len: max_len.max(1),
            loaded: Mutex::new(None),
            load_failed: AtomicBool::new(false),
            dim: AtomicUsize::new(0),
        }
    }

    fn ensure_loaded(&self) -> Result<Arc<LoadedModel>> {
        let mut slot = self.loaded.lock();
        if let Some(model) = slot.as_ref() {
            return Ok(Arc::clone(model));
        }
        if self.load_failed.load(Ordering::Relaxed) {
            return Err(anyhow!("local model failed to load earlier"));
        }
        match load_model(&self.model_dir) {
            Ok((model, hidden)) => {
                self.dim.store(hidden, Ordering::Relaxed);
                let model = Arc::new(model);
                *slot = Some(Arc::clone(&model));
                Ok(model)
            }
            Err(err) => {
                self.load_failed.store(true, Ordering::Relaxed);
                warn!(
                    dir = %self.model_dir.display(),
                    error = %err,
                    "local embedding model unavailable"
                );
                Err(err)
            }
        }
    }
}

impl EmbeddingBackend for LocalModelBackend {
    fn id(&self) -> &str {
        &self.id
    }

    fn dim(&self) -> usize {
        self.dim.load(Ordering::Relaxed)
    }

    fn probe(&self) -> bool {
        self.model_dir.join("config.json").is_file() && self.ensure_loaded().is_ok()
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let m = self.ensure_loaded()?;
        let (input_ids, attention_mask) =
            tokenize_batch(&m.tokenizer, texts, self.max_len, PAD_ID, &m.device)?;
        let token_type_ids = input_ids.zeros_like()?;
        let hidden = m.model.forward(&input_ids, &token_type_ids, Some(&attention_mask))?;
        let pooled = masked_mean_l2(&hidden, &attention_mask)?;
        Ok(pooled.to_device(&Device::Cpu)?.to_vec2::<f32>()?)
    }
}

fn load_model(dir: &Path) -> Result<(LoadedModel, usize)> {
    let device = select_device();
    info!(dir = %dir.display(), "loading local embedding model");

    let tokenizer_path = dir.join("tokenizer.json");
    let tokenizer = Tokenizer::from_file(&tokenizer_path)
        .map_err(|e| anyhow!("Failed to load tokenizer from {}: {e}", tokenizer_path.display()))?;
    let raw_config = std::fs::read_to_string(dir.join("config.json"))?;
    let config: BertConfig = serde_json::from_str(&raw_config)?;

    let safetensors = dir.join("model.safetensors");
    let weights: HashMap<String, Tensor> = if safetensors.is_file() {
        candle_core::safetensors::load(&safetensors, &device)?
    } else {
        candle_core::pickle::read_all(dir.join("pytorch_model.bin"))?.into_iter().collect()
    };
    let vb = VarBuilder::from_tensors(weights, DType::F32, &device);
    let model = BertModel::load(vb, &config)?;
    info!(hidden = config.hidden_size, "local embedding model loaded");
    Ok((LoadedModel { model, tokenizer, device }, config.hidden_size))
}
