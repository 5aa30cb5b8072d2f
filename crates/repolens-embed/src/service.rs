//! Embedding service reached over HTTP (Ollama-compatible `/api/embed`).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{anyhow, ensure, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backend::{l2_normalize, EmbeddingBackend};

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

pub struct ServiceBackend {
    id: String,
    base_url: String,
    model: String,
    probe_client: reqwest::blocking::Client,
    client: reqwest::blocking::Client,
    dim: AtomicUsize,
}

impl ServiceBackend {
    pub fn new(
        base_url: &str,
        model: &str,
        probe_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self> {
        let base_url = base_url.trim_end_matches('/').to_string();
        ensure!(!base_url.is_empty(), "embedding service url is empty");
        let probe_client = reqwest::blocking::Client::builder()
            .timeout(probe_timeout)
            .connect_timeout(probe_timeout)
            .build()
            .context("failed to build probe client")?;
        let client = reqwest::blocking::Client::builder()
            .timeout(request_timeout)
            .connect_timeout(probe_timeout)
            .build()
            .context("failed to build embedding client")?;
        Ok(Self {
            id: format!("service:{model}"),
            base_url,
            model: model.to_string(),
            probe_client,
            client,
            dim: AtomicUsize::new(0),
        })
    }
}

impl EmbeddingBackend for ServiceBackend {
    fn id(&self) -> &str {
        &self.id
    }

    fn dim(&self) -> usize {
        self.dim.load(Ordering::Relaxed)
    }

    fn probe(&self) -> bool {
        let url = format!("{}/api/tags", self.base_url);
        match self.probe_client.get(&url).send() {
            Ok(resp) => resp.status().is_success(),
            Err(err) => {
                debug!(url = %url, error = %err, "embedding service unreachable");
                false
            }
        }
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/api/embed", self.base_url);
        let body: EmbedResponse = self
            .client
            .post(&url)
            .json(&EmbedRequest { model: &self.model, input: texts })
            .send()
            .with_context(|| format!("POST {url}"))?
            .error_for_status()?
            .json()?;
        ensure!(
            body.embeddings.len() == texts.len(),
            "service returned {} embeddings for {} texts",
            body.embeddings.len(),
            texts.len()
        );
        let dim = body.embeddings.first().map_or(0, Vec::len);
        ensure!(dim > 0, "service returned empty embeddings");
        if body.embeddings.iter().any(|v| v.len() != dim) {
            return Err(anyhow!("service returned ragged embeddings"));
        }
        self.dim.store(dim, Ordering::Relaxed);
        let mut vectors = body.embeddings;
        for v in &mut vectors {
            l2_normalize(v);
        }
        Ok(vectors)
    }
}
