// crates/engram-server/src/embeddings/http.rs
// HTTP embeddings API client

use anyhow::{Context, Result};
use std::time::Duration;
use tracing::debug;

/// Max characters to embed (truncate longer text)
const MAX_TEXT_CHARS: usize = 8000;

/// Max batch size per request
const MAX_BATCH_SIZE: usize = 100;

/// Retry attempts
const RETRY_ATTEMPTS: usize = 2;

/// Client for an embeddings endpoint speaking the common
/// `{"input": [...], "model": "..."}` → `{"data": [{"index", "embedding"}]}`
/// JSON shape.
pub struct HttpEmbeddings {
    endpoint: String,
    dimensions: usize,
    http_client: reqwest::Client,
}

impl HttpEmbeddings {
    pub fn new(endpoint: String, dimensions: usize, timeout_secs: u64) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            endpoint,
            dimensions,
            http_client,
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn model_name(&self) -> &str {
        "http"
    }

    /// Embed a single text.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let text = truncate(text);
        let body = serde_json::json!({ "input": text });

        let mut last_error = None;
        for attempt in 0..=RETRY_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(500)).await;
            }

            match self.http_client.post(&self.endpoint).json(&body).send().await {
                Ok(response) if response.status().is_success() => {
                    let json: serde_json::Value = response.json().await?;
                    if let Some(embedding) = extract_embedding(&json, 0) {
                        if embedding.len() == self.dimensions {
                            return Ok(embedding);
                        }
                        anyhow::bail!(
                            "embedding dimension mismatch: expected {}, got {}",
                            self.dimensions,
                            embedding.len()
                        );
                    }
                    anyhow::bail!("invalid embedding response");
                }
                Ok(response) => {
                    let status = response.status();
                    let text = response.text().await.unwrap_or_default();
                    last_error = Some(anyhow::anyhow!("embeddings API error {}: {}", status, text));
                }
                Err(e) => {
                    last_error = Some(e.into());
                }
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("unknown embeddings error")))
    }

    /// Embed multiple texts, chunked into `MAX_BATCH_SIZE` requests.
    ///
    /// Multiple sub-batches run as parallel requests; results come back
    /// in input order.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let chunks: Vec<&[String]> = texts.chunks(MAX_BATCH_SIZE).collect();
        if chunks.len() == 1 {
            return self.embed_batch_inner(chunks[0]).await;
        }

        debug!(
            "Embedding {} texts in {} parallel batches",
            texts.len(),
            chunks.len()
        );
        let futures: Vec<_> = chunks
            .iter()
            .map(|chunk| self.embed_batch_inner(chunk))
            .collect();
        let results = futures::future::join_all(futures).await;

        let mut all_results = Vec::with_capacity(texts.len());
        for result in results {
            all_results.extend(result?);
        }
        Ok(all_results)
    }

    async fn embed_batch_inner(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let inputs: Vec<&str> = texts.iter().map(|t| truncate(t)).collect();
        let body = serde_json::json!({ "input": inputs });

        debug!("Embedding batch of {} texts", texts.len());
        let response = self
            .http_client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .context("batch embed request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("embeddings batch API error {}: {}", status, text);
        }

        let json: serde_json::Value = response.json().await?;
        let data = json["data"]
            .as_array()
            .ok_or_else(|| anyhow::anyhow!("invalid batch response"))?;

        // Results carry an index field; sort to preserve input order.
        let mut indexed: Vec<(usize, Vec<f32>)> = Vec::with_capacity(data.len());
        for item in data {
            let index = item["index"].as_u64().unwrap_or(0) as usize;
            if let Some(values) = item["embedding"].as_array() {
                let vec: Vec<f32> = values
                    .iter()
                    .filter_map(|v| v.as_f64().map(|f| f as f32))
                    .collect();
                indexed.push((index, vec));
            }
        }
        indexed.sort_by_key(|(i, _)| *i);

        anyhow::ensure!(
            indexed.len() == texts.len(),
            "embeddings batch returned {} vectors for {} texts",
            indexed.len(),
            texts.len()
        );
        Ok(indexed.into_iter().map(|(_, v)| v).collect())
    }
}

fn truncate(text: &str) -> &str {
    if text.len() > MAX_TEXT_CHARS {
        // Cut at a char boundary at or below the cap
        let mut end = MAX_TEXT_CHARS;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        &text[..end]
    } else {
        text
    }
}

fn extract_embedding(json: &serde_json::Value, index: usize) -> Option<Vec<f32>> {
    let values = json["data"].as_array()?.get(index)?["embedding"].as_array()?;
    Some(
        values
            .iter()
            .filter_map(|v| v.as_f64().map(|f| f as f32))
            .collect(),
    )
}
