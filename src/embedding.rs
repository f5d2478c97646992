//! Embedding provider abstraction and implementations.
//!
//! Defines the [`EmbeddingProvider`] trait and concrete implementations:
//! - **[`HashingProvider`]**: deterministic feature hashing of word and
//!   character-trigram features. Offline; the default.
//! - **[`OpenAIProvider`]**: calls the OpenAI embeddings API with batching,
//!   retry and backoff.
//!
//! Also provides [`cosine_similarity`], the shared [`tokenize`] used by the
//! keyword channel of retrieval, and an on-disk [`EmbeddingCache`].
//!
//! # Provider Selection
//!
//! ```rust
//! # use patent_query::config::EmbeddingConfig;
//! # use patent_query::embedding::create_provider;
//! let config = EmbeddingConfig::default(); // provider = "hashing"
//! let provider = create_provider(&config).unwrap();
//! assert_eq!(provider.model_name(), "hashing");
//! assert_eq!(provider.dims(), 512);
//! ```
//!
//! # Retry Strategy
//!
//! The OpenAI provider uses exponential backoff for transient errors:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::config::EmbeddingConfig;

const DEFAULT_HASHING_DIMS: usize = 512;

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "does", "do", "for", "from", "has", "have",
    "how", "in", "is", "it", "its", "many", "much", "of", "on", "or", "that", "the", "their",
    "there", "this", "to", "was", "were", "what", "when", "where", "which", "who", "with",
];

/// Capability for turning text into vectors.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality.
    fn dims(&self) -> usize;
    /// Embed a batch of texts, preserving input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Embed a single query text.
pub async fn embed_query(provider: &dyn EmbeddingProvider, text: &str) -> Result<Vec<f32>> {
    let results = provider.embed(&[text.to_string()]).await?;
    results
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("Empty embedding response"))
}

pub fn create_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "hashing" => Ok(Arc::new(HashingProvider::new(
            config.dims.unwrap_or(DEFAULT_HASHING_DIMS),
        ))),
        "openai" => Ok(Arc::new(OpenAIProvider::new(config)?)),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

/// Lowercased word tokens with stopwords removed and a light plural strip.
///
/// `"How many claims does each patent have?"` → `["claim", "each", "patent"]`.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .filter(|t| !STOPWORDS.contains(&t.as_str()))
        .map(|t| stem(&t))
        .collect()
}

fn stem(token: &str) -> String {
    if token.len() > 4 && token.ends_with("ies") {
        format!("{}y", &token[..token.len() - 3])
    } else if token.len() > 3 && token.ends_with('s') && !token.ends_with("ss") {
        token[..token.len() - 1].to_string()
    } else {
        token.to_string()
    }
}

// ============ Hashing Provider ============

/// Feature-hashing embedder.
///
/// Each word token and each character trigram of a token (with `^`/`$`
/// boundary markers) is hashed with SHA-256 into one of `dims` buckets
/// with a ±1 sign. Trigrams carry half weight so misspelled names still
/// land near the right table. The result is L2-normalized.
pub struct HashingProvider {
    dims: usize,
}

impl HashingProvider {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dims];
        for token in tokenize(text) {
            self.add_feature(&mut vector, &token, 1.0);
            let marked: Vec<char> = format!("^{}$", token).chars().collect();
            for window in marked.windows(3) {
                let trigram: String = window.iter().collect();
                self.add_feature(&mut vector, &trigram, 0.5);
            }
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }

    fn add_feature(&self, vector: &mut [f32], feature: &str, weight: f32) {
        let digest = Sha256::digest(feature.as_bytes());
        let mut bucket_bytes = [0u8; 8];
        bucket_bytes.copy_from_slice(&digest[..8]);
        let bucket = (u64::from_le_bytes(bucket_bytes) % self.dims as u64) as usize;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        vector[bucket] += sign * weight;
    }
}

#[async_trait]
impl EmbeddingProvider for HashingProvider {
    fn model_name(&self) -> &str {
        "hashing"
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

// ============ OpenAI Provider ============

/// Embedding provider using the OpenAI API.
///
/// Calls `POST /v1/embeddings` with the configured model. Requires the
/// `OPENAI_API_KEY` environment variable.
pub struct OpenAIProvider {
    model: String,
    dims: usize,
    api_key: String,
    batch_size: usize,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAIProvider {
    /// # Errors
    ///
    /// Returns an error if `model` or `dims` is not set in config,
    /// or if `OPENAI_API_KEY` is not in the environment.
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            model,
            dims,
            api_key,
            batch_size: config.batch_size.max(1),
            max_retries: config.max_retries,
            client,
        })
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post("https://api.openai.com/v1/embeddings")
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response.json().await?;
                        return parse_openai_response(&json, texts.len());
                    }

                    // Rate limited or server error: retry
                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        tracing::warn!(%status, attempt, "embedding request failed, retrying");
                        last_err = Some(anyhow::anyhow!(
                            "OpenAI API error {}: {}",
                            status,
                            body_text
                        ));
                        continue;
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    bail!("OpenAI API error {}: {}", status, body_text);
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Embedding failed after retries")))
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            out.extend(self.embed_batch(batch).await?);
        }
        Ok(out)
    }
}

/// Extract `data[].embedding`, ordered by each item's `index`.
fn parse_openai_response(json: &serde_json::Value, expected: usize) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing embedding"))?;

        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        indexed.push((index, vec));
    }

    if indexed.len() != expected {
        bail!(
            "Invalid OpenAI response: expected {} embeddings, got {}",
            expected,
            indexed.len()
        );
    }
    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

/// Compute cosine similarity between two vectors.
///
/// Returns 0.0 for mismatched lengths, empty inputs, or zero vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

// ============ Embedding Cache ============

#[derive(Deserialize)]
struct CacheFile {
    entries: HashMap<String, Vec<f32>>,
}

#[derive(Serialize)]
struct CacheFileRef<'a> {
    entries: &'a HashMap<String, Vec<f32>>,
}

/// JSON file of embeddings keyed by SHA-256 of `model \0 text`.
///
/// Lets a remote provider skip re-embedding the catalog on every start.
pub struct EmbeddingCache {
    path: PathBuf,
    entries: HashMap<String, Vec<f32>>,
    dirty: bool,
}

impl EmbeddingCache {
    /// Open a cache file; a missing file yields an empty cache.
    pub fn load(path: &Path) -> Result<Self> {
        let entries = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read embedding cache {}", path.display()))?;
            let file: CacheFile = serde_json::from_str(&content)
                .with_context(|| format!("Corrupt embedding cache {}", path.display()))?;
            file.entries
        } else {
            HashMap::new()
        };
        Ok(Self {
            path: path.to_path_buf(),
            entries,
            dirty: false,
        })
    }

    fn key(model: &str, text: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(model.as_bytes());
        hasher.update([0u8]);
        hasher.update(text.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn get(&self, model: &str, text: &str) -> Option<&Vec<f32>> {
        self.entries.get(&Self::key(model, text))
    }

    pub fn insert(&mut self, model: &str, text: &str, vector: Vec<f32>) {
        self.entries.insert(Self::key(model, text), vector);
        self.dirty = true;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Write the cache back if anything was inserted since loading.
    pub fn save(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string(&CacheFileRef {
            entries: &self.entries,
        })?;
        std::fs::write(&self.path, json)
            .with_context(|| format!("Failed to write embedding cache {}", self.path.display()))?;
        self.dirty = false;
        Ok(())
    }
}

/// Embed `texts`, serving hits from `cache` and embedding only the misses.
pub async fn embed_cached(
    provider: &dyn EmbeddingProvider,
    texts: &[String],
    cache: Option<&mut EmbeddingCache>,
) -> Result<Vec<Vec<f32>>> {
    let Some(cache) = cache else {
        return provider.embed(texts).await;
    };

    let model = provider.model_name().to_string();
    let misses: Vec<String> = texts
        .iter()
        .filter(|t| cache.get(&model, t).is_none())
        .cloned()
        .collect();

    if !misses.is_empty() {
        tracing::debug!(misses = misses.len(), total = texts.len(), "embedding cache misses");
        let vectors = provider.embed(&misses).await?;
        for (text, vector) in misses.iter().zip(vectors) {
            cache.insert(&model, text, vector);
        }
        cache.save()?;
    }

    texts
        .iter()
        .map(|t| {
            cache
                .get(&model, t)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("embedding missing from cache after fill"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn tokenize_drops_stopwords_and_plurals() {
        assert_eq!(
            tokenize("How many claims does each patent have?"),
            vec!["claim", "each", "patent"]
        );
        assert_eq!(tokenize("patent_citations"), vec!["patent", "citation"]);
        assert_eq!(tokenize("priorities"), vec!["priority"]);
        assert_eq!(tokenize("class"), vec!["class"]);
    }

    #[tokio::test]
    async fn hashing_is_deterministic_and_normalized() {
        let provider = HashingProvider::new(64);
        let texts = vec!["claims per patent".to_string(), "claims per patent".to_string()];
        let vectors = provider.embed(&texts).await.unwrap();
        assert_eq!(vectors[0], vectors[1]);
        assert_eq!(vectors[0].len(), 64);
        let norm: f32 = vectors[0].iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[tokio::test]
    async fn hashing_prefers_overlapping_text() {
        let provider = HashingProvider::new(512);
        let query = embed_query(&provider, "claims of each patent").await.unwrap();
        let claims = embed_query(&provider, "Table: claims\nclaim_no: claim number")
            .await
            .unwrap();
        let images = embed_query(&provider, "Table: images\nimage_url: drawing url")
            .await
            .unwrap();
        assert!(cosine_similarity(&query, &claims) > cosine_similarity(&query, &images));
    }

    #[tokio::test]
    async fn empty_text_embeds_to_zero_vector() {
        let provider = HashingProvider::new(16);
        let v = embed_query(&provider, "the of and").await.unwrap();
        assert!(v.iter().all(|x| *x == 0.0));
    }

    #[test]
    fn cosine_basics() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert!((cosine_similarity(&a, &a) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
        assert_eq!(cosine_similarity(&a, &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn parses_openai_response_in_index_order() {
        let json = serde_json::json!({
            "data": [
                { "index": 1, "embedding": [0.5, 0.5] },
                { "index": 0, "embedding": [1.0, 0.0] }
            ]
        });
        let vectors = parse_openai_response(&json, 2).unwrap();
        assert_eq!(vectors[0], vec![1.0, 0.0]);
        assert_eq!(vectors[1], vec![0.5, 0.5]);

        assert!(parse_openai_response(&json, 3).is_err());
        assert!(parse_openai_response(&serde_json::json!({}), 0).is_err());
    }

    #[tokio::test]
    async fn cache_round_trips_through_disk() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("cache").join("embeddings.json");
        let provider = HashingProvider::new(8);
        let texts = vec!["patents".to_string(), "claims".to_string()];

        let mut cache = EmbeddingCache::load(&path).unwrap();
        assert!(cache.is_empty());
        let first = embed_cached(&provider, &texts, Some(&mut cache)).await.unwrap();
        assert_eq!(cache.len(), 2);
        assert!(path.exists());

        let mut reloaded = EmbeddingCache::load(&path).unwrap();
        assert_eq!(reloaded.len(), 2);
        let second = embed_cached(&provider, &texts, Some(&mut reloaded))
            .await
            .unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn create_provider_rejects_unknown() {
        let config = EmbeddingConfig {
            provider: "word2vec".into(),
            ..EmbeddingConfig::default()
        };
        assert!(create_provider(&config).is_err());
    }
}
