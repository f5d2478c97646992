//! Retrieval index over schema descriptions.
//!
//! Built once at startup from the [`SchemaCatalog`]: one [`RetrievalEntry`]
//! per table, or per column with [`Granularity::Column`]. Read-only at
//! query time, so one index is shared by every request.
//!
//! # Scoring
//!
//! ```text
//! hybrid = (1 - α) · keyword + α · semantic
//! ```
//!
//! - **semantic**: cosine similarity between the embedded question and the
//!   entry, aggregated per table with MAX, then min-max normalized across
//!   tables.
//! - **keyword**: fraction of the table name's tokens present in the
//!   question (`patent_citations` vs. "citations of each patent" → 1.0).
//!
//! Every table receives a score, so a question with no lexical overlap
//! still returns the nearest `k` tables. Ties fall back to catalog order.

use anyhow::{bail, Result};
use serde::Serialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use crate::catalog::SchemaCatalog;
use crate::config::{Config, Granularity};
use crate::embedding::{
    cosine_similarity, embed_cached, embed_query, tokenize, EmbeddingCache, EmbeddingProvider,
};

/// One embedded description.
#[derive(Debug, Clone)]
pub struct RetrievalEntry {
    pub table: String,
    /// Set for column-level entries.
    pub column: Option<String>,
    pub source_text: String,
    pub embedding: Vec<f32>,
}

/// Nearest-neighbour capability over entry vectors. Ids are entry positions.
pub trait VectorIndex: Send + Sync {
    /// Up to `k` `(id, similarity)` pairs, best first, ties by ascending id.
    fn nearest(&self, query: &[f32], k: usize) -> Vec<(usize, f32)>;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Brute-force cosine search over vectors held in memory.
pub struct InMemoryVectorIndex {
    vectors: Vec<Vec<f32>>,
}

impl InMemoryVectorIndex {
    pub fn new(vectors: Vec<Vec<f32>>) -> Self {
        Self { vectors }
    }
}

impl VectorIndex for InMemoryVectorIndex {
    fn nearest(&self, query: &[f32], k: usize) -> Vec<(usize, f32)> {
        let mut scored: Vec<(usize, f32)> = self
            .vectors
            .iter()
            .enumerate()
            .map(|(id, v)| (id, cosine_similarity(query, v)))
            .collect();
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        scored.truncate(k);
        scored
    }

    fn len(&self) -> usize {
        self.vectors.len()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableHit {
    pub table: String,
    pub score: f64,
}

#[derive(Debug, Clone)]
pub struct IndexOptions {
    pub granularity: Granularity,
    pub hybrid_alpha: f64,
    pub cache_path: Option<PathBuf>,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            granularity: Granularity::Table,
            hybrid_alpha: 0.6,
            cache_path: None,
        }
    }
}

impl IndexOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            granularity: config.retrieval.granularity,
            hybrid_alpha: config.retrieval.hybrid_alpha,
            cache_path: config.embedding.cache_path.clone(),
        }
    }
}

struct IndexedTable {
    name: String,
    name_tokens: Vec<String>,
}

pub struct RetrievalIndex {
    entries: Vec<RetrievalEntry>,
    /// Catalog position of each entry's table.
    entry_tables: Vec<usize>,
    vectors: Box<dyn VectorIndex>,
    tables: Vec<IndexedTable>,
    provider: Arc<dyn EmbeddingProvider>,
    hybrid_alpha: f64,
}

impl RetrievalIndex {
    /// Embed the catalog into an in-memory vector index.
    pub async fn build(
        catalog: &SchemaCatalog,
        provider: Arc<dyn EmbeddingProvider>,
        options: &IndexOptions,
    ) -> Result<Self> {
        Self::build_with(catalog, provider, options, |vectors| {
            Box::new(InMemoryVectorIndex::new(vectors))
        })
        .await
    }

    /// Like [`build`](Self::build), with a caller-supplied vector index.
    pub async fn build_with<F>(
        catalog: &SchemaCatalog,
        provider: Arc<dyn EmbeddingProvider>,
        options: &IndexOptions,
        make_index: F,
    ) -> Result<Self>
    where
        F: FnOnce(Vec<Vec<f32>>) -> Box<dyn VectorIndex>,
    {
        let mut pending: Vec<(usize, Option<String>, String)> = Vec::new();
        for (position, table) in catalog.tables().iter().enumerate() {
            match options.granularity {
                Granularity::Table => pending.push((position, None, table.retrieval_text())),
                Granularity::Column => {
                    for column in &table.columns {
                        pending.push((
                            position,
                            Some(column.name.clone()),
                            column.retrieval_text(&table.name),
                        ));
                    }
                }
            }
        }

        let texts: Vec<String> = pending.iter().map(|(_, _, text)| text.clone()).collect();
        let mut cache = match &options.cache_path {
            Some(path) => Some(EmbeddingCache::load(path)?),
            None => None,
        };
        let vectors = embed_cached(provider.as_ref(), &texts, cache.as_mut()).await?;
        if vectors.len() != texts.len() {
            bail!(
                "embedding provider returned {} vectors for {} entries",
                vectors.len(),
                texts.len()
            );
        }

        let mut entries = Vec::with_capacity(pending.len());
        let mut entry_tables = Vec::with_capacity(pending.len());
        for ((position, column, source_text), embedding) in pending.into_iter().zip(&vectors) {
            entries.push(RetrievalEntry {
                table: catalog.tables()[position].name.clone(),
                column,
                source_text,
                embedding: embedding.clone(),
            });
            entry_tables.push(position);
        }

        let tables = catalog
            .tables()
            .iter()
            .map(|t| IndexedTable {
                name: t.name.clone(),
                name_tokens: tokenize(&t.name),
            })
            .collect();

        tracing::info!(
            entries = entries.len(),
            granularity = ?options.granularity,
            model = provider.model_name(),
            "retrieval index built"
        );

        Ok(Self {
            entries,
            entry_tables,
            vectors: make_index(vectors),
            tables,
            provider,
            hybrid_alpha: options.hybrid_alpha,
        })
    }

    pub fn entries(&self) -> &[RetrievalEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Top-`k` tables for `query`, best first. `k` is clamped to the
    /// number of tables.
    pub async fn search(&self, query: &str, k: usize) -> Vec<TableHit> {
        let k = k.min(self.tables.len());
        if k == 0 {
            return Vec::new();
        }

        let semantic = self.semantic_scores(query).await;

        let query_tokens: HashSet<String> = tokenize(query).into_iter().collect();
        let alpha = self.hybrid_alpha;

        let mut hits: Vec<(usize, f64)> = self
            .tables
            .iter()
            .enumerate()
            .map(|(position, table)| {
                let keyword = keyword_score(&table.name_tokens, &query_tokens);
                (position, (1.0 - alpha) * keyword + alpha * semantic[position])
            })
            .collect();

        hits.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        hits.truncate(k);

        hits.into_iter()
            .map(|(position, score)| TableHit {
                table: self.tables[position].name.clone(),
                score,
            })
            .collect()
    }

    /// Normalized per-table semantic score; all zeros if the query
    /// cannot be embedded.
    async fn semantic_scores(&self, query: &str) -> Vec<f64> {
        let mut raw: Vec<Option<f64>> = vec![None; self.tables.len()];

        match embed_query(self.provider.as_ref(), query).await {
            Ok(query_vec) => {
                for (id, sim) in self.vectors.nearest(&query_vec, self.vectors.len()) {
                    let Some(&position) = self.entry_tables.get(id) else {
                        continue;
                    };
                    let sim = sim as f64;
                    raw[position] = Some(raw[position].map_or(sim, |best| best.max(sim)));
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "query embedding failed; ranking by table names only");
            }
        }

        normalize_scores(&raw)
    }
}

fn keyword_score(name_tokens: &[String], query_tokens: &HashSet<String>) -> f64 {
    if name_tokens.is_empty() {
        return 0.0;
    }
    let matched = name_tokens
        .iter()
        .filter(|t| query_tokens.contains(*t))
        .count();
    matched as f64 / name_tokens.len() as f64
}

/// Min-max normalization; tables without a score get 0.0, and a set of
/// identical scores normalizes to 1.0.
fn normalize_scores(raw: &[Option<f64>]) -> Vec<f64> {
    let present: Vec<f64> = raw.iter().flatten().copied().collect();
    if present.is_empty() {
        return vec![0.0; raw.len()];
    }

    let s_min = present.iter().copied().fold(f64::INFINITY, f64::min);
    let s_max = present.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    raw.iter()
        .map(|score| match score {
            None => 0.0,
            Some(_) if (s_max - s_min).abs() < f64::EPSILON => 1.0,
            Some(s) => (s - s_min) / (s_max - s_min),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashingProvider;
    use async_trait::async_trait;

    const DOCS: &str = r#"{
        "patents": {
            "table_comment": "Core patent publications with title, abstract and filing dates.",
            "columns": { "patent_id": "Patent identifier.", "title": "Title.", "abstract": "Abstract text." }
        },
        "claims": {
            "table_comment": "Numbered claims of each patent.",
            "columns": { "patent_id": "Owning patent.", "claim_no": "Claim number.", "claim_txt": "Claim text." }
        },
        "inventors": {
            "table_comment": "People named as inventors.",
            "columns": { "patent_id": "Owning patent.", "inventor_name": "Inventor full name." }
        },
        "images": {
            "table_comment": "Drawings attached to a patent.",
            "columns": { "patent_id": "Owning patent.", "image_url": "URL of the drawing." }
        }
    }"#;

    fn catalog() -> SchemaCatalog {
        SchemaCatalog::from_json(DOCS).unwrap()
    }

    async fn hashing_index(granularity: Granularity) -> RetrievalIndex {
        let options = IndexOptions {
            granularity,
            ..IndexOptions::default()
        };
        RetrievalIndex::build(&catalog(), Arc::new(HashingProvider::new(256)), &options)
            .await
            .unwrap()
    }

    /// Embeds everything to the same vector.
    struct ConstantProvider;

    #[async_trait]
    impl EmbeddingProvider for ConstantProvider {
        fn model_name(&self) -> &str {
            "constant"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
    }

    /// Embeds catalog entries, fails on anything else.
    struct CatalogOnlyProvider;

    #[async_trait]
    impl EmbeddingProvider for CatalogOnlyProvider {
        fn model_name(&self) -> &str {
            "catalog-only"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            if texts.iter().any(|t| !t.starts_with("Table:")) {
                bail!("embedding service unavailable");
            }
            Ok(texts.iter().map(|_| vec![0.0, 1.0]).collect())
        }
    }

    #[tokio::test]
    async fn returns_at_most_k_ranked_hits() {
        let index = hashing_index(Granularity::Table).await;
        assert_eq!(index.len(), 4);

        let hits = index.search("How many claims does each patent have?", 2).await;
        assert_eq!(hits.len(), 2);
        assert!(hits[0].score >= hits[1].score);
        let names: Vec<&str> = hits.iter().map(|h| h.table.as_str()).collect();
        assert!(names.contains(&"claims"));
    }

    #[tokio::test]
    async fn single_table_question_ranks_that_table_first() {
        let index = hashing_index(Granularity::Table).await;
        let hits = index.search("What does the patents table store?", 1).await;
        assert_eq!(hits[0].table, "patents");
    }

    #[tokio::test]
    async fn k_is_clamped_to_catalog_size() {
        let index = hashing_index(Granularity::Table).await;
        assert_eq!(index.search("patents", 50).await.len(), 4);
        assert!(index.search("patents", 0).await.is_empty());
    }

    #[tokio::test]
    async fn no_overlap_still_returns_results() {
        let index = hashing_index(Granularity::Table).await;
        let hits = index.search("zxqv wplk", 3).await;
        assert_eq!(hits.len(), 3);
    }

    #[tokio::test]
    async fn search_is_deterministic() {
        let index = hashing_index(Granularity::Table).await;
        let a = index.search("inventor names on drawings", 3).await;
        let b = index.search("inventor names on drawings", 3).await;
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn ties_follow_catalog_order() {
        let index = RetrievalIndex::build(
            &catalog(),
            Arc::new(ConstantProvider),
            &IndexOptions::default(),
        )
        .await
        .unwrap();
        let hits = index.search("zxqv", 4).await;
        let names: Vec<&str> = hits.iter().map(|h| h.table.as_str()).collect();
        assert_eq!(names, vec!["patents", "claims", "inventors", "images"]);
    }

    #[tokio::test]
    async fn empty_catalog_returns_nothing() {
        let empty = SchemaCatalog::from_json("{}").unwrap();
        let index = RetrievalIndex::build(
            &empty,
            Arc::new(HashingProvider::new(16)),
            &IndexOptions::default(),
        )
        .await
        .unwrap();
        assert!(index.is_empty());
        assert!(index.search("anything", 5).await.is_empty());
    }

    #[tokio::test]
    async fn column_granularity_aggregates_per_table() {
        let index = hashing_index(Granularity::Column).await;
        assert_eq!(index.len(), 10);
        assert!(index.entries().iter().all(|e| e.column.is_some()));

        let hits = index.search("inventor full name", 4).await;
        assert_eq!(hits.len(), 4);
        let unique: HashSet<&str> = hits.iter().map(|h| h.table.as_str()).collect();
        assert_eq!(unique.len(), 4);
        assert_eq!(hits[0].table, "inventors");
    }

    #[tokio::test]
    async fn query_embedding_failure_falls_back_to_names() {
        let index = RetrievalIndex::build(
            &catalog(),
            Arc::new(CatalogOnlyProvider),
            &IndexOptions::default(),
        )
        .await
        .unwrap();
        let hits = index.search("list the images", 2).await;
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].table, "images");
        assert_eq!(hits[1].table, "patents");
    }

    #[test]
    fn in_memory_index_orders_by_similarity() {
        let index = InMemoryVectorIndex::new(vec![vec![0.0, 1.0], vec![1.0, 0.0], vec![1.0, 0.0]]);
        let nearest = index.nearest(&[1.0, 0.0], 2);
        assert_eq!(nearest.iter().map(|(id, _)| *id).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(index.len(), 3);
    }

    #[test]
    fn normalize_handles_missing_and_equal_scores() {
        assert_eq!(normalize_scores(&[Some(0.2), None, Some(0.6)]), vec![0.0, 0.0, 1.0]);
        assert_eq!(normalize_scores(&[Some(0.5), Some(0.5)]), vec![1.0, 1.0]);
        assert_eq!(normalize_scores(&[None, None]), vec![0.0, 0.0]);
    }
}
