//! Schema selection.
//!
//! Narrows the catalog to the tables a question needs: the top-`k`
//! retrieval hits, plus their one-hop foreign-key neighbours, bounded by
//! `max_tables`. The model can grow the context one table at a time
//! through [`expand`].

use serde::Serialize;

use crate::catalog::{SchemaCatalog, TableDescriptor};
use crate::error::ExpandError;
use crate::index::RetrievalIndex;

/// Tables shown to the model for one question, in prompt order.
///
/// Always a subset of the catalog: the only constructors are [`select`]
/// and [`expand`], which take tables from it by name.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchemaContext {
    tables: Vec<TableDescriptor>,
    max_tables: usize,
}

impl SchemaContext {
    pub fn tables(&self) -> &[TableDescriptor] {
        &self.tables
    }

    pub fn table_names(&self) -> Vec<&str> {
        self.tables.iter().map(|t| t.name.as_str()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tables.iter().any(|t| t.name.eq_ignore_ascii_case(name))
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn max_tables(&self) -> usize {
        self.max_tables
    }

    pub fn is_full(&self) -> bool {
        self.tables.len() >= self.max_tables
    }

    /// Prompt text for every table in the context.
    pub fn render(&self) -> String {
        self.tables
            .iter()
            .map(|t| t.render())
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn push(&mut self, table: &TableDescriptor) -> bool {
        if self.is_full() || self.contains(&table.name) {
            return false;
        }
        self.tables.push(table.clone());
        true
    }
}

/// Build the context for `question`.
///
/// Retrieved tables come first in rank order, then foreign-key neighbours
/// of each retrieved table in catalog order. `k` is clamped to the catalog
/// size and to `max_tables`; neighbours stop being added once the context
/// holds `max_tables` tables.
pub async fn select(
    question: &str,
    index: &RetrievalIndex,
    catalog: &SchemaCatalog,
    k: usize,
    max_tables: usize,
) -> SchemaContext {
    let max_tables = max_tables.max(1);
    let k = k.min(catalog.len()).min(max_tables);

    let mut context = SchemaContext {
        tables: Vec::new(),
        max_tables,
    };

    let hits = index.search(question, k).await;
    for hit in &hits {
        if let Some(table) = catalog.table(&hit.table) {
            context.push(table);
        }
    }

    'neighbors: for hit in &hits {
        for neighbor in catalog.neighbors(&hit.table) {
            if context.is_full() {
                break 'neighbors;
            }
            context.push(neighbor);
        }
    }

    tracing::debug!(
        k,
        tables = ?context.table_names(),
        "schema context selected"
    );
    context
}

/// Add one named table to `context`.
///
/// Returns the context unchanged when the table is already present.
pub fn expand(
    context: &SchemaContext,
    catalog: &SchemaCatalog,
    table_name: &str,
) -> Result<SchemaContext, ExpandError> {
    let table = catalog
        .table(table_name.trim())
        .ok_or_else(|| ExpandError::UnknownTable(table_name.to_string()))?;

    if context.contains(&table.name) {
        return Ok(context.clone());
    }
    if context.is_full() {
        return Err(ExpandError::ContextFull(context.max_tables));
    }

    let mut expanded = context.clone();
    expanded.push(table);
    Ok(expanded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashingProvider;
    use crate::index::IndexOptions;
    use std::sync::Arc;

    const DOCS: &str = r#"{
        "patents": {
            "table_comment": "Core patent publications.",
            "columns": { "patent_id": "Patent identifier.", "title": "Title of the invention." }
        },
        "claims": {
            "table_comment": "Numbered claims of each patent.",
            "columns": { "patent_id": "Owning patent.", "claim_no": "Claim number." }
        },
        "inventors": {
            "table_comment": "People named as inventors.",
            "columns": { "patent_id": "Owning patent.", "inventor_name": "Inventor name." }
        },
        "images": {
            "table_comment": "Drawings.",
            "columns": { "patent_id": "Owning patent.", "image_url": "Drawing URL." }
        },
        "error_logs": {
            "table_comment": "Ingestion failures.",
            "columns": { "error_message": "Message." }
        }
    }"#;

    async fn fixture() -> (SchemaCatalog, RetrievalIndex) {
        let catalog = SchemaCatalog::from_json(DOCS).unwrap();
        let index = RetrievalIndex::build(
            &catalog,
            Arc::new(HashingProvider::new(256)),
            &IndexOptions::default(),
        )
        .await
        .unwrap();
        (catalog, index)
    }

    #[tokio::test]
    async fn claims_question_pulls_in_patents() {
        let (catalog, index) = fixture().await;
        let context = select("How many claims are there?", &index, &catalog, 1, 8).await;
        assert_eq!(context.table_names()[0], "claims");
        assert!(context.contains("patents"));
    }

    #[tokio::test]
    async fn patents_expansion_adds_referencing_tables() {
        let (catalog, index) = fixture().await;
        let context = select("What does the patents table store?", &index, &catalog, 1, 8).await;
        assert_eq!(
            context.table_names(),
            vec!["patents", "claims", "inventors", "images"]
        );
    }

    #[tokio::test]
    async fn context_is_capped() {
        let (catalog, index) = fixture().await;
        let context = select("What does the patents table store?", &index, &catalog, 1, 2).await;
        assert_eq!(context.len(), 2);
        assert!(context.is_full());
        assert_eq!(context.table_names()[0], "patents");
    }

    #[tokio::test]
    async fn selection_is_deterministic_and_a_catalog_subset() {
        let (catalog, index) = fixture().await;
        let a = select("inventors of drawings", &index, &catalog, 2, 3).await;
        let b = select("inventors of drawings", &index, &catalog, 2, 3).await;
        assert_eq!(a, b);
        assert!(a.tables().iter().all(|t| catalog.contains(&t.name)));
    }

    #[tokio::test]
    async fn oversized_k_is_clamped() {
        let (catalog, index) = fixture().await;
        let context = select("anything", &index, &catalog, 100, 100).await;
        assert_eq!(context.len(), catalog.len());
    }

    #[tokio::test]
    async fn expand_adds_one_table() {
        let (catalog, index) = fixture().await;
        let context = select("error messages", &index, &catalog, 1, 8).await;
        assert_eq!(context.table_names(), vec!["error_logs"]);

        let expanded = expand(&context, &catalog, "images").unwrap();
        assert_eq!(expanded.table_names(), vec!["error_logs", "images"]);
        // Original context is untouched.
        assert_eq!(context.len(), 1);

        let again = expand(&expanded, &catalog, "IMAGES").unwrap();
        assert_eq!(again, expanded);
    }

    #[tokio::test]
    async fn expand_rejects_unknown_and_overflow() {
        let (catalog, index) = fixture().await;
        let context = select("What does the patents table store?", &index, &catalog, 1, 2).await;

        assert_eq!(
            expand(&context, &catalog, "patennts"),
            Err(ExpandError::UnknownTable("patennts".into()))
        );
        assert_eq!(
            expand(&context, &catalog, "error_logs"),
            Err(ExpandError::ContextFull(2))
        );
    }
}
