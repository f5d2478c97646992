//! Schema catalog.
//!
//! An immutable, in-memory description of every table and column in the
//! patent database, imported once at startup from a schema-documentation
//! JSON file. Components receive it as `Arc<SchemaCatalog>`; nothing
//! mutates it after [`SchemaCatalog::new`] validates it.
//!
//! # Import format
//!
//! ```json
//! {
//!   "patents": {
//!     "table_comment": "One row per patent publication.",
//!     "columns": {
//!       "patent_id": "Unique identifier of the patent.",
//!       "filing_date": "Date the application was filed.",
//!       "claim_count": { "comment": "Number of claims.", "type": "integer" }
//!     }
//!   },
//!   "claims": {
//!     "table_comment": "Individual claims.",
//!     "columns": {
//!       "patent_id": { "comment": "Owning patent.", "references": "patents.patent_id" },
//!       "claim_no": { "comment": "Claim number.", "type": "integer", "nullable": false }
//!     }
//!   }
//! }
//! ```
//!
//! Plain-string columns get two inferences: `date`/`*_date` columns are
//! typed as dates, and a `<name>_id` column that is also declared by a
//! table called `<name>s` becomes a foreign key into that table.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use crate::error::CatalogError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SemanticType {
    #[default]
    Text,
    Integer,
    Real,
    Date,
    #[serde(alias = "boolean", alias = "bool")]
    Flag,
}

impl fmt::Display for SemanticType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SemanticType::Text => "text",
            SemanticType::Integer => "integer",
            SemanticType::Real => "real",
            SemanticType::Date => "date",
            SemanticType::Flag => "flag",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForeignKey {
    pub table: String,
    pub column: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnDescriptor {
    pub name: String,
    pub semantic_type: SemanticType,
    pub comment: String,
    pub nullable: bool,
    pub references: Option<ForeignKey>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableDescriptor {
    pub name: String,
    pub comment: String,
    pub columns: Vec<ColumnDescriptor>,
}

impl TableDescriptor {
    pub fn column(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Tables this table points at, in column order, without repeats.
    pub fn referenced_tables(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        for fk in self.columns.iter().filter_map(|c| c.references.as_ref()) {
            if !out.iter().any(|t| t.eq_ignore_ascii_case(&fk.table)) {
                out.push(fk.table.as_str());
            }
        }
        out
    }

    /// Text embedded for table-level retrieval.
    pub fn retrieval_text(&self) -> String {
        let mut text = format!("Table: {}\nComment: {}\nColumns:", self.name, self.comment);
        for column in &self.columns {
            text.push('\n');
            text.push_str(&column.name);
            text.push_str(": ");
            text.push_str(&column.comment);
        }
        text
    }

    /// Prompt rendering: one line per column with type, nullability and
    /// foreign key.
    pub fn render(&self) -> String {
        let mut out = format!("TABLE {} -- {}\n", self.name, self.comment);
        for column in &self.columns {
            out.push_str(&format!("  {} {}", column.name, column.semantic_type));
            if !column.nullable {
                out.push_str(" NOT NULL");
            }
            if let Some(fk) = &column.references {
                out.push_str(&format!(" REFERENCES {}({})", fk.table, fk.column));
            }
            if !column.comment.is_empty() {
                out.push_str(&format!(" -- {}", column.comment));
            }
            out.push('\n');
        }
        out
    }
}

impl ColumnDescriptor {
    /// Text embedded for column-level retrieval.
    pub fn retrieval_text(&self, table: &str) -> String {
        format!(
            "Table: {}\nColumn: {}\nComment: {}",
            table, self.name, self.comment
        )
    }
}

/// Validated, immutable catalog of tables in declaration order.
#[derive(Debug, Clone)]
pub struct SchemaCatalog {
    tables: Vec<TableDescriptor>,
    positions: HashMap<String, usize>,
}

impl SchemaCatalog {
    /// Build a catalog, rejecting duplicate names and dangling foreign keys.
    pub fn new(tables: Vec<TableDescriptor>) -> Result<Self, CatalogError> {
        let mut positions = HashMap::with_capacity(tables.len());
        for (i, table) in tables.iter().enumerate() {
            if positions.insert(table.name.to_lowercase(), i).is_some() {
                return Err(CatalogError::DuplicateTable(table.name.clone()));
            }
            let mut seen = std::collections::HashSet::new();
            for column in &table.columns {
                if !seen.insert(column.name.to_lowercase()) {
                    return Err(CatalogError::DuplicateColumn {
                        table: table.name.clone(),
                        column: column.name.clone(),
                    });
                }
            }
        }

        let catalog = Self { tables, positions };
        catalog.check_integrity()?;
        Ok(catalog)
    }

    fn check_integrity(&self) -> Result<(), CatalogError> {
        for table in &self.tables {
            for column in &table.columns {
                let Some(fk) = &column.references else {
                    continue;
                };
                let target = self.table(&fk.table).ok_or_else(|| CatalogError::MissingTable {
                    table: table.name.clone(),
                    column: column.name.clone(),
                    target: fk.table.clone(),
                })?;
                if target.column(&fk.column).is_none() {
                    return Err(CatalogError::MissingColumn {
                        table: table.name.clone(),
                        column: column.name.clone(),
                        target_table: fk.table.clone(),
                        target_column: fk.column.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let content = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&content)
    }

    /// Parse the schema-docs JSON format described in the module docs.
    pub fn from_json(content: &str) -> Result<Self, CatalogError> {
        let raw: serde_json::Map<String, serde_json::Value> = serde_json::from_str(content)?;

        let mut parsed: Vec<(String, RawTable)> = Vec::with_capacity(raw.len());
        for (name, value) in raw {
            let table: RawTable = serde_json::from_value(value)?;
            parsed.push((name, table));
        }

        // Declared columns per table, used for foreign-key inference.
        let declared: Vec<(String, Vec<String>)> = parsed
            .iter()
            .map(|(name, t)| (name.to_lowercase(), t.columns.keys().cloned().collect()))
            .collect();

        let mut tables = Vec::with_capacity(parsed.len());
        for (name, raw_table) in parsed {
            let mut columns = Vec::with_capacity(raw_table.columns.len());
            for (column_name, raw_value) in raw_table.columns {
                let raw_column: RawColumn = serde_json::from_value(raw_value)?;
                columns.push(raw_column.into_descriptor(&name, column_name, &declared)?);
            }
            tables.push(TableDescriptor {
                name,
                comment: raw_table.table_comment,
                columns,
            });
        }

        Self::new(tables)
    }

    pub fn tables(&self) -> &[TableDescriptor] {
        &self.tables
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Case-insensitive lookup.
    pub fn table(&self, name: &str) -> Option<&TableDescriptor> {
        self.position(name).map(|i| &self.tables[i])
    }

    /// Declaration index of a table, used for deterministic ordering.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.positions.get(&name.to_lowercase()).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    /// Tables one foreign-key hop away from `name` in either direction,
    /// in catalog order.
    pub fn neighbors(&self, name: &str) -> Vec<&TableDescriptor> {
        let Some(table) = self.table(name) else {
            return Vec::new();
        };
        let outgoing = table.referenced_tables();

        self.tables
            .iter()
            .filter(|candidate| !candidate.name.eq_ignore_ascii_case(&table.name))
            .filter(|candidate| {
                let points_at = outgoing
                    .iter()
                    .any(|t| t.eq_ignore_ascii_case(&candidate.name));
                let pointed_from = candidate
                    .referenced_tables()
                    .iter()
                    .any(|t| t.eq_ignore_ascii_case(&table.name));
                points_at || pointed_from
            })
            .collect()
    }

    /// Stable digest of the retrieval texts, used to key embedding caches.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for table in &self.tables {
            hasher.update(table.retrieval_text().as_bytes());
            hasher.update([0u8]);
        }
        hex::encode(hasher.finalize())
    }
}

#[derive(Deserialize)]
struct RawTable {
    #[serde(default)]
    table_comment: String,
    #[serde(default)]
    columns: serde_json::Map<String, serde_json::Value>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawColumn {
    Comment(String),
    Detailed {
        #[serde(default)]
        comment: String,
        #[serde(rename = "type")]
        semantic_type: Option<SemanticType>,
        #[serde(default = "default_nullable")]
        nullable: bool,
        #[serde(default)]
        references: Option<String>,
    },
}

fn default_nullable() -> bool {
    true
}

impl RawColumn {
    fn into_descriptor(
        self,
        table: &str,
        name: String,
        declared: &[(String, Vec<String>)],
    ) -> Result<ColumnDescriptor, CatalogError> {
        match self {
            RawColumn::Comment(comment) => Ok(ColumnDescriptor {
                semantic_type: infer_type(&name),
                references: infer_reference(table, &name, declared),
                nullable: true,
                name,
                comment,
            }),
            RawColumn::Detailed {
                comment,
                semantic_type,
                nullable,
                references,
            } => {
                let references = match references {
                    Some(reference) => Some(parse_reference(table, &name, &reference)?),
                    None => infer_reference(table, &name, declared),
                };
                Ok(ColumnDescriptor {
                    semantic_type: semantic_type.unwrap_or_else(|| infer_type(&name)),
                    nullable,
                    references,
                    name,
                    comment,
                })
            }
        }
    }
}

fn infer_type(column: &str) -> SemanticType {
    let lower = column.to_lowercase();
    if lower == "date" || lower.ends_with("_date") {
        SemanticType::Date
    } else {
        SemanticType::Text
    }
}

fn infer_reference(
    table: &str,
    column: &str,
    declared: &[(String, Vec<String>)],
) -> Option<ForeignKey> {
    let lower = column.to_lowercase();
    let stem = lower.strip_suffix("_id")?;
    let target = format!("{}s", stem);
    if target == table.to_lowercase() {
        return None;
    }
    declared
        .iter()
        .find(|(name, columns)| {
            *name == target && columns.iter().any(|c| c.eq_ignore_ascii_case(column))
        })
        .map(|(name, _)| ForeignKey {
            table: name.clone(),
            column: column.to_string(),
        })
}

fn parse_reference(table: &str, column: &str, reference: &str) -> Result<ForeignKey, CatalogError> {
    match reference.split_once('.') {
        Some((t, c)) if !t.trim().is_empty() && !c.trim().is_empty() => Ok(ForeignKey {
            table: t.trim().to_string(),
            column: c.trim().to_string(),
        }),
        _ => Err(CatalogError::InvalidReference {
            table: table.to_string(),
            column: column.to_string(),
            reference: reference.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOCS: &str = r#"{
        "patents": {
            "table_comment": "Patent publications.",
            "columns": {
                "patent_id": "Unique patent identifier.",
                "title": "Title of the invention.",
                "filing_date": "Date the application was filed."
            }
        },
        "claims": {
            "table_comment": "Claims of each patent.",
            "columns": {
                "id": { "comment": "Row id.", "type": "integer", "nullable": false },
                "patent_id": "Patent the claim belongs to.",
                "claim_no": { "comment": "Claim number.", "type": "integer" },
                "claim_txt": "Claim text."
            }
        },
        "inventors": {
            "table_comment": "Inventors.",
            "columns": {
                "patent_id": { "comment": "Patent.", "references": "patents.patent_id" },
                "inventor_name": "Name."
            }
        },
        "error_logs": {
            "table_comment": "Ingestion errors.",
            "columns": { "error_message": "Message." }
        }
    }"#;

    #[test]
    fn preserves_declaration_order() {
        let catalog = SchemaCatalog::from_json(DOCS).unwrap();
        let names: Vec<&str> = catalog.tables().iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["patents", "claims", "inventors", "error_logs"]);

        let claims = catalog.table("claims").unwrap();
        let cols: Vec<&str> = claims.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(cols, vec!["id", "patent_id", "claim_no", "claim_txt"]);
    }

    #[test]
    fn infers_foreign_keys_and_dates() {
        let catalog = SchemaCatalog::from_json(DOCS).unwrap();
        let claims = catalog.table("claims").unwrap();
        let fk = claims.column("patent_id").unwrap().references.clone().unwrap();
        assert_eq!(fk.table, "patents");
        assert_eq!(fk.column, "patent_id");

        // The owning table never references itself.
        let patents = catalog.table("patents").unwrap();
        assert!(patents.column("patent_id").unwrap().references.is_none());
        assert_eq!(
            patents.column("filing_date").unwrap().semantic_type,
            SemanticType::Date
        );
        assert_eq!(
            claims.column("claim_no").unwrap().semantic_type,
            SemanticType::Integer
        );
        assert!(!claims.column("id").unwrap().nullable);
    }

    #[test]
    fn neighbors_cover_both_directions() {
        let catalog = SchemaCatalog::from_json(DOCS).unwrap();

        let from_claims: Vec<&str> = catalog
            .neighbors("claims")
            .iter()
            .map(|t| t.name.as_str())
            .collect();
        assert_eq!(from_claims, vec!["patents"]);

        let from_patents: Vec<&str> = catalog
            .neighbors("patents")
            .iter()
            .map(|t| t.name.as_str())
            .collect();
        assert_eq!(from_patents, vec!["claims", "inventors"]);

        assert!(catalog.neighbors("error_logs").is_empty());
        assert!(catalog.neighbors("missing").is_empty());
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let catalog = SchemaCatalog::from_json(DOCS).unwrap();
        assert!(catalog.contains("PATENTS"));
        assert_eq!(catalog.position("Claims"), Some(1));
        assert!(!catalog.contains("patennts"));
    }

    #[test]
    fn dangling_reference_is_fatal() {
        let docs = r#"{
            "claims": {
                "table_comment": "Claims.",
                "columns": {
                    "patent_id": { "comment": "Patent.", "references": "patents.patent_id" }
                }
            }
        }"#;
        match SchemaCatalog::from_json(docs) {
            Err(CatalogError::MissingTable { target, .. }) => assert_eq!(target, "patents"),
            other => panic!("expected MissingTable, got {:?}", other),
        }
    }

    #[test]
    fn reference_to_missing_column_is_fatal() {
        let docs = r#"{
            "patents": { "table_comment": "", "columns": { "patent_id": "" } },
            "claims": {
                "table_comment": "",
                "columns": { "patent_id": { "references": "patents.number" } }
            }
        }"#;
        assert!(matches!(
            SchemaCatalog::from_json(docs),
            Err(CatalogError::MissingColumn { .. })
        ));
    }

    #[test]
    fn malformed_reference_is_rejected() {
        let docs = r#"{
            "claims": { "table_comment": "", "columns": { "patent_id": { "references": "patents" } } }
        }"#;
        assert!(matches!(
            SchemaCatalog::from_json(docs),
            Err(CatalogError::InvalidReference { .. })
        ));
    }

    #[test]
    fn duplicate_tables_are_rejected() {
        let table = TableDescriptor {
            name: "patents".into(),
            comment: String::new(),
            columns: vec![],
        };
        let err = SchemaCatalog::new(vec![table.clone(), table]).unwrap_err();
        assert!(matches!(err, CatalogError::DuplicateTable(_)));
    }

    #[test]
    fn empty_catalog_is_valid() {
        let catalog = SchemaCatalog::from_json("{}").unwrap();
        assert!(catalog.is_empty());
    }

    #[test]
    fn render_includes_types_and_references() {
        let catalog = SchemaCatalog::from_json(DOCS).unwrap();
        let rendered = catalog.table("claims").unwrap().render();
        assert!(rendered.starts_with("TABLE claims -- Claims of each patent."));
        assert!(rendered.contains("patent_id text REFERENCES patents(patent_id)"));
        assert!(rendered.contains("id integer NOT NULL"));
    }

    #[test]
    fn retrieval_text_lists_columns() {
        let catalog = SchemaCatalog::from_json(DOCS).unwrap();
        let text = catalog.table("patents").unwrap().retrieval_text();
        assert!(text.starts_with("Table: patents\nComment: Patent publications.\nColumns:"));
        assert!(text.contains("\ntitle: Title of the invention."));
    }

    #[test]
    fn fingerprint_is_stable() {
        let a = SchemaCatalog::from_json(DOCS).unwrap();
        let b = SchemaCatalog::from_json(DOCS).unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().len(), 64);
    }
}
