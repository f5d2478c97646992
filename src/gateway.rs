//! Safe execution gateway.
//!
//! Every candidate statement passes these checks before a connection is
//! borrowed:
//!
//! 1. The leading keyword is not a data- or schema-modifying verb
//!    (`INSERT`, `UPDATE`, `DELETE`, `DROP`, `ALTER`, `CREATE`, `PRAGMA`, ...).
//! 2. The text parses (SQLite dialect) as exactly one statement, and that
//!    statement is a query whose body contains only `SELECT`/`VALUES`/set
//!    operations, with no `SELECT ... INTO`.
//! 3. Every relation it reads is a catalog table or a CTE defined in the
//!    statement.
//! 4. A `LIMIT row_limit + 1` is appended when the query has none, so the
//!    database can report truncation without producing unbounded output.
//!
//! Failures in (1) and (2, non-query) are [`ExecutionError::Unsafe`] and end
//! the request. Parse failures are `syntax-error` and unknown relations are
//! `unknown-table`; both are recoverable.

use serde::Serialize;
use sqlparser::ast::{Expr, ObjectName, Query, SetExpr, Statement, TableFactor, Visit, Visitor};
use sqlparser::dialect::SQLiteDialect;
use sqlparser::parser::Parser;
use std::collections::HashSet;
use std::ops::ControlFlow;
use std::sync::Arc;

use crate::catalog::SchemaCatalog;
use crate::db::ReadOnlyDatabase;
use crate::error::{DbError, DbErrorKind, ExecutionError};
use crate::models::RowSet;

const FORBIDDEN_LEADING_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "ALTER", "CREATE", "REPLACE", "UPSERT", "MERGE",
    "TRUNCATE", "ATTACH", "DETACH", "PRAGMA", "VACUUM", "REINDEX", "ANALYZE", "BEGIN", "COMMIT",
    "END", "ROLLBACK", "SAVEPOINT", "RELEASE", "GRANT", "REVOKE",
];

/// SQLite table-valued functions that read no stored data.
const ALLOWED_TABLE_FUNCTIONS: &[&str] = &["json_each", "json_tree"];

/// A statement that passed every precondition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidatedStatement {
    /// Text as received.
    pub original: String,
    /// Text sent to the database.
    pub executable: String,
    /// Catalog tables read, lowercased, in first-seen order.
    pub tables: Vec<String>,
    pub limit_appended: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Execution {
    pub statement: ValidatedStatement,
    pub rows: RowSet,
}

pub type ExecutionOutcome = Result<Execution, ExecutionError>;

pub struct SqlGateway {
    catalog: Arc<SchemaCatalog>,
    database: Arc<dyn ReadOnlyDatabase>,
    row_limit: usize,
}

impl SqlGateway {
    pub fn new(
        catalog: Arc<SchemaCatalog>,
        database: Arc<dyn ReadOnlyDatabase>,
        row_limit: usize,
    ) -> Self {
        Self {
            catalog,
            database,
            row_limit: row_limit.max(1),
        }
    }

    pub fn row_limit(&self) -> usize {
        self.row_limit
    }

    /// Validate, then run against the read-only database.
    pub async fn execute(&self, sql: &str) -> ExecutionOutcome {
        let statement = self.validate(sql)?;
        tracing::debug!(sql = %statement.executable, tables = ?statement.tables, "executing");

        let rows = self
            .database
            .execute_readonly(&statement.executable, self.row_limit)
            .await?;

        Ok(Execution { statement, rows })
    }

    /// Precondition checks only; never touches the database.
    pub fn validate(&self, sql: &str) -> Result<ValidatedStatement, ExecutionError> {
        let text = sql.trim().trim_end_matches(|c: char| c == ';' || c.is_whitespace());
        if text.is_empty() {
            return Err(DbError::new(DbErrorKind::SyntaxError, "empty statement").into());
        }

        let leading = leading_keyword(text);
        if let Some(keyword) = FORBIDDEN_LEADING_KEYWORDS
            .iter()
            .find(|k| k.eq_ignore_ascii_case(&leading))
        {
            return Err(ExecutionError::Unsafe(format!(
                "{} statements are not permitted; only SELECT is allowed",
                keyword
            )));
        }

        let statements = Parser::parse_sql(&SQLiteDialect {}, text)
            .map_err(|e| DbError::new(DbErrorKind::SyntaxError, e.to_string()))?;

        let statement = match statements.as_slice() {
            [] => return Err(DbError::new(DbErrorKind::SyntaxError, "empty statement").into()),
            [single] => single,
            _ => {
                return Err(ExecutionError::Unsafe(format!(
                    "expected a single statement, found {}",
                    statements.len()
                )))
            }
        };

        let query = match statement {
            Statement::Query(query) => query,
            _ => {
                return Err(ExecutionError::Unsafe(format!(
                    "only SELECT statements are permitted, got '{}'",
                    leading.to_uppercase()
                )))
            }
        };

        if !is_read_only(&query.body) {
            return Err(ExecutionError::Unsafe(
                "query body contains a data-modifying clause".to_string(),
            ));
        }

        let tables = self.check_relations(statement)?;

        let limit_appended = query.limit.is_none() && query.fetch.is_none();
        let executable = if limit_appended {
            format!("{} LIMIT {}", statement, self.row_limit + 1)
        } else {
            statement.to_string()
        };

        Ok(ValidatedStatement {
            original: sql.to_string(),
            executable,
            tables,
            limit_appended,
        })
    }

    fn check_relations(&self, statement: &Statement) -> Result<Vec<String>, ExecutionError> {
        let mut collector = RelationCollector::default();
        // The collector never breaks.
        let _ = statement.visit(&mut collector);

        let mut tables = Vec::new();
        for relation in collector.relations {
            if collector.ctes.contains(&relation)
                || ALLOWED_TABLE_FUNCTIONS.contains(&relation.as_str())
            {
                continue;
            }
            if !self.catalog.contains(&relation) {
                return Err(DbError::new(
                    DbErrorKind::UnknownTable,
                    format!("no such table: {}", relation),
                )
                .into());
            }
            if !tables.contains(&relation) {
                tables.push(relation);
            }
        }
        Ok(tables)
    }
}

/// First word of the statement, skipping comments and opening parentheses.
fn leading_keyword(sql: &str) -> String {
    let mut rest = sql.trim_start();
    loop {
        if let Some(after) = rest.strip_prefix("--") {
            rest = after.split_once('\n').map_or("", |(_, tail)| tail).trim_start();
        } else if let Some(after) = rest.strip_prefix("/*") {
            rest = after.split_once("*/").map_or("", |(_, tail)| tail).trim_start();
        } else if let Some(after) = rest.strip_prefix('(') {
            rest = after.trim_start();
        } else {
            break;
        }
    }
    rest.chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect()
}

fn is_read_only(body: &SetExpr) -> bool {
    match body {
        SetExpr::Select(select) => select.into.is_none(),
        SetExpr::Query(query) => is_read_only(&query.body),
        SetExpr::SetOperation { left, right, .. } => is_read_only(left) && is_read_only(right),
        SetExpr::Values(_) | SetExpr::Table(_) => true,
        _ => false,
    }
}

/// Relation names read by a statement, plus every CTE name it defines.
#[derive(Default)]
struct RelationCollector {
    relations: Vec<String>,
    ctes: HashSet<String>,
}

impl RelationCollector {
    /// Record the CTE names of `query` and of the queries nested in its
    /// `WITH` clause, set operations and derived tables. Subqueries inside
    /// expressions are reached through `pre_visit_expr`.
    fn collect_ctes(&mut self, query: &Query) {
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                self.ctes.insert(cte.alias.name.value.to_lowercase());
                self.collect_ctes(&cte.query);
            }
        }
        self.collect_body_ctes(&query.body);
    }

    fn collect_body_ctes(&mut self, body: &SetExpr) {
        match body {
            SetExpr::Query(query) => self.collect_ctes(query),
            SetExpr::SetOperation { left, right, .. } => {
                self.collect_body_ctes(left);
                self.collect_body_ctes(right);
            }
            SetExpr::Select(select) => {
                for from in &select.from {
                    self.collect_factor_ctes(&from.relation);
                    for join in &from.joins {
                        self.collect_factor_ctes(&join.relation);
                    }
                }
            }
            _ => {}
        }
    }

    fn collect_factor_ctes(&mut self, factor: &TableFactor) {
        match factor {
            TableFactor::Derived { subquery, .. } => self.collect_ctes(subquery),
            TableFactor::NestedJoin {
                table_with_joins, ..
            } => {
                self.collect_factor_ctes(&table_with_joins.relation);
                for join in &table_with_joins.joins {
                    self.collect_factor_ctes(&join.relation);
                }
            }
            _ => {}
        }
    }
}

impl Visitor for RelationCollector {
    type Break = ();

    fn pre_visit_statement(&mut self, statement: &Statement) -> ControlFlow<Self::Break> {
        if let Statement::Query(query) = statement {
            self.collect_ctes(query);
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<Self::Break> {
        match expr {
            Expr::Subquery(query)
            | Expr::InSubquery {
                subquery: query, ..
            }
            | Expr::Exists {
                subquery: query, ..
            } => self.collect_ctes(query),
            _ => {}
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_relation(&mut self, relation: &ObjectName) -> ControlFlow<Self::Break> {
        // `main.patents` and `patents` name the same table.
        if let Some(ident) = relation.0.last() {
            self.relations.push(ident.value.to_lowercase());
        }
        ControlFlow::Continue(())
    }
}
