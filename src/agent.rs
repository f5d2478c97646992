//! SQL generation agent.
//!
//! A stateless wrapper around the language model: every call receives the
//! question, the current [`SchemaContext`], and the full list of prior
//! attempts, and yields an [`AgentResponse`]. The model answers through one
//! of two tools:
//!
//! | Tool | Arguments | Response |
//! |------|-----------|----------|
//! | `run_sql` | `{"sql": "..."}` | [`AgentResponse::Candidate`] |
//! | `include_table` | `{"table_name": "..."}` | [`AgentResponse::Expand`] |
//!
//! A plain-text reply is accepted as a candidate once code fences and a
//! leading `SQL:` label are stripped.

use std::sync::Arc;
use std::time::Duration;

use crate::catalog::SchemaCatalog;
use crate::error::ModelError;
use crate::llm::{Completion, LanguageModel, Prompt, ToolDefinition};
use crate::models::{AttemptOutcome, QueryAttempt};
use crate::selector::SchemaContext;

pub const RUN_SQL_TOOL: &str = "run_sql";
pub const INCLUDE_TABLE_TOOL: &str = "include_table";

const SYSTEM_PROMPT: &str = "You are an expert SQLite analyst answering questions about a patent database.
Rules:
- Write exactly one read-only SELECT statement. WITH ... SELECT is allowed. Never modify data or schema.
- Use only the tables and columns listed under SCHEMA. If the question needs a table listed under OTHER TABLES, call include_table with its name instead of guessing its columns.
- Join child tables to patents through the columns marked REFERENCES.
- Let SQL compute every number (COUNT, SUM, AVG, MIN, MAX). Do not compute values yourself.
- Return only the columns needed to answer, and add a LIMIT when listing rows.
- Submit the statement by calling run_sql.";

/// Words a plain-text reply may start with to be taken as SQL.
const SQL_LEADING_KEYWORDS: &[&str] = &[
    "SELECT", "WITH", "VALUES", "EXPLAIN", "INSERT", "UPDATE", "DELETE", "REPLACE", "UPSERT",
    "DROP", "ALTER", "CREATE", "ATTACH", "DETACH", "PRAGMA", "VACUUM", "REINDEX", "ANALYZE",
    "BEGIN", "COMMIT", "ROLLBACK", "SAVEPOINT", "RELEASE", "TRUNCATE",
];

/// What the model wants to do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentResponse {
    Candidate { sql: String },
    Expand { table_name: String },
}

pub struct SqlAgent {
    model: Arc<dyn LanguageModel>,
    timeout: Duration,
}

impl SqlAgent {
    pub fn new(model: Arc<dyn LanguageModel>, timeout: Duration) -> Self {
        Self { model, timeout }
    }

    pub fn model(&self) -> &Arc<dyn LanguageModel> {
        &self.model
    }

    /// One model call, bounded by the configured timeout.
    pub async fn generate(
        &self,
        question: &str,
        context: &SchemaContext,
        catalog: &SchemaCatalog,
        prior_attempts: &[QueryAttempt],
    ) -> Result<AgentResponse, ModelError> {
        let prompt = build_prompt(question, context, catalog, prior_attempts);
        let tools = tool_definitions();

        let completion = tokio::time::timeout(self.timeout, self.model.complete(&prompt, &tools))
            .await
            .map_err(|_| ModelError::Timeout(self.timeout))??;

        interpret(completion)
    }
}

pub fn tool_definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: RUN_SQL_TOOL.to_string(),
            description: "Execute one read-only SQLite SELECT statement against the patent database."
                .to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "sql": { "type": "string", "description": "A single SELECT statement." }
                },
                "required": ["sql"]
            }),
        },
        ToolDefinition {
            name: INCLUDE_TABLE_TOOL.to_string(),
            description: "Add the full column description of one more table to the schema."
                .to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "table_name": { "type": "string", "description": "Name from OTHER TABLES." }
                },
                "required": ["table_name"]
            }),
        },
    ]
}

/// Assemble the prompt. Tables outside the context are listed by name only.
pub fn build_prompt(
    question: &str,
    context: &SchemaContext,
    catalog: &SchemaCatalog,
    prior_attempts: &[QueryAttempt],
) -> Prompt {
    let mut user = format!("QUESTION:\n{}\n\nSCHEMA:\n", question.trim());
    if context.is_empty() {
        user.push_str("(no tables selected yet)\n");
    } else {
        user.push_str(&context.render());
    }

    let others: Vec<&str> = catalog
        .tables()
        .iter()
        .filter(|t| !context.contains(&t.name))
        .map(|t| t.name.as_str())
        .collect();
    if !others.is_empty() {
        user.push_str("\nOTHER TABLES (call include_table to see their columns):\n");
        user.push_str(&others.join(", "));
        user.push('\n');
    }

    if !prior_attempts.is_empty() {
        user.push_str("\nPREVIOUS ATTEMPTS:\n");
        for attempt in prior_attempts {
            user.push_str(&format!("Attempt {}:\n", attempt.index + 1));
            match &attempt.sql {
                Some(sql) => user.push_str(&format!("SQL: {}\n", sql)),
                None => user.push_str("SQL: (none)\n"),
            }
            match &attempt.outcome {
                AttemptOutcome::Failure { kind, message } => {
                    user.push_str(&format!("Error ({}): {}\n", kind, message));
                }
                AttemptOutcome::Success { row_count, .. } => {
                    user.push_str(&format!("Succeeded with {} rows.\n", row_count));
                }
            }
        }
        user.push_str("Fix the error above and try again.\n");
    }

    Prompt {
        system: SYSTEM_PROMPT.to_string(),
        user,
    }
}

/// Map a raw completion onto the tool protocol.
pub fn interpret(completion: Completion) -> Result<AgentResponse, ModelError> {
    match completion {
        Completion::ToolCall { name, arguments } => match name.as_str() {
            RUN_SQL_TOOL => {
                let sql = string_argument(&arguments, "sql")?;
                extract_sql(&sql)
                    .map(|sql| AgentResponse::Candidate { sql })
                    .ok_or_else(|| ModelError::Malformed("run_sql called with empty sql".into()))
            }
            INCLUDE_TABLE_TOOL => {
                let table_name = string_argument(&arguments, "table_name")?;
                Ok(AgentResponse::Expand {
                    table_name: table_name.trim().to_string(),
                })
            }
            other => Err(ModelError::Malformed(format!("unknown tool '{}'", other))),
        },
        Completion::Text(text) => extract_sql(&text)
            .filter(|sql| looks_like_sql(sql))
            .map(|sql| AgentResponse::Candidate { sql })
            .ok_or_else(|| {
                ModelError::Malformed(format!(
                    "expected a SQL statement or a tool call, got: {}",
                    text.chars().take(120).collect::<String>()
                ))
            }),
    }
}

fn string_argument(arguments: &serde_json::Value, key: &str) -> Result<String, ModelError> {
    arguments
        .get(key)
        .and_then(|v| v.as_str())
        .filter(|v| !v.trim().is_empty())
        .map(str::to_string)
        .ok_or_else(|| ModelError::Malformed(format!("tool call missing '{}' argument", key)))
}

/// Strip markdown code fences and a leading `SQL:` label.
pub fn extract_sql(text: &str) -> Option<String> {
    let trimmed = text.trim();

    let body = match trimmed.find("```") {
        Some(start) => {
            let after = &trimmed[start + 3..];
            // Drop an info string such as `sql` on the fence line.
            let after = match after.find('\n') {
                Some(nl) if after[..nl].trim().chars().all(|c| c.is_ascii_alphanumeric()) => {
                    &after[nl + 1..]
                }
                _ => after,
            };
            match after.find("```") {
                Some(end) => &after[..end],
                None => after,
            }
        }
        None => trimmed,
    };

    let body = body.trim();
    let body = match body.get(..4) {
        Some(label) if label.eq_ignore_ascii_case("sql:") => body[4..].trim(),
        _ => body,
    };

    if body.is_empty() {
        None
    } else {
        Some(body.to_string())
    }
}

fn looks_like_sql(text: &str) -> bool {
    let first = text
        .trim_start_matches(|c: char| c == '(' || c.is_whitespace())
        .split(|c: char| !c.is_ascii_alphabetic())
        .next()
        .unwrap_or("");
    SQL_LEADING_KEYWORDS
        .iter()
        .any(|k| k.eq_ignore_ascii_case(first))
}
