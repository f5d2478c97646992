//! Answer synthesis.
//!
//! Turns a finished [`AnswerResult`] into user-facing text. Answered
//! results are always renderable without a model; when a model is
//! configured it may rephrase the rows as prose, but the prose is only
//! accepted if every number in it can be found in the rows.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::llm::{Completion, LanguageModel, Prompt};
use crate::models::{AnswerResult, RowSet, TerminalStatus};

const SUMMARY_PROMPT: &str = "You summarize SQL query results for a patent database.
Answer the question in one to three sentences using only values that appear in the rows.
Quote numbers exactly as they appear. Never compute, round, or estimate new numbers.";

pub struct AnswerSynthesizer {
    model: Option<Arc<dyn LanguageModel>>,
    timeout: Duration,
    preview_rows: usize,
}

impl AnswerSynthesizer {
    /// Rendering only; no model calls.
    pub fn deterministic(preview_rows: usize) -> Self {
        Self {
            model: None,
            timeout: Duration::from_secs(0),
            preview_rows: preview_rows.max(1),
        }
    }

    pub fn with_model(model: Arc<dyn LanguageModel>, timeout: Duration, preview_rows: usize) -> Self {
        Self {
            model: Some(model),
            timeout,
            preview_rows: preview_rows.max(1),
        }
    }

    pub async fn synthesize(&self, result: &AnswerResult) -> String {
        match result.status {
            TerminalStatus::Answered => {
                let rows = result.rows.clone().unwrap_or_default();
                let rendered = render_rows(&rows, self.preview_rows);
                if rows.is_empty() {
                    return rendered;
                }
                match self.summarize(&result.question, &rows, &rendered).await {
                    Some(prose) => prose,
                    None => rendered,
                }
            }
            _ => failure_message(result),
        }
    }

    async fn summarize(&self, question: &str, rows: &RowSet, rendered: &str) -> Option<String> {
        let model = self.model.as_ref()?;
        let prompt = Prompt {
            system: SUMMARY_PROMPT.to_string(),
            user: format!("QUESTION:\n{}\n\nROWS:\n{}\n", question.trim(), rendered),
        };

        let completion = match tokio::time::timeout(self.timeout, model.complete(&prompt, &[])).await
        {
            Ok(Ok(completion)) => completion,
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "summary call failed, using rendered rows");
                return None;
            }
            Err(_) => {
                tracing::debug!("summary call timed out, using rendered rows");
                return None;
            }
        };

        let prose = match completion {
            Completion::Text(text) if !text.trim().is_empty() => text.trim().to_string(),
            _ => return None,
        };

        if is_grounded(&prose, rows) {
            Some(prose)
        } else {
            tracing::warn!("summary contained numbers absent from the rows, discarded");
            None
        }
    }
}

/// Plain rendering of a result set.
pub fn render_rows(rows: &RowSet, preview_rows: usize) -> String {
    if rows.is_empty() {
        return "No matching rows were found.".to_string();
    }

    if rows.len() == 1 && rows.columns.len() == 1 && !rows.truncated {
        return format!("{} = {}", rows.columns[0], render_value(&rows.rows[0][0]));
    }

    let mut out = if rows.truncated {
        format!(
            "{} rows returned (truncated at the row limit; more rows exist).\n",
            rows.len()
        )
    } else if rows.len() == 1 {
        "1 row returned.\n".to_string()
    } else {
        format!("{} rows returned.\n", rows.len())
    };

    for row in rows.rows.iter().take(preview_rows) {
        let cells: Vec<String> = rows
            .columns
            .iter()
            .zip(row)
            .map(|(col, value)| format!("{}: {}", col, render_value(value)))
            .collect();
        out.push_str(&format!("- {}\n", cells.join(", ")));
    }

    if rows.len() > preview_rows {
        out.push_str(&format!("... and {} more rows\n", rows.len() - preview_rows));
    }

    out.trim_end().to_string()
}

fn render_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => "NULL".to_string(),
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Explanation for a question that did not reach `answered`.
pub fn failure_message(result: &AnswerResult) -> String {
    let (kind, message) = result
        .last_failure()
        .map(|(kind, message)| (kind.as_str(), message))
        .unwrap_or(("unknown", "no error was recorded"));

    match result.status {
        TerminalStatus::ExhaustedRetries => format!(
            "The question could not be answered after {} attempts. The last error was {}: {}",
            result.attempts.len(),
            kind,
            message
        ),
        TerminalStatus::RejectedUnsafe => format!(
            "The question could not be answered: the generated statement was rejected as unsafe and was not executed ({}).",
            message
        ),
        TerminalStatus::ExecutionErrorFatal => format!(
            "The question could not be answered because of a fatal {} error: {}",
            kind, message
        ),
        TerminalStatus::Answered => render_rows(&result.rows.clone().unwrap_or_default(), 1),
    }
}

/// Every number in `prose` equals a number found in the rows or the row count.
pub fn is_grounded(prose: &str, rows: &RowSet) -> bool {
    let mut allowed: HashSet<String> = HashSet::new();
    allowed.insert(canonical_number(&rows.len().to_string()));
    for row in &rows.rows {
        for value in row {
            for number in numbers_in(&render_value(value)) {
                allowed.insert(canonical_number(&number));
            }
        }
    }

    numbers_in(prose)
        .iter()
        .all(|n| allowed.contains(&canonical_number(n)))
}

/// Digit runs, with at most one embedded decimal point.
fn numbers_in(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut numbers = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        if !chars[i].is_ascii_digit() {
            i += 1;
            continue;
        }
        let start = i;
        let mut seen_dot = false;
        while i < chars.len() {
            let c = chars[i];
            if c.is_ascii_digit() {
                i += 1;
            } else if c == '.'
                && !seen_dot
                && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())
            {
                seen_dot = true;
                i += 1;
            } else {
                break;
            }
        }
        numbers.push(chars[start..i].iter().collect());
    }
    numbers
}

/// `7`, `7.0` and `07` compare equal.
fn canonical_number(number: &str) -> String {
    match number.parse::<f64>() {
        Ok(value) => format!("{}", value),
        Err(_) => number.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ModelError;
    use crate::llm::ToolDefinition;
    use crate::models::{AttemptOutcome, FailureKind, QueryAttempt};
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::json;

    fn claims_rows() -> RowSet {
        RowSet {
            columns: vec!["patent_id".into(), "claim_count".into()],
            rows: vec![
                vec![json!("US1001"), json!(12)],
                vec![json!("US1002"), json!(7)],
            ],
            truncated: false,
        }
    }

    fn answered(rows: RowSet) -> AnswerResult {
        AnswerResult {
            question: "How many claims does each patent have?".into(),
            final_sql: Some("SELECT patent_id, COUNT(*) FROM claims GROUP BY patent_id".into()),
            rows: Some(rows),
            answer: String::new(),
            attempts: vec![],
            status: TerminalStatus::Answered,
            context_tables: vec![],
        }
    }

    fn failed(status: TerminalStatus, kind: FailureKind, message: &str, n: u32) -> AnswerResult {
        let attempts = (0..n)
            .map(|index| QueryAttempt {
                index,
                sql: Some("SELEC".into()),
                outcome: AttemptOutcome::Failure {
                    kind,
                    message: message.into(),
                },
                timestamp: Utc::now(),
            })
            .collect();
        AnswerResult {
            question: "q".into(),
            final_sql: None,
            rows: None,
            answer: String::new(),
            attempts,
            status,
            context_tables: vec![],
        }
    }

    struct FixedModel(&'static str);

    #[async_trait]
    impl LanguageModel for FixedModel {
        fn model_name(&self) -> &str {
            "fixed"
        }
        async fn complete(&self, _: &Prompt, _: &[ToolDefinition]) -> Result<Completion, ModelError> {
            Ok(Completion::Text(self.0.to_string()))
        }
    }

    #[test]
    fn renders_single_cell() {
        let rows = RowSet {
            columns: vec!["n".into()],
            rows: vec![vec![json!(42)]],
            truncated: false,
        };
        assert_eq!(render_rows(&rows, 5), "n = 42");
    }

    #[test]
    fn renders_rows_with_elision() {
        let text = render_rows(&claims_rows(), 1);
        assert!(text.starts_with("2 rows returned."));
        assert!(text.contains("- patent_id: US1001, claim_count: 12"));
        assert!(!text.contains("US1002"));
        assert!(text.ends_with("... and 1 more rows"));
    }

    #[test]
    fn notes_truncation() {
        let mut rows = claims_rows();
        rows.truncated = true;
        assert!(render_rows(&rows, 5).contains("truncated"));
    }

    #[tokio::test]
    async fn empty_answer_is_explicit() {
        let text = AnswerSynthesizer::deterministic(5)
            .synthesize(&answered(RowSet::default()))
            .await;
        assert_eq!(text, "No matching rows were found.");
    }

    #[tokio::test]
    async fn exhausted_names_last_error() {
        let result = failed(
            TerminalStatus::ExhaustedRetries,
            FailureKind::SyntaxError,
            "near \"SELEC\": syntax error",
            4,
        );
        let text = AnswerSynthesizer::deterministic(5).synthesize(&result).await;
        assert!(text.contains("could not be answered after 4 attempts"));
        assert!(text.contains("syntax-error"));
    }

    #[tokio::test]
    async fn rejected_says_not_executed() {
        let result = failed(
            TerminalStatus::RejectedUnsafe,
            FailureKind::UnsafeStatement,
            "DROP statements are not permitted",
            1,
        );
        let text = AnswerSynthesizer::deterministic(5).synthesize(&result).await;
        assert!(text.contains("could not be answered"));
        assert!(text.contains("not executed"));
    }

    #[tokio::test]
    async fn grounded_prose_is_accepted() {
        let synth = AnswerSynthesizer::with_model(
            Arc::new(FixedModel("Patent US1001 has 12 claims and US1002 has 7.")),
            Duration::from_secs(1),
            5,
        );
        let text = synth.synthesize(&answered(claims_rows())).await;
        assert_eq!(text, "Patent US1001 has 12 claims and US1002 has 7.");
    }

    #[tokio::test]
    async fn invented_numbers_fall_back_to_rendering() {
        let synth = AnswerSynthesizer::with_model(
            Arc::new(FixedModel("The patents have 19 claims in total.")),
            Duration::from_secs(1),
            5,
        );
        let text = synth.synthesize(&answered(claims_rows())).await;
        assert!(text.starts_with("2 rows returned."));
    }

    #[test]
    fn grounding_accepts_row_count_and_equivalent_forms() {
        let rows = RowSet {
            columns: vec!["avg".into()],
            rows: vec![vec![json!(7.0)], vec![json!(2.5)]],
            truncated: false,
        };
        assert!(is_grounded("2 values: 7 and 2.5.", &rows));
        assert!(!is_grounded("about 3.1 on average", &rows));
        assert!(is_grounded("no numbers here", &rows));
    }
}
