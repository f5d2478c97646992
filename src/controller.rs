//! Error-feedback controller.
//!
//! [`QueryAgent::ask`] drives one question through an explicit state
//! machine:
//!
//! ```text
//! Generating ──Candidate──▶ Executing ──ok──▶ Answered
//!     ▲   │                     │
//!     │   └─Expand (ok)─┐       ├─unsafe──────▶ Rejected
//!     │◀────────────────┘       ├─fatal───────▶ Fatal
//!     │                         └─recoverable─▶ Retrying ─▶ Generating
//!     │                                              └─budget spent─▶ Exhausted
//! ```
//!
//! All per-question state (attempts, context, expansion count) lives on the
//! stack of one `ask` call. The catalog, index, gateway and model are shared
//! read-only between concurrent questions.

use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::Instrument;

use crate::agent::{AgentResponse, SqlAgent};
use crate::answer::AnswerSynthesizer;
use crate::catalog::SchemaCatalog;
use crate::config::Config;
use crate::db::{ReadOnlyDatabase, SqliteDatabase};
use crate::embedding::create_provider;
use crate::error::Cancelled;
use crate::gateway::{Execution, SqlGateway};
use crate::index::{IndexOptions, RetrievalIndex};
use crate::llm::{create_model, LanguageModel};
use crate::models::{AnswerResult, AttemptOutcome, FailureKind, QueryAttempt, TerminalStatus};
use crate::selector::{expand, select, SchemaContext};

/// Bounds for one question.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentOptions {
    pub top_k: usize,
    pub max_context_tables: usize,
    /// Retries after the first attempt; a question makes at most
    /// `max_retries + 1` attempts.
    pub max_retries: u32,
    pub max_expansions: u32,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            top_k: 3,
            max_context_tables: 8,
            max_retries: 3,
            max_expansions: 3,
        }
    }
}

impl AgentOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            top_k: config.retrieval.top_k,
            max_context_tables: config.retrieval.max_context_tables,
            max_retries: config.agent.max_retries,
            max_expansions: config.agent.max_expansions,
        }
    }
}

#[derive(Debug)]
enum LoopState {
    Generating,
    Executing { sql: String },
    Retrying,
    Answered(Execution),
    Exhausted,
    Rejected,
    Fatal,
}

/// Caller side of a cancellation channel.
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// Observed by `ask_with_cancel` before each model call and raced against
/// every model call and database execution.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    rx: Option<watch::Receiver<bool>>,
}

impl CancelSignal {
    pub fn new() -> (CancelHandle, CancelSignal) {
        let (tx, rx) = watch::channel(false);
        (CancelHandle { tx }, CancelSignal { rx: Some(rx) })
    }

    /// A signal that never fires.
    pub fn never() -> Self {
        Self { rx: None }
    }

    pub fn is_cancelled(&self) -> bool {
        self.rx.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Resolves once cancelled. Pending forever for [`never`](Self::never)
    /// or when the handle was dropped without cancelling.
    pub async fn cancelled(&self) {
        let Some(rx) = &self.rx else {
            return std::future::pending().await;
        };
        let mut rx = rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return std::future::pending().await;
            }
        }
    }
}

pub struct QueryAgent {
    catalog: Arc<SchemaCatalog>,
    index: Arc<RetrievalIndex>,
    agent: SqlAgent,
    gateway: SqlGateway,
    synthesizer: AnswerSynthesizer,
    options: AgentOptions,
}

impl QueryAgent {
    pub fn new(
        catalog: Arc<SchemaCatalog>,
        index: Arc<RetrievalIndex>,
        agent: SqlAgent,
        gateway: SqlGateway,
        synthesizer: AnswerSynthesizer,
        options: AgentOptions,
    ) -> Self {
        Self {
            catalog,
            index,
            agent,
            gateway,
            synthesizer,
            options,
        }
    }

    /// Load the catalog, build the index, and open the database and model
    /// described by `config`.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let catalog = Arc::new(SchemaCatalog::load(&config.catalog.schema_docs)?);
        tracing::info!(
            tables = catalog.len(),
            fingerprint = %catalog.fingerprint(),
            "schema catalog loaded"
        );

        let provider = create_provider(&config.embedding)?;
        let index = Arc::new(
            RetrievalIndex::build(&catalog, provider, &IndexOptions::from_config(config)).await?,
        );

        let database: Arc<dyn ReadOnlyDatabase> = Arc::new(SqliteDatabase::open(&config.db).await?);
        let model: Arc<dyn LanguageModel> = create_model(&config.llm)?;

        let synthesizer = if config.llm.is_enabled() && config.llm.summarize {
            AnswerSynthesizer::with_model(
                model.clone(),
                config.llm.timeout(),
                config.agent.answer_preview_rows,
            )
        } else {
            AnswerSynthesizer::deterministic(config.agent.answer_preview_rows)
        };

        Ok(Self::new(
            catalog.clone(),
            index,
            SqlAgent::new(model, config.llm.timeout()),
            SqlGateway::new(catalog, database, config.agent.row_limit),
            synthesizer,
            AgentOptions::from_config(config),
        ))
    }

    pub fn catalog(&self) -> &Arc<SchemaCatalog> {
        &self.catalog
    }

    pub fn index(&self) -> &Arc<RetrievalIndex> {
        &self.index
    }

    pub fn options(&self) -> AgentOptions {
        self.options
    }

    /// The context `question` would start from.
    pub async fn context_for(&self, question: &str) -> SchemaContext {
        select(
            question,
            &self.index,
            &self.catalog,
            self.options.top_k,
            self.options.max_context_tables,
        )
        .await
    }

    pub async fn ask(&self, question: &str) -> AnswerResult {
        match self.ask_with_cancel(question, CancelSignal::never()).await {
            Ok(result) => result,
            // Unreachable with a signal that never fires.
            Err(Cancelled) => AnswerResult {
                question: question.to_string(),
                final_sql: None,
                rows: None,
                answer: "The question could not be answered: the request was cancelled."
                    .to_string(),
                attempts: Vec::new(),
                status: TerminalStatus::ExecutionErrorFatal,
                context_tables: Vec::new(),
            },
        }
    }

    pub async fn ask_with_cancel(
        &self,
        question: &str,
        signal: CancelSignal,
    ) -> Result<AnswerResult, Cancelled> {
        let span = tracing::info_span!("ask", request_id = %uuid::Uuid::new_v4());
        self.run(question, &signal).instrument(span).await
    }

    async fn run(&self, question: &str, signal: &CancelSignal) -> Result<AnswerResult, Cancelled> {
        tracing::info!(target: "pq::audit", question, "question received");

        let mut context = self.context_for(question).await;
        let mut attempts: Vec<QueryAttempt> = Vec::new();
        let mut expansions = 0u32;
        let mut state = LoopState::Generating;

        let terminal = loop {
            state = match state {
                LoopState::Generating => {
                    if signal.is_cancelled() {
                        tracing::info!(target: "pq::audit", "cancelled before model call");
                        return Err(Cancelled);
                    }

                    let response = tokio::select! {
                        biased;
                        _ = signal.cancelled() => return Err(Cancelled),
                        r = self.agent.generate(question, &context, &self.catalog, &attempts) => r,
                    };

                    match response {
                        Ok(AgentResponse::Candidate { sql }) => LoopState::Executing { sql },
                        Ok(AgentResponse::Expand { table_name }) => {
                            if expansions >= self.options.max_expansions {
                                let message = format!(
                                    "expansion limit of {} reached; answer with the tables already provided",
                                    self.options.max_expansions
                                );
                                record_failure(&mut attempts, None, FailureKind::ExpansionRejected, message);
                                self.after_failure(FailureKind::ExpansionRejected, &attempts)
                            } else {
                                match expand(&context, &self.catalog, &table_name) {
                                    Ok(expanded) => {
                                        expansions += 1;
                                        context = expanded;
                                        tracing::info!(
                                            target: "pq::audit",
                                            table = %table_name,
                                            tables = ?context.table_names(),
                                            "schema context expanded"
                                        );
                                        LoopState::Generating
                                    }
                                    Err(e) => {
                                        let kind = FailureKind::from(&e);
                                        record_failure(&mut attempts, None, kind, e.to_string());
                                        self.after_failure(kind, &attempts)
                                    }
                                }
                            }
                        }
                        Err(e) => {
                            let kind = FailureKind::from(&e);
                            record_failure(&mut attempts, None, kind, e.to_string());
                            self.after_failure(kind, &attempts)
                        }
                    }
                }
                LoopState::Executing { sql } => {
                    let outcome = tokio::select! {
                        biased;
                        _ = signal.cancelled() => return Err(Cancelled),
                        r = self.gateway.execute(&sql) => r,
                    };

                    match outcome {
                        Ok(execution) => {
                            let attempt = QueryAttempt {
                                index: attempts.len() as u32,
                                sql: Some(sql),
                                outcome: AttemptOutcome::Success {
                                    row_count: execution.rows.len(),
                                    truncated: execution.rows.truncated,
                                },
                                timestamp: Utc::now(),
                            };
                            audit(&attempt);
                            attempts.push(attempt);
                            LoopState::Answered(execution)
                        }
                        Err(e) => {
                            let kind = FailureKind::from(&e);
                            record_failure(&mut attempts, Some(sql), kind, e.to_string());
                            self.after_failure(kind, &attempts)
                        }
                    }
                }
                LoopState::Retrying => LoopState::Generating,
                terminal => break terminal,
            };
        };

        let (status, final_sql, rows) = match terminal {
            LoopState::Answered(execution) => (
                TerminalStatus::Answered,
                Some(execution.statement.executable),
                Some(execution.rows),
            ),
            LoopState::Rejected => (TerminalStatus::RejectedUnsafe, None, None),
            LoopState::Exhausted => (TerminalStatus::ExhaustedRetries, None, None),
            _ => (TerminalStatus::ExecutionErrorFatal, None, None),
        };

        let mut result = AnswerResult {
            question: question.to_string(),
            final_sql,
            rows,
            answer: String::new(),
            attempts,
            status,
            context_tables: context.table_names().iter().map(|t| t.to_string()).collect(),
        };

        result.answer = tokio::select! {
            biased;
            _ = signal.cancelled() => return Err(Cancelled),
            answer = self.synthesizer.synthesize(&result) => answer,
        };

        tracing::info!(
            target: "pq::audit",
            status = %result.status,
            attempts = result.attempts.len(),
            final_sql = result.final_sql.as_deref().unwrap_or(""),
            "question finished"
        );
        Ok(result)
    }

    fn after_failure(&self, kind: FailureKind, attempts: &[QueryAttempt]) -> LoopState {
        if kind == FailureKind::UnsafeStatement {
            LoopState::Rejected
        } else if !kind.is_recoverable() {
            LoopState::Fatal
        } else if attempts.len() as u32 > self.options.max_retries {
            LoopState::Exhausted
        } else {
            LoopState::Retrying
        }
    }
}

fn record_failure(
    attempts: &mut Vec<QueryAttempt>,
    sql: Option<String>,
    kind: FailureKind,
    message: String,
) {
    let attempt = QueryAttempt {
        index: attempts.len() as u32,
        sql,
        outcome: AttemptOutcome::Failure { kind, message },
        timestamp: Utc::now(),
    };
    audit(&attempt);
    attempts.push(attempt);
}

fn audit(attempt: &QueryAttempt) {
    match &attempt.outcome {
        AttemptOutcome::Success {
            row_count,
            truncated,
        } => tracing::info!(
            target: "pq::audit",
            attempt = attempt.index,
            sql = attempt.sql.as_deref().unwrap_or(""),
            row_count,
            truncated,
            "attempt succeeded"
        ),
        AttemptOutcome::Failure { kind, message } => tracing::info!(
            target: "pq::audit",
            attempt = attempt.index,
            sql = attempt.sql.as_deref().unwrap_or(""),
            kind = %kind,
            message = %message,
            "attempt failed"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn never_signal_stays_pending() {
        let signal = CancelSignal::never();
        assert!(!signal.is_cancelled());
        let waited =
            tokio::time::timeout(std::time::Duration::from_millis(10), signal.cancelled()).await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn cancel_wakes_waiters() {
        let (handle, signal) = CancelSignal::new();
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.cancelled().await })
        };
        handle.cancel();
        waiter.await.unwrap();
        assert!(signal.is_cancelled());
    }

    #[tokio::test]
    async fn dropped_handle_does_not_cancel() {
        let (handle, signal) = CancelSignal::new();
        drop(handle);
        assert!(!signal.is_cancelled());
        let waited =
            tokio::time::timeout(std::time::Duration::from_millis(10), signal.cancelled()).await;
        assert!(waited.is_err());
    }

    #[test]
    fn default_options_match_documented_bounds() {
        let options = AgentOptions::default();
        assert_eq!(options.max_retries, 3);
        assert_eq!(options.top_k, 3);
    }
}
