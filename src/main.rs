//! # Patent Query CLI (`pq`)
//!
//! ## Usage
//!
//! ```bash
//! pq --config ./config/pq.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `pq check` | Load the catalog, verify foreign keys, build the index |
//! | `pq tables` | List catalog tables |
//! | `pq search "<question>"` | Rank tables for a question |
//! | `pq context "<question>"` | Show the schema a question would be given |
//! | `pq ask "<question>"` | Answer a question |
//! | `pq repl` | Answer questions interactively |
//! | `pq serve` | Start the HTTP API |
//!
//! `ask` exits with status 2 when the question ends in any state other
//! than `answered`.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;

use patent_query::catalog::SchemaCatalog;
use patent_query::config::{self, Config};
use patent_query::controller::QueryAgent;
use patent_query::db::SqliteDatabase;
use patent_query::embedding::create_provider;
use patent_query::index::{IndexOptions, RetrievalIndex};
use patent_query::models::{AnswerResult, TerminalStatus};
use patent_query::{logging, selector, server};

/// Ask questions of a patent database in plain English.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/pq.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "pq",
    about = "Natural-language questions over a patent SQLite database",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/pq.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the schema catalog and build the retrieval index.
    Check,

    /// List catalog tables with their comments.
    Tables,

    /// Rank catalog tables by relevance to a question.
    Search {
        question: String,

        /// Number of tables to return (defaults to `[retrieval].top_k`).
        #[arg(long)]
        k: Option<usize>,
    },

    /// Print the schema context a question would be given.
    Context { question: String },

    /// Answer a question.
    Ask {
        question: String,

        /// Print the full answer record as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Answer questions read from stdin until `exit` or end of input.
    Repl,

    /// Start the HTTP API on `[server].bind`.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let cfg = config::load_config(&cli.config)?;
    logging::init(&cfg.logging)?;

    match cli.command {
        Commands::Check => run_check(&cfg).await?,
        Commands::Tables => {
            let catalog = SchemaCatalog::load(&cfg.catalog.schema_docs)?;
            for table in catalog.tables() {
                println!(
                    "{:<32} {:>3} columns  {}",
                    table.name,
                    table.columns.len(),
                    table.comment
                );
            }
        }
        Commands::Search { question, k } => {
            let (_, index) = load_index(&cfg).await?;
            let k = k.unwrap_or(cfg.retrieval.top_k);
            for (rank, hit) in index.search(&question, k).await.iter().enumerate() {
                println!("{}. {} ({:.3})", rank + 1, hit.table, hit.score);
            }
        }
        Commands::Context { question } => {
            let (catalog, index) = load_index(&cfg).await?;
            let context = selector::select(
                &question,
                &index,
                &catalog,
                cfg.retrieval.top_k,
                cfg.retrieval.max_context_tables,
            )
            .await;
            println!("{}", context.render());
        }
        Commands::Ask { question, json } => {
            let agent = QueryAgent::from_config(&cfg).await?;
            let result = agent.ask(&question).await;
            print_result(&result, json)?;
            if result.status != TerminalStatus::Answered {
                std::process::exit(2);
            }
        }
        Commands::Repl => run_repl(&cfg).await?,
        Commands::Serve => server::run_server(&cfg).await?,
    }

    Ok(())
}

async fn load_index(cfg: &Config) -> Result<(Arc<SchemaCatalog>, RetrievalIndex)> {
    let catalog = Arc::new(SchemaCatalog::load(&cfg.catalog.schema_docs)?);
    let provider = create_provider(&cfg.embedding)?;
    let index = RetrievalIndex::build(&catalog, provider, &IndexOptions::from_config(cfg)).await?;
    Ok((catalog, index))
}

async fn run_check(cfg: &Config) -> Result<()> {
    let (catalog, index) = load_index(cfg).await?;

    let columns: usize = catalog.tables().iter().map(|t| t.columns.len()).sum();
    let foreign_keys: usize = catalog
        .tables()
        .iter()
        .flat_map(|t| &t.columns)
        .filter(|c| c.references.is_some())
        .count();

    println!("catalog: {} tables, {} columns, {} foreign keys", catalog.len(), columns, foreign_keys);
    println!("fingerprint: {}", catalog.fingerprint());
    println!("index: {} entries", index.len());

    match SqliteDatabase::open(&cfg.db).await {
        Ok(_) => println!("database: ok ({})", cfg.db.path.display()),
        Err(e) => println!("database: unavailable ({})", e),
    }
    println!(
        "llm: {}",
        if cfg.llm.is_enabled() {
            cfg.llm.model.as_str()
        } else {
            "disabled"
        }
    );
    Ok(())
}

fn print_result(result: &AnswerResult, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(result)?);
        return Ok(());
    }

    println!("{}", result.answer);
    if let Some(sql) = &result.final_sql {
        println!("\nSQL: {}", sql);
    }
    println!(
        "[{} after {} attempt(s)]",
        result.status,
        result.attempts.len()
    );
    Ok(())
}

async fn run_repl(cfg: &Config) -> Result<()> {
    let agent = QueryAgent::from_config(cfg).await?;
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("pq> ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let question = line.trim();
        if question.is_empty() {
            continue;
        }
        if question.eq_ignore_ascii_case("exit") || question.eq_ignore_ascii_case("quit") {
            break;
        }

        let result = agent.ask(question).await;
        print_result(&result, false)?;
        println!();
    }
    Ok(())
}
