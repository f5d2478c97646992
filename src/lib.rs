//! # Patent Query
//!
//! Natural-language questions over a patent SQLite database, answered by a
//! language model that writes SQL against a retrieved slice of the schema.
//!
//! ## Architecture
//!
//! ```text
//! question
//!    │
//!    ▼
//! ┌──────────┐   ┌───────────┐   ┌──────────┐   ┌──────────┐
//! │ Selector │──▶│   Agent   │──▶│ Gateway  │──▶│  SQLite  │
//! │ (index + │   │ (LLM, SQL │   │ (read-   │   │ (read-   │
//! │ catalog) │   │  or tool) │   │  only)   │   │  only)   │
//! └──────────┘   └─────▲─────┘   └────┬─────┘   └──────────┘
//!                      │  error       │
//!                      └──────────────┘
//!                   controller (bounded retries)
//!                             │
//!                             ▼
//!                    answer synthesizer
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! pq check                                   # validate catalog and build the index
//! pq context "How many claims does each patent have?"
//! pq ask "How many claims does each patent have?"
//! pq serve                                   # POST /ask on [server].bind
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`logging`] | `tracing` subscriber setup |
//! | [`error`] | Typed error taxonomy |
//! | [`models`] | Attempts, row sets, answer records |
//! | [`catalog`] | Schema catalog loaded from schema docs |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`index`] | Retrieval index over catalog entries |
//! | [`selector`] | Schema context selection and expansion |
//! | [`llm`] | Language-model abstraction |
//! | [`agent`] | SQL generation agent |
//! | [`db`] | Read-only database access |
//! | [`gateway`] | Safe execution gateway |
//! | [`controller`] | Error-feedback state machine |
//! | [`answer`] | Answer synthesis |
//! | [`server`] | HTTP API |

pub mod agent;
pub mod answer;
pub mod catalog;
pub mod config;
pub mod controller;
pub mod db;
pub mod embedding;
pub mod error;
pub mod gateway;
pub mod index;
pub mod llm;
pub mod logging;
pub mod models;
pub mod selector;
pub mod server;
