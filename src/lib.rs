//! # Progress Tracker
//!
//! Maintains a knowledge base of milestones, tasks and bottlenecks extracted
//! from project documents by a language model, and keeps it consistent as
//! new documents arrive.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────────┐   ┌─────────────┐
//! │  Documents  │──▶│     Pipeline     │──▶│    Store    │
//! │ (read-only) │   │ detect, extract, │   │ entities,   │
//! └─────────────┘   │ merge, verdict   │   │ details,    │
//!                   └────────┬─────────┘   │ checkpoints │
//!                            │             └──────┬──────┘
//!                   ┌────────┴─────────┐   ┌──────┴──────┐
//!                   │   Job manager    │   │   Router    │
//!                   └────────┬─────────┘   └──────┬──────┘
//!                            └─────────┬──────────┘
//!                               ┌──────┴──────┐
//!                               │ CLI / HTTP  │
//!                               └─────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`models`] | Documents, entities, detail records, checkpoints |
//! | [`error`] | Pipeline and language-model error types |
//! | [`db`] / [`migrate`] | SQLite connection and schema |
//! | [`store`] | Knowledge store trait, SQLite and in-memory backends |
//! | [`documents`] | Read-only document source |
//! | [`llm`] | Chat-completion providers |
//! | [`embedding`] | Embedding providers and vector utilities |
//! | [`changes`] | New-document detection against checkpoints |
//! | [`extract`] | Entity extraction and two-stage decoding |
//! | [`completion`] | Majority-vote task completion |
//! | [`pipeline`] | Incremental update run |
//! | [`jobs`] | Background refresh jobs |
//! | [`router`] | Semantic function router |
//! | [`server`] | HTTP API |
//! | [`cli`] | `ptrack` command implementations |
//! | [`logging`] | Tracing subscriber setup |

pub mod changes;
pub mod cli;
pub mod completion;
pub mod config;
pub mod db;
pub mod documents;
pub mod embedding;
pub mod error;
mod http;
pub mod extract;
pub mod jobs;
pub mod llm;
pub mod logging;
pub mod migrate;
pub mod models;
pub mod pipeline;
pub mod router;
pub mod server;
pub mod store;
