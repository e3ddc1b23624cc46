//! # finsight
//!
//! A unified financial data system: heterogeneous JSON exports are parsed,
//! validated, and normalized into one relational store, which then answers
//! business questions through a structured query API and an LLM agent with
//! a registry of analysis tools.
//!
//! ## Core Concepts
//!
//! - **Dialects**: the two recognized input shapes — the QuickBooks
//!   column-major P&L report and the Rootfi period-major export
//! - **Unified model**: `FinancialRecord` per (source, period, currency),
//!   an `Account` forest, and per-period `AccountValue` contributions
//! - **Quality score**: a scalar in [0, 1] derived from severity-weighted
//!   validation issues; errors block persistence, warnings do not
//! - **Conflict resolution**: when two sources cover the same period, a
//!   configurable priority map decides the winner and the loser is kept as
//!   attribution in `raw_data.conflicts`
//! - **Agent**: a bounded plan/execute loop that interleaves LLM calls
//!   with read-only tool calls until it produces a final answer
//!
//! ## Example
//!
//! ```rust,no_run
//! use finsight::config::SourcePriority;
//! use finsight::ingestion::IngestionService;
//! use finsight::normalizer::Normalizer;
//! use finsight::store::Store;
//! use std::sync::Arc;
//!
//! # async fn run() -> finsight::error::Result<()> {
//! let store = Arc::new(Store::in_memory().await?);
//! let service = IngestionService::new(
//!     store,
//!     Normalizer::new(SourcePriority::default()),
//!     finsight::config::IngestConfig {
//!         workers: 4,
//!         retry_max: 5,
//!         backoff_base_ms: 100,
//!     },
//! );
//! let result = service.ingest_file("data/quickbooks_2024.json", None).await;
//! println!("created {} records", result.records_created);
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod config;
pub mod conversation;
pub mod error;
pub mod ingestion;
pub mod insights;
pub mod llm;
pub mod normalizer;
pub mod parsers;
pub mod schema;
pub mod server;
pub mod store;
pub mod tools;
pub mod utils;
pub mod validation;

pub use agent::{Agent, AgentReply};
pub use error::{FinsightError, Result};
pub use ingestion::{BatchResult, FileResult, IngestionService, IngestionStatus};
pub use insights::{Insight, InsightKind, InsightsEngine};
pub use normalizer::Normalizer;
pub use parsers::{detect_source, parse_json, ParsedFile};
pub use schema::{
    Account, AccountType, AccountValue, FinancialRecord, SourceType,
};
pub use store::Store;
pub use tools::ToolRegistry;
pub use validation::{Severity, ValidationIssue, ValidationResult, Validator};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
