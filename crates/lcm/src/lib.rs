//! Lossless context management for long-running agent sessions.
//!
//! The engine captures a host agent's transcript into an append-only
//! SQLite store, condenses older regions into a hierarchical summary DAG
//! as token pressure grows, and exposes retrieval verbs (status, grep,
//! describe, expand) that navigate from top-level summaries down to the
//! original messages by stable ids. Originals are never discarded:
//! summaries are an index over history, not a replacement for it.

pub mod api;
pub mod compaction;
pub mod config;
pub mod errors;
pub mod hooks;
pub mod ids;
pub mod llm;
pub mod store;
pub mod telemetry;
pub mod text;
pub mod tools;

pub use compaction::{CompactionConfig, CompactionEngine, CompactionStats};
pub use config::Config;
pub use errors::LcmError;
pub use ids::LcmId;
pub use llm::{AnthropicClient, LlmClient};
pub use store::Store;
