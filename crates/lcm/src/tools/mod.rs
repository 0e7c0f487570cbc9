//! Retrieval tools exposed over the RPC surface, plus the parallel data
//! operators.

pub mod memory;
pub mod operators;
pub mod status;

pub use memory::{describe, expand, grep, GrepResponse, PageToken, SearchMode};
pub use operators::{agentic_map, llm_map, MapReport};
pub use status::{status, StatusReport};
