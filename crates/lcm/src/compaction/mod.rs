//! Compaction: the escalation ladder, the threshold control loop, and the
//! file analyzer that feeds exploration snippets into file references.

pub mod engine;
pub mod escalation;
pub mod explorer;

pub use engine::{CompactionConfig, CompactionEngine, CompactionStats};
pub use escalation::{escalated_summarize, truncate_deterministic, EscalationOutcome};
