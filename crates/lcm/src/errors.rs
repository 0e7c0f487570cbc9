//! Error taxonomy for the context-management engine.
//!
//! Internal plumbing uses `anyhow::Result`; this enum is the typed seam the
//! CLI, hooks and RPC handlers speak. Each variant maps onto a process exit
//! code: store failures are fatal (3), LLM failures are degradable (4),
//! input errors are the caller's problem (2).

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LcmError {
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[source] anyhow::Error),

    #[error("transcript unreadable at {path}: {source}")]
    TranscriptUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("LLM unavailable after {attempts} attempt(s): {message}")]
    LlmUnavailable { attempts: u32, message: String },

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("invalid input: {0}")]
    InputError(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl LcmError {
    pub fn llm_unavailable(attempts: u32, message: impl Into<String>) -> Self {
        Self::LlmUnavailable {
            attempts,
            message: message.into(),
        }
    }

    /// CLI exit code contract: 0 success, 2 bad usage, 3 store unavailable,
    /// 4 LLM unavailable.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::StoreUnavailable(_) => 3,
            Self::LlmUnavailable { .. } => 4,
            Self::InputError(_) => 2,
            Self::TranscriptUnreadable { .. } => 0,
            Self::InvariantViolation(_) | Self::Other(_) => 1,
        }
    }

    /// Non-fatal errors let capture/inject degrade to a no-op and exit 0.
    pub fn is_degradable(&self) -> bool {
        matches!(
            self,
            Self::TranscriptUnreadable { .. } | Self::LlmUnavailable { .. }
        )
    }
}
