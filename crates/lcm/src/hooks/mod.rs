//! Host-facing hooks: transcript capture and context injection.

pub mod capture;
pub mod inject;

pub use capture::{capture_transcript, CaptureStats};
pub use inject::build_injection;
