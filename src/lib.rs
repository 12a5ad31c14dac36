//! stepwise — stable-prompt agent orchestration runtime.
//!
//! Decomposes user queries into skill plans, executes each step as an
//! isolated subprocess, and keeps plan state in a grep-addressable flat
//! file so the decomposer's system prompt stays byte-identical across
//! iterations (maximising LM prefix-cache reuse).
//!
//! This library crate re-exports modules so integration tests
//! (under `tests/`) can access them.

pub mod config;
pub mod decompose;
pub mod executor;
pub mod models;
pub mod orchestrator;
pub mod plan;
pub mod skills;
pub mod utils;

/// Return the stepwise home directory.
///
/// Resolution order:
/// 1. `STEPWISE_HOME` environment variable
/// 2. `$HOME/.stepwise`
pub fn stepwise_home() -> std::path::PathBuf {
    if let Ok(p) = std::env::var("STEPWISE_HOME") {
        std::path::PathBuf::from(p)
    } else {
        dirs::home_dir()
            .unwrap_or_else(|| std::path::PathBuf::from("."))
            .join(".stepwise")
    }
}
