//! The crate-wide error type.
//!
//! Every fallible operation in this crate returns [`Result`], whose error
//! variant tags *why* it failed so callers can decide whether to keep going.
//! The fuzzing engine treats most kinds as per-seed, recoverable failures; a
//! handful (corpus/global-state writes, bad config) are fatal and propagate
//! all the way out of the loop. See [`FuzzError::is_fatal`].

use std::io;
use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, FuzzError>;

#[derive(Debug, thiserror::Error)]
pub enum FuzzError {
    #[error("config error: {0}")]
    Config(String),

    #[error("understanding.md missing at {0}; run `ccfuzz generate` first")]
    UnderstandingMissing(PathBuf),

    #[error("compiler invocation failed for seed {seed_id}: {stderr}")]
    CompileFailed { seed_id: u64, stderr: String },

    #[error("seed {seed_id} timed out after {timeout_secs}s")]
    ExecutionTimeout { seed_id: u64, timeout_secs: u64 },

    #[error("coverage tool exited non-zero: {0}")]
    CoverageToolFailed(String),

    #[error("llm request failed: {0}")]
    LlmRequest(String),

    #[error("llm response could not be parsed: {0}")]
    LlmResponseMalformed(String),

    #[error("oracle error: {0}")]
    Oracle(String),

    #[error("corpus write failed: {0}")]
    CorpusWrite(String),

    #[error("global state write failed: {0}")]
    GlobalStateWrite(String),

    #[error("cfg dump error: {0}")]
    CfgDump(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("illegal state: {0}")]
    IllegalState(String),
}

impl FuzzError {
    /// Whether this error must abort the fuzzing engine rather than be
    /// counted against the current seed and skipped.
    ///
    /// Mirrors the policy table in the specification's error-handling
    /// section: only filesystem-durability failures for the corpus and the
    /// global state store are fatal, plus configuration problems discovered
    /// before the loop starts.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FuzzError::Config(_)
                | FuzzError::UnderstandingMissing(_)
                | FuzzError::CorpusWrite(_)
                | FuzzError::GlobalStateWrite(_)
        )
    }
}
