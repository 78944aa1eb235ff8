//! The unit of work: a C-source fragment plus its test cases, tracked
//! through compile → execute → measure → triage.

use serde::{Deserialize, Serialize};

/// A single invocation to run against the compiled binary and the substring
/// its stdout is expected to contain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TestCase {
    /// May contain `./a.out`, `./program`, or `$BINARY`; see
    /// [`crate::executor::expand_command_template`].
    pub command_template: String,
    pub expected_stdout_substring: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SeedState {
    Pending,
    Processed,
    Crash,
    Timeout,
    CompileFailed,
}

impl SeedState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, SeedState::Pending)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Verdict {
    Pass,
    Bug,
    Error,
}

/// The fuzzer's unit of work.
///
/// `content` is kept separate from the rest of the metadata on disk (it
/// lives in `source.c`, everything else in `metadata.json`) but travels
/// together in memory because every pipeline stage needs both.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Seed {
    pub id: u64,
    pub parent_id: u64,
    pub depth: u32,
    #[serde(skip)]
    pub content: String,
    pub test_cases: Vec<TestCase>,
    pub state: SeedState,
    pub exec_time_micros: Option<u64>,
    pub old_coverage_bp: u32,
    pub new_coverage_bp: u32,
    pub coverage_delta_bp: u32,
    pub verdict: Option<Verdict>,
    pub bug_kind: Option<String>,
    pub description: Option<String>,
    #[serde(skip)]
    pub path: Option<std::path::PathBuf>,
}

impl Seed {
    /// A fresh, not-yet-IDed seed as produced by the initial-corpus loader
    /// or by LLM synthesis. `id` is filled in by
    /// [`crate::corpus::CorpusManager::add`].
    pub fn new(content: String, test_cases: Vec<TestCase>, parent_id: u64, depth: u32) -> Self {
        Seed {
            id: 0,
            parent_id,
            depth,
            content,
            test_cases,
            state: SeedState::Pending,
            exec_time_micros: None,
            old_coverage_bp: 0,
            new_coverage_bp: 0,
            coverage_delta_bp: 0,
            verdict: None,
            bug_kind: None,
            description: None,
            path: None,
        }
    }

    /// Directory name for this seed: `id-NNNNNN-cov-MMMMM`.
    pub fn dir_name(&self) -> String {
        format!("id-{:06}-cov-{:05}", self.id, self.coverage_delta_bp)
    }

    /// Records the outcome of a `pending -> processed` transition.
    ///
    /// `coverage_delta_bp = max(0, new - old)`, per the seed-state invariant.
    pub fn set_coverage(&mut self, old_bp: u32, new_bp: u32) {
        self.old_coverage_bp = old_bp;
        self.new_coverage_bp = new_bp;
        self.coverage_delta_bp = new_bp.saturating_sub(old_bp);
    }
}
