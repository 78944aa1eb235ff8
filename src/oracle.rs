//! Classifies a seed's execution results into pass/bug/error.
//!
//! `crash-detector` and `diff` are pure logic over what the executor already
//! observed; `llm-judge` is the one variant that defers its classification
//! to the LLM client, wiring the call and parsing its verdict out of the
//! response without attempting to replicate that judgement itself.

use crate::error::{FuzzError, Result};
use crate::executor::ExecutionResult;
use crate::llm::LlmClient;
use crate::seed::{Seed, Verdict};

pub struct OracleVerdict {
    pub verdict: Verdict,
    pub bug_kind: Option<String>,
    pub description: Option<String>,
}

pub trait Oracle {
    fn evaluate(&self, seed: &Seed, execution_results: &[ExecutionResult]) -> Result<OracleVerdict>;
}

/// Signals and non-zero exits the executor couldn't have produced from a
/// clean run are bugs; a timeout is its own (non-bug) terminal state handled
/// upstream by the engine, so this oracle isn't consulted for timeouts.
pub struct CrashDetector;

impl Oracle for CrashDetector {
    fn evaluate(&self, _seed: &Seed, execution_results: &[ExecutionResult]) -> Result<OracleVerdict> {
        for result in execution_results {
            if result.exit_code >= 128 {
                let signo = result.exit_code - 128;
                return Ok(OracleVerdict {
                    verdict: Verdict::Bug,
                    bug_kind: Some(format!("signal-{signo}")),
                    description: Some(format!(
                        "process terminated by signal {signo}: {}",
                        result.stderr.trim()
                    )),
                });
            }
            if result.exit_code != 0 {
                return Ok(OracleVerdict {
                    verdict: Verdict::Bug,
                    bug_kind: Some(format!("exit-{}", result.exit_code)),
                    description: Some(format!(
                        "process exited {}: {}",
                        result.exit_code,
                        result.stderr.trim()
                    )),
                });
            }
        }
        Ok(OracleVerdict {
            verdict: Verdict::Pass,
            bug_kind: None,
            description: None,
        })
    }
}

/// Compares the seed's execution results against a second, independently
/// configured execution of the same binary (e.g. a different optimization
/// level) supplied by the caller; a divergence in observable behavior is a
/// bug, a crash on either side is an error (inconclusive, not a finding).
pub struct DiffOracle {
    pub reference_results: Vec<ExecutionResult>,
}

impl Oracle for DiffOracle {
    fn evaluate(&self, _seed: &Seed, execution_results: &[ExecutionResult]) -> Result<OracleVerdict> {
        if execution_results.len() != self.reference_results.len() {
            return Ok(OracleVerdict {
                verdict: Verdict::Error,
                bug_kind: None,
                description: Some("test case count mismatch between runs".to_string()),
            });
        }
        for (a, b) in execution_results.iter().zip(&self.reference_results) {
            if a.timed_out || b.timed_out {
                return Ok(OracleVerdict {
                    verdict: Verdict::Error,
                    bug_kind: None,
                    description: Some("one side timed out".to_string()),
                });
            }
            if a.exit_code >= 128 || b.exit_code >= 128 {
                return Ok(OracleVerdict {
                    verdict: Verdict::Error,
                    bug_kind: None,
                    description: Some("one side crashed, diff inconclusive".to_string()),
                });
            }
            if a.stdout != b.stdout || a.exit_code != b.exit_code {
                return Ok(OracleVerdict {
                    verdict: Verdict::Bug,
                    bug_kind: Some("divergence".to_string()),
                    description: Some(format!(
                        "stdout/exit diverged: ({}, {:?}) vs ({}, {:?})",
                        a.exit_code,
                        a.stdout,
                        b.exit_code,
                        b.stdout
                    )),
                });
            }
        }
        Ok(OracleVerdict {
            verdict: Verdict::Pass,
            bug_kind: None,
            description: None,
        })
    }
}

/// Delegates classification to the LLM client. Expects the response to
/// start with one of `PASS`/`BUG`/`ERROR` (case-insensitive), optionally
/// followed by a bug kind and free-text description on the rest of the
/// line; anything else is a malformed response.
pub struct LlmJudgeOracle<'a> {
    pub client: &'a dyn LlmClient,
    pub understanding: String,
}

impl<'a> Oracle for LlmJudgeOracle<'a> {
    fn evaluate(&self, seed: &Seed, execution_results: &[ExecutionResult]) -> Result<OracleVerdict> {
        let mut prompt = format!(
            "{}\n\nClassify this execution as PASS, BUG, or ERROR.\nSource:\n{}\n",
            self.understanding, seed.content
        );
        for (i, result) in execution_results.iter().enumerate() {
            prompt.push_str(&format!(
                "Test case {i}: exit={} stdout={:?} stderr={:?}\n",
                result.exit_code, result.stdout, result.stderr
            ));
        }
        let response = self.client.ask(&prompt)?;
        parse_judge_response(&response)
    }
}

fn parse_judge_response(response: &str) -> Result<OracleVerdict> {
    let trimmed = response.trim();
    let mut parts = trimmed.splitn(2, char::is_whitespace);
    let verdict_word = parts.next().unwrap_or_default().to_ascii_uppercase();
    let rest = parts.next().map(str::trim).filter(|s| !s.is_empty());

    let verdict = match verdict_word.as_str() {
        "PASS" => Verdict::Pass,
        "BUG" => Verdict::Bug,
        "ERROR" => Verdict::Error,
        other => {
            return Err(FuzzError::LlmResponseMalformed(format!(
                "unrecognized verdict word: {other}"
            )))
        }
    };

    let (bug_kind, description) = match (verdict, rest) {
        (Verdict::Bug, Some(r)) => {
            let mut it = r.splitn(2, char::is_whitespace);
            let kind = it.next().map(str::to_string);
            let desc = it.next().map(str::to_string);
            (kind, desc)
        }
        (_, Some(r)) => (None, Some(r.to_string())),
        (_, None) => (None, None),
    };

    Ok(OracleVerdict {
        verdict,
        bug_kind,
        description,
    })
}

/// Builds the configured oracle given `oracle.type` and its `options{}`.
/// `crash-detector` and `diff` need nothing beyond what's passed in at
/// evaluation time; `llm-judge` needs the client and understanding text
/// up front.
pub fn crash_detector() -> CrashDetector {
    CrashDetector
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn result(exit_code: i32, stdout: &str) -> ExecutionResult {
        ExecutionResult {
            stdout: stdout.to_string(),
            stderr: String::new(),
            exit_code,
            timed_out: false,
            wall_time: Duration::from_millis(1),
            stdout_matched_expected: true,
        }
    }

    fn seed() -> Seed {
        Seed::new("int main(){}".to_string(), vec![], 0, 0)
    }

    #[test]
    fn crash_detector_flags_signal_exit() {
        let verdict = CrashDetector.evaluate(&seed(), &[result(139, "")]).unwrap();
        assert_eq!(verdict.verdict, Verdict::Bug);
        assert_eq!(verdict.bug_kind.as_deref(), Some("signal-11"));
    }

    #[test]
    fn crash_detector_flags_nonzero_exit() {
        let verdict = CrashDetector.evaluate(&seed(), &[result(1, "")]).unwrap();
        assert_eq!(verdict.verdict, Verdict::Bug);
        assert_eq!(verdict.bug_kind.as_deref(), Some("exit-1"));
    }

    #[test]
    fn crash_detector_passes_clean_run() {
        let verdict = CrashDetector
            .evaluate(&seed(), &[result(0, "ok"), result(0, "ok")])
            .unwrap();
        assert_eq!(verdict.verdict, Verdict::Pass);
    }

    #[test]
    fn diff_oracle_detects_stdout_divergence() {
        let oracle = DiffOracle {
            reference_results: vec![result(0, "a")],
        };
        let verdict = oracle.evaluate(&seed(), &[result(0, "b")]).unwrap();
        assert_eq!(verdict.verdict, Verdict::Bug);
    }

    #[test]
    fn diff_oracle_passes_matching_runs() {
        let oracle = DiffOracle {
            reference_results: vec![result(0, "a")],
        };
        let verdict = oracle.evaluate(&seed(), &[result(0, "a")]).unwrap();
        assert_eq!(verdict.verdict, Verdict::Pass);
    }

    #[test]
    fn diff_oracle_treats_crash_as_error() {
        let oracle = DiffOracle {
            reference_results: vec![result(139, "")],
        };
        let verdict = oracle.evaluate(&seed(), &[result(0, "a")]).unwrap();
        assert_eq!(verdict.verdict, Verdict::Error);
    }

    #[test]
    fn parses_well_formed_judge_response() {
        let verdict = parse_judge_response("BUG use-after-free heap corruption in parser").unwrap();
        assert_eq!(verdict.verdict, Verdict::Bug);
        assert_eq!(verdict.bug_kind.as_deref(), Some("use-after-free"));
    }

    #[test]
    fn rejects_unrecognized_verdict_word() {
        assert!(parse_judge_response("MAYBE not sure").is_err());
    }
}
