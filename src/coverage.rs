//! Invokes the external coverage-report tool and merges its output into the
//! accumulated report that basis-points figures are derived from.
//!
//! `gcovr`'s JSON reports an absolute cumulative hit count per line on every
//! invocation, not an incremental delta, so the merge takes the max of the
//! two counts rather than summing them — merging a report into itself (or
//! into a report from an unchanged re-run) must be a no-op. This is what
//! makes `total_coverage` monotone non-decreasing across a session,
//! independent of how the engine mutates and retries seeds.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FuzzError, Result};
use crate::runner;

/// `{files: {path: {lines: {line_no: hits}}}}`, matching the shape gcovr
/// emits in JSON mode.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoverageReport {
    pub files: BTreeMap<String, FileCoverage>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileCoverage {
    pub lines: BTreeMap<u32, u64>,
}

impl CoverageReport {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(CoverageReport::default());
        }
        let data = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    /// Atomically persists via a temp file in the same directory, synced
    /// before rename, so a crash mid-write never leaves a truncated report.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp_path = path.with_extension("json.tmp");
        let data = serde_json::to_vec_pretty(self)?;
        {
            let mut f = fs::File::create(&tmp_path)?;
            use std::io::Write;
            f.write_all(&data)?;
            f.sync_all()?;
        }
        fs::rename(&tmp_path, path)?;
        Ok(())
    }

    /// Union of hit lines, hit counts taken as the max of both sides.
    /// `new_lines` returns every `(file, line)` the incoming report hit that
    /// `self` had never recorded before the merge, regardless of whether
    /// `self` already had that line at zero hits.
    pub fn merge(&mut self, other: &CoverageReport) -> Vec<(String, u32)> {
        let mut new_lines = Vec::new();
        for (file, other_file_cov) in &other.files {
            let entry = self.files.entry(file.clone()).or_default();
            for (&line, &hits) in &other_file_cov.lines {
                match entry.lines.get_mut(&line) {
                    Some(existing) => *existing = (*existing).max(hits),
                    None => {
                        entry.lines.insert(line, hits);
                        new_lines.push((file.clone(), line));
                    }
                }
            }
        }
        new_lines
    }

    pub fn lines_hit(&self) -> u64 {
        self.files
            .values()
            .flat_map(|f| f.lines.values())
            .filter(|&&hits| hits > 0)
            .count() as u64
    }

    pub fn lines_total(&self) -> u64 {
        self.files.values().map(|f| f.lines.len() as u64).sum()
    }

    pub fn basis_points(&self) -> u32 {
        basis_points(self.lines_hit(), self.lines_total())
    }
}

/// `10000 * hit / total`, rounded to the nearest integer. `0/0` is defined
/// as `0`: an empty report has covered nothing of nothing.
pub fn basis_points(hit: u64, total: u64) -> u32 {
    if total == 0 {
        return 0;
    }
    (((hit * 10_000) as f64 / total as f64).round()) as u32
}

pub struct CoverageOutcome {
    pub old_basis_points: u32,
    pub new_basis_points: u32,
    pub per_file_new_lines: Vec<(String, u32)>,
}

/// Drives `gcovr_command`, parses its JSON, and merges it into the
/// accumulated report at `total_report_path`.
///
/// Merges are serialized behind a mutex: two seeds finishing concurrently
/// must not race to read-modify-write the same accumulated report file.
pub struct CoverageTracker {
    pub gcovr_exec_path: PathBuf,
    pub gcovr_command: Vec<String>,
    pub total_report_path: PathBuf,
    pub source_parent_path: PathBuf,
    lock: Mutex<()>,
}

impl CoverageTracker {
    pub fn new(
        gcovr_exec_path: PathBuf,
        gcovr_command: Vec<String>,
        total_report_path: PathBuf,
        source_parent_path: PathBuf,
    ) -> Self {
        CoverageTracker {
            gcovr_exec_path,
            gcovr_command,
            total_report_path,
            source_parent_path,
            lock: Mutex::new(()),
        }
    }

    /// Runs the coverage tool in `source_parent_path`, then merges whatever
    /// it produced into the accumulated report.
    ///
    /// A non-zero exit from the coverage tool is treated as "no new
    /// coverage" rather than propagated: a gcovr hiccup on one seed
    /// shouldn't abort the run, it should just look like a seed that found
    /// nothing new.
    pub fn measure(&self) -> Result<CoverageOutcome> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut report = CoverageReport::load(&self.total_report_path)?;
        let old_basis_points = report.basis_points();

        let run_result = runner::run(
            &self.gcovr_exec_path,
            &self.gcovr_command,
            Duration::from_secs(120),
        );
        let output = match run_result {
            Ok(out) if out.exit_code == 0 => out,
            Ok(_) | Err(_) => {
                return Ok(CoverageOutcome {
                    old_basis_points,
                    new_basis_points: old_basis_points,
                    per_file_new_lines: Vec::new(),
                });
            }
        };

        let incoming: CoverageReport = serde_json::from_slice(&output.stdout)
            .map_err(|e| FuzzError::CoverageToolFailed(format!("bad gcovr JSON: {e}")))?;
        let new_lines = report.merge(&incoming);
        let new_basis_points = report.basis_points();
        report.save(&self.total_report_path)?;

        Ok(CoverageOutcome {
            old_basis_points,
            new_basis_points,
            per_file_new_lines: new_lines,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(lines: &[(u32, u64)]) -> CoverageReport {
        let mut r = CoverageReport::default();
        let mut fc = FileCoverage::default();
        for &(l, h) in lines {
            fc.lines.insert(l, h);
        }
        r.files.insert("foo.c".to_string(), fc);
        r
    }

    #[test]
    fn merge_unions_lines_and_takes_max_hits() {
        let mut a = sample(&[(1, 1), (2, 0)]);
        let b = sample(&[(2, 3), (3, 5)]);
        let new_lines = a.merge(&b);
        assert_eq!(a.files["foo.c"].lines[&1], 1);
        assert_eq!(a.files["foo.c"].lines[&2], 3);
        assert_eq!(a.files["foo.c"].lines[&3], 5);
        assert_eq!(new_lines, vec![("foo.c".to_string(), 3)]);
    }

    #[test]
    fn merging_a_report_into_a_copy_of_itself_is_a_no_op() {
        let mut a = sample(&[(1, 4), (2, 7)]);
        let snapshot = a.clone();
        let new_lines = a.merge(&snapshot);
        assert_eq!(a.files["foo.c"].lines[&1], 4);
        assert_eq!(a.files["foo.c"].lines[&2], 7);
        assert!(new_lines.is_empty());
    }

    #[test]
    fn merge_does_not_double_count_an_unchanged_rerun() {
        let mut accumulated = CoverageReport::default();
        let incoming = sample(&[(1, 1), (2, 1)]);
        accumulated.merge(&incoming);
        let bp_after_first = accumulated.basis_points();
        accumulated.merge(&incoming);
        assert_eq!(accumulated.basis_points(), bp_after_first);
    }

    #[test]
    fn basis_points_rounds_and_handles_empty() {
        assert_eq!(basis_points(0, 0), 0);
        assert_eq!(basis_points(1, 2), 5000);
        assert_eq!(basis_points(1, 3), 3333);
        assert_eq!(basis_points(2, 3), 6667);
    }

    #[test]
    fn save_then_load_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("state/total.json");
        let report = sample(&[(10, 2)]);
        report.save(&path).unwrap();
        let loaded = CoverageReport::load(&path).unwrap();
        assert_eq!(loaded.files["foo.c"].lines[&10], 2);
    }

    #[test]
    fn load_missing_file_is_empty_report() {
        let tmp = tempfile::tempdir().unwrap();
        let loaded = CoverageReport::load(&tmp.path().join("nope.json")).unwrap();
        assert_eq!(loaded.lines_total(), 0);
    }

    #[test]
    fn failing_coverage_tool_yields_zero_delta_not_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let tracker = CoverageTracker::new(
            PathBuf::from("/bin/false"),
            vec![],
            tmp.path().join("state/total.json"),
            tmp.path().to_path_buf(),
        );
        let outcome = tracker.measure().unwrap();
        assert_eq!(outcome.old_basis_points, outcome.new_basis_points);
        assert!(outcome.per_file_new_lines.is_empty());
    }
}
