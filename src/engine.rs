//! The controller: pulls a seed or target, compiles, runs, measures,
//! consults the oracle, asks the LLM for mutations, updates the corpus and
//! coverage, and loops until told to stop.
//!
//! Graceful shutdown follows the same shape as a forkserver fuzzing loop
//! elsewhere in this codebase's lineage: a process-wide atomic flag is
//! registered against the termination signals and checked once per loop
//! iteration, so the current iteration's write-backs always finish before
//! the loop actually exits.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use signal_hook::consts::TERM_SIGNALS;

use crate::cfg::CfgIndex;
use crate::compiler::CompilerDriver;
use crate::corpus::CorpusManager;
use crate::coverage::CoverageTracker;
use crate::executor::Executor;
use crate::llm::LlmClient;
use crate::oracle::{Oracle, OracleVerdict};
use crate::seed::{Seed, SeedState, Verdict};
use crate::selector::TargetSelector;

pub struct EngineConfig {
    pub max_iterations: u64,
    pub max_new_seeds: u32,
    pub max_constraint_retries: u32,
    pub timeout: Duration,
    /// Print a plain line-oriented progress report, one line per iteration.
    pub progress: bool,
}

pub struct EngineStats {
    pub iterations: u64,
    pub compile_failures: u64,
    pub timeouts: u64,
    pub bugs_found: u64,
}

impl Default for EngineStats {
    fn default() -> Self {
        EngineStats {
            iterations: 0,
            compile_failures: 0,
            timeouts: 0,
            bugs_found: 0,
        }
    }
}

/// Registers the graceful-shutdown flag against `SIGINT`/`SIGTERM` and
/// friends. Call once before [`Engine::run_coverage_guided`] or
/// [`Engine::run_cfg_guided`].
pub fn install_shutdown_flag() -> std::io::Result<Arc<AtomicBool>> {
    let quitting = Arc::new(AtomicBool::new(false));
    for sig in TERM_SIGNALS {
        signal_hook::flag::register(*sig, Arc::clone(&quitting))
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    }
    Ok(quitting)
}

pub struct Engine<'a> {
    pub corpus: &'a CorpusManager,
    pub compiler: &'a CompilerDriver,
    pub coverage: &'a CoverageTracker,
    pub executor: &'a dyn Executor,
    pub oracle: &'a dyn Oracle,
    pub llm: &'a dyn LlmClient,
    pub understanding: String,
    pub config: EngineConfig,
    pub quitting: Arc<AtomicBool>,
}

impl<'a> Engine<'a> {
    /// Pop → compile → run → measure → oracle → report → maybe-spawn, until
    /// the queue empties, `max_iterations` is hit, or a shutdown signal
    /// arrives. Always finalizes the corpus before returning, on every exit
    /// path.
    pub fn run_coverage_guided(&self) -> crate::error::Result<EngineStats> {
        let mut stats = EngineStats::default();
        loop {
            if self.quitting.load(Ordering::Relaxed) {
                log::debug!("received quitting signal, stopping fuzzing");
                break;
            }
            if self.config.max_iterations != 0 && stats.iterations >= self.config.max_iterations {
                log::info!("reached max_iterations={}", self.config.max_iterations);
                break;
            }

            let (seed, ok) = self.corpus.next()?;
            let Some(seed) = seed.filter(|_| ok) else {
                log::info!("queue empty, stopping fuzzing");
                break;
            };

            self.process_one(seed, &mut stats)?;
            stats.iterations += 1;
            if self.config.progress {
                println!(
                    "iter={} compile_failures={} timeouts={} bugs_found={} queue_len={}",
                    stats.iterations,
                    stats.compile_failures,
                    stats.timeouts,
                    stats.bugs_found,
                    self.corpus.queue_len()
                );
            }
        }
        self.corpus.finalize()?;
        Ok(stats)
    }

    /// CFG-guided loop: repeatedly asks the target selector for the next
    /// uncovered basic block and drives a bounded constraint-refinement
    /// loop against the LLM to try to reach it.
    pub fn run_cfg_guided(
        &self,
        cfg: &CfgIndex,
        mapping: &mut crate::cfg::CoverageMapping,
        selector: &mut TargetSelector,
    ) -> crate::error::Result<EngineStats> {
        let mut stats = EngineStats::default();
        loop {
            if self.quitting.load(Ordering::Relaxed) {
                log::debug!("received quitting signal, stopping fuzzing");
                break;
            }
            if self.config.max_iterations != 0 && stats.iterations >= self.config.max_iterations {
                log::info!("reached max_iterations={}", self.config.max_iterations);
                break;
            }
            let Some(target) = selector.next_target(cfg, mapping) else {
                log::info!("no uncovered targets remain, stopping fuzzing");
                break;
            };
            let target_id = target.id;
            let closest_seed_id = selector.closest_approach(cfg, mapping, target);
            let closest_seed = closest_seed_id.and_then(|id| self.corpus.get(id));

            let mut divergence: Option<String> = None;
            let mut reached = false;
            for _ in 0..self.config.max_constraint_retries {
                if self.quitting.load(Ordering::Relaxed) {
                    break;
                }
                let candidate = match &closest_seed {
                    Some(parent) => self.llm.mutate(&self.understanding, parent, divergence.as_deref()),
                    None => self.llm.generate(
                        &self.understanding,
                        &format!("reach basic block {target_id} in {}", target.file),
                    ),
                };
                let candidate = match candidate {
                    Ok(c) => c,
                    Err(e) => {
                        log::warn!("llm request failed while targeting basic block {target_id}: {e}");
                        divergence = Some(format!("llm request failed: {e}"));
                        continue;
                    }
                };

                self.corpus.add(candidate)?;
                let (popped, ok) = self.corpus.next()?;
                let mut seed = popped.filter(|_| ok).expect("just added, queue cannot be empty");
                let outcome = self.run_one_seed(&mut seed, &mut stats)?;

                if outcome.covered_block(cfg, target_id) {
                    mapping.mark_covered(target_id, seed.id);
                    self.save_mapping(mapping)?;
                    reached = true;
                    break;
                }
                divergence = Some(format!(
                    "new coverage delta was {} basis points, target block {target_id} still uncovered",
                    outcome.coverage_delta_bp
                ));
            }
            if !reached {
                selector.record_failed_attempt(target_id);
                log::warn!("failed to reach basic block {target_id} within retry budget");
            }
            stats.iterations += 1;
            if self.config.progress {
                println!(
                    "iter={} target_block={target_id} reached={reached} bugs_found={}",
                    stats.iterations, stats.bugs_found
                );
            }
        }
        self.corpus.finalize()?;
        Ok(stats)
    }

    fn save_mapping(&self, mapping: &crate::cfg::CoverageMapping) -> crate::error::Result<()> {
        mapping.save(&self.corpus.coverage_mapping_path())
    }

    fn process_one(&self, seed: Seed, stats: &mut EngineStats) -> crate::error::Result<()> {
        let mut seed = seed;
        let outcome = self.run_one_seed(&mut seed, stats)?;

        if outcome.coverage_delta_bp > 0 && !outcome.is_bug {
            for _ in 0..self.config.max_new_seeds {
                match self.llm.mutate(&self.understanding, &seed, None) {
                    Ok(child) => {
                        self.corpus.add(child)?;
                    }
                    Err(e) => {
                        log::warn!("llm mutation request failed: {e}");
                    }
                }
            }
        }
        Ok(())
    }

    /// Drives one seed through compile → execute → measure → oracle →
    /// report, returning the delta so both engine modes can branch on it.
    fn run_one_seed(&self, seed: &mut Seed, stats: &mut EngineStats) -> crate::error::Result<SeedOutcome> {
        let compiled = self.compiler.compile(seed)?;
        if !compiled.success {
            stats.compile_failures += 1;
            self.corpus
                .report_result(seed.id, SeedState::CompileFailed, 0, 0, None, None)?;
            return Ok(SeedOutcome::default());
        }

        let start = Instant::now();
        let results = self
            .executor
            .execute(seed, &compiled.binary_path, self.config.timeout)?;
        let exec_time_micros = start.elapsed().as_micros() as u64;

        if results.iter().any(|r| r.timed_out) {
            stats.timeouts += 1;
            self.corpus.report_result(
                seed.id,
                SeedState::Timeout,
                0,
                0,
                None,
                Some(exec_time_micros),
            )?;
            return Ok(SeedOutcome::default());
        }

        let coverage = self.coverage.measure()?;
        let verdict = match self.oracle.evaluate(seed, &results) {
            Ok(v) => v,
            Err(e) => {
                log::warn!("oracle evaluation failed for seed {}: {e}", seed.id);
                OracleVerdict {
                    verdict: Verdict::Error,
                    bug_kind: None,
                    description: Some(e.to_string()),
                }
            }
        };
        let is_bug = verdict.verdict == Verdict::Bug;
        if is_bug {
            stats.bugs_found += 1;
        }
        let crashed = results.iter().any(|r| r.exit_code >= 128);
        let state = if crashed {
            SeedState::Crash
        } else {
            SeedState::Processed
        };

        self.corpus.report_result(
            seed.id,
            state,
            coverage.old_basis_points,
            coverage.new_basis_points,
            Some(verdict),
            Some(exec_time_micros),
        )?;

        Ok(SeedOutcome {
            coverage_delta_bp: coverage.new_basis_points.saturating_sub(coverage.old_basis_points),
            new_lines: coverage.per_file_new_lines,
            is_bug,
        })
    }
}

#[derive(Default)]
struct SeedOutcome {
    coverage_delta_bp: u32,
    new_lines: Vec<(String, u32)>,
    is_bug: bool,
}

impl SeedOutcome {
    /// Whether this seed's run is the reason a target block should be
    /// considered covered: one of its newly-hit lines falls inside the
    /// block's own `(file, line)` set, not just anywhere in the report.
    fn covered_block(&self, cfg: &CfgIndex, block_id: u32) -> bool {
        let Some(block) = cfg.basic_block(block_id) else {
            return false;
        };
        self.new_lines
            .iter()
            .any(|(file, line)| file == &block.file && block.lines.contains(line))
    }
}

#[allow(dead_code)]
pub fn understanding_path(output_root: &std::path::Path, isa: &str, strategy: &str) -> PathBuf {
    output_root
        .join("initial_seeds")
        .join(isa)
        .join(strategy)
        .join("understanding.md")
}
