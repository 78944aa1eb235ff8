//! Runs a compiled binary against a seed's test cases, locally or under a
//! user-mode emulator.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Result;
use crate::runner::{self, CommandOutput};
use crate::seed::{Seed, TestCase};

/// The outcome of running one [`TestCase`].
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub timed_out: bool,
    pub wall_time: Duration,
    pub stdout_matched_expected: bool,
}

/// Expands the placeholders a test-case command template may contain —
/// `./a.out`, `./program`, `$BINARY` — into the given binary path, leaving
/// everything else untouched.
///
/// Only one placeholder form is expected per template, but all three are
/// always substituted in case a template uses more than one; none of them
/// can appear as a substring of the others, so there's no ambiguity in
/// which occurrences get replaced.
pub fn expand_command_template(template: &str, binary_path: &Path) -> String {
    let binary = binary_path.to_string_lossy();
    template
        .replace("./a.out", binary.as_ref())
        .replace("./program", binary.as_ref())
        .replace("$BINARY", binary.as_ref())
}

/// Splits an expanded command line into argv the way a shell-free spawn
/// needs: naive whitespace splitting. Test-case templates are expected to be
/// simple (`./a.out --flag arg`), not shell scripts.
fn split_argv(command: &str) -> Vec<String> {
    command.split_whitespace().map(str::to_owned).collect()
}

/// Where and how the compiled binary actually runs.
pub trait Executor {
    /// Runs every test case of `seed` against `binary_path`, in order,
    /// applying `timeout` per test case. Returns one result per test case,
    /// even if a test case crashes or times out — the caller inspects the
    /// sequence to decide the seed's fate.
    fn execute(
        &self,
        seed: &Seed,
        binary_path: &Path,
        timeout: Duration,
    ) -> Result<Vec<ExecutionResult>>;
}

/// Executes on the host's native architecture directly.
pub struct LocalExecutor;

impl Executor for LocalExecutor {
    fn execute(
        &self,
        seed: &Seed,
        binary_path: &Path,
        timeout: Duration,
    ) -> Result<Vec<ExecutionResult>> {
        run_test_cases(&seed.test_cases, binary_path, timeout, |argv, timeout| {
            let program = PathBuf::from(&argv[0]);
            let rest = &argv[1..];
            runner::run(&program, rest, timeout)
        })
    }
}

/// Wraps the binary in a user-mode emulator (e.g. `qemu-ISA`), optionally
/// pointed at a sysroot via `-L`.
pub struct EmulatorExecutor {
    pub emulator_path: PathBuf,
    pub sysroot: Option<PathBuf>,
}

impl Executor for EmulatorExecutor {
    fn execute(
        &self,
        seed: &Seed,
        binary_path: &Path,
        timeout: Duration,
    ) -> Result<Vec<ExecutionResult>> {
        run_test_cases(&seed.test_cases, binary_path, timeout, |argv, timeout| {
            let mut emu_argv = Vec::new();
            if let Some(sysroot) = &self.sysroot {
                emu_argv.push("-L".to_string());
                emu_argv.push(sysroot.to_string_lossy().into_owned());
            }
            emu_argv.extend(argv.iter().cloned());
            let out = runner::run(&self.emulator_path, &emu_argv, timeout)?;
            let stderr = out.stderr_string();
            let decoded = runner::decode_emulator_signal(&stderr, out.exit_code);
            Ok(CommandOutput {
                exit_code: decoded,
                ..out
            })
        })
    }
}

fn run_test_cases(
    test_cases: &[TestCase],
    binary_path: &Path,
    timeout: Duration,
    mut invoke: impl FnMut(&[String], Duration) -> Result<CommandOutput>,
) -> Result<Vec<ExecutionResult>> {
    let mut results = Vec::with_capacity(test_cases.len());
    for tc in test_cases {
        let expanded = expand_command_template(&tc.command_template, binary_path);
        let argv = split_argv(&expanded);
        let out = invoke(&argv, timeout)?;
        let stdout = out.stdout_string();
        let stdout_matched_expected = stdout.contains(&tc.expected_stdout_substring);
        results.push(ExecutionResult {
            stderr: out.stderr_string(),
            exit_code: out.exit_code,
            timed_out: out.timed_out,
            wall_time: out.wall_time,
            stdout,
            stdout_matched_expected,
        });
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_all_three_placeholders() {
        let bin = Path::new("/tmp/build/1/a.out");
        assert_eq!(
            expand_command_template("./a.out --flag", bin),
            "/tmp/build/1/a.out --flag"
        );
        assert_eq!(
            expand_command_template("./program x y", bin),
            "/tmp/build/1/a.out x y"
        );
        assert_eq!(
            expand_command_template("$BINARY --seed=1", bin),
            "/tmp/build/1/a.out --seed=1"
        );
    }

    #[test]
    fn leaves_other_tokens_verbatim() {
        let bin = Path::new("/bin/true");
        assert_eq!(
            expand_command_template("./a.out --in in.txt --out out.txt", bin),
            "/bin/true --in in.txt --out out.txt"
        );
    }

    #[test]
    fn local_executor_runs_every_test_case() {
        let seed = Seed::new(
            String::new(),
            vec![
                TestCase {
                    command_template: "./a.out hi".to_string(),
                    expected_stdout_substring: "hi".to_string(),
                },
                TestCase {
                    command_template: "./a.out bye".to_string(),
                    expected_stdout_substring: "nope".to_string(),
                },
            ],
            0,
            0,
        );
        let results = LocalExecutor
            .execute(&seed, Path::new("/bin/echo"), Duration::from_secs(5))
            .unwrap();
        assert_eq!(results.len(), 2);
        assert!(results[0].stdout_matched_expected);
        assert!(!results[1].stdout_matched_expected);
    }
}
