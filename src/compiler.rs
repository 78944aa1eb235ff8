//! Invokes the instrumented compiler under test on a seed's source.
//!
//! The driver never instruments anything itself — the compiler binary is
//! already instrumented by whoever built it; compiling a seed is simply how
//! that instrumentation gets exercised.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Result;
use crate::runner;
use crate::seed::Seed;

pub struct CompileOutcome {
    pub success: bool,
    pub binary_path: PathBuf,
    pub stderr: String,
}

pub struct CompilerDriver {
    pub compiler_path: PathBuf,
    pub cflags: Vec<String>,
    pub build_dir: PathBuf,
    pub compile_timeout: Duration,
}

impl CompilerDriver {
    pub fn new(
        compiler_path: PathBuf,
        cflags: Vec<String>,
        build_dir: PathBuf,
        compile_timeout: Duration,
    ) -> Self {
        CompilerDriver {
            compiler_path,
            cflags,
            build_dir,
            compile_timeout,
        }
    }

    /// Writes `seed.content` into `build/<id>/source.c`, then invokes the
    /// compiler with `cflags` plus `-o build/<id>/a.out`.
    ///
    /// Success is `exit == 0 AND the output file exists`: a compiler that
    /// prints nothing but also emits no binary is still a failure.
    pub fn compile(&self, seed: &Seed) -> Result<CompileOutcome> {
        let seed_build_dir = self.build_dir.join(seed.id.to_string());
        fs::create_dir_all(&seed_build_dir)?;

        let source_path = seed_build_dir.join("source.c");
        fs::write(&source_path, &seed.content)?;

        let binary_path = seed_build_dir.join("a.out");

        let mut argv: Vec<String> = self.cflags.clone();
        argv.push(source_path.to_string_lossy().into_owned());
        argv.push("-o".to_string());
        argv.push(binary_path.to_string_lossy().into_owned());

        let out = runner::run(&self.compiler_path, &argv, self.compile_timeout)?;
        let success = out.exit_code == 0 && binary_path.exists();

        Ok(CompileOutcome {
            success,
            binary_path,
            stderr: out.stderr_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::seed::Seed;

    /// A tiny stand-in "compiler" that writes its last argument (the `-o`
    /// target) as an empty executable file and exits zero, so compile tests
    /// don't depend on a real cc being installed.
    fn fake_compiler_script(dir: &Path) -> PathBuf {
        let path = dir.join("fake-cc.sh");
        fs::write(
            &path,
            "#!/bin/sh\nfor out; do :; done\ntouch \"$out\"\nchmod +x \"$out\"\nexit 0\n",
        )
        .unwrap();
        let mut perms = fs::metadata(&path).unwrap().permissions();
        std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o755);
        fs::set_permissions(&path, perms).unwrap();
        path
    }

    #[test]
    fn successful_compile_writes_source_and_produces_binary() {
        let tmp = tempfile::tempdir().unwrap();
        let compiler = fake_compiler_script(tmp.path());
        let driver = CompilerDriver::new(
            compiler,
            vec![],
            tmp.path().join("build"),
            Duration::from_secs(5),
        );
        let mut seed = Seed::new("int main(){return 0;}".to_string(), vec![], 0, 0);
        seed.id = 1;

        let outcome = driver.compile(&seed).unwrap();
        assert!(outcome.success);
        assert!(outcome.binary_path.exists());
        assert_eq!(
            fs::read_to_string(tmp.path().join("build/1/source.c")).unwrap(),
            "int main(){return 0;}"
        );
    }

    #[test]
    fn failing_compiler_reports_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let driver = CompilerDriver::new(
            PathBuf::from("/bin/false"),
            vec![],
            tmp.path().join("build"),
            Duration::from_secs(5),
        );
        let mut seed = Seed::new("int main(){".to_string(), vec![], 0, 0);
        seed.id = 2;

        let outcome = driver.compile(&seed).unwrap();
        assert!(!outcome.success);
    }
}
