//! Typed configuration, loaded from YAML with a CLI-flag override pass.
//!
//! Deliberately minimal: one deserialize, then a handful of `if let Some`
//! overrides. No schema validation DSL — the typed struct tree and serde's
//! own error messages are the validation.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{FuzzError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: String,
    pub model: String,
    pub api_key: Option<String>,
    pub endpoint: Option<String>,
    pub temperature: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        LlmConfig {
            provider: "stub".to_string(),
            model: "stub".to_string(),
            api_key: None,
            endpoint: None,
            temperature: 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerConfig {
    pub path: PathBuf,
    pub gcovr_exec_path: PathBuf,
    pub source_parent_path: PathBuf,
    pub gcovr_command: Vec<String>,
    pub total_report_path: PathBuf,
    pub cflags: Vec<String>,
    pub fuzz: FuzzConfig,
    pub oracle: OracleConfig,
    pub targets: Vec<TargetConfig>,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        CompilerConfig {
            path: PathBuf::from("cc"),
            gcovr_exec_path: PathBuf::from("gcovr"),
            source_parent_path: PathBuf::from("."),
            gcovr_command: vec!["--json".to_string(), "-".to_string()],
            total_report_path: PathBuf::from("state/total.json"),
            cflags: Vec::new(),
            fuzz: FuzzConfig::default(),
            oracle: OracleConfig::default(),
            targets: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FuzzConfig {
    pub output_root_dir: PathBuf,
    pub max_iterations: u64,
    pub max_new_seeds: u32,
    pub max_test_cases: u32,
    pub function_template: Option<String>,
    pub timeout: u64,
    pub use_qemu: bool,
    pub qemu_path: Option<PathBuf>,
    pub qemu_sysroot: Option<PathBuf>,
    pub cfg_file_path: Option<PathBuf>,
    pub mapping_path: Option<PathBuf>,
    pub max_constraint_retries: u32,
}

impl Default for FuzzConfig {
    fn default() -> Self {
        FuzzConfig {
            output_root_dir: PathBuf::from("output"),
            max_iterations: 0,
            max_new_seeds: 2,
            max_test_cases: 4,
            function_template: None,
            timeout: 5,
            use_qemu: false,
            qemu_path: None,
            qemu_sysroot: None,
            cfg_file_path: None,
            mapping_path: None,
            max_constraint_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleConfig {
    pub r#type: String,
    pub options: serde_json::Map<String, serde_json::Value>,
}

impl Default for OracleConfig {
    fn default() -> Self {
        OracleConfig {
            r#type: "crash-detector".to_string(),
            options: serde_json::Map::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    pub file: String,
    pub functions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub isa: String,
    pub strategy: String,
    pub log_level: String,
    pub llm: LlmConfig,
    pub compiler: CompilerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            isa: String::new(),
            strategy: String::new(),
            log_level: "info".to_string(),
            llm: LlmConfig::default(),
            compiler: CompilerConfig::default(),
        }
    }
}

/// CLI-supplied overrides, applied after the YAML file is loaded. `None`
/// leaves the loaded (or default) value untouched.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub isa: Option<String>,
    pub strategy: Option<String>,
    pub output_root_dir: Option<PathBuf>,
    pub max_iterations: Option<u64>,
    pub max_new_seeds: Option<u32>,
    pub timeout: Option<u64>,
    pub use_qemu: Option<bool>,
    pub qemu_path: Option<PathBuf>,
    pub qemu_sysroot: Option<PathBuf>,
}

impl Config {
    /// Loads a YAML config file; a missing path yields a config built
    /// entirely from defaults (the caller decides whether that's fatal —
    /// it is for `fuzz`, it isn't for `generate`).
    pub fn load(path: Option<&std::path::Path>) -> Result<Self> {
        match path {
            Some(p) if p.exists() => {
                let data = std::fs::read_to_string(p)?;
                let config: Config = serde_yaml::from_str(&data)?;
                Ok(config)
            }
            Some(p) => Err(FuzzError::Config(format!("config file not found: {}", p.display()))),
            None => Ok(Config::default()),
        }
    }

    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(v) = &overrides.isa {
            self.isa = v.clone();
        }
        if let Some(v) = &overrides.strategy {
            self.strategy = v.clone();
        }
        if let Some(v) = &overrides.output_root_dir {
            self.compiler.fuzz.output_root_dir = v.clone();
        }
        if let Some(v) = overrides.max_iterations {
            self.compiler.fuzz.max_iterations = v;
        }
        if let Some(v) = overrides.max_new_seeds {
            self.compiler.fuzz.max_new_seeds = v;
        }
        if let Some(v) = overrides.timeout {
            self.compiler.fuzz.timeout = v;
        }
        if let Some(v) = overrides.use_qemu {
            self.compiler.fuzz.use_qemu = v;
        }
        if let Some(v) = &overrides.qemu_path {
            self.compiler.fuzz.qemu_path = Some(v.clone());
        }
        if let Some(v) = &overrides.qemu_sysroot {
            self.compiler.fuzz.qemu_sysroot = Some(v.clone());
        }
    }

    /// The directory this (isa, strategy) pair's corpus and state live
    /// under: `{output_root}/{isa}/{strategy}/`.
    pub fn corpus_root(&self) -> PathBuf {
        self.compiler
            .fuzz
            .output_root_dir
            .join(&self.isa)
            .join(&self.strategy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_crash_detector_oracle() {
        let config = Config::default();
        assert_eq!(config.compiler.oracle.r#type, "crash-detector");
    }

    #[test]
    fn missing_file_is_an_error_but_none_is_not() {
        let tmp = tempfile::tempdir().unwrap();
        let missing = tmp.path().join("nope.yaml");
        assert!(Config::load(Some(&missing)).is_err());
        assert!(Config::load(None).is_ok());
    }

    #[test]
    fn loads_yaml_and_applies_overrides() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.yaml");
        std::fs::write(
            &path,
            "isa: riscv64\nstrategy: cfi\ncompiler:\n  fuzz:\n    max_iterations: 100\n",
        )
        .unwrap();
        let mut config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.isa, "riscv64");
        assert_eq!(config.compiler.fuzz.max_iterations, 100);

        config.apply_overrides(&ConfigOverrides {
            max_iterations: Some(5),
            ..Default::default()
        });
        assert_eq!(config.compiler.fuzz.max_iterations, 5);
        assert_eq!(config.isa, "riscv64");
    }

    #[test]
    fn corpus_root_joins_output_isa_strategy() {
        let mut config = Config::default();
        config.isa = "x86_64".to_string();
        config.strategy = "baseline".to_string();
        config.compiler.fuzz.output_root_dir = PathBuf::from("/tmp/out");
        assert_eq!(config.corpus_root(), PathBuf::from("/tmp/out/x86_64/baseline"));
    }
}
