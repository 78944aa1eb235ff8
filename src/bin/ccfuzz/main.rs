mod cli;

use std::fs;
use std::path::PathBuf;
use std::process::exit;
use std::time::Duration;

use clap::Parser;

use ccfuzz::cfg::{CfgIndex, CoverageMapping};
use ccfuzz::compiler::CompilerDriver;
use ccfuzz::config::{Config, ConfigOverrides};
use ccfuzz::corpus::CorpusManager;
use ccfuzz::coverage::CoverageTracker;
use ccfuzz::engine::{install_shutdown_flag, Engine, EngineConfig};
use ccfuzz::error::{FuzzError, Result};
use ccfuzz::executor::{EmulatorExecutor, Executor, LocalExecutor};
use ccfuzz::llm::{LlmClient, StubLlmClient};
use ccfuzz::oracle::{CrashDetector, Oracle};
use ccfuzz::seed::{Seed, TestCase};
use ccfuzz::selector::TargetSelector;

use cli::{Cli, Command};

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let result = match &cli.command {
        Command::Generate {
            isa,
            strategy,
            output,
            count,
        } => run_generate(&cli, isa, strategy, output.as_deref(), *count),
        Command::Fuzz { .. } => run_fuzz(&cli),
    };

    match result {
        Ok(()) => exit(0),
        Err(e) => {
            log::error!("fatal: {e}");
            exit(1);
        }
    }
}

fn run_generate(
    cli: &Cli,
    isa: &str,
    strategy: &str,
    output: Option<&std::path::Path>,
    count: u32,
) -> Result<()> {
    let mut config = Config::load(cli.config.as_deref()).unwrap_or_default();
    config.apply_overrides(&ConfigOverrides {
        isa: Some(isa.to_string()),
        strategy: Some(strategy.to_string()),
        ..Default::default()
    });

    let output_root = output
        .map(PathBuf::from)
        .unwrap_or_else(|| config.compiler.fuzz.output_root_dir.clone());
    let seeds_dir = output_root.join("initial_seeds").join(isa).join(strategy);
    fs::create_dir_all(&seeds_dir)?;

    let llm = StubLlmClient::new();
    let understanding = llm.understand(&format!(
        "Describe the C-level constructs most likely to exercise the {strategy} defense strategy on {isa}."
    ))?;
    fs::write(seeds_dir.join("understanding.md"), &understanding)?;

    for i in 0..count {
        let seed = llm.generate(&understanding, &format!("seed #{i} for {isa}/{strategy}"))?;
        let dir = seeds_dir.join(format!("seed-{i:04}"));
        fs::create_dir_all(&dir)?;
        fs::write(dir.join("source.c"), &seed.content)?;
        let test_cases = if seed.test_cases.is_empty() {
            vec![TestCase {
                command_template: "./a.out".to_string(),
                expected_stdout_substring: String::new(),
            }]
        } else {
            seed.test_cases
        };
        fs::write(
            dir.join("test_cases.json"),
            serde_json::to_vec_pretty(&test_cases)?,
        )?;
    }
    log::info!("generated {count} seeds under {}", seeds_dir.display());
    Ok(())
}

/// Loads `seeds_dir/seed-*/{source.c,test_cases.json}` into `corpus`, sorted
/// by directory name so a single seed under an otherwise-empty corpus is
/// guaranteed to land with ID 1. A directory missing `source.c` is skipped
/// with a warning rather than aborting the whole run.
fn bootstrap_initial_seeds(corpus: &CorpusManager, seeds_dir: &std::path::Path) -> Result<()> {
    if !seeds_dir.exists() {
        return Ok(());
    }
    let mut entries: Vec<_> = fs::read_dir(seeds_dir)?
        .filter_map(std::result::Result::ok)
        .filter(|e| e.path().is_dir())
        .collect();
    entries.sort_by_key(|e| e.path());

    let mut loaded = 0u32;
    for entry in entries {
        let dir = entry.path();
        let source_path = dir.join("source.c");
        let Ok(content) = fs::read_to_string(&source_path) else {
            log::warn!("skipping initial seed dir with no source.c: {}", dir.display());
            continue;
        };
        let test_cases_path = dir.join("test_cases.json");
        let test_cases: Vec<TestCase> = match fs::read_to_string(&test_cases_path) {
            Ok(data) => serde_json::from_str(&data)?,
            Err(_) => vec![TestCase {
                command_template: "./a.out".to_string(),
                expected_stdout_substring: String::new(),
            }],
        };
        corpus.add(Seed::new(content, test_cases, 0, 0))?;
        loaded += 1;
    }
    log::info!("loaded {loaded} initial seeds from {}", seeds_dir.display());
    Ok(())
}

fn run_fuzz(cli: &Cli) -> Result<()> {
    let config_path = cli
        .config
        .clone()
        .ok_or_else(|| FuzzError::Config("fuzz requires --config".to_string()))?;
    let mut config = Config::load(Some(&config_path))?;

    let Command::Fuzz {
        output_root,
        max_iterations,
        max_new_seeds,
        timeout,
        use_qemu,
        qemu_path,
        qemu_sysroot,
        ui,
    } = &cli.command
    else {
        unreachable!("run_fuzz only called for the Fuzz subcommand");
    };

    config.apply_overrides(&ConfigOverrides {
        output_root_dir: output_root.clone(),
        max_iterations: *max_iterations,
        max_new_seeds: *max_new_seeds,
        timeout: *timeout,
        use_qemu: Some(*use_qemu),
        qemu_path: qemu_path.clone(),
        qemu_sysroot: qemu_sysroot.clone(),
        ..Default::default()
    });

    let understanding_path = config
        .compiler
        .fuzz
        .output_root_dir
        .join("initial_seeds")
        .join(&config.isa)
        .join(&config.strategy)
        .join("understanding.md");
    let understanding = fs::read_to_string(&understanding_path)
        .map_err(|_| FuzzError::UnderstandingMissing(understanding_path.clone()))?;

    let corpus = CorpusManager::new(config.corpus_root());
    corpus.initialize()?;
    corpus.recover()?;
    if corpus.global_state().last_allocated_id == 0 {
        let seeds_dir = config
            .compiler
            .fuzz
            .output_root_dir
            .join("initial_seeds")
            .join(&config.isa)
            .join(&config.strategy);
        bootstrap_initial_seeds(&corpus, &seeds_dir)?;
    }

    let compiler = CompilerDriver::new(
        config.compiler.path.clone(),
        config.compiler.cflags.clone(),
        corpus.build_dir(),
        Duration::from_secs(config.compiler.fuzz.timeout),
    );
    let coverage = CoverageTracker::new(
        config.compiler.gcovr_exec_path.clone(),
        config.compiler.gcovr_command.clone(),
        corpus.total_report_path(),
        config.compiler.source_parent_path.clone(),
    );

    let local_executor = LocalExecutor;
    let emulator_executor = config.compiler.fuzz.use_qemu.then(|| EmulatorExecutor {
        emulator_path: config
            .compiler
            .fuzz
            .qemu_path
            .clone()
            .unwrap_or_else(|| PathBuf::from("qemu")),
        sysroot: config.compiler.fuzz.qemu_sysroot.clone(),
    });
    let executor: &dyn Executor = match &emulator_executor {
        Some(e) => e,
        None => &local_executor,
    };

    let oracle = build_oracle(&config)?;
    let llm = StubLlmClient::new();

    let engine_config = EngineConfig {
        max_iterations: config.compiler.fuzz.max_iterations,
        max_new_seeds: config.compiler.fuzz.max_new_seeds,
        max_constraint_retries: config.compiler.fuzz.max_constraint_retries,
        timeout: Duration::from_secs(config.compiler.fuzz.timeout),
        progress: *ui,
    };
    let quitting = install_shutdown_flag()?;

    let engine = Engine {
        corpus: &corpus,
        compiler: &compiler,
        coverage: &coverage,
        executor,
        oracle: oracle.as_ref(),
        llm: &llm,
        understanding,
        config: engine_config,
        quitting,
    };

    let stats = if let Some(cfg_path) = &config.compiler.fuzz.cfg_file_path {
        let target_functions: Vec<String> = config
            .compiler
            .targets
            .iter()
            .flat_map(|t| t.functions.clone())
            .collect();
        let cfg_index = CfgIndex::load(cfg_path, &target_functions)?;
        let mapping_path = config
            .compiler
            .fuzz
            .mapping_path
            .clone()
            .unwrap_or_else(|| corpus.coverage_mapping_path());
        let mut mapping = CoverageMapping::load(&mapping_path)?;
        let mut selector = TargetSelector::new(config.compiler.fuzz.max_constraint_retries);
        engine.run_cfg_guided(&cfg_index, &mut mapping, &mut selector)?
    } else {
        engine.run_coverage_guided()?
    };

    log::info!(
        "fuzzing finished: {} iterations, {} compile failures, {} timeouts, {} bugs found",
        stats.iterations,
        stats.compile_failures,
        stats.timeouts,
        stats.bugs_found
    );
    Ok(())
}

fn build_oracle(config: &Config) -> Result<Box<dyn Oracle>> {
    match config.compiler.oracle.r#type.as_str() {
        "crash-detector" | "" => Ok(Box::new(CrashDetector)),
        other => Err(FuzzError::Config(format!(
            "unsupported oracle.type for this build: {other}"
        ))),
    }
}
