//! The command line interface of the fuzzer.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(about = "Coverage-guided, LLM-assisted fuzzer for an instrumented C/C++ compiler")]
pub struct Cli {
    #[arg(help = "Path to the YAML configuration file", short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Pre-populate initial_seeds/{isa}/{strategy}/ with an understanding.md and seed directories.
    Generate {
        #[arg(long = "isa", required = true)]
        isa: String,

        #[arg(long = "strategy", required = true)]
        strategy: String,

        #[arg(long = "output")]
        output: Option<PathBuf>,

        #[arg(long = "count", default_value = "4")]
        count: u32,
    },
    /// Run the fuzzing engine, resuming from prior state if present.
    Fuzz {
        #[arg(long = "output-root")]
        output_root: Option<PathBuf>,

        #[arg(long = "max-iterations")]
        max_iterations: Option<u64>,

        #[arg(long = "max-new-seeds")]
        max_new_seeds: Option<u32>,

        #[arg(long = "timeout")]
        timeout: Option<u64>,

        #[arg(long = "use-qemu", default_value = "false")]
        use_qemu: bool,

        #[arg(long = "qemu-path")]
        qemu_path: Option<PathBuf>,

        #[arg(long = "qemu-sysroot")]
        qemu_sysroot: Option<PathBuf>,

        #[arg(long = "ui", default_value = "false", help = "Print a plain line-oriented progress report")]
        ui: bool,
    },
}
