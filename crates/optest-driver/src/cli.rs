use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use optest_runtime::QuantMode;

#[derive(Parser, Debug)]
#[command(name = "optest", version, about = "Accelerator operator test harness")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum Quant {
    /// Device-native fixed-point cast
    NoQuant,
    /// Fit quantization parameters in software
    Software,
}

impl From<Quant> for QuantMode {
    fn from(q: Quant) -> Self {
        match q {
            Quant::NoQuant => QuantMode::NoQuant,
            Quant::Software => QuantMode::Software,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run case files against the host backend
    Run {
        /// Case files (JSON). DIFF4 is accepted only as an informational
        /// criterion.
        #[arg(long = "case", required = true, num_args = 1..)]
        cases: Vec<PathBuf>,

        /// Timed launches after the correctness run
        #[arg(long, default_value_t = 1)]
        perf_repeat: u32,

        /// Device side only, no reference comparison
        #[arg(long)]
        mlu_only: bool,

        /// Feed all-zero inputs
        #[arg(long)]
        zero_input: bool,

        /// Also report DIFF1..DIFF3
        #[arg(long)]
        fixed_criterion: bool,

        #[arg(long, value_enum, default_value = "no-quant")]
        quant: Quant,

        /// Baseline file to check performance against
        #[arg(long)]
        baseline: Option<PathBuf>,

        /// Write passing results back into the baseline file
        #[arg(long, requires = "baseline")]
        update_baseline: bool,

        /// Log level (RUST_LOG)
        #[arg(long, default_value = "info")]
        log: String,
    },
    /// List runnable operators
    Ops,
}
