//! semisparse - 2:4 semi-structured sparsity CLI
//!
//! Usage:
//!   semisparse bench --mode nvidia-bert          # Dense vs 2:4 latency suite
//!   semisparse bench --mode test -o ./results    # Write ./results/test.csv
//!   semisparse checkpoint                        # 2x2 round trip in a temp dir
//!   semisparse checkpoint --dp 4 --tp 2 --dir ./ckpt

use clap::{Parser, Subcommand};
use semisparse::bench::BenchMode;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::EnvFilter;

mod commands;
mod error;
mod output;

use commands::{bench, checkpoint};

/// semisparse - 2:4 semi-structured sparsity tool
///
/// Benchmark compressed matmul against dense GEMM and check 2D-parallel
/// sharded checkpoints.
#[derive(Parser)]
#[command(name = "semisparse")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Quiet mode (errors only)
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Time dense vs 2:4 sparse products over a shape suite
    Bench {
        /// Suite: nvidia-bert, nvidia-fixed-k, nvidia-fixed-mn, llama-shapes, int8, test
        #[arg(long, value_parser = bench::parse_mode)]
        mode: BenchMode,

        /// Directory for <mode>.csv
        #[arg(short, long, default_value = ".")]
        output_dir: PathBuf,

        /// Minimum measured seconds per timer
        #[arg(long, default_value_t = 0.2)]
        min_run_time: f64,

        /// Seed for weights, masks and inputs
        #[arg(long, default_value_t = 0)]
        seed: u64,
    },

    /// Train, save, reload and compare a 2D-parallel model
    Checkpoint {
        /// Checkpoint directory (a temporary one when omitted)
        #[arg(long, value_name = "DIR")]
        dir: Option<PathBuf>,

        /// Data-parallel degree
        #[arg(long, default_value_t = 2)]
        dp: usize,

        /// Tensor-parallel degree (must divide 4, 8 and 12)
        #[arg(long, default_value_t = 2)]
        tp: usize,

        /// Seed of the saved model
        #[arg(long, default_value_t = 0)]
        seed: u64,
    },
}

/// `RUST_LOG` wins; otherwise -q / -v pick the level.
fn init_tracing(verbose: bool, quiet: bool) {
    let default = if quiet {
        "error"
    } else if verbose {
        "semisparse=debug,info"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);
    debug!(command = ?cli.command, "parsed command");

    let result = match cli.command {
        Commands::Bench {
            mode,
            output_dir,
            min_run_time,
            seed,
        } => bench::run(mode, &output_dir, min_run_time, seed, cli.quiet),

        Commands::Checkpoint { dir, dp, tp, seed } => {
            checkpoint::run(dir.as_deref(), dp, tp, seed)
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            e.exit_code()
        }
    }
}
