//! `semisparse bench`: dense vs 2:4 latency suites

use crate::error::{CliError, Result};
use crate::output;
use indicatif::{ProgressBar, ProgressStyle};
use semisparse::bench::{render_table, run_suite, save_results, BenchCase, BenchConfig, BenchMode};
use std::path::Path;
use std::time::Duration;

const PROGRESS_TEMPLATE: &str =
    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}";

/// clap value parser for `--mode`
pub(crate) fn parse_mode(s: &str) -> std::result::Result<BenchMode, String> {
    s.parse().map_err(|e: semisparse::SparseError| e.to_string())
}

fn describe(case: &BenchCase) -> String {
    let (m, k, n) = case.dims();
    match case {
        BenchCase::CompareLinear {
            batch_size, dtype, ..
        } => format!("{m}x{k}x{n} batch {batch_size} {dtype}"),
        BenchCase::Linear { dtype, .. } | BenchCase::Tensor { dtype, .. } => {
            format!("{m}x{k}x{n} {dtype}")
        }
    }
}

fn progress_bar(len: usize, quiet: bool) -> ProgressBar {
    if quiet {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(len as u64);
    if let Ok(style) = ProgressStyle::default_bar().template(PROGRESS_TEMPLATE) {
        pb.set_style(style.progress_chars("#>-"));
    }
    pb
}

pub(crate) fn run(
    mode: BenchMode,
    output_dir: &Path,
    min_run_time: f64,
    seed: u64,
    quiet: bool,
) -> Result<()> {
    if !min_run_time.is_finite() || min_run_time <= 0.0 {
        return Err(CliError::InvalidArgument(format!(
            "--min-run-time must be a positive number of seconds, got {min_run_time}"
        )));
    }
    let config = BenchConfig {
        min_run_time: Duration::from_secs_f64(min_run_time),
        seed,
        ..BenchConfig::default()
    };

    let pb = progress_bar(mode.cases().len(), quiet);
    let records = run_suite(mode, &config, |case, _| {
        pb.set_message(describe(case));
        pb.inc(1);
    });
    pb.finish_and_clear();
    let records = records?;
    let path = save_results(output_dir, mode, &records)?;

    output::section(&format!("Benchmark: {mode}"));
    println!("{}", render_table(&records));
    output::kv("Cases", records.len());
    output::kv("Results", path.display());
    if let Some(best) = records
        .iter()
        .max_by(|a, b| a.speedup.total_cmp(&b.speedup))
    {
        output::kv(
            "Best speedup",
            format!(
                "{:.2}x ({} sparse vs {} dense)",
                best.speedup,
                output::format_ms(best.sparse_latency_ms),
                output::format_ms(best.dense_latency_ms)
            ),
        );
    }

    let incorrect = records.iter().filter(|r| !r.correct).count();
    if incorrect == 0 {
        output::success("sparse and dense outputs agree for every case");
    } else {
        output::warning(&format!(
            "{incorrect} of {} cases differ beyond rtol {} / atol {}",
            records.len(),
            config.rtol,
            config.atol
        ));
    }
    Ok(())
}
