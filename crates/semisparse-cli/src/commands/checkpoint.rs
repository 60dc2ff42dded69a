//! `semisparse checkpoint`: 2D-parallel save / reload round trip

use crate::error::Result;
use crate::output;
use semisparse::distributed::{run_2d_checkpoint_roundtrip, RoundTripConfig, RoundTripReport};
use std::path::Path;

pub(crate) fn run(dir: Option<&Path>, dp: usize, tp: usize, seed: u64) -> Result<()> {
    let config = RoundTripConfig {
        dp,
        tp,
        seed,
        ..RoundTripConfig::default()
    };

    // removed on drop unless the user picked a directory
    let scratch;
    let dir = match dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            dir
        }
        None => {
            scratch = tempfile::tempdir()?;
            scratch.path()
        }
    };

    let report = run_2d_checkpoint_roundtrip(&config, dir)?;
    print_report(&config, &report);
    Ok(())
}

fn print_report(config: &RoundTripConfig, report: &RoundTripReport) {
    output::section("2D Checkpoint Round Trip");
    output::kv(
        "Mesh",
        format!("dp={} x tp={} ({} ranks)", config.dp, config.tp, report.world_size),
    );
    output::kv("Directory", report.checkpoint_dir.display());
    output::kv("Files", report.files.join(", "));
    output::kv("Chunks", report.chunks);
    output::kv("Parameters", report.parameters.join(", "));
    let losses: Vec<String> = report.losses.iter().map(|l| format!("{l:.4}")).collect();
    output::kv("Loss per rank", losses.join(", "));
    output::success("reloaded model matches the saved one on every rank");
}
