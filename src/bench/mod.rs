//! Dense vs 2:4 semi-structured benchmark harness (`semisparse::bench`).
//!
//! A [`BenchMode`] expands into a fixed list of [`BenchCase`]s. Each case
//! times the dense and the compressed path with [`Timer::blocked_autorange`],
//! checks that both outputs agree within `rtol`/`atol`, and yields one
//! [`BenchmarkRecord`]. A run writes `<mode>.csv` and a console table.
//!
//! There is no retry: the first failing case aborts the run.
//!
//! # Example
//! ```
//! use semisparse::bench::{BenchMode, BenchCase};
//!
//! let cases = BenchMode::Test.cases();
//! assert_eq!(cases.len(), 1);
//! assert_eq!(cases[0].dims(), (64, 128, 64));
//! ```

mod harness;
mod record;
mod suite;
mod timer;

pub use harness::{
    compare_linear, results_path, run_case, run_suite, save_results, test_linear, test_tensor,
    BenchConfig,
};
pub use record::{header, render_table, save_csv, write_csv, BenchmarkRecord};
pub use suite::{BenchCase, BenchMode};
pub use timer::{Measurement, Timer};
