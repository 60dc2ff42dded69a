//! Block timer with automatic block sizing.
//!
//! `blocked_autorange` first grows the number of runs per block by powers
//! of ten until the block is long enough relative to the timer overhead
//! (or already longer than the whole budget), then times blocks until the
//! accumulated time reaches `min_run_time`. Statistics are per run.

use std::time::{Duration, Instant};

const OVERHEAD_SAMPLES: usize = 5;
const MAX_RELATIVE_OVERHEAD: f64 = 1e-4;
const MAX_BLOCK_SIZE: u64 = 1 << 31;

/// Statistics over the per-run times of one measurement.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    /// Runs per timed block
    pub number_per_run: u64,
    /// Seconds per run, one entry per block
    pub times: Vec<f64>,
}

impl Measurement {
    /// Median seconds per run.
    #[must_use]
    pub fn median(&self) -> f64 {
        quantile(&self.sorted(), 0.5)
    }

    /// Mean seconds per run.
    #[must_use]
    pub fn mean(&self) -> f64 {
        if self.times.is_empty() {
            return 0.0;
        }
        self.times.iter().sum::<f64>() / self.times.len() as f64
    }

    /// Interquartile range of seconds per run.
    #[must_use]
    pub fn iqr(&self) -> f64 {
        let sorted = self.sorted();
        quantile(&sorted, 0.75) - quantile(&sorted, 0.25)
    }

    /// Number of timed blocks.
    #[must_use]
    pub fn blocks(&self) -> usize {
        self.times.len()
    }

    fn sorted(&self) -> Vec<f64> {
        let mut sorted = self.times.clone();
        sorted.sort_by(f64::total_cmp);
        sorted
    }
}

/// Linear-interpolated quantile of sorted data.
fn quantile(sorted: &[f64], q: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        n => {
            let pos = q * (n - 1) as f64;
            let lo = pos.floor() as usize;
            let hi = pos.ceil() as usize;
            let frac = pos - lo as f64;
            sorted[lo] + (sorted[hi] - sorted[lo]) * frac
        }
    }
}

/// Times a fallible closure.
pub struct Timer<F> {
    stmt: F,
}

impl<T, E, F> Timer<F>
where
    F: FnMut() -> Result<T, E>,
{
    /// Wrap the statement to time.
    pub fn new(stmt: F) -> Self {
        Self { stmt }
    }

    fn time_block(&mut self, number: u64) -> Result<Duration, E> {
        let start = Instant::now();
        for _ in 0..number {
            std::hint::black_box((self.stmt)()?);
        }
        Ok(start.elapsed())
    }

    fn estimate_block_size(&mut self, min_run_time: Duration) -> Result<u64, E> {
        let mut overheads: Vec<f64> = (0..OVERHEAD_SAMPLES)
            .map(|_| {
                let start = Instant::now();
                start.elapsed().as_secs_f64()
            })
            .collect();
        overheads.sort_by(f64::total_cmp);
        let overhead = quantile(&overheads, 0.5);

        let budget = min_run_time.as_secs_f64();
        let mut number = 1;
        loop {
            let taken = self.time_block(number)?.as_secs_f64();
            let relative_overhead = if taken > 0.0 { overhead / taken } else { f64::INFINITY };
            if relative_overhead <= MAX_RELATIVE_OVERHEAD && taken >= budget / 1000.0 {
                break;
            }
            if taken > budget || number * 10 > MAX_BLOCK_SIZE {
                break;
            }
            number *= 10;
        }
        Ok(number)
    }

    /// Size blocks, then time blocks until `min_run_time` has elapsed.
    ///
    /// # Errors
    ///
    /// The first error returned by the statement.
    pub fn blocked_autorange(&mut self, min_run_time: Duration) -> Result<Measurement, E> {
        let number = self.estimate_block_size(min_run_time)?;
        let mut times = Vec::new();
        let mut total = Duration::ZERO;
        while total < min_run_time || times.is_empty() {
            let taken = self.time_block(number)?;
            total += taken;
            times.push(taken.as_secs_f64() / number as f64);
        }
        Ok(Measurement {
            number_per_run: number,
            times,
        })
    }
}
