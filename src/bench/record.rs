//! Benchmark rows, CSV output, and the console table.

use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::Path;

use crate::dtype::DType;
use crate::error::Result;

/// One row of a benchmark table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkRecord {
    /// Rows of the sparse weight
    pub m: usize,
    /// Shared dimension
    pub k: usize,
    /// Rows of the input
    pub n: usize,
    /// Timed batch size (compare suites only)
    pub eval_batch_size: Option<usize>,
    /// Correctness batch size (compare suites only)
    pub init_batch_size: Option<usize>,
    /// Element type
    pub dtype: DType,
    /// Median sparse latency in milliseconds
    pub sparse_latency_ms: f64,
    /// Median dense latency in milliseconds
    pub dense_latency_ms: f64,
    /// Dense latency over sparse latency
    pub speedup: f64,
    /// Whether sparse and dense outputs were close
    pub correct: bool,
}

impl BenchmarkRecord {
    /// Build a record from median seconds per run.
    #[must_use]
    pub fn from_medians(
        (m, k, n): (usize, usize, usize),
        dtype: DType,
        sparse_median_s: f64,
        dense_median_s: f64,
        correct: bool,
    ) -> Self {
        Self {
            m,
            k,
            n,
            eval_batch_size: None,
            init_batch_size: None,
            dtype,
            sparse_latency_ms: sparse_median_s * 1000.0,
            dense_latency_ms: dense_median_s * 1000.0,
            speedup: if sparse_median_s > 0.0 {
                dense_median_s / sparse_median_s
            } else {
                f64::INFINITY
            },
            correct,
        }
    }

    /// Attach batch sizes.
    #[must_use]
    pub fn with_batch_sizes(mut self, eval_batch_size: usize, init_batch_size: usize) -> Self {
        self.eval_batch_size = Some(eval_batch_size);
        self.init_batch_size = Some(init_batch_size);
        self
    }

    fn cells(&self, batch_columns: bool) -> Vec<String> {
        let mut cells = vec![self.m.to_string(), self.k.to_string(), self.n.to_string()];
        if batch_columns {
            cells.push(opt(self.eval_batch_size));
            cells.push(opt(self.init_batch_size));
        }
        cells.extend([
            self.dtype.name().to_string(),
            self.sparse_latency_ms.to_string(),
            self.dense_latency_ms.to_string(),
            self.speedup.to_string(),
            if self.correct { "True" } else { "False" }.to_string(),
        ]);
        cells
    }
}

fn opt(value: Option<usize>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

/// Column labels, without the leading index column.
#[must_use]
pub fn header(batch_columns: bool) -> Vec<&'static str> {
    let mut header = vec!["m", "k", "n"];
    if batch_columns {
        header.extend(["eval_batch_size", "init_batch_size"]);
    }
    header.extend([
        "dtype",
        "sparse_latency (ms)",
        "dense_latency (ms)",
        "speedup (d/s)",
        "correct",
    ]);
    header
}

fn batch_columns(records: &[BenchmarkRecord]) -> bool {
    records.iter().any(|r| r.eval_batch_size.is_some())
}

/// Write records as CSV with an unnamed leading row-index column.
///
/// # Errors
///
/// I/O or CSV errors.
pub fn write_csv<W: std::io::Write>(writer: W, records: &[BenchmarkRecord]) -> Result<()> {
    let batch = batch_columns(records);
    let mut wtr = csv::Writer::from_writer(writer);
    let mut head = vec![""];
    head.extend(header(batch));
    wtr.write_record(&head)?;
    for (i, record) in records.iter().enumerate() {
        let mut row = vec![i.to_string()];
        row.extend(record.cells(batch));
        wtr.write_record(&row)?;
    }
    wtr.flush()?;
    Ok(())
}

/// Write records to `path`.
///
/// # Errors
///
/// I/O or CSV errors.
pub fn save_csv(path: &Path, records: &[BenchmarkRecord]) -> Result<()> {
    let file = std::fs::File::create(path)?;
    write_csv(std::io::BufWriter::new(file), records)
}

/// Right-aligned text table with the row index in the first column.
#[must_use]
pub fn render_table(records: &[BenchmarkRecord]) -> String {
    let batch = batch_columns(records);
    let mut rows: Vec<Vec<String>> = Vec::with_capacity(records.len() + 1);
    let mut head = vec![String::new()];
    head.extend(header(batch).into_iter().map(String::from));
    rows.push(head);
    for (i, record) in records.iter().enumerate() {
        let mut row = vec![i.to_string()];
        row.extend(record.cells(batch));
        rows.push(row);
    }

    let columns = rows[0].len();
    let widths: Vec<usize> = (0..columns)
        .map(|c| rows.iter().map(|r| r[c].len()).max().unwrap_or(0))
        .collect();

    let mut out = String::new();
    for row in &rows {
        let line = row
            .iter()
            .zip(&widths)
            .map(|(cell, &w)| format!("{cell:>w$}"))
            .collect::<Vec<_>>()
            .join("  ");
        let _ = writeln!(out, "{}", line.trim_end());
    }
    out
}
