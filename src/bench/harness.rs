//! Dense vs 2:4 benchmark cases.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, info_span};

use super::record::{save_csv, BenchmarkRecord};
use super::suite::{BenchCase, BenchMode};
use super::timer::Timer;
use crate::dispatch;
use crate::dtype::{DType, Device};
use crate::error::{Result, SparseError};
use crate::nn::{Model, Module, Weight};
use crate::pruning::{gen_two_four_sparse_mask, WeightNormPruner};
use crate::semi_structured::SemiSparseTensor;
use crate::tensor::{self, Tensor};

const DEVICE: Device = Device::Accelerator;

/// Knobs shared by every case of a run.
#[derive(Debug, Clone)]
pub struct BenchConfig {
    /// Minimum measured time per timer
    pub min_run_time: Duration,
    /// Relative tolerance of the correctness check
    pub rtol: f32,
    /// Absolute tolerance of the correctness check
    pub atol: f32,
    /// Seed for weights, masks, and inputs
    pub seed: u64,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            min_run_time: Duration::from_millis(200),
            rtol: 1e-3,
            atol: 1e-3,
            seed: 0,
        }
    }
}

fn on_device(t: Tensor, dtype: DType) -> Tensor {
    t.with_dtype(dtype).to_device(DEVICE)
}

/// Random `[m, k]` weight pruned by a random 2:4 mask.
fn masked_rand<R: Rng + ?Sized>(m: usize, k: usize, dtype: DType, rng: &mut R) -> Result<Tensor> {
    let mask = gen_two_four_sparse_mask(m, k, dtype, DEVICE, rng)?;
    on_device(Tensor::rand(&[m, k], rng), dtype).mul(&mask)
}

/// Single linear layer `Linear(k, m)` on an `[n, k]` input, dense weight
/// then the same weight compressed.
///
/// # Errors
///
/// Kernel, compression, or dispatch errors.
pub fn test_linear<R: Rng + ?Sized>(
    m: usize,
    k: usize,
    n: usize,
    dtype: DType,
    config: &BenchConfig,
    rng: &mut R,
) -> Result<BenchmarkRecord> {
    let weight = masked_rand(m, k, dtype, rng)?;
    let mut model = Model::new(m, k, Some(rng.gen())).to(dtype, DEVICE)?;
    model.linear.set_weight(Weight::Dense(weight))?;
    if !dtype.is_floating_point() {
        model.linear.set_bias(None);
    }
    let input = on_device(Tensor::rand(&[n, k], rng), dtype);

    let dense = Timer::new(|| model.forward(&input)).blocked_autorange(config.min_run_time)?;
    let expected = model.forward(&input)?;

    model.linear.sparsify_weight()?;
    let got = model.forward(&input)?;
    let sparse = Timer::new(|| model.forward(&input)).blocked_autorange(config.min_run_time)?;

    let correct = got.allclose(&expected, config.rtol, config.atol);
    Ok(BenchmarkRecord::from_medians(
        (m, k, n),
        dtype,
        sparse.median(),
        dense.median(),
        correct,
    ))
}

/// Raw products on a 2:4 mask `A[m, k]` against `B[k, n]`.
///
/// Checks both the biased and the plain product; the record is correct
/// only when both are. Latencies are of the biased product (plain
/// product for integer dtypes, which have no biased route).
///
/// # Errors
///
/// Kernel, compression, or dispatch errors.
pub fn test_tensor<R: Rng + ?Sized>(
    m: usize,
    k: usize,
    n: usize,
    dtype: DType,
    config: &BenchConfig,
    rng: &mut R,
) -> Result<BenchmarkRecord> {
    let a = gen_two_four_sparse_mask(m, k, dtype, DEVICE, rng)?;
    let b = on_device(Tensor::rand(&[k, n], rng), dtype);
    let sa = SemiSparseTensor::from_dense(a.clone())?;

    let dense_mm = tensor::mm(&a, &b)?;
    let sparse_mm = dispatch::mm(&sa, &b)?;
    let correct_mm = sparse_mm.allclose(&dense_mm, config.rtol, config.atol);

    let (correct_addmm, dense, sparse) = if dtype.is_floating_point() {
        let bias = on_device(Tensor::rand(&[n], rng), dtype);
        let dense_addmm = tensor::addmm(&bias, &a, &b)?;
        let sparse_addmm = dispatch::addmm(&bias, &sa, &b)?;
        let correct = sparse_addmm.allclose(&dense_addmm, config.rtol, config.atol);
        let dense = Timer::new(|| tensor::addmm(&bias, &a, &b))
            .blocked_autorange(config.min_run_time)?;
        let sparse = Timer::new(|| dispatch::addmm(&bias, &sa, &b))
            .blocked_autorange(config.min_run_time)?;
        (correct, dense, sparse)
    } else {
        let dense = Timer::new(|| tensor::mm(&a, &b)).blocked_autorange(config.min_run_time)?;
        let sparse = Timer::new(|| dispatch::mm(&sa, &b)).blocked_autorange(config.min_run_time)?;
        (true, dense, sparse)
    };
    info!(correct_mm, correct_addmm, "raw tensor products checked");

    Ok(BenchmarkRecord::from_medians(
        (m, k, n),
        dtype,
        sparse.median(),
        dense.median(),
        correct_mm && correct_addmm,
    ))
}

/// Dense f16 model pruned to 2:4 vs its compressed clone on
/// `randint(0, 2)` inputs of shape `[batch, n, k]`.
///
/// Int8 runs zero the bias, start from a 2:4 mask weight, drop the bias
/// from the compressed model, and compare against the dense f16 output
/// cast to int8.
///
/// # Errors
///
/// Kernel, compression, pruning, or dispatch errors.
#[allow(clippy::too_many_arguments)]
pub fn compare_linear<R: Rng + ?Sized>(
    m: usize,
    k: usize,
    n: usize,
    batch_size: usize,
    init_batch_size: usize,
    dtype: DType,
    config: &BenchConfig,
    rng: &mut R,
) -> Result<BenchmarkRecord> {
    let mut model = Model::new(m, k, Some(rng.gen())).to(DType::F16, DEVICE)?;
    if dtype == DType::I8 {
        model
            .linear
            .set_bias(Some(on_device(Tensor::zeros(&[m]), DType::F16)));
        let mask = gen_two_four_sparse_mask(m, k, DType::F16, DEVICE, rng)?;
        model.linear.set_weight(Weight::Dense(mask))?;
    }

    let mut pruner = WeightNormPruner::new(1.0, (1, 4), 2)?;
    pruner.prepare(&model, &["linear.weight"])?;
    pruner.step(&mut model)?;
    pruner.squash_mask(&mut model)?;

    let mut sparse_model = model.clone();
    if dtype != DType::F16 {
        let weight = sparse_model
            .parameter("linear.weight")
            .ok_or_else(|| SparseError::unsupported("compare_linear", "pruned model has no dense weight"))?
            .to_dtype(dtype);
        sparse_model.linear.set_weight(Weight::Dense(weight))?;
        if dtype.is_floating_point() {
            sparse_model.linear = sparse_model.linear.to(dtype, DEVICE)?;
        } else {
            sparse_model.linear.set_bias(None);
        }
    }
    sparse_model.linear.sparsify_weight()?;

    let input = on_device(Tensor::randint(2, &[init_batch_size, n, k], rng), dtype);
    let sparse_output = sparse_model.forward(&input)?;
    let dense_output = model.forward(&input.to_dtype(DType::F16))?.to_dtype(dtype);
    let correct = dense_output.allclose(&sparse_output, config.rtol, config.atol);

    let input = on_device(Tensor::randint(2, &[batch_size, n, k], rng), dtype);
    let dense_input = input.to_dtype(DType::F16);
    let sparse = Timer::new(|| sparse_model.forward(&input)).blocked_autorange(config.min_run_time)?;
    let dense = Timer::new(|| model.forward(&dense_input)).blocked_autorange(config.min_run_time)?;

    Ok(
        BenchmarkRecord::from_medians((m, k, n), dtype, sparse.median(), dense.median(), correct)
            .with_batch_sizes(batch_size, init_batch_size),
    )
}

/// Evaluate one case.
///
/// # Errors
///
/// Whatever the case's function returns.
pub fn run_case<R: Rng + ?Sized>(
    case: &BenchCase,
    config: &BenchConfig,
    rng: &mut R,
) -> Result<BenchmarkRecord> {
    match *case {
        BenchCase::Linear { m, k, n, dtype } => test_linear(m, k, n, dtype, config, rng),
        BenchCase::Tensor { m, k, n, dtype } => test_tensor(m, k, n, dtype, config, rng),
        BenchCase::CompareLinear {
            m,
            k,
            n,
            batch_size,
            init_batch_size,
            dtype,
        } => compare_linear(m, k, n, batch_size, init_batch_size, dtype, config, rng),
    }
}

/// Evaluate every case of `mode` in order, calling `on_case` after each.
///
/// The first error aborts the run.
///
/// # Errors
///
/// The first failing case's error.
pub fn run_suite(
    mode: BenchMode,
    config: &BenchConfig,
    mut on_case: impl FnMut(&BenchCase, &BenchmarkRecord),
) -> Result<Vec<BenchmarkRecord>> {
    let span = info_span!("bench", mode = %mode);
    let _guard = span.enter();

    let mut rng = StdRng::seed_from_u64(config.seed);
    let cases = mode.cases();
    info!(cases = cases.len(), "started benchmark");
    let mut records = Vec::with_capacity(cases.len());
    for case in &cases {
        let record = run_case(case, config, &mut rng)?;
        info!(
            ?case,
            sparse_ms = record.sparse_latency_ms,
            dense_ms = record.dense_latency_ms,
            correct = record.correct,
            "case finished"
        );
        on_case(case, &record);
        records.push(record);
    }
    Ok(records)
}

/// `<dir>/<mode>.csv`.
#[must_use]
pub fn results_path(dir: &Path, mode: BenchMode) -> PathBuf {
    dir.join(format!("{}.csv", mode.name()))
}

/// Write a run's records to `<dir>/<mode>.csv`, returning the path.
///
/// # Errors
///
/// I/O or CSV errors.
pub fn save_results(dir: &Path, mode: BenchMode, records: &[BenchmarkRecord]) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = results_path(dir, mode);
    save_csv(&path, records)?;
    info!(path = %path.display(), rows = records.len(), "saved results");
    Ok(path)
}
