//! Named shape suites.

use std::fmt;
use std::str::FromStr;

use crate::dtype::DType;
use crate::error::SparseError;

/// One benchmark configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BenchCase {
    /// Single linear layer, dense weight vs compressed weight
    Linear {
        /// Output features
        m: usize,
        /// Input features
        k: usize,
        /// Input rows
        n: usize,
        /// Element type
        dtype: DType,
    },
    /// Raw `addmm` / `mm` on a 2:4 mask tensor
    Tensor {
        /// Rows of the sparse operand
        m: usize,
        /// Shared dimension
        k: usize,
        /// Columns of the dense operand
        n: usize,
        /// Element type
        dtype: DType,
    },
    /// Pruned dense model vs its compressed clone on batched input
    CompareLinear {
        /// Output features
        m: usize,
        /// Input features
        k: usize,
        /// Rows per batch element
        n: usize,
        /// Batch size for timing
        batch_size: usize,
        /// Batch size for the correctness check
        init_batch_size: usize,
        /// Element type
        dtype: DType,
    },
}

impl BenchCase {
    /// `(m, k, n)` of the case.
    #[must_use]
    pub fn dims(&self) -> (usize, usize, usize) {
        match *self {
            BenchCase::Linear { m, k, n, .. }
            | BenchCase::Tensor { m, k, n, .. }
            | BenchCase::CompareLinear { m, k, n, .. } => (m, k, n),
        }
    }
}

/// A named shape suite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BenchMode {
    /// BERT layer shapes
    NvidiaBert,
    /// Square-ish sweep with `k = 10240`
    NvidiaFixedK,
    /// `k` sweep with `m = n = 10240`
    NvidiaFixedMn,
    /// LLaMA projections under model parallelism 8
    LlamaShapes,
    /// Small int8 vs f16 comparison
    Int8,
    /// One small raw-tensor case
    Test,
}

const BERT_SHAPES: [(usize, usize, usize); 4] = [
    (3072, 1024, 16384),
    (4096, 1024, 16384),
    (1024, 1024, 16384),
    (1024, 4096, 16384),
];

const LLAMA_MP: usize = 8;
const LLAMA_BS: usize = 512;
const COMPARE_BATCH_SIZES: [usize; 4] = [1, 16, 64, 256];
const COMPARE_DTYPES: [DType; 2] = [DType::I8, DType::F16];

impl BenchMode {
    /// Every suite, in CLI order.
    pub const ALL: [BenchMode; 6] = [
        BenchMode::NvidiaBert,
        BenchMode::NvidiaFixedK,
        BenchMode::NvidiaFixedMn,
        BenchMode::LlamaShapes,
        BenchMode::Int8,
        BenchMode::Test,
    ];

    /// CLI name, also the CSV file stem.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            BenchMode::NvidiaBert => "nvidia-bert",
            BenchMode::NvidiaFixedK => "nvidia-fixed-k",
            BenchMode::NvidiaFixedMn => "nvidia-fixed-mn",
            BenchMode::LlamaShapes => "llama-shapes",
            BenchMode::Int8 => "int8",
            BenchMode::Test => "test",
        }
    }

    /// Whether records carry batch-size columns.
    #[must_use]
    pub const fn has_batch_columns(self) -> bool {
        matches!(self, BenchMode::LlamaShapes | BenchMode::Int8)
    }

    /// The suite's configurations, in evaluation order.
    #[must_use]
    pub fn cases(self) -> Vec<BenchCase> {
        let linear = |(m, k, n): (usize, usize, usize)| BenchCase::Linear {
            m,
            k,
            n,
            dtype: DType::F16,
        };
        match self {
            BenchMode::NvidiaBert => BERT_SHAPES.into_iter().map(linear).collect(),
            BenchMode::NvidiaFixedK => (3072..=20480)
                .step_by(1024)
                .map(|mn| linear((mn, 10240, mn)))
                .collect(),
            BenchMode::NvidiaFixedMn => (2560..=20480)
                .step_by(1280)
                .map(|k| linear((10240, k, 10240)))
                .collect(),
            BenchMode::LlamaShapes => compare_product(&[
                (8192 / LLAMA_MP, 8192, LLAMA_BS),
                (8192, 8192 / LLAMA_MP, LLAMA_BS),
                (22016 / LLAMA_MP, 8192, LLAMA_BS),
                (8192, 22016 / LLAMA_MP, LLAMA_BS),
            ]),
            BenchMode::Int8 => compare_product(&[(128, 128, 128)]),
            BenchMode::Test => vec![BenchCase::Tensor {
                m: 64,
                k: 128,
                n: 64,
                dtype: DType::F16,
            }],
        }
    }
}

/// dtype-major, then batch size, then shape.
fn compare_product(shapes: &[(usize, usize, usize)]) -> Vec<BenchCase> {
    let mut cases = Vec::with_capacity(COMPARE_DTYPES.len() * COMPARE_BATCH_SIZES.len() * shapes.len());
    for dtype in COMPARE_DTYPES {
        for batch_size in COMPARE_BATCH_SIZES {
            for &(m, k, n) in shapes {
                cases.push(BenchCase::CompareLinear {
                    m,
                    k,
                    n,
                    batch_size,
                    init_batch_size: batch_size,
                    dtype,
                });
            }
        }
    }
    cases
}

impl fmt::Display for BenchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BenchMode {
    type Err = SparseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BenchMode::ALL
            .into_iter()
            .find(|mode| mode.name() == s)
            .ok_or_else(|| SparseError::InvalidConfig {
                param: "mode".to_string(),
                value: s.to_string(),
                constraint: format!(
                    "one of {}",
                    BenchMode::ALL.map(BenchMode::name).join(", ")
                ),
            })
    }
}
