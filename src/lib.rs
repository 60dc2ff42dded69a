//! Semisparse: 2:4 semi-structured sparse matmul in pure Rust.
//!
//! Semisparse compresses 2:4 sparse weights, routes matrix products
//! through a closed dispatch table, benchmarks the compressed path
//! against dense GEMM, and checkpoints 2D-parallel (tensor-parallel plus
//! data-parallel sharded) models with resharding on load.
//!
//! # Quick Start
//!
//! ```
//! use semisparse::prelude::*;
//!
//! // A 2:4 sparse weight on the accelerator
//! let w = Tensor::new(&[1.0, 0.0, 2.0, 0.0, 0.0, 3.0, 0.0, 4.0], &[2, 4])
//!     .with_dtype(DType::F16)
//!     .to_device(Device::Accelerator);
//! let x = Tensor::ones(&[4, 1])
//!     .with_dtype(DType::F16)
//!     .to_device(Device::Accelerator);
//!
//! let sparse = SemiSparseTensor::from_dense(w.clone()).unwrap();
//! let y = dispatch::mm(&sparse, &x).unwrap();
//! assert!(y.allclose(&dispatch::mm(&w, &x).unwrap(), 1e-3, 1e-3));
//! assert_eq!(y.data(), &[3.0, 7.0]);
//! ```
//!
//! # Modules
//!
//! - [`tensor`]: Dense tensors and GEMM kernels
//! - [`dtype`]: Element types and devices
//! - [`semi_structured`]: 2:4 compression and the compressed tensor wrapper
//! - [`dispatch`]: Closed dispatch table for transpose, detach, `addmm`, `mm`
//! - [`pruning`]: 2:4 masks and magnitude pruning
//! - [`nn`]: Linear layers with dense or compressed weights
//! - [`bench`]: Dense vs sparse latency benchmark suites
//! - [`distributed`]: In-process collectives, 2D mesh, sharded model
//! - [`checkpoint`]: Sharded state-dict save and load

pub mod bench;
pub mod checkpoint;
pub mod dispatch;
pub mod distributed;
pub mod dtype;
pub mod error;
pub mod nn;
pub mod prelude;
pub mod pruning;
pub mod semi_structured;
pub mod tensor;

pub use dtype::{DType, Device};
pub use error::{Result, SparseError};
pub use semi_structured::SemiSparseTensor;
pub use tensor::Tensor;
