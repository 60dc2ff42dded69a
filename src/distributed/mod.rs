//! In-process 2D parallelism: communicator, mesh, launcher, and the
//! sharded model the checkpoint round trip exercises.
//!
//! Workers are threads. Collectives rendezvous through shared state; a
//! worker that fails aborts the [`World`], so its peers return
//! [`CommError::Aborted`] instead of blocking forever.
//!
//! # Example
//!
//! ```
//! use semisparse::distributed::{spawn_world, DeviceMesh, MeshDim};
//!
//! let mesh = DeviceMesh::new(2, 2).unwrap();
//! let sums = spawn_world(mesh.world_size(), |rank, world| {
//!     let tp = mesh.dim_group(world, rank, MeshDim::Tensor)?;
//!     let mut value = [rank as f32];
//!     tp.all_reduce_sum(&mut value)?;
//!     Ok(value[0])
//! })
//! .unwrap();
//! assert_eq!(sums, vec![1.0, 1.0, 5.0, 5.0]);
//! ```

mod comm;
mod launch;
mod mesh;
mod model;
mod roundtrip;

pub use comm::{CommError, ProcessGroup, World};
pub use launch::{spawn_on, spawn_world};
pub use mesh::{DeviceMesh, MeshDim};
pub use model::{make_input, SimpleModel, BATCH};
pub use roundtrip::{run_2d_checkpoint_roundtrip, RoundTripConfig, RoundTripReport, LR, MODEL_KEY};
