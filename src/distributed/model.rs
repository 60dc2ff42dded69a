//! Three-layer MLP split over a 2D mesh.
//!
//! Tensor parallelism pairs the layers: `net1` is column-parallel (output
//! features split), `net2` row-parallel (input features split, partial
//! outputs summed, bias replicated), `net3` column-parallel with its
//! output gathered back to full width. The tensor-parallel slices are
//! then flattened into one buffer, padded to a multiple of the
//! data-parallel degree, and sharded across the data-parallel group.
//! Gradients are computed by hand; there is no autograd here.

use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::BTreeMap;
use tracing::debug;

use super::comm::{ProcessGroup, World};
use super::mesh::{DeviceMesh, MeshDim};
use crate::checkpoint::{OuterPlacement, Shard, ShardMetadata, ShardedTensor, StateDict, StateValue};
use crate::dtype::DType;
use crate::error::{Result, SparseError};
use crate::nn::init::linear_uniform;
use crate::tensor::{self, Tensor};

/// `(name, in_features, out_features)`
const LAYERS: [(&str, usize, usize); 3] = [("net1", 5, 8), ("net2", 8, 4), ("net3", 4, 12)];

/// Rows of the training input.
pub const BATCH: usize = 4;

/// How a parameter is laid out across the tensor-parallel group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TpPlacement {
    /// Split evenly along a dimension
    Shard(usize),
    /// Full copy on every member
    Replicate,
}

#[derive(Debug, Clone)]
struct ParamLayout {
    name: String,
    global_shape: Vec<usize>,
    local_shape: Vec<usize>,
    tp_offsets: Vec<usize>,
    placement: TpPlacement,
}

impl ParamLayout {
    fn numel(&self) -> usize {
        self.local_shape.iter().product()
    }
}

fn placement_of(layer: usize, is_bias: bool) -> TpPlacement {
    match (layer, is_bias) {
        (1, false) => TpPlacement::Shard(1),
        (1, true) => TpPlacement::Replicate,
        _ => TpPlacement::Shard(0),
    }
}

/// `data[.., start..start + len, ..]` along `dim` of a row-major buffer.
fn narrow(data: &[f32], shape: &[usize], dim: usize, start: usize, len: usize) -> Vec<f32> {
    let outer: usize = shape[..dim].iter().product();
    let inner: usize = shape[dim + 1..].iter().product();
    let mut out = Vec::with_capacity(outer * len * inner);
    for o in 0..outer {
        let base = (o * shape[dim] + start) * inner;
        out.extend_from_slice(&data[base..base + len * inner]);
    }
    out
}

/// `torch.chunk` along dim 0: `ceil(rows / parts)` rows per part, the
/// tail parts possibly short or empty. Returns `(start, len)`.
fn chunk_rows(rows: usize, parts: usize, index: usize) -> (usize, usize) {
    let chunk = rows.div_ceil(parts);
    let start = (index * chunk).min(rows);
    (start, chunk.min(rows - start))
}

fn linear(x: &Tensor, weight: &Tensor, bias: Option<&Tensor>) -> Result<Tensor> {
    let wt = weight.t()?;
    match bias {
        Some(b) => tensor::addmm(b, x, &wt),
        None => tensor::mm(x, &wt),
    }
}

fn relu_grad(z: &Tensor, upstream: &Tensor) -> Result<Tensor> {
    let data = z
        .data()
        .iter()
        .zip(upstream.data())
        .map(|(&z, &g)| if z > 0.0 { g } else { 0.0 })
        .collect();
    Tensor::from_vec(data, z.shape())
}

fn column_sums(t: &Tensor) -> Result<Tensor> {
    let (rows, cols) = t.dims2()?;
    let mut sums = vec![0.0f32; cols];
    for r in 0..rows {
        for (s, &v) in sums.iter_mut().zip(&t.data()[r * cols..(r + 1) * cols]) {
            *s += v;
        }
    }
    Tensor::from_vec(sums, &[cols])
}

/// Training input for a data-parallel coordinate.
#[must_use]
pub fn make_input(dp_coord: usize) -> Tensor {
    let mut rng = StdRng::seed_from_u64(dp_coord as u64 + 1);
    Tensor::rand(&[BATCH, LAYERS[0].1], &mut rng)
}

struct Activations {
    z1: Tensor,
    h1: Tensor,
    z2: Tensor,
    h2: Tensor,
    z3: Tensor,
    output: Tensor,
}

/// One rank's piece of the 2D-parallel MLP.
pub struct SimpleModel {
    mesh: DeviceMesh,
    rank: usize,
    dp_group: ProcessGroup,
    tp_group: ProcessGroup,
    params: Vec<ParamLayout>,
    numel: usize,
    flat_shard: Vec<f32>,
}

impl SimpleModel {
    /// Initialise every layer from `seed` (identical on all ranks), keep
    /// this rank's tensor-parallel slices, and shard them over the
    /// data-parallel group.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` if the tensor-parallel degree does not divide every
    /// split dimension; `Comm` if the mesh does not fit the world.
    pub fn new(world: &World, rank: usize, mesh: DeviceMesh, seed: u64) -> Result<Self> {
        let dp_group = mesh.dim_group(world, rank, MeshDim::Data)?;
        let tp_group = mesh.dim_group(world, rank, MeshDim::Tensor)?;
        let (dp_coord, tp_coord) = mesh.coords(rank);
        let tp = mesh.tp();

        let mut rng = StdRng::seed_from_u64(seed);
        let mut params = Vec::with_capacity(2 * LAYERS.len());
        let mut flat = Vec::new();
        for (layer, &(name, fan_in, fan_out)) in LAYERS.iter().enumerate() {
            let weight = linear_uniform(&[fan_out, fan_in], fan_in, &mut rng);
            let bias = linear_uniform(&[fan_out], fan_in, &mut rng);
            for (full, suffix, is_bias) in [(weight, "weight", false), (bias, "bias", true)] {
                let placement = placement_of(layer, is_bias);
                let global_shape = full.shape().to_vec();
                let mut local_shape = global_shape.clone();
                let mut tp_offsets = vec![0; global_shape.len()];
                let local = match placement {
                    TpPlacement::Replicate => full.into_data(),
                    TpPlacement::Shard(dim) => {
                        if global_shape[dim] % tp != 0 {
                            return Err(SparseError::InvalidConfig {
                                param: "tp".to_string(),
                                value: tp.to_string(),
                                constraint: format!(
                                    "a divisor of {name}.{suffix} dim {dim} ({})",
                                    global_shape[dim]
                                ),
                            });
                        }
                        let len = global_shape[dim] / tp;
                        local_shape[dim] = len;
                        tp_offsets[dim] = tp_coord * len;
                        narrow(full.data(), &global_shape, dim, tp_coord * len, len)
                    }
                };
                flat.extend(local);
                params.push(ParamLayout {
                    name: format!("{name}.{suffix}"),
                    global_shape,
                    local_shape,
                    tp_offsets,
                    placement,
                });
            }
        }

        let numel = flat.len();
        let flat_shard = shard_flat(flat, mesh.dp(), dp_coord);
        debug!(rank, numel, shard = flat_shard.len(), "initialised model");
        Ok(Self {
            mesh,
            rank,
            dp_group,
            tp_group,
            params,
            numel,
            flat_shard,
        })
    }

    /// Mesh the model is laid out on.
    #[must_use]
    pub fn mesh(&self) -> DeviceMesh {
        self.mesh
    }

    /// Global rank of this piece.
    #[must_use]
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Parameter names in registration order.
    pub fn parameter_names(&self) -> impl Iterator<Item = &str> {
        self.params.iter().map(|p| p.name.as_str())
    }

    /// This rank's slice of the flat parameter buffer.
    pub fn flat_shard(&self) -> &[f32] {
        &self.flat_shard
    }

    /// Gather the data-parallel shards back into tensor-parallel slices.
    fn unshard(&self) -> Result<Vec<Tensor>> {
        let flat: Vec<f32> = self
            .dp_group
            .all_gather_f32(&self.flat_shard)?
            .into_iter()
            .flatten()
            .take(self.numel)
            .collect();
        let mut tensors = Vec::with_capacity(self.params.len());
        let mut offset = 0;
        for param in &self.params {
            let end = offset + param.numel();
            tensors.push(Tensor::from_vec(flat[offset..end].to_vec(), &param.local_shape)?);
            offset = end;
        }
        Ok(tensors)
    }

    /// Tensor-parallel local view of every parameter, by name.
    ///
    /// Collective over the data-parallel group.
    ///
    /// # Errors
    ///
    /// Communication errors.
    pub fn summon_full_params(&self) -> Result<BTreeMap<String, Tensor>> {
        Ok(self
            .params
            .iter()
            .map(|param| param.name.clone())
            .zip(self.unshard()?)
            .collect())
    }

    fn forward_with(&self, params: &[Tensor], x: &Tensor) -> Result<Activations> {
        let [w1, b1, w2, b2, w3, b3] = params else {
            return Err(SparseError::shape_mismatch(
                "SimpleModel parameters",
                &[6],
                &[params.len()],
            ));
        };

        let z1 = linear(x, w1, Some(b1))?;
        let h1 = z1.relu();

        let mut partial = linear(&h1, w2, None)?.into_data();
        self.tp_group.all_reduce_sum(&mut partial)?;
        let out2 = b2.numel();
        for row in partial.chunks_mut(out2) {
            for (v, &b) in row.iter_mut().zip(b2.data()) {
                *v += b;
            }
        }
        let z2 = Tensor::from_vec(partial, &[x.shape()[0], out2])?;
        let h2 = z2.relu();

        let z3 = linear(&h2, w3, Some(b3))?;
        let h3 = z3.relu();
        let output = self.gather_columns(&h3)?;

        Ok(Activations {
            z1,
            h1,
            z2,
            h2,
            z3,
            output,
        })
    }

    fn gather_columns(&self, local: &Tensor) -> Result<Tensor> {
        let (rows, cols) = local.dims2()?;
        let parts = self.tp_group.all_gather_f32(local.data())?;
        let width = cols * parts.len();
        let mut out = vec![0.0f32; rows * width];
        for (p, part) in parts.iter().enumerate() {
            for r in 0..rows {
                out[r * width + p * cols..r * width + (p + 1) * cols]
                    .copy_from_slice(&part[r * cols..(r + 1) * cols]);
            }
        }
        Tensor::from_vec(out, &[rows, width])
    }

    /// Full-width output for `x`.
    ///
    /// Collective over both mesh dimensions.
    ///
    /// # Errors
    ///
    /// Shape or communication errors.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let params = self.unshard()?;
        Ok(self.forward_with(&params, x)?.output)
    }

    /// `forward(x).sum().backward()` then one SGD step on the local shard.
    /// Returns the loss.
    ///
    /// # Errors
    ///
    /// Shape or communication errors.
    pub fn train_step(&mut self, x: &Tensor, lr: f32) -> Result<f32> {
        let params = self.unshard()?;
        let [_, _, w2, _, w3, _] = params.as_slice() else {
            return Err(SparseError::shape_mismatch("train_step parameters", &[6], &[params.len()]));
        };
        let acts = self.forward_with(&params, x)?;
        let loss = acts.output.sum();

        let ones = Tensor::ones(acts.z3.shape());
        let dz3 = relu_grad(&acts.z3, &ones)?;
        let dw3 = tensor::mm(&dz3.t()?, &acts.h2)?;
        let db3 = column_sums(&dz3)?;

        let mut dh2 = tensor::mm(&dz3, w3)?.into_data();
        self.tp_group.all_reduce_sum(&mut dh2)?;
        let dh2 = Tensor::from_vec(dh2, acts.h2.shape())?;
        let dz2 = relu_grad(&acts.z2, &dh2)?;
        let dw2 = tensor::mm(&dz2.t()?, &acts.h1)?;
        let db2 = column_sums(&dz2)?;

        let dh1 = tensor::mm(&dz2, w2)?;
        let dz1 = relu_grad(&acts.z1, &dh1)?;
        let dw1 = tensor::mm(&dz1.t()?, x)?;
        let db1 = column_sums(&dz1)?;

        let mut grads: Vec<f32> = [dw1, db1, dw2, db2, dw3, db3]
            .into_iter()
            .flat_map(Tensor::into_data)
            .collect();
        if grads.len() != self.numel {
            return Err(SparseError::shape_mismatch(
                "train_step gradients",
                &[self.numel],
                &[grads.len()],
            ));
        }
        let dp = self.mesh.dp();
        grads.resize(self.flat_shard.len() * dp, 0.0);
        self.dp_group.all_reduce_sum(&mut grads)?;
        let start = self.dp_group.group_rank() * self.flat_shard.len();
        for (p, g) in self.flat_shard.iter_mut().zip(&grads[start..]) {
            *p -= lr * g / dp as f32;
        }
        debug!(rank = self.rank, loss, "train step");
        Ok(loss)
    }

    /// Each tensor-parallel slice chunked along dim 0 over the
    /// data-parallel group, nested in its tensor-parallel placement.
    ///
    /// Collective over the data-parallel group.
    ///
    /// # Errors
    ///
    /// Communication errors.
    pub fn sharded_state_dict(&self) -> Result<StateDict> {
        let locals = self.unshard()?;
        let dp_coord = self.dp_group.group_rank();
        let mut state_dict = StateDict::new();
        for (param, local) in self.params.iter().zip(locals) {
            let (start, len) = chunk_rows(param.local_shape[0], self.mesh.dp(), dp_coord);
            let shards = if len == 0 {
                Vec::new()
            } else {
                let mut offsets = vec![0; param.local_shape.len()];
                offsets[0] = start;
                let mut sizes = param.local_shape.clone();
                sizes[0] = len;
                vec![Shard {
                    metadata: ShardMetadata::new(offsets, sizes),
                    data: narrow(local.data(), &param.local_shape, 0, start, len),
                }]
            };
            let mut tensor = ShardedTensor::new(param.local_shape.clone(), DType::F32, shards)?
                .with_outer(OuterPlacement {
                    global_size: param.global_shape.clone(),
                    offsets: param.tp_offsets.clone(),
                })?;
            if param.placement == TpPlacement::Replicate {
                tensor = tensor.replicated();
            }
            state_dict.insert(param.name.clone(), StateValue::Tensor(tensor));
        }
        Ok(state_dict)
    }

    /// Replace the parameters with those in a state dict shaped like
    /// [`SimpleModel::sharded_state_dict`]'s.
    ///
    /// Collective over the data-parallel group.
    ///
    /// # Errors
    ///
    /// `Checkpoint` for missing or misshapen entries; communication errors.
    pub fn load_state_dict(&mut self, state_dict: &StateDict) -> Result<()> {
        let mut flat = Vec::with_capacity(self.numel);
        for param in &self.params {
            let tensor = match state_dict.get(&param.name) {
                Some(StateValue::Tensor(t)) => t,
                _ => {
                    return Err(SparseError::Checkpoint(format!(
                        "state dict has no tensor {}",
                        param.name
                    )))
                }
            };
            if tensor.size() != param.local_shape {
                return Err(SparseError::shape_mismatch(
                    format!("load_state_dict {}", param.name),
                    &param.local_shape,
                    tensor.size(),
                ));
            }
            let mut shards: Vec<&Shard> = tensor.local_shards().iter().collect();
            shards.sort_by(|a, b| a.metadata.offsets.cmp(&b.metadata.offsets));
            let local: Vec<f32> = shards.iter().flat_map(|s| s.data.iter().copied()).collect();

            let before = flat.len();
            flat.extend(self.dp_group.all_gather_f32(&local)?.into_iter().flatten());
            if flat.len() - before != param.numel() {
                return Err(SparseError::Checkpoint(format!(
                    "{} gathered {} values, expected {}",
                    param.name,
                    flat.len() - before,
                    param.numel()
                )));
            }
        }
        self.flat_shard = shard_flat(flat, self.mesh.dp(), self.dp_group.group_rank());
        Ok(())
    }
}

fn shard_flat(mut flat: Vec<f32>, parts: usize, index: usize) -> Vec<f32> {
    let shard_len = flat.len().div_ceil(parts);
    flat.resize(shard_len * parts, 0.0);
    flat[index * shard_len..(index + 1) * shard_len].to_vec()
}
