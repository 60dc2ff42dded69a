//! In-process collectives over a shared rendezvous.
//!
//! Every collective is an all-gather of byte payloads keyed by
//! `(tag, ranks)`: members deposit their contribution, the last arrival
//! publishes the round's result, and every member takes a copy. The
//! other collectives are thin encodings on top.

use parking_lot::{Condvar, Mutex};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{trace, warn};

/// Collective communication failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommError {
    /// Another worker failed and the world was torn down.
    #[error("world aborted")]
    Aborted,

    /// The calling rank is not part of the group it tried to use.
    #[error("rank {rank} is not a member of group {ranks:?}")]
    NotMember {
        /// Calling rank
        rank: usize,
        /// Group members
        ranks: Vec<usize>,
    },

    /// Group members disagree on the collective being run.
    #[error("collective mismatch: {0}")]
    Mismatch(String),

    /// World or group construction was invalid.
    #[error("invalid world: {0}")]
    InvalidWorld(String),

    /// A payload could not be encoded or decoded.
    #[error("payload encoding failed: {0}")]
    Encoding(String),

    /// A collective waited longer than the world's timeout.
    #[error("{op} timed out after {after:?}")]
    Timeout {
        /// Collective name
        op: &'static str,
        /// Configured timeout
        after: Duration,
    },

    /// A worker thread panicked.
    #[error("worker rank {rank} panicked")]
    WorkerPanicked {
        /// Rank of the panicked worker
        rank: usize,
    },
}

type Gathered = Arc<Vec<Vec<u8>>>;
type GroupKey = (&'static str, Vec<usize>);

#[derive(Default)]
struct Rendezvous {
    generation: u64,
    op: Option<&'static str>,
    pending: Vec<Option<Vec<u8>>>,
    arrived: usize,
    // generation -> (result, members yet to take it)
    completed: HashMap<u64, (Gathered, usize)>,
}

#[derive(Default)]
struct State {
    aborted: bool,
    groups: HashMap<GroupKey, Rendezvous>,
}

struct Shared {
    state: Mutex<State>,
    cond: Condvar,
}

/// A set of cooperating in-process workers.
///
/// Cloning is cheap; clones share the same rendezvous.
#[derive(Clone)]
pub struct World {
    size: usize,
    timeout: Option<Duration>,
    shared: Arc<Shared>,
}

impl World {
    /// World of `size` ranks without a collective timeout.
    ///
    /// # Errors
    ///
    /// `InvalidWorld` for an empty world.
    pub fn new(size: usize) -> Result<Self, CommError> {
        if size == 0 {
            return Err(CommError::InvalidWorld("world size must be positive".to_string()));
        }
        Ok(Self {
            size,
            timeout: None,
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                cond: Condvar::new(),
            }),
        })
    }

    /// Fail any collective that waits longer than `timeout`.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Number of ranks.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Tear the world down: every blocked and future collective returns
    /// [`CommError::Aborted`].
    pub fn abort(&self) {
        let mut state = self.shared.state.lock();
        if !state.aborted {
            warn!("aborting world");
            state.aborted = true;
        }
        drop(state);
        self.shared.cond.notify_all();
    }

    /// Whether [`World::abort`] has been called.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.shared.state.lock().aborted
    }

    /// Group over every rank of the world.
    ///
    /// # Errors
    ///
    /// `NotMember` if `rank` is out of range.
    pub fn world_group(&self, rank: usize) -> Result<ProcessGroup, CommError> {
        self.group("world", rank, (0..self.size).collect())
    }

    /// Group `tag` over `ranks`, as seen from `rank`.
    ///
    /// Groups with the same tag and members share one rendezvous, so
    /// every member must run the same sequence of collectives on it.
    ///
    /// # Errors
    ///
    /// `InvalidWorld` for empty, unsorted, duplicated, or out-of-range
    /// ranks; `NotMember` if `rank` is not listed.
    pub fn group(
        &self,
        tag: &'static str,
        rank: usize,
        ranks: Vec<usize>,
    ) -> Result<ProcessGroup, CommError> {
        if ranks.is_empty() || ranks.windows(2).any(|w| w[0] >= w[1]) {
            return Err(CommError::InvalidWorld(format!(
                "group {tag} ranks must be sorted and unique, got {ranks:?}"
            )));
        }
        if ranks.iter().any(|&r| r >= self.size) {
            return Err(CommError::InvalidWorld(format!(
                "group {tag} ranks {ranks:?} exceed world size {}",
                self.size
            )));
        }
        let index = ranks
            .iter()
            .position(|&r| r == rank)
            .ok_or_else(|| CommError::NotMember {
                rank,
                ranks: ranks.clone(),
            })?;
        Ok(ProcessGroup {
            world: self.clone(),
            tag,
            rank,
            index,
            ranks: ranks.into(),
        })
    }

    fn exchange(
        &self,
        key: &GroupKey,
        index: usize,
        op: &'static str,
        payload: Vec<u8>,
    ) -> Result<Gathered, CommError> {
        let members = key.1.len();
        let deadline = self.timeout.map(|t| Instant::now() + t);
        let mut state = self.shared.state.lock();
        let shared_state = &mut *state;
        if shared_state.aborted {
            return Err(CommError::Aborted);
        }

        let rdv = shared_state.groups.entry(key.clone()).or_default();
        if rdv.pending.len() != members {
            rdv.pending = vec![None; members];
        }
        match rdv.op {
            Some(current) if current != op => {
                let msg = format!(
                    "group {} rank {} called {op} while others called {current}",
                    key.0, key.1[index]
                );
                shared_state.aborted = true;
                drop(state);
                self.shared.cond.notify_all();
                return Err(CommError::Mismatch(msg));
            }
            _ => rdv.op = Some(op),
        }

        let generation = rdv.generation;
        rdv.pending[index] = Some(payload);
        rdv.arrived += 1;
        trace!(group = key.0, generation, op, arrived = rdv.arrived, "arrived");

        if rdv.arrived == members {
            let gathered: Gathered = Arc::new(
                rdv.pending
                    .iter_mut()
                    .map(|slot| slot.take().unwrap_or_default())
                    .collect(),
            );
            if members > 1 {
                rdv.completed
                    .insert(generation, (Arc::clone(&gathered), members - 1));
            }
            rdv.generation += 1;
            rdv.arrived = 0;
            rdv.op = None;
            drop(state);
            self.shared.cond.notify_all();
            return Ok(gathered);
        }

        loop {
            let state_ref = &mut *state;
            if let Some(rdv) = state_ref.groups.get_mut(key) {
                if let Some((gathered, readers)) = rdv.completed.get_mut(&generation) {
                    let out = Arc::clone(gathered);
                    *readers -= 1;
                    if *readers == 0 {
                        rdv.completed.remove(&generation);
                    }
                    return Ok(out);
                }
            }
            if state_ref.aborted {
                return Err(CommError::Aborted);
            }
            match deadline {
                Some(deadline) => {
                    if self.shared.cond.wait_until(&mut state, deadline).timed_out() {
                        state.aborted = true;
                        drop(state);
                        self.shared.cond.notify_all();
                        return Err(CommError::Timeout {
                            op,
                            after: self.timeout.unwrap_or_default(),
                        });
                    }
                }
                None => self.shared.cond.wait(&mut state),
            }
        }
    }
}

impl fmt::Debug for World {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("World")
            .field("size", &self.size)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Communicator over a subset of the world's ranks.
#[derive(Clone)]
pub struct ProcessGroup {
    world: World,
    tag: &'static str,
    rank: usize,
    index: usize,
    ranks: Arc<[usize]>,
}

impl ProcessGroup {
    /// Global rank of the caller.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Number of members.
    pub fn size(&self) -> usize {
        self.ranks.len()
    }

    /// Position of the caller within the group.
    pub fn group_rank(&self) -> usize {
        self.index
    }

    /// Global ranks of the members, ascending.
    pub fn ranks(&self) -> &[usize] {
        &self.ranks
    }

    /// Rendezvous tag shared by every member.
    pub fn tag(&self) -> &'static str {
        self.tag
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    fn key(&self) -> GroupKey {
        (self.tag, self.ranks.to_vec())
    }

    fn exchange(&self, op: &'static str, payload: Vec<u8>) -> Result<Gathered, CommError> {
        self.world.exchange(&self.key(), self.index, op, payload)
    }

    /// Block until every member arrives.
    ///
    /// # Errors
    ///
    /// `Aborted`, `Mismatch`, or `Timeout`.
    pub fn barrier(&self) -> Result<(), CommError> {
        self.exchange("barrier", Vec::new()).map(drop)
    }

    /// Every member's payload, in group order.
    ///
    /// # Errors
    ///
    /// `Aborted`, `Mismatch`, or `Timeout`.
    pub fn all_gather_bytes(&self, payload: Vec<u8>) -> Result<Vec<Vec<u8>>, CommError> {
        Ok(self.exchange("all_gather", payload)?.to_vec())
    }

    /// Every member's values, in group order. Lengths may differ.
    ///
    /// # Errors
    ///
    /// As [`ProcessGroup::all_gather_bytes`].
    pub fn all_gather_f32(&self, values: &[f32]) -> Result<Vec<Vec<f32>>, CommError> {
        let gathered = self.exchange("all_gather_f32", bytemuck::cast_slice(values).to_vec())?;
        gathered.iter().map(|bytes| decode_f32(bytes)).collect()
    }

    /// Every member's object, in group order.
    ///
    /// # Errors
    ///
    /// `Encoding` if an object does not round-trip through JSON.
    pub fn all_gather_object<T: Serialize + DeserializeOwned>(
        &self,
        value: &T,
    ) -> Result<Vec<T>, CommError> {
        let gathered = self.exchange("all_gather_object", encode(value)?)?;
        gathered.iter().map(|bytes| decode(bytes)).collect()
    }

    /// `src`'s object on every member. Only `src` (a group rank) passes
    /// `Some`; the value other members pass is ignored.
    ///
    /// # Errors
    ///
    /// `Mismatch` if `src` is out of range or passed no value.
    pub fn broadcast_object<T: Serialize + DeserializeOwned>(
        &self,
        value: Option<&T>,
        src: usize,
    ) -> Result<T, CommError> {
        if src >= self.size() {
            return Err(CommError::Mismatch(format!(
                "broadcast source {src} outside group of {}",
                self.size()
            )));
        }
        let payload = match value {
            Some(v) if self.index == src => encode(v)?,
            _ => Vec::new(),
        };
        let gathered = self.exchange("broadcast_object", payload)?;
        if gathered[src].is_empty() {
            return Err(CommError::Mismatch(format!(
                "broadcast source {src} sent no value"
            )));
        }
        decode(&gathered[src])
    }

    /// Element-wise sum over members, accumulated in group order so every
    /// member gets bit-identical results.
    ///
    /// # Errors
    ///
    /// `Mismatch` if members pass buffers of different lengths.
    pub fn all_reduce_sum(&self, values: &mut [f32]) -> Result<(), CommError> {
        if self.size() == 1 {
            return Ok(());
        }
        let payload = bytemuck::cast_slice::<f32, u8>(values).to_vec();
        let gathered = self.exchange("all_reduce_sum", payload)?;
        values.fill(0.0);
        for (member, bytes) in gathered.iter().enumerate() {
            let contribution = decode_f32(bytes)?;
            if contribution.len() != values.len() {
                return Err(CommError::Mismatch(format!(
                    "all_reduce_sum length {} from member {member}, expected {}",
                    contribution.len(),
                    values.len()
                )));
            }
            for (v, c) in values.iter_mut().zip(contribution) {
                *v += c;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for ProcessGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessGroup")
            .field("tag", &self.tag)
            .field("rank", &self.rank)
            .field("ranks", &self.ranks)
            .finish()
    }
}

fn decode_f32(bytes: &[u8]) -> Result<Vec<f32>, CommError> {
    if bytes.len() % 4 != 0 {
        return Err(CommError::Encoding(format!(
            "f32 payload of {} bytes",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(bytemuck::pod_read_unaligned::<f32>)
        .collect())
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CommError> {
    serde_json::to_vec(value).map_err(|e| CommError::Encoding(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CommError> {
    serde_json::from_slice(bytes).map_err(|e| CommError::Encoding(e.to_string()))
}
