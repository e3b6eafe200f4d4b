//! Chunk pools: queues of stripes consumed by jobs.
//!
//! A pool's input side receives stripes (`add` / `suspend` / `resume` /
//! `reset` / `finish`); its output side hands work to jobs as cookies
//! (`extract` / `completed` / `failed` / `aborted` / `lost`). Every variant
//! lives behind the same two traits; the controller stores pools in a flat
//! arena and components refer to them by integer id, never by pointer.

mod job_ledger;
pub mod ordered;
pub mod shuffle;
pub mod sorted;
pub mod stripe;
pub mod unordered;

use std::collections::HashMap;

use common_error::{internal_err, ArmadaResult};
use serde::{Deserialize, Serialize};

pub use self::{
    ordered::OrderedChunkPool,
    shuffle::ShuffleChunkPool,
    sorted::SortedChunkPool,
    stripe::{ChunkId, ChunkSlice, ChunkStripe, Key, KeyPart, KeySample, StripeList},
    unordered::UnorderedChunkPool,
};
use crate::scheduling::context::NodeId;

/// Pool-local handle for a stripe registered through the input interface.
pub type InputCookie = usize;
/// Pool-local handle for an extracted job. After `lost` the same cookie
/// transitions back to pending and is re-issued for the regeneration job, so
/// downstream bookkeeping keyed by it stays valid; only `failed`/`aborted`
/// jobs may regroup under fresh cookies.
pub type OutputCookie = usize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StripeStatistics {
    pub stripe_count: usize,
    pub slice_count: usize,
    pub data_weight: i64,
    pub row_count: i64,
}

/// Statistics aggregation shared by all pool variants.
pub fn aggregate_statistics<'a>(
    stripes: impl Iterator<Item = &'a ChunkStripe>,
) -> StripeStatistics {
    let mut stats = StripeStatistics::default();
    for stripe in stripes {
        stats.stripe_count += 1;
        stats.slice_count += stripe.slice_count();
        stats.data_weight += stripe.data_weight();
        stats.row_count += stripe.row_count();
    }
    stats
}

pub trait ChunkPoolInput {
    /// Registers a stripe. Fails once the pool input is finished.
    fn add(&mut self, stripe: ChunkStripe) -> ArmadaResult<InputCookie>;

    /// Takes the stripe out of scheduling without forgetting it. Suspensions
    /// nest: a stripe suspended twice needs two resumes.
    fn suspend(&mut self, cookie: InputCookie) -> ArmadaResult<()>;

    fn resume(&mut self, cookie: InputCookie) -> ArmadaResult<()>;

    /// Atomically replaces the stripe behind a cookie (regenerated
    /// intermediate data, or an input patched to skip a dead chunk) while
    /// keeping the cookie and downstream accounting stable.
    fn reset(&mut self, cookie: InputCookie, stripe: ChunkStripe) -> ArmadaResult<()>;

    /// Read access to the current stripe behind a cookie.
    fn stripe(&self, cookie: InputCookie) -> ArmadaResult<&ChunkStripe>;

    /// Seals the input: no further `add`, totals become final.
    fn finish(&mut self);

    fn is_finished(&self) -> bool;
}

pub trait ChunkPoolOutput {
    /// Returns the next job's cookie, preferring data local to `node` where
    /// the variant supports locality. `None` means no work is currently
    /// extractable (exhausted, gated, or everything suspended).
    fn extract(&mut self, node: Option<NodeId>) -> ArmadaResult<Option<OutputCookie>>;

    fn stripe_list(&self, cookie: OutputCookie) -> ArmadaResult<&StripeList>;

    fn completed(&mut self, cookie: OutputCookie) -> ArmadaResult<()>;

    /// The job failed; its stripes return to pending.
    fn failed(&mut self, cookie: OutputCookie) -> ArmadaResult<()>;

    /// The job was aborted before completion; its stripes return to pending.
    fn aborted(&mut self, cookie: OutputCookie) -> ArmadaResult<()>;

    /// A previously completed job's output vanished; its stripes return to
    /// pending so the logical data is re-read by a replacement job.
    fn lost(&mut self, cookie: OutputCookie) -> ArmadaResult<()>;

    fn pending_job_count(&self) -> usize;

    fn total_job_count(&self) -> usize;

    fn is_completed(&self) -> bool;

    /// Estimates usable before any extraction has occurred, so resource
    /// limits can be bounded before a job runs.
    fn approximate_stripe_statistics(&self) -> StripeStatistics;

    fn total_data_weight(&self) -> i64;

    fn total_row_count(&self) -> i64;

    fn completed_data_weight(&self) -> i64;

    fn completed_row_count(&self) -> i64;

    fn pending_data_weight(&self) -> i64;

    /// Pending data weight per node, for locality-aware task selection.
    fn locality(&self) -> &HashMap<NodeId, i64>;
}

pub type PoolId = usize;

/// Reference to one pool output. Shuffle pools expose one output per
/// partition bucket; every other variant has exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PoolOutputRef {
    pub pool: PoolId,
    pub bucket: Option<usize>,
}

impl PoolOutputRef {
    pub fn plain(pool: PoolId) -> Self {
        Self { pool, bucket: None }
    }

    pub fn shuffle_bucket(pool: PoolId, bucket: usize) -> Self {
        Self {
            pool,
            bucket: Some(bucket),
        }
    }
}

/// Tagged pool variant. Kept as an enum (not a boxed trait object) so the
/// whole arena serializes into a checkpoint.
#[derive(Debug, Serialize, Deserialize)]
pub enum PoolEntry {
    Unordered(UnorderedChunkPool),
    Ordered(OrderedChunkPool),
    Sorted(SortedChunkPool),
    Shuffle(ShuffleChunkPool),
}

/// Flat arena of pools owned by the controller; tasks and partitions hold
/// `PoolId`/`PoolOutputRef` indices into it.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct PoolArena {
    pools: Vec<PoolEntry>,
}

impl PoolArena {
    pub fn insert(&mut self, entry: PoolEntry) -> PoolId {
        self.pools.push(entry);
        self.pools.len() - 1
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    pub fn input(&mut self, id: PoolId) -> ArmadaResult<&mut dyn ChunkPoolInput> {
        let entry = self
            .pools
            .get_mut(id)
            .ok_or_else(|| internal_err!("unknown pool id {}", id))?;
        Ok(match entry {
            PoolEntry::Unordered(p) => p,
            PoolEntry::Ordered(p) => p,
            PoolEntry::Sorted(p) => p,
            PoolEntry::Shuffle(p) => p,
        })
    }

    pub fn output(&mut self, r: PoolOutputRef) -> ArmadaResult<&mut dyn ChunkPoolOutput> {
        let entry = self
            .pools
            .get_mut(r.pool)
            .ok_or_else(|| internal_err!("unknown pool id {}", r.pool))?;
        match (entry, r.bucket) {
            (PoolEntry::Unordered(p), None) => Ok(p),
            (PoolEntry::Ordered(p), None) => Ok(p),
            (PoolEntry::Sorted(p), None) => Ok(p),
            (PoolEntry::Shuffle(p), Some(bucket)) => {
                p.bucket_mut(bucket).map(|b| b as &mut dyn ChunkPoolOutput)
            }
            (PoolEntry::Shuffle(_), None) => Err(internal_err!(
                "shuffle pool {} requires a bucket index",
                r.pool
            )),
            (_, Some(bucket)) => Err(internal_err!(
                "pool {} has no bucket outputs (requested bucket {})",
                r.pool,
                bucket
            )),
        }
    }

    pub fn output_ref(&self, r: PoolOutputRef) -> ArmadaResult<&dyn ChunkPoolOutput> {
        let entry = self
            .pools
            .get(r.pool)
            .ok_or_else(|| internal_err!("unknown pool id {}", r.pool))?;
        match (entry, r.bucket) {
            (PoolEntry::Unordered(p), None) => Ok(p),
            (PoolEntry::Ordered(p), None) => Ok(p),
            (PoolEntry::Sorted(p), None) => Ok(p),
            (PoolEntry::Shuffle(p), Some(bucket)) => {
                p.bucket(bucket).map(|b| b as &dyn ChunkPoolOutput)
            }
            (PoolEntry::Shuffle(_), None) => Err(internal_err!(
                "shuffle pool {} requires a bucket index",
                r.pool
            )),
            (_, Some(bucket)) => Err(internal_err!(
                "pool {} has no bucket outputs (requested bucket {})",
                r.pool,
                bucket
            )),
        }
    }

    /// Unordered pool behind an output ref, if any; used to push job size
    /// adjustments into the pools that honor them.
    pub fn unordered_mut(&mut self, r: PoolOutputRef) -> Option<&mut UnorderedChunkPool> {
        match (self.pools.get_mut(r.pool), r.bucket) {
            (Some(PoolEntry::Unordered(p)), None) => Some(p),
            (Some(PoolEntry::Shuffle(p)), Some(bucket)) => p.bucket_mut(bucket).ok(),
            _ => None,
        }
    }

    pub fn shuffle(&self, id: PoolId) -> ArmadaResult<&ShuffleChunkPool> {
        match self.pools.get(id) {
            Some(PoolEntry::Shuffle(p)) => Ok(p),
            _ => Err(internal_err!("pool {} is not a shuffle pool", id)),
        }
    }

    pub fn shuffle_mut(&mut self, id: PoolId) -> ArmadaResult<&mut ShuffleChunkPool> {
        match self.pools.get_mut(id) {
            Some(PoolEntry::Shuffle(p)) => Ok(p),
            _ => Err(internal_err!("pool {} is not a shuffle pool", id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arena_resolves_shuffle_bucket_outputs() {
        let mut arena = PoolArena::default();
        let id = arena.insert(PoolEntry::Shuffle(ShuffleChunkPool::new(2, vec![], 1000, 1000)));
        arena
            .input(id)
            .unwrap()
            .add(ChunkStripe::new(vec![
                ChunkSlice::new(ChunkId::new(), 10, 1).with_partition_tag(1),
            ]))
            .unwrap();
        arena.input(id).unwrap().finish();

        let bucket = PoolOutputRef::shuffle_bucket(id, 1);
        assert_eq!(arena.output_ref(bucket).unwrap().total_data_weight(), 10);
        let cookie = arena.output(bucket).unwrap().extract(None).unwrap().unwrap();
        arena.output(bucket).unwrap().completed(cookie).unwrap();

        assert!(arena.output(PoolOutputRef::shuffle_bucket(id, 5)).is_err());
        assert!(arena.output(PoolOutputRef::plain(id)).is_err());
    }
}
