use common_error::{internal_ensure, internal_err, ArmadaResult};
use serde::{Deserialize, Serialize};

use super::{
    ChunkPoolInput, ChunkSlice, ChunkStripe, InputCookie, Key, UnorderedChunkPool,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ShuffleInput {
    /// Where this input's slices landed: per-bucket local cookies.
    routed: Vec<(usize, InputCookie)>,
    suspend_count: u32,
}

/// One input stream fanned out into N per-partition bucket pools. Each
/// incoming slice is routed by its explicit partition tag, or by binary
/// search over the partition boundary keys when untagged. Suspend, resume
/// and reset on a shuffle input cookie fan out to the affected buckets.
#[derive(Debug, Serialize, Deserialize)]
pub struct ShuffleChunkPool {
    /// Lower boundary keys of partitions `1..n`; partition 0 owns everything
    /// below `boundaries[0]`.
    boundaries: Vec<Key>,
    buckets: Vec<UnorderedChunkPool>,
    inputs: Vec<ShuffleInput>,
    finished: bool,
}

impl ShuffleChunkPool {
    pub fn new(
        bucket_count: usize,
        boundaries: Vec<Key>,
        data_weight_per_job: i64,
        max_slices_per_job: usize,
    ) -> Self {
        debug_assert!(boundaries.is_empty() || boundaries.len() + 1 == bucket_count);
        Self {
            boundaries,
            buckets: (0..bucket_count)
                .map(|_| UnorderedChunkPool::new(data_weight_per_job, max_slices_per_job))
                .collect(),
            inputs: Vec::new(),
            finished: false,
        }
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn bucket(&self, index: usize) -> ArmadaResult<&UnorderedChunkPool> {
        self.buckets
            .get(index)
            .ok_or_else(|| internal_err!("unknown shuffle bucket {}", index))
    }

    pub fn bucket_mut(&mut self, index: usize) -> ArmadaResult<&mut UnorderedChunkPool> {
        self.buckets
            .get_mut(index)
            .ok_or_else(|| internal_err!("unknown shuffle bucket {}", index))
    }

    fn route(&self, slice: &ChunkSlice) -> ArmadaResult<usize> {
        if let Some(tag) = slice.partition_tag {
            internal_ensure!(
                tag < self.buckets.len(),
                "partition tag {} out of range ({} buckets)",
                tag,
                self.buckets.len()
            );
            return Ok(tag);
        }
        let key = slice.lower_key.as_ref().ok_or_else(|| {
            internal_err!("untagged shuffle slice for chunk {} has no key", slice.chunk_id)
        })?;
        // Partition index = number of boundaries at or below the key.
        Ok(self.boundaries.partition_point(|b| b <= key))
    }

    fn split(&self, stripe: &ChunkStripe) -> ArmadaResult<Vec<(usize, ChunkStripe)>> {
        let mut per_bucket: Vec<Option<ChunkStripe>> = vec![None; self.buckets.len()];
        for slice in &stripe.slices {
            let bucket = self.route(slice)?;
            per_bucket[bucket]
                .get_or_insert_with(ChunkStripe::default)
                .push(slice.clone());
        }
        Ok(per_bucket
            .into_iter()
            .enumerate()
            .filter_map(|(bucket, stripe)| stripe.map(|s| (bucket, s)))
            .collect())
    }

    fn entry(&self, cookie: InputCookie) -> ArmadaResult<&ShuffleInput> {
        self.inputs
            .get(cookie)
            .ok_or_else(|| internal_err!("unknown shuffle input cookie {}", cookie))
    }
}

impl ChunkPoolInput for ShuffleChunkPool {
    fn add(&mut self, stripe: ChunkStripe) -> ArmadaResult<InputCookie> {
        internal_ensure!(!self.finished, "add after finish on shuffle pool");
        let parts = self.split(&stripe)?;
        let mut routed = Vec::with_capacity(parts.len());
        for (bucket, part) in parts {
            let local = self.buckets[bucket].add(part)?;
            routed.push((bucket, local));
        }
        let cookie = self.inputs.len();
        self.inputs.push(ShuffleInput {
            routed,
            suspend_count: 0,
        });
        Ok(cookie)
    }

    fn suspend(&mut self, cookie: InputCookie) -> ArmadaResult<()> {
        self.entry(cookie)?;
        self.inputs[cookie].suspend_count += 1;
        if self.inputs[cookie].suspend_count == 1 {
            let routed = self.inputs[cookie].routed.clone();
            for (bucket, local) in routed {
                self.buckets[bucket].suspend(local)?;
            }
        }
        Ok(())
    }

    fn resume(&mut self, cookie: InputCookie) -> ArmadaResult<()> {
        internal_ensure!(
            self.entry(cookie)?.suspend_count > 0,
            "resume of non-suspended shuffle input {}",
            cookie
        );
        self.inputs[cookie].suspend_count -= 1;
        if self.inputs[cookie].suspend_count == 0 {
            let routed = self.inputs[cookie].routed.clone();
            for (bucket, local) in routed {
                self.buckets[bucket].resume(local)?;
            }
        }
        Ok(())
    }

    fn reset(&mut self, cookie: InputCookie, stripe: ChunkStripe) -> ArmadaResult<()> {
        self.entry(cookie)?;
        let parts = self.split(&stripe)?;
        let routed = self.inputs[cookie].routed.clone();
        // Regenerated data must route to the buckets it routed to before;
        // buckets with no replacement data get an empty stripe.
        for (bucket, local) in &routed {
            let replacement = parts
                .iter()
                .find(|(b, _)| b == bucket)
                .map(|(_, s)| s.clone())
                .unwrap_or_default();
            self.buckets[*bucket].reset(*local, replacement)?;
        }
        for (bucket, _) in &parts {
            internal_ensure!(
                routed.iter().any(|(b, _)| b == bucket),
                "regenerated shuffle input {} routed to new bucket {}",
                cookie,
                bucket
            );
        }
        Ok(())
    }

    fn stripe(&self, _cookie: InputCookie) -> ArmadaResult<&ChunkStripe> {
        // The original stripe is split across buckets on entry and no
        // longer exists as one object.
        Err(internal_err!(
            "shuffle pool does not retain unsplit input stripes"
        ))
    }

    fn finish(&mut self) {
        self.finished = true;
        for bucket in &mut self.buckets {
            bucket.finish();
        }
    }

    fn is_finished(&self) -> bool {
        self.finished
    }
}
