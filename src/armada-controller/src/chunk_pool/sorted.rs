use std::collections::{HashMap, HashSet};

use common_error::{internal_ensure, internal_err, ArmadaResult};
use serde::{Deserialize, Serialize};

use super::{
    aggregate_statistics,
    job_ledger::JobLedger,
    stripe::{ChunkId, ChunkSlice},
    ChunkPoolInput, ChunkPoolOutput, ChunkStripe, InputCookie, OutputCookie, StripeList,
    StripeStatistics,
};
use crate::scheduling::context::NodeId;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct InputEntry {
    stripe: ChunkStripe,
    suspend_count: u32,
    jobs: Vec<usize>,
}

/// Pool merging sorted input stripes under a global key order. Jobs are
/// frozen at `finish()`: slices are ordered by key and grouped by target
/// weight, but a cut never lands between two slices sharing a boundary key,
/// so no key group is ever split across jobs.
#[derive(Debug, Serialize, Deserialize)]
pub struct SortedChunkPool {
    data_weight_per_job: i64,
    max_slices_per_job: usize,
    finished: bool,
    inputs: Vec<InputEntry>,
    ledger: JobLedger,
    total_data_weight: i64,
    total_row_count: i64,
}

impl SortedChunkPool {
    pub fn new(data_weight_per_job: i64, max_slices_per_job: usize) -> Self {
        Self {
            data_weight_per_job: data_weight_per_job.max(1),
            max_slices_per_job: max_slices_per_job.max(1),
            finished: false,
            inputs: Vec::new(),
            ledger: JobLedger::default(),
            total_data_weight: 0,
            total_row_count: 0,
        }
    }

    fn entry(&self, cookie: InputCookie) -> ArmadaResult<&InputEntry> {
        self.inputs
            .get(cookie)
            .ok_or_else(|| internal_err!("unknown input cookie {}", cookie))
    }

    /// A cut between `last` and `next` is legal only when the boundary key
    /// is not shared: either side missing a key is treated as overlapping.
    fn can_cut_between(last: &ChunkSlice, next: &ChunkSlice) -> bool {
        match (&last.upper_key, &next.lower_key) {
            (Some(upper), Some(lower)) => lower > upper,
            _ => false,
        }
    }

    fn build_jobs(&mut self) {
        let mut slices: Vec<(InputCookie, ChunkSlice)> = self
            .inputs
            .iter()
            .enumerate()
            .flat_map(|(cookie, entry)| {
                entry.stripe.slices.iter().cloned().map(move |s| (cookie, s))
            })
            .collect();
        if slices.is_empty() {
            return;
        }
        slices.sort_by(|(_, a), (_, b)| {
            let a_key = (&a.lower_key, &a.upper_key);
            let b_key = (&b.lower_key, &b.upper_key);
            a_key.cmp(&b_key)
        });

        let mut group: Vec<(InputCookie, ChunkSlice)> = Vec::new();
        let mut group_weight = 0i64;
        for (cookie, slice) in &slices {
            // Cut before the slice that would overflow the group, and only
            // when the boundary key allows it.
            let full = !group.is_empty()
                && (group_weight + slice.data_weight > self.data_weight_per_job
                    || group.len() >= self.max_slices_per_job);
            let cuttable = group
                .last()
                .map(|(_, last)| Self::can_cut_between(last, slice))
                .unwrap_or(false);
            if full && cuttable {
                self.flush_group(&mut group);
                group_weight = 0;
            }
            group_weight += slice.data_weight;
            group.push((*cookie, slice.clone()));
        }
        self.flush_group(&mut group);
    }

    fn flush_group(&mut self, group: &mut Vec<(InputCookie, ChunkSlice)>) {
        if group.is_empty() {
            return;
        }
        let mut cookies: Vec<InputCookie> = Vec::new();
        for (cookie, _) in group.iter() {
            if !cookies.contains(cookie) {
                cookies.push(*cookie);
            }
        }
        let mut list = StripeList::default();
        list.push(ChunkStripe::new(
            group.iter().map(|(_, s)| s.clone()).collect(),
        ));
        let job = self.ledger.push_job(list, cookies.clone());
        for cookie in cookies {
            self.inputs[cookie].jobs.push(job);
            if self.inputs[cookie].suspend_count > 0 {
                self.ledger.note_suspended(job, true);
            }
        }
        group.clear();
    }
}

impl ChunkPoolInput for SortedChunkPool {
    fn add(&mut self, stripe: ChunkStripe) -> ArmadaResult<InputCookie> {
        internal_ensure!(!self.finished, "add after finish on sorted pool");
        let cookie = self.inputs.len();
        self.total_data_weight += stripe.data_weight();
        self.total_row_count += stripe.row_count();
        self.inputs.push(InputEntry {
            stripe,
            suspend_count: 0,
            jobs: Vec::new(),
        });
        Ok(cookie)
    }

    fn suspend(&mut self, cookie: InputCookie) -> ArmadaResult<()> {
        self.entry(cookie)?;
        self.inputs[cookie].suspend_count += 1;
        if self.inputs[cookie].suspend_count == 1 {
            let jobs = self.inputs[cookie].jobs.clone();
            for job in jobs {
                self.ledger.note_suspended(job, true);
            }
        }
        Ok(())
    }

    fn resume(&mut self, cookie: InputCookie) -> ArmadaResult<()> {
        internal_ensure!(
            self.entry(cookie)?.suspend_count > 0,
            "resume of non-suspended input cookie {}",
            cookie
        );
        self.inputs[cookie].suspend_count -= 1;
        if self.inputs[cookie].suspend_count == 0 {
            let jobs = self.inputs[cookie].jobs.clone();
            for job in jobs {
                self.ledger.note_suspended(job, false);
            }
        }
        Ok(())
    }

    fn reset(&mut self, cookie: InputCookie, stripe: ChunkStripe) -> ArmadaResult<()> {
        self.entry(cookie)?;
        let old_chunks: HashSet<ChunkId> = self.inputs[cookie].stripe.chunk_ids().collect();
        let new_chunks: HashSet<ChunkId> = stripe.chunk_ids().collect();
        let removed: HashSet<ChunkId> = old_chunks.difference(&new_chunks).copied().collect();
        let added: Vec<ChunkSlice> = stripe
            .slices
            .iter()
            .filter(|s| !old_chunks.contains(&s.chunk_id))
            .cloned()
            .collect();

        self.total_data_weight += stripe.data_weight() - self.inputs[cookie].stripe.data_weight();
        self.total_row_count += stripe.row_count() - self.inputs[cookie].stripe.row_count();

        let jobs = self.inputs[cookie].jobs.clone();
        let mut added = Some(added);
        for job in jobs {
            self.ledger
                .patch_job(job, &removed, added.take().unwrap_or_default())?;
        }
        self.inputs[cookie].stripe = stripe;
        Ok(())
    }

    fn stripe(&self, cookie: InputCookie) -> ArmadaResult<&ChunkStripe> {
        Ok(&self.entry(cookie)?.stripe)
    }

    fn finish(&mut self) {
        if !self.finished {
            self.finished = true;
            self.build_jobs();
        }
    }

    fn is_finished(&self) -> bool {
        self.finished
    }
}

impl ChunkPoolOutput for SortedChunkPool {
    fn extract(&mut self, _node: Option<NodeId>) -> ArmadaResult<Option<OutputCookie>> {
        if !self.finished {
            return Ok(None);
        }
        Ok(self.ledger.extract())
    }

    fn stripe_list(&self, cookie: OutputCookie) -> ArmadaResult<&StripeList> {
        self.ledger.stripe_list(cookie)
    }

    fn completed(&mut self, cookie: OutputCookie) -> ArmadaResult<()> {
        self.ledger.completed(cookie)
    }

    fn failed(&mut self, cookie: OutputCookie) -> ArmadaResult<()> {
        self.ledger.returned(cookie)
    }

    fn aborted(&mut self, cookie: OutputCookie) -> ArmadaResult<()> {
        self.ledger.returned(cookie)
    }

    fn lost(&mut self, cookie: OutputCookie) -> ArmadaResult<()> {
        self.ledger.lost(cookie)
    }

    fn pending_job_count(&self) -> usize {
        if self.finished {
            self.ledger.pending_job_count()
        } else if self.total_data_weight > 0 {
            ((self.total_data_weight + self.data_weight_per_job - 1) / self.data_weight_per_job)
                .max(1) as usize
        } else {
            0
        }
    }

    fn total_job_count(&self) -> usize {
        if self.finished {
            self.ledger.total_job_count()
        } else {
            self.pending_job_count()
        }
    }

    fn is_completed(&self) -> bool {
        self.finished && self.ledger.is_drained()
    }

    fn approximate_stripe_statistics(&self) -> StripeStatistics {
        if self.finished {
            aggregate_statistics(self.ledger.pending_stripes())
        } else {
            aggregate_statistics(self.inputs.iter().map(|e| &e.stripe))
        }
    }

    fn total_data_weight(&self) -> i64 {
        self.total_data_weight
    }

    fn total_row_count(&self) -> i64 {
        self.total_row_count
    }

    fn completed_data_weight(&self) -> i64 {
        self.ledger.completed_data_weight()
    }

    fn completed_row_count(&self) -> i64 {
        self.ledger.completed_row_count()
    }

    fn pending_data_weight(&self) -> i64 {
        if self.finished {
            self.ledger.pending_data_weight()
        } else {
            self.total_data_weight
        }
    }

    fn locality(&self) -> &HashMap<NodeId, i64> {
        self.ledger.no_locality()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk_pool::stripe::{ChunkId, Key};

    fn keyed_slice(lower: i64, upper: i64, weight: i64) -> ChunkSlice {
        ChunkSlice::new(ChunkId::new(), weight, weight)
            .with_keys(Key::from_i64(&[lower]), Key::from_i64(&[upper]))
    }

    #[test]
    fn jobs_follow_key_order() {
        let mut pool = SortedChunkPool::new(100, 1000);
        pool.add(ChunkStripe::new(vec![keyed_slice(50, 60, 80)]))
            .unwrap();
        pool.add(ChunkStripe::new(vec![keyed_slice(0, 10, 80)]))
            .unwrap();
        pool.finish();

        assert_eq!(pool.total_job_count(), 2);
        let first = pool.extract(None).unwrap().unwrap();
        let list = pool.stripe_list(first).unwrap();
        assert_eq!(
            list.stripes[0].slices[0].lower_key,
            Some(Key::from_i64(&[0]))
        );
    }

    #[test]
    fn shared_boundary_key_is_never_split() {
        let mut pool = SortedChunkPool::new(50, 1000);
        // Three slices; the first two share boundary key 10.
        pool.add(ChunkStripe::new(vec![
            keyed_slice(0, 10, 60),
            keyed_slice(10, 20, 60),
            keyed_slice(21, 30, 60),
        ]))
        .unwrap();
        pool.finish();

        // Despite each slice exceeding the target alone, the first cut is
        // delayed until after the key-10 group.
        assert_eq!(pool.total_job_count(), 2);
        let first = pool.extract(None).unwrap().unwrap();
        assert_eq!(pool.stripe_list(first).unwrap().slice_count(), 2);
    }

    #[test]
    fn cut_lands_before_the_slice_that_would_overflow() {
        let mut pool = SortedChunkPool::new(100, 1000);
        pool.add(ChunkStripe::new(vec![
            keyed_slice(0, 10, 80),
            keyed_slice(20, 30, 30),
            keyed_slice(40, 50, 80),
        ]))
        .unwrap();
        pool.finish();

        // 80 + 30 would overflow the 100 target, so each slice that fits
        // alone gets its own job instead of riding along.
        assert_eq!(pool.total_job_count(), 3);
        let first = pool.extract(None).unwrap().unwrap();
        assert_eq!(pool.stripe_list(first).unwrap().total_data_weight, 80);
    }

    #[test]
    fn lost_sorted_job_is_reissued_under_same_cookie() {
        let mut pool = SortedChunkPool::new(1000, 1000);
        pool.add(ChunkStripe::new(vec![keyed_slice(0, 10, 10)]))
            .unwrap();
        pool.finish();

        let cookie = pool.extract(None).unwrap().unwrap();
        pool.completed(cookie).unwrap();
        pool.lost(cookie).unwrap();
        assert_eq!(pool.extract(None).unwrap(), Some(cookie));
    }
}
