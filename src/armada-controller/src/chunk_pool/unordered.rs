use std::collections::HashMap;

use common_error::{internal_ensure, internal_err, ArmadaResult};
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};

use super::{
    aggregate_statistics, ChunkPoolInput, ChunkPoolOutput, ChunkStripe, InputCookie, OutputCookie,
    StripeList, StripeStatistics,
};
use crate::scheduling::context::NodeId;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StripeEntry {
    stripe: ChunkStripe,
    suspend_count: u32,
    job: Option<OutputCookie>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum JobState {
    Running,
    Completed,
    Invalidated,
    Lost,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ExtractedJob {
    stripe_list: StripeList,
    input_cookies: Vec<InputCookie>,
    state: JobState,
    /// Marks a job whose completed output was lost. Its stripe grouping is
    /// frozen from then on so re-extraction re-issues the same cookie and
    /// downstream slots keyed by it stay valid.
    regenerating: bool,
}

/// Pool without ordering guarantees: extraction greedily groups pending
/// stripes, preferring ones with a replica on the requesting node, until the
/// per-job data weight target is reached. Jobs invalidated by failure or
/// abort return their stripes to the pending set and replacement extractions
/// get fresh cookies; lost jobs instead keep their grouping and cookie.
#[derive(Debug, Serialize, Deserialize)]
pub struct UnorderedChunkPool {
    data_weight_per_job: i64,
    max_slices_per_job: usize,
    finished: bool,
    stripes: Vec<StripeEntry>,
    free_stripes: IndexSet<InputCookie>,
    jobs: Vec<ExtractedJob>,
    lost_jobs: IndexSet<OutputCookie>,
    free_data_weight: i64,
    total_data_weight: i64,
    total_row_count: i64,
    completed_data_weight: i64,
    completed_row_count: i64,
    running_job_count: usize,
    completed_job_count: usize,
    suspended_stripe_count: usize,
    locality: HashMap<NodeId, i64>,
}

impl UnorderedChunkPool {
    pub fn new(data_weight_per_job: i64, max_slices_per_job: usize) -> Self {
        Self {
            data_weight_per_job: data_weight_per_job.max(1),
            max_slices_per_job: max_slices_per_job.max(1),
            finished: false,
            stripes: Vec::new(),
            free_stripes: IndexSet::new(),
            jobs: Vec::new(),
            lost_jobs: IndexSet::new(),
            free_data_weight: 0,
            total_data_weight: 0,
            total_row_count: 0,
            completed_data_weight: 0,
            completed_row_count: 0,
            running_job_count: 0,
            completed_job_count: 0,
            suspended_stripe_count: 0,
            locality: HashMap::new(),
        }
    }

    pub fn data_weight_per_job(&self) -> i64 {
        self.data_weight_per_job
    }

    /// Job size adjustment only ever grows jobs; shrinking mid-flight would
    /// invalidate resource estimates of already-extracted work.
    pub fn update_data_weight_per_job(&mut self, value: i64) {
        if value > self.data_weight_per_job {
            self.data_weight_per_job = value;
        }
    }

    pub fn running_job_count(&self) -> usize {
        self.running_job_count
    }

    fn entry(&self, cookie: InputCookie) -> ArmadaResult<&StripeEntry> {
        self.stripes
            .get(cookie)
            .ok_or_else(|| internal_err!("unknown input cookie {}", cookie))
    }

    fn make_free(&mut self, cookie: InputCookie) {
        let entry = &self.stripes[cookie];
        let weight = entry.stripe.data_weight();
        for (node, node_weight) in entry.stripe.locality() {
            *self.locality.entry(node).or_insert(0) += node_weight;
        }
        self.free_data_weight += weight;
        self.free_stripes.insert(cookie);
    }

    fn make_unfree(&mut self, cookie: InputCookie) {
        let entry = &self.stripes[cookie];
        let weight = entry.stripe.data_weight();
        for (node, node_weight) in entry.stripe.locality() {
            if let Some(total) = self.locality.get_mut(&node) {
                *total -= node_weight;
                if *total <= 0 {
                    self.locality.remove(&node);
                }
            }
        }
        self.free_data_weight -= weight;
        self.free_stripes.shift_remove(&cookie);
    }

    fn return_job_stripes(&mut self, cookie: OutputCookie) {
        let input_cookies = self.jobs[cookie].input_cookies.clone();
        for input_cookie in input_cookies {
            self.stripes[input_cookie].job = None;
            if self.stripes[input_cookie].suspend_count == 0 {
                self.make_free(input_cookie);
            }
        }
    }

    fn job_state(&self, cookie: OutputCookie) -> ArmadaResult<JobState> {
        self.jobs
            .get(cookie)
            .map(|j| j.state)
            .ok_or_else(|| internal_err!("unknown output cookie {}", cookie))
    }
}

impl ChunkPoolInput for UnorderedChunkPool {
    fn add(&mut self, stripe: ChunkStripe) -> ArmadaResult<InputCookie> {
        internal_ensure!(!self.finished, "add after finish on unordered pool");
        let cookie = self.stripes.len();
        self.total_data_weight += stripe.data_weight();
        self.total_row_count += stripe.row_count();
        self.stripes.push(StripeEntry {
            stripe,
            suspend_count: 0,
            job: None,
        });
        self.make_free(cookie);
        Ok(cookie)
    }

    fn suspend(&mut self, cookie: InputCookie) -> ArmadaResult<()> {
        self.entry(cookie)?;
        let entry = &mut self.stripes[cookie];
        entry.suspend_count += 1;
        if entry.suspend_count == 1 {
            self.suspended_stripe_count += 1;
            if self.stripes[cookie].job.is_none() {
                self.make_unfree(cookie);
            }
        }
        Ok(())
    }

    fn resume(&mut self, cookie: InputCookie) -> ArmadaResult<()> {
        let entry = self.entry(cookie)?;
        internal_ensure!(
            entry.suspend_count > 0,
            "resume of non-suspended input cookie {}",
            cookie
        );
        let entry = &mut self.stripes[cookie];
        entry.suspend_count -= 1;
        if entry.suspend_count == 0 {
            self.suspended_stripe_count -= 1;
            if self.stripes[cookie].job.is_none() {
                self.make_free(cookie);
            }
        }
        Ok(())
    }

    fn reset(&mut self, cookie: InputCookie, stripe: ChunkStripe) -> ArmadaResult<()> {
        let entry = self.entry(cookie)?;
        internal_ensure!(
            entry.job.is_none(),
            "reset of input cookie {} still bound to a job",
            cookie
        );
        let was_free = self.free_stripes.contains(&cookie);
        if was_free {
            self.make_unfree(cookie);
        }
        let old = &self.stripes[cookie].stripe;
        self.total_data_weight += stripe.data_weight() - old.data_weight();
        self.total_row_count += stripe.row_count() - old.row_count();
        self.stripes[cookie].stripe = stripe;
        if was_free {
            self.make_free(cookie);
        }
        Ok(())
    }

    fn stripe(&self, cookie: InputCookie) -> ArmadaResult<&ChunkStripe> {
        Ok(&self.entry(cookie)?.stripe)
    }

    fn finish(&mut self) {
        self.finished = true;
    }

    fn is_finished(&self) -> bool {
        self.finished
    }
}

impl ChunkPoolOutput for UnorderedChunkPool {
    fn extract(&mut self, node: Option<NodeId>) -> ArmadaResult<Option<OutputCookie>> {
        // Lost jobs come back first, under their original cookie, as soon as
        // none of their stripes is suspended.
        let lost = self.lost_jobs.iter().copied().find(|&cookie| {
            self.jobs[cookie]
                .input_cookies
                .iter()
                .all(|&c| self.stripes[c].suspend_count == 0)
        });
        if let Some(cookie) = lost {
            self.lost_jobs.shift_remove(&cookie);
            self.jobs[cookie].state = JobState::Running;
            self.running_job_count += 1;
            return Ok(Some(cookie));
        }
        if self.free_stripes.is_empty() {
            return Ok(None);
        }
        let mut order: Vec<InputCookie> = Vec::with_capacity(self.free_stripes.len());
        if let Some(node) = node {
            order.extend(self.free_stripes.iter().copied().filter(|&c| {
                self.stripes[c]
                    .stripe
                    .slices
                    .iter()
                    .any(|s| s.replica_nodes.contains(&node))
            }));
        }
        for &c in &self.free_stripes {
            if !order.contains(&c) {
                order.push(c);
            }
        }

        let mut picked = Vec::new();
        let mut list = StripeList::default();
        for cookie in order {
            if !picked.is_empty()
                && (list.total_data_weight >= self.data_weight_per_job
                    || list.slice_count() + self.stripes[cookie].stripe.slice_count()
                        > self.max_slices_per_job)
            {
                break;
            }
            list.push(self.stripes[cookie].stripe.clone());
            picked.push(cookie);
        }

        let output_cookie = self.jobs.len();
        for &cookie in &picked {
            self.make_unfree(cookie);
            self.stripes[cookie].job = Some(output_cookie);
        }
        self.jobs.push(ExtractedJob {
            stripe_list: list,
            input_cookies: picked,
            state: JobState::Running,
            regenerating: false,
        });
        self.running_job_count += 1;
        Ok(Some(output_cookie))
    }

    fn stripe_list(&self, cookie: OutputCookie) -> ArmadaResult<&StripeList> {
        self.jobs
            .get(cookie)
            .map(|j| &j.stripe_list)
            .ok_or_else(|| internal_err!("unknown output cookie {}", cookie))
    }

    fn completed(&mut self, cookie: OutputCookie) -> ArmadaResult<()> {
        let state = self.job_state(cookie)?;
        internal_ensure!(
            state == JobState::Running,
            "completed on cookie {} in state {:?}",
            cookie,
            state
        );
        let job = &mut self.jobs[cookie];
        job.state = JobState::Completed;
        self.running_job_count -= 1;
        self.completed_job_count += 1;
        self.completed_data_weight += self.jobs[cookie].stripe_list.total_data_weight;
        self.completed_row_count += self.jobs[cookie].stripe_list.total_row_count;
        Ok(())
    }

    fn failed(&mut self, cookie: OutputCookie) -> ArmadaResult<()> {
        let state = self.job_state(cookie)?;
        internal_ensure!(
            state == JobState::Running,
            "failed on cookie {} in state {:?}",
            cookie,
            state
        );
        self.running_job_count -= 1;
        if self.jobs[cookie].regenerating {
            // A regeneration attempt failed; keep the frozen grouping so the
            // same cookie is retried.
            self.jobs[cookie].state = JobState::Lost;
            self.lost_jobs.insert(cookie);
        } else {
            self.jobs[cookie].state = JobState::Invalidated;
            self.return_job_stripes(cookie);
        }
        Ok(())
    }

    fn aborted(&mut self, cookie: OutputCookie) -> ArmadaResult<()> {
        self.failed(cookie)
    }

    fn lost(&mut self, cookie: OutputCookie) -> ArmadaResult<()> {
        let state = self.job_state(cookie)?;
        internal_ensure!(
            state == JobState::Completed,
            "lost on cookie {} in state {:?}",
            cookie,
            state
        );
        self.jobs[cookie].state = JobState::Lost;
        self.jobs[cookie].regenerating = true;
        self.completed_job_count -= 1;
        self.completed_data_weight -= self.jobs[cookie].stripe_list.total_data_weight;
        self.completed_row_count -= self.jobs[cookie].stripe_list.total_row_count;
        self.lost_jobs.insert(cookie);
        Ok(())
    }

    fn pending_job_count(&self) -> usize {
        let from_free = if self.free_stripes.is_empty() {
            0
        } else {
            let by_weight =
                (self.free_data_weight + self.data_weight_per_job - 1) / self.data_weight_per_job;
            by_weight.max(1) as usize
        };
        from_free + self.lost_jobs.len()
    }

    fn total_job_count(&self) -> usize {
        self.pending_job_count() + self.running_job_count + self.completed_job_count
    }

    fn is_completed(&self) -> bool {
        self.finished
            && self.free_stripes.is_empty()
            && self.lost_jobs.is_empty()
            && self.suspended_stripe_count == 0
            && self.running_job_count == 0
    }

    fn approximate_stripe_statistics(&self) -> StripeStatistics {
        aggregate_statistics(
            self.free_stripes
                .iter()
                .map(|&c| &self.stripes[c].stripe),
        )
    }

    fn total_data_weight(&self) -> i64 {
        self.total_data_weight
    }

    fn total_row_count(&self) -> i64 {
        self.total_row_count
    }

    fn completed_data_weight(&self) -> i64 {
        self.completed_data_weight
    }

    fn completed_row_count(&self) -> i64 {
        self.completed_row_count
    }

    fn pending_data_weight(&self) -> i64 {
        self.free_data_weight
    }

    fn locality(&self) -> &HashMap<NodeId, i64> {
        &self.locality
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk_pool::stripe::{ChunkId, ChunkSlice};

    fn stripe(weight: i64, rows: i64) -> ChunkStripe {
        ChunkStripe::new(vec![ChunkSlice::new(ChunkId::new(), weight, rows)])
    }

    fn stripe_on(weight: i64, node: NodeId) -> ChunkStripe {
        ChunkStripe::new(vec![
            ChunkSlice::new(ChunkId::new(), weight, 1).with_replicas(vec![node])
        ])
    }

    #[test]
    fn extract_groups_up_to_target_weight() {
        let mut pool = UnorderedChunkPool::new(100, 100);
        for _ in 0..4 {
            pool.add(stripe(60, 6)).unwrap();
        }
        pool.finish();
        assert_eq!(pool.total_data_weight(), 240);

        let cookie = pool.extract(None).unwrap().unwrap();
        let list = pool.stripe_list(cookie).unwrap();
        // 60 < 100 so a second stripe is taken; 120 >= 100 stops the group.
        assert_eq!(list.stripes.len(), 2);
        assert_eq!(list.total_data_weight, 120);
        assert_eq!(pool.pending_data_weight(), 120);

        pool.completed(cookie).unwrap();
        assert_eq!(pool.completed_data_weight(), 120);
        assert!(!pool.is_completed());

        let cookie2 = pool.extract(None).unwrap().unwrap();
        pool.completed(cookie2).unwrap();
        assert!(pool.extract(None).unwrap().is_none());
        assert!(pool.is_completed());
    }

    #[test]
    fn extract_prefers_local_stripes() {
        let mut pool = UnorderedChunkPool::new(50, 100);
        pool.add(stripe_on(40, 1)).unwrap();
        pool.add(stripe_on(40, 2)).unwrap();
        pool.finish();

        let cookie = pool.extract(Some(2)).unwrap().unwrap();
        let list = pool.stripe_list(cookie).unwrap();
        assert_eq!(list.stripes[0].slices[0].replica_nodes, vec![2]);
    }

    #[test]
    fn failed_job_returns_stripes_and_new_cookie_is_issued() {
        let mut pool = UnorderedChunkPool::new(1000, 100);
        pool.add(stripe(10, 1)).unwrap();
        pool.finish();

        let first = pool.extract(None).unwrap().unwrap();
        assert_eq!(pool.pending_job_count(), 0);
        pool.failed(first).unwrap();
        assert_eq!(pool.pending_job_count(), 1);

        let second = pool.extract(None).unwrap().unwrap();
        assert_ne!(first, second);
        // The invalidated cookie rejects further transitions.
        assert!(pool.completed(first).is_err());
        pool.completed(second).unwrap();
    }

    #[test]
    fn lost_completed_job_is_reextracted_under_the_same_cookie() {
        let mut pool = UnorderedChunkPool::new(1000, 100);
        pool.add(stripe(10, 1)).unwrap();
        pool.finish();

        let first = pool.extract(None).unwrap().unwrap();
        pool.completed(first).unwrap();
        assert!(pool.is_completed());

        pool.lost(first).unwrap();
        assert_eq!(pool.completed_data_weight(), 0);
        assert_eq!(pool.pending_job_count(), 1);
        assert!(!pool.is_completed());

        let second = pool.extract(None).unwrap().unwrap();
        assert_eq!(first, second);
        // Losing the cookie again while it is running is a consistency error.
        assert!(pool.lost(first).is_err());
        pool.completed(second).unwrap();
        assert!(pool.is_completed());
    }

    #[test]
    fn failed_regeneration_keeps_the_frozen_cookie() {
        let mut pool = UnorderedChunkPool::new(1000, 100);
        pool.add(stripe(10, 1)).unwrap();
        pool.finish();

        let cookie = pool.extract(None).unwrap().unwrap();
        pool.completed(cookie).unwrap();
        pool.lost(cookie).unwrap();

        let retry = pool.extract(None).unwrap().unwrap();
        assert_eq!(retry, cookie);
        pool.failed(retry).unwrap();

        // Still the same frozen grouping, not a regrouped fresh cookie.
        let again = pool.extract(None).unwrap().unwrap();
        assert_eq!(again, cookie);
        pool.completed(again).unwrap();
        assert!(pool.is_completed());
    }

    #[test]
    fn suspended_stripe_is_not_extractable_until_resumed() {
        let mut pool = UnorderedChunkPool::new(1000, 100);
        let cookie = pool.add(stripe(10, 1)).unwrap();
        pool.finish();

        pool.suspend(cookie).unwrap();
        assert!(pool.extract(None).unwrap().is_none());
        assert!(!pool.is_completed());

        // Suspensions nest.
        pool.suspend(cookie).unwrap();
        pool.resume(cookie).unwrap();
        assert!(pool.extract(None).unwrap().is_none());
        pool.resume(cookie).unwrap();
        assert!(pool.extract(None).unwrap().is_some());
    }

    #[test]
    fn reset_swaps_stripe_and_adjusts_totals() {
        let mut pool = UnorderedChunkPool::new(1000, 100);
        let cookie = pool.add(stripe(10, 1)).unwrap();
        pool.add(stripe(5, 1)).unwrap();
        assert_eq!(pool.total_data_weight(), 15);

        pool.reset(cookie, stripe(30, 3)).unwrap();
        assert_eq!(pool.total_data_weight(), 35);
        assert_eq!(pool.pending_data_weight(), 35);
        assert_eq!(pool.stripe(cookie).unwrap().data_weight(), 30);
    }

    #[test]
    fn add_after_finish_is_rejected() {
        let mut pool = UnorderedChunkPool::new(100, 100);
        pool.finish();
        assert!(pool.add(stripe(1, 1)).is_err());
    }
}
