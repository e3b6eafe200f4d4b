use std::collections::{BTreeSet, HashMap, HashSet};

use common_error::{internal_ensure, internal_err, ArmadaResult};
use serde::{Deserialize, Serialize};

use super::{
    stripe::{ChunkId, ChunkSlice},
    ChunkStripe, InputCookie, OutputCookie, StripeList,
};
use crate::scheduling::context::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum FrozenJobState {
    Pending,
    Running,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct FrozenJob {
    pub stripe_list: StripeList,
    pub input_cookies: Vec<InputCookie>,
    pub state: FrozenJobState,
    pub suspended_count: u32,
}

/// Job bookkeeping for pools whose job list is frozen at `finish()`
/// (ordered and sorted pools). Cookies are job indices; a failed or lost
/// job transitions back to pending under the same cookie, preserving its
/// position in the output order.
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct JobLedger {
    jobs: Vec<FrozenJob>,
    pending: BTreeSet<OutputCookie>,
    pending_data_weight: i64,
    running_count: usize,
    completed_count: usize,
    completed_data_weight: i64,
    completed_row_count: i64,
    // Frozen-job pools do not track locality; kept to satisfy the pool
    // output contract with a stable borrow.
    no_locality: HashMap<NodeId, i64>,
}

impl JobLedger {
    pub fn push_job(&mut self, stripe_list: StripeList, input_cookies: Vec<InputCookie>) -> usize {
        let index = self.jobs.len();
        self.pending_data_weight += stripe_list.total_data_weight;
        self.jobs.push(FrozenJob {
            stripe_list,
            input_cookies,
            state: FrozenJobState::Pending,
            suspended_count: 0,
        });
        self.pending.insert(index);
        index
    }

    fn job(&self, cookie: OutputCookie) -> ArmadaResult<&FrozenJob> {
        self.jobs
            .get(cookie)
            .ok_or_else(|| internal_err!("unknown output cookie {}", cookie))
    }

    pub fn extract(&mut self) -> Option<OutputCookie> {
        let cookie = self
            .pending
            .iter()
            .copied()
            .find(|&c| self.jobs[c].suspended_count == 0)?;
        self.pending.remove(&cookie);
        self.pending_data_weight -= self.jobs[cookie].stripe_list.total_data_weight;
        self.jobs[cookie].state = FrozenJobState::Running;
        self.running_count += 1;
        Some(cookie)
    }

    pub fn stripe_list(&self, cookie: OutputCookie) -> ArmadaResult<&StripeList> {
        Ok(&self.job(cookie)?.stripe_list)
    }

    pub fn completed(&mut self, cookie: OutputCookie) -> ArmadaResult<()> {
        let state = self.job(cookie)?.state;
        internal_ensure!(
            state == FrozenJobState::Running,
            "completed on cookie {} in state {:?}",
            cookie,
            state
        );
        self.jobs[cookie].state = FrozenJobState::Completed;
        self.running_count -= 1;
        self.completed_count += 1;
        self.completed_data_weight += self.jobs[cookie].stripe_list.total_data_weight;
        self.completed_row_count += self.jobs[cookie].stripe_list.total_row_count;
        Ok(())
    }

    pub fn returned(&mut self, cookie: OutputCookie) -> ArmadaResult<()> {
        let state = self.job(cookie)?.state;
        internal_ensure!(
            state == FrozenJobState::Running,
            "returned cookie {} in state {:?}",
            cookie,
            state
        );
        self.jobs[cookie].state = FrozenJobState::Pending;
        self.running_count -= 1;
        self.pending_data_weight += self.jobs[cookie].stripe_list.total_data_weight;
        self.pending.insert(cookie);
        Ok(())
    }

    pub fn lost(&mut self, cookie: OutputCookie) -> ArmadaResult<()> {
        let state = self.job(cookie)?.state;
        internal_ensure!(
            state == FrozenJobState::Completed,
            "lost on cookie {} in state {:?}",
            cookie,
            state
        );
        self.jobs[cookie].state = FrozenJobState::Pending;
        self.completed_count -= 1;
        self.completed_data_weight -= self.jobs[cookie].stripe_list.total_data_weight;
        self.completed_row_count -= self.jobs[cookie].stripe_list.total_row_count;
        self.pending_data_weight += self.jobs[cookie].stripe_list.total_data_weight;
        self.pending.insert(cookie);
        Ok(())
    }

    pub fn note_suspended(&mut self, job: usize, suspend: bool) {
        if suspend {
            self.jobs[job].suspended_count += 1;
        } else {
            self.jobs[job].suspended_count -= 1;
        }
    }

    /// Rewrites a pending job after an input stripe changed underneath it:
    /// slices of `removed_chunks` disappear, `added_slices` (if any) are
    /// appended. Only legal while the job has not been handed out.
    pub fn patch_job(
        &mut self,
        cookie: OutputCookie,
        removed_chunks: &HashSet<ChunkId>,
        added_slices: Vec<ChunkSlice>,
    ) -> ArmadaResult<()> {
        let state = self.job(cookie)?.state;
        internal_ensure!(
            state == FrozenJobState::Pending,
            "patch of cookie {} in state {:?}",
            cookie,
            state
        );
        let old_weight = self.jobs[cookie].stripe_list.total_data_weight;
        let mut list = StripeList::default();
        for stripe in &self.jobs[cookie].stripe_list.stripes {
            let kept: Vec<ChunkSlice> = stripe
                .slices
                .iter()
                .filter(|s| !removed_chunks.contains(&s.chunk_id))
                .cloned()
                .collect();
            if !kept.is_empty() {
                list.push(ChunkStripe::new(kept));
            }
        }
        if !added_slices.is_empty() {
            list.push(ChunkStripe::new(added_slices));
        }
        self.pending_data_weight += list.total_data_weight - old_weight;
        self.jobs[cookie].stripe_list = list;
        Ok(())
    }

    pub fn pending_job_count(&self) -> usize {
        self.pending.len()
    }

    pub fn total_job_count(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_drained(&self) -> bool {
        self.pending.is_empty() && self.running_count == 0
    }

    pub fn pending_data_weight(&self) -> i64 {
        self.pending_data_weight
    }

    pub fn completed_data_weight(&self) -> i64 {
        self.completed_data_weight
    }

    pub fn completed_row_count(&self) -> i64 {
        self.completed_row_count
    }

    pub fn pending_stripes(&self) -> impl Iterator<Item = &ChunkStripe> {
        self.pending
            .iter()
            .flat_map(|&c| self.jobs[c].stripe_list.stripes.iter())
    }

    pub fn no_locality(&self) -> &HashMap<NodeId, i64> {
        &self.no_locality
    }
}
