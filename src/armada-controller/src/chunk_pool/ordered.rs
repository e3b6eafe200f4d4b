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
    /// Ledger jobs this input's slices landed in, filled at `finish()`.
    jobs: Vec<usize>,
}

/// Pool preserving input order across job boundaries: jobs are frozen at
/// `finish()` as contiguous slice ranges in registration order, so the
/// concatenation of job outputs reproduces the input order. Locality is
/// ignored; order wins.
#[derive(Debug, Serialize, Deserialize)]
pub struct OrderedChunkPool {
    data_weight_per_job: i64,
    max_slices_per_job: usize,
    /// When set, exactly this many jobs are built (fewer only if there are
    /// not enough slices), each a contiguous near-equal-weight range.
    explicit_job_count: Option<usize>,
    finished: bool,
    inputs: Vec<InputEntry>,
    ledger: JobLedger,
    total_data_weight: i64,
    total_row_count: i64,
}

impl OrderedChunkPool {
    pub fn new(
        data_weight_per_job: i64,
        max_slices_per_job: usize,
        explicit_job_count: Option<usize>,
    ) -> Self {
        Self {
            data_weight_per_job: data_weight_per_job.max(1),
            max_slices_per_job: max_slices_per_job.max(1),
            explicit_job_count,
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

    fn build_jobs(&mut self) {
        let slices: Vec<(InputCookie, ChunkSlice)> = self
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

        let job_count = match self.explicit_job_count {
            Some(count) => count.clamp(1, slices.len()),
            None => 0,
        };

        let mut group: Vec<(InputCookie, ChunkSlice)> = Vec::new();
        let mut group_weight = 0i64;
        let mut remaining_weight = self.total_data_weight;
        let mut remaining_jobs = job_count;
        let flush = |pool_ledger: &mut JobLedger,
                     inputs: &mut Vec<InputEntry>,
                     group: &mut Vec<(InputCookie, ChunkSlice)>| {
            if group.is_empty() {
                return;
            }
            let mut cookies: Vec<InputCookie> = Vec::new();
            let mut list = StripeList::default();
            list.push(ChunkStripe::new(
                group.iter().map(|(_, s)| s.clone()).collect(),
            ));
            for (cookie, _) in group.iter() {
                if !cookies.contains(cookie) {
                    cookies.push(*cookie);
                }
            }
            let job = pool_ledger.push_job(list, cookies.clone());
            for cookie in cookies {
                inputs[cookie].jobs.push(job);
                if inputs[cookie].suspend_count > 0 {
                    pool_ledger.note_suspended(job, true);
                }
            }
            group.clear();
        };

        for (index, (cookie, slice)) in slices.iter().enumerate() {
            let target = if remaining_jobs > 0 {
                (remaining_weight + remaining_jobs as i64 - 1) / remaining_jobs as i64
            } else {
                self.data_weight_per_job
            };
            group_weight += slice.data_weight;
            group.push((*cookie, slice.clone()));
            let slices_left = slices.len() - index - 1;
            let must_cut = group_weight >= target
                || group.len() >= self.max_slices_per_job
                // With an explicit count, never leave fewer slices than jobs.
                || (remaining_jobs > 1 && slices_left < remaining_jobs);
            if must_cut {
                remaining_weight -= group_weight;
                group_weight = 0;
                if remaining_jobs > 0 {
                    remaining_jobs -= 1;
                }
                flush(&mut self.ledger, &mut self.inputs, &mut group);
            }
        }
        flush(&mut self.ledger, &mut self.inputs, &mut group);
    }
}

impl ChunkPoolInput for OrderedChunkPool {
    fn add(&mut self, stripe: ChunkStripe) -> ArmadaResult<InputCookie> {
        internal_ensure!(!self.finished, "add after finish on ordered pool");
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
            // Removed slices disappear from every affected job; replacement
            // slices all land in the first one.
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

impl ChunkPoolOutput for OrderedChunkPool {
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
