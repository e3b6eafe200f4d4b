use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, SystemTime},
};

use common_error::{internal_ensure, ArmadaResult};
use common_resource_request::ResourceRequest;
use serde::{Deserialize, Serialize};

use crate::{
    chunk_pool::{ChunkStripe, InputCookie, OutputCookie, PoolId},
    scheduling::{
        context::{JobId, JobType, NodeId},
        task::{EdgeDescriptor, PartitionIdx, TaskIdx},
    },
};

/// Controller-side record of one in-flight job. Carries everything needed
/// to settle the job later without consulting mutable task state: in
/// particular `edges` is a snapshot taken at schedule time, so a task whose
/// edges were rewritten mid-flight still routes this job's output to where
/// it was headed when it started.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Joblet {
    pub job_id: JobId,
    pub job_type: JobType,
    pub task: TaskIdx,
    pub output_cookie: OutputCookie,
    pub input_data_weight: i64,
    pub input_row_count: i64,
    pub edges: Vec<EdgeDescriptor>,
    pub node: NodeId,
    pub node_address: Arc<str>,
    pub start_time: SystemTime,
    pub resource_demand: ResourceRequest,
    pub partition: Option<PartitionIdx>,
}

/// In-flight jobs by id. Terminal events consume the joblet, so a repeated
/// completion or abort for the same job finds nothing and becomes a no-op.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobletMap {
    joblets: HashMap<JobId, Joblet>,
}

impl JobletMap {
    pub fn register(&mut self, joblet: Joblet) -> ArmadaResult<()> {
        internal_ensure!(
            !self.joblets.contains_key(&joblet.job_id),
            "duplicate joblet registration for job {}",
            joblet.job_id
        );
        self.joblets.insert(joblet.job_id, joblet);
        Ok(())
    }

    pub fn take(&mut self, job_id: JobId) -> Option<Joblet> {
        self.joblets.remove(&job_id)
    }

    pub fn get(&self, job_id: JobId) -> Option<&Joblet> {
        self.joblets.get(&job_id)
    }

    pub fn contains(&self, job_id: JobId) -> bool {
        self.joblets.contains_key(&job_id)
    }

    pub fn len(&self) -> usize {
        self.joblets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joblets.is_empty()
    }

    pub fn job_ids(&self) -> Vec<JobId> {
        self.joblets.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Joblet> {
        self.joblets.values()
    }

    pub fn drain(&mut self) -> Vec<Joblet> {
        self.joblets.drain().map(|(_, joblet)| joblet).collect()
    }
}

/// Remembers, per source task and output cookie, the downstream pool slots
/// a lost job's output had been fed into. When the job is regenerated its
/// replacement data goes back into the same slots.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LostCookieMap {
    entries: HashMap<(TaskIdx, OutputCookie), Vec<(PoolId, InputCookie)>>,
}

impl LostCookieMap {
    pub fn mark_lost(
        &mut self,
        task: TaskIdx,
        output: OutputCookie,
        slots: Vec<(PoolId, InputCookie)>,
    ) {
        self.entries.insert((task, output), slots);
    }

    pub fn take(
        &mut self,
        task: TaskIdx,
        output: OutputCookie,
    ) -> Option<Vec<(PoolId, InputCookie)>> {
        self.entries.remove(&(task, output))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Wall-clock and volume statistics reported by the execution layer for a
/// finished job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobStatistics {
    pub data_weight: i64,
    pub row_count: i64,
    pub prepare_duration: Duration,
    pub exec_duration: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletedJobSummary {
    pub job_id: JobId,
    pub statistics: JobStatistics,
    /// One stripe per output edge of the job, in edge order. An edge that
    /// produced no data still gets its (empty) stripe.
    pub output_stripes: Vec<ChunkStripe>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedJobSummary {
    pub job_id: JobId,
    pub error: String,
    /// Fatal failures abort the operation regardless of the failed-job
    /// budget (for example a user code assertion the scheduler flagged).
    pub fatal: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbortedJobSummary {
    pub job_id: JobId,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn joblet(job_id: JobId) -> Joblet {
        Joblet {
            job_id,
            job_type: JobType::Map,
            task: 0,
            output_cookie: 0,
            input_data_weight: 100,
            input_row_count: 10,
            edges: vec![],
            node: 1,
            node_address: "node-1:9012".into(),
            start_time: SystemTime::now(),
            resource_demand: ResourceRequest::zero(),
            partition: None,
        }
    }

    #[test]
    fn duplicate_registration_is_an_error() {
        let mut map = JobletMap::default();
        let id = JobId::new();
        map.register(joblet(id)).unwrap();
        assert!(map.register(joblet(id)).is_err());
    }

    #[test]
    fn take_consumes_so_second_terminal_event_is_noop() {
        let mut map = JobletMap::default();
        let id = JobId::new();
        map.register(joblet(id)).unwrap();
        assert!(map.take(id).is_some());
        assert!(map.take(id).is_none());
    }

    #[test]
    fn lost_cookie_slot_is_claimed_once() {
        let mut map = LostCookieMap::default();
        map.mark_lost(2, 5, vec![(1, 7), (1, 8)]);
        assert_eq!(map.take(2, 5), Some(vec![(1, 7), (1, 8)]));
        assert_eq!(map.take(2, 5), None);
    }
}
