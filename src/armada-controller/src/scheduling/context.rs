use std::{
    fmt::{self, Display},
    sync::Arc,
};

use common_resource_request::ResourceRequest;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    chunk_pool::{PoolId, StripeList},
    scheduling::task::TaskIdx,
};

pub type NodeId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationId(Uuid);

impl OperationId {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(Uuid);

impl JobId {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Read-only snapshot of one execution node, refreshed periodically from
/// the external scheduler. The controller only caches these, it never
/// mutates the authoritative copy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub id: NodeId,
    pub address: Arc<str>,
    pub io_weight: f64,
    pub resource_limits: ResourceRequest,
}

impl NodeDescriptor {
    pub fn new(id: NodeId, address: impl Into<Arc<str>>, resource_limits: ResourceRequest) -> Self {
        Self {
            id,
            address: address.into(),
            io_weight: 1.0,
            resource_limits,
        }
    }

    #[must_use]
    pub fn with_io_weight(mut self, io_weight: f64) -> Self {
        self.io_weight = io_weight;
        self
    }
}

/// One `schedule_job` invocation's view: the polling node and what it has
/// free right now.
#[derive(Debug, Clone)]
pub struct ScheduleJobContext {
    pub node: NodeDescriptor,
    pub available_resources: ResourceRequest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobType {
    Map,
    OrderedMerge,
    UnorderedMerge,
    SortedMerge,
    Partition,
    SimpleSort,
    IntermediateSort,
    FinalSort,
}

/// Destination of one output stream of a job, mirroring the owning task's
/// edge descriptors at the moment the job was scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobOutputTarget {
    /// Final operation output table.
    Sink { output_table: usize },
    /// Intermediate data feeding another pool.
    Pool { pool: PoolId },
}

/// The payload handed to the execution layer. Opaque to the scheduler; the
/// controller never inspects it again beyond what it wrote.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub operation_id: OperationId,
    pub job_id: JobId,
    pub job_type: JobType,
    pub input: StripeList,
    pub outputs: Vec<JobOutputTarget>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub job_id: JobId,
    pub task: TaskIdx,
    pub spec: JobSpec,
    pub resource_demand: ResourceRequest,
}

/// Outcome of one `schedule_job` call. `None` job means "no work for this
/// node right now" and is not an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScheduleJobResult {
    pub job: Option<ScheduledJob>,
}

impl ScheduleJobResult {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_job(job: ScheduledJob) -> Self {
        Self { job: Some(job) }
    }
}
