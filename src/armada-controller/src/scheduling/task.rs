use std::time::Instant;

use common_resource_request::ResourceRequest;
use serde::{Deserialize, Serialize};

use crate::{
    chunk_pool::{PoolId, PoolOutputRef},
    config::ControllerConfig,
    scheduling::context::JobType,
};

pub type TaskIdx = usize;
pub type GroupIdx = usize;
pub type PartitionIdx = usize;

/// Closed set of task flavors. Dispatch is by matching on the tag; a task
/// never holds behavior, only indices into the controller's arenas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskKind {
    Map,
    OrderedMerge,
    UnorderedMerge { partition: Option<PartitionIdx> },
    SortedMerge { partition: Option<PartitionIdx> },
    Partition,
    SimpleSort,
    Sort { partition: PartitionIdx },
}

impl TaskKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Map => "map",
            Self::OrderedMerge => "ordered_merge",
            Self::UnorderedMerge { .. } => "unordered_merge",
            Self::SortedMerge { .. } => "sorted_merge",
            Self::Partition => "partition",
            Self::SimpleSort => "simple_sort",
            Self::Sort { .. } => "sort",
        }
    }

    pub fn partition(&self) -> Option<PartitionIdx> {
        match self {
            Self::UnorderedMerge { partition } | Self::SortedMerge { partition } => *partition,
            Self::Sort { partition } => Some(*partition),
            Self::SimpleSort => Some(0),
            _ => None,
        }
    }

    /// Memory demand per unit of input data weight, on top of the fixed
    /// footprint. Sort flavors buffer their whole input.
    fn memory_factor(&self) -> i64 {
        match self {
            Self::Sort { .. } | Self::SimpleSort | Self::SortedMerge { .. } => 2,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EdgeDestination {
    /// Final operation output table.
    Sink { output_table: usize },
    /// Another pool's input.
    Pool { pool: PoolId },
}

/// A task's declaration of where its output flows next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeDescriptor {
    pub destination: EdgeDestination,
}

impl EdgeDescriptor {
    pub fn to_sink(output_table: usize) -> Self {
        Self {
            destination: EdgeDestination::Sink { output_table },
        }
    }

    pub fn to_pool(pool: PoolId) -> Self {
        Self {
            destination: EdgeDestination::Pool { pool },
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct CachedTaskState {
    pub pending_job_count: usize,
    pub total_job_count: usize,
}

/// One schedulable unit: a pool output plus job-building logic selected by
/// `kind`. Holds indices only; the controller resolves them at call time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub index: TaskIdx,
    pub kind: TaskKind,
    pub group: GroupIdx,
    pub pool: PoolOutputRef,
    pub edges: Vec<EdgeDescriptor>,
    /// Gated tasks (sort before the shuffle threshold, merges before the
    /// merge threshold) stay out of scheduling until activated.
    pub ready: bool,
    pub completed: bool,
    pub input_finished: bool,
    pub running_job_count: usize,
    pub completed_job_count: usize,
    pub(crate) cached: CachedTaskState,
    /// Set when the task chose to wait for a local slot; cleared once the
    /// locality timeout expires. Not persisted, revival restarts the clock.
    #[serde(skip)]
    pub delayed_until: Option<Instant>,
}

impl Task {
    pub fn new(index: TaskIdx, kind: TaskKind, group: GroupIdx, pool: PoolOutputRef) -> Self {
        Self {
            index,
            kind,
            group,
            pool,
            edges: Vec::new(),
            ready: true,
            completed: false,
            input_finished: false,
            running_job_count: 0,
            completed_job_count: 0,
            cached: CachedTaskState::default(),
            delayed_until: None,
        }
    }

    #[must_use]
    pub fn with_edges(mut self, edges: Vec<EdgeDescriptor>) -> Self {
        self.edges = edges;
        self
    }

    #[must_use]
    pub fn gated(mut self) -> Self {
        self.ready = false;
        self
    }

    /// The job type is a function of the kind and, for sort tasks, of where
    /// the output currently flows: a sort task redirected into a merge pool
    /// emits intermediate-sort jobs instead of final-sort jobs.
    pub fn job_type(&self) -> JobType {
        match self.kind {
            TaskKind::Map => JobType::Map,
            TaskKind::OrderedMerge => JobType::OrderedMerge,
            TaskKind::UnorderedMerge { .. } => JobType::UnorderedMerge,
            TaskKind::SortedMerge { .. } => JobType::SortedMerge,
            TaskKind::Partition => JobType::Partition,
            TaskKind::SimpleSort => JobType::SimpleSort,
            TaskKind::Sort { .. } => {
                if self.writes_only_to_pools() {
                    JobType::IntermediateSort
                } else {
                    JobType::FinalSort
                }
            }
        }
    }

    fn writes_only_to_pools(&self) -> bool {
        !self.edges.is_empty()
            && self
                .edges
                .iter()
                .all(|e| matches!(e.destination, EdgeDestination::Pool { .. }))
    }

    /// Whether downstream can tolerate this task's registered output
    /// disappearing and being recomputed. True only for purely intermediate
    /// output; anything already routed to a sink cannot be re-run safely.
    pub fn can_lose_jobs(&self) -> bool {
        self.writes_only_to_pools()
    }

    /// Resource demand for a job over `input_data_weight` bytes of input:
    /// a fixed proxy footprint plus kind-dependent buffering.
    pub fn needed_resources(
        &self,
        config: &ControllerConfig,
        input_data_weight: i64,
    ) -> ResourceRequest {
        let memory = config.footprint_memory + self.kind.memory_factor() * input_data_weight;
        ResourceRequest {
            user_slots: 1,
            cpu: 1.0,
            memory_bytes: memory,
            network: match self.kind {
                // Sort jobs pull shuffled data across the network.
                TaskKind::Sort { .. } | TaskKind::UnorderedMerge { .. } => input_data_weight,
                _ => 0,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sort_task_job_type_follows_current_edges() {
        let mut task = Task::new(0, TaskKind::Sort { partition: 3 }, 0, PoolOutputRef::plain(0))
            .with_edges(vec![EdgeDescriptor::to_sink(0)]);
        assert_eq!(task.job_type(), JobType::FinalSort);
        assert!(!task.can_lose_jobs());

        task.edges = vec![EdgeDescriptor::to_pool(7)];
        assert_eq!(task.job_type(), JobType::IntermediateSort);
        assert!(task.can_lose_jobs());
    }

    #[test]
    fn sort_memory_demand_exceeds_merge_demand() {
        let config = ControllerConfig::default();
        let sort = Task::new(0, TaskKind::Sort { partition: 0 }, 0, PoolOutputRef::plain(0));
        let merge = Task::new(1, TaskKind::OrderedMerge, 0, PoolOutputRef::plain(1));
        let weight = 1 << 20;
        assert!(
            sort.needed_resources(&config, weight).memory_bytes
                > merge.needed_resources(&config, weight).memory_bytes
        );
    }
}
