use std::{collections::HashMap, sync::Arc};

use common_resource_request::ResourceRequest;
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};

use crate::scheduling::{context::NodeId, task::TaskIdx};

/// Scheduling bucket of tasks sharing a priority tier. Groups are walked in
/// declaration order on every `schedule_job` call, so the order in which the
/// controller creates them is the scheduling priority.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskGroup {
    pub name: Arc<str>,
    /// Lower bound of what any pending job of this group could need. Lets
    /// the scheduler skip a whole group against a small free slot.
    pub min_needed_resources: ResourceRequest,
    /// Tasks with pending jobs, schedulable anywhere.
    pub candidate_tasks: IndexSet<TaskIdx>,
    /// Tasks with pending jobs preferring a specific node.
    pub local_tasks: HashMap<NodeId, IndexSet<TaskIdx>>,
    /// Candidate tasks currently waiting out their locality delay.
    pub delayed_tasks: IndexSet<TaskIdx>,
}

impl TaskGroup {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            min_needed_resources: ResourceRequest::zero(),
            candidate_tasks: IndexSet::new(),
            local_tasks: HashMap::new(),
            delayed_tasks: IndexSet::new(),
        }
    }

    pub fn add_candidate(&mut self, task: TaskIdx) {
        self.candidate_tasks.insert(task);
    }

    /// Drops the task from every index of the group.
    pub fn remove_task(&mut self, task: TaskIdx) {
        self.candidate_tasks.shift_remove(&task);
        self.delayed_tasks.shift_remove(&task);
        self.local_tasks.retain(|_, tasks| {
            tasks.shift_remove(&task);
            !tasks.is_empty()
        });
    }

    /// Re-registers the task's locality preferences from scratch.
    pub fn set_locality(&mut self, task: TaskIdx, nodes: impl IntoIterator<Item = NodeId>) {
        self.local_tasks.retain(|_, tasks| {
            tasks.shift_remove(&task);
            !tasks.is_empty()
        });
        for node in nodes {
            self.local_tasks.entry(node).or_default().insert(task);
        }
    }

    pub fn local_tasks_for(&self, node: NodeId) -> impl Iterator<Item = TaskIdx> + '_ {
        self.local_tasks
            .get(&node)
            .into_iter()
            .flat_map(|tasks| tasks.iter().copied())
    }

    pub fn is_empty(&self) -> bool {
        self.candidate_tasks.is_empty() && self.local_tasks.is_empty()
    }
}
