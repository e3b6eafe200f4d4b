use std::{
    fmt::{self, Display},
    sync::Arc,
};

use serde::{Deserialize, Serialize};

use crate::{config::ControllerConfig, scheduling::context::OperationId};

pub mod controller;
pub mod partition;
pub mod progress;
mod sort;
pub mod spec;

/// Immutable identity and configuration of one operation, threaded
/// explicitly through everything the controller builds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationContext {
    pub operation_id: OperationId,
    pub config: Arc<ControllerConfig>,
    pub spec: Arc<spec::OperationSpec>,
}

impl OperationContext {
    pub fn new(
        operation_id: OperationId,
        config: Arc<ControllerConfig>,
        spec: Arc<spec::OperationSpec>,
    ) -> Self {
        Self {
            operation_id,
            config,
            spec,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationState {
    Preparing,
    Materializing,
    Running,
    Completing,
    Completed,
    Failed,
    Aborted,
}

impl OperationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Aborted)
    }

    /// Whether `schedule_job` may hand out work in this state.
    pub fn is_schedulable(&self) -> bool {
        matches!(self, Self::Running)
    }
}

impl Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Preparing => "preparing",
            Self::Materializing => "materializing",
            Self::Running => "running",
            Self::Completing => "completing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        };
        write!(f, "{name}")
    }
}
