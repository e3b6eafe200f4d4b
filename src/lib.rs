//! Facade crate re-exporting the operation controller surface.

pub use armada_controller::{
    chunk_pool, config, job_size, operation, runtime, scheduling, snapshot, ControllerActor,
    ControllerConfig, JobId, NodeDescriptor, NodeId, OperationContext, OperationController,
    OperationControllerHandle, OperationId, OperationInput, OperationKind, OperationSpec,
    OperationState, ScheduleJobContext, ScheduleJobResult,
};
pub use common_error::{ArmadaError, ArmadaResult};
pub use common_resource_request::ResourceRequest;
