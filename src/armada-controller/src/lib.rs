//! Operation controller core for distributed batch operations.
//!
//! Turns a logical map / merge / sort / map-reduce operation over distributed
//! tables into a dynamically scheduled set of jobs: chunk pools hold the data
//! still to be processed, tasks wrap pools with job-building logic, the
//! operation controller reacts to job lifecycle events, and the whole graph
//! is checkpointable so a controller can be revived after a restart.

pub mod chunk_pool;
pub mod config;
pub mod job_size;
pub mod operation;
pub mod runtime;
pub mod scheduling;
pub mod snapshot;
mod utils;

pub use config::ControllerConfig;
pub use operation::{
    controller::{OperationController, OperationInput},
    spec::{OperationKind, OperationSpec},
    OperationContext, OperationState,
};
pub use runtime::{ControllerActor, OperationControllerHandle};
pub use scheduling::context::{
    JobId, NodeDescriptor, NodeId, OperationId, ScheduleJobContext, ScheduleJobResult,
};
