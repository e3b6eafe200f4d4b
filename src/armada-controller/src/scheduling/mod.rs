pub mod context;
pub mod joblet;
pub mod task;
pub mod task_group;
