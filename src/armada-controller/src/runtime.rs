//! Async shell around the synchronous controller. A single actor task owns
//! the [`OperationController`] and serializes every event through one
//! channel, which is what makes the controller's single-writer assumption
//! hold; callers talk to it through a cloneable handle.

use std::{sync::Arc, time::SystemTime};

use common_error::{internal_err, ArmadaResult};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::{
    chunk_pool::ChunkId,
    config::ControllerConfig,
    operation::{controller::OperationController, progress::OperationProgress, OperationState},
    scheduling::{
        context::{JobId, ScheduleJobContext, ScheduleJobResult},
        joblet::{AbortedJobSummary, CompletedJobSummary, FailedJobSummary},
    },
    snapshot,
    utils::channel::{
        create_channel, create_oneshot_channel, OneshotSender, Receiver, Sender,
    },
};

const MESSAGE_BUFFER_SIZE: usize = 256;

enum ControllerMessage {
    ScheduleJob {
        ctx: ScheduleJobContext,
        reply: OneshotSender<ScheduleJobResult>,
    },
    JobCompleted(CompletedJobSummary),
    JobFailed(FailedJobSummary),
    JobAborted(AbortedJobSummary),
    InputChunkUnavailable(ChunkId),
    InputChunkAvailable(ChunkId),
    IntermediateChunkLost(ChunkId),
    Revive {
        live_jobs: Vec<JobId>,
        reply: OneshotSender<ArmadaResult<Vec<JobId>>>,
    },
    GetState {
        reply: OneshotSender<OperationState>,
    },
    GetProgress {
        reply: OneshotSender<OperationProgress>,
    },
    GetNeededResources {
        reply: OneshotSender<ArmadaResult<common_resource_request::ResourceRequest>>,
    },
    TakeJobsToAbort {
        reply: OneshotSender<Vec<JobId>>,
    },
    BuildSnapshot {
        reply: OneshotSender<ArmadaResult<Vec<u8>>>,
    },
    Commit {
        reply: OneshotSender<ArmadaResult<()>>,
    },
    Abort {
        reason: String,
    },
    UpdateConfig(Arc<ControllerConfig>),
}

/// Owns the controller and drains its message queue until cancellation or
/// handle drop.
pub struct ControllerActor {
    controller: OperationController,
}

impl ControllerActor {
    pub fn new(controller: OperationController) -> Self {
        Self { controller }
    }

    /// Spawns the event loop; the returned handle is the only way to reach
    /// the controller from then on.
    pub fn spawn(
        controller: OperationController,
        cancellation_token: CancellationToken,
    ) -> (OperationControllerHandle, JoinHandle<()>) {
        let (sender, receiver) = create_channel(MESSAGE_BUFFER_SIZE);
        let actor = Self::new(controller);
        let join_handle =
            tokio::spawn(async move { actor.run_event_loop(receiver, cancellation_token).await });
        (OperationControllerHandle { sender }, join_handle)
    }

    async fn run_event_loop(
        mut self,
        mut receiver: Receiver<ControllerMessage>,
        cancellation_token: CancellationToken,
    ) {
        let config = Arc::clone(&self.controller.context().config);
        let mut time_limit_ticker = tokio::time::interval(config.time_limit_check_period);
        time_limit_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut progress_ticker = tokio::time::interval(config.progress_log_period);
        progress_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = cancellation_token.cancelled() => {
                    self.controller.abort("controller shut down");
                    break;
                }
                message = receiver.recv() => {
                    match message {
                        Some(message) => self.handle_message(message),
                        None => break,
                    }
                }
                _ = time_limit_ticker.tick() => {
                    self.controller.check_time_limit(SystemTime::now());
                }
                _ = progress_ticker.tick() => {
                    self.controller.log_progress();
                }
            }
        }
    }

    fn handle_message(&mut self, message: ControllerMessage) {
        match message {
            ControllerMessage::ScheduleJob { ctx, reply } => {
                let _ = reply.send(self.controller.schedule_job(&ctx));
            }
            ControllerMessage::JobCompleted(summary) => {
                let result = self.controller.on_job_completed(summary);
                self.settle(result);
            }
            ControllerMessage::JobFailed(summary) => {
                let result = self.controller.on_job_failed(summary);
                self.settle(result);
            }
            ControllerMessage::JobAborted(summary) => {
                let result = self.controller.on_job_aborted(summary);
                self.settle(result);
            }
            ControllerMessage::InputChunkUnavailable(chunk_id) => {
                let result = self.controller.on_input_chunk_unavailable(chunk_id);
                self.settle(result);
            }
            ControllerMessage::InputChunkAvailable(chunk_id) => {
                let result = self.controller.on_input_chunk_available(chunk_id);
                self.settle(result);
            }
            ControllerMessage::IntermediateChunkLost(chunk_id) => {
                let result = self.controller.on_intermediate_chunk_lost(chunk_id);
                self.settle(result);
            }
            ControllerMessage::Revive { live_jobs, reply } => {
                let _ = reply.send(self.controller.revive(&live_jobs));
            }
            ControllerMessage::GetState { reply } => {
                let _ = reply.send(self.controller.state());
            }
            ControllerMessage::GetProgress { reply } => {
                let _ = reply.send(self.controller.progress().clone());
            }
            ControllerMessage::GetNeededResources { reply } => {
                let _ = reply.send(self.controller.get_needed_resources());
            }
            ControllerMessage::TakeJobsToAbort { reply } => {
                let _ = reply.send(self.controller.take_jobs_to_abort());
            }
            ControllerMessage::BuildSnapshot { reply } => {
                let _ = reply.send(snapshot::save(&self.controller));
            }
            ControllerMessage::Commit { reply } => {
                let _ = reply.send(self.controller.commit());
            }
            ControllerMessage::Abort { reason } => {
                self.controller.abort(&reason);
            }
            ControllerMessage::UpdateConfig(config) => {
                self.controller.update_config(config);
            }
        }
        if self.controller.take_snapshot_request() {
            match snapshot::save(&self.controller) {
                Ok(bytes) => tracing::info!(
                    operation_id = %self.controller.operation_id(),
                    size = bytes.len(),
                    "snapshot cycle after materialization succeeded"
                ),
                Err(error) => tracing::warn!(
                    operation_id = %self.controller.operation_id(),
                    %error,
                    "snapshot cycle after materialization failed"
                ),
            }
        }
    }

    /// Internal inconsistencies fail the operation; anything else is logged
    /// and the event dropped.
    fn settle(&mut self, result: ArmadaResult<()>) {
        if let Err(error) = result {
            if error.is_internal() {
                self.controller.fail_operation(error);
            } else {
                tracing::error!(
                    operation_id = %self.controller.operation_id(),
                    %error,
                    "controller event failed"
                );
            }
        }
    }
}

/// Cheap cloneable front of the controller actor.
#[derive(Clone)]
pub struct OperationControllerHandle {
    sender: Sender<ControllerMessage>,
}

impl OperationControllerHandle {
    async fn request<T>(
        &self,
        message: ControllerMessage,
        receiver: crate::utils::channel::OneshotReceiver<T>,
    ) -> ArmadaResult<T> {
        self.sender
            .send(message)
            .await
            .map_err(|_| internal_err!("operation controller stopped"))?;
        receiver
            .await
            .map_err(|_| internal_err!("operation controller dropped the reply"))
    }

    async fn notify(&self, message: ControllerMessage) -> ArmadaResult<()> {
        self.sender
            .send(message)
            .await
            .map_err(|_| internal_err!("operation controller stopped"))
    }

    pub async fn schedule_job(&self, ctx: ScheduleJobContext) -> ArmadaResult<ScheduleJobResult> {
        let (reply, receiver) = create_oneshot_channel();
        self.request(ControllerMessage::ScheduleJob { ctx, reply }, receiver)
            .await
    }

    pub async fn on_job_completed(&self, summary: CompletedJobSummary) -> ArmadaResult<()> {
        self.notify(ControllerMessage::JobCompleted(summary)).await
    }

    pub async fn on_job_failed(&self, summary: FailedJobSummary) -> ArmadaResult<()> {
        self.notify(ControllerMessage::JobFailed(summary)).await
    }

    pub async fn on_job_aborted(&self, summary: AbortedJobSummary) -> ArmadaResult<()> {
        self.notify(ControllerMessage::JobAborted(summary)).await
    }

    pub async fn on_input_chunk_unavailable(&self, chunk_id: ChunkId) -> ArmadaResult<()> {
        self.notify(ControllerMessage::InputChunkUnavailable(chunk_id))
            .await
    }

    pub async fn on_input_chunk_available(&self, chunk_id: ChunkId) -> ArmadaResult<()> {
        self.notify(ControllerMessage::InputChunkAvailable(chunk_id))
            .await
    }

    pub async fn on_intermediate_chunk_lost(&self, chunk_id: ChunkId) -> ArmadaResult<()> {
        self.notify(ControllerMessage::IntermediateChunkLost(chunk_id))
            .await
    }

    pub async fn revive(&self, live_jobs: Vec<JobId>) -> ArmadaResult<Vec<JobId>> {
        let (reply, receiver) = create_oneshot_channel();
        self.request(ControllerMessage::Revive { live_jobs, reply }, receiver)
            .await?
    }

    pub async fn state(&self) -> ArmadaResult<OperationState> {
        let (reply, receiver) = create_oneshot_channel();
        self.request(ControllerMessage::GetState { reply }, receiver)
            .await
    }

    pub async fn progress(&self) -> ArmadaResult<OperationProgress> {
        let (reply, receiver) = create_oneshot_channel();
        self.request(ControllerMessage::GetProgress { reply }, receiver)
            .await
    }

    pub async fn get_needed_resources(
        &self,
    ) -> ArmadaResult<common_resource_request::ResourceRequest> {
        let (reply, receiver) = create_oneshot_channel();
        self.request(ControllerMessage::GetNeededResources { reply }, receiver)
            .await?
    }

    pub async fn take_jobs_to_abort(&self) -> ArmadaResult<Vec<JobId>> {
        let (reply, receiver) = create_oneshot_channel();
        self.request(ControllerMessage::TakeJobsToAbort { reply }, receiver)
            .await
    }

    pub async fn build_snapshot(&self) -> ArmadaResult<Vec<u8>> {
        let (reply, receiver) = create_oneshot_channel();
        self.request(ControllerMessage::BuildSnapshot { reply }, receiver)
            .await?
    }

    pub async fn commit(&self) -> ArmadaResult<()> {
        let (reply, receiver) = create_oneshot_channel();
        self.request(ControllerMessage::Commit { reply }, receiver)
            .await?
    }

    pub async fn abort(&self, reason: impl Into<String>) -> ArmadaResult<()> {
        self.notify(ControllerMessage::Abort {
            reason: reason.into(),
        })
        .await
    }

    pub async fn update_config(&self, config: Arc<ControllerConfig>) -> ArmadaResult<()> {
        self.notify(ControllerMessage::UpdateConfig(config)).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use common_resource_request::ResourceRequest;

    use super::*;
    use crate::{
        chunk_pool::{ChunkSlice, ChunkStripe},
        operation::{
            controller::{InputTable, OperationInput},
            spec::{OperationKind, OperationSpec},
            OperationContext,
        },
        scheduling::{
            context::{NodeDescriptor, OperationId},
            joblet::JobStatistics,
        },
    };

    fn running_map_controller() -> OperationController {
        let spec = OperationSpec::new(OperationKind::Map)
            .with_input_tables(vec!["//tmp/in".into()])
            .with_output_tables(vec!["//tmp/out".into()]);
        let context = OperationContext::new(
            OperationId::new(),
            Arc::new(ControllerConfig::default()),
            Arc::new(spec),
        );
        let mut controller = OperationController::new(context).unwrap();
        let input = OperationInput {
            tables: vec![InputTable {
                stripes: vec![ChunkStripe::new(vec![ChunkSlice::new(
                    ChunkId::new(),
                    1000,
                    100,
                )])],
                samples: vec![],
            }],
        };
        controller.prepare(&input).unwrap();
        controller.materialize().unwrap();
        controller
    }

    fn schedule_context() -> ScheduleJobContext {
        ScheduleJobContext {
            node: NodeDescriptor::new(1, "node-1:9012", ResourceRequest::from_memory(1 << 34)),
            available_resources: ResourceRequest::from_memory(1 << 34),
        }
    }

    #[tokio::test]
    async fn actor_runs_a_map_operation_to_completion() {
        let (handle, join_handle) =
            ControllerActor::spawn(running_map_controller(), CancellationToken::new());

        let result = handle.schedule_job(schedule_context()).await.unwrap();
        let job = result.job.expect("a job should be schedulable");
        handle
            .on_job_completed(CompletedJobSummary {
                job_id: job.job_id,
                statistics: JobStatistics::default(),
                output_stripes: vec![ChunkStripe::new(vec![ChunkSlice::new(
                    ChunkId::new(),
                    500,
                    50,
                )])],
            })
            .await
            .unwrap();

        assert_eq!(handle.state().await.unwrap(), OperationState::Completing);
        handle.commit().await.unwrap();
        assert_eq!(handle.state().await.unwrap(), OperationState::Completed);

        drop(handle);
        join_handle.await.unwrap();
    }

    #[tokio::test]
    async fn cancellation_aborts_the_operation() {
        let token = CancellationToken::new();
        let (handle, join_handle) =
            ControllerActor::spawn(running_map_controller(), token.clone());

        token.cancel();
        join_handle.await.unwrap();
        assert!(handle.state().await.is_err());
    }
}
