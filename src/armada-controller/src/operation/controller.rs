use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::{Instant, SystemTime},
};

use common_error::{internal_ensure, internal_err, ArmadaError, ArmadaResult};
use common_resource_request::ResourceRequest;
use serde::{Deserialize, Serialize};

use crate::{
    chunk_pool::{
        ChunkId, ChunkStripe, InputCookie, KeySample, OrderedChunkPool, OutputCookie, PoolArena,
        PoolEntry, PoolId, PoolOutputRef, SortedChunkPool, UnorderedChunkPool,
    },
    job_size::{JobSizeAdjuster, JobSizeConstraints},
    operation::{
        partition::Partition,
        progress::{OperationProgress, PartitionHistogram},
        spec::{MergeMode, OperationKind, UnavailableChunkStrategy},
        OperationContext, OperationState,
    },
    scheduling::{
        context::{
            JobId, JobOutputTarget, JobSpec, NodeDescriptor, NodeId, ScheduleJobContext,
            ScheduleJobResult, ScheduledJob,
        },
        joblet::{
            AbortedJobSummary, CompletedJobSummary, FailedJobSummary, Joblet, JobletMap,
            LostCookieMap,
        },
        task::{EdgeDescriptor, EdgeDestination, Task, TaskIdx, TaskKind},
        task_group::TaskGroup,
    },
};

/// Stripes and key samples of one input table, fetched by the caller before
/// the operation is prepared.
#[derive(Debug, Clone, Default)]
pub struct InputTable {
    pub stripes: Vec<ChunkStripe>,
    pub samples: Vec<KeySample>,
}

#[derive(Debug, Clone, Default)]
pub struct OperationInput {
    pub tables: Vec<InputTable>,
}

impl OperationInput {
    pub fn total_data_weight(&self) -> i64 {
        self.tables
            .iter()
            .flat_map(|t| t.stripes.iter())
            .map(ChunkStripe::data_weight)
            .sum()
    }

    pub fn total_row_count(&self) -> i64 {
        self.tables
            .iter()
            .flat_map(|t| t.stripes.iter())
            .map(ChunkStripe::row_count)
            .sum()
    }
}

/// The heart of the crate: a single-threaded state machine that turns job
/// lifecycle events into pool transitions and schedules new jobs on demand.
///
/// All methods assume serialized access; the async wrapper in
/// [`crate::runtime`] provides that. The whole struct serializes into a
/// snapshot, so every field is either persistent state or explicitly
/// skipped and rebuilt on revival.
#[derive(Debug, Serialize, Deserialize)]
pub struct OperationController {
    pub(crate) context: OperationContext,
    pub(crate) state: OperationState,
    pub(crate) pools: PoolArena,
    pub(crate) tasks: Vec<Task>,
    pub(crate) groups: Vec<TaskGroup>,
    pub(crate) partitions: Vec<Partition>,
    pub(crate) joblets: JobletMap,
    pub(crate) lost_cookies: LostCookieMap,
    pub(crate) progress: OperationProgress,
    /// Which input pool slots contain each external input chunk.
    pub(crate) input_chunks: HashMap<ChunkId, Vec<(PoolId, InputCookie)>>,
    pub(crate) unavailable_chunks: HashSet<ChunkId>,
    /// Slots suspended while waiting for an unavailable chunk to return.
    pub(crate) waiting_slots: HashMap<ChunkId, Vec<(PoolId, InputCookie)>>,
    /// Chunks produced by jobs, keyed to the source job: intermediate data
    /// feeding downstream pools and uncommitted sink output alike.
    pub(crate) intermediate_chunks: HashMap<ChunkId, (TaskIdx, OutputCookie)>,
    /// Destination slots fed by each source job's output.
    pub(crate) job_destinations: HashMap<(TaskIdx, OutputCookie), Vec<(PoolId, InputCookie)>>,
    pub(crate) adjusters: HashMap<TaskIdx, JobSizeAdjuster>,
    pub(crate) known_nodes: HashMap<NodeId, NodeDescriptor>,
    pub(crate) failed_job_count: usize,
    pub(crate) skipped_row_count: i64,
    pub(crate) total_input_data_weight: i64,
    pub(crate) total_input_row_count: i64,
    pub(crate) sink_row_count: i64,
    pub(crate) start_time: SystemTime,
    pub(crate) result_error: Option<String>,
    pub(crate) jobs_to_abort: Vec<JobId>,
    pub(crate) snapshot_requested: bool,
    pub(crate) input_pool: Option<PoolId>,
    pub(crate) shuffle_pool: Option<PoolId>,
    pub(crate) partition_task: Option<TaskIdx>,
    pub(crate) sort_tasks_activated: bool,
    pub(crate) merge_tasks_activated: bool,
    pub(crate) partitions_assigned: bool,
}

impl OperationController {
    pub fn new(context: OperationContext) -> ArmadaResult<Self> {
        context.spec.validate()?;
        context
            .config
            .validate()
            .map_err(|e| ArmadaError::InvalidOperationSpec(format!("invalid controller config: {e}")))?;
        Ok(Self {
            context,
            state: OperationState::Preparing,
            pools: PoolArena::default(),
            tasks: Vec::new(),
            groups: Vec::new(),
            partitions: Vec::new(),
            joblets: JobletMap::default(),
            lost_cookies: LostCookieMap::default(),
            progress: OperationProgress::default(),
            input_chunks: HashMap::new(),
            unavailable_chunks: HashSet::new(),
            waiting_slots: HashMap::new(),
            intermediate_chunks: HashMap::new(),
            job_destinations: HashMap::new(),
            adjusters: HashMap::new(),
            known_nodes: HashMap::new(),
            failed_job_count: 0,
            skipped_row_count: 0,
            total_input_data_weight: 0,
            total_input_row_count: 0,
            sink_row_count: 0,
            start_time: SystemTime::now(),
            result_error: None,
            jobs_to_abort: Vec::new(),
            snapshot_requested: false,
            input_pool: None,
            shuffle_pool: None,
            partition_task: None,
            sort_tasks_activated: false,
            merge_tasks_activated: false,
            partitions_assigned: false,
        })
    }

    pub fn operation_id(&self) -> crate::scheduling::context::OperationId {
        self.context.operation_id
    }

    pub fn state(&self) -> OperationState {
        self.state
    }

    pub fn progress(&self) -> &OperationProgress {
        &self.progress
    }

    pub fn result_error(&self) -> Option<&str> {
        self.result_error.as_deref()
    }

    pub fn context(&self) -> &OperationContext {
        &self.context
    }

    /// Builds pools, tasks and groups from the fetched input. Runs in the
    /// `Preparing` state and moves the operation to `Materializing`.
    pub fn prepare(&mut self, input: &OperationInput) -> ArmadaResult<()> {
        internal_ensure!(
            self.state == OperationState::Preparing,
            "prepare called in state {}",
            self.state
        );
        self.total_input_data_weight = input.total_data_weight();
        self.total_input_row_count = input.total_row_count();
        self.progress.total_data_weight = self.total_input_data_weight;
        self.progress.total_row_count = self.total_input_row_count;

        match &self.context.spec.kind {
            OperationKind::Map | OperationKind::Merge { .. } => self.build_flat_pipeline(input)?,
            OperationKind::Sort(_) | OperationKind::MapReduce(_) => {
                self.build_sort_pipeline(input)?;
            }
        }

        let estimated_jobs: usize = self
            .tasks
            .iter()
            .map(|t| {
                self.pools
                    .output_ref(t.pool)
                    .map(|p| p.total_job_count())
                    .unwrap_or(0)
            })
            .sum();
        let output_tables = self.context.spec.output_tables.len();
        if estimated_jobs.saturating_mul(output_tables)
            > self.context.config.max_output_tables_times_jobs
        {
            return Err(ArmadaError::InvalidOperationSpec(format!(
                "too many output tables times jobs: {estimated_jobs} jobs x {output_tables} tables"
            )));
        }

        tracing::info!(
            operation_id = %self.context.operation_id,
            kind = self.context.spec.kind.name(),
            data_weight = self.total_input_data_weight,
            row_count = self.total_input_row_count,
            tasks = self.tasks.len(),
            partitions = self.partitions.len(),
            "operation prepared"
        );
        self.state = OperationState::Materializing;
        Ok(())
    }

    /// Seals external input pools and moves the operation to `Running`; an
    /// empty input completes the operation without ever scheduling a job.
    pub fn materialize(&mut self) -> ArmadaResult<()> {
        internal_ensure!(
            self.state == OperationState::Materializing,
            "materialize called in state {}",
            self.state
        );
        if let Some(pool) = self.input_pool {
            self.pools.input(pool)?.finish();
            for task in &mut self.tasks {
                if task.pool.pool == pool {
                    task.input_finished = true;
                }
            }
        }
        if self.context.config.enable_snapshot_cycle_after_materialization {
            self.snapshot_requested = true;
        }
        self.state = OperationState::Running;
        tracing::info!(operation_id = %self.context.operation_id, "operation materialized");
        self.process_transitions()?;
        Ok(())
    }

    fn build_flat_pipeline(&mut self, input: &OperationInput) -> ArmadaResult<()> {
        let config = Arc::clone(&self.context.config);
        let spec = Arc::clone(&self.context.spec);
        let constraints = match spec.job_count {
            Some(count) => JobSizeConstraints::explicit(
                count,
                self.total_input_data_weight,
                self.total_input_row_count,
                &config,
            )?,
            None => JobSizeConstraints::for_merge(
                self.total_input_data_weight,
                self.total_input_row_count,
                spec.data_weight_per_job,
                &config,
            ),
        };

        // An explicit job count pins the grouping up front; the greedy
        // unordered pool cannot honor an exact count, so those operations
        // build their jobs through the ordered pool instead.
        let grouped_entry = || match spec.job_count {
            Some(_) => PoolEntry::Ordered(OrderedChunkPool::new(
                constraints.data_weight_per_job,
                config.max_slices_per_job,
                spec.job_count,
            )),
            None => PoolEntry::Unordered(UnorderedChunkPool::new(
                constraints.data_weight_per_job,
                config.max_slices_per_job,
            )),
        };
        let (entry, kind) = match &spec.kind {
            OperationKind::Map => (grouped_entry(), TaskKind::Map),
            OperationKind::Merge {
                mode: MergeMode::Unordered,
            } => (grouped_entry(), TaskKind::UnorderedMerge { partition: None }),
            OperationKind::Merge {
                mode: MergeMode::Ordered,
            } => (
                PoolEntry::Ordered(OrderedChunkPool::new(
                    constraints.data_weight_per_job,
                    config.max_slices_per_job,
                    spec.job_count,
                )),
                TaskKind::OrderedMerge,
            ),
            OperationKind::Merge {
                mode: MergeMode::Sorted,
            } => (
                PoolEntry::Sorted(SortedChunkPool::new(
                    constraints.data_weight_per_job,
                    config.max_slices_per_job,
                )),
                TaskKind::SortedMerge { partition: None },
            ),
            other => {
                return Err(internal_err!(
                    "flat pipeline requested for {} operation",
                    other.name()
                ))
            }
        };
        let pool = self.pools.insert(entry);
        self.input_pool = Some(pool);
        self.add_input_stripes(pool, input)?;

        let group = self.groups.len();
        self.groups.push(TaskGroup::new("primary"));
        let edges = (0..spec.output_tables.len())
            .map(EdgeDescriptor::to_sink)
            .collect();
        let task_idx = self.tasks.len();
        self.tasks
            .push(Task::new(task_idx, kind, group, PoolOutputRef::plain(pool)).with_edges(edges));
        if spec.job_count.is_none()
            && matches!(kind, TaskKind::Map | TaskKind::UnorderedMerge { .. })
        {
            self.install_adjuster(task_idx, constraints.data_weight_per_job);
        }
        Ok(())
    }

    pub(crate) fn add_input_stripes(
        &mut self,
        pool: PoolId,
        input: &OperationInput,
    ) -> ArmadaResult<()> {
        for table in &input.tables {
            for stripe in &table.stripes {
                let cookie = self.pools.input(pool)?.add(stripe.clone())?;
                for chunk in stripe.chunk_ids() {
                    self.input_chunks.entry(chunk).or_default().push((pool, cookie));
                }
            }
        }
        Ok(())
    }

    pub(crate) fn install_adjuster(&mut self, task: TaskIdx, data_weight_per_job: i64) {
        if let Some(adjuster_config) = &self.context.config.job_size_adjuster {
            self.adjusters.insert(
                task,
                JobSizeAdjuster::new(data_weight_per_job, adjuster_config.clone()),
            );
        }
    }

    /// Never fails: any internal error is converted into operation failure
    /// and an empty result, so a scheduler heartbeat cannot crash the host.
    pub fn schedule_job(&mut self, ctx: &ScheduleJobContext) -> ScheduleJobResult {
        if !self.state.is_schedulable() {
            return ScheduleJobResult::empty();
        }
        self.known_nodes.insert(ctx.node.id, ctx.node.clone());
        match self.do_schedule_job(ctx) {
            Ok(result) => result,
            Err(error) => {
                tracing::error!(
                    operation_id = %self.context.operation_id,
                    node = ctx.node.id,
                    %error,
                    "job scheduling failed"
                );
                if error.is_internal() {
                    self.fail_operation(error);
                }
                ScheduleJobResult::empty()
            }
        }
    }

    fn do_schedule_job(&mut self, ctx: &ScheduleJobContext) -> ArmadaResult<ScheduleJobResult> {
        let now = Instant::now();
        for group_idx in 0..self.groups.len() {
            if !ctx
                .available_resources
                .dominates(&self.groups[group_idx].min_needed_resources)
            {
                continue;
            }
            let local: Vec<TaskIdx> = self.groups[group_idx].local_tasks_for(ctx.node.id).collect();
            for task_idx in local {
                if let Some(job) = self.try_schedule_task(task_idx, ctx, true)? {
                    return Ok(ScheduleJobResult::with_job(job));
                }
            }
            let candidates: Vec<TaskIdx> =
                self.groups[group_idx].candidate_tasks.iter().copied().collect();
            for task_idx in candidates {
                if self.should_delay_for_locality(task_idx, ctx.node.id, now) {
                    continue;
                }
                if let Some(job) = self.try_schedule_task(task_idx, ctx, false)? {
                    return Ok(ScheduleJobResult::with_job(job));
                }
            }
        }
        Ok(ScheduleJobResult::empty())
    }

    /// A task whose pending data prefers some other node holds out for a
    /// local slot until the locality timeout expires.
    fn should_delay_for_locality(&mut self, task_idx: TaskIdx, node: NodeId, now: Instant) -> bool {
        let prefers_elsewhere = {
            let task = &self.tasks[task_idx];
            let preferred = task
                .kind
                .partition()
                .and_then(|p| self.partitions.get(p))
                .and_then(|p| p.assigned_node);
            match preferred {
                Some(preferred) => preferred != node,
                None => self
                    .pools
                    .output_ref(task.pool)
                    .map(|pool| {
                        let locality = pool.locality();
                        !locality.is_empty() && !locality.contains_key(&node)
                    })
                    .unwrap_or(false),
            }
        };
        if !prefers_elsewhere {
            return false;
        }
        let task = &mut self.tasks[task_idx];
        match task.delayed_until {
            None => {
                task.delayed_until = Some(now + self.context.config.locality_timeout);
                true
            }
            Some(deadline) => now < deadline,
        }
    }

    fn try_schedule_task(
        &mut self,
        task_idx: TaskIdx,
        ctx: &ScheduleJobContext,
        local: bool,
    ) -> ArmadaResult<Option<ScheduledJob>> {
        {
            let task = &self.tasks[task_idx];
            if !task.ready || task.completed || task.cached.pending_job_count == 0 {
                return Ok(None);
            }
        }
        self.ensure_sorted_merge_decided(task_idx)?;

        let pool_ref = self.tasks[task_idx].pool;
        let node_hint = local.then_some(ctx.node.id);
        let Some(cookie) = self.pools.output(pool_ref)?.extract(node_hint)? else {
            return Ok(None);
        };
        let stripe_list = self.pools.output(pool_ref)?.stripe_list(cookie)?.clone();

        let task = &self.tasks[task_idx];
        let demand = task.needed_resources(&self.context.config, stripe_list.total_data_weight);
        if !ctx.available_resources.dominates(&demand) {
            self.pools.output(pool_ref)?.aborted(cookie)?;
            return Ok(None);
        }

        let job_id = JobId::new();
        let job_type = task.job_type();
        let outputs: Vec<JobOutputTarget> = task
            .edges
            .iter()
            .map(|e| match e.destination {
                EdgeDestination::Sink { output_table } => JobOutputTarget::Sink { output_table },
                EdgeDestination::Pool { pool } => JobOutputTarget::Pool { pool },
            })
            .collect();
        let joblet = Joblet {
            job_id,
            job_type,
            task: task_idx,
            output_cookie: cookie,
            input_data_weight: stripe_list.total_data_weight,
            input_row_count: stripe_list.total_row_count,
            edges: task.edges.clone(),
            node: ctx.node.id,
            node_address: ctx.node.address.clone(),
            start_time: SystemTime::now(),
            resource_demand: demand.clone(),
            partition: task.kind.partition(),
        };
        let spec = JobSpec {
            operation_id: self.context.operation_id,
            job_id,
            job_type,
            input: stripe_list,
            outputs,
        };
        self.joblets.register(joblet)?;

        let task = &mut self.tasks[task_idx];
        task.running_job_count += 1;
        task.delayed_until = None;
        if let Some(p) = task.kind.partition() {
            if let Some(partition) = self.partitions.get_mut(p) {
                partition.has_scheduled_jobs = true;
                if partition.assigned_node.is_none() {
                    partition.assigned_node = Some(ctx.node.id);
                }
            }
        }
        self.progress.jobs.started();
        self.progress.counter_mut(job_type).started();
        self.update_task(task_idx)?;
        tracing::debug!(
            operation_id = %self.context.operation_id,
            job_id = %job_id,
            task = self.tasks[task_idx].kind.name(),
            node = ctx.node.id,
            "job scheduled"
        );
        Ok(Some(ScheduledJob {
            job_id,
            task: task_idx,
            spec,
            resource_demand: demand,
        }))
    }

    pub fn on_job_completed(&mut self, summary: CompletedJobSummary) -> ArmadaResult<()> {
        let Some(joblet) = self.joblets.take(summary.job_id) else {
            tracing::debug!(job_id = %summary.job_id, "completion for unknown job, ignored");
            return Ok(());
        };
        if self.state.is_terminal() {
            return Ok(());
        }
        let task_idx = joblet.task;
        self.tasks[task_idx].running_job_count -= 1;
        self.tasks[task_idx].completed_job_count += 1;
        self.pools
            .output(self.tasks[task_idx].pool)?
            .completed(joblet.output_cookie)?;
        self.progress.jobs.completed();
        self.progress.counter_mut(joblet.job_type).completed();
        self.progress.processed_data_weight += joblet.input_data_weight;

        if let Some(adjuster) = self.adjusters.get_mut(&task_idx) {
            if adjuster.on_job_completed(
                summary.statistics.prepare_duration,
                summary.statistics.exec_duration,
            ) {
                let value = adjuster.data_weight_per_job();
                if let Some(pool) = self.pools.unordered_mut(self.tasks[task_idx].pool) {
                    pool.update_data_weight_per_job(value);
                }
                tracing::debug!(
                    operation_id = %self.context.operation_id,
                    task = self.tasks[task_idx].kind.name(),
                    data_weight_per_job = value,
                    "job size adjusted"
                );
            }
        }

        internal_ensure!(
            summary.output_stripes.len() == joblet.edges.len(),
            "job {} reported {} output stripes for {} edges",
            summary.job_id,
            summary.output_stripes.len(),
            joblet.edges.len()
        );
        let mut regenerated = self.lost_cookies.take(task_idx, joblet.output_cookie);
        for (edge, stripe) in joblet.edges.iter().zip(summary.output_stripes.iter()) {
            match edge.destination {
                EdgeDestination::Sink { .. } => {
                    self.sink_row_count += stripe.row_count();
                    if let Some(p) = joblet.partition {
                        if let Some(partition) = self.partitions.get_mut(p) {
                            partition.output_row_count += stripe.row_count();
                        }
                    }
                    // Sink output stays uncommitted until the whole operation
                    // commits; losing it before then is as fatal as losing
                    // intermediate data from a producer that cannot re-run.
                    for chunk in stripe.chunk_ids() {
                        self.intermediate_chunks
                            .insert(chunk, (task_idx, joblet.output_cookie));
                    }
                }
                EdgeDestination::Pool { pool } => {
                    if joblet.job_type == crate::scheduling::context::JobType::Partition
                        && regenerated.is_none()
                    {
                        self.account_partition_output(stripe)?;
                    }
                    let slot = regenerated
                        .as_mut()
                        .and_then(|slots| {
                            slots
                                .iter()
                                .position(|(p, _)| *p == pool)
                                .map(|i| slots.remove(i))
                        });
                    let dest_cookie = match slot {
                        Some((p, c)) => {
                            self.pools.input(p)?.reset(c, stripe.clone())?;
                            self.pools.input(p)?.resume(c)?;
                            c
                        }
                        None => self.pools.input(pool)?.add(stripe.clone())?,
                    };
                    for chunk in stripe.chunk_ids() {
                        self.intermediate_chunks
                            .insert(chunk, (task_idx, joblet.output_cookie));
                    }
                    self.job_destinations
                        .entry((task_idx, joblet.output_cookie))
                        .or_default()
                        .push((pool, dest_cookie));
                }
            }
        }

        self.update_task(task_idx)?;
        self.process_transitions()
    }

    pub fn on_job_failed(&mut self, summary: FailedJobSummary) -> ArmadaResult<()> {
        let Some(joblet) = self.joblets.take(summary.job_id) else {
            tracing::debug!(job_id = %summary.job_id, "failure for unknown job, ignored");
            return Ok(());
        };
        if self.state.is_terminal() {
            return Ok(());
        }
        let task_idx = joblet.task;
        self.tasks[task_idx].running_job_count -= 1;
        self.pools
            .output(self.tasks[task_idx].pool)?
            .failed(joblet.output_cookie)?;
        self.progress.jobs.failed();
        self.progress.counter_mut(joblet.job_type).failed();
        self.failed_job_count += 1;
        tracing::warn!(
            operation_id = %self.context.operation_id,
            job_id = %summary.job_id,
            error = %summary.error,
            fatal = summary.fatal,
            "job failed"
        );

        let limit = self
            .context
            .spec
            .max_failed_job_count
            .unwrap_or(self.context.config.max_failed_job_count);
        if summary.fatal {
            self.fail_operation(
                ArmadaError::operation_failed("job failed with a fatal error")
                    .with_attribute("job_id", summary.job_id.to_string())
                    .with_attribute("error", summary.error),
            );
            return Ok(());
        }
        if self.failed_job_count >= limit {
            self.fail_operation(
                ArmadaError::operation_failed("failed job count limit exceeded")
                    .with_attribute("limit", limit.to_string())
                    .with_attribute("last_error", summary.error),
            );
            return Ok(());
        }
        self.update_task(task_idx)?;
        self.process_transitions()
    }

    pub fn on_job_aborted(&mut self, summary: AbortedJobSummary) -> ArmadaResult<()> {
        let Some(joblet) = self.joblets.take(summary.job_id) else {
            return Ok(());
        };
        if self.state.is_terminal() {
            return Ok(());
        }
        let task_idx = joblet.task;
        self.tasks[task_idx].running_job_count -= 1;
        self.pools
            .output(self.tasks[task_idx].pool)?
            .aborted(joblet.output_cookie)?;
        self.progress.jobs.aborted();
        self.progress.counter_mut(joblet.job_type).aborted();
        tracing::debug!(
            operation_id = %self.context.operation_id,
            job_id = %summary.job_id,
            reason = %summary.reason,
            "job aborted"
        );
        self.update_task(task_idx)?;
        self.process_transitions()
    }

    pub fn on_input_chunk_unavailable(&mut self, chunk_id: ChunkId) -> ArmadaResult<()> {
        if self.state.is_terminal() {
            return Ok(());
        }
        let Some(slots) = self.input_chunks.get(&chunk_id).cloned() else {
            return Ok(());
        };
        if !self.unavailable_chunks.insert(chunk_id) {
            return Ok(());
        }
        self.progress.unavailable_input_chunk_count += 1;
        tracing::warn!(
            operation_id = %self.context.operation_id,
            chunk_id = %chunk_id,
            strategy = ?self.context.spec.unavailable_chunk_strategy,
            "input chunk unavailable"
        );
        match self.context.spec.unavailable_chunk_strategy {
            UnavailableChunkStrategy::Fail => {
                self.fail_operation(
                    ArmadaError::operation_failed("input chunk became unavailable")
                        .with_attribute("chunk_id", chunk_id.to_string()),
                );
                return Ok(());
            }
            UnavailableChunkStrategy::Wait => {
                for &(pool, cookie) in &slots {
                    self.pools.input(pool)?.suspend(cookie)?;
                }
                self.waiting_slots.insert(chunk_id, slots);
            }
            UnavailableChunkStrategy::Skip => {
                let mut waiting = Vec::new();
                for &(pool, cookie) in &slots {
                    let patched = {
                        let stripe = self.pools.input(pool)?.stripe(cookie)?;
                        stripe.without_chunk(chunk_id)
                    };
                    let removed_rows = {
                        let stripe = self.pools.input(pool)?.stripe(cookie)?;
                        stripe.row_count() - patched.row_count()
                    };
                    // A stripe bound to a running job cannot be patched; hold
                    // it back instead until the chunk returns.
                    match self.pools.input(pool)?.reset(cookie, patched) {
                        Ok(()) => self.skipped_row_count += removed_rows,
                        Err(_) => {
                            self.pools.input(pool)?.suspend(cookie)?;
                            waiting.push((pool, cookie));
                        }
                    }
                }
                if !waiting.is_empty() {
                    self.waiting_slots.insert(chunk_id, waiting);
                }
            }
        }
        self.process_transitions()
    }

    pub fn on_input_chunk_available(&mut self, chunk_id: ChunkId) -> ArmadaResult<()> {
        if self.state.is_terminal() {
            return Ok(());
        }
        if !self.unavailable_chunks.remove(&chunk_id) {
            return Ok(());
        }
        self.progress.unavailable_input_chunk_count = self
            .progress
            .unavailable_input_chunk_count
            .saturating_sub(1);
        if let Some(slots) = self.waiting_slots.remove(&chunk_id) {
            for (pool, cookie) in slots {
                self.pools.input(pool)?.resume(cookie)?;
            }
        }
        tracing::info!(
            operation_id = %self.context.operation_id,
            chunk_id = %chunk_id,
            "input chunk available again"
        );
        self.process_transitions()
    }

    /// A registered intermediate chunk disappeared. If the producing task
    /// can lose jobs, the affected destination slots are suspended and the
    /// source job re-enters its pool pending under the same cookie; the
    /// regenerated output later resumes the slots. Otherwise the operation
    /// fails.
    pub fn on_intermediate_chunk_lost(&mut self, chunk_id: ChunkId) -> ArmadaResult<()> {
        if self.state.is_terminal() {
            return Ok(());
        }
        let Some(&(task_idx, output_cookie)) = self.intermediate_chunks.get(&chunk_id) else {
            return Ok(());
        };
        if !self.tasks[task_idx].can_lose_jobs() {
            self.fail_operation(
                ArmadaError::operation_failed(
                    "intermediate chunk lost and its producer cannot be re-run",
                )
                .with_attribute("chunk_id", chunk_id.to_string()),
            );
            return Ok(());
        }
        let Some(destinations) = self.job_destinations.remove(&(task_idx, output_cookie)) else {
            // Another chunk of the same job already triggered regeneration.
            return Ok(());
        };
        tracing::warn!(
            operation_id = %self.context.operation_id,
            chunk_id = %chunk_id,
            task = self.tasks[task_idx].kind.name(),
            "intermediate chunk lost, re-running source job"
        );

        // Running jobs already reading the lost job's output hold stale
        // stripes; they must die before their input slot is reset under them.
        let lost_chunks: HashSet<ChunkId> = self
            .intermediate_chunks
            .iter()
            .filter(|(_, &(t, c))| t == task_idx && c == output_cookie)
            .map(|(chunk, _)| *chunk)
            .collect();
        let mut downstream: Vec<JobId> = Vec::new();
        for joblet in self.joblets.iter() {
            if joblet.task == task_idx {
                continue;
            }
            let reads_lost = self
                .pools
                .output_ref(self.tasks[joblet.task].pool)?
                .stripe_list(joblet.output_cookie)?
                .stripes
                .iter()
                .flat_map(|s| s.chunk_ids())
                .any(|c| lost_chunks.contains(&c));
            if reads_lost {
                downstream.push(joblet.job_id);
            }
        }
        for job_id in downstream {
            let Some(joblet) = self.joblets.take(job_id) else {
                continue;
            };
            self.tasks[joblet.task].running_job_count -= 1;
            self.pools
                .output(self.tasks[joblet.task].pool)?
                .aborted(joblet.output_cookie)?;
            self.progress.jobs.aborted();
            self.progress.counter_mut(joblet.job_type).aborted();
            self.jobs_to_abort.push(job_id);
            tracing::debug!(
                operation_id = %self.context.operation_id,
                job_id = %job_id,
                task = self.tasks[joblet.task].kind.name(),
                "aborting downstream job whose input vanished"
            );
        }

        for &(pool, cookie) in &destinations {
            self.pools.input(pool)?.suspend(cookie)?;
        }
        self.pools
            .output(self.tasks[task_idx].pool)?
            .lost(output_cookie)?;
        self.tasks[task_idx].completed_job_count -= 1;
        let job_type = self.tasks[task_idx].job_type();
        self.progress.jobs.lost();
        self.progress.counter_mut(job_type).lost();
        self.intermediate_chunks
            .retain(|_, &mut (t, c)| !(t == task_idx && c == output_cookie));
        self.lost_cookies.mark_lost(task_idx, output_cookie, destinations);
        self.update_task(task_idx)?;
        self.process_transitions()
    }

    /// Recomputes a task's cached counts and its scheduling group
    /// membership. Returns whether anything observable changed.
    pub(crate) fn update_task(&mut self, task_idx: TaskIdx) -> ArmadaResult<bool> {
        let pool_ref = self.tasks[task_idx].pool;
        let (pending, total, pool_completed, locality_nodes) = {
            let pool = self.pools.output_ref(pool_ref)?;
            let nodes: Vec<NodeId> = pool.locality().keys().copied().collect();
            (
                pool.pending_job_count(),
                pool.total_job_count(),
                pool.is_completed(),
                nodes,
            )
        };
        let task = &mut self.tasks[task_idx];
        let old_cached = task.cached;
        let was_completed = task.completed;
        task.cached.pending_job_count = pending;
        task.cached.total_job_count = total;
        task.completed = task.input_finished && pool_completed && task.running_job_count == 0;

        let group = task.group;
        let schedulable = task.ready && !task.completed && pending > 0;
        let preferred_node = task
            .kind
            .partition()
            .and_then(|p| self.partitions.get(p))
            .and_then(|p| p.assigned_node);
        if schedulable {
            self.groups[group].add_candidate(task_idx);
            let mut nodes = locality_nodes;
            if let Some(node) = preferred_node {
                if !nodes.contains(&node) {
                    nodes.push(node);
                }
            }
            self.groups[group].set_locality(task_idx, nodes);
        } else {
            self.groups[group].remove_task(task_idx);
        }
        Ok(old_cached != self.tasks[task_idx].cached || was_completed != self.tasks[task_idx].completed)
    }

    /// Drives all cascading transitions to a fixpoint after any event.
    pub(crate) fn process_transitions(&mut self) -> ArmadaResult<()> {
        if self.state != OperationState::Running {
            return Ok(());
        }
        loop {
            let mut changed = false;
            changed |= self.run_sort_transitions()?;
            for task_idx in 0..self.tasks.len() {
                changed |= self.update_task(task_idx)?;
            }
            if !changed {
                break;
            }
        }
        self.progress.jobs.pending = self
            .tasks
            .iter()
            .filter(|t| t.ready && !t.completed)
            .map(|t| t.cached.pending_job_count)
            .sum();
        self.refresh_group_demands()?;
        self.check_completion()
    }

    fn refresh_group_demands(&mut self) -> ArmadaResult<()> {
        for group_idx in 0..self.groups.len() {
            let members: Vec<TaskIdx> = self.groups[group_idx]
                .candidate_tasks
                .iter()
                .copied()
                .collect();
            let mut min: Option<ResourceRequest> = None;
            for task_idx in members {
                let pool = self.pools.output_ref(self.tasks[task_idx].pool)?;
                let pending = pool.pending_job_count();
                if pending == 0 {
                    continue;
                }
                let avg = (pool.pending_data_weight() / pending as i64).max(1);
                let demand = self.tasks[task_idx].needed_resources(&self.context.config, avg);
                min = Some(match min {
                    None => demand,
                    Some(current) if demand.memory_bytes < current.memory_bytes => demand,
                    Some(current) => current,
                });
            }
            self.groups[group_idx].min_needed_resources = min.unwrap_or_else(ResourceRequest::zero);
        }
        Ok(())
    }

    fn check_completion(&mut self) -> ArmadaResult<()> {
        if self.state != OperationState::Running {
            return Ok(());
        }
        if !self.joblets.is_empty() || self.tasks.iter().any(|t| !t.completed) {
            return Ok(());
        }
        if self.rows_must_be_conserved() {
            let expected = self.total_input_row_count - self.skipped_row_count;
            internal_ensure!(
                self.sink_row_count == expected,
                "row count mismatch at completion: {} rows in, {} rows out",
                expected,
                self.sink_row_count
            );
        }
        self.state = OperationState::Completing;
        tracing::info!(
            operation_id = %self.context.operation_id,
            rows = self.sink_row_count,
            "all tasks completed, operation ready to commit"
        );
        Ok(())
    }

    pub(crate) fn rows_must_be_conserved(&self) -> bool {
        // Merge and sort reshape data without changing it; map jobs and
        // map-reduce reducers run user code with arbitrary output volume.
        matches!(
            self.context.spec.kind,
            OperationKind::Merge { .. } | OperationKind::Sort(_)
        )
    }

    /// Finalizes a fully completed operation. Idempotent.
    pub fn commit(&mut self) -> ArmadaResult<()> {
        match self.state {
            OperationState::Completing => {
                self.state = OperationState::Completed;
                tracing::info!(operation_id = %self.context.operation_id, "operation committed");
                Ok(())
            }
            OperationState::Completed => Ok(()),
            other => Err(internal_err!("commit called in state {}", other)),
        }
    }

    pub fn fail_operation(&mut self, error: ArmadaError) {
        if self.state.is_terminal() {
            return;
        }
        tracing::error!(
            operation_id = %self.context.operation_id,
            %error,
            "operation failed"
        );
        self.result_error = Some(error.to_string());
        self.state = OperationState::Failed;
        self.collect_jobs_to_abort();
    }

    /// External cancellation. Idempotent.
    pub fn abort(&mut self, reason: &str) {
        if self.state.is_terminal() {
            return;
        }
        tracing::info!(
            operation_id = %self.context.operation_id,
            reason,
            "operation aborted"
        );
        self.result_error = Some(reason.to_string());
        self.state = OperationState::Aborted;
        self.collect_jobs_to_abort();
    }

    fn collect_jobs_to_abort(&mut self) {
        let drained = self.joblets.drain();
        self.jobs_to_abort.extend(drained.iter().map(|j| j.job_id));
    }

    /// Jobs the host must tell the scheduler to kill, accumulated by
    /// failure, abort and revival. Drains the list.
    pub fn take_jobs_to_abort(&mut self) -> Vec<JobId> {
        std::mem::take(&mut self.jobs_to_abort)
    }

    pub fn take_snapshot_request(&mut self) -> bool {
        std::mem::take(&mut self.snapshot_requested)
    }

    /// Reconciles a controller restored from a snapshot with the
    /// scheduler's view of live jobs. Jobs the scheduler still runs but the
    /// snapshot does not know are returned for external abort; jobs the
    /// snapshot tracked that no longer run are internally aborted so their
    /// input returns to pending.
    pub fn revive(&mut self, live_jobs: &[JobId]) -> ArmadaResult<Vec<JobId>> {
        if self.state.is_terminal() {
            return Ok(live_jobs.to_vec());
        }
        let live: HashSet<JobId> = live_jobs.iter().copied().collect();
        let known: HashSet<JobId> = self.joblets.job_ids().into_iter().collect();

        let unknown_live: Vec<JobId> = live.difference(&known).copied().collect();
        let dead_known: Vec<JobId> = known.difference(&live).copied().collect();
        tracing::info!(
            operation_id = %self.context.operation_id,
            live = live.len(),
            unknown_live = unknown_live.len(),
            dead_known = dead_known.len(),
            "reviving operation"
        );
        for job_id in dead_known {
            let Some(joblet) = self.joblets.take(job_id) else {
                continue;
            };
            self.tasks[joblet.task].running_job_count -= 1;
            self.pools
                .output(self.tasks[joblet.task].pool)?
                .aborted(joblet.output_cookie)?;
            self.progress.jobs.aborted();
            self.progress.counter_mut(joblet.job_type).aborted();
        }
        for task in &mut self.tasks {
            task.delayed_until = None;
        }
        self.process_transitions()?;
        Ok(unknown_live)
    }

    /// Aggregate resources the operation could use right now: one demand per
    /// pending job plus everything already running.
    pub fn get_needed_resources(&self) -> ArmadaResult<ResourceRequest> {
        let mut total = ResourceRequest::zero();
        for task in &self.tasks {
            if task.completed || !task.ready {
                continue;
            }
            let pool = self.pools.output_ref(task.pool)?;
            let pending = pool.pending_job_count();
            if pending == 0 {
                continue;
            }
            let avg = (pool.pending_data_weight() / pending as i64).max(1);
            total += task
                .needed_resources(&self.context.config, avg)
                .multiply(pending);
        }
        for joblet in self.joblets.iter() {
            total += joblet.resource_demand.clone();
        }
        Ok(total)
    }

    pub fn check_time_limit(&mut self, now: SystemTime) {
        if self.state.is_terminal() {
            return;
        }
        let Some(limit) = self.context.spec.time_limit else {
            return;
        };
        let elapsed = now.duration_since(self.start_time).unwrap_or_default();
        if elapsed > limit {
            self.fail_operation(
                ArmadaError::operation_failed("operation time limit exceeded")
                    .with_attribute("limit_secs", limit.as_secs().to_string()),
            );
        }
    }

    /// Replaces the configuration for future decisions; never touches
    /// existing pools or tasks.
    pub fn update_config(&mut self, config: Arc<crate::config::ControllerConfig>) {
        self.context.config = config;
    }

    pub fn partition_histogram(&self) -> Option<PartitionHistogram> {
        if self.partitions.is_empty() {
            return None;
        }
        Some(PartitionHistogram::build(
            self.partitions.iter().map(|p| p.total_data_weight),
        ))
    }

    pub fn log_progress(&self) {
        tracing::info!(
            operation_id = %self.context.operation_id,
            state = %self.state,
            progress = %self.progress,
            "operation progress"
        );
        if let Some(histogram) = self.partition_histogram() {
            let tolerance = self.context.config.partitioned_data_balancing_tolerance;
            if histogram.is_skewed(tolerance) {
                tracing::warn!(
                    operation_id = %self.context.operation_id,
                    max_partition_data_weight = histogram.max,
                    "partition sizes are heavily skewed"
                );
            }
        }
    }

    pub(crate) fn account_partition_output(&mut self, stripe: &ChunkStripe) -> ArmadaResult<()> {
        for slice in &stripe.slices {
            let Some(tag) = slice.partition_tag else {
                continue;
            };
            internal_ensure!(
                tag < self.partitions.len(),
                "partition job emitted tag {} with {} partitions",
                tag,
                self.partitions.len()
            );
            let partition = &mut self.partitions[tag];
            partition.total_data_weight += slice.data_weight;
            partition.input_row_count += slice.row_count;
        }
        Ok(())
    }
}
