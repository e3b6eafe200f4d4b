//! Sort and map-reduce specific parts of the operation controller: pipeline
//! construction, shuffle/merge threshold gating, the sorted-merge decision
//! and partition completion.

use std::sync::Arc;

use common_error::{internal_ensure, internal_err, ArmadaResult};

use crate::{
    chunk_pool::{
        Key, KeySample, PoolEntry, PoolOutputRef, ShuffleChunkPool, SortedChunkPool,
        UnorderedChunkPool,
    },
    job_size::JobSizeConstraints,
    operation::{
        controller::{OperationController, OperationInput},
        partition::{
            assign_partitions, select_partition_seeds, suggest_partition_count, thin_samples,
            Partition,
        },
    },
    scheduling::{
        context::NodeDescriptor,
        task::{EdgeDescriptor, Task, TaskIdx, TaskKind},
        task_group::TaskGroup,
    },
};

impl OperationController {
    pub(crate) fn build_sort_pipeline(&mut self, input: &OperationInput) -> ArmadaResult<()> {
        let config = Arc::clone(&self.context.config);
        let options = self
            .context
            .spec
            .kind
            .sort_options()
            .cloned()
            .ok_or_else(|| internal_err!("sort pipeline requested without sort options"))?;
        let samples: Vec<KeySample> = input
            .tables
            .iter()
            .flat_map(|t| t.samples.iter().cloned())
            .collect();
        let partition_count =
            suggest_partition_count(self.total_input_data_weight, &options, &config);
        // Boundary selection cost grows with the sample set, not its value;
        // a bounded number of samples per partition is plenty.
        let max_samples = partition_count.saturating_mul(
            options
                .samples_per_partition
                .unwrap_or(config.samples_per_partition),
        );
        let samples = thin_samples(samples, max_samples);
        let sort_constraints = JobSizeConstraints::for_sort(
            self.total_input_data_weight,
            self.total_input_row_count,
            &config,
        );

        if partition_count <= 1 || samples.is_empty() {
            self.build_simple_sort(input, &sort_constraints)?;
        } else {
            self.build_partitioned_sort(input, &sort_constraints, partition_count, &samples)?;
        }
        self.progress.partition_count = self.partitions.len();
        Ok(())
    }

    /// One partition, no shuffle: everything sorts in place, with a sorted
    /// merge appended only when more than one sort job is needed.
    fn build_simple_sort(
        &mut self,
        input: &OperationInput,
        constraints: &JobSizeConstraints,
    ) -> ArmadaResult<()> {
        let config = Arc::clone(&self.context.config);
        let pool = self.pools.insert(PoolEntry::Unordered(UnorderedChunkPool::new(
            constraints.data_weight_per_job,
            config.max_slices_per_job,
        )));
        self.input_pool = Some(pool);
        self.add_input_stripes(pool, input)?;
        let merge_pool = self.pools.insert(PoolEntry::Sorted(SortedChunkPool::new(
            constraints.data_weight_per_job,
            config.max_slices_per_job,
        )));

        let sort_group = self.groups.len();
        self.groups.push(TaskGroup::new("sort"));
        let merge_group = self.groups.len();
        self.groups.push(TaskGroup::new("sorted_merge"));

        let sort_task = self.tasks.len();
        self.tasks.push(
            Task::new(
                sort_task,
                TaskKind::SimpleSort,
                sort_group,
                PoolOutputRef::plain(pool),
            )
            .with_edges(vec![EdgeDescriptor::to_sink(0)]),
        );
        let merge_task = self.tasks.len();
        self.tasks.push(
            Task::new(
                merge_task,
                TaskKind::SortedMerge { partition: Some(0) },
                merge_group,
                PoolOutputRef::plain(merge_pool),
            )
            .with_edges(vec![EdgeDescriptor::to_sink(0)])
            .gated(),
        );

        let mut partition = Partition::new(0, None, false);
        partition.total_data_weight = self.total_input_data_weight;
        partition.input_row_count = self.total_input_row_count;
        partition.sort_task = Some(sort_task);
        partition.sorted_merge_task = Some(merge_task);
        self.partitions.push(partition);
        self.install_adjuster(sort_task, constraints.data_weight_per_job);
        self.sort_tasks_activated = true;
        Ok(())
    }

    fn build_partitioned_sort(
        &mut self,
        input: &OperationInput,
        sort_constraints: &JobSizeConstraints,
        partition_count: usize,
        samples: &[KeySample],
    ) -> ArmadaResult<()> {
        let config = Arc::clone(&self.context.config);
        let partition_constraints = JobSizeConstraints::for_partition(
            self.total_input_data_weight,
            self.total_input_row_count,
            &config,
        );
        let seeds = select_partition_seeds(samples, partition_count);
        let boundaries: Vec<Key> = seeds
            .iter()
            .skip(1)
            .filter_map(|s| s.lower_key.clone())
            .collect();
        internal_ensure!(
            boundaries.len() + 1 == seeds.len(),
            "partition seed without a boundary key"
        );

        let input_pool = self.pools.insert(PoolEntry::Unordered(UnorderedChunkPool::new(
            partition_constraints.data_weight_per_job,
            config.max_slices_per_job,
        )));
        self.input_pool = Some(input_pool);
        self.add_input_stripes(input_pool, input)?;
        let shuffle = self.pools.insert(PoolEntry::Shuffle(ShuffleChunkPool::new(
            seeds.len(),
            boundaries,
            sort_constraints.data_weight_per_job,
            config.max_slices_per_job,
        )));
        self.shuffle_pool = Some(shuffle);

        let partition_group = self.groups.len();
        self.groups.push(TaskGroup::new("partition"));
        let sort_group = self.groups.len();
        self.groups.push(TaskGroup::new("sort"));
        let merge_group = self.groups.len();
        self.groups.push(TaskGroup::new("sorted_merge"));

        let partition_task = self.tasks.len();
        self.tasks.push(
            Task::new(
                partition_task,
                TaskKind::Partition,
                partition_group,
                PoolOutputRef::plain(input_pool),
            )
            .with_edges(vec![EdgeDescriptor::to_pool(shuffle)]),
        );
        self.partition_task = Some(partition_task);
        self.install_adjuster(partition_task, partition_constraints.data_weight_per_job);

        for (index, seed) in seeds.iter().enumerate() {
            let mut partition = Partition::new(index, seed.lower_key.clone(), seed.maniac);
            if seed.maniac {
                // Rows of a single repeated key need no sorting; the bucket
                // drains straight to the output through unordered merge.
                let task = self.tasks.len();
                self.tasks.push(
                    Task::new(
                        task,
                        TaskKind::UnorderedMerge {
                            partition: Some(index),
                        },
                        sort_group,
                        PoolOutputRef::shuffle_bucket(shuffle, index),
                    )
                    .with_edges(vec![EdgeDescriptor::to_sink(0)])
                    .gated(),
                );
                partition.unordered_merge_task = Some(task);
                partition.sorted_merge_decided = true;
            } else {
                let sort_task = self.tasks.len();
                self.tasks.push(
                    Task::new(
                        sort_task,
                        TaskKind::Sort { partition: index },
                        sort_group,
                        PoolOutputRef::shuffle_bucket(shuffle, index),
                    )
                    .with_edges(vec![EdgeDescriptor::to_sink(0)])
                    .gated(),
                );
                partition.sort_task = Some(sort_task);

                let merge_pool = self.pools.insert(PoolEntry::Sorted(SortedChunkPool::new(
                    sort_constraints.data_weight_per_job,
                    config.max_slices_per_job,
                )));
                let merge_task = self.tasks.len();
                self.tasks.push(
                    Task::new(
                        merge_task,
                        TaskKind::SortedMerge {
                            partition: Some(index),
                        },
                        merge_group,
                        PoolOutputRef::plain(merge_pool),
                    )
                    .with_edges(vec![EdgeDescriptor::to_sink(0)])
                    .gated(),
                );
                partition.sorted_merge_task = Some(merge_task);
            }
            self.partitions.push(partition);
        }
        Ok(())
    }

    /// Decides, once per partition and before its first sort job is handed
    /// out, whether sorted output must pass through a final sorted merge.
    /// Only a partition whose input is final and fits a single sort job may
    /// write straight to the output table; everything else routes through
    /// the merge pool. The decision is sticky, so jobs never mix targets.
    pub(crate) fn ensure_sorted_merge_decided(&mut self, task_idx: TaskIdx) -> ArmadaResult<()> {
        let p = match self.tasks[task_idx].kind {
            TaskKind::Sort { partition } => partition,
            TaskKind::SimpleSort => 0,
            _ => return Ok(()),
        };
        if self.partitions[p].sorted_merge_decided {
            return Ok(());
        }
        let (pending, total) = {
            let pool = self.pools.output_ref(self.tasks[task_idx].pool)?;
            (pool.pending_job_count(), pool.total_job_count())
        };
        let needed = match self.tasks[task_idx].kind {
            // A simple sort has all of its input up front: it writes
            // straight to the output unless it takes more than one job.
            TaskKind::SimpleSort => total > 1,
            _ => {
                if pending == 0 {
                    false
                } else {
                    // While partitioning still runs, more data may land in
                    // this bucket, so a one-job estimate cannot be trusted.
                    let partitioning_done = self
                        .partition_task
                        .map(|t| self.tasks[t].completed)
                        .unwrap_or(true);
                    !(partitioning_done && total <= 1)
                }
            }
        };
        self.partitions[p].sorted_merge_decided = true;
        self.partitions[p].sorted_merge_needed = needed;

        let merge_task = self.partitions[p]
            .sorted_merge_task
            .ok_or_else(|| internal_err!("partition {} has no sorted merge task", p))?;
        if needed {
            let merge_pool = self.tasks[merge_task].pool.pool;
            self.tasks[task_idx].edges = vec![EdgeDescriptor::to_pool(merge_pool)];
            tracing::debug!(
                operation_id = %self.context.operation_id,
                partition = p,
                total_jobs = total,
                "sort output routed through sorted merge"
            );
        } else {
            // Single direct final sort job; the merge stage stays empty.
            self.pools.input(self.tasks[merge_task].pool.pool)?.finish();
            self.tasks[merge_task].input_finished = true;
            self.tasks[merge_task].ready = true;
        }
        Ok(())
    }

    /// One pass of sort-specific transitions; returns whether anything
    /// changed so the caller can iterate to a fixpoint.
    pub(crate) fn run_sort_transitions(&mut self) -> ArmadaResult<bool> {
        if self.partitions.is_empty() {
            return Ok(false);
        }
        let mut changed = false;

        // Partitioning finished: seal the shuffle so bucket totals become
        // final and sort tasks learn their input is complete.
        if let (Some(partition_task), Some(shuffle)) = (self.partition_task, self.shuffle_pool) {
            if self.tasks[partition_task].completed && !self.pools.input(shuffle)?.is_finished() {
                self.pools.input(shuffle)?.finish();
                for task in &mut self.tasks {
                    if task.pool.pool == shuffle {
                        task.input_finished = true;
                    }
                }
                changed = true;
                tracing::info!(
                    operation_id = %self.context.operation_id,
                    "partitioning finished, shuffle sealed"
                );
            }
        }

        if !self.sort_tasks_activated
            && self.partition_fraction_completed()?
                >= self.context.config.shuffle_start_threshold
        {
            self.activate_sort_tier();
            changed = true;
        }

        // Completed sort tasks seal their partition's merge input; empty
        // partitions get their decision made here since no job ever asked.
        for p in 0..self.partitions.len() {
            let Some(sort_task) = self.partitions[p].sort_task else {
                continue;
            };
            if !self.tasks[sort_task].completed {
                continue;
            }
            if !self.partitions[p].sorted_merge_decided {
                self.ensure_sorted_merge_decided(sort_task)?;
                changed = true;
            }
            if self.partitions[p].sorted_merge_needed {
                let merge_task = self.partitions[p]
                    .sorted_merge_task
                    .ok_or_else(|| internal_err!("partition {} has no sorted merge task", p))?;
                if !self.tasks[merge_task].input_finished {
                    self.pools.input(self.tasks[merge_task].pool.pool)?.finish();
                    self.tasks[merge_task].input_finished = true;
                    changed = true;
                }
            }
        }

        if !self.merge_tasks_activated {
            let partitioning_done = self
                .partition_task
                .map(|t| self.tasks[t].completed)
                .unwrap_or(true);
            if partitioning_done
                && self.sort_fraction_completed()? >= self.context.config.merge_start_threshold
            {
                for task in &mut self.tasks {
                    if matches!(
                        task.kind,
                        TaskKind::SortedMerge {
                            partition: Some(_)
                        }
                    ) {
                        task.ready = true;
                    }
                }
                self.merge_tasks_activated = true;
                changed = true;
                tracing::info!(
                    operation_id = %self.context.operation_id,
                    "merge tier activated"
                );
            }
        }

        for p in 0..self.partitions.len() {
            changed |= self.try_complete_partition(p)?;
        }
        Ok(changed)
    }

    fn partition_fraction_completed(&self) -> ArmadaResult<f64> {
        let Some(partition_task) = self.partition_task else {
            return Ok(1.0);
        };
        if self.tasks[partition_task].completed {
            return Ok(1.0);
        }
        let pool = self.pools.output_ref(self.tasks[partition_task].pool)?;
        let total = pool.total_data_weight();
        if total <= 0 {
            return Ok(1.0);
        }
        Ok(pool.completed_data_weight() as f64 / total as f64)
    }

    fn sort_fraction_completed(&self) -> ArmadaResult<f64> {
        let mut total = 0i64;
        let mut completed = 0i64;
        for partition in &self.partitions {
            if let Some(task) = partition.sort_task {
                let pool = self.pools.output_ref(self.tasks[task].pool)?;
                total += pool.total_data_weight();
                completed += pool.completed_data_weight();
            }
        }
        if total <= 0 {
            return Ok(1.0);
        }
        Ok(completed as f64 / total as f64)
    }

    fn activate_sort_tier(&mut self) {
        self.sort_tasks_activated = true;
        if !self.partitions_assigned {
            let nodes: Vec<NodeDescriptor> = self.known_nodes.values().cloned().collect();
            assign_partitions(&mut self.partitions, &nodes);
            if self.context.config.enable_partitioned_data_balancing {
                let count = self.partitions.len().max(1) as i64;
                let mean: i64 =
                    self.partitions.iter().map(|p| p.total_data_weight).sum::<i64>() / count;
                let tolerance = self.context.config.partitioned_data_balancing_tolerance;
                for partition in &mut self.partitions {
                    if mean > 0
                        && !partition.has_scheduled_jobs
                        && partition.total_data_weight as f64 > mean as f64 * tolerance
                    {
                        // Oversized partitions drain across the cluster
                        // instead of hammering one node.
                        partition.assigned_node = None;
                    }
                }
            }
            self.partitions_assigned = true;
        }
        for task in &mut self.tasks {
            if matches!(
                task.kind,
                TaskKind::Sort { .. }
                    | TaskKind::UnorderedMerge {
                        partition: Some(_)
                    }
            ) {
                task.ready = true;
            }
        }
        tracing::info!(
            operation_id = %self.context.operation_id,
            partitions = self.partitions.len(),
            "sort tier activated"
        );
    }

    /// Marks a partition completed once all of its work is done. Idempotent;
    /// verifies that every row routed into the partition came out of it.
    pub(crate) fn try_complete_partition(&mut self, p: usize) -> ArmadaResult<bool> {
        if self.partitions[p].completed {
            return Ok(false);
        }
        let partitioning_done = self
            .partition_task
            .map(|t| self.tasks[t].completed)
            .unwrap_or(true);
        if !partitioning_done {
            return Ok(false);
        }
        let done = if self.partitions[p].maniac {
            match self.partitions[p].unordered_merge_task {
                Some(task) => self.tasks[task].completed,
                None => false,
            }
        } else {
            let Some(sort_task) = self.partitions[p].sort_task else {
                return Ok(false);
            };
            if !self.tasks[sort_task].completed || !self.partitions[p].sorted_merge_decided {
                return Ok(false);
            }
            if self.partitions[p].sorted_merge_needed {
                match self.partitions[p].sorted_merge_task {
                    Some(task) => self.tasks[task].completed,
                    None => false,
                }
            } else {
                true
            }
        };
        if !done {
            return Ok(false);
        }
        if self.rows_must_be_conserved() {
            let partition = &self.partitions[p];
            internal_ensure!(
                partition.input_row_count == partition.output_row_count,
                "row count mismatch in partition {}: {} rows in, {} rows out",
                p,
                partition.input_row_count,
                partition.output_row_count
            );
        }
        self.partitions[p].completed = true;
        self.progress.completed_partition_count += 1;
        tracing::debug!(
            operation_id = %self.context.operation_id,
            partition = p,
            rows = self.partitions[p].output_row_count,
            "partition completed"
        );
        Ok(true)
    }
}
