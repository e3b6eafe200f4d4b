//! End-to-end controller scenarios: each test drives an operation through
//! the public surface only (prepare, materialize, schedule, job events,
//! commit), playing the roles of scheduler and execution layer.

use std::{
    sync::Arc,
    time::{Duration, SystemTime},
};

use armada_controller::{
    chunk_pool::{ChunkId, ChunkSlice, ChunkStripe, Key, KeySample},
    config::ControllerConfig,
    operation::{
        controller::{InputTable, OperationController, OperationInput},
        spec::{MergeMode, OperationKind, OperationSpec, SortOptions, UnavailableChunkStrategy},
        OperationContext, OperationState,
    },
    scheduling::{
        context::{JobId, JobType, NodeDescriptor, OperationId, ScheduleJobContext, ScheduledJob},
        joblet::{AbortedJobSummary, CompletedJobSummary, FailedJobSummary, JobStatistics},
    },
    snapshot,
};
use common_resource_request::ResourceRequest;

fn ample_resources() -> ResourceRequest {
    ResourceRequest::new(64, 64.0, 1 << 42, 1 << 42)
}

fn ctx(node_id: u32) -> ScheduleJobContext {
    ScheduleJobContext {
        node: NodeDescriptor::new(node_id, format!("node-{node_id}:9012"), ample_resources()),
        available_resources: ample_resources(),
    }
}

fn stripe(weight: i64, rows: i64) -> ChunkStripe {
    ChunkStripe::new(vec![ChunkSlice::new(ChunkId::new(), weight, rows)])
}

fn input_of(stripes: Vec<ChunkStripe>) -> OperationInput {
    OperationInput {
        tables: vec![InputTable {
            stripes,
            samples: vec![],
        }],
    }
}

fn running_controller(spec: OperationSpec, input: &OperationInput) -> OperationController {
    let context = OperationContext::new(
        OperationId::new(),
        Arc::new(ControllerConfig::default()),
        Arc::new(spec),
    );
    let mut controller = OperationController::new(context).unwrap();
    controller.prepare(input).unwrap();
    controller.materialize().unwrap();
    controller
}

fn map_spec() -> OperationSpec {
    OperationSpec::new(OperationKind::Map)
        .with_input_tables(vec!["//tmp/in".into()])
        .with_output_tables(vec!["//tmp/out".into()])
}

fn sort_spec(options: SortOptions) -> OperationSpec {
    OperationSpec::new(OperationKind::Sort(options))
        .with_input_tables(vec!["//tmp/in".into()])
        .with_output_tables(vec!["//tmp/out".into()])
}

fn map_reduce_spec(options: SortOptions) -> OperationSpec {
    OperationSpec::new(OperationKind::MapReduce(options))
        .with_input_tables(vec!["//tmp/in".into()])
        .with_output_tables(vec!["//tmp/out".into()])
}

/// Completion echoing the job's input volume into one fresh chunk per
/// output edge, which keeps merge and sort row conservation satisfied.
fn echo_completion(job: &ScheduledJob) -> CompletedJobSummary {
    let weight = job.spec.input.total_data_weight;
    let rows = job.spec.input.total_row_count;
    CompletedJobSummary {
        job_id: job.job_id,
        statistics: JobStatistics::default(),
        output_stripes: job
            .spec
            .outputs
            .iter()
            .map(|_| stripe(weight, rows))
            .collect(),
    }
}

/// Schedules and immediately completes jobs until the controller stops
/// handing work out; returns the completed jobs in execution order.
fn drive_echo(controller: &mut OperationController, node_id: u32) -> Vec<ScheduledJob> {
    let mut jobs = Vec::new();
    while let Some(job) = controller.schedule_job(&ctx(node_id)).job {
        controller.on_job_completed(echo_completion(&job)).unwrap();
        jobs.push(job);
    }
    jobs
}

#[test]
fn map_operation_runs_to_completion() {
    let input = input_of(vec![stripe(100, 10), stripe(100, 10), stripe(100, 10)]);
    let mut controller = running_controller(map_spec(), &input);
    assert_eq!(controller.state(), OperationState::Running);

    let jobs = drive_echo(&mut controller, 1);
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].spec.job_type, JobType::Map);
    assert_eq!(jobs[0].spec.input.total_data_weight, 300);

    assert_eq!(controller.state(), OperationState::Completing);
    controller.commit().unwrap();
    assert_eq!(controller.state(), OperationState::Completed);
    // Committed twice is fine; scheduling after completion yields nothing.
    controller.commit().unwrap();
    assert!(controller.schedule_job(&ctx(1)).job.is_none());
}

#[test]
fn empty_input_completes_without_scheduling_any_job() {
    let mut controller = running_controller(map_spec(), &input_of(vec![]));
    assert_eq!(controller.state(), OperationState::Completing);
    assert_eq!(controller.progress().jobs.completed, 0);
    controller.commit().unwrap();
}

#[test]
fn ordered_merge_preserves_input_order_across_jobs() {
    let stripes: Vec<ChunkStripe> = (0..4).map(|_| stripe(100, 10)).collect();
    let expected: Vec<ChunkId> = stripes
        .iter()
        .flat_map(|s| s.chunk_ids().collect::<Vec<_>>())
        .collect();
    let spec = OperationSpec::new(OperationKind::Merge {
        mode: MergeMode::Ordered,
    })
    .with_input_tables(vec!["//tmp/in".into()])
    .with_output_tables(vec!["//tmp/out".into()])
    .with_job_count(2);
    let mut controller = running_controller(spec, &input_of(stripes));

    let jobs = drive_echo(&mut controller, 1);
    assert_eq!(jobs.len(), 2);
    let extracted: Vec<ChunkId> = jobs
        .iter()
        .flat_map(|j| j.spec.input.stripes.iter())
        .flat_map(|s| s.chunk_ids().collect::<Vec<_>>())
        .collect();
    assert_eq!(extracted, expected);

    assert_eq!(controller.state(), OperationState::Completing);
    controller.commit().unwrap();
}

#[test]
fn explicit_job_count_builds_exactly_that_many_jobs() {
    let spec = map_spec().with_job_count(4);
    let stripes: Vec<ChunkStripe> = (0..5).map(|_| stripe(200, 20)).collect();
    let mut controller = running_controller(spec, &input_of(stripes));

    let jobs = drive_echo(&mut controller, 1);
    assert_eq!(jobs.len(), 4);
    let weights: Vec<i64> = jobs
        .iter()
        .map(|j| j.spec.input.total_data_weight)
        .collect();
    assert_eq!(weights.iter().sum::<i64>(), 1000);
    // Five equal stripes over four jobs: one job takes two stripes, the
    // rest take one each.
    assert_eq!(weights.iter().copied().max(), Some(400));
    assert_eq!(controller.state(), OperationState::Completing);
    controller.commit().unwrap();
}

#[test]
fn node_without_resources_gets_no_job() {
    let input = input_of(vec![stripe(100, 10)]);
    let mut controller = running_controller(map_spec(), &input);

    let starved = ScheduleJobContext {
        node: NodeDescriptor::new(1, "node-1:9012", ample_resources()),
        available_resources: ResourceRequest::new(1, 1.0, 1024, 0),
    };
    assert!(controller.schedule_job(&starved).job.is_none());
    assert!(controller.schedule_job(&ctx(1)).job.is_some());
}

#[test]
fn duplicate_terminal_events_are_ignored() {
    let input = input_of(vec![stripe(100, 10)]);
    let mut controller = running_controller(map_spec(), &input);

    let job = controller.schedule_job(&ctx(1)).job.unwrap();
    controller.on_job_completed(echo_completion(&job)).unwrap();
    assert_eq!(controller.state(), OperationState::Completing);

    // A repeated completion and a stale abort both find no joblet.
    controller.on_job_completed(echo_completion(&job)).unwrap();
    controller
        .on_job_aborted(AbortedJobSummary {
            job_id: job.job_id,
            reason: "node heartbeat lost".into(),
        })
        .unwrap();
    assert_eq!(controller.state(), OperationState::Completing);
    assert_eq!(controller.progress().jobs.completed, 1);
    assert_eq!(controller.progress().jobs.aborted, 0);
}

#[test]
fn aborted_job_input_is_rescheduled() {
    let input = input_of(vec![stripe(100, 10)]);
    let mut controller = running_controller(map_spec(), &input);

    let first = controller.schedule_job(&ctx(1)).job.unwrap();
    controller
        .on_job_aborted(AbortedJobSummary {
            job_id: first.job_id,
            reason: "preempted".into(),
        })
        .unwrap();

    let second = controller.schedule_job(&ctx(1)).job.unwrap();
    assert_ne!(first.job_id, second.job_id);
    assert_eq!(
        second.spec.input.total_data_weight,
        first.spec.input.total_data_weight
    );
    controller.on_job_completed(echo_completion(&second)).unwrap();
    assert_eq!(controller.state(), OperationState::Completing);
}

#[test]
fn failed_job_budget_exhaustion_fails_the_operation() {
    let mut spec = map_spec();
    spec.max_failed_job_count = Some(2);
    let input = input_of(vec![stripe(100, 10)]);
    let mut controller = running_controller(spec, &input);

    for attempt in 0..2 {
        let job = controller.schedule_job(&ctx(1)).job.unwrap();
        controller
            .on_job_failed(FailedJobSummary {
                job_id: job.job_id,
                error: format!("attempt {attempt} crashed"),
                fatal: false,
            })
            .unwrap();
    }
    assert_eq!(controller.state(), OperationState::Failed);
    assert!(controller
        .result_error()
        .unwrap()
        .contains("failed job count limit exceeded"));
    assert!(controller.schedule_job(&ctx(1)).job.is_none());
}

#[test]
fn fatal_job_failure_fails_immediately() {
    let input = input_of(vec![stripe(100, 10)]);
    let mut controller = running_controller(map_spec(), &input);

    let job = controller.schedule_job(&ctx(1)).job.unwrap();
    controller
        .on_job_failed(FailedJobSummary {
            job_id: job.job_id,
            error: "user code assertion".into(),
            fatal: true,
        })
        .unwrap();
    assert_eq!(controller.state(), OperationState::Failed);
}

#[test]
fn wait_strategy_holds_data_until_the_chunk_returns() {
    let input = input_of(vec![stripe(100, 10)]);
    let chunk = input.tables[0].stripes[0].slices[0].chunk_id;
    let mut controller = running_controller(map_spec(), &input);

    controller.on_input_chunk_unavailable(chunk).unwrap();
    assert!(controller.schedule_job(&ctx(1)).job.is_none());
    assert_eq!(controller.progress().unavailable_input_chunk_count, 1);

    controller.on_input_chunk_available(chunk).unwrap();
    assert_eq!(controller.progress().unavailable_input_chunk_count, 0);
    assert!(controller.schedule_job(&ctx(1)).job.is_some());
}

#[test]
fn skip_strategy_drops_the_chunk_and_relaxes_row_conservation() {
    let mut spec = OperationSpec::new(OperationKind::Merge {
        mode: MergeMode::Unordered,
    })
    .with_input_tables(vec!["//tmp/in".into()])
    .with_output_tables(vec!["//tmp/out".into()]);
    spec.unavailable_chunk_strategy = UnavailableChunkStrategy::Skip;

    let input = input_of(vec![stripe(100, 10), stripe(50, 5)]);
    let skipped = input.tables[0].stripes[1].slices[0].chunk_id;
    let mut controller = running_controller(spec, &input);

    controller.on_input_chunk_unavailable(skipped).unwrap();
    let jobs = drive_echo(&mut controller, 1);
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].spec.input.total_row_count, 10);
    // 5 skipped rows are excluded from the conservation check.
    assert_eq!(controller.state(), OperationState::Completing);
}

#[test]
fn fail_strategy_fails_on_first_unavailable_chunk() {
    let mut spec = map_spec();
    spec.unavailable_chunk_strategy = UnavailableChunkStrategy::Fail;
    let input = input_of(vec![stripe(100, 10)]);
    let chunk = input.tables[0].stripes[0].slices[0].chunk_id;
    let mut controller = running_controller(spec, &input);

    controller.on_input_chunk_unavailable(chunk).unwrap();
    assert_eq!(controller.state(), OperationState::Failed);
}

#[test]
fn time_limit_is_enforced() {
    let mut spec = map_spec();
    spec.time_limit = Some(Duration::from_secs(60));
    let input = input_of(vec![stripe(100, 10)]);
    let mut controller = running_controller(spec, &input);

    controller.check_time_limit(SystemTime::now() + Duration::from_secs(30));
    assert_eq!(controller.state(), OperationState::Running);

    controller.check_time_limit(SystemTime::now() + Duration::from_secs(120));
    assert_eq!(controller.state(), OperationState::Failed);
    assert!(controller
        .result_error()
        .unwrap()
        .contains("time limit exceeded"));
}

#[test]
fn simple_sort_writes_a_single_job_straight_to_the_sink() {
    // No samples: the controller falls back to a single unpartitioned sort.
    let input = input_of(vec![stripe(1000, 100)]);
    let mut controller = running_controller(sort_spec(SortOptions::new(vec!["k".into()])), &input);

    let jobs = drive_echo(&mut controller, 1);
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].spec.job_type, JobType::SimpleSort);

    assert_eq!(controller.state(), OperationState::Completing);
    assert_eq!(controller.progress().completed_partition_count, 1);
    controller.commit().unwrap();
}

fn even_samples(count: i64) -> Vec<KeySample> {
    (0..count)
        .map(|k| KeySample::new(Key::from_i64(&[k]), 1))
        .collect()
}

fn tagged_slice(tag: usize, weight: i64, rows: i64) -> ChunkSlice {
    ChunkSlice::new(ChunkId::new(), weight, rows).with_partition_tag(tag)
}

#[test]
fn partitioned_sort_runs_partition_then_sort_tiers() {
    const GB: i64 = 1 << 30;
    let options = SortOptions::new(vec!["k".into()]).with_partition_count(2);
    let input = OperationInput {
        tables: vec![InputTable {
            stripes: vec![stripe(2 * GB, 50), stripe(2 * GB, 50)],
            samples: even_samples(10),
        }],
    };
    let mut controller = running_controller(sort_spec(options), &input);
    assert_eq!(controller.progress().partition_count, 2);

    let first = controller.schedule_job(&ctx(1)).job.unwrap();
    let second = controller.schedule_job(&ctx(1)).job.unwrap();
    assert_eq!(first.spec.job_type, JobType::Partition);
    assert_eq!(second.spec.job_type, JobType::Partition);
    assert!(controller.schedule_job(&ctx(1)).job.is_none());

    // Half the partition data is done: below the shuffle start threshold,
    // so the sort tier stays gated.
    controller
        .on_job_completed(CompletedJobSummary {
            job_id: first.job_id,
            statistics: JobStatistics::default(),
            output_stripes: vec![ChunkStripe::new(vec![tagged_slice(0, 2 * GB, 50)])],
        })
        .unwrap();
    assert!(controller.schedule_job(&ctx(1)).job.is_none());

    controller
        .on_job_completed(CompletedJobSummary {
            job_id: second.job_id,
            statistics: JobStatistics::default(),
            output_stripes: vec![ChunkStripe::new(vec![tagged_slice(1, 2 * GB, 50)])],
        })
        .unwrap();

    let sort_jobs = drive_echo(&mut controller, 1);
    assert_eq!(sort_jobs.len(), 2);
    assert!(sort_jobs
        .iter()
        .all(|j| j.spec.job_type == JobType::FinalSort));

    assert_eq!(controller.state(), OperationState::Completing);
    assert_eq!(controller.progress().completed_partition_count, 2);
    controller.commit().unwrap();
}

#[test]
fn heavy_key_becomes_a_maniac_partition_drained_by_unordered_merge() {
    let mut samples = even_samples(10);
    samples.push(KeySample::new(Key::from_i64(&[5]), 1000));
    let options = SortOptions::new(vec!["k".into()]).with_partition_count(3);
    let input = OperationInput {
        tables: vec![InputTable {
            stripes: vec![stripe(3000, 300)],
            samples,
        }],
    };
    let mut controller = running_controller(sort_spec(options), &input);
    assert_eq!(controller.progress().partition_count, 3);

    let partition_job = controller.schedule_job(&ctx(1)).job.unwrap();
    assert_eq!(partition_job.spec.job_type, JobType::Partition);
    controller
        .on_job_completed(CompletedJobSummary {
            job_id: partition_job.job_id,
            statistics: JobStatistics::default(),
            output_stripes: vec![ChunkStripe::new(vec![
                tagged_slice(0, 1000, 100),
                tagged_slice(1, 1000, 100),
                tagged_slice(2, 1000, 100),
            ])],
        })
        .unwrap();

    let tier_jobs = drive_echo(&mut controller, 1);
    assert_eq!(tier_jobs.len(), 3);
    // The repeated-key partition needs no sorting, only concatenation.
    assert_eq!(
        tier_jobs
            .iter()
            .filter(|j| j.spec.job_type == JobType::UnorderedMerge)
            .count(),
        1
    );
    assert_eq!(
        tier_jobs
            .iter()
            .filter(|j| j.spec.job_type == JobType::FinalSort)
            .count(),
        2
    );

    assert_eq!(controller.state(), OperationState::Completing);
    assert_eq!(controller.progress().completed_partition_count, 3);
}

#[test]
fn oversized_partition_routes_sort_output_through_sorted_merge() {
    const GB: i64 = 1 << 30;
    let options = SortOptions::new(vec!["k".into()]).with_partition_count(2);
    let input = OperationInput {
        tables: vec![InputTable {
            stripes: vec![stripe(2 * GB, 100), stripe(2 * GB, 100)],
            samples: even_samples(10),
        }],
    };
    let mut controller = running_controller(sort_spec(options), &input);

    // Both partition jobs shove their whole output into bucket 0, leaving
    // partition 1 empty and partition 0 too big for one sort job.
    for _ in 0..2 {
        let job = controller.schedule_job(&ctx(1)).job.unwrap();
        assert_eq!(job.spec.job_type, JobType::Partition);
        controller
            .on_job_completed(CompletedJobSummary {
                job_id: job.job_id,
                statistics: JobStatistics::default(),
                output_stripes: vec![ChunkStripe::new(vec![tagged_slice(0, 2 * GB, 100)])],
            })
            .unwrap();
    }

    let tier_jobs = drive_echo(&mut controller, 1);
    let types: Vec<JobType> = tier_jobs.iter().map(|j| j.spec.job_type).collect();
    assert_eq!(
        types
            .iter()
            .filter(|t| **t == JobType::IntermediateSort)
            .count(),
        2
    );
    assert_eq!(
        types.iter().filter(|t| **t == JobType::SortedMerge).count(),
        1
    );

    assert_eq!(controller.state(), OperationState::Completing);
    assert_eq!(controller.progress().completed_partition_count, 2);
}

#[test]
fn sort_jobs_started_before_partitioning_ends_route_through_merge() {
    const GB: i64 = 1 << 30;
    let options = SortOptions::new(vec!["k".into()]).with_partition_count(2);
    let input = OperationInput {
        tables: vec![InputTable {
            stripes: (0..4).map(|_| stripe(2 * GB, 100)).collect(),
            samples: even_samples(10),
        }],
    };
    let mut controller = running_controller(sort_spec(options), &input);

    let partition_jobs: Vec<ScheduledJob> = (0..4)
        .map(|_| controller.schedule_job(&ctx(1)).job.unwrap())
        .collect();
    // Three quarters of the partition data crosses the shuffle start
    // threshold while the last partition job is still running.
    for job in &partition_jobs[..3] {
        controller
            .on_job_completed(CompletedJobSummary {
                job_id: job.job_id,
                statistics: JobStatistics::default(),
                output_stripes: vec![ChunkStripe::new(vec![tagged_slice(0, 2 * GB, 100)])],
            })
            .unwrap();
    }

    // More data may still land in the bucket, so the early sort job cannot
    // write straight to the output table.
    let early = controller.schedule_job(&ctx(1)).job.unwrap();
    assert_eq!(early.spec.job_type, JobType::IntermediateSort);
    controller.on_job_completed(echo_completion(&early)).unwrap();

    controller
        .on_job_completed(CompletedJobSummary {
            job_id: partition_jobs[3].job_id,
            statistics: JobStatistics::default(),
            output_stripes: vec![ChunkStripe::new(vec![tagged_slice(0, 2 * GB, 100)])],
        })
        .unwrap();

    // The decision is sticky: every later sort job of the partition keeps
    // feeding the merge, which concatenates the whole bucket at the end.
    let rest = drive_echo(&mut controller, 1);
    assert!(rest.iter().all(|j| j.spec.job_type != JobType::FinalSort));
    assert_eq!(
        rest.iter()
            .filter(|j| j.spec.job_type == JobType::SortedMerge)
            .count(),
        1
    );
    assert_eq!(controller.state(), OperationState::Completing);
}

#[test]
fn merge_threshold_takes_no_action_until_partitioning_completes() {
    const GB: i64 = 1 << 30;
    let options = SortOptions::new(vec!["k".into()]).with_partition_count(2);
    let input = OperationInput {
        tables: vec![InputTable {
            stripes: (0..4).map(|_| stripe(2 * GB, 100)).collect(),
            samples: even_samples(10),
        }],
    };
    let mut controller = running_controller(sort_spec(options), &input);

    let partition_jobs: Vec<ScheduledJob> = (0..4)
        .map(|_| controller.schedule_job(&ctx(1)).job.unwrap())
        .collect();
    for job in &partition_jobs[..3] {
        controller
            .on_job_completed(CompletedJobSummary {
                job_id: job.job_id,
                statistics: JobStatistics::default(),
                output_stripes: vec![ChunkStripe::new(vec![tagged_slice(0, 2 * GB, 100)])],
            })
            .unwrap();
    }

    // Drain every available sort job: the sorted fraction reaches 1.0,
    // well past the merge start threshold.
    let sorted = drive_echo(&mut controller, 1);
    assert!(!sorted.is_empty());
    assert!(sorted
        .iter()
        .all(|j| j.spec.job_type == JobType::IntermediateSort));
    // The last partition job still runs, so the merge tier stays gated and
    // there is nothing to schedule.
    assert!(controller.schedule_job(&ctx(1)).job.is_none());

    controller
        .on_job_completed(CompletedJobSummary {
            job_id: partition_jobs[3].job_id,
            statistics: JobStatistics::default(),
            output_stripes: vec![ChunkStripe::new(vec![tagged_slice(0, 2 * GB, 100)])],
        })
        .unwrap();

    let rest = drive_echo(&mut controller, 1);
    assert_eq!(
        rest.iter()
            .filter(|j| j.spec.job_type == JobType::SortedMerge)
            .count(),
        1
    );
    assert_eq!(controller.state(), OperationState::Completing);
    assert_eq!(controller.progress().completed_partition_count, 2);
}

#[test]
fn map_reduce_reducers_may_aggregate_rows() {
    const GB: i64 = 1 << 30;
    let options = SortOptions::new(vec!["k".into()]).with_partition_count(2);
    let input = OperationInput {
        tables: vec![InputTable {
            stripes: vec![stripe(2 * GB, 50), stripe(2 * GB, 50)],
            samples: even_samples(10),
        }],
    };
    let mut controller = running_controller(map_reduce_spec(options), &input);

    for _ in 0..2 {
        let job = controller.schedule_job(&ctx(1)).job.unwrap();
        assert_eq!(job.spec.job_type, JobType::Partition);
        controller
            .on_job_completed(CompletedJobSummary {
                job_id: job.job_id,
                statistics: JobStatistics::default(),
                output_stripes: vec![ChunkStripe::new(vec![
                    tagged_slice(0, GB, 25),
                    tagged_slice(1, GB, 25),
                ])],
            })
            .unwrap();
    }

    // Each reducer folds its 50 input rows down to 10; user code in the
    // reduce stage owes no row conservation.
    let mut reduce_jobs = 0;
    while let Some(job) = controller.schedule_job(&ctx(1)).job {
        assert_eq!(job.spec.job_type, JobType::FinalSort);
        controller
            .on_job_completed(CompletedJobSummary {
                job_id: job.job_id,
                statistics: JobStatistics::default(),
                output_stripes: vec![stripe(job.spec.input.total_data_weight, 10)],
            })
            .unwrap();
        reduce_jobs += 1;
    }
    assert_eq!(reduce_jobs, 2);
    assert_eq!(controller.state(), OperationState::Completing);
    assert_eq!(controller.progress().completed_partition_count, 2);
    controller.commit().unwrap();
}

#[test]
fn lost_intermediate_chunk_reruns_the_partition_job() {
    const GB: i64 = 1 << 30;
    let options = SortOptions::new(vec!["k".into()]).with_partition_count(2);
    let input = OperationInput {
        tables: vec![InputTable {
            stripes: vec![stripe(GB, 100)],
            samples: even_samples(10),
        }],
    };
    let mut controller = running_controller(sort_spec(options), &input);

    let partition_job = controller.schedule_job(&ctx(1)).job.unwrap();
    let shuffle_output = ChunkStripe::new(vec![tagged_slice(0, GB / 2, 50), tagged_slice(1, GB / 2, 50)]);
    let lost_chunk = shuffle_output.slices[0].chunk_id;
    controller
        .on_job_completed(CompletedJobSummary {
            job_id: partition_job.job_id,
            statistics: JobStatistics::default(),
            output_stripes: vec![shuffle_output.clone()],
        })
        .unwrap();

    // An unknown chunk is ignored outright.
    controller.on_intermediate_chunk_lost(ChunkId::new()).unwrap();
    assert_eq!(controller.progress().jobs.lost, 0);

    controller.on_intermediate_chunk_lost(lost_chunk).unwrap();
    assert_eq!(controller.progress().jobs.lost, 1);

    // The regeneration job carries the exact same input and must run before
    // any sort job can touch the suspended shuffle data.
    let regen = controller.schedule_job(&ctx(1)).job.unwrap();
    assert_eq!(regen.spec.job_type, JobType::Partition);
    assert_eq!(
        regen.spec.input.total_row_count,
        partition_job.spec.input.total_row_count
    );
    controller
        .on_job_completed(CompletedJobSummary {
            job_id: regen.job_id,
            statistics: JobStatistics::default(),
            output_stripes: vec![shuffle_output],
        })
        .unwrap();

    let sort_jobs = drive_echo(&mut controller, 1);
    assert_eq!(sort_jobs.len(), 2);
    assert_eq!(controller.state(), OperationState::Completing);
    // Partition rows were not double counted by the regeneration.
    assert_eq!(controller.progress().completed_partition_count, 2);
}

#[test]
fn lost_final_output_chunk_fails_the_operation() {
    let spec = map_spec().with_job_count(2);
    let input = input_of(vec![stripe(100, 10), stripe(100, 10)]);
    let mut controller = running_controller(spec, &input);

    let first = controller.schedule_job(&ctx(1)).job.unwrap();
    let second = controller.schedule_job(&ctx(1)).job.unwrap();
    let output = stripe(100, 10);
    let lost = output.slices[0].chunk_id;
    controller
        .on_job_completed(CompletedJobSummary {
            job_id: first.job_id,
            statistics: JobStatistics::default(),
            output_stripes: vec![output],
        })
        .unwrap();
    assert_eq!(controller.state(), OperationState::Running);

    // Output tables only commit at the end, but a map job cannot be re-run
    // to regenerate what it already wrote.
    controller.on_intermediate_chunk_lost(lost).unwrap();
    assert_eq!(controller.state(), OperationState::Failed);
    assert!(controller
        .result_error()
        .unwrap()
        .contains("cannot be re-run"));
    assert_eq!(controller.take_jobs_to_abort(), vec![second.job_id]);
}

#[test]
fn data_loss_aborts_running_downstream_sort_jobs() {
    const GB: i64 = 1 << 30;
    let options = SortOptions::new(vec!["k".into()]).with_partition_count(2);
    let input = OperationInput {
        tables: vec![InputTable {
            stripes: vec![stripe(GB, 100)],
            samples: even_samples(10),
        }],
    };
    let mut controller = running_controller(sort_spec(options), &input);

    let partition_job = controller.schedule_job(&ctx(1)).job.unwrap();
    let shuffle_output =
        ChunkStripe::new(vec![tagged_slice(0, GB / 2, 50), tagged_slice(1, GB / 2, 50)]);
    let lost_chunk = shuffle_output.slices[0].chunk_id;
    controller
        .on_job_completed(CompletedJobSummary {
            job_id: partition_job.job_id,
            statistics: JobStatistics::default(),
            output_stripes: vec![shuffle_output.clone()],
        })
        .unwrap();

    // A sort job is already holding part of the doomed output when the
    // chunk disappears; it must die, not keep reading stale data.
    let sort_job = controller.schedule_job(&ctx(1)).job.unwrap();
    controller.on_intermediate_chunk_lost(lost_chunk).unwrap();
    assert_eq!(controller.state(), OperationState::Running);
    assert_eq!(controller.progress().jobs.lost, 1);
    assert_eq!(controller.take_jobs_to_abort(), vec![sort_job.job_id]);

    // The scheduler's confirmation of the kill arrives late and is a no-op.
    controller
        .on_job_aborted(AbortedJobSummary {
            job_id: sort_job.job_id,
            reason: "input chunk lost".into(),
        })
        .unwrap();
    assert_eq!(controller.progress().jobs.aborted, 1);

    // Regeneration runs before any sort work resumes.
    let regen = controller.schedule_job(&ctx(1)).job.unwrap();
    assert_eq!(regen.spec.job_type, JobType::Partition);
    controller
        .on_job_completed(CompletedJobSummary {
            job_id: regen.job_id,
            statistics: JobStatistics::default(),
            output_stripes: vec![shuffle_output],
        })
        .unwrap();

    let sort_jobs = drive_echo(&mut controller, 1);
    assert_eq!(sort_jobs.len(), 2);
    assert_eq!(controller.state(), OperationState::Completing);
}

#[test]
fn snapshot_revive_reconciles_with_the_scheduler() {
    let spec = map_spec().with_job_count(2);
    let input = input_of(vec![stripe(100, 10), stripe(100, 10)]);
    let mut controller = running_controller(spec, &input);

    let job_a = controller.schedule_job(&ctx(1)).job.unwrap();
    let job_b = controller.schedule_job(&ctx(1)).job.unwrap();
    let bytes = snapshot::save(&controller).unwrap();

    let mut restored = snapshot::load(&bytes).unwrap();
    assert_eq!(restored.operation_id(), controller.operation_id());
    assert_eq!(restored.state(), OperationState::Running);

    // The scheduler still runs job A plus one job the snapshot never saw;
    // job B died with the old controller.
    let stray = JobId::new();
    let to_abort = restored.revive(&[job_a.job_id, stray]).unwrap();
    assert_eq!(to_abort, vec![stray]);
    assert_eq!(restored.progress().jobs.aborted, 1);

    restored.on_job_completed(echo_completion(&job_a)).unwrap();
    let replacement = restored.schedule_job(&ctx(1)).job.unwrap();
    assert_ne!(replacement.job_id, job_b.job_id);
    restored
        .on_job_completed(echo_completion(&replacement))
        .unwrap();
    assert_eq!(restored.state(), OperationState::Completing);
    restored.commit().unwrap();
}

#[test]
fn external_abort_drains_running_jobs() {
    let input = input_of(vec![stripe(100, 10)]);
    let mut controller = running_controller(map_spec(), &input);

    let job = controller.schedule_job(&ctx(1)).job.unwrap();
    controller.abort("user cancelled");
    assert_eq!(controller.state(), OperationState::Aborted);
    assert_eq!(controller.take_jobs_to_abort(), vec![job.job_id]);
    assert!(controller.take_jobs_to_abort().is_empty());
    assert!(controller.schedule_job(&ctx(1)).job.is_none());
}
