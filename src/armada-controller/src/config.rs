use std::time::Duration;

use serde::{Deserialize, Serialize};

const KB: i64 = 1024;
const MB: i64 = KB * 1024;
const GB: i64 = MB * 1024;

const DEFAULT_DATA_WEIGHT_PER_JOB: i64 = 256 * MB;
const DEFAULT_MAX_DATA_WEIGHT_PER_JOB: i64 = 200 * GB;
const DEFAULT_DATA_WEIGHT_PER_PARTITION_JOB: i64 = 2 * GB;
const DEFAULT_DATA_WEIGHT_PER_SORT_JOB: i64 = 2 * GB;
const DEFAULT_PARTITION_DATA_WEIGHT: i64 = 2 * GB;
const DEFAULT_FOOTPRINT_MEMORY: i64 = 16 * MB;
const DEFAULT_MAX_JOB_COUNT: usize = 100_000;
const DEFAULT_MAX_PARTITION_COUNT: usize = 10_000;
const DEFAULT_SAMPLES_PER_PARTITION: usize = 10;
const DEFAULT_MAX_SLICES_PER_JOB: usize = 50_000;
const DEFAULT_MAX_FAILED_JOB_COUNT: usize = 10;
const DEFAULT_MAX_OUTPUT_TABLES_TIMES_JOBS: usize = 2_000_000;
const DEFAULT_SHUFFLE_START_THRESHOLD: f64 = 0.75;
const DEFAULT_MERGE_START_THRESHOLD: f64 = 0.9;
const DEFAULT_LOCALITY_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_TIME_LIMIT_CHECK_PERIOD: Duration = Duration::from_secs(15);
const DEFAULT_PROGRESS_LOG_PERIOD: Duration = Duration::from_secs(30);
const DEFAULT_BALANCING_TOLERANCE: f64 = 3.0;

/// Immutable per-operation snapshot of controller tuning knobs. A new
/// snapshot may be swapped in through `update_config`, affecting only
/// forward-looking decisions.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Default target data weight for one job when the spec pins nothing.
    pub data_weight_per_job: i64,
    /// Hard ceiling on job input size; overflow is permitted only when the
    /// job count is explicitly pinned by the spec.
    pub max_data_weight_per_job: i64,
    pub data_weight_per_partition_job: i64,
    pub data_weight_per_sort_job: i64,
    /// Target amount of data per partition when the spec gives neither a
    /// partition count nor a partition data weight.
    pub partition_data_weight: i64,
    pub max_job_count: usize,
    pub max_partition_count: usize,
    /// Number of key samples requested per suggested partition.
    pub samples_per_partition: usize,
    pub max_slices_per_job: usize,
    pub max_failed_job_count: usize,
    /// Guard against runaway graphs: `output_table_count * total_job_count`
    /// above this fails the operation.
    pub max_output_tables_times_jobs: usize,
    /// Fraction of partition-phase data weight that must be completed before
    /// sort tasks may start consuming shuffle buckets.
    pub shuffle_start_threshold: f64,
    /// Fraction of sort-phase data weight that must be completed (and the
    /// partition task finished) before merge tasks activate.
    pub merge_start_threshold: f64,
    /// How long a task with nonempty locality waits for a local slot before
    /// accepting a non-local one.
    pub locality_timeout: Duration,
    /// Fixed per-job memory overhead added on top of data-driven demand.
    pub footprint_memory: i64,
    pub time_limit_check_period: Duration,
    pub progress_log_period: Duration,
    pub job_size_adjuster: Option<JobSizeAdjusterConfig>,
    /// Refuse partition jobs on nodes already carrying far more scheduled
    /// partition data than the io-weighted average.
    pub enable_partitioned_data_balancing: bool,
    pub partitioned_data_balancing_tolerance: f64,
    /// Round-trip the snapshot right after materialization to catch
    /// persistence bugs before any job runs.
    pub enable_snapshot_cycle_after_materialization: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            data_weight_per_job: DEFAULT_DATA_WEIGHT_PER_JOB,
            max_data_weight_per_job: DEFAULT_MAX_DATA_WEIGHT_PER_JOB,
            data_weight_per_partition_job: DEFAULT_DATA_WEIGHT_PER_PARTITION_JOB,
            data_weight_per_sort_job: DEFAULT_DATA_WEIGHT_PER_SORT_JOB,
            partition_data_weight: DEFAULT_PARTITION_DATA_WEIGHT,
            max_job_count: DEFAULT_MAX_JOB_COUNT,
            max_partition_count: DEFAULT_MAX_PARTITION_COUNT,
            samples_per_partition: DEFAULT_SAMPLES_PER_PARTITION,
            max_slices_per_job: DEFAULT_MAX_SLICES_PER_JOB,
            max_failed_job_count: DEFAULT_MAX_FAILED_JOB_COUNT,
            max_output_tables_times_jobs: DEFAULT_MAX_OUTPUT_TABLES_TIMES_JOBS,
            shuffle_start_threshold: DEFAULT_SHUFFLE_START_THRESHOLD,
            merge_start_threshold: DEFAULT_MERGE_START_THRESHOLD,
            locality_timeout: DEFAULT_LOCALITY_TIMEOUT,
            footprint_memory: DEFAULT_FOOTPRINT_MEMORY,
            time_limit_check_period: DEFAULT_TIME_LIMIT_CHECK_PERIOD,
            progress_log_period: DEFAULT_PROGRESS_LOG_PERIOD,
            job_size_adjuster: Some(JobSizeAdjusterConfig::default()),
            enable_partitioned_data_balancing: false,
            partitioned_data_balancing_tolerance: DEFAULT_BALANCING_TOLERANCE,
            enable_snapshot_cycle_after_materialization: false,
        }
    }
}

impl ControllerConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.shuffle_start_threshold) {
            return Err(format!(
                "shuffle_start_threshold must lie in [0, 1], got {}",
                self.shuffle_start_threshold
            ));
        }
        if !(0.0..=1.0).contains(&self.merge_start_threshold) {
            return Err(format!(
                "merge_start_threshold must lie in [0, 1], got {}",
                self.merge_start_threshold
            ));
        }
        if self.max_job_count == 0 {
            return Err("max_job_count must be positive".to_string());
        }
        if self.max_partition_count == 0 {
            return Err("max_partition_count must be positive".to_string());
        }
        if self.data_weight_per_job <= 0 || self.max_data_weight_per_job <= 0 {
            return Err("job data weight targets must be positive".to_string());
        }
        Ok(())
    }
}

/// Feedback loop enlarging the per-job data weight of a pool whose jobs
/// finish too quickly relative to their scheduling overhead.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct JobSizeAdjusterConfig {
    /// Jobs shorter than this are considered too small.
    pub min_job_time: Duration,
    /// Jobs whose execution time is below `prepare_time * ratio` are
    /// considered too small even when above `min_job_time`.
    pub exec_to_prepare_time_ratio: f64,
    /// Multiplier applied to data-weight-per-job when a job is too small.
    pub data_weight_boost_factor: f64,
    pub max_data_weight_per_job: i64,
}

impl Default for JobSizeAdjusterConfig {
    fn default() -> Self {
        Self {
            min_job_time: Duration::from_secs(60),
            exec_to_prepare_time_ratio: 20.0,
            data_weight_boost_factor: 2.0,
            max_data_weight_per_job: DEFAULT_MAX_DATA_WEIGHT_PER_JOB,
        }
    }
}
