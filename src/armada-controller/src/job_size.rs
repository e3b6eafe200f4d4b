use std::time::Duration;

use common_error::{ArmadaResult, internal_ensure};
use serde::{Deserialize, Serialize};

use crate::config::{ControllerConfig, JobSizeAdjusterConfig};

fn ceil_div(a: i64, b: i64) -> i64 {
    (a + b - 1) / b
}

/// Pure job sizing decision computed once per pool from the operation spec
/// and observed input statistics. Guarantees: `job_count >= 1` whenever
/// there is input data, `data_weight_per_job <= max_data_weight_per_job`
/// unless the job count is explicitly pinned, and the job count is clamped
/// to the configured maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSizeConstraints {
    pub job_count: usize,
    pub data_weight_per_job: i64,
    pub max_data_weight_per_job: i64,
    /// Slicing granularity hints fed to chunk fetching.
    pub input_slice_data_weight: i64,
    pub input_slice_row_count: i64,
    pub is_explicit_job_count: bool,
}

impl JobSizeConstraints {
    /// The user pinned the job count; per-job weight follows from it and is
    /// allowed to overflow the configured ceiling.
    pub fn explicit(
        job_count: usize,
        total_data_weight: i64,
        total_row_count: i64,
        config: &ControllerConfig,
    ) -> ArmadaResult<Self> {
        internal_ensure!(job_count > 0, "explicit job count must be positive");
        let job_count = job_count.min(config.max_job_count);
        let data_weight_per_job = if total_data_weight > 0 {
            ceil_div(total_data_weight, job_count as i64)
        } else {
            config.data_weight_per_job
        };
        Ok(Self::finish(
            job_count,
            data_weight_per_job,
            i64::MAX,
            total_row_count,
            true,
        ))
    }

    /// Map and merge jobs: derived from a per-job data weight target.
    pub fn for_merge(
        total_data_weight: i64,
        total_row_count: i64,
        requested_data_weight_per_job: Option<i64>,
        config: &ControllerConfig,
    ) -> Self {
        let data_weight_per_job = requested_data_weight_per_job
            .unwrap_or(config.data_weight_per_job)
            .clamp(1, config.max_data_weight_per_job);
        let job_count = Self::derive_job_count(total_data_weight, data_weight_per_job, config);
        Self::finish(
            job_count,
            data_weight_per_job,
            config.max_data_weight_per_job,
            total_row_count,
            false,
        )
    }

    /// Partition-phase jobs of a sort or map-reduce operation.
    pub fn for_partition(
        total_data_weight: i64,
        total_row_count: i64,
        config: &ControllerConfig,
    ) -> Self {
        let data_weight_per_job = config
            .data_weight_per_partition_job
            .clamp(1, config.max_data_weight_per_job);
        let job_count = Self::derive_job_count(total_data_weight, data_weight_per_job, config);
        Self::finish(
            job_count,
            data_weight_per_job,
            config.max_data_weight_per_job,
            total_row_count,
            false,
        )
    }

    /// Sort-phase jobs draining one shuffle bucket.
    pub fn for_sort(
        total_data_weight: i64,
        total_row_count: i64,
        config: &ControllerConfig,
    ) -> Self {
        let data_weight_per_job = config
            .data_weight_per_sort_job
            .clamp(1, config.max_data_weight_per_job);
        let job_count = Self::derive_job_count(total_data_weight, data_weight_per_job, config);
        Self::finish(
            job_count,
            data_weight_per_job,
            config.max_data_weight_per_job,
            total_row_count,
            false,
        )
    }

    fn derive_job_count(
        total_data_weight: i64,
        data_weight_per_job: i64,
        config: &ControllerConfig,
    ) -> usize {
        if total_data_weight <= 0 {
            return 0;
        }
        (ceil_div(total_data_weight, data_weight_per_job) as usize).clamp(1, config.max_job_count)
    }

    fn finish(
        job_count: usize,
        data_weight_per_job: i64,
        max_data_weight_per_job: i64,
        total_row_count: i64,
        is_explicit_job_count: bool,
    ) -> Self {
        let data_weight_per_job = data_weight_per_job.min(max_data_weight_per_job).max(1);
        let input_slice_data_weight = (data_weight_per_job / 10).max(1);
        let input_slice_row_count = if job_count > 0 {
            (total_row_count / (job_count as i64 * 10)).max(1)
        } else {
            1
        };
        Self {
            job_count,
            data_weight_per_job,
            max_data_weight_per_job,
            input_slice_data_weight,
            input_slice_row_count,
            is_explicit_job_count,
        }
    }
}

/// Feedback loop growing a pool's per-job data weight when its jobs finish
/// too quickly to amortize their scheduling overhead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSizeAdjuster {
    data_weight_per_job: f64,
    config: JobSizeAdjusterConfig,
}

impl JobSizeAdjuster {
    pub fn new(initial_data_weight_per_job: i64, config: JobSizeAdjusterConfig) -> Self {
        Self {
            data_weight_per_job: initial_data_weight_per_job.max(1) as f64,
            config,
        }
    }

    pub fn data_weight_per_job(&self) -> i64 {
        self.data_weight_per_job.min(i64::MAX as f64) as i64
    }

    /// Observes one completed job. Returns true when the target grew.
    pub fn on_job_completed(&mut self, prepare_duration: Duration, exec_duration: Duration) -> bool {
        let too_short = exec_duration < self.config.min_job_time
            || exec_duration.as_secs_f64()
                < prepare_duration.as_secs_f64() * self.config.exec_to_prepare_time_ratio;
        if !too_short {
            return false;
        }
        let boosted = self.data_weight_per_job * self.config.data_weight_boost_factor;
        let cap = self.config.max_data_weight_per_job as f64;
        let new = boosted.min(cap);
        if new > self.data_weight_per_job {
            self.data_weight_per_job = new;
            true
        } else {
            false
        }
    }
}
