use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

use crate::scheduling::context::JobType;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounter {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub aborted: usize,
    pub lost: usize,
}

impl JobCounter {
    pub fn started(&mut self) {
        self.running += 1;
    }

    pub fn completed(&mut self) {
        self.running = self.running.saturating_sub(1);
        self.completed += 1;
    }

    pub fn failed(&mut self) {
        self.running = self.running.saturating_sub(1);
        self.failed += 1;
    }

    pub fn aborted(&mut self) {
        self.running = self.running.saturating_sub(1);
        self.aborted += 1;
    }

    /// A previously completed job whose output disappeared.
    pub fn lost(&mut self) {
        self.completed = self.completed.saturating_sub(1);
        self.lost += 1;
    }
}

impl Display for JobCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pending={} running={} completed={} failed={} aborted={} lost={}",
            self.pending, self.running, self.completed, self.failed, self.aborted, self.lost
        )
    }
}

/// Aggregated operation progress, cheap to clone out of the controller for
/// periodic logging and external polling.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OperationProgress {
    pub jobs: JobCounter,
    pub jobs_by_type: Vec<(JobType, JobCounter)>,
    pub partition_count: usize,
    pub completed_partition_count: usize,
    pub total_data_weight: i64,
    pub processed_data_weight: i64,
    pub total_row_count: i64,
    pub unavailable_input_chunk_count: usize,
}

impl OperationProgress {
    pub fn counter_mut(&mut self, job_type: JobType) -> &mut JobCounter {
        if let Some(position) = self.jobs_by_type.iter().position(|(t, _)| *t == job_type) {
            return &mut self.jobs_by_type[position].1;
        }
        self.jobs_by_type.push((job_type, JobCounter::default()));
        let last = self.jobs_by_type.len() - 1;
        &mut self.jobs_by_type[last].1
    }

    pub fn counter(&self, job_type: JobType) -> JobCounter {
        self.jobs_by_type
            .iter()
            .find(|(t, _)| *t == job_type)
            .map(|(_, c)| *c)
            .unwrap_or_default()
    }
}

impl Display for OperationProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "jobs: {}; partitions: {}/{}; data weight: {}/{}",
            self.jobs,
            self.completed_partition_count,
            self.partition_count,
            self.processed_data_weight,
            self.total_data_weight
        )
    }
}

pub const MAX_HISTOGRAM_BUCKETS: usize = 100;

/// Fixed-width histogram over per-partition data weights, capped at
/// [`MAX_HISTOGRAM_BUCKETS`] buckets however many partitions there are.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionHistogram {
    pub min: i64,
    pub max: i64,
    pub bucket_width: i64,
    pub counts: Vec<usize>,
}

impl PartitionHistogram {
    pub fn build(values: impl IntoIterator<Item = i64>) -> Self {
        let values: Vec<i64> = values.into_iter().collect();
        let (min, max) = values
            .iter()
            .fold((i64::MAX, i64::MIN), |(lo, hi), &v| (lo.min(v), hi.max(v)));
        if values.is_empty() {
            return Self {
                min: 0,
                max: 0,
                bucket_width: 1,
                counts: Vec::new(),
            };
        }
        let span = max - min + 1;
        let bucket_width = (span + MAX_HISTOGRAM_BUCKETS as i64 - 1) / MAX_HISTOGRAM_BUCKETS as i64;
        let bucket_width = bucket_width.max(1);
        let bucket_count = ((span + bucket_width - 1) / bucket_width) as usize;
        let mut counts = vec![0usize; bucket_count];
        for value in values {
            counts[((value - min) / bucket_width) as usize] += 1;
        }
        Self {
            min,
            max,
            bucket_width,
            counts,
        }
    }

    /// Whether the largest partition exceeds `tolerance` times the mean, the
    /// signal used to warn about partition skew.
    pub fn is_skewed(&self, tolerance: f64) -> bool {
        let total: usize = self.counts.iter().sum();
        if total == 0 {
            return false;
        }
        let mean = self
            .counts
            .iter()
            .enumerate()
            .map(|(i, &c)| (self.min + i as i64 * self.bucket_width + self.bucket_width / 2) as f64 * c as f64)
            .sum::<f64>()
            / total as f64;
        mean > 0.0 && self.max as f64 > mean * tolerance
    }
}
