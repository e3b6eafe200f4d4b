use std::{sync::Arc, time::Duration};

use common_error::{ArmadaError, ArmadaResult};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergeMode {
    Unordered,
    Ordered,
    Sorted,
}

/// Sort-specific knobs shared by `Sort` and `MapReduce`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SortOptions {
    pub sort_columns: Vec<Arc<str>>,
    /// Explicit partition count; derived from data volume when absent.
    pub partition_count: Option<usize>,
    pub partition_data_weight: Option<i64>,
    pub samples_per_partition: Option<usize>,
}

impl SortOptions {
    pub fn new(sort_columns: Vec<Arc<str>>) -> Self {
        Self {
            sort_columns,
            partition_count: None,
            partition_data_weight: None,
            samples_per_partition: None,
        }
    }

    #[must_use]
    pub fn with_partition_count(mut self, partition_count: usize) -> Self {
        self.partition_count = Some(partition_count);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OperationKind {
    Map,
    Merge { mode: MergeMode },
    Sort(SortOptions),
    MapReduce(SortOptions),
}

impl OperationKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Map => "map",
            Self::Merge { .. } => "merge",
            Self::Sort(_) => "sort",
            Self::MapReduce(_) => "map_reduce",
        }
    }

    pub fn sort_options(&self) -> Option<&SortOptions> {
        match self {
            Self::Sort(options) | Self::MapReduce(options) => Some(options),
            _ => None,
        }
    }
}

/// What to do when an input chunk becomes unreadable mid-operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum UnavailableChunkStrategy {
    /// Fail the operation immediately.
    Fail,
    /// Drop the chunk from any job that has not started yet.
    Skip,
    /// Hold the affected data back until the chunk is reachable again.
    #[default]
    Wait,
}

/// User-facing description of one operation, validated once at submission
/// and immutable afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationSpec {
    pub kind: OperationKind,
    pub input_tables: Vec<Arc<str>>,
    pub output_tables: Vec<Arc<str>>,
    /// Pins the job count; overrides all data-weight heuristics.
    pub job_count: Option<usize>,
    pub data_weight_per_job: Option<i64>,
    pub max_failed_job_count: Option<usize>,
    pub time_limit: Option<Duration>,
    pub unavailable_chunk_strategy: UnavailableChunkStrategy,
}

impl OperationSpec {
    pub fn new(kind: OperationKind) -> Self {
        Self {
            kind,
            input_tables: Vec::new(),
            output_tables: Vec::new(),
            job_count: None,
            data_weight_per_job: None,
            max_failed_job_count: None,
            time_limit: None,
            unavailable_chunk_strategy: UnavailableChunkStrategy::default(),
        }
    }

    #[must_use]
    pub fn with_input_tables(mut self, tables: Vec<Arc<str>>) -> Self {
        self.input_tables = tables;
        self
    }

    #[must_use]
    pub fn with_output_tables(mut self, tables: Vec<Arc<str>>) -> Self {
        self.output_tables = tables;
        self
    }

    #[must_use]
    pub fn with_job_count(mut self, job_count: usize) -> Self {
        self.job_count = Some(job_count);
        self
    }

    pub fn validate(&self) -> ArmadaResult<()> {
        let invalid = |message: String| Err(ArmadaError::InvalidOperationSpec(message));
        if self.input_tables.is_empty() {
            return invalid("operation has no input tables".into());
        }
        if self.output_tables.is_empty() {
            return invalid("operation has no output tables".into());
        }
        if self.job_count == Some(0) {
            return invalid("explicit job count must be positive".into());
        }
        if matches!(self.data_weight_per_job, Some(w) if w <= 0) {
            return invalid("data weight per job must be positive".into());
        }
        if let Some(options) = self.kind.sort_options() {
            if options.sort_columns.is_empty() {
                return invalid(format!(
                    "{} operation requires at least one sort column",
                    self.kind.name()
                ));
            }
            if self.output_tables.len() != 1 {
                return invalid(format!(
                    "{} operation requires exactly one output table",
                    self.kind.name()
                ));
            }
            if options.partition_count == Some(0) {
                return invalid("explicit partition count must be positive".into());
            }
            if matches!(options.partition_data_weight, Some(w) if w <= 0) {
                return invalid("partition data weight must be positive".into());
            }
        }
        Ok(())
    }
}
