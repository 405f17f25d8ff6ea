use std::fmt;

use thiserror::Error;

/// Failure raised by one of the caller's callbacks inside a worker.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("partition {partition}: failed to fold item #{index} ({item})")]
    ItemProcessing {
        partition: usize,
        index: usize,
        item: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("partition {partition}: failed to initialize local accumulator")]
    Initialization {
        partition: usize,
        #[source]
        source: anyhow::Error,
    },

    #[error("partition {partition}: failed to merge into shared aggregate")]
    Merge {
        partition: usize,
        #[source]
        source: anyhow::Error,
    },
}

impl WorkerError {
    pub fn partition(&self) -> usize {
        match self {
            Self::ItemProcessing { partition, .. }
            | Self::Initialization { partition, .. }
            | Self::Merge { partition, .. } => *partition,
        }
    }
}

/// Every worker failure collected during one reduction.
#[derive(Debug)]
pub struct AggregateFailure {
    failures: Vec<WorkerError>,
}

impl AggregateFailure {
    pub(crate) fn new(mut failures: Vec<WorkerError>) -> Self {
        failures.sort_by_key(WorkerError::partition);
        Self { failures }
    }

    pub fn failures(&self) -> &[WorkerError] {
        &self.failures
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }
}

impl fmt::Display for AggregateFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} worker failure(s)", self.failures.len())?;
        for failure in &self.failures {
            write!(f, "\n  - {failure}")?;
            if let Some(source) = std::error::Error::source(failure) {
                write!(f, ": {source:#}")?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for AggregateFailure {}

#[derive(Debug, Error)]
pub enum ReduceError {
    #[error("failed to build worker pool")]
    Pool(#[from] rayon::ThreadPoolBuildError),

    #[error("reduction failed with {0}")]
    Aggregate(AggregateFailure),
}

impl ReduceError {
    /// Worker failures, empty when the pool itself could not be built.
    pub fn failures(&self) -> &[WorkerError] {
        match self {
            Self::Aggregate(aggregate) => aggregate.failures(),
            Self::Pool(_) => &[],
        }
    }
}

/// Bookkeeping defect in the diagnostics registry. Logged, never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiagnosticsFault {
    #[error("worker {worker}: no diagnostics entry to remove")]
    Missing { worker: usize },

    #[error("worker {worker}: diagnostics entry belongs to another registration")]
    Foreign { worker: usize },

    #[error("worker {worker}: diagnostics entry already registered")]
    Duplicate { worker: usize },
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn test_aggregate_lists_every_failure() {
        let aggregate = AggregateFailure::new(vec![
            WorkerError::Merge {
                partition: 2,
                source: anyhow!("overflow"),
            },
            WorkerError::Initialization {
                partition: 0,
                source: anyhow!("no seed"),
            },
        ]);

        assert_eq!(aggregate.len(), 2);
        assert_eq!(aggregate.failures()[0].partition(), 0);

        let message = ReduceError::Aggregate(aggregate).to_string();
        assert!(message.contains("2 worker failure(s)"));
        assert!(message.contains("overflow"));
        assert!(message.contains("no seed"));
    }
}
