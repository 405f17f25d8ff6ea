use std::ops::Range;

use rayon::{ThreadPool, ThreadPoolBuildError, ThreadPoolBuilder};

/// Contiguous slice of the input handed to exactly one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub id: usize,
    pub range: Range<usize>,
}

impl Partition {
    pub fn len(&self) -> usize {
        self.range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }
}

pub struct ParallelProcessor {
    num_workers: usize,
    chunk_size: Option<usize>,
}

impl ParallelProcessor {
    pub fn new(num_workers: Option<usize>, chunk_size: Option<usize>) -> Self {
        let num_workers = num_workers.unwrap_or_else(num_cpus::get).max(1);
        let chunk_size = chunk_size.map(|size| size.max(1));

        Self {
            num_workers,
            chunk_size,
        }
    }

    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    /// Items per partition for an input of `len` items.
    ///
    /// Without an explicit chunk size the input is split into at most
    /// `num_workers` balanced partitions.
    pub fn chunk_size(&self, len: usize) -> usize {
        self.chunk_size
            .unwrap_or_else(|| len.div_ceil(self.num_workers))
            .max(1)
    }

    pub fn partition(&self, len: usize) -> Vec<Partition> {
        let chunk = self.chunk_size(len);

        (0..len)
            .step_by(chunk)
            .enumerate()
            .map(|(id, start)| Partition {
                id,
                range: start..(start + chunk).min(len),
            })
            .collect()
    }

    pub fn build_pool(&self) -> Result<ThreadPool, ThreadPoolBuildError> {
        ThreadPoolBuilder::new()
            .num_threads(self.num_workers)
            .thread_name(|index| format!("parfold-worker-{index}"))
            .build()
    }
}
