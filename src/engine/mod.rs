//! Parallel reduce with worker-local accumulators.
//!
//! The input is split into contiguous partitions (see [`ParallelProcessor`]).
//! Each partition runs on the rayon pool: `init` once, `fold` per item in
//! index order, then `finish` once under the merge lock. Merges land in a
//! staged aggregate that is only handed back when every partition succeeded.
//! After the first failure no further item is folded: running partitions
//! finish the item in hand and stop without merging, partitions not yet
//! started are skipped, and all failures are reported together.

use std::fmt::Debug;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use rayon::prelude::*;
use tracing::{debug, warn};

use crate::diagnostics::{notify, DiagnosticsRegistry, TickObserver, WorkerTick};
use crate::error::{AggregateFailure, DiagnosticsFault, ReduceError, WorkerError};
use crate::parallel::{ParallelProcessor, Partition};

#[derive(Debug, Clone, Default)]
pub struct ReduceConfig {
    /// Pool size. Defaults to the number of logical CPUs.
    pub workers: Option<usize>,
    /// Items per partition. Defaults to an even split across the pool.
    pub chunk_size: Option<usize>,
}

impl ReduceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = Some(chunk_size);
        self
    }
}

/// Timing of one merged partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionStats {
    pub id: usize,
    pub range: Range<usize>,
    pub elapsed: Duration,
}

impl PartitionStats {
    pub fn items(&self) -> usize {
        self.range.len()
    }
}

/// Outcome of a successful reduction.
#[derive(Debug)]
pub struct Reduction<A> {
    pub value: A,
    pub partitions: usize,
    pub items_folded: usize,
    pub elapsed: Duration,
    /// One entry per partition, ordered by id.
    pub partition_stats: Vec<PartitionStats>,
    pub diagnostics_faults: Vec<DiagnosticsFault>,
}

pub struct ReduceEngine {
    processor: ParallelProcessor,
    observer: Option<Arc<dyn TickObserver>>,
}

impl ReduceEngine {
    pub fn new(config: ReduceConfig) -> Self {
        Self {
            processor: ParallelProcessor::new(config.workers, config.chunk_size),
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: impl TickObserver + 'static) -> Self {
        self.observer = Some(Arc::new(observer));
        self
    }

    pub fn num_workers(&self) -> usize {
        self.processor.num_workers()
    }

    /// Folds `items` into `seed` and returns the merged aggregate.
    ///
    /// `finish` must combine contributions commutatively and associatively;
    /// the order in which partitions merge is unspecified.
    pub fn reduce<T, L, A, I, F, G>(
        &self,
        seed: A,
        items: &[T],
        init: I,
        fold: F,
        finish: G,
    ) -> Result<Reduction<A>, ReduceError>
    where
        T: Debug + Sync,
        A: Send,
        I: Fn() -> anyhow::Result<L> + Sync,
        F: Fn(&T, L) -> anyhow::Result<L> + Sync,
        G: Fn(&mut A, L) -> anyhow::Result<()> + Sync,
    {
        let started = Instant::now();

        if items.is_empty() {
            return Ok(Reduction {
                value: seed,
                partitions: 0,
                items_folded: 0,
                elapsed: started.elapsed(),
                partition_stats: Vec::new(),
                diagnostics_faults: Vec::new(),
            });
        }

        let partitions = self.processor.partition(items.len());
        let pool = self.processor.build_pool()?;
        debug!(
            items = items.len(),
            partitions = partitions.len(),
            workers = self.processor.num_workers(),
            "starting reduction"
        );

        let run = Run::new(seed);
        let worker = Worker {
            run: &run,
            items,
            init: &init,
            fold: &fold,
            finish: &finish,
            observer: self.observer.as_deref(),
        };

        pool.install(|| {
            partitions
                .par_iter()
                .with_max_len(1)
                .for_each(|partition| worker.process(partition));
        });

        let Run {
            staged,
            failures,
            faults,
            folded,
            stats,
            ..
        } = run;

        let failures = into_inner(failures);
        if !failures.is_empty() {
            return Err(ReduceError::Aggregate(AggregateFailure::new(failures)));
        }

        let mut partition_stats = into_inner(stats);
        partition_stats.sort_by_key(|stats| stats.id);

        Ok(Reduction {
            value: into_inner(staged),
            partitions: partitions.len(),
            items_folded: folded.into_inner(),
            elapsed: started.elapsed(),
            partition_stats,
            diagnostics_faults: into_inner(faults),
        })
    }
}

/// Shared state of one reduction. Dropped when `reduce` returns.
struct Run<A> {
    staged: Mutex<A>,
    failures: Mutex<Vec<WorkerError>>,
    faults: Mutex<Vec<DiagnosticsFault>>,
    stats: Mutex<Vec<PartitionStats>>,
    cancelled: AtomicBool,
    folded: AtomicUsize,
    registry: DiagnosticsRegistry,
}

impl<A> Run<A> {
    fn new(seed: A) -> Self {
        Self {
            staged: Mutex::new(seed),
            failures: Mutex::new(Vec::new()),
            faults: Mutex::new(Vec::new()),
            stats: Mutex::new(Vec::new()),
            cancelled: AtomicBool::new(false),
            folded: AtomicUsize::new(0),
            registry: DiagnosticsRegistry::new(),
        }
    }

    fn fail(&self, err: WorkerError) {
        warn!(partition = err.partition(), "worker failed: {err}");
        self.cancelled.store(true, Ordering::Release);
        lock(&self.failures).push(err);
    }

    fn fault(&self, fault: DiagnosticsFault) {
        warn!("diagnostics skipped: {fault}");
        lock(&self.faults).push(fault);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

struct Worker<'a, T, A, I, F, G> {
    run: &'a Run<A>,
    items: &'a [T],
    init: &'a I,
    fold: &'a F,
    finish: &'a G,
    observer: Option<&'a dyn TickObserver>,
}

impl<T, L, A, I, F, G> Worker<'_, T, A, I, F, G>
where
    T: Debug,
    I: Fn() -> anyhow::Result<L>,
    F: Fn(&T, L) -> anyhow::Result<L>,
    G: Fn(&mut A, L) -> anyhow::Result<()>,
{
    fn process(&self, partition: &Partition) {
        if self.run.is_cancelled() {
            debug!(partition = partition.id, "skipping partition after failure");
            return;
        }

        let started = Instant::now();
        let thread = std::thread::current();
        debug!(
            partition = partition.id,
            thread = thread.name().unwrap_or("unnamed"),
            items = partition.len(),
            "partition started"
        );

        let mut local = match (self.init)() {
            Ok(local) => local,
            Err(source) => {
                self.run.fail(WorkerError::Initialization {
                    partition: partition.id,
                    source,
                });
                return;
            }
        };

        for index in partition.range.clone() {
            if self.run.is_cancelled() {
                debug!(partition = partition.id, index, "stopping partition after failure");
                return;
            }
            local = match self.fold_item(partition.id, index, local) {
                Ok(local) => local,
                Err(err) => {
                    self.run.fail(err);
                    return;
                }
            };
        }

        let merged = {
            let mut staged = lock(&self.run.staged);
            (self.finish)(&mut *staged, local)
        };
        if let Err(source) = merged {
            self.run.fail(WorkerError::Merge {
                partition: partition.id,
                source,
            });
            return;
        }

        let elapsed = started.elapsed();
        debug!(partition = partition.id, ?elapsed, "partition merged");
        lock(&self.run.stats).push(PartitionStats {
            id: partition.id,
            range: partition.range.clone(),
            elapsed,
        });
    }

    fn fold_item(&self, worker: usize, index: usize, local: L) -> Result<L, WorkerError> {
        let item = &self.items[index];
        let registration = match self.run.registry.register(worker, index) {
            Ok(registration) => Some(registration),
            Err(fault) => {
                self.run.fault(fault);
                None
            }
        };

        let folded = (self.fold)(item, local);

        let elapsed = registration.and_then(|registration| {
            self.run
                .registry
                .complete(registration)
                .map_err(|fault| self.run.fault(fault))
                .ok()
        });

        let local = folded.map_err(|source| WorkerError::ItemProcessing {
            partition: worker,
            index,
            item: format!("{item:?}"),
            source,
        })?;
        self.run.folded.fetch_add(1, Ordering::Relaxed);

        if let Some(elapsed) = elapsed {
            debug!(worker, index, ?item, ?elapsed, "item folded");
            if let Some(observer) = self.observer {
                notify(
                    observer,
                    &WorkerTick {
                        worker,
                        item_index: index,
                        item,
                        elapsed,
                    },
                );
            }
        }

        Ok(local)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn into_inner<T>(mutex: Mutex<T>) -> T {
    mutex.into_inner().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;

    const INPUT: [i32; 8] = [4, 1, 6, 2, 9, 5, 10, 3];

    fn sum(engine: &ReduceEngine, items: &[i32]) -> Result<Reduction<i64>, ReduceError> {
        engine.reduce(
            0i64,
            items,
            || Ok(0i64),
            |&n, local| Ok(local + i64::from(n)),
            |total, local| {
                *total += local;
                Ok(())
            },
        )
    }

    #[test]
    fn test_sum_of_demo_input() {
        let engine = ReduceEngine::new(ReduceConfig::new().workers(2));
        let reduction = sum(&engine, &INPUT).unwrap();

        assert_eq!(reduction.value, 40);
        assert_eq!(reduction.partitions, 2);
        assert_eq!(reduction.items_folded, 8);
        assert!(reduction.diagnostics_faults.is_empty());

        let ranges: Vec<_> = reduction
            .partition_stats
            .iter()
            .map(|stats| (stats.id, stats.range.clone()))
            .collect();
        assert_eq!(ranges, vec![(0, 0..4), (1, 4..8)]);
        assert!(reduction.partition_stats.iter().all(|stats| stats.items() == 4));
    }

    #[test]
    fn test_colliding_diagnostics_entry_does_not_stop_folding() {
        let run = Run::new(0i64);
        let ticks = AtomicUsize::new(0);

        // Another registration already holds worker 0's slot.
        let held = run.registry.register(0, usize::MAX).unwrap();

        let init = || -> anyhow::Result<i64> { Ok(0) };
        let fold = |&n: &i32, local: i64| -> anyhow::Result<i64> { Ok(local + i64::from(n)) };
        let finish = |total: &mut i64, local: i64| -> anyhow::Result<()> {
            *total += local;
            Ok(())
        };
        let observer = |_tick: &WorkerTick<'_>| -> anyhow::Result<()> {
            ticks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        };
        let worker = Worker {
            run: &run,
            items: &INPUT,
            init: &init,
            fold: &fold,
            finish: &finish,
            observer: Some(&observer as &dyn TickObserver),
        };

        worker.process(&Partition { id: 0, range: 0..3 });

        assert_eq!(*lock(&run.staged), 11);
        assert_eq!(run.folded.load(Ordering::SeqCst), 3);
        assert!(lock(&run.failures).is_empty());
        assert_eq!(
            *lock(&run.faults),
            vec![DiagnosticsFault::Duplicate { worker: 0 }; 3]
        );
        assert_eq!(ticks.load(Ordering::SeqCst), 0);
        assert_eq!(lock(&run.stats).len(), 1);

        // The colliding entry was never touched.
        run.registry.complete(held).unwrap();
        assert!(run.registry.is_idle());
    }

    #[test]
    fn test_running_partition_stops_at_next_item_after_failure() {
        let run = Run::new(0i64);
        let folds = AtomicUsize::new(0);

        let init = || -> anyhow::Result<i64> { Ok(0) };
        let fold = |&n: &i32, local: i64| -> anyhow::Result<i64> {
            folds.fetch_add(1, Ordering::SeqCst);
            // Another partition fails while this item is in hand.
            run.cancelled.store(true, Ordering::Release);
            Ok(local + i64::from(n))
        };
        let finish = |total: &mut i64, local: i64| -> anyhow::Result<()> {
            *total += local;
            Ok(())
        };
        let worker = Worker {
            run: &run,
            items: &INPUT,
            init: &init,
            fold: &fold,
            finish: &finish,
            observer: None,
        };

        worker.process(&Partition { id: 0, range: 0..8 });

        assert_eq!(folds.load(Ordering::SeqCst), 1);
        assert_eq!(*lock(&run.staged), 0);
        assert!(lock(&run.stats).is_empty());
        assert!(run.registry.is_idle());
    }

    #[test]
    fn test_empty_input_returns_seed_without_calling_back() {
        let engine = ReduceEngine::new(ReduceConfig::new().workers(4));
        let reduction = engine
            .reduce(
                17i64,
                &[] as &[i32],
                || -> anyhow::Result<i64> { panic!("init called") },
                |_, _| -> anyhow::Result<i64> { panic!("fold called") },
                |_, _| -> anyhow::Result<()> { panic!("finish called") },
            )
            .unwrap();

        assert_eq!(reduction.value, 17);
        assert_eq!(reduction.partitions, 0);
    }

    #[test]
    fn test_init_runs_once_per_partition() {
        let inits = AtomicUsize::new(0);
        let engine = ReduceEngine::new(ReduceConfig::new().workers(2).chunk_size(3));

        let reduction = engine
            .reduce(
                Vec::new(),
                &INPUT,
                || {
                    inits.fetch_add(1, Ordering::SeqCst);
                    Ok(Vec::new())
                },
                |&n, mut local: Vec<i32>| {
                    local.push(n);
                    Ok(local)
                },
                |all: &mut Vec<Vec<i32>>, local| {
                    all.push(local);
                    Ok(())
                },
            )
            .unwrap();

        assert_eq!(inits.load(Ordering::SeqCst), 3);

        // Within a partition items are folded in index order.
        let mut chunks = reduction.value;
        chunks.sort();
        assert_eq!(chunks, vec![vec![2, 9, 5], vec![4, 1, 6], vec![10, 3]]);
    }

    #[test]
    fn test_merge_failure_discards_staged_aggregate() {
        let engine = ReduceEngine::new(ReduceConfig::new().workers(4));
        let err = engine
            .reduce(
                0i64,
                &INPUT,
                || Ok(0i64),
                |&n, local| Ok(local + i64::from(n)),
                |_total: &mut i64, local| {
                    if local > 10 {
                        bail!("local sum {local} too large");
                    }
                    Ok(())
                },
            )
            .unwrap_err();

        assert!(!err.failures().is_empty());
        assert!(err
            .failures()
            .iter()
            .all(|failure| matches!(failure, WorkerError::Merge { .. })));
    }
}
