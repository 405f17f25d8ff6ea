//! Per-item worker diagnostics.
//!
//! A worker registers itself before folding an item and completes its own
//! [`Registration`] afterwards. The registration is an owned ticket that never
//! leaves the worker, so elapsed time is always measured from the worker's own
//! start instant and removal can only ever target the entry that worker
//! inserted. The shared registry only exists so in-flight work can be
//! observed; a mismatch there is reported as a [`DiagnosticsFault`].

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::warn;

use crate::error::DiagnosticsFault;

/// Logical worker identity. Unique per partition within one reduction.
pub type WorkerId = usize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerDiagnostics {
    pub worker: WorkerId,
    pub item_index: usize,
    ticket: u64,
}

/// Proof that a worker inserted a diagnostics entry. Consumed on completion.
#[derive(Debug)]
pub struct Registration {
    worker: WorkerId,
    ticket: u64,
    started: Instant,
}

impl Registration {
    pub fn worker(&self) -> WorkerId {
        self.worker
    }
}

#[derive(Debug, Default)]
pub struct DiagnosticsRegistry {
    entries: Mutex<HashMap<WorkerId, WorkerDiagnostics>>,
    next_ticket: AtomicU64,
}

impl DiagnosticsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<WorkerId, WorkerDiagnostics>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(
        &self,
        worker: WorkerId,
        item_index: usize,
    ) -> Result<Registration, DiagnosticsFault> {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();

        let mut entries = self.entries();
        if entries.contains_key(&worker) {
            return Err(DiagnosticsFault::Duplicate { worker });
        }
        entries.insert(
            worker,
            WorkerDiagnostics {
                worker,
                item_index,
                ticket,
            },
        );

        Ok(Registration {
            worker,
            ticket,
            started,
        })
    }

    /// Removes the caller's own entry and returns the time since registration.
    pub fn complete(&self, registration: Registration) -> Result<Duration, DiagnosticsFault> {
        let worker = registration.worker;
        let mut entries = self.entries();

        match entries.get(&worker) {
            None => Err(DiagnosticsFault::Missing { worker }),
            Some(entry) if entry.ticket != registration.ticket => {
                Err(DiagnosticsFault::Foreign { worker })
            }
            Some(_) => {
                entries.remove(&worker);
                Ok(registration.started.elapsed())
            }
        }
    }

    pub fn in_flight(&self) -> Vec<WorkerDiagnostics> {
        let mut snapshot: Vec<_> = self.entries().values().cloned().collect();
        snapshot.sort_by_key(|entry| entry.worker);
        snapshot
    }

    pub fn is_idle(&self) -> bool {
        self.entries().is_empty()
    }
}

/// One folded item, as seen by a [`TickObserver`].
pub struct WorkerTick<'a> {
    pub worker: WorkerId,
    pub item_index: usize,
    pub item: &'a dyn fmt::Debug,
    pub elapsed: Duration,
}

impl fmt::Debug for WorkerTick<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerTick")
            .field("worker", &self.worker)
            .field("item_index", &self.item_index)
            .field("item", self.item)
            .field("elapsed", &self.elapsed)
            .finish()
    }
}

/// Observability hook invoked after every folded item.
///
/// Errors and panics are logged and dropped; they never reach the
/// reduction result.
pub trait TickObserver: Send + Sync {
    fn on_worker_tick(&self, tick: &WorkerTick<'_>) -> anyhow::Result<()>;
}

impl<F> TickObserver for F
where
    F: Fn(&WorkerTick<'_>) -> anyhow::Result<()> + Send + Sync,
{
    fn on_worker_tick(&self, tick: &WorkerTick<'_>) -> anyhow::Result<()> {
        self(tick)
    }
}

pub(crate) fn notify(observer: &dyn TickObserver, tick: &WorkerTick<'_>) {
    match panic::catch_unwind(AssertUnwindSafe(|| observer.on_worker_tick(tick))) {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(
            worker = tick.worker,
            item_index = tick.item_index,
            "tick observer failed: {err:#}"
        ),
        Err(payload) => warn!(
            worker = tick.worker,
            item_index = tick.item_index,
            "tick observer panicked: {}",
            panic_message(payload.as_ref())
        ),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
