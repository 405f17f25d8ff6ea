//! Parallel reduce over a fixed input with worker-local accumulators.
//!
//! ```
//! use parfold::{ReduceConfig, ReduceEngine};
//!
//! let engine = ReduceEngine::new(ReduceConfig::new().workers(2));
//! let sum = engine
//!     .reduce(
//!         0i32,
//!         &[4, 1, 6, 2, 9, 5, 10, 3],
//!         || Ok(0i32),
//!         |n, local| Ok(local + n),
//!         |total, local| {
//!             *total += local;
//!             Ok(())
//!         },
//!     )
//!     .unwrap();
//! assert_eq!(sum.value, 40);
//! ```

pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod io;
pub mod parallel;

pub use diagnostics::{TickObserver, WorkerTick};
pub use engine::{PartitionStats, ReduceConfig, ReduceEngine, Reduction};
pub use error::{AggregateFailure, DiagnosticsFault, ReduceError, WorkerError};
