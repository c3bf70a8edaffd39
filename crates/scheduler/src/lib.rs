//! imgload scheduler library
//!
//! Priority tiers, cancellation tokens and the bounded worker pools that run
//! disk cache lookups and source fetches.
//!
//! Tasks run in priority order with FIFO ordering within each tier. A task
//! cancelled while still queued never runs; a running task only sees its
//! token flip.
//!
//! # Example
//!
//! ```
//! use std::sync::mpsc;
//! use imgload_scheduler::{ExecutorConfig, Priority, PriorityExecutor};
//!
//! let disk = PriorityExecutor::new(ExecutorConfig::for_disk_cache()).unwrap();
//! let (tx, rx) = mpsc::channel();
//!
//! let handle = disk.submit(Priority::Normal, Box::new(move |token| {
//!     if !token.is_cancelled() {
//!         tx.send("looked up").unwrap();
//!     }
//! }));
//!
//! assert_eq!(rx.recv().unwrap(), "looked up");
//! assert!(!handle.is_cancelled());
//! ```

mod cancel;
mod executor;
mod priority;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use cancel::CancellationToken;
pub use executor::{CancelOutcome, ExecutorConfig, ExecutorStats, PriorityExecutor, Task, TaskHandle};
pub use priority::{Priority, PriorityQueue, TaskId};

/// Lock a mutex, recovering the guard if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
