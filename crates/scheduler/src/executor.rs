//! Bounded priority executors
//!
//! A fixed set of named worker threads pulls tasks from a shared priority
//! queue. The engine runs two of these: a single-worker pool for disk cache
//! I/O and a pool sized to the available parallelism for fetch and decode.

use std::collections::HashMap;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error};

use crate::cancel::CancellationToken;
use crate::lock;
use crate::priority::{Priority, PriorityQueue, TaskId};

/// Unit of work run by an executor.
///
/// The token is cancelled if the task's owner gives up on it while it runs;
/// checking it is up to the task.
pub type Task = Box<dyn FnOnce(&CancellationToken) + Send + 'static>;

/// Configuration for a priority executor.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Thread name prefix
    pub name: String,

    /// Number of worker threads to spawn.
    pub num_workers: usize,

    /// Maximum time an idle worker waits before re-checking for shutdown.
    /// Default: 100ms.
    pub poll_interval: Duration,
}

impl ExecutorConfig {
    pub fn new(name: impl Into<String>, num_workers: usize) -> Self {
        Self {
            name: name.into(),
            num_workers: num_workers.max(1),
            poll_interval: Duration::from_millis(100),
        }
    }

    /// Single worker; disk I/O serializes well.
    pub fn for_disk_cache() -> Self {
        Self::new("imgload-disk-cache", 1)
    }

    /// One worker per logical core for fetch and decode.
    pub fn for_source() -> Self {
        Self::new("imgload-source", num_cpus())
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Executor statistics
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecutorStats {
    pub submitted: u64,
    pub completed: u64,
    /// Tasks dropped before they started
    pub cancelled: u64,
    pub queued: usize,
    pub running: usize,
}

/// What [`PriorityExecutor::cancel`] found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Removed from the queue; it will never run.
    Dequeued,
    /// Already running; only its token was cancelled.
    Signalled,
    /// Unknown, or already finished.
    NotFound,
}

impl CancelOutcome {
    pub fn is_found(self) -> bool {
        self != CancelOutcome::NotFound
    }
}

/// Handle to a submitted task
#[derive(Debug, Clone)]
pub struct TaskHandle {
    id: TaskId,
    token: CancellationToken,
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

struct Pending {
    task: Task,
    token: CancellationToken,
}

struct ExecutorState {
    queue: PriorityQueue<Pending>,
    running: HashMap<TaskId, CancellationToken>,
    stats: ExecutorStats,
}

struct Shared {
    state: Mutex<ExecutorState>,
    available: Condvar,
    shutdown: AtomicBool,
}

/// Worker pool executing tasks in priority order, FIFO within a tier.
///
/// # Example
///
/// ```
/// use std::sync::mpsc;
/// use imgload_scheduler::{ExecutorConfig, Priority, PriorityExecutor};
///
/// let executor = PriorityExecutor::new(ExecutorConfig::new("example", 2)).unwrap();
/// let (tx, rx) = mpsc::channel();
///
/// executor.submit(Priority::High, Box::new(move |_token| {
///     tx.send(42).unwrap();
/// }));
///
/// assert_eq!(rx.recv().unwrap(), 42);
/// executor.shutdown();
/// ```
pub struct PriorityExecutor {
    name: String,
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl PriorityExecutor {
    /// Spawn the worker threads.
    pub fn new(config: ExecutorConfig) -> io::Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(ExecutorState {
                queue: PriorityQueue::new(),
                running: HashMap::new(),
                stats: ExecutorStats::default(),
            }),
            available: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });

        let mut workers = Vec::with_capacity(config.num_workers);
        for id in 0..config.num_workers {
            let worker_shared = shared.clone();
            let poll_interval = config.poll_interval;
            let spawned = thread::Builder::new()
                .name(format!("{}-{}", config.name, id))
                .spawn(move || run_worker(worker_shared, poll_interval));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    shared.shutdown.store(true, Ordering::Release);
                    shared.available.notify_all();
                    for worker in workers {
                        let _ = worker.join();
                    }
                    return Err(e);
                }
            }
        }
        debug!("started executor {} with {} workers", config.name, workers.len());

        Ok(Self {
            name: config.name,
            shared,
            workers: Mutex::new(workers),
        })
    }

    /// Queue a task. After shutdown the task is dropped and the returned
    /// handle is already cancelled.
    pub fn submit(&self, priority: Priority, task: Task) -> TaskHandle {
        let token = CancellationToken::new();
        let mut state = lock(&self.shared.state);
        state.stats.submitted += 1;
        if self.is_shut_down() {
            token.cancel();
            state.stats.cancelled += 1;
            return TaskHandle { id: 0, token };
        }
        let id = state.queue.push(
            priority,
            Pending {
                task,
                token: token.clone(),
            },
        );
        drop(state);
        self.shared.available.notify_one();
        TaskHandle { id, token }
    }

    /// Cancel a task. A queued task is removed and never runs; a running
    /// task only has its token cancelled.
    pub fn cancel(&self, id: TaskId) -> CancelOutcome {
        let mut state = lock(&self.shared.state);
        if let Some(pending) = state.queue.remove(id) {
            pending.token.cancel();
            state.stats.cancelled += 1;
            // The task may own values whose drop re-enters this executor.
            drop(state);
            drop(pending);
            return CancelOutcome::Dequeued;
        }
        match state.running.get(&id) {
            Some(token) => {
                token.cancel();
                CancelOutcome::Signalled
            }
            None => CancelOutcome::NotFound,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_workers(&self) -> usize {
        lock(&self.workers).len()
    }

    pub fn queued(&self) -> usize {
        lock(&self.shared.state).queue.len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> ExecutorStats {
        let state = lock(&self.shared.state);
        ExecutorStats {
            queued: state.queue.len(),
            running: state.running.len(),
            ..state.stats
        }
    }

    /// Stop accepting work, drop queued tasks and wait for running ones.
    ///
    /// Safe to call more than once, and from one of this executor's own
    /// workers (that worker is not joined).
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        let dropped = {
            let mut state = lock(&self.shared.state);
            let dropped = state.queue.drain();
            state.stats.cancelled += dropped.len() as u64;
            for token in state.running.values() {
                token.cancel();
            }
            dropped
        };
        for pending in &dropped {
            pending.token.cancel();
        }
        // Tasks may own handles whose drop re-enters this executor.
        drop(dropped);
        self.shared.available.notify_all();

        let workers = std::mem::take(&mut *lock(&self.workers));
        let current = thread::current().id();
        for worker in workers {
            if worker.thread().id() == current {
                continue;
            }
            if worker.join().is_err() {
                error!("executor {} worker panicked", self.name);
            }
        }
    }
}

impl Drop for PriorityExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(shared: Arc<Shared>, poll_interval: Duration) {
    loop {
        let (id, pending) = {
            let mut state = lock(&shared.state);
            loop {
                if shared.shutdown.load(Ordering::Acquire) {
                    return;
                }
                // Popped and marked running together, so a cancel always finds it.
                if let Some((id, _, pending)) = state.queue.pop() {
                    state.running.insert(id, pending.token.clone());
                    break (id, pending);
                }
                state = shared
                    .available
                    .wait_timeout(state, poll_interval)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
            }
        };

        let Pending { task, token } = pending;
        let result = panic::catch_unwind(AssertUnwindSafe(|| task(&token)));
        if result.is_err() {
            error!("task {} panicked", id);
        }

        let mut state = lock(&shared.state);
        state.running.remove(&id);
        state.stats.completed += 1;
    }
}

/// Get the number of logical CPU cores.
fn num_cpus() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    fn single_worker() -> PriorityExecutor {
        PriorityExecutor::new(
            ExecutorConfig::new("test", 1).with_poll_interval(Duration::from_millis(10)),
        )
        .unwrap()
    }

    /// Occupy the only worker until the returned sender is used.
    fn block_worker(executor: &PriorityExecutor) -> mpsc::Sender<()> {
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        executor.submit(
            Priority::Immediate,
            Box::new(move |_| {
                started_tx.send(()).unwrap();
                let _ = release_rx.recv();
            }),
        );
        started_rx.recv().unwrap();
        release_tx
    }

    #[test]
    fn test_config_presets() {
        assert_eq!(ExecutorConfig::for_disk_cache().num_workers, 1);
        assert!(ExecutorConfig::for_source().num_workers >= 1);
        assert_eq!(ExecutorConfig::new("x", 0).num_workers, 1);
        let config = ExecutorConfig::new("x", 4).with_poll_interval(Duration::from_millis(5));
        assert_eq!(config.poll_interval, Duration::from_millis(5));
    }

    #[test]
    fn test_executes_tasks() {
        let executor = PriorityExecutor::new(ExecutorConfig::new("test", 2)).unwrap();
        assert_eq!(executor.num_workers(), 2);

        let executed = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel();
        for _ in 0..5 {
            let executed = executed.clone();
            let tx = tx.clone();
            executor.submit(
                Priority::Normal,
                Box::new(move |_| {
                    executed.fetch_add(1, Ordering::SeqCst);
                    tx.send(()).unwrap();
                }),
            );
        }
        for _ in 0..5 {
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        assert_eq!(executed.load(Ordering::SeqCst), 5);
        executor.shutdown();
        assert_eq!(executor.stats().completed, 5);
    }

    #[test]
    fn test_priority_then_fifo_ordering() {
        let executor = single_worker();
        let release = block_worker(&executor);

        let (tx, rx) = mpsc::channel();
        for (priority, label) in [
            (Priority::Low, "low"),
            (Priority::High, "high"),
            (Priority::Normal, "normal-1"),
            (Priority::Normal, "normal-2"),
        ] {
            let tx = tx.clone();
            executor.submit(priority, Box::new(move |_| tx.send(label).unwrap()));
        }
        release.send(()).unwrap();

        let order: Vec<_> = (0..4)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(order, vec!["high", "normal-1", "normal-2", "low"]);
    }

    #[test]
    fn test_cancelled_before_start_never_runs() {
        let executor = single_worker();
        let release = block_worker(&executor);

        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let handle = executor.submit(
            Priority::Normal,
            Box::new(move |_| flag.store(true, Ordering::SeqCst)),
        );
        assert_eq!(executor.queued(), 1);
        assert_eq!(executor.cancel(handle.id()), CancelOutcome::Dequeued);
        assert!(handle.is_cancelled());
        assert_eq!(executor.queued(), 0);

        let (tx, rx) = mpsc::channel();
        executor.submit(Priority::Low, Box::new(move |_| tx.send(()).unwrap()));
        release.send(()).unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();

        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(executor.stats().cancelled, 1);
    }

    #[test]
    fn test_cancel_running_task_sets_token() {
        let executor = single_worker();
        let (started_tx, started_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel();

        let handle = executor.submit(
            Priority::Normal,
            Box::new(move |token| {
                started_tx.send(()).unwrap();
                while !token.is_cancelled() {
                    thread::sleep(Duration::from_millis(1));
                }
                done_tx.send(()).unwrap();
            }),
        );
        started_rx.recv().unwrap();
        assert_eq!(executor.cancel(handle.id()), CancelOutcome::Signalled);
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn test_cancel_finished_task_returns_false() {
        let executor = single_worker();
        let (tx, rx) = mpsc::channel();
        let handle = executor.submit(Priority::Normal, Box::new(move |_| tx.send(()).unwrap()));
        rx.recv_timeout(Duration::from_secs(5)).unwrap();

        // Give the worker a moment to record completion.
        for _ in 0..100 {
            if executor.stats().completed == 1 {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(executor.cancel(handle.id()), CancelOutcome::NotFound);
        assert!(!CancelOutcome::NotFound.is_found());
    }

    #[test]
    fn test_started_task_is_always_found_by_cancel() {
        let executor = single_worker();
        for _ in 0..200 {
            let (started_tx, started_rx) = mpsc::channel();
            let handle = executor.submit(
                Priority::Normal,
                Box::new(move |token| {
                    started_tx.send(()).unwrap();
                    while !token.is_cancelled() {
                        thread::sleep(Duration::from_millis(1));
                    }
                }),
            );
            // Whenever the cancel lands, the task is either queued or running.
            let outcome = executor.cancel(handle.id());
            assert!(outcome.is_found(), "cancel missed task {}", handle.id());
            if outcome == CancelOutcome::Signalled {
                started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
            }
        }
    }

    #[test]
    fn test_panicking_task_does_not_kill_worker() {
        let executor = single_worker();
        executor.submit(Priority::Normal, Box::new(|_| panic!("boom")));

        let (tx, rx) = mpsc::channel();
        executor.submit(Priority::Normal, Box::new(move |_| tx.send(()).unwrap()));
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn test_submit_after_shutdown_is_cancelled() {
        let executor = single_worker();
        executor.shutdown();
        assert!(executor.is_shut_down());

        let handle = executor.submit(Priority::High, Box::new(|_| panic!("must not run")));
        assert!(handle.is_cancelled());
        executor.shutdown();
    }

    #[test]
    fn test_shutdown_drops_queued_tasks() {
        let executor = single_worker();
        let release = block_worker(&executor);

        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let handle = executor.submit(
            Priority::Normal,
            Box::new(move |_| flag.store(true, Ordering::SeqCst)),
        );

        // Release the blocker from another thread once shutdown has drained the queue.
        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            let _ = release.send(());
        });
        executor.shutdown();
        releaser.join().unwrap();

        assert!(handle.is_cancelled());
        assert!(!ran.load(Ordering::SeqCst));
    }
}
