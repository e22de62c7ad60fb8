//! Shared worker pool for background tasks
//!
//! All engine maintenance runs here: MVCC cleanup sweeps, coalesced cache
//! dumps, shard retirement, and spin-down monitors. User-initiated operations
//! stay on caller threads. Tasks are cancelled through tokens observed by the
//! task closure, never by unwinding out of the task body.

use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::{Result, XFlatError};

/// What a periodic task wants to happen after a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskControl {
    /// Run again after the configured delay.
    Continue,
    /// Stop; the task's handle completes.
    Stop,
}

// ============================================================================
// Task Handle
// ============================================================================

enum TaskState {
    Pending,
    /// Finished; `Some` carries the failure message of the final run.
    Finished(Option<String>),
}

struct TaskShared {
    cancelled: AtomicBool,
    state: Mutex<TaskState>,
    done: Condvar,
}

impl TaskShared {
    fn finish(&self, error: Option<String>) {
        let mut state = self.state.lock();
        *state = TaskState::Finished(error);
        self.done.notify_all();
    }
}

/// Handle to a scheduled task. Cloneable; any clone can cancel the task or
/// wait for it to complete.
#[derive(Clone)]
pub struct TaskHandle {
    shared: Arc<TaskShared>,
}

impl TaskHandle {
    fn new() -> Self {
        Self {
            shared: Arc::new(TaskShared {
                cancelled: AtomicBool::new(false),
                state: Mutex::new(TaskState::Pending),
                done: Condvar::new(),
            }),
        }
    }

    /// Request cancellation. Takes effect the next time the pool picks the
    /// task up; an in-flight run is not interrupted.
    pub fn cancel(&self) {
        self.shared.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::SeqCst)
    }

    /// Whether the task has completed (finished, stopped, or was cancelled
    /// and subsequently retired).
    pub fn is_done(&self) -> bool {
        matches!(*self.shared.state.lock(), TaskState::Finished(_))
    }

    /// Block until the task completes, surfacing the failure of its final
    /// run if there was one.
    pub fn wait(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        loop {
            match &*state {
                TaskState::Finished(None) => return Ok(()),
                TaskState::Finished(Some(msg)) => return Err(XFlatError::Internal(msg.clone())),
                TaskState::Pending => self.shared.done.wait(&mut state),
            }
        }
    }
}

// ============================================================================
// Scheduled Jobs
// ============================================================================

enum JobKind {
    Once(Box<dyn FnOnce() -> Result<()> + Send>),
    Periodic {
        delay: Duration,
        run: Box<dyn FnMut() -> TaskControl + Send>,
    },
}

struct ScheduledJob {
    run_at: Instant,
    seq: u64,
    kind: JobKind,
    shared: Arc<TaskShared>,
}

impl PartialEq for ScheduledJob {
    fn eq(&self, other: &Self) -> bool {
        self.run_at == other.run_at && self.seq == other.seq
    }
}
impl Eq for ScheduledJob {}

impl PartialOrd for ScheduledJob {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

// BinaryHeap is a max-heap; invert so the earliest deadline pops first.
impl Ord for ScheduledJob {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .run_at
            .cmp(&self.run_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

// ============================================================================
// Task Pool
// ============================================================================

struct PoolInner {
    queue: Mutex<BinaryHeap<ScheduledJob>>,
    available: Condvar,
    shutdown: AtomicBool,
    next_seq: AtomicU64,
}

/// A fixed set of worker threads executing delayed and periodic jobs.
pub struct TaskPool {
    inner: Arc<PoolInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskPool {
    /// Create a pool with the given number of worker threads.
    pub fn new(workers: usize) -> Self {
        let inner = Arc::new(PoolInner {
            queue: Mutex::new(BinaryHeap::new()),
            available: Condvar::new(),
            shutdown: AtomicBool::new(false),
            next_seq: AtomicU64::new(0),
        });

        let handles = (0..workers.max(1))
            .map(|i| {
                let inner = Arc::clone(&inner);
                thread::Builder::new()
                    .name(format!("xflat-worker-{}", i))
                    .spawn(move || worker_loop(inner))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        Self {
            inner,
            workers: Mutex::new(handles),
        }
    }

    /// Schedule a one-shot job to run after `delay`.
    pub fn schedule<F>(&self, delay: Duration, job: F) -> TaskHandle
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let handle = TaskHandle::new();
        self.push(ScheduledJob {
            run_at: Instant::now() + delay,
            seq: self.inner.next_seq.fetch_add(1, Ordering::Relaxed),
            kind: JobKind::Once(Box::new(job)),
            shared: Arc::clone(&handle.shared),
        });
        handle
    }

    /// Schedule a periodic job: first run after `initial`, then `delay`
    /// after the end of each run, until the closure returns [`TaskControl::Stop`]
    /// or the handle is cancelled.
    pub fn schedule_with_fixed_delay<F>(
        &self,
        initial: Duration,
        delay: Duration,
        job: F,
    ) -> TaskHandle
    where
        F: FnMut() -> TaskControl + Send + 'static,
    {
        let handle = TaskHandle::new();
        self.push(ScheduledJob {
            run_at: Instant::now() + initial,
            seq: self.inner.next_seq.fetch_add(1, Ordering::Relaxed),
            kind: JobKind::Periodic {
                delay,
                run: Box::new(job),
            },
            shared: Arc::clone(&handle.shared),
        });
        handle
    }

    fn push(&self, job: ScheduledJob) {
        let mut queue = self.inner.queue.lock();
        queue.push(job);
        self.inner.available.notify_one();
    }

    /// Stop accepting work and join the workers. Pending jobs are dropped.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.available.notify_all();
        let handles = std::mem::take(&mut *self.workers.lock());
        for handle in handles {
            let _ = handle.join();
        }
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(inner: Arc<PoolInner>) {
    loop {
        let job = {
            let mut queue = inner.queue.lock();
            loop {
                if inner.shutdown.load(Ordering::SeqCst) {
                    return;
                }
                match queue.peek().map(|j| j.run_at) {
                    Some(run_at) if run_at <= Instant::now() => {
                        break queue.pop().expect("peeked job vanished");
                    }
                    Some(run_at) => {
                        inner.available.wait_until(&mut queue, run_at);
                    }
                    None => {
                        inner.available.wait(&mut queue);
                    }
                }
            }
        };

        let ScheduledJob {
            seq, kind, shared, ..
        } = job;

        if shared.cancelled.load(Ordering::SeqCst) {
            shared.finish(None);
            continue;
        }

        match kind {
            JobKind::Once(run) => {
                let result = run();
                shared.finish(result.err().map(|e| e.to_string()));
            }
            JobKind::Periodic { delay, mut run } => match run() {
                TaskControl::Continue => {
                    let mut queue = inner.queue.lock();
                    queue.push(ScheduledJob {
                        run_at: Instant::now() + delay,
                        seq,
                        kind: JobKind::Periodic { delay, run },
                        shared,
                    });
                    inner.available.notify_one();
                }
                TaskControl::Stop => shared.finish(None),
            },
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    #[test]
    fn test_schedule_runs_once() {
        let pool = TaskPool::new(2);
        let (tx, rx) = mpsc::channel();

        let handle = pool.schedule(Duration::from_millis(10), move || {
            tx.send(42).unwrap();
            Ok(())
        });

        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 42);
        handle.wait().unwrap();
        assert!(handle.is_done());
    }

    #[test]
    fn test_schedule_surfaces_error() {
        let pool = TaskPool::new(1);
        let handle = pool.schedule(Duration::from_millis(1), || {
            Err(XFlatError::Internal("boom".to_string()))
        });

        let err = handle.wait().unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_periodic_runs_until_stop() {
        let pool = TaskPool::new(2);
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::clone(&count);

        let handle =
            pool.schedule_with_fixed_delay(Duration::from_millis(1), Duration::from_millis(1), move || {
                if count2.fetch_add(1, Ordering::SeqCst) + 1 >= 3 {
                    TaskControl::Stop
                } else {
                    TaskControl::Continue
                }
            });

        handle.wait().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_cancel_before_run() {
        let pool = TaskPool::new(1);
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = Arc::clone(&ran);

        let handle = pool.schedule(Duration::from_millis(100), move || {
            ran2.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        handle.cancel();
        handle.wait().unwrap();

        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_shutdown_joins_workers() {
        let pool = TaskPool::new(2);
        pool.schedule(Duration::from_millis(1), || Ok(()));
        std::thread::sleep(Duration::from_millis(50));
        pool.shutdown();
    }
}
