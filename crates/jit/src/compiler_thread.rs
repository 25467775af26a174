//! Background recompilation workers.
//!
//! A fixed pool of threads drains a shared queue of requests. Tripping the
//! reoptimization threshold only enqueues a request, so the calling thread
//! never waits for the recompile. The pool size bounds how many
//! recompilations run at once.

use std::sync::Arc;
use std::thread;

use crossbeam::channel::{self, Receiver, Sender};
use tracing::error;

use crate::activity::{ActivityGuard, ActivityTracker};

/// A queued request plus the guard that keeps it visible to teardown.
struct Queued<R> {
    request: R,
    _activity: ActivityGuard,
}

/// Handle to the background worker threads.
///
/// On `Drop` (or [`CompilerThreadPool::shutdown`]) the sender is closed, the
/// workers finish every request already queued, and the threads are joined.
pub struct CompilerThreadPool<R: Send + 'static> {
    sender: Option<Sender<Queued<R>>>,
    handles: Vec<thread::JoinHandle<()>>,
    activity: ActivityTracker,
}

impl<R: Send + 'static> CompilerThreadPool<R> {
    /// Start `workers` threads (at least one) running `handler` for each
    /// request.
    ///
    /// Fails only if the OS refuses to spawn a thread.
    pub fn start<F>(workers: usize, activity: ActivityTracker, handler: F) -> std::io::Result<Self>
    where
        F: Fn(R) + Send + Sync + 'static,
    {
        let (sender, receiver) = channel::unbounded::<Queued<R>>();
        let handler = Arc::new(handler);
        let mut handles = Vec::new();
        for index in 0..workers.max(1) {
            let receiver: Receiver<Queued<R>> = receiver.clone();
            let handler = Arc::clone(&handler);
            let handle = thread::Builder::new()
                .name(format!("jit-reoptimizer-{index}"))
                .spawn(move || {
                    while let Ok(queued) = receiver.recv() {
                        handler(queued.request);
                        // guard dropped here, after the request settled
                    }
                })?;
            handles.push(handle);
        }
        Ok(Self {
            sender: Some(sender),
            handles,
            activity,
        })
    }

    /// Queue a request. Non-blocking.
    ///
    /// Returns `false` if the pool has been shut down.
    pub fn send(&self, request: R) -> bool {
        let Some(sender) = self.sender.as_ref() else {
            return false;
        };
        let queued = Queued {
            request,
            _activity: self.activity.enter(),
        };
        sender.send(queued).is_ok()
    }

    /// Number of worker threads.
    pub fn workers(&self) -> usize {
        self.handles.len()
    }

    /// Stop accepting requests, drain the queue and join every worker.
    ///
    /// Returns the names of workers that panicked.
    pub fn shutdown(&mut self) -> Vec<String> {
        drop(self.sender.take());
        let mut panicked = Vec::new();
        let current = thread::current().id();
        for handle in self.handles.drain(..) {
            let name = handle.thread().name().unwrap_or("jit-reoptimizer").to_owned();
            // A worker cannot join itself.
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                panicked.push(name);
            }
        }
        panicked
    }
}

impl<R: Send + 'static> Drop for CompilerThreadPool<R> {
    fn drop(&mut self) {
        for name in self.shutdown() {
            // Don't re-panic during drop (double panic = abort)
            error!(worker = %name, "JIT reoptimizer worker panicked");
        }
    }
}

impl<R: Send + 'static> std::fmt::Debug for CompilerThreadPool<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompilerThreadPool")
            .field("active", &self.sender.is_some())
            .field("workers", &self.handles.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn test_pool_processes_requests() {
        let count = Arc::new(AtomicU64::new(0));
        let count_clone = Arc::clone(&count);
        let activity = ActivityTracker::new();

        let pool = CompilerThreadPool::start(2, activity.clone(), move |n: u64| {
            count_clone.fetch_add(n, Ordering::Relaxed);
        })
        .unwrap();
        assert_eq!(pool.workers(), 2);

        assert!(pool.send(1));
        assert!(pool.send(2));
        assert!(pool.send(3));

        activity.wait_idle();
        assert_eq!(count.load(Ordering::Relaxed), 6);
    }

    #[test]
    fn test_pool_drains_on_drop() {
        let count = Arc::new(AtomicU64::new(0));
        let count_clone = Arc::clone(&count);

        let pool = CompilerThreadPool::start(1, ActivityTracker::new(), move |_: ()| {
            std::thread::sleep(std::time::Duration::from_millis(10));
            count_clone.fetch_add(1, Ordering::Relaxed);
        })
        .unwrap();
        for _ in 0..5 {
            assert!(pool.send(()));
        }

        // Drop joins the workers after the queue is drained
        drop(pool);
        assert_eq!(count.load(Ordering::Relaxed), 5);
    }

    #[test]
    fn test_send_after_shutdown_fails() {
        let mut pool = CompilerThreadPool::start(1, ActivityTracker::new(), |_: ()| {}).unwrap();
        assert!(pool.shutdown().is_empty());
        assert!(!pool.send(()));
    }

    #[test]
    fn test_zero_workers_still_starts_one() {
        let pool = CompilerThreadPool::start(0, ActivityTracker::new(), |_: ()| {}).unwrap();
        assert_eq!(pool.workers(), 1);
    }
}
