//! In-flight work accounting.
//!
//! Materializations and queued reoptimizations each hold an
//! [`ActivityGuard`] while they run. Teardown waits on
//! [`ActivityTracker::wait_idle`] before it releases any code.

use std::sync::{Arc, Condvar, Mutex};

#[derive(Debug, Default)]
struct Inner {
    active: Mutex<usize>,
    idle: Condvar,
}

/// Counts work items that have started but not yet settled.
#[derive(Debug, Clone, Default)]
pub struct ActivityTracker {
    inner: Arc<Inner>,
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one unit of work. It settles when the guard is dropped.
    pub fn enter(&self) -> ActivityGuard {
        #[expect(clippy::unwrap_used, reason = "Mutex poisoning is unrecoverable")]
        let mut active = self.inner.active.lock().unwrap();
        *active = active.saturating_add(1);
        ActivityGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Number of unsettled work items.
    pub fn active(&self) -> usize {
        #[expect(clippy::unwrap_used, reason = "Mutex poisoning is unrecoverable")]
        let active = self.inner.active.lock().unwrap();
        *active
    }

    /// Block until every registered work item has settled.
    pub fn wait_idle(&self) {
        #[expect(clippy::unwrap_used, reason = "Mutex poisoning is unrecoverable")]
        let mut active = self.inner.active.lock().unwrap();
        while *active > 0 {
            #[expect(clippy::unwrap_used, reason = "Mutex poisoning is unrecoverable")]
            {
                active = self.inner.idle.wait(active).unwrap();
            }
        }
    }
}

/// Marks one unit of in-flight work.
#[derive(Debug)]
pub struct ActivityGuard {
    inner: Arc<Inner>,
}

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        // Never panic in drop; a poisoned lock still holds a valid count.
        let mut active = match self.inner.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *active = active.saturating_sub(1);
        if *active == 0 {
            self.inner.idle.notify_all();
        }
    }
}
