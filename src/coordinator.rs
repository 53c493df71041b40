use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Notify;

/// Counts tasks that have been created but whose results were not yet consumed.
///
/// A closed job queue only means nothing more will be sent; this tells the engine
/// when every task has actually been settled.
#[derive(Debug, Default)]
pub struct InFlight {
    count: AtomicU64,
    idle: Notify,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one new task.
    pub fn add(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    /// Mark one task's result as consumed.
    pub fn done(&self) {
        let prev = self.count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "InFlight::done called more times than add");
        if prev == 1 {
            self.idle.notify_waiters();
        }
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Acquire)
    }

    /// Resolves once the count is zero.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            // Register before checking so a concurrent `done` cannot be missed.
            notified.as_mut().enable();
            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }
}
