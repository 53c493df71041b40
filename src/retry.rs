use tokio_util::sync::CancellationToken;

use crate::probe::Probe;
use crate::types::{Outcome, ProbeKind, ProbeTask};

/// Where a task stands in the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    Pending,
    /// Running attempt `n`, counted from 1.
    Attempt(u32),
    Open,
    Closed,
}

impl RetryState {
    /// Transition once the current attempt's probe batch has finished.
    pub fn after_batch(self, open: bool, retry: u32) -> Self {
        match self {
            RetryState::Pending => RetryState::Attempt(1),
            RetryState::Attempt(_) if open => RetryState::Open,
            RetryState::Attempt(n) if n < retry => RetryState::Attempt(n + 1),
            RetryState::Attempt(_) => RetryState::Closed,
            done => done,
        }
    }
}

/// Run `multi` sequential probes; the batch is open only if every one is.
///
/// The first closed probe, or a cancellation observed between probes, ends the
/// batch as closed.
pub async fn probe_batch<P: Probe>(
    probe: &P,
    kind: ProbeKind,
    port: u16,
    multi: u32,
    cancel: &CancellationToken,
) -> bool {
    for _ in 0..multi.max(1) {
        if cancel.is_cancelled() {
            return false;
        }
        if !probe.probe(kind, port).await {
            return false;
        }
    }
    true
}

/// Drive `task` through the retry policy and record its final outcome.
pub async fn settle<P: Probe>(
    probe: &P,
    task: &mut ProbeTask,
    retry: u32,
    multi: u32,
    cancel: &CancellationToken,
) {
    let retry = retry.max(1);
    let mut state = RetryState::Pending.after_batch(false, retry);
    while let RetryState::Attempt(n) = state {
        task.attempt = n;
        let open = probe_batch(probe, task.kind, task.port, multi, cancel).await;
        state = if cancel.is_cancelled() && !open {
            RetryState::Closed
        } else {
            state.after_batch(open, retry)
        };
    }
    task.outcome = if state == RetryState::Open {
        Outcome::Open
    } else {
        Outcome::Closed
    };
}
