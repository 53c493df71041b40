use crate::config::RunConfig;
use crate::coordinator::InFlight;
use crate::probe::{NetProbe, Probe};
use crate::retry;
use crate::types::{ProbeTask, ScanEntry, ScanResults};
use ::time::{format_description::well_known, OffsetDateTime};
use anyhow::{Context, Result};
use std::future::Future;
use std::io::Write;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type JobQueue = Arc<Mutex<mpsc::Receiver<ProbeTask>>>;

/// Probes every (port, kind) combination in a [`RunConfig`] with a fixed pool of workers.
///
/// - A producer enumerates tasks into a bounded job queue.
/// - `workers` tasks pull from it, apply the retry policy, and push into a bounded
///   result queue.
/// - The caller's future drains results, prints them through the display filter
///   and builds the [`ScanResults`] report.
///
/// Every queue operation races the cancellation token, so cancelling never leaves a
/// participant blocked on a full or empty queue.
#[derive(Debug)]
pub struct Scanner<P> {
    config: Arc<RunConfig>,
    probe: Arc<P>,
}

impl Scanner<NetProbe> {
    pub fn new(config: RunConfig) -> Self {
        let probe = NetProbe::from_config(&config);
        Self::with_probe(config, probe)
    }
}

impl<P: Probe> Scanner<P> {
    pub fn with_probe(config: RunConfig, probe: P) -> Self {
        Self {
            config: Arc::new(config),
            probe: Arc::new(probe),
        }
    }

    pub fn probe(&self) -> &P {
        &self.probe
    }

    /// Run the scan, writing one line per displayed result to `out`.
    ///
    /// Returns once every task has been reported, or promptly after `cancel` fires.
    /// A failure in any participant cancels the rest and is returned.
    pub async fn run<W: Write>(
        &self,
        cancel: CancellationToken,
        out: &mut W,
    ) -> Result<ScanResults> {
        let cancel = cancel.child_token();
        let depth = self.config.queue_depth.max(1);
        let inflight = Arc::new(InFlight::new());
        let enumerated = CancellationToken::new();
        let settled = CancellationToken::new();

        let (job_tx, job_rx) = mpsc::channel::<ProbeTask>(depth);
        let job_rx: JobQueue = Arc::new(Mutex::new(job_rx));
        let (result_tx, mut result_rx) = mpsc::channel::<ProbeTask>(depth);

        let mut set = JoinSet::new();
        spawn_guarded(
            &mut set,
            &cancel,
            produce(
                self.config.clone(),
                inflight.clone(),
                job_tx,
                cancel.clone(),
                enumerated.clone(),
            ),
        );
        spawn_guarded(
            &mut set,
            &cancel,
            supervise(inflight.clone(), enumerated, settled.clone(), cancel.clone()),
        );
        for id in 0..self.config.workers.max(1) {
            spawn_guarded(
                &mut set,
                &cancel,
                work(
                    id,
                    self.probe.clone(),
                    self.config.clone(),
                    job_rx.clone(),
                    result_tx.clone(),
                    cancel.clone(),
                ),
            );
        }
        drop(result_tx);
        drop(job_rx);

        debug!(
            "start probing {}: {} ports, {} tasks, {} workers",
            self.config.host,
            self.config.ports.len(),
            self.config.total_tasks(),
            self.config.workers
        );

        let collected = self
            .collect(&mut result_rx, &inflight, &settled, &cancel, out)
            .await;
        if collected.is_err() {
            cancel.cancel();
        }
        drop(result_rx);

        let mut first_err = None;
        while let Some(joined) = set.join_next().await {
            let res = joined.context("scan task panicked").and_then(|r| r);
            if let Err(e) = res {
                first_err.get_or_insert(e);
            }
        }

        let results = collected?;
        match first_err {
            Some(e) => Err(e),
            None => Ok(results),
        }
    }

    /// Drain results until the supervisor reports everything settled, the result
    /// queue closes, or the run is cancelled.
    async fn collect<W: Write>(
        &self,
        results: &mut mpsc::Receiver<ProbeTask>,
        inflight: &InFlight,
        settled: &CancellationToken,
        cancel: &CancellationToken,
        out: &mut W,
    ) -> Result<ScanResults> {
        let display = self.config.display;
        let mut report = ScanResults {
            scanned_total: self.config.total_tasks(),
            ..ScanResults::default()
        };

        loop {
            let task = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    report.cancelled = true;
                    break;
                }
                next = results.recv() => match next {
                    Some(task) => task,
                    None => break,
                },
                _ = settled.cancelled() => break,
            };

            let open = task.is_open();
            if open && display.open {
                writeln!(out, "OPEN {} {}", task.kind, task.port).context("writing result")?;
            } else if !open && display.closed {
                writeln!(out, "CLOSED {} {}", task.kind, task.port).context("writing result")?;
            }

            report.scanned_done += 1;
            if open {
                report.open_count += 1;
            }
            report.entries.push(ScanEntry {
                kind: task.kind,
                port: task.port,
                open,
                attempts: task.attempt,
                timestamp: now_iso_like(),
            });
            inflight.done();
        }
        out.flush().context("flushing results")?;

        if report.cancelled {
            warn!(
                "scan cancelled after {} of {} results",
                report.scanned_done, report.scanned_total
            );
        } else {
            info!(
                "scan finished: {} open of {} results",
                report.open_count, report.scanned_done
            );
        }
        Ok(report)
    }
}

/// Spawn a participant; if it fails, cancel everyone else.
fn spawn_guarded<F>(set: &mut JoinSet<Result<()>>, cancel: &CancellationToken, fut: F)
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    let cancel = cancel.clone();
    set.spawn(async move {
        let res = fut.await;
        if res.is_err() {
            cancel.cancel();
        }
        res
    });
}

/// Enumerate ports x kinds into the job queue. Dropping `jobs` on return closes it.
async fn produce(
    config: Arc<RunConfig>,
    inflight: Arc<InFlight>,
    jobs: mpsc::Sender<ProbeTask>,
    cancel: CancellationToken,
    enumerated: CancellationToken,
) -> Result<()> {
    let kinds = config.kinds();
    let mut sent = 0u64;
    'ports: for &port in &config.ports {
        for &kind in &kinds {
            inflight.add();
            let task = ProbeTask::new(kind, port);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("producer cancelled after {sent} tasks");
                    break 'ports;
                }
                res = jobs.send(task) => {
                    if res.is_err() {
                        debug!("job queue closed by workers after {sent} tasks");
                        break 'ports;
                    }
                    sent += 1;
                }
            }
        }
    }
    drop(jobs);
    enumerated.cancel();
    Ok(())
}

/// Close the result stream once enumeration is over and nothing is in flight.
async fn supervise(
    inflight: Arc<InFlight>,
    enumerated: CancellationToken,
    settled: CancellationToken,
    cancel: CancellationToken,
) -> Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = async {
            enumerated.cancelled().await;
            inflight.wait_idle().await;
        } => {
            debug!("all tasks settled");
            settled.cancel();
        }
    }
    Ok(())
}

async fn work<P: Probe>(
    id: usize,
    probe: Arc<P>,
    config: Arc<RunConfig>,
    jobs: JobQueue,
    results: mpsc::Sender<ProbeTask>,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = async { jobs.lock().await.recv().await } => next,
        };
        let Some(mut task) = next else {
            break;
        };

        retry::settle(&*probe, &mut task, config.retry, config.multi, &cancel).await;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            res = results.send(task) => {
                if res.is_err() {
                    break;
                }
            }
        }
    }
    debug!("worker {id} exiting");
    Ok(())
}

fn now_iso_like() -> String {
    let now = OffsetDateTime::now_utc();
    now.format(&well_known::Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}
