//! Lifecycle controller: one root cancellation token, one cycle at a time,
//! and a hard shutdown deadline.
//!
//! Shutdown order:
//! 1. mark the controller as shutting down so no new cycle starts,
//! 2. cancel the root token every file-task observes,
//! 3. wait up to `shutdown_deadline` for the running cycle to drain,
//! 4. past the deadline, abort the cycle, record its unfinished files as
//!    failed and audit that summary. The store only ever receives whole change sets, so an aborted
//!    cycle leaves nothing half-applied.

use std::fmt;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use slotsync_core::CycleSummary;
use slotsync_notifier::Notifier;
use slotsync_sync::{CycleError, SyncPipeline};
use tokio::sync::{mpsc, oneshot, watch, Mutex, RwLock};
use tokio::task::AbortHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::DaemonError;

// ---------------------------------------------------------------------------
// CycleRunner
// ---------------------------------------------------------------------------

/// What the controller drives. [`SyncPipeline`] in production.
#[async_trait]
pub trait CycleRunner: Send + Sync + 'static {
    async fn run_cycle(&self, cancel: &CancellationToken) -> Result<CycleSummary, CycleError>;

    /// Summary of the cycle in progress with every unfinished file counted
    /// as failed, persisted to the audit trail. `None` when idle.
    async fn abandon(&self) -> Option<CycleSummary>;
}

#[async_trait]
impl CycleRunner for SyncPipeline {
    async fn run_cycle(&self, cancel: &CancellationToken) -> Result<CycleSummary, CycleError> {
        SyncPipeline::run_cycle(self, cancel).await
    }

    async fn abandon(&self) -> Option<CycleSummary> {
        SyncPipeline::abandon(self).await
    }
}

// ---------------------------------------------------------------------------
// Triggers and jobs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    Interval,
    Watcher,
    Socket,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Interval => write!(f, "interval"),
            Trigger::Watcher => write!(f, "watcher"),
            Trigger::Socket => write!(f, "socket"),
        }
    }
}

/// A queued cycle request. `respond_to` is set when the requester waits for
/// the result.
#[derive(Debug)]
pub struct CycleJob {
    pub trigger: Trigger,
    pub respond_to: Option<oneshot::Sender<Result<CycleSummary, String>>>,
}

impl CycleJob {
    pub fn background(trigger: Trigger) -> Self {
        Self {
            trigger,
            respond_to: None,
        }
    }

    pub fn awaited(trigger: Trigger) -> (Self, oneshot::Receiver<Result<CycleSummary, String>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                trigger,
                respond_to: Some(tx),
            },
            rx,
        )
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Served by the socket's `status` command.
#[derive(Debug, Clone, Serialize)]
pub struct ControllerStatus {
    pub started_at: DateTime<Utc>,
    pub cycles_run: u64,
    pub cycle_running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_trigger: Option<Trigger>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_cycle_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_summary: Option<CycleSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub fatal: bool,
    pub shutting_down: bool,
}

/// How a shutdown went.
#[derive(Debug, Clone)]
pub struct ShutdownReport {
    /// The running cycle (if any) finished before the deadline.
    pub drained: bool,
    /// Present when a cycle was cut off at the deadline.
    pub abandoned: Option<CycleSummary>,
    pub elapsed: Duration,
}

// ---------------------------------------------------------------------------
// LifecycleController
// ---------------------------------------------------------------------------

/// State the spawned cycle task shares with the controller.
struct Shared {
    runner: Arc<dyn CycleRunner>,
    notifier: Arc<dyn Notifier>,
    /// Observed by every file-task; cancelled on shutdown or fatal cycle.
    root: CancellationToken,
    /// Cancelled once the shutdown deadline passes; bounds notification.
    kill: CancellationToken,
    status: RwLock<ControllerStatus>,
}

pub struct LifecycleController {
    shared: Arc<Shared>,
    shutdown_deadline: Duration,
    /// Held for the whole of a cycle so cycles never overlap.
    turn: Mutex<()>,
    busy: watch::Sender<bool>,
    in_flight: StdMutex<Option<AbortHandle>>,
}

/// Clears the busy flag however the cycle future ends.
struct BusyGuard<'a>(&'a watch::Sender<bool>);

impl<'a> BusyGuard<'a> {
    fn set(busy: &'a watch::Sender<bool>) -> Self {
        busy.send_replace(true);
        Self(busy)
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.send_replace(false);
    }
}

impl LifecycleController {
    pub fn new(
        runner: Arc<dyn CycleRunner>,
        notifier: Arc<dyn Notifier>,
        shutdown_deadline: Duration,
    ) -> Self {
        let (busy, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                runner,
                notifier,
                root: CancellationToken::new(),
                kill: CancellationToken::new(),
                status: RwLock::new(ControllerStatus {
                    started_at: Utc::now(),
                    cycles_run: 0,
                    cycle_running: false,
                    last_trigger: None,
                    last_cycle_at: None,
                    last_summary: None,
                    last_error: None,
                    fatal: false,
                    shutting_down: false,
                }),
            }),
            shutdown_deadline,
            turn: Mutex::new(()),
            busy,
            in_flight: StdMutex::new(None),
        }
    }

    /// The token every file-task observes.
    pub fn root_token(&self) -> CancellationToken {
        self.shared.root.clone()
    }

    pub fn shutdown_deadline(&self) -> Duration {
        self.shutdown_deadline
    }

    pub async fn status(&self) -> ControllerStatus {
        self.shared.status.read().await.clone()
    }

    /// Run cycles until shutdown: one per `interval` tick (the first tick
    /// fires immediately) plus one per job received on `jobs`.
    ///
    /// Returns [`DaemonError::Fatal`] after a systemic failure; no further
    /// cycles are started and queued jobs are refused.
    pub async fn run(
        &self,
        interval: Duration,
        mut jobs: mpsc::Receiver<CycleJob>,
    ) -> Result<(), DaemonError> {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut jobs_open = true;
        let mut result = Ok(());

        loop {
            let job = tokio::select! {
                biased;
                _ = self.shared.root.cancelled() => break,
                _ = ticker.tick() => CycleJob::background(Trigger::Interval),
                job = jobs.recv(), if jobs_open => match job {
                    Some(job) => job,
                    None => {
                        jobs_open = false;
                        continue;
                    }
                },
            };

            let trigger = job.trigger;
            let outcome = self.run_cycle(trigger).await;
            if let Some(tx) = job.respond_to {
                let reply = match &outcome {
                    Ok(summary) => Ok(summary.clone()),
                    Err(err) => Err(err.to_string()),
                };
                let _ = tx.send(reply);
            }
            match outcome {
                Ok(_) => {}
                Err(err @ DaemonError::Fatal { .. }) => {
                    result = Err(err);
                    break;
                }
                Err(DaemonError::ShuttingDown | DaemonError::Abandoned) => break,
                Err(err) => tracing::warn!(%trigger, error = %err, "cycle did not complete"),
            }
        }

        jobs.close();
        while let Ok(job) = jobs.try_recv() {
            if let Some(tx) = job.respond_to {
                let _ = tx.send(Err(DaemonError::ShuttingDown.to_string()));
            }
        }
        tracing::info!("cycle scheduling stopped");
        result
    }

    /// Run one cycle now, waiting for any cycle already running.
    pub async fn run_cycle(&self, trigger: Trigger) -> Result<CycleSummary, DaemonError> {
        let _turn = self.turn.lock().await;
        if self.shared.root.is_cancelled() {
            return Err(DaemonError::ShuttingDown);
        }

        let _busy = BusyGuard::set(&self.busy);
        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(async move { shared.execute(trigger).await });
        self.set_in_flight(Some(handle.abort_handle()));

        let result = match handle.await {
            Ok(result) => result,
            Err(err) if err.is_cancelled() => Err(DaemonError::Abandoned),
            Err(err) => {
                tracing::error!(%trigger, error = %err, "cycle task panicked");
                Err(DaemonError::Protocol(format!("cycle task failed: {err}")))
            }
        };
        self.set_in_flight(None);
        result
    }

    /// Stop scheduling, cancel every task and wait for the running cycle,
    /// at most `shutdown_deadline`. Idempotent.
    pub async fn shutdown(&self) -> ShutdownReport {
        let started = Instant::now();
        self.shared.status.write().await.shutting_down = true;
        self.shared.root.cancel();
        tracing::info!(
            deadline_secs = self.shutdown_deadline.as_secs_f32(),
            "shutdown requested, cancelling tasks"
        );

        let mut busy = self.busy.subscribe();
        let drained = matches!(
            tokio::time::timeout(self.shutdown_deadline, busy.wait_for(|running| !running)).await,
            Ok(Ok(_))
        );
        if drained {
            tracing::info!(elapsed_ms = started.elapsed().as_millis() as u64, "shutdown complete");
            return ShutdownReport {
                drained: true,
                abandoned: None,
                elapsed: started.elapsed(),
            };
        }

        self.shared.kill.cancel();
        if let Some(handle) = self.take_in_flight() {
            handle.abort();
        }
        let abandoned = self.shared.runner.abandon().await;
        if let Some(summary) = &abandoned {
            tracing::error!(
                cycle_id = %summary.cycle_id,
                failed = summary.failed,
                "shutdown deadline passed, cycle abandoned"
            );
            let mut status = self.shared.status.write().await;
            status.cycles_run += 1;
            status.cycle_running = false;
            status.last_cycle_at = Some(Utc::now());
            status.last_summary = Some(summary.clone());
            status.last_error = Some(DaemonError::Abandoned.to_string());
        }
        ShutdownReport {
            drained: false,
            abandoned,
            elapsed: started.elapsed(),
        }
    }

    fn set_in_flight(&self, handle: Option<AbortHandle>) {
        *self.in_flight.lock().unwrap_or_else(PoisonError::into_inner) = handle;
    }

    fn take_in_flight(&self) -> Option<AbortHandle> {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl Shared {
    async fn execute(&self, trigger: Trigger) -> Result<CycleSummary, DaemonError> {
        tracing::info!(%trigger, "cycle starting");
        {
            let mut status = self.status.write().await;
            status.cycle_running = true;
            status.last_trigger = Some(trigger);
        }

        let (summary, outcome) = match self.runner.run_cycle(&self.root).await {
            Ok(summary) => (Some(summary.clone()), Ok(summary)),
            Err(CycleError::Systemic {
                failed,
                threshold,
                summary,
            }) => {
                tracing::error!(
                    cycle_id = %summary.cycle_id,
                    failed,
                    threshold,
                    "systemic failure, no further cycles will run"
                );
                self.root.cancel();
                (Some(*summary), Err(DaemonError::Fatal { failed, threshold }))
            }
            Err(CycleError::Cancelled { summary }) => {
                (Some(*summary), Err(DaemonError::ShuttingDown))
            }
            Err(err @ CycleError::Discovery { .. }) => {
                (Some(err.summary().clone()), Err(DaemonError::Cycle(err)))
            }
        };

        {
            let mut status = self.status.write().await;
            status.cycles_run += 1;
            status.cycle_running = false;
            status.last_cycle_at = Some(Utc::now());
            if let Some(summary) = &summary {
                status.last_summary = Some(summary.clone());
            }
            status.last_error = outcome.as_ref().err().map(ToString::to_string);
            status.fatal |= matches!(outcome, Err(DaemonError::Fatal { .. }));
        }

        if let Some(summary) = &summary {
            self.notify(summary).await;
        }
        outcome
    }

    async fn notify(&self, summary: &CycleSummary) {
        match self.notifier.send(summary, &self.kill).await {
            Ok(()) => tracing::debug!(cycle_id = %summary.cycle_id, "cycle summary sent"),
            Err(err) => tracing::warn!(
                cycle_id = %summary.cycle_id,
                error = %err,
                "cycle summary notification failed"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use slotsync_core::ClassifiedError;

    struct CountingRunner {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CycleRunner for CountingRunner {
        async fn run_cycle(&self, _cancel: &CancellationToken) -> Result<CycleSummary, CycleError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(CycleSummary::new(format!("c{n}"), Utc::now(), false))
        }

        async fn abandon(&self) -> Option<CycleSummary> {
            None
        }
    }

    struct NullNotifier;

    #[async_trait]
    impl Notifier for NullNotifier {
        async fn send(
            &self,
            _summary: &CycleSummary,
            _cancel: &CancellationToken,
        ) -> Result<(), ClassifiedError> {
            Ok(())
        }
    }

    fn controller() -> (Arc<CountingRunner>, LifecycleController) {
        let runner = Arc::new(CountingRunner {
            calls: AtomicUsize::new(0),
        });
        let ctl = LifecycleController::new(
            runner.clone(),
            Arc::new(NullNotifier),
            Duration::from_secs(5),
        );
        (runner, ctl)
    }

    #[tokio::test(start_paused = true)]
    async fn interval_ticks_run_cycles() {
        let (runner, ctl) = controller();
        let ctl = Arc::new(ctl);
        let (_tx, rx) = mpsc::channel(4);
        let looping = {
            let ctl = Arc::clone(&ctl);
            tokio::spawn(async move { ctl.run(Duration::from_secs(60), rx).await })
        };

        tokio::time::sleep(Duration::from_secs(150)).await;
        // Ticks at 0s, 60s and 120s.
        assert_eq!(runner.calls.load(Ordering::SeqCst), 3);
        assert_eq!(ctl.status().await.cycles_run, 3);

        let report = ctl.shutdown().await;
        assert!(report.drained);
        looping.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn awaited_job_gets_its_summary() {
        let (_, ctl) = controller();
        let ctl = Arc::new(ctl);
        let (tx, rx) = mpsc::channel(4);
        let looping = {
            let ctl = Arc::clone(&ctl);
            tokio::spawn(async move { ctl.run(Duration::from_secs(3600), rx).await })
        };

        let (job, reply) = CycleJob::awaited(Trigger::Socket);
        tx.send(job).await.unwrap();
        let summary = reply.await.unwrap().unwrap();
        assert!(summary.cycle_id.starts_with('c'));

        ctl.shutdown().await;
        looping.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn cycles_are_refused_after_shutdown() {
        let (runner, ctl) = controller();
        ctl.shutdown().await;
        let err = ctl.run_cycle(Trigger::Socket).await.unwrap_err();
        assert!(matches!(err, DaemonError::ShuttingDown), "got {err}");
        assert_eq!(runner.calls.load(Ordering::SeqCst), 0);
        assert!(ctl.status().await.shutting_down);
    }
}
