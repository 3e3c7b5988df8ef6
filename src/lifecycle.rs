//! Graceful shutdown.
//!
//! ```text
//! Running ──shutdown()──▶ Draining ──drain done / timeout──▶ Stopped
//! ```
//!
//! The first `shutdown` call does the work: it stops the pressure-monitor loop, closes the
//! scheduler to new jobs, cancels the ones still queued, waits for running jobs up to the
//! timeout and aborts the rest. The resulting [`ShutdownReport`] is kept; later calls return
//! it immediately, and calls racing the first one wait for it, each bounded by its own
//! timeout.

use crate::scheduler::{DrainReport, RefreshScheduler};
use once_cell::sync::OnceCell;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Running,
    Draining,
    Stopped,
}

impl LifecycleState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => LifecycleState::Running,
            1 => LifecycleState::Draining,
            _ => LifecycleState::Stopped,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShutdownReport {
    /// All refresh jobs finished or were cancelled before the timeout.
    pub drained: bool,
    /// Jobs that reached SUCCEEDED or FAILED during the drain.
    pub completed: u64,
    /// Queued jobs that never ran.
    pub cancelled: u64,
    /// Keys whose running job was abandoned at the timeout.
    pub abandoned: Vec<String>,
    pub elapsed: Duration,
}

impl From<DrainReport> for ShutdownReport {
    fn from(r: DrainReport) -> Self {
        Self {
            drained: r.drained,
            completed: r.completed,
            cancelled: r.cancelled,
            abandoned: r.abandoned,
            elapsed: r.elapsed,
        }
    }
}

/// Background loop owned by the lifecycle: a stop signal plus the task handle.
pub(crate) struct MonitorTask {
    pub(crate) stop: watch::Sender<bool>,
    pub(crate) handle: JoinHandle<()>,
}

pub struct LifecycleManager {
    inner: Arc<Inner>,
    default_timeout: Duration,
}

struct Inner {
    component: String,
    scheduler: RefreshScheduler,
    monitor: Mutex<Option<MonitorTask>>,
    state: AtomicU8,
    report: OnceCell<ShutdownReport>,
    stopped: Notify,
}

impl Inner {
    async fn drain(&self, timeout: Duration) -> ShutdownReport {
        info!(component = %self.component, timeout_ms = timeout.as_millis() as u64, "shutdown started");

        let monitor = self.monitor.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = &monitor {
            let _ = task.stop.send(true);
        }

        let report = ShutdownReport::from(self.scheduler.shutdown(timeout).await);

        if let Some(task) = monitor {
            if !task.handle.is_finished() {
                task.handle.abort();
            }
        }

        if report.drained {
            info!(
                component = %self.component,
                completed = report.completed,
                cancelled = report.cancelled,
                elapsed_ms = report.elapsed.as_millis() as u64,
                "shutdown complete"
            );
        } else {
            warn!(
                component = %self.component,
                abandoned = report.abandoned.len(),
                elapsed_ms = report.elapsed.as_millis() as u64,
                "shutdown timed out, abandoned running refresh jobs"
            );
        }
        self.finish(report)
    }

    fn finish(&self, report: ShutdownReport) -> ShutdownReport {
        let report = self.report.get_or_init(|| report).clone();
        self.state.store(2, Ordering::SeqCst);
        self.stopped.notify_waiters();
        report
    }
}

impl LifecycleManager {
    pub fn new(
        component: impl Into<String>,
        scheduler: RefreshScheduler,
        default_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                component: component.into(),
                scheduler,
                monitor: Mutex::new(None),
                state: AtomicU8::new(0),
                report: OnceCell::new(),
                stopped: Notify::new(),
            }),
            default_timeout,
        }
    }

    pub(crate) fn attach_monitor(&self, task: MonitorTask) {
        let mut slot = self.inner.monitor.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some(task);
    }

    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.inner.state.load(Ordering::SeqCst))
    }

    pub fn is_running(&self) -> bool {
        self.state() == LifecycleState::Running
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// The report of the completed shutdown, if any.
    pub fn report(&self) -> Option<&ShutdownReport> {
        self.inner.report.get()
    }

    pub async fn shutdown_default(&self) -> ShutdownReport {
        self.shutdown(self.default_timeout).await
    }

    /// Shut down, waiting at most `timeout` for running refresh jobs. Never fails and never
    /// blocks past the timeout.
    ///
    /// The drain runs on its own task, so dropping this future does not leave the manager
    /// half stopped. A caller that arrives while another drain is in progress waits for it
    /// up to its own `timeout` and then gets a provisional, undrained report.
    pub async fn shutdown(&self, timeout: Duration) -> ShutdownReport {
        if let Some(report) = self.inner.report.get() {
            return report.clone();
        }
        if self
            .inner
            .state
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return self.wait_stopped(timeout).await;
        }

        let inner = Arc::clone(&self.inner);
        let drain = tokio::spawn(async move { inner.drain(timeout).await });
        match drain.await {
            Ok(report) => report,
            Err(e) => {
                warn!(component = %self.inner.component, error = %e, "shutdown drain task failed");
                self.inner.finish(ShutdownReport {
                    drained: false,
                    ..ShutdownReport::default()
                })
            }
        }
    }

    async fn wait_stopped(&self, timeout: Duration) -> ShutdownReport {
        let started = tokio::time::Instant::now();
        let wait = async {
            loop {
                let notified = self.inner.stopped.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if let Some(report) = self.inner.report.get() {
                    return report.clone();
                }
                notified.await;
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(report) => report,
            Err(_) => {
                debug!(component = %self.inner.component, "shutdown still draining, returning early");
                ShutdownReport {
                    drained: false,
                    elapsed: started.elapsed(),
                    ..ShutdownReport::default()
                }
            }
        }
    }
}
