//! Single-instance periodic background workers.
//!
//! A worker ticks on a fixed cadence and runs its job on the blocking pool.
//! Ticks never overlap: the loop awaits each run before waiting for the next
//! tick, missed ticks are skipped, and manual runs share the same gate. On
//! stop the job gets one last `on_shutdown` call.

use crate::core::{MetricsError, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Work performed on every tick of a [`PeriodicWorker`]
pub trait PeriodicJob: Send + Sync + 'static {
    /// Name used in logs
    fn name(&self) -> &'static str;

    /// One tick. Errors are logged by the worker and never stop it.
    fn run(&self) -> Result<()>;

    /// Called once after the last tick when the worker is stopped
    fn on_shutdown(&self) -> Result<()> {
        Ok(())
    }
}

/// Background task driving a [`PeriodicJob`]
pub struct PeriodicWorker {
    job: Arc<dyn PeriodicJob>,
    period: Duration,
    gate: Arc<tokio::sync::Mutex<()>>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PeriodicWorker {
    pub fn new(job: Arc<dyn PeriodicJob>, period: Duration) -> Self {
        Self {
            job,
            period,
            gate: Arc::new(tokio::sync::Mutex::new(())),
            shutdown: Mutex::new(None),
            handle: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &'static str {
        self.job.name()
    }

    pub fn is_running(&self) -> bool {
        self.handle.lock().as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Spawn the tick loop on the current tokio runtime.
    pub fn start(&self) -> Result<()> {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return Err(MetricsError::AlreadyRunning(self.job.name()));
        }

        let (tx, mut rx) = watch::channel(false);
        let job = Arc::clone(&self.job);
        let gate = Arc::clone(&self.gate);
        let period = self.period;

        *handle = Some(tokio::spawn(async move {
            let name = job.name();
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            tracing::info!("Worker '{}' started, period {:?}", name, period);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let _guard = gate.lock().await;
                        let job = Arc::clone(&job);
                        log_outcome(name, "tick", tokio::task::spawn_blocking(move || job.run()).await);
                    }
                    _ = rx.changed() => break,
                }
            }

            let _guard = gate.lock().await;
            let job = Arc::clone(&job);
            log_outcome(name, "shutdown", tokio::task::spawn_blocking(move || job.on_shutdown()).await);
            tracing::info!("Worker '{}' stopped", name);
        }));
        *self.shutdown.lock() = Some(tx);
        Ok(())
    }

    /// Run `f` while holding the worker's gate, so it never overlaps a tick.
    pub async fn run_exclusive<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let _guard = self.gate.lock().await;
        tokio::task::spawn_blocking(f).await?
    }

    /// Signal the loop to finish and wait up to `timeout` for the in-flight
    /// tick and the shutdown hook to complete.
    pub async fn stop(&self, timeout: Duration) -> Result<()> {
        if let Some(tx) = self.shutdown.lock().take() {
            let _ = tx.send(true);
        }
        let Some(handle) = self.handle.lock().take() else {
            return Ok(());
        };

        match tokio::time::timeout(timeout, handle).await {
            Ok(joined) => joined.map_err(MetricsError::from),
            Err(_) => {
                tracing::warn!("Worker '{}' did not stop within {:?}", self.job.name(), timeout);
                Err(MetricsError::Timeout {
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                })
            },
        }
    }
}

fn log_outcome(name: &str, phase: &str, outcome: std::result::Result<Result<()>, tokio::task::JoinError>) {
    match outcome {
        Ok(Ok(())) => {},
        Ok(Err(e)) => tracing::warn!(
            worker = name,
            phase,
            category = e.category(),
            recoverable = e.is_recoverable(),
            "Worker run failed: {}",
            e
        ),
        Err(e) => tracing::error!(worker = name, phase, "Worker run panicked: {}", e),
    }
}
