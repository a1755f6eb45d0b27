//! Idle session timeout sweeper
//!
//! A background task that periodically scans for active sessions whose last
//! activity predates the timeout threshold and transitions them to inactive
//! with a timeout reason. Each candidate is handled on its own, so one
//! failure cannot stall the rest of the sweep.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::session::manager::SessionManager;

/// Outcome of a single sweep over idle sessions.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    /// Active sessions whose last activity predated the cutoff
    pub examined: usize,
    /// Sessions transitioned to inactive with a timeout reason
    pub timed_out: usize,
    /// Sessions that could not be transitioned and remain active
    pub failed: usize,
}

/// Periodically times out active sessions idle past the threshold.
pub struct TimeoutSweeper {
    manager: Arc<SessionManager>,
    interval: Duration,
    threshold: chrono::Duration,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task_handle: Option<JoinHandle<()>>,
}

impl TimeoutSweeper {
    /// Creates a sweeper with the interval and threshold from the config.
    #[must_use]
    pub fn new(manager: Arc<SessionManager>, config: &SessionConfig) -> Self {
        Self {
            manager,
            interval: config.sweep_interval(),
            // Out-of-range thresholds clamp to "never"
            threshold: chrono::Duration::from_std(config.timeout_threshold())
                .unwrap_or(chrono::Duration::MAX),
            shutdown_tx: None,
            task_handle: None,
        }
    }

    /// Spawns the periodic sweep task. Does nothing if already running or
    /// if the interval is zero.
    pub fn start(&mut self) {
        if self.is_running() {
            warn!("Timeout sweeper already running");
            return;
        }
        if self.interval.is_zero() {
            info!("Sweep interval is zero, timeout sweeper disabled");
            return;
        }

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        self.shutdown_tx = Some(shutdown_tx);

        let manager = Arc::clone(&self.manager);
        let interval = self.interval;
        let threshold = self.threshold;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick fires immediately, catching sessions that went
            // idle while nothing was sweeping
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = sweep(&manager, threshold).await;
                        if report.timed_out > 0 || report.failed > 0 {
                            info!(
                                examined = report.examined,
                                timed_out = report.timed_out,
                                failed = report.failed,
                                "Timeout sweep finished"
                            );
                        }
                    }
                    _ = &mut shutdown_rx => {
                        debug!("Timeout sweeper received shutdown signal");
                        break;
                    }
                }
            }
            info!("Timeout sweeper stopped");
        });

        self.task_handle = Some(handle);
        info!(
            interval_secs = self.interval.as_secs(),
            threshold_secs = self.threshold.num_seconds(),
            "Timeout sweeper started"
        );
    }

    /// Whether the periodic task is alive.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task_handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Runs one sweep immediately, outside the periodic schedule.
    pub async fn sweep_once(&self) -> SweepReport {
        sweep(&self.manager, self.threshold).await
    }

    /// Signals the task to stop and waits for it to finish.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.task_handle.take() {
            match tokio::time::timeout(Duration::from_secs(5), handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Timeout sweeper task panicked"),
                Err(_) => warn!("Timeout sweeper did not stop in time"),
            }
        }
    }
}

impl Drop for TimeoutSweeper {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// One pass: scan for idle sessions, then time each out independently.
async fn sweep(manager: &SessionManager, threshold: chrono::Duration) -> SweepReport {
    let now = Utc::now();
    // A threshold that underflows the calendar can never be crossed
    let Some(cutoff) = now.checked_sub_signed(threshold) else {
        return SweepReport::default();
    };
    let stale = match manager.stale_active_sessions(cutoff) {
        Ok(stale) => stale,
        Err(e) => {
            warn!(error = %e, "Failed to scan for idle sessions");
            return SweepReport::default();
        }
    };

    let mut report = SweepReport {
        examined: stale.len(),
        ..SweepReport::default()
    };
    for (session_id, last_activity_at) in stale {
        let hours_inactive = (now - last_activity_at).num_seconds() as f64 / 3600.0;
        match manager.time_out_session(&session_id, hours_inactive).await {
            Ok(true) => {
                info!(session_id = %session_id, hours_inactive, "Timed out idle session");
                report.timed_out += 1;
            }
            Ok(false) => {
                debug!(session_id = %session_id, "Session left active status before timeout");
            }
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Failed to time out session");
                report.failed += 1;
            }
        }
    }
    report
}
