// SPDX-License-Identifier: PMPL-1.0-or-later
//! Periodic source status refresh.
//!
//! Re-checks the historical store state on a fixed interval while the
//! transport is connected. The first check happens one interval after start.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::service::QueryPerformanceDataService;

struct Running {
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Background task that keeps the cached source status fresh.
pub struct BackgroundRefresher {
    service: Arc<QueryPerformanceDataService>,
    period: Duration,
    running: Mutex<Option<Running>>,
}

impl BackgroundRefresher {
    /// Refresher using the service's configured interval.
    pub fn new(service: Arc<QueryPerformanceDataService>) -> Self {
        let period = service.config().refresh_interval();
        Self::with_interval(service, period)
    }

    pub fn with_interval(service: Arc<QueryPerformanceDataService>, period: Duration) -> Self {
        Self {
            service,
            period: period.max(Duration::from_millis(1)),
            running: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Spawn the refresh loop. Returns `false` if it is already running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> bool {
        let mut running = self.running.lock();
        if running.is_some() {
            debug!("Refresher already running");
            return false;
        }

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let service = Arc::clone(&self.service);
        let period = self.period;

        let task = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // interval fires immediately; the first check waits one period
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => return,
                    _ = ticker.tick() => {}
                }

                if !service.is_connected() {
                    debug!("Not connected, skipping status refresh");
                    continue;
                }
                match service.check_source_status(true).await {
                    Ok(status) => debug!(state = status.state.as_str(), "Background status refresh"),
                    Err(e) => warn!(kind = %e.kind(), error = %e, "Background status refresh failed"),
                }
            }
        });

        info!(interval_ms = period.as_millis() as u64, "Refresher started");
        *running = Some(Running { shutdown_tx, task });
        true
    }

    /// Signal the loop to stop and wait for it. Returns `false` if it was
    /// not running.
    pub async fn stop(&self) -> bool {
        let Some(Running { shutdown_tx, task }) = self.running.lock().take() else {
            return false;
        };
        let _ = shutdown_tx.send(());
        if let Err(e) = task.await {
            warn!(error = %e, "Refresher task ended abnormally");
        }
        info!("Refresher stopped");
        true
    }
}

impl Drop for BackgroundRefresher {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.task.abort();
        }
    }
}
