//! Periodic sweep of an office's asset managers.
//!
//! Timeouts on managed object sourcing and asynchronous flows only fire when
//! someone checks the waiting monitors. AssetMonitoringService does that on a
//! fixed interval in a background task.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};

use crate::asset::AssetManagerRegistry;
use crate::types::{Error, Result};

/// Background task calling `manage_assets` on every manager of a registry.
#[derive(Debug)]
pub struct AssetMonitoringService {
    office: String,
    assets: Arc<AssetManagerRegistry>,
    interval: Duration,
    stop_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl AssetMonitoringService {
    pub fn new(office: impl Into<String>, assets: Arc<AssetManagerRegistry>, interval: Duration) -> Self {
        Self {
            office: office.into(),
            assets,
            interval,
            stop_tx: None,
        }
    }

    /// Start sweeping on the current tokio runtime.
    pub fn start(&mut self) -> Result<tokio::task::JoinHandle<()>> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|_| Error::validation("asset monitoring requires a tokio runtime"))?;
        if self.interval.is_zero() {
            return Err(Error::validation("asset_sweep_interval must be greater than zero"));
        }
        self.stop();

        let assets = self.assets.clone();
        let office = self.office.clone();
        let period = self.interval;
        let (stop_tx, mut stop_rx) = tokio::sync::oneshot::channel();
        self.stop_tx = Some(stop_tx);

        tracing::info!(office = %office, interval = ?period, "asset_monitoring_started");
        Ok(handle.spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let checked = assets.manage_assets();
                        if checked > 0 {
                            tracing::trace!(office = %office, checked, "asset_sweep_completed");
                        }
                    }
                    _ = &mut stop_rx => {
                        tracing::info!(office = %office, "asset_monitoring_stopped");
                        break;
                    }
                }
            }
        }))
    }

    /// Stop the sweep loop.
    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }

    pub fn is_running(&self) -> bool {
        self.stop_tx.as_ref().is_some_and(|tx| !tx.is_closed())
    }
}

impl Drop for AssetMonitoringService {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::{Asset, CheckAssetContext, JobNode, JobNodeRef};
    use crate::escalation::Escalation;
    use parking_lot::Mutex;
    use std::sync::Weak;
    use std::time::Instant;

    #[derive(Debug, Default)]
    struct Recorder {
        failures: Mutex<Vec<String>>,
    }

    impl JobNode for Recorder {
        fn activate(self: Arc<Self>) {}

        fn fail(self: Arc<Self>, cause: Escalation) {
            self.failures.lock().push(cause.message());
        }
    }

    struct Deadline {
        at: Instant,
    }

    impl Asset for Deadline {
        fn asset_name(&self) -> &str {
            "deadline"
        }

        fn check_on_asset(&self, context: &mut CheckAssetContext) {
            if context.time() >= self.at {
                context.fail_job_nodes(Escalation::new(Error::timeout("deadline passed")), true);
            }
        }
    }

    #[tokio::test]
    async fn test_sweep_fails_expired_waiters() {
        let assets = Arc::new(AssetManagerRegistry::new());
        let manager = assets.create_asset_manager("sourcing");
        let asset: Arc<dyn Asset> = Arc::new(Deadline { at: Instant::now() });
        let monitor = manager.create_asset_monitor(Arc::downgrade(&asset) as Weak<dyn Asset>);
        let waiter = Arc::new(Recorder::default());
        assert!(monitor.wait_on_asset(waiter.clone() as JobNodeRef).is_waiting());

        let mut service = AssetMonitoringService::new("office", assets, Duration::from_millis(5));
        service.start().unwrap();
        assert!(service.is_running());

        for _ in 0..100 {
            if !waiter.failures.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        service.stop();

        assert_eq!(waiter.failures.lock().len(), 1);
        assert_eq!(manager.registered_count(), 0);
        assert!(!service.is_running());
    }

    #[test]
    fn test_start_outside_runtime_is_rejected() {
        let mut service =
            AssetMonitoringService::new("office", Arc::new(AssetManagerRegistry::new()), Duration::from_millis(5));
        assert!(service.start().is_err());
    }

    #[tokio::test]
    async fn test_zero_interval_rejected() {
        let mut service = AssetMonitoringService::new("office", Arc::new(AssetManagerRegistry::new()), Duration::ZERO);
        assert!(matches!(service.start(), Err(Error::Validation(_))));
    }
}
