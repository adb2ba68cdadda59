//! Asset wait/notify substrate.
//!
//! An [`Asset`] is anything whose readiness is not guaranteed synchronously
//! (a managed object being sourced, an asynchronous flow awaiting its
//! callback). Job nodes that need the asset wait on its [`AssetMonitor`]
//! instead of blocking a worker thread.
//!
//! A monitor is registered with its [`AssetManager`] only while it has
//! waiters, so a sweep (`manage_assets`) only visits assets somebody is
//! actually waiting on. Once permanently activated or failed, a monitor is a
//! pass-through: later waiters resolve immediately.
//!
//! Notifications are never delivered under a lock. Every operation returns an
//! [`Activations`] batch that the caller executes after releasing its locks.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use crate::escalation::Escalation;
use crate::types::Error;

// =============================================================================
// Job nodes and activations
// =============================================================================

/// A unit of suspended work that an asset can resume or fail.
pub trait JobNode: Send + Sync + fmt::Debug {
    /// Hand the node back to its responsible team.
    fn activate(self: Arc<Self>);

    /// Resume the node with a failure, triggering escalation handling.
    fn fail(self: Arc<Self>, cause: Escalation);
}

pub type JobNodeRef = Arc<dyn JobNode>;

#[derive(Debug)]
enum Activation {
    Activate(JobNodeRef),
    Fail(JobNodeRef, Escalation),
}

/// Batch of pending wake-ups, executed once the caller holds no locks.
#[must_use = "activations must be executed once locks are released"]
#[derive(Debug, Default)]
pub struct Activations {
    entries: Vec<Activation>,
}

impl Activations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn activate(node: JobNodeRef) -> Self {
        Self {
            entries: vec![Activation::Activate(node)],
        }
    }

    pub fn fail(node: JobNodeRef, cause: Escalation) -> Self {
        Self {
            entries: vec![Activation::Fail(node, cause)],
        }
    }

    pub fn push_activate(&mut self, node: JobNodeRef) {
        self.entries.push(Activation::Activate(node));
    }

    pub fn push_fail(&mut self, node: JobNodeRef, cause: Escalation) {
        self.entries.push(Activation::Fail(node, cause));
    }

    pub fn merge(&mut self, other: Activations) {
        self.entries.extend(other.entries);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Deliver every wake-up in order.
    pub fn execute(self) {
        for entry in self.entries {
            match entry {
                Activation::Activate(node) => node.activate(),
                Activation::Fail(node, cause) => node.fail(cause),
            }
        }
    }
}

// =============================================================================
// Asset
// =============================================================================

/// Something whose readiness is reported asynchronously.
pub trait Asset: Send + Sync {
    /// Name of the asset (e.g. the managed object name).
    fn asset_name(&self) -> &str;

    /// Give the asset a chance to activate or fail its waiters, typically on
    /// timeout. Called by [`AssetManager::manage_assets`].
    fn check_on_asset(&self, context: &mut CheckAssetContext);

    /// Give up on the asset: record `cause` as its permanent failure.
    /// Returns `false` if the asset already resolved, leaving its waiters to
    /// the resolution in progress.
    fn cancel_asset(&self, _cause: &Escalation) -> bool {
        true
    }
}

#[derive(Debug)]
enum CheckOutcome {
    Activate { permanent: bool },
    Fail { cause: Escalation, permanent: bool },
}

/// Context handed to an asset during a sweep.
#[derive(Debug)]
pub struct CheckAssetContext {
    time: Instant,
    outcome: Option<CheckOutcome>,
}

impl CheckAssetContext {
    fn new(time: Instant) -> Self {
        Self {
            time,
            outcome: None,
        }
    }

    /// Time of the sweep.
    pub fn time(&self) -> Instant {
        self.time
    }

    pub fn activate_job_nodes(&mut self, permanent: bool) {
        self.outcome = Some(CheckOutcome::Activate { permanent });
    }

    pub fn fail_job_nodes(&mut self, cause: Escalation, permanent: bool) {
        self.outcome = Some(CheckOutcome::Fail { cause, permanent });
    }
}

// =============================================================================
// Asset monitor
// =============================================================================

#[derive(Debug, Clone)]
enum PermanentState {
    Activated,
    Failed(Escalation),
}

#[derive(Debug, Default)]
struct MonitorState {
    waiting: Vec<JobNodeRef>,
    permanent: Option<PermanentState>,
    registered: bool,
}

/// Result of waiting on an asset.
#[derive(Debug)]
pub enum WaitOutcome {
    /// The node is queued on the monitor.
    Waiting,
    /// The asset is permanently resolved; the node is in the batch.
    Resolved(Activations),
}

impl WaitOutcome {
    pub fn is_waiting(&self) -> bool {
        matches!(self, WaitOutcome::Waiting)
    }
}

/// Per-asset queue of waiting job nodes.
pub struct AssetMonitor {
    id: u64,
    asset: Weak<dyn Asset>,
    manager: Weak<AssetManager>,
    state: Mutex<MonitorState>,
}

impl AssetMonitor {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Queue `node` until the asset resolves.
    ///
    /// Registers the monitor with its manager on the first waiter. If the
    /// asset is already permanently resolved, nothing is registered and the
    /// node is returned in the batch for the caller to execute.
    pub fn wait_on_asset(self: &Arc<Self>, node: JobNodeRef) -> WaitOutcome {
        let mut state = self.state.lock();
        match &state.permanent {
            Some(PermanentState::Activated) => {
                return WaitOutcome::Resolved(Activations::activate(node));
            }
            Some(PermanentState::Failed(cause)) => {
                return WaitOutcome::Resolved(Activations::fail(node, cause.clone()));
            }
            None => {}
        }

        state.waiting.push(node);
        if !state.registered {
            state.registered = true;
            // Lock order: monitor → manager
            if let Some(manager) = self.manager.upgrade() {
                manager.register(self.clone());
            }
        }
        WaitOutcome::Waiting
    }

    /// Release every waiter. A permanent activation makes the monitor a
    /// pass-through for later waiters.
    pub fn activate_job_nodes(&self, permanent: bool) -> Activations {
        let mut state = self.state.lock();
        if permanent && state.permanent.is_none() {
            state.permanent = Some(PermanentState::Activated);
        }
        let mut activations = Activations::new();
        for node in state.waiting.drain(..) {
            activations.push_activate(node);
        }
        self.unregister_locked(&mut state);
        activations
    }

    /// Fail every waiter with `cause`.
    pub fn fail_job_nodes(&self, cause: Escalation, permanent: bool) -> Activations {
        let mut state = self.state.lock();
        if permanent && state.permanent.is_none() {
            state.permanent = Some(PermanentState::Failed(cause.clone()));
        }
        let mut activations = Activations::new();
        for node in state.waiting.drain(..) {
            activations.push_fail(node, cause.clone());
        }
        self.unregister_locked(&mut state);
        activations
    }

    /// Number of nodes currently waiting.
    pub fn waiting_count(&self) -> usize {
        self.state.lock().waiting.len()
    }

    pub fn is_permanent(&self) -> bool {
        self.state.lock().permanent.is_some()
    }

    fn unregister_locked(&self, state: &mut MonitorState) {
        if state.registered {
            state.registered = false;
            if let Some(manager) = self.manager.upgrade() {
                manager.unregister(self.id);
            }
        }
    }

    fn check(&self, time: Instant) -> Activations {
        let Some(asset) = self.asset.upgrade() else {
            let cause = Escalation::new(Error::internal(format!("asset of monitor {} dropped", self.id)));
            tracing::warn!(monitor = self.id, "asset_dropped_with_waiters");
            return self.fail_job_nodes(cause, true);
        };

        let mut context = CheckAssetContext::new(time);
        asset.check_on_asset(&mut context);

        match context.outcome {
            None => Activations::new(),
            Some(CheckOutcome::Activate { permanent }) => self.activate_job_nodes(permanent),
            Some(CheckOutcome::Fail { cause, permanent }) => {
                tracing::debug!(
                    asset = asset.asset_name(),
                    cause_type = %cause.cause_type(),
                    "asset_failed_on_check"
                );
                self.fail_job_nodes(cause, permanent)
            }
        }
    }

    /// Permanently fail the asset and its waiters with `cause`.
    fn cancel(&self, cause: &Escalation) -> Activations {
        if let Some(asset) = self.asset.upgrade() {
            if !asset.cancel_asset(cause) {
                return Activations::new();
            }
            tracing::debug!(asset = asset.asset_name(), cause_type = %cause.cause_type(), "asset_cancelled");
        }
        self.fail_job_nodes(cause.clone(), true)
    }
}

impl fmt::Debug for AssetMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("AssetMonitor")
            .field("id", &self.id)
            .field("waiting", &state.waiting.len())
            .field("permanent", &state.permanent)
            .field("registered", &state.registered)
            .finish()
    }
}

// =============================================================================
// Asset manager
// =============================================================================

/// Named domain of responsibility sweeping the monitors that have waiters.
pub struct AssetManager {
    name: String,
    next_monitor_id: AtomicU64,
    monitors: Mutex<BTreeMap<u64, Arc<AssetMonitor>>>,
    self_ref: Weak<AssetManager>,
}

impl AssetManager {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        let name = name.into();
        Arc::new_cyclic(|self_ref| Self {
            name,
            next_monitor_id: AtomicU64::new(1),
            monitors: Mutex::new(BTreeMap::new()),
            self_ref: self_ref.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Create the monitor for an asset. Takes a weak reference so the asset
    /// can own its monitor (`Arc::new_cyclic`).
    pub fn create_asset_monitor(&self, asset: Weak<dyn Asset>) -> Arc<AssetMonitor> {
        Arc::new(AssetMonitor {
            id: self.next_monitor_id.fetch_add(1, Ordering::Relaxed),
            asset,
            manager: self.self_ref.clone(),
            state: Mutex::new(MonitorState::default()),
        })
    }

    /// Sweep every registered monitor now.
    pub fn manage_assets(&self) -> usize {
        self.manage_assets_at(Instant::now())
    }

    /// Sweep every registered monitor as of `time`. Returns the number of
    /// monitors checked.
    pub fn manage_assets_at(&self, time: Instant) -> usize {
        let monitors: Vec<Arc<AssetMonitor>> = self.monitors.lock().values().cloned().collect();

        let mut activations = Activations::new();
        for monitor in &monitors {
            activations.merge(monitor.check(time));
        }

        if !activations.is_empty() {
            tracing::debug!(
                manager = %self.name,
                notified = activations.len(),
                "asset_sweep_notified"
            );
        }
        activations.execute();
        monitors.len()
    }

    /// Fail every asset that still has waiters. Returns the number of
    /// monitors cancelled.
    pub fn cancel_assets(&self, cause: &Escalation) -> usize {
        let monitors: Vec<Arc<AssetMonitor>> = self.monitors.lock().values().cloned().collect();

        let mut activations = Activations::new();
        for monitor in &monitors {
            activations.merge(monitor.cancel(cause));
        }
        if !activations.is_empty() {
            tracing::info!(manager = %self.name, failed = activations.len(), "asset_manager_cancelled");
        }
        activations.execute();
        monitors.len()
    }

    /// Number of monitors currently registered (i.e. with waiters).
    pub fn registered_count(&self) -> usize {
        self.monitors.lock().len()
    }

    fn register(&self, monitor: Arc<AssetMonitor>) {
        self.monitors.lock().insert(monitor.id, monitor);
    }

    fn unregister(&self, monitor_id: u64) {
        self.monitors.lock().remove(&monitor_id);
    }
}

impl fmt::Debug for AssetManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AssetManager")
            .field("name", &self.name)
            .field("registered", &self.registered_count())
            .finish()
    }
}

/// Registry of the asset managers owned by an office.
#[derive(Debug, Default)]
pub struct AssetManagerRegistry {
    managers: Mutex<Vec<Arc<AssetManager>>>,
}

impl AssetManagerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_asset_manager(&self, name: impl Into<String>) -> Arc<AssetManager> {
        let manager = AssetManager::new(name);
        self.managers.lock().push(manager.clone());
        manager
    }

    pub fn managers(&self) -> Vec<Arc<AssetManager>> {
        self.managers.lock().clone()
    }

    /// Sweep every manager. Returns the total number of monitors checked.
    pub fn manage_assets(&self) -> usize {
        self.manage_assets_at(Instant::now())
    }

    pub fn manage_assets_at(&self, time: Instant) -> usize {
        self.managers()
            .iter()
            .map(|manager| manager.manage_assets_at(time))
            .sum()
    }

    /// Cancel the waited-on assets of every manager.
    pub fn cancel_assets(&self, cause: &Escalation) -> usize {
        self.managers()
            .iter()
            .map(|manager| manager.cancel_assets(cause))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[derive(Debug, Default)]
    struct RecordingNode {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl JobNode for RecordingNode {
        fn activate(self: Arc<Self>) {
            self.log.lock().push(format!("{}:activated", self.name));
        }

        fn fail(self: Arc<Self>, cause: Escalation) {
            self.log
                .lock()
                .push(format!("{}:failed:{}", self.name, cause.cause_type()));
        }
    }

    fn node(name: &'static str, log: &Arc<Mutex<Vec<String>>>) -> JobNodeRef {
        Arc::new(RecordingNode {
            name,
            log: log.clone(),
        })
    }

    /// Asset failing its waiters once its deadline has passed.
    struct DeadlineAsset {
        deadline: Instant,
        monitor: Arc<AssetMonitor>,
    }

    impl Asset for DeadlineAsset {
        fn asset_name(&self) -> &str {
            "deadline"
        }

        fn check_on_asset(&self, context: &mut CheckAssetContext) {
            if context.time() >= self.deadline {
                context.fail_job_nodes(Escalation::new(Error::timeout("deadline")), true);
            }
        }
    }

    fn deadline_asset(manager: &Arc<AssetManager>, deadline: Instant) -> Arc<DeadlineAsset> {
        Arc::new_cyclic(|weak: &Weak<DeadlineAsset>| {
            let asset: Weak<dyn Asset> = weak.clone();
            DeadlineAsset {
                deadline,
                monitor: manager.create_asset_monitor(asset),
            }
        })
    }

    #[test]
    fn test_registration_only_while_waiting() {
        let manager = AssetManager::new("test");
        let log = Arc::new(Mutex::new(Vec::new()));
        let asset = deadline_asset(&manager, Instant::now() + Duration::from_secs(60));

        assert_eq!(manager.registered_count(), 0);
        assert!(asset.monitor.wait_on_asset(node("a", &log)).is_waiting());
        assert!(asset.monitor.wait_on_asset(node("b", &log)).is_waiting());
        assert_eq!(manager.registered_count(), 1);
        assert_eq!(asset.monitor.waiting_count(), 2);

        let activations = asset.monitor.activate_job_nodes(false);
        assert_eq!(manager.registered_count(), 0);
        assert!(log.lock().is_empty(), "nothing delivered until executed");

        activations.execute();
        assert_eq!(*log.lock(), vec!["a:activated", "b:activated"]);
    }

    #[test]
    fn test_permanent_activation_is_pass_through() {
        let manager = AssetManager::new("test");
        let log = Arc::new(Mutex::new(Vec::new()));
        let asset = deadline_asset(&manager, Instant::now() + Duration::from_secs(60));

        asset.monitor.activate_job_nodes(true).execute();

        match asset.monitor.wait_on_asset(node("late", &log)) {
            WaitOutcome::Resolved(activations) => {
                assert_eq!(activations.len(), 1);
                activations.execute();
            }
            WaitOutcome::Waiting => panic!("permanent monitor must not queue"),
        }
        assert_eq!(manager.registered_count(), 0);
        assert_eq!(*log.lock(), vec!["late:activated"]);
    }

    #[test]
    fn test_permanent_failure_is_sticky() {
        let manager = AssetManager::new("test");
        let log = Arc::new(Mutex::new(Vec::new()));
        let asset = deadline_asset(&manager, Instant::now() + Duration::from_secs(60));

        asset
            .monitor
            .fail_job_nodes(Escalation::new(Error::sourcing("down")), true)
            .execute();
        // A later permanent activation does not override the failure
        asset.monitor.activate_job_nodes(true).execute();

        match asset.monitor.wait_on_asset(node("late", &log)) {
            WaitOutcome::Resolved(activations) => activations.execute(),
            WaitOutcome::Waiting => panic!("permanent monitor must not queue"),
        }
        assert_eq!(*log.lock(), vec!["late:failed:sourcing"]);
    }

    #[test]
    fn test_sweep_fails_expired_assets() {
        let registry = AssetManagerRegistry::new();
        let manager = registry.create_asset_manager("sourcing");
        let log = Arc::new(Mutex::new(Vec::new()));
        let start = Instant::now();
        let asset = deadline_asset(&manager, start + Duration::from_millis(100));

        assert!(asset.monitor.wait_on_asset(node("a", &log)).is_waiting());

        // Before the deadline nothing happens
        assert_eq!(registry.manage_assets_at(start + Duration::from_millis(50)), 1);
        assert!(log.lock().is_empty());

        // After the deadline the waiter fails and the monitor is unregistered
        assert_eq!(registry.manage_assets_at(start + Duration::from_millis(100)), 1);
        assert_eq!(*log.lock(), vec!["a:failed:timeout"]);
        assert_eq!(manager.registered_count(), 0);
        assert_eq!(registry.manage_assets_at(start + Duration::from_millis(150)), 0);
    }

    #[test]
    fn test_dropped_asset_fails_waiters_on_sweep() {
        let manager = AssetManager::new("test");
        let log = Arc::new(Mutex::new(Vec::new()));
        let asset = deadline_asset(&manager, Instant::now() + Duration::from_secs(60));
        let monitor = asset.monitor.clone();
        assert!(monitor.wait_on_asset(node("a", &log)).is_waiting());

        drop(asset);
        assert_eq!(manager.manage_assets(), 1);
        assert_eq!(manager.registered_count(), 0);
        assert_eq!(*log.lock(), vec!["a:failed:internal"]);
        assert!(monitor.is_permanent());
    }

    /// Asset that resolved before it could be cancelled.
    struct SettledAsset;

    impl Asset for SettledAsset {
        fn asset_name(&self) -> &str {
            "settled"
        }

        fn check_on_asset(&self, _context: &mut CheckAssetContext) {}

        fn cancel_asset(&self, _cause: &Escalation) -> bool {
            false
        }
    }

    #[test]
    fn test_cancel_fails_waiters_across_managers() {
        let registry = AssetManagerRegistry::new();
        let sourcing = registry.create_asset_manager("sourcing");
        let asynchronous = registry.create_asset_manager("asynchronous");
        let log = Arc::new(Mutex::new(Vec::new()));
        let first = deadline_asset(&sourcing, Instant::now() + Duration::from_secs(60));
        let second = deadline_asset(&asynchronous, Instant::now() + Duration::from_secs(60));
        let idle = deadline_asset(&sourcing, Instant::now() + Duration::from_secs(60));
        assert!(first.monitor.wait_on_asset(node("a", &log)).is_waiting());
        assert!(second.monitor.wait_on_asset(node("b", &log)).is_waiting());

        let cause = Escalation::new(Error::cancelled("shutting down"));
        assert_eq!(registry.cancel_assets(&cause), 2);
        assert_eq!(*log.lock(), vec!["a:failed:cancelled", "b:failed:cancelled"]);
        assert_eq!(sourcing.registered_count(), 0);
        assert_eq!(asynchronous.registered_count(), 0);
        assert!(first.monitor.is_permanent());
        // Monitors without waiters are untouched
        assert!(!idle.monitor.is_permanent());
    }

    #[test]
    fn test_cancel_skips_resolved_asset() {
        let manager = AssetManager::new("test");
        let log = Arc::new(Mutex::new(Vec::new()));
        let asset: Arc<SettledAsset> = Arc::new(SettledAsset);
        let weak: Weak<dyn Asset> = Arc::downgrade(&asset) as Weak<dyn Asset>;
        let monitor = manager.create_asset_monitor(weak);
        assert!(monitor.wait_on_asset(node("a", &log)).is_waiting());

        assert_eq!(manager.cancel_assets(&Escalation::new(Error::cancelled("stop"))), 1);
        assert!(log.lock().is_empty());
        assert_eq!(monitor.waiting_count(), 1);

        monitor.activate_job_nodes(true).execute();
        assert_eq!(*log.lock(), vec!["a:activated"]);
    }
}
