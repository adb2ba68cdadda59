//! Managed objects - externally sourced resources bound into a scope.
//!
//! A [`ManagedObjectContainer`] holds exactly one object instance for one
//! scope instance (process, thread or function) and drives its sourcing:
//!
//! ```text
//! NotSourced → Sourcing → Ready
//!                       ↘ Failed
//! ```
//!
//! The factory ([`ManagedObjectSource`]) is invoked at most once per
//! container. It may complete synchronously or keep the [`SourceContext`]
//! and complete it later from any thread. Entering `Sourcing` arms a timeout;
//! the sourcing asset manager's sweep fails the container once it expires.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use crate::asset::{Activations, Asset, AssetManager, AssetMonitor, CheckAssetContext, JobNodeRef, WaitOutcome};
use crate::escalation::Escalation;
use crate::kernel::with_recovery;
use crate::office::ManagedObjectMeta;
use crate::types::{Error, Result};

/// A sourced managed object.
pub type Object = Arc<dyn Any + Send + Sync>;

/// Capability view of a managed object handed to governance and duties.
pub type Extension = Arc<dyn Any + Send + Sync>;

/// Builds an extension from its managed object.
pub type ExtensionFactory = Arc<dyn Fn(&Object) -> Result<Extension> + Send + Sync>;

/// Downcast a type-erased value, reporting a validation error on mismatch.
pub(crate) fn downcast<T: Any + Send + Sync>(value: &Arc<dyn Any + Send + Sync>, what: &str) -> Result<Arc<T>> {
    value.clone().downcast::<T>().map_err(|_| {
        Error::validation(format!(
            "{} is not a {}",
            what,
            std::any::type_name::<T>()
        ))
    })
}

// =============================================================================
// Scope and references
// =============================================================================

/// Lifetime scope a managed object is bound to. Ordered narrowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Function,
    Thread,
    Process,
}

impl Scope {
    /// An object may only depend on objects living at least as long.
    pub fn can_depend_on(self, other: Scope) -> bool {
        other >= self
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Function => write!(f, "function"),
            Scope::Thread => write!(f, "thread"),
            Scope::Process => write!(f, "process"),
        }
    }
}

/// Index of a managed object within its scope's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    pub scope: Scope,
    pub index: usize,
}

impl ObjectRef {
    pub fn new(scope: Scope, index: usize) -> Self {
        Self { scope, index }
    }
}

/// An object together with the factory extracting one of its extensions,
/// resolved once when the office is built.
#[derive(Clone)]
pub struct ExtensionRef {
    pub object: ObjectRef,
    pub factory: ExtensionFactory,
}

impl ExtensionRef {
    pub fn extend(&self, object: &Object) -> Result<Extension> {
        (self.factory)(object)
    }
}

impl fmt::Debug for ExtensionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionRef").field("object", &self.object).finish()
    }
}

// =============================================================================
// Sources
// =============================================================================

/// Factory for a managed object.
pub trait ManagedObjectSource: Send + Sync {
    /// Begin sourcing. Either call [`SourceContext::complete`] before
    /// returning or keep the context and complete it later.
    fn source(&self, context: SourceContext) -> Result<()>;

    /// Called once when the owning scope ends, for every object that was ready.
    fn release(&self, _object: Object) {}
}

impl<F> ManagedObjectSource for F
where
    F: Fn(SourceContext) -> Result<()> + Send + Sync,
{
    fn source(&self, context: SourceContext) -> Result<()> {
        self(context)
    }
}

/// Callback token handed to a [`ManagedObjectSource`].
pub struct SourceContext {
    container: Arc<ManagedObjectContainer>,
    dependencies: Vec<Object>,
}

impl SourceContext {
    /// Name of the managed object being sourced.
    pub fn name(&self) -> &str {
        self.container.name()
    }

    /// Ready dependency objects, in declared order.
    pub fn dependencies(&self) -> &[Object] {
        &self.dependencies
    }

    pub fn dependency<T: Any + Send + Sync>(&self, index: usize) -> Result<Arc<T>> {
        let object = self.dependencies.get(index).ok_or_else(|| {
            Error::not_found(format!("dependency {} of '{}'", index, self.name()))
        })?;
        downcast(object, &format!("dependency {} of '{}'", index, self.name()))
    }

    /// Provide the object, making the container ready.
    pub fn complete(self, object: Object) {
        self.container.complete(object);
    }

    pub fn complete_with<T: Any + Send + Sync>(self, value: T) {
        self.complete(Arc::new(value));
    }

    /// Report that the object cannot be sourced.
    pub fn fail(self, error: Error) {
        self.container.fail(Escalation::new(error));
    }
}

impl fmt::Debug for SourceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceContext")
            .field("name", &self.name())
            .field("dependencies", &self.dependencies.len())
            .finish()
    }
}

// =============================================================================
// Container
// =============================================================================

/// Observable sourcing state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    NotSourced,
    Sourcing,
    Ready,
    Failed,
}

enum Slot {
    NotSourced,
    Sourcing { deadline: Instant },
    Ready(Object),
    Failed(Escalation),
}

/// Result of asking a container for its object on behalf of a job node.
#[derive(Debug)]
pub enum Readiness {
    Ready(Object),
    Failed(Escalation),
    /// Sourcing has not started; the caller should source it.
    NotSourced,
    /// The node is queued on the container's monitor.
    Waiting,
    /// The monitor resolved permanently; execute the batch.
    Resolved(Activations),
}

/// Holder of one managed object instance for one scope instance.
pub struct ManagedObjectContainer {
    meta: Arc<ManagedObjectMeta>,
    slot: Mutex<Slot>,
    monitor: Arc<AssetMonitor>,
    released: AtomicBool,
}

impl ManagedObjectContainer {
    pub fn new(meta: Arc<ManagedObjectMeta>, manager: &AssetManager) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<ManagedObjectContainer>| {
            let asset: Weak<dyn Asset> = weak.clone();
            Self {
                meta,
                slot: Mutex::new(Slot::NotSourced),
                monitor: manager.create_asset_monitor(asset),
                released: AtomicBool::new(false),
            }
        })
    }

    pub fn name(&self) -> &str {
        &self.meta.name
    }

    pub fn meta(&self) -> &Arc<ManagedObjectMeta> {
        &self.meta
    }

    pub fn monitor(&self) -> &Arc<AssetMonitor> {
        &self.monitor
    }

    pub fn state(&self) -> ContainerState {
        match &*self.slot.lock() {
            Slot::NotSourced => ContainerState::NotSourced,
            Slot::Sourcing { .. } => ContainerState::Sourcing,
            Slot::Ready(_) => ContainerState::Ready,
            Slot::Failed(_) => ContainerState::Failed,
        }
    }

    /// The object, once ready.
    pub fn object(&self) -> Option<Object> {
        match &*self.slot.lock() {
            Slot::Ready(object) => Some(object.clone()),
            _ => None,
        }
    }

    pub fn failure(&self) -> Option<Escalation> {
        match &*self.slot.lock() {
            Slot::Failed(cause) => Some(cause.clone()),
            _ => None,
        }
    }

    /// Start sourcing. Only the first caller moves the container out of
    /// `NotSourced` and invokes the factory; returns whether this call did.
    pub fn source(self: &Arc<Self>, dependencies: Vec<Object>) -> bool {
        {
            let mut slot = self.slot.lock();
            if !matches!(*slot, Slot::NotSourced) {
                return false;
            }
            *slot = Slot::Sourcing {
                deadline: Instant::now() + self.meta.timeout,
            };
        }

        tracing::debug!(object = %self.meta.name, scope = %self.meta.scope, "managed_object_sourcing");

        let context = SourceContext {
            container: self.clone(),
            dependencies,
        };
        let source = self.meta.source.clone();
        if let Err(error) = with_recovery(|| source.source(context), &self.meta.name) {
            self.fail(Escalation::new(error));
        }
        true
    }

    /// Return the object if ready, otherwise queue `node` until it is.
    pub fn wait_until_ready(&self, node: JobNodeRef) -> Readiness {
        let slot = self.slot.lock();
        match &*slot {
            Slot::Ready(object) => Readiness::Ready(object.clone()),
            Slot::Failed(cause) => Readiness::Failed(cause.clone()),
            Slot::NotSourced => Readiness::NotSourced,
            // Lock order: container → monitor → manager
            Slot::Sourcing { .. } => match self.monitor.wait_on_asset(node) {
                WaitOutcome::Waiting => Readiness::Waiting,
                WaitOutcome::Resolved(activations) => Readiness::Resolved(activations),
            },
        }
    }

    fn complete(&self, object: Object) {
        let accepted = {
            let mut slot = self.slot.lock();
            if matches!(*slot, Slot::Sourcing { .. }) {
                *slot = Slot::Ready(object.clone());
                true
            } else {
                false
            }
        };

        if accepted {
            tracing::debug!(object = %self.meta.name, "managed_object_ready");
            self.monitor.activate_job_nodes(true).execute();
        } else {
            tracing::warn!(object = %self.meta.name, "managed_object_late_completion");
            self.meta.source.release(object);
        }
    }

    fn fail(&self, cause: Escalation) {
        {
            let mut slot = self.slot.lock();
            if !matches!(*slot, Slot::NotSourced | Slot::Sourcing { .. }) {
                return;
            }
            *slot = Slot::Failed(cause.clone());
        }
        tracing::warn!(object = %self.meta.name, cause = %cause, "managed_object_failed");
        self.monitor.fail_job_nodes(cause, true).execute();
    }

    /// Hand a ready object back to its source. Happens at most once.
    pub(crate) fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(object) = self.object() {
            let source = self.meta.source.clone();
            let result = with_recovery(
                || {
                    source.release(object);
                    Ok(())
                },
                &self.meta.name,
            );
            if let Err(error) = result {
                tracing::error!(object = %self.meta.name, "managed_object_release_failed: {}", error);
            }
        }
    }
}

impl Asset for ManagedObjectContainer {
    fn asset_name(&self) -> &str {
        &self.meta.name
    }

    fn check_on_asset(&self, context: &mut CheckAssetContext) {
        let cause = {
            let mut slot = self.slot.lock();
            match &*slot {
                Slot::Sourcing { deadline } if context.time() >= *deadline => {
                    let cause = Escalation::new(Error::timeout(format!(
                        "managed object '{}' not sourced within {:?}",
                        self.meta.name, self.meta.timeout
                    )));
                    *slot = Slot::Failed(cause.clone());
                    cause
                }
                _ => return,
            }
        };
        tracing::warn!(object = %self.meta.name, "managed_object_timed_out");
        context.fail_job_nodes(cause, true);
    }

    fn cancel_asset(&self, cause: &Escalation) -> bool {
        let mut slot = self.slot.lock();
        if !matches!(*slot, Slot::Sourcing { .. }) {
            return false;
        }
        *slot = Slot::Failed(cause.clone());
        true
    }
}

impl fmt::Debug for ManagedObjectContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedObjectContainer")
            .field("name", &self.meta.name)
            .field("scope", &self.meta.scope)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::JobNode;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Debug, Default)]
    struct Waiter {
        activated: AtomicUsize,
        failed: Mutex<Vec<String>>,
    }

    impl JobNode for Waiter {
        fn activate(self: Arc<Self>) {
            self.activated.fetch_add(1, Ordering::SeqCst);
        }

        fn fail(self: Arc<Self>, cause: Escalation) {
            self.failed.lock().push(cause.cause_type().to_string());
        }
    }

    fn meta(name: &str, timeout: Duration, source: Arc<dyn ManagedObjectSource>) -> Arc<ManagedObjectMeta> {
        Arc::new(ManagedObjectMeta {
            name: name.to_string(),
            scope: Scope::Process,
            source,
            dependencies: Vec::new(),
            timeout,
        })
    }

    /// Source keeping its context so the test decides when to complete.
    #[derive(Default)]
    struct DeferredSource {
        invocations: AtomicUsize,
        pending: Mutex<Vec<SourceContext>>,
        released: AtomicUsize,
    }

    impl ManagedObjectSource for DeferredSource {
        fn source(&self, context: SourceContext) -> Result<()> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            self.pending.lock().push(context);
            Ok(())
        }

        fn release(&self, _object: Object) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_synchronous_source_is_ready_immediately() {
        let manager = AssetManager::new("sourcing");
        let source = |context: SourceContext| -> Result<()> {
            context.complete_with(42u32);
            Ok(())
        };
        let container = ManagedObjectContainer::new(meta("answer", Duration::from_secs(1), Arc::new(source)), &manager);

        assert_eq!(container.state(), ContainerState::NotSourced);
        assert!(container.source(Vec::new()));
        assert_eq!(container.state(), ContainerState::Ready);

        let waiter = Arc::new(Waiter::default());
        match container.wait_until_ready(waiter) {
            Readiness::Ready(object) => assert_eq!(*downcast::<u32>(&object, "answer").unwrap(), 42),
            other => panic!("expected ready, got {other:?}"),
        }
        assert_eq!(manager.registered_count(), 0);
    }

    #[test]
    fn test_factory_invoked_once_and_waiters_share_ready() {
        let manager = AssetManager::new("sourcing");
        let source = Arc::new(DeferredSource::default());
        let container = ManagedObjectContainer::new(meta("db", Duration::from_secs(5), source.clone()), &manager);

        assert!(container.source(Vec::new()));
        assert!(!container.source(Vec::new()), "second caller must not re-invoke the factory");

        let first = Arc::new(Waiter::default());
        let second = Arc::new(Waiter::default());
        assert!(matches!(container.wait_until_ready(first.clone()), Readiness::Waiting));
        assert!(matches!(container.wait_until_ready(second.clone()), Readiness::Waiting));
        assert_eq!(source.invocations.load(Ordering::SeqCst), 1);

        let context = source.pending.lock().pop().unwrap();
        context.complete_with("connection".to_string());

        assert_eq!(container.state(), ContainerState::Ready);
        assert_eq!(first.activated.load(Ordering::SeqCst), 1);
        assert_eq!(second.activated.load(Ordering::SeqCst), 1);
        assert_eq!(manager.registered_count(), 0);
    }

    #[test]
    fn test_timeout_fails_container_on_sweep() {
        let manager = AssetManager::new("sourcing");
        let source = Arc::new(DeferredSource::default());
        let container = ManagedObjectContainer::new(meta("slow", Duration::from_millis(100), source.clone()), &manager);

        let started = Instant::now();
        container.source(Vec::new());
        let waiter = Arc::new(Waiter::default());
        assert!(matches!(container.wait_until_ready(waiter.clone()), Readiness::Waiting));

        manager.manage_assets_at(started + Duration::from_millis(50));
        assert_eq!(container.state(), ContainerState::Sourcing);

        manager.manage_assets_at(started + Duration::from_millis(150));
        assert_eq!(container.state(), ContainerState::Failed);
        assert_eq!(*waiter.failed.lock(), vec!["timeout"]);
        assert_eq!(container.failure().unwrap().cause_type().as_str(), "timeout");

        // Late completion is ignored and the object handed back
        let context = source.pending.lock().pop().unwrap();
        context.complete_with(1u8);
        assert_eq!(container.state(), ContainerState::Failed);
        assert_eq!(source.released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_source_error_keeps_original_cause() {
        let manager = AssetManager::new("sourcing");
        let source = |_context: SourceContext| -> Result<()> { Err(Error::function("db.unavailable", "refused")) };
        let container = ManagedObjectContainer::new(meta("db", Duration::from_secs(1), Arc::new(source)), &manager);

        container.source(Vec::new());
        assert_eq!(container.state(), ContainerState::Failed);

        let waiter = Arc::new(Waiter::default());
        match container.wait_until_ready(waiter) {
            Readiness::Failed(cause) => assert_eq!(cause.cause_type().as_str(), "db.unavailable"),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn test_panicking_source_fails_as_internal() {
        let manager = AssetManager::new("sourcing");
        let source = |_context: SourceContext| -> Result<()> { panic!("factory exploded") };
        let container = ManagedObjectContainer::new(meta("boom", Duration::from_secs(1), Arc::new(source)), &manager);

        container.source(Vec::new());
        assert_eq!(container.failure().unwrap().cause_type().as_str(), "internal");
    }

    #[test]
    fn test_release_happens_once() {
        let manager = AssetManager::new("sourcing");
        let source = Arc::new(DeferredSource::default());
        let container = ManagedObjectContainer::new(meta("db", Duration::from_secs(1), source.clone()), &manager);
        container.source(Vec::new());
        source.pending.lock().pop().unwrap().complete_with(7u64);

        container.release();
        container.release();
        assert_eq!(source.released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancel_fails_sourcing_container() {
        let manager = AssetManager::new("sourcing");
        let source = Arc::new(DeferredSource::default());
        let container = ManagedObjectContainer::new(meta("gate", Duration::from_secs(3600), source.clone()), &manager);
        container.source(Vec::new());
        let waiter = Arc::new(Waiter::default());
        assert!(matches!(container.wait_until_ready(waiter.clone()), Readiness::Waiting));

        assert_eq!(manager.cancel_assets(&Escalation::new(Error::cancelled("office closed"))), 1);
        assert_eq!(container.state(), ContainerState::Failed);
        assert_eq!(*waiter.failed.lock(), vec!["cancelled"]);

        // The source finishing afterwards gets its object handed back
        source.pending.lock().pop().unwrap().complete_with(1u8);
        assert_eq!(source.released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_sourcing_invokes_factory_once() {
        let manager = AssetManager::new("sourcing");
        let source = Arc::new(DeferredSource::default());
        let container = ManagedObjectContainer::new(meta("db", Duration::from_secs(5), source.clone()), &manager);
        let barrier = Arc::new(std::sync::Barrier::new(8));

        let winners: usize = (0..8)
            .map(|_| {
                let container = container.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    container.source(Vec::new())
                })
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|handle| usize::from(handle.join().unwrap()))
            .sum();

        assert_eq!(winners, 1);
        assert_eq!(source.invocations.load(Ordering::SeqCst), 1);
        assert_eq!(container.state(), ContainerState::Sourcing);
    }

    #[test]
    fn test_scope_dependency_rule() {
        assert!(Scope::Function.can_depend_on(Scope::Process));
        assert!(Scope::Thread.can_depend_on(Scope::Thread));
        assert!(!Scope::Process.can_depend_on(Scope::Thread));
        assert!(!Scope::Thread.can_depend_on(Scope::Function));
    }
}
