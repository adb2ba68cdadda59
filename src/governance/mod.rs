//! Governance - transaction-like oversight over managed object extensions.
//!
//! One [`GovernanceContainer`] exists per (thread, governance) and lives in
//! the thread arena, so every transition happens under the thread lock:
//!
//! ```text
//! Unactivated → Active → Enforced
//!                      ↘ Disregarded
//! ```
//!
//! Container operations never run governance logic themselves. They decide
//! the transition and hand back a [`GovernanceOperation`] that the caller
//! schedules as a continuation. Enforcing or disregarding while unactivated,
//! or repeating a terminal transition, yields [`GovernanceOperation::Complete`].

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::managed_object::{Extension, ExtensionRef, Object, ObjectRef};
use crate::office::{GovernanceIndex, GovernanceMeta};
use crate::types::{Error, Result};

/// Governance logic enlisting extensions and later committing or
/// discarding them.
pub trait Governance: Send {
    fn govern(&mut self, extension: Extension) -> Result<()>;

    fn enforce(&mut self) -> Result<()>;

    fn disregard(&mut self) -> Result<()>;
}

/// Creates the governance instance for a thread on activation.
pub trait GovernanceSource: Send + Sync {
    fn create_governance(&self) -> Result<Box<dyn Governance>>;
}

impl<F> GovernanceSource for F
where
    F: Fn() -> Result<Box<dyn Governance>> + Send + Sync,
{
    fn create_governance(&self) -> Result<Box<dyn Governance>> {
        self()
    }
}

/// Live governance instance shared between the arena and running steps.
pub type GovernanceInstance = Arc<Mutex<Box<dyn Governance>>>;

/// What happens to governance still active when its thread completes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GovernanceDeactivation {
    #[default]
    Disregard,
    Enforce,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GovernanceState {
    Unactivated,
    Active,
    Enforced,
    Disregarded,
}

impl GovernanceState {
    pub fn is_terminal(self) -> bool {
        matches!(self, GovernanceState::Enforced | GovernanceState::Disregarded)
    }
}

/// Requested governance transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GovernanceAction {
    Activate,
    Enforce,
    Disregard,
}

/// Continuation produced by a governance transition.
#[derive(Clone)]
pub enum GovernanceOperation {
    /// Nothing to do.
    Complete,
    /// Create the instance and enlist the visible extensions.
    Activate { index: GovernanceIndex },
    Enforce {
        index: GovernanceIndex,
        instance: GovernanceInstance,
    },
    Disregard {
        index: GovernanceIndex,
        instance: GovernanceInstance,
    },
}

impl GovernanceOperation {
    pub fn is_complete(&self) -> bool {
        matches!(self, GovernanceOperation::Complete)
    }

    pub fn index(&self) -> Option<GovernanceIndex> {
        match self {
            GovernanceOperation::Complete => None,
            GovernanceOperation::Activate { index }
            | GovernanceOperation::Enforce { index, .. }
            | GovernanceOperation::Disregard { index, .. } => Some(*index),
        }
    }
}

impl fmt::Debug for GovernanceOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GovernanceOperation::Complete => write!(f, "Complete"),
            GovernanceOperation::Activate { index } => write!(f, "Activate({index})"),
            GovernanceOperation::Enforce { index, .. } => write!(f, "Enforce({index})"),
            GovernanceOperation::Disregard { index, .. } => write!(f, "Disregard({index})"),
        }
    }
}

/// An extension waiting to be handed to an active governance.
pub struct Enlistment {
    governance: String,
    instance: GovernanceInstance,
    extension: ExtensionRef,
    object: Object,
}

impl Enlistment {
    /// Extract the extension and pass it to the governance.
    pub fn govern(self) -> Result<()> {
        let extension = self.extension.extend(&self.object)?;
        self.instance
            .lock()
            .govern(extension)
            .map_err(|e| Error::governance(format!("{}: {}", self.governance, e)))
    }
}

impl fmt::Debug for Enlistment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Enlistment")
            .field("governance", &self.governance)
            .field("object", &self.extension.object)
            .finish()
    }
}

/// Per-thread state of one governance.
pub struct GovernanceContainer {
    index: GovernanceIndex,
    meta: Arc<GovernanceMeta>,
    state: GovernanceState,
    instance: Option<GovernanceInstance>,
    enlisted: Vec<bool>,
}

impl GovernanceContainer {
    pub fn new(index: GovernanceIndex, meta: Arc<GovernanceMeta>) -> Self {
        let enlisted = vec![false; meta.extensions.len()];
        Self {
            index,
            meta,
            state: GovernanceState::Unactivated,
            instance: None,
            enlisted,
        }
    }

    pub fn name(&self) -> &str {
        &self.meta.name
    }

    pub fn state(&self) -> GovernanceState {
        self.state
    }

    pub fn enlisted_count(&self) -> usize {
        self.enlisted.iter().filter(|e| **e).count()
    }

    pub fn operation(&mut self, action: GovernanceAction) -> GovernanceOperation {
        match action {
            GovernanceAction::Activate => self.activate_governance(),
            GovernanceAction::Enforce => self.enforce_governance(),
            GovernanceAction::Disregard => self.disregard_governance(),
        }
    }

    /// The state moves to `Active` only once the activation step installs
    /// the instance.
    pub fn activate_governance(&mut self) -> GovernanceOperation {
        match self.state {
            GovernanceState::Unactivated => GovernanceOperation::Activate { index: self.index },
            _ => GovernanceOperation::Complete,
        }
    }

    pub fn enforce_governance(&mut self) -> GovernanceOperation {
        match self.finish(GovernanceState::Enforced) {
            Some(instance) => GovernanceOperation::Enforce {
                index: self.index,
                instance,
            },
            None => GovernanceOperation::Complete,
        }
    }

    pub fn disregard_governance(&mut self) -> GovernanceOperation {
        match self.finish(GovernanceState::Disregarded) {
            Some(instance) => GovernanceOperation::Disregard {
                index: self.index,
                instance,
            },
            None => GovernanceOperation::Complete,
        }
    }

    /// Apply the configured deactivation policy if still active.
    pub fn deactivate(&mut self) -> GovernanceOperation {
        match self.meta.deactivation {
            GovernanceDeactivation::Disregard => self.disregard_governance(),
            GovernanceDeactivation::Enforce => self.enforce_governance(),
        }
    }

    fn finish(&mut self, terminal: GovernanceState) -> Option<GovernanceInstance> {
        if self.state != GovernanceState::Active {
            return None;
        }
        tracing::debug!(governance = %self.meta.name, state = ?terminal, "governance_transition");
        self.state = terminal;
        self.instance.take()
    }

    /// Install a freshly created instance. Returns false if the governance
    /// already left `Unactivated`, in which case the instance is dropped.
    pub(crate) fn install(&mut self, instance: GovernanceInstance) -> bool {
        if self.state != GovernanceState::Unactivated {
            return false;
        }
        tracing::debug!(governance = %self.meta.name, "governance_activated");
        self.state = GovernanceState::Active;
        self.instance = Some(instance);
        true
    }

    /// Extensions of ready objects not yet handed to this governance.
    /// Marks them enlisted.
    pub(crate) fn pending_enlistments(
        &mut self,
        ready: impl Fn(ObjectRef) -> Option<Object>,
    ) -> Vec<Enlistment> {
        let Some(instance) = self.instance.as_ref() else {
            return Vec::new();
        };
        if self.state != GovernanceState::Active {
            return Vec::new();
        }

        let mut enlistments = Vec::new();
        for (slot, extension) in self.meta.extensions.iter().enumerate() {
            if self.enlisted[slot] {
                continue;
            }
            if let Some(object) = ready(extension.object) {
                self.enlisted[slot] = true;
                enlistments.push(Enlistment {
                    governance: self.meta.name.clone(),
                    instance: instance.clone(),
                    extension: extension.clone(),
                    object,
                });
            }
        }
        enlistments
    }
}

impl fmt::Debug for GovernanceContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GovernanceContainer")
            .field("index", &self.index)
            .field("name", &self.meta.name)
            .field("state", &self.state)
            .field("enlisted", &self.enlisted_count())
            .finish()
    }
}

/// Run the user side of an enforce/disregard operation.
pub(crate) fn conclude(name: &str, operation: &GovernanceOperation) -> Result<()> {
    let result = match operation {
        GovernanceOperation::Enforce { instance, .. } => instance.lock().enforce(),
        GovernanceOperation::Disregard { instance, .. } => instance.lock().disregard(),
        _ => Ok(()),
    };
    result.map_err(|e| Error::governance(format!("{name}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::managed_object::Scope;

    #[derive(Default)]
    struct Recorder {
        events: Arc<Mutex<Vec<String>>>,
    }

    impl Governance for Recorder {
        fn govern(&mut self, extension: Extension) -> Result<()> {
            let value = extension.downcast_ref::<String>().cloned().unwrap_or_default();
            self.events.lock().push(format!("govern:{value}"));
            Ok(())
        }

        fn enforce(&mut self) -> Result<()> {
            self.events.lock().push("enforce".to_string());
            Ok(())
        }

        fn disregard(&mut self) -> Result<()> {
            self.events.lock().push("disregard".to_string());
            Ok(())
        }
    }

    fn meta(deactivation: GovernanceDeactivation) -> Arc<GovernanceMeta> {
        let source = || -> Result<Box<dyn Governance>> { Ok(Box::new(Recorder::default())) };
        Arc::new(GovernanceMeta {
            name: "tx".to_string(),
            source: Arc::new(source),
            extensions: vec![ExtensionRef {
                object: ObjectRef::new(Scope::Thread, 0),
                factory: Arc::new(|object: &Object| Ok(object.clone())),
            }],
            team: None,
            deactivation,
        })
    }

    fn active(events: &Arc<Mutex<Vec<String>>>) -> GovernanceContainer {
        let mut container = GovernanceContainer::new(0, meta(GovernanceDeactivation::Disregard));
        let instance: GovernanceInstance = Arc::new(Mutex::new(Box::new(Recorder {
            events: events.clone(),
        })));
        assert!(container.install(instance));
        container
    }

    #[test]
    fn test_enforce_while_unactivated_is_complete() {
        let mut container = GovernanceContainer::new(0, meta(GovernanceDeactivation::Disregard));
        assert!(container.enforce_governance().is_complete());
        assert!(container.disregard_governance().is_complete());
        assert_eq!(container.state(), GovernanceState::Unactivated);
    }

    #[test]
    fn test_activate_returns_operation_until_installed() {
        let mut container = GovernanceContainer::new(3, meta(GovernanceDeactivation::Disregard));
        assert_eq!(container.activate_governance().index(), Some(3));
        assert_eq!(container.state(), GovernanceState::Unactivated);

        let events = Arc::new(Mutex::new(Vec::new()));
        let instance: GovernanceInstance = Arc::new(Mutex::new(Box::new(Recorder { events })));
        assert!(container.install(instance.clone()));
        assert!(!container.install(instance), "second install is rejected");
        assert!(container.activate_governance().is_complete());
    }

    #[test]
    fn test_enforce_is_idempotent() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let mut container = active(&events);

        let first = container.enforce_governance();
        assert!(!first.is_complete());
        assert!(container.enforce_governance().is_complete());
        assert!(container.disregard_governance().is_complete());
        assert_eq!(container.state(), GovernanceState::Enforced);

        conclude("tx", &first).unwrap();
        assert_eq!(*events.lock(), vec!["enforce"]);
    }

    #[test]
    fn test_disregard_is_idempotent() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let mut container = active(&events);

        assert!(!container.disregard_governance().is_complete());
        assert!(container.disregard_governance().is_complete());
        assert_eq!(container.state(), GovernanceState::Disregarded);
    }

    #[test]
    fn test_deactivation_policy() {
        let mut container = GovernanceContainer::new(0, meta(GovernanceDeactivation::Enforce));
        let events = Arc::new(Mutex::new(Vec::new()));
        assert!(container.install(Arc::new(Mutex::new(Box::new(Recorder { events })))));

        let operation = container.deactivate();
        assert!(matches!(operation, GovernanceOperation::Enforce { .. }));
        assert!(container.deactivate().is_complete());
    }

    #[test]
    fn test_pending_enlistments_only_once() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let mut container = active(&events);

        assert!(container.pending_enlistments(|_| None).is_empty());

        let object: Object = Arc::new("row-1".to_string());
        let enlistments = container.pending_enlistments(|_| Some(object.clone()));
        assert_eq!(enlistments.len(), 1);
        for enlistment in enlistments {
            enlistment.govern().unwrap();
        }
        assert!(container.pending_enlistments(|_| Some(object.clone())).is_empty());
        assert_eq!(container.enlisted_count(), 1);
        assert_eq!(*events.lock(), vec!["govern:row-1"]);
    }
}
