//! ThreadState - one logical thread of execution within a process.

use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::sync::Arc;

use super::{dispatch, Flow, FunctionState, ProcessState};
use crate::administration::AdministrationContainer;
use crate::escalation::{Escalation, EscalationProcedure};
use crate::governance::{Enlistment, GovernanceAction, GovernanceContainer, GovernanceInstance, GovernanceOperation, GovernanceState};
use crate::managed_object::{ManagedObjectContainer, ObjectRef, Scope};
use crate::office::{AdministrationIndex, GovernanceIndex};
use crate::types::{Error, Result, ThreadStateId};

/// State guarded by the thread lock.
#[derive(Debug)]
pub struct ThreadArena {
    governance: Vec<GovernanceContainer>,
    failure: Option<Escalation>,
    active_flows: usize,
    finalized: bool,
}

impl ThreadArena {
    pub fn governance_container(&self, index: GovernanceIndex) -> Option<&GovernanceContainer> {
        self.governance.get(index)
    }

    pub fn governance_container_mut(&mut self, index: GovernanceIndex) -> Option<&mut GovernanceContainer> {
        self.governance.get_mut(index)
    }

    pub fn failure(&self) -> Option<&Escalation> {
        self.failure.as_ref()
    }

    pub fn active_flows(&self) -> usize {
        self.active_flows
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }
}

/// Owner of thread-scoped managed objects, governance and administrations.
pub struct ThreadState {
    id: ThreadStateId,
    process: Arc<ProcessState>,
    objects: Vec<Arc<ManagedObjectContainer>>,
    administrations: Vec<AdministrationContainer>,
    arena: Mutex<ThreadArena>,
}

impl ThreadState {
    pub(crate) fn new(process: &Arc<ProcessState>) -> Arc<Self> {
        let office = process.office();
        let id = process.register_thread();

        let objects = office
            .meta
            .thread_objects
            .iter()
            .map(|meta| ManagedObjectContainer::new(meta.clone(), &office.sourcing))
            .collect();
        let governance = office
            .meta
            .governance
            .iter()
            .enumerate()
            .map(|(index, meta)| GovernanceContainer::new(index, meta.clone()))
            .collect();
        let administrations = office
            .meta
            .administrations
            .iter()
            .map(|meta| AdministrationContainer::new(meta.clone()))
            .collect();

        tracing::debug!(process = %process.id(), thread = %id, "thread_started");
        Arc::new(Self {
            id,
            process: process.clone(),
            objects,
            administrations,
            arena: Mutex::new(ThreadArena {
                governance,
                failure: None,
                active_flows: 0,
                finalized: false,
            }),
        })
    }

    pub fn id(&self) -> ThreadStateId {
        self.id
    }

    pub fn process(&self) -> &Arc<ProcessState> {
        &self.process
    }

    /// Take the thread lock. Never call back into the kernel while holding it.
    pub fn lock(&self) -> MutexGuard<'_, ThreadArena> {
        self.arena.lock()
    }

    pub fn managed_object_container(&self, index: usize) -> Option<&Arc<ManagedObjectContainer>> {
        self.objects.get(index)
    }

    pub fn administration_container(&self, index: AdministrationIndex) -> Option<&AdministrationContainer> {
        self.administrations.get(index)
    }

    pub fn governance_state(&self, index: GovernanceIndex) -> Option<GovernanceState> {
        self.arena.lock().governance.get(index).map(GovernanceContainer::state)
    }

    pub fn escalation_procedure(&self) -> &EscalationProcedure {
        &self.process.office().meta.thread_escalation
    }

    /// Record the escalation that left this thread's flows unhandled.
    pub fn set_failure(&self, cause: Escalation) {
        self.arena.lock().failure = Some(cause);
    }

    pub fn failure(&self) -> Option<Escalation> {
        self.arena.lock().failure.clone()
    }

    /// Thread or process container for `object`. Function-scoped objects are
    /// owned by their FunctionState.
    pub(crate) fn container(&self, object: ObjectRef) -> Option<Arc<ManagedObjectContainer>> {
        match object.scope {
            Scope::Thread => self.objects.get(object.index).cloned(),
            Scope::Process => self.process.managed_object_container(object.index).cloned(),
            Scope::Function => None,
        }
    }

    pub(crate) fn begin_flow(&self) {
        self.arena.lock().active_flows += 1;
    }

    /// Apply governance transitions under the thread lock, returning the
    /// continuations to schedule.
    pub(crate) fn governance_operations(
        &self,
        requests: &[(GovernanceIndex, GovernanceAction)],
    ) -> Result<Vec<GovernanceOperation>> {
        let mut arena = self.arena.lock();
        requests
            .iter()
            .map(|(index, action)| {
                arena
                    .governance
                    .get_mut(*index)
                    .map(|container| container.operation(*action))
                    .ok_or_else(|| Error::not_found(format!("governance {index}")))
            })
            .collect()
    }

    pub(crate) fn install_governance(&self, index: GovernanceIndex, instance: GovernanceInstance) -> bool {
        self.arena
            .lock()
            .governance
            .get_mut(index)
            .map_or(false, |container| container.install(instance))
    }

    /// Extensions of ready objects not yet handed to the active governance.
    pub(crate) fn collect_enlistments(&self) -> Vec<Enlistment> {
        let mut arena = self.arena.lock();
        let mut enlistments = Vec::new();
        for governance in arena.governance.iter_mut() {
            enlistments.extend(governance.pending_enlistments(|object| {
                self.container(object).and_then(|container| container.object())
            }));
        }
        enlistments
    }

    /// A flow of this thread completed. The last one deactivates governance
    /// still active, then completes the thread.
    pub(crate) fn flow_completed(self: &Arc<Self>) {
        let deactivations: Vec<GovernanceOperation> = {
            let mut arena = self.arena.lock();
            arena.active_flows = arena.active_flows.saturating_sub(1);
            if arena.active_flows > 0 || arena.finalized {
                return;
            }
            let operations: Vec<GovernanceOperation> = arena
                .governance
                .iter_mut()
                .map(GovernanceContainer::deactivate)
                .filter(|operation| !operation.is_complete())
                .collect();
            if operations.is_empty() {
                arena.finalized = true;
            } else {
                // The deactivation flow keeps the thread alive
                arena.active_flows += 1;
            }
            operations
        };

        if deactivations.is_empty() {
            self.finalize();
            return;
        }

        tracing::debug!(thread = %self.id, count = deactivations.len(), "governance_implicit_deactivation");
        let flow = Flow::adopt(self.clone(), EscalationProcedure::default(), None, None);
        match FunctionState::governance_chain(&flow, deactivations, None) {
            Some(head) => dispatch(head),
            None => {
                flow.finish(None);
            }
        }
    }

    fn finalize(&self) {
        for container in &self.objects {
            container.release();
        }
        tracing::debug!(process = %self.process.id(), thread = %self.id, "thread_completed");
        self.process.thread_completed();
    }
}

impl fmt::Debug for ThreadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadState")
            .field("id", &self.id)
            .field("process", self.process.id())
            .field("objects", &self.objects.len())
            .field("administrations", &self.administrations.len())
            .finish_non_exhaustive()
    }
}
