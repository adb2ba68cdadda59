//! FunctionState - one schedulable continuation.
//!
//! A function continuation walks through its phases, re-entering at the
//! phase it suspended in whenever an asset wakes it:
//!
//! ```text
//! Governance → Load → Enlist → PreDuties → Execute → PostDuties → AwaitAsynchronous → Finish
//! ```
//!
//! Governance activation and governance requested by pre-duties run as
//! separate continuations ahead of the function, chained back to it.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

use super::escalate::{escalate, escalate_in_flow};
use super::{dispatch, Flow, Next, PendingCallback, ProcessState, ThreadState};
use crate::administration::{DutyAssociation, DutyOutcome};
use crate::asset::JobNode;
use crate::escalation::{Escalation, EscalationLevel};
use crate::function::{AsynchronousFlow, AsynchronousReadiness, FlowRequest, FunctionContext, InstigationStrategy, Parameter};
use crate::governance::{self, GovernanceAction, GovernanceOperation};
use crate::kernel::with_recovery;
use crate::managed_object::{ManagedObjectContainer, Object, ObjectRef, Readiness, Scope};
use crate::office::{FunctionIndex, FunctionMeta, GovernanceIndex, OfficeRuntime, TeamIndex};
use crate::types::{Error, Result};

type Escalated<T> = std::result::Result<T, Escalation>;

pub(crate) enum Step {
    Function {
        meta: Arc<FunctionMeta>,
        parameter: Option<Parameter>,
    },
    Governance(GovernanceOperation),
    /// Sequential flow instigated when this step is reached.
    Sequential(Mutex<Option<FlowRequest>>),
    /// Placeholder continuation resuming a flow.
    Complete,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum Phase {
    #[default]
    Governance,
    Load,
    Enlist,
    PreDuties,
    Execute,
    PostDuties,
    AwaitAsynchronous,
    Finish,
}

#[derive(Default)]
struct Progress {
    phase: Phase,
    failure: Option<Escalation>,
    result: Option<Parameter>,
    flows: Vec<FlowRequest>,
    governance: Vec<(GovernanceIndex, GovernanceAction)>,
    asynchronous: Vec<AsynchronousFlow>,
}

enum PhaseOutcome {
    Advance(Phase),
    Yield(Next),
}

/// One continuation of a flow.
pub struct FunctionState {
    flow: Arc<Flow>,
    step: Step,
    team: Option<TeamIndex>,
    then: Option<Arc<FunctionState>>,
    handled_at: Option<EscalationLevel>,
    function_objects: Vec<Option<Arc<ManagedObjectContainer>>>,
    progress: Mutex<Progress>,
}

impl FunctionState {
    fn with_step(flow: Arc<Flow>, step: Step, team: Option<TeamIndex>, then: Option<Arc<Self>>) -> Arc<Self> {
        Arc::new(Self {
            flow,
            step,
            team,
            then,
            handled_at: None,
            function_objects: Vec::new(),
            progress: Mutex::new(Progress::default()),
        })
    }

    /// Continuation executing function `index`. `handled_at` marks escalation
    /// handlers: their failures search strictly above that level.
    pub(crate) fn function(
        flow: Arc<Flow>,
        index: FunctionIndex,
        parameter: Option<Parameter>,
        handled_at: Option<EscalationLevel>,
    ) -> Result<Arc<Self>> {
        let office = flow.thread().process().office().clone();
        let meta = office
            .meta
            .functions
            .get(index)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("function {index}")))?;

        let mut function_objects = vec![None; office.meta.function_objects.len()];
        for object in meta.load_order.iter().filter(|object| object.scope == Scope::Function) {
            if let (Some(slot), Some(object_meta)) = (
                function_objects.get_mut(object.index),
                office.meta.function_objects.get(object.index),
            ) {
                *slot = Some(ManagedObjectContainer::new(object_meta.clone(), &office.sourcing));
            }
        }

        Ok(Arc::new(Self {
            flow,
            team: Some(meta.team),
            step: Step::Function { meta, parameter },
            then: None,
            handled_at,
            function_objects,
            progress: Mutex::new(Progress::default()),
        }))
    }

    pub(crate) fn governance(flow: Arc<Flow>, operation: GovernanceOperation, then: Option<Arc<Self>>) -> Arc<Self> {
        let team = operation
            .index()
            .and_then(|index| flow.thread().process().office().meta.governance.get(index))
            .and_then(|meta| meta.team);
        Self::with_step(flow, Step::Governance(operation), team, then)
    }

    pub(crate) fn sequential(flow: Arc<Flow>, request: FlowRequest, then: Option<Arc<Self>>) -> Arc<Self> {
        Self::with_step(flow, Step::Sequential(Mutex::new(Some(request))), None, then)
    }

    pub(crate) fn complete(flow: Arc<Flow>, then: Option<Arc<Self>>) -> Arc<Self> {
        Self::with_step(flow, Step::Complete, None, then)
    }

    /// Chain the operations in order, ending with `then`. Operations that are
    /// already complete are skipped.
    pub(crate) fn governance_chain(
        flow: &Arc<Flow>,
        operations: Vec<GovernanceOperation>,
        then: Option<Arc<Self>>,
    ) -> Option<Arc<Self>> {
        operations
            .into_iter()
            .rev()
            .filter(|operation| !operation.is_complete())
            .fold(then, |then, operation| Some(Self::governance(flow.clone(), operation, then)))
    }

    pub fn flow(&self) -> &Arc<Flow> {
        &self.flow
    }

    pub fn thread(&self) -> &Arc<ThreadState> {
        self.flow.thread()
    }

    pub fn process(&self) -> &Arc<ProcessState> {
        self.thread().process()
    }

    /// Team this continuation must run on; `None` runs on whichever team
    /// reaches it.
    pub fn team(&self) -> Option<TeamIndex> {
        self.team
    }

    pub fn handled_at(&self) -> Option<EscalationLevel> {
        self.handled_at
    }

    /// Whether running this continuation does nothing but resume its flow.
    pub fn is_complete(&self) -> bool {
        matches!(
            self.step,
            Step::Complete | Step::Governance(GovernanceOperation::Complete)
        )
    }

    pub fn function_name(&self) -> Option<&str> {
        match &self.step {
            Step::Function { meta, .. } => Some(&meta.name),
            _ => None,
        }
    }

    pub(crate) fn function_meta(&self) -> Option<&Arc<FunctionMeta>> {
        match &self.step {
            Step::Function { meta, .. } => Some(meta),
            _ => None,
        }
    }

    fn office(&self) -> &Arc<OfficeRuntime> {
        self.process().office()
    }

    pub(crate) fn container(&self, object: ObjectRef) -> Option<Arc<ManagedObjectContainer>> {
        match object.scope {
            Scope::Function => self.function_objects.get(object.index).cloned().flatten(),
            _ => self.thread().container(object),
        }
    }

    pub(crate) fn release_function_objects(&self) {
        for container in self.function_objects.iter().flatten() {
            container.release();
        }
    }

    // =========================================================================
    // Running
    // =========================================================================

    pub(crate) fn run(self: &Arc<Self>) -> Next {
        if self.process().is_aborted() {
            tracing::debug!(process = %self.process().id(), "continuation_abandoned");
            self.release_function_objects();
            self.flow.abandon();
            return Next::Complete;
        }

        let failure = self.progress.lock().failure.take();
        if let Some(cause) = failure {
            return escalate(self, cause);
        }

        match &self.step {
            Step::Complete => self.proceed(),
            Step::Governance(operation) => self.run_governance(operation),
            Step::Sequential(request) => self.run_sequential(request),
            Step::Function { meta, parameter } => self.run_function(meta, parameter),
        }
    }

    fn proceed(&self) -> Next {
        match &self.then {
            Some(next) => Next::Continue(next.clone()),
            None => self.flow.finish(None),
        }
    }

    fn run_governance(self: &Arc<Self>, operation: &GovernanceOperation) -> Next {
        let result = with_recovery(
            || match operation {
                GovernanceOperation::Complete => Ok(()),
                GovernanceOperation::Activate { index } => self.activate_governance(*index),
                other => {
                    let name = other
                        .index()
                        .and_then(|index| self.office().meta.governance.get(index))
                        .map_or_else(|| "governance".to_string(), |meta| meta.name.clone());
                    governance::conclude(&name, other)
                }
            },
            "governance",
        );
        match result {
            Ok(()) => self.proceed(),
            Err(error) => escalate(self, Escalation::new(error)),
        }
    }

    fn activate_governance(&self, index: GovernanceIndex) -> Result<()> {
        let meta = self
            .office()
            .meta
            .governance
            .get(index)
            .ok_or_else(|| Error::not_found(format!("governance {index}")))?;
        let instance = meta
            .source
            .create_governance()
            .map_err(|e| Error::governance(format!("{}: {}", meta.name, e)))?;

        let thread = self.thread();
        if thread.install_governance(index, Arc::new(Mutex::new(instance))) {
            for enlistment in thread.collect_enlistments() {
                enlistment.govern()?;
            }
        }
        Ok(())
    }

    fn run_sequential(self: &Arc<Self>, request: &Mutex<Option<FlowRequest>>) -> Next {
        let taken = request.lock().take();
        let Some(FlowRequest { flow: meta, parameter, callback }) = taken else {
            return self.proceed();
        };

        let thread = self.thread().clone();
        let continuation = match &self.then {
            Some(next) => next.clone(),
            None => FunctionState::complete(self.flow.clone(), None),
        };
        let callback = callback.map(|callback| PendingCallback::new(callback, thread.clone()));
        let flow = Flow::new(thread, meta.escalation.clone(), callback, Some(continuation));

        tracing::debug!(thread = %flow.thread().id(), function = meta.function, "sequential_flow_instigated");
        match FunctionState::function(flow.clone(), meta.function, parameter, None) {
            Ok(head) => Next::Continue(head),
            Err(error) => escalate_in_flow(flow, None, Escalation::new(error), None),
        }
    }

    fn run_function(self: &Arc<Self>, meta: &Arc<FunctionMeta>, parameter: &Option<Parameter>) -> Next {
        loop {
            let phase = self.progress.lock().phase;
            let outcome = match phase {
                Phase::Governance => self.require_governance(meta),
                Phase::Load => self.load(meta),
                Phase::Enlist => self.enlist(),
                Phase::PreDuties => self.administer(&meta.pre_duties, Phase::Execute, true),
                Phase::Execute => self.execute(meta, parameter),
                Phase::PostDuties => self.administer(&meta.post_duties, Phase::AwaitAsynchronous, false),
                Phase::AwaitAsynchronous => self.await_asynchronous(),
                Phase::Finish => return self.finish_function(meta),
            };
            match outcome {
                Ok(PhaseOutcome::Advance(next)) => self.progress.lock().phase = next,
                Ok(PhaseOutcome::Yield(next)) => return next,
                Err(cause) => return escalate(self, cause),
            }
        }
    }

    /// Run `operations` ahead of this continuation, resuming it at `next`.
    fn run_ahead(self: &Arc<Self>, operations: Vec<GovernanceOperation>, next: Phase) -> PhaseOutcome {
        if operations.iter().all(GovernanceOperation::is_complete) {
            return PhaseOutcome::Advance(next);
        }
        self.progress.lock().phase = next;
        match FunctionState::governance_chain(&self.flow, operations, Some(self.clone())) {
            Some(head) => PhaseOutcome::Yield(Next::Continue(head)),
            None => PhaseOutcome::Advance(next),
        }
    }

    fn require_governance(self: &Arc<Self>, meta: &FunctionMeta) -> Escalated<PhaseOutcome> {
        if meta.governance.is_empty() {
            return Ok(PhaseOutcome::Advance(Phase::Load));
        }
        let requests: Vec<_> = meta
            .governance
            .iter()
            .map(|index| (*index, GovernanceAction::Activate))
            .collect();
        let operations = self.thread().governance_operations(&requests)?;
        Ok(self.run_ahead(operations, Phase::Load))
    }

    fn load(self: &Arc<Self>, meta: &FunctionMeta) -> Escalated<PhaseOutcome> {
        for object in &meta.load_order {
            let container = self.container(*object).ok_or_else(|| {
                Error::internal(format!("managed object {object:?} of '{}' unavailable", meta.name))
            })?;
            loop {
                match container.wait_until_ready(self.clone()) {
                    Readiness::Ready(_) => break,
                    Readiness::Failed(cause) => return Err(cause),
                    Readiness::NotSourced => {
                        let dependencies = self.dependencies(&container)?;
                        container.source(dependencies);
                    }
                    Readiness::Waiting => return Ok(PhaseOutcome::Yield(Next::Suspended)),
                    Readiness::Resolved(activations) => {
                        activations.execute();
                        return Ok(PhaseOutcome::Yield(Next::Suspended));
                    }
                }
            }
        }
        Ok(PhaseOutcome::Advance(Phase::Enlist))
    }

    fn dependencies(&self, container: &ManagedObjectContainer) -> Result<Vec<Object>> {
        container
            .meta()
            .dependencies
            .iter()
            .map(|dependency| {
                self.container(*dependency)
                    .and_then(|c| c.object())
                    .ok_or_else(|| Error::internal(format!("dependency of '{}' not ready", container.name())))
            })
            .collect()
    }

    fn enlist(&self) -> Escalated<PhaseOutcome> {
        let enlistments = self.thread().collect_enlistments();
        if !enlistments.is_empty() {
            with_recovery(
                || {
                    for enlistment in enlistments {
                        enlistment.govern()?;
                    }
                    Ok(())
                },
                "governance_enlistment",
            )?;
        }
        Ok(PhaseOutcome::Advance(Phase::PreDuties))
    }

    fn administer(
        self: &Arc<Self>,
        duties: &[DutyAssociation],
        next: Phase,
        before_execution: bool,
    ) -> Escalated<PhaseOutcome> {
        for association in duties {
            let outcome = self.do_duty(association)?;
            let mut progress = self.progress.lock();
            progress.flows.extend(outcome.flows);
            progress.governance.extend(outcome.governance);
        }
        if !before_execution {
            return Ok(PhaseOutcome::Advance(next));
        }

        let requests = std::mem::take(&mut self.progress.lock().governance);
        if requests.is_empty() {
            return Ok(PhaseOutcome::Advance(next));
        }
        let operations = self.thread().governance_operations(&requests)?;
        Ok(self.run_ahead(operations, next))
    }

    fn do_duty(&self, association: &DutyAssociation) -> Result<DutyOutcome> {
        let container = self
            .thread()
            .administration_container(association.administration)
            .ok_or_else(|| Error::not_found(format!("administration {}", association.administration)))?;

        let extensions = with_recovery(
            || {
                container
                    .meta()
                    .extensions
                    .iter()
                    .map(|extension| {
                        let object = self.container(extension.object).and_then(|c| c.object()).ok_or_else(|| {
                            Error::internal(format!(
                                "object administered by '{}' not ready",
                                container.meta().name
                            ))
                        })?;
                        extension.extend(&object)
                    })
                    .collect::<Result<Vec<_>>>()
            },
            &container.meta().name,
        )?;
        container.do_duty(association.duty, extensions)
    }

    fn execute(&self, meta: &FunctionMeta, parameter: &Option<Parameter>) -> Escalated<PhaseOutcome> {
        let objects = meta
            .objects
            .iter()
            .map(|object| {
                self.container(*object)
                    .and_then(|c| c.object())
                    .ok_or_else(|| Error::internal(format!("object {object:?} of '{}' not ready", meta.name)))
            })
            .collect::<Result<Vec<_>>>()?;

        let office = self.office();
        let mut context = FunctionContext::new(
            &meta.name,
            parameter.clone(),
            objects,
            &meta.flows,
            &office.asynchronous,
            office.meta.defaults.asynchronous_flow_timeout,
        );

        tracing::trace!(function = %meta.name, thread = %self.thread().id(), "function_executing");
        let result = with_recovery(|| meta.logic.execute(&mut context), &meta.name);
        let (flows, asynchronous) = context.into_requests();
        let result = result?;

        let mut progress = self.progress.lock();
        progress.result = result;
        progress.flows.extend(flows);
        progress.asynchronous.extend(asynchronous);
        Ok(PhaseOutcome::Advance(Phase::PostDuties))
    }

    fn await_asynchronous(self: &Arc<Self>) -> Escalated<PhaseOutcome> {
        let pending = self.progress.lock().asynchronous.clone();
        for flow in pending {
            match flow.wait(self.clone()) {
                AsynchronousReadiness::Completed => {}
                AsynchronousReadiness::Failed(cause) => return Err(cause),
                AsynchronousReadiness::Waiting => return Ok(PhaseOutcome::Yield(Next::Suspended)),
                AsynchronousReadiness::Resolved(activations) => {
                    activations.execute();
                    return Ok(PhaseOutcome::Yield(Next::Suspended));
                }
            }
        }
        Ok(PhaseOutcome::Advance(Phase::Finish))
    }

    /// Instigate requested flows and build the rest of the chain:
    /// governance requests, then sequential flows, then the next function.
    fn finish_function(self: &Arc<Self>, meta: &FunctionMeta) -> Next {
        self.release_function_objects();
        let (result, flows, governance) = {
            let mut progress = self.progress.lock();
            (
                progress.result.take(),
                std::mem::take(&mut progress.flows),
                std::mem::take(&mut progress.governance),
            )
        };

        let mut sequential = Vec::new();
        for request in flows {
            match request.strategy() {
                InstigationStrategy::Sequential => sequential.push(request),
                InstigationStrategy::ParallelThread => self.spawn_thread(request),
                InstigationStrategy::Asynchronous => self.spawn_asynchronous(request),
            }
        }

        let mut then = match meta.next {
            Some(next) => match FunctionState::function(self.flow.clone(), next, result, self.handled_at) {
                Ok(state) => Some(state),
                Err(error) => return escalate(self, Escalation::new(error)),
            },
            None => None,
        };
        for request in sequential.into_iter().rev() {
            then = Some(FunctionState::sequential(self.flow.clone(), request, then));
        }
        let operations = match self.thread().governance_operations(&governance) {
            Ok(operations) => operations,
            Err(error) => return escalate(self, Escalation::new(error)),
        };
        then = FunctionState::governance_chain(&self.flow, operations, then);

        tracing::debug!(function = %meta.name, thread = %self.thread().id(), "function_completed");
        match then {
            Some(next) => Next::Continue(next),
            None => self.flow.finish(None),
        }
    }

    fn spawn_thread(&self, request: FlowRequest) {
        let FlowRequest { flow: meta, parameter, callback } = request;
        let thread = ThreadState::new(self.process());
        let callback = callback.map(|callback| PendingCallback::new(callback, self.thread().clone()));
        let flow = Flow::new(thread, meta.escalation.clone(), callback, None);
        tracing::debug!(
            process = %self.process().id(),
            thread = %flow.thread().id(),
            function = meta.function,
            "parallel_thread_instigated"
        );
        start_flow(flow, meta.function, parameter);
    }

    fn spawn_asynchronous(&self, request: FlowRequest) {
        let FlowRequest { flow: meta, parameter, callback } = request;
        let thread = self.thread().clone();
        let callback = callback.map(|callback| PendingCallback::new(callback, thread.clone()));
        let flow = Flow::new(thread, meta.escalation.clone(), callback, None);
        tracing::debug!(thread = %flow.thread().id(), function = meta.function, "asynchronous_flow_instigated");
        start_flow(flow, meta.function, parameter);
    }
}

/// Dispatch the first function of a fresh flow.
pub(crate) fn start_flow(flow: Arc<Flow>, function: FunctionIndex, parameter: Option<Parameter>) {
    let next = match FunctionState::function(flow.clone(), function, parameter, None) {
        Ok(head) => Next::Continue(head),
        Err(error) => escalate_in_flow(flow, None, Escalation::new(error), None),
    };
    if let Next::Continue(state) = next {
        dispatch(state);
    }
}

impl JobNode for FunctionState {
    fn activate(self: Arc<Self>) {
        dispatch(self);
    }

    fn fail(self: Arc<Self>, cause: Escalation) {
        self.progress.lock().failure = Some(cause);
        dispatch(self);
    }
}

impl fmt::Debug for FunctionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let step = match &self.step {
            Step::Function { meta, .. } => format!("function {}", meta.name),
            Step::Governance(operation) => format!("governance {operation:?}"),
            Step::Sequential(_) => "sequential".to_string(),
            Step::Complete => "complete".to_string(),
        };
        f.debug_struct("FunctionState")
            .field("step", &step)
            .field("thread", &self.thread().id())
            .field("team", &self.team)
            .field("handled_at", &self.handled_at)
            .finish_non_exhaustive()
    }
}
