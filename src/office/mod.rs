//! Office - a resolved function graph with its teams and asset managers.
//!
//! ```text
//! OfficeBuilder ──build──▶ Office ──invoke_function──▶ ProcessHandle
//!                            │                              │
//!                            ├─ OfficeMeta (immutable)      └─ wait() → ProcessOutcome
//!                            ├─ TeamRegistry
//!                            └─ AssetManagerRegistry ◀── AssetMonitoringService
//! ```

mod builder;
mod issues;
mod meta;
mod validation;

pub use builder::{
    AdministrationDeclaration, DutyDeclaration, FlowDeclaration, FunctionDeclaration, GovernanceDeclaration,
    ManagedObjectDeclaration, OfficeBuilder,
};
pub use issues::{Issue, IssueKind, IssueSink};
pub use meta::{
    AdministrationIndex, AdministrationMeta, DutyMeta, FlowMeta, FunctionIndex, FunctionMeta, GovernanceIndex,
    GovernanceMeta, ManagedObjectMeta, OfficeMeta, TeamIndex,
};

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::asset::{AssetManager, AssetManagerRegistry};
use crate::escalation::{Escalation, EscalationProcedure};
use crate::execution::{start_flow, Flow, ProcessOutcome, ProcessState, ThreadState};
use crate::function::Parameter;
use crate::kernel::AssetMonitoringService;
use crate::team::TeamRegistry;
use crate::types::{Error, ProcessId, Result};

/// State shared by every process of an office.
pub(crate) struct OfficeRuntime {
    pub(crate) meta: Arc<OfficeMeta>,
    pub(crate) teams: TeamRegistry,
    pub(crate) assets: Arc<AssetManagerRegistry>,
    /// Monitors of managed objects being sourced.
    pub(crate) sourcing: Arc<AssetManager>,
    /// Monitors of outstanding asynchronous flows.
    pub(crate) asynchronous: Arc<AssetManager>,
    in_flight: watch::Sender<usize>,
}

impl OfficeRuntime {
    pub(crate) fn process_started(&self) {
        self.in_flight.send_modify(|count| *count += 1);
    }

    pub(crate) fn process_finished(&self) {
        self.in_flight.send_modify(|count| *count = count.saturating_sub(1));
    }
}

impl fmt::Debug for OfficeRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OfficeRuntime")
            .field("meta", &self.meta)
            .field("teams", &self.teams)
            .field("in_flight", &*self.in_flight.borrow())
            .finish_non_exhaustive()
    }
}

/// A built office, ready to invoke functions.
pub struct Office {
    runtime: Arc<OfficeRuntime>,
    monitoring: Mutex<Option<AssetMonitoringService>>,
    cancel: CancellationToken,
}

impl Office {
    pub(crate) fn new(meta: OfficeMeta, teams: TeamRegistry) -> Self {
        let assets = Arc::new(AssetManagerRegistry::new());
        let sourcing = assets.create_asset_manager(format!("{}.sourcing", meta.name));
        let asynchronous = assets.create_asset_manager(format!("{}.asynchronous", meta.name));
        let (in_flight, _) = watch::channel(0);
        Self {
            runtime: Arc::new(OfficeRuntime {
                meta: Arc::new(meta),
                teams,
                assets,
                sourcing,
                asynchronous,
                in_flight,
            }),
            monitoring: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.runtime.meta.name
    }

    pub fn meta(&self) -> &OfficeMeta {
        &self.runtime.meta
    }

    pub fn teams(&self) -> &TeamRegistry {
        &self.runtime.teams
    }

    pub fn asset_managers(&self) -> &Arc<AssetManagerRegistry> {
        &self.runtime.assets
    }

    /// Processes started and not yet completed.
    pub fn in_flight(&self) -> usize {
        *self.runtime.in_flight.borrow()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Start a new process whose first thread runs the named function.
    pub fn invoke_function(&self, name: &str, parameter: Option<Parameter>) -> Result<ProcessHandle> {
        let index = self
            .runtime
            .meta
            .function_index(name)
            .ok_or_else(|| Error::not_found(format!("function '{}' in office '{}'", name, self.name())))?;
        self.invoke_function_at(index, parameter)
    }

    pub fn invoke_function_at(&self, function: FunctionIndex, parameter: Option<Parameter>) -> Result<ProcessHandle> {
        if self.cancel.is_cancelled() {
            return Err(Error::cancelled(format!("office '{}' is shutting down", self.name())));
        }
        let name = self
            .runtime
            .meta
            .functions
            .get(function)
            .map(|meta| meta.name.clone())
            .ok_or_else(|| Error::not_found(format!("function index {function}")))?;

        let (process, receiver) = ProcessState::new(self.runtime.clone());
        let id = process.id().clone();
        tracing::info!(office = %self.name(), process = %id, function = %name, "function_invoked");

        let thread = ThreadState::new(&process);
        let flow = Flow::new(thread, EscalationProcedure::default(), None, None);
        start_flow(flow, function, parameter);
        Ok(ProcessHandle { id, receiver })
    }

    /// Sweep the asset managers once, returning the number of monitors checked.
    pub fn manage_assets(&self) -> usize {
        self.runtime.assets.manage_assets()
    }

    /// Start periodic asset sweeps on the current tokio runtime. Idempotent.
    pub fn start(&self) -> Result<()> {
        let mut monitoring = self.monitoring.lock();
        if monitoring.as_ref().is_some_and(AssetMonitoringService::is_running) {
            return Ok(());
        }
        let mut service = AssetMonitoringService::new(
            self.name(),
            self.runtime.assets.clone(),
            self.runtime.meta.defaults.asset_sweep_interval,
        );
        service.start()?;
        *monitoring = Some(service);
        Ok(())
    }

    /// Stop accepting invocations and wait up to `shutdown_timeout` for
    /// in-flight processes. Processes still waiting on an asset after that
    /// are failed with a `cancelled` escalation and given another
    /// `shutdown_timeout` to reach their handlers. Sweeping and the teams are
    /// stopped last.
    ///
    /// Returns whether every process completed before cancellation.
    pub async fn shutdown(&self) -> bool {
        self.cancel.cancel();
        let timeout = self.runtime.meta.defaults.shutdown_timeout;
        let drained = self.drain(timeout).await;
        if !drained {
            tracing::warn!(office = %self.name(), remaining = self.in_flight(), "office_shutdown_timed_out");
            let cause = Escalation::new(Error::cancelled(format!("office '{}' shut down", self.name())));
            let cancelled = self.runtime.assets.cancel_assets(&cause);
            let settled = self.drain(timeout).await;
            tracing::info!(
                office = %self.name(),
                cancelled,
                settled,
                remaining = self.in_flight(),
                "office_shutdown_cancelled_assets"
            );
        }

        if let Some(mut service) = self.monitoring.lock().take() {
            service.stop();
        }
        self.runtime.teams.stop_all();
        tracing::info!(office = %self.name(), drained, "office_shutdown");
        drained
    }

    async fn drain(&self, timeout: std::time::Duration) -> bool {
        let mut in_flight = self.runtime.in_flight.subscribe();
        let drained = matches!(
            tokio::time::timeout(timeout, in_flight.wait_for(|count| *count == 0)).await,
            Ok(Ok(_))
        );
        drained
    }
}

impl fmt::Debug for Office {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Office")
            .field("runtime", &self.runtime)
            .field("shutting_down", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// Handle to an invoked process.
#[derive(Debug)]
pub struct ProcessHandle {
    id: ProcessId,
    receiver: watch::Receiver<Option<ProcessOutcome>>,
}

impl ProcessHandle {
    pub fn id(&self) -> &ProcessId {
        &self.id
    }

    /// Outcome, if the process has completed.
    pub fn outcome(&self) -> Option<ProcessOutcome> {
        self.receiver.borrow().clone()
    }

    pub fn is_complete(&self) -> bool {
        self.receiver.borrow().is_some()
    }

    /// Wait for the last thread of the process to complete.
    pub async fn wait(&mut self) -> Result<ProcessOutcome> {
        let outcome = self
            .receiver
            .wait_for(Option::is_some)
            .await
            .map_err(|_| Error::cancelled(format!("process {} dropped before completing", self.id)))?;
        outcome
            .clone()
            .ok_or_else(|| Error::internal(format!("process {} published no outcome", self.id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::{parameter, FunctionContext};
    use crate::team::PassiveTeam;
    use tracing_test::traced_test;

    fn office() -> Office {
        let mut builder = OfficeBuilder::new("orders");
        builder.add_team(Arc::new(PassiveTeam::new("inline")));
        builder.function("double", |context: &mut FunctionContext<'_>| -> Result<Option<Parameter>> {
            let value = context.parameter::<u64>()?;
            Ok(Some(parameter(*value * 2)))
        });
        builder.function("reject", |_context: &mut FunctionContext<'_>| -> Result<Option<Parameter>> {
            Err(Error::function("order.rejected", "out of stock"))
        });
        builder.build(&mut Vec::new()).unwrap()
    }

    #[test]
    #[traced_test]
    fn test_invocation_lifecycle_is_logged() {
        let office = office();
        let handle = office.invoke_function("reject", None).unwrap();
        assert!(handle.is_complete());

        assert!(logs_contain("function_invoked"));
        assert!(logs_contain("escalation_raised"));
        assert!(logs_contain("unhandled escalation"));
        assert!(logs_contain("process_finished"));
    }

    #[test]
    fn test_outcome_published_to_handle() {
        let office = office();
        let handle = office.invoke_function("double", Some(parameter(21u64))).unwrap();
        let outcome = handle.outcome().unwrap();
        assert_eq!(&outcome.process_id, handle.id());
        assert!(outcome.is_success());
        assert_eq!(outcome.threads, 1);
        assert!(outcome.finished_at >= outcome.started_at);
        assert_eq!(office.in_flight(), 0);
    }

    #[test]
    fn test_missing_parameter_is_unhandled() {
        let office = office();
        let outcome = office.invoke_function("double", None).unwrap().outcome().unwrap();
        let unhandled: Vec<_> = outcome.unhandled().collect();
        assert_eq!(unhandled.len(), 1);
        assert_eq!(unhandled[0].cause_type.as_str(), "validation");
    }

    #[test]
    fn test_unknown_function() {
        let office = office();
        assert!(matches!(office.invoke_function("refund", None), Err(Error::NotFound(_))));
        assert!(matches!(office.invoke_function_at(7, None), Err(Error::NotFound(_))));
        assert_eq!(office.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_start_twice_then_shutdown() {
        let office = office();
        office.start().unwrap();
        office.start().unwrap();
        assert!(office.shutdown().await);
        assert!(office.is_shutting_down());
        assert!(matches!(office.invoke_function("double", None), Err(Error::Cancelled(_))));
    }

    #[tokio::test]
    async fn test_wait_returns_published_outcome() {
        let office = office();
        let mut handle = office.invoke_function("double", Some(parameter(2u64))).unwrap();
        let outcome = handle.wait().await.unwrap();
        assert_eq!(Some(outcome), handle.outcome());
    }
}
