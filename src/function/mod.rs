//! Managed functions and the context they execute with.
//!
//! A [`ManagedFunction`] receives a [`FunctionContext`] giving it its
//! parameter, its ready managed objects and the ability to instigate flows.
//! Flow requests only take effect once the function returns successfully.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crate::asset::{Activations, Asset, AssetManager, AssetMonitor, CheckAssetContext, JobNodeRef, WaitOutcome};
use crate::escalation::Escalation;
use crate::managed_object::{downcast, Object};
use crate::office::FlowMeta;
use crate::types::{Error, Result};

/// Value passed between functions.
pub type Parameter = Arc<dyn Any + Send + Sync>;

/// Wrap a value as a [`Parameter`].
pub fn parameter<T: Any + Send + Sync>(value: T) -> Parameter {
    Arc::new(value)
}

/// Invoked once an instigated flow completes, with the escalation that
/// ended it if any. Returning an error escalates from the instigating thread.
pub type FlowCallback = Box<dyn FnOnce(Option<Escalation>) -> Result<()> + Send>;

/// Function logic.
pub trait ManagedFunction: Send + Sync {
    /// Run the function. The returned parameter is handed to the next
    /// function of the flow.
    fn execute(&self, context: &mut FunctionContext<'_>) -> Result<Option<Parameter>>;
}

impl<F> ManagedFunction for F
where
    F: Fn(&mut FunctionContext<'_>) -> Result<Option<Parameter>> + Send + Sync,
{
    fn execute(&self, context: &mut FunctionContext<'_>) -> Result<Option<Parameter>> {
        self(context)
    }
}

/// How an instigated flow relates to its instigator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstigationStrategy {
    /// Same thread; runs after the instigating function and before its next.
    Sequential,
    /// New thread under the same process; the instigator does not wait.
    ParallelThread,
    /// Same thread; dispatched independently of the instigator's chain.
    Asynchronous,
}

/// A flow to instigate once the requesting function or duty completes.
pub struct FlowRequest {
    pub(crate) flow: Arc<FlowMeta>,
    pub(crate) parameter: Option<Parameter>,
    pub(crate) callback: Option<FlowCallback>,
}

impl FlowRequest {
    pub(crate) fn new(flow: Arc<FlowMeta>, parameter: Option<Parameter>, callback: Option<FlowCallback>) -> Self {
        Self {
            flow,
            parameter,
            callback,
        }
    }

    pub fn strategy(&self) -> InstigationStrategy {
        self.flow.strategy
    }
}

impl fmt::Debug for FlowRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowRequest")
            .field("function", &self.flow.function)
            .field("strategy", &self.flow.strategy)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

// =============================================================================
// Function context
// =============================================================================

/// Everything a function sees while it executes.
pub struct FunctionContext<'a> {
    name: &'a str,
    parameter: Option<Parameter>,
    objects: Vec<Object>,
    flows: &'a [Arc<FlowMeta>],
    requests: Vec<FlowRequest>,
    asynchronous: Vec<AsynchronousFlow>,
    asynchronous_manager: &'a AssetManager,
    asynchronous_timeout: Duration,
}

impl<'a> FunctionContext<'a> {
    pub(crate) fn new(
        name: &'a str,
        parameter: Option<Parameter>,
        objects: Vec<Object>,
        flows: &'a [Arc<FlowMeta>],
        asynchronous_manager: &'a AssetManager,
        asynchronous_timeout: Duration,
    ) -> Self {
        Self {
            name,
            parameter,
            objects,
            flows,
            requests: Vec::new(),
            asynchronous: Vec::new(),
            asynchronous_manager,
            asynchronous_timeout,
        }
    }

    pub fn function_name(&self) -> &str {
        self.name
    }

    pub fn raw_parameter(&self) -> Option<&Parameter> {
        self.parameter.as_ref()
    }

    /// The parameter downcast to `T`.
    pub fn parameter<T: Any + Send + Sync>(&self) -> Result<Arc<T>> {
        let parameter = self
            .parameter
            .as_ref()
            .ok_or_else(|| Error::validation(format!("function '{}' has no parameter", self.name)))?;
        downcast(parameter, &format!("parameter of '{}'", self.name))
    }

    /// Managed object `index`, in the function's declared order.
    pub fn object<T: Any + Send + Sync>(&self, index: usize) -> Result<Arc<T>> {
        let object = self.objects.get(index).ok_or_else(|| {
            Error::not_found(format!("object {} of function '{}'", index, self.name))
        })?;
        downcast(object, &format!("object {} of '{}'", index, self.name))
    }

    pub fn raw_object(&self, index: usize) -> Option<&Object> {
        self.objects.get(index)
    }

    /// Instigate flow `index` once this function returns.
    pub fn do_flow(&mut self, index: usize, parameter: Option<Parameter>) -> Result<()> {
        self.request_flow(index, parameter, None)
    }

    pub fn do_flow_with_callback(
        &mut self,
        index: usize,
        parameter: Option<Parameter>,
        callback: FlowCallback,
    ) -> Result<()> {
        self.request_flow(index, parameter, Some(callback))
    }

    /// Create a callback token. The function's continuation waits until the
    /// token is completed, failed or times out.
    pub fn create_asynchronous_flow(&mut self) -> AsynchronousFlow {
        let flow = AsynchronousFlow::new(self.name, self.asynchronous_manager, self.asynchronous_timeout);
        self.asynchronous.push(flow.clone());
        flow
    }

    fn request_flow(&mut self, index: usize, parameter: Option<Parameter>, callback: Option<FlowCallback>) -> Result<()> {
        let flow = self
            .flows
            .get(index)
            .ok_or_else(|| Error::not_found(format!("flow {} of function '{}'", index, self.name)))?;
        self.requests.push(FlowRequest::new(flow.clone(), parameter, callback));
        Ok(())
    }

    pub(crate) fn into_requests(self) -> (Vec<FlowRequest>, Vec<AsynchronousFlow>) {
        (self.requests, self.asynchronous)
    }
}

impl fmt::Debug for FunctionContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionContext")
            .field("name", &self.name)
            .field("objects", &self.objects.len())
            .field("requests", &self.requests)
            .field("asynchronous", &self.asynchronous.len())
            .finish()
    }
}

// =============================================================================
// Asynchronous flow
// =============================================================================

enum AsynchronousState {
    Pending { deadline: Instant },
    Completed,
    Failed(Escalation),
}

struct AsynchronousFlowAsset {
    name: String,
    timeout: Duration,
    state: Mutex<AsynchronousState>,
    monitor: Arc<AssetMonitor>,
}

impl Asset for AsynchronousFlowAsset {
    fn asset_name(&self) -> &str {
        &self.name
    }

    fn check_on_asset(&self, context: &mut CheckAssetContext) {
        let cause = {
            let mut state = self.state.lock();
            match &*state {
                AsynchronousState::Pending { deadline } if context.time() >= *deadline => {
                    let cause = Escalation::new(Error::timeout(format!(
                        "asynchronous flow of '{}' not completed within {:?}",
                        self.name, self.timeout
                    )));
                    *state = AsynchronousState::Failed(cause.clone());
                    cause
                }
                _ => return,
            }
        };
        tracing::warn!(function = %self.name, "asynchronous_flow_timed_out");
        context.fail_job_nodes(cause, true);
    }

    fn cancel_asset(&self, cause: &Escalation) -> bool {
        let mut state = self.state.lock();
        if !matches!(*state, AsynchronousState::Pending { .. }) {
            return false;
        }
        *state = AsynchronousState::Failed(cause.clone());
        true
    }
}

/// Outcome of waiting on an asynchronous flow.
#[derive(Debug)]
pub(crate) enum AsynchronousReadiness {
    Completed,
    Failed(Escalation),
    Waiting,
    Resolved(Activations),
}

/// Callback token for work completed outside the kernel.
#[derive(Clone)]
pub struct AsynchronousFlow {
    asset: Arc<AsynchronousFlowAsset>,
}

impl AsynchronousFlow {
    fn new(name: &str, manager: &AssetManager, timeout: Duration) -> Self {
        let asset = Arc::new_cyclic(|weak: &Weak<AsynchronousFlowAsset>| {
            let as_asset: Weak<dyn Asset> = weak.clone();
            AsynchronousFlowAsset {
                name: name.to_string(),
                timeout,
                state: Mutex::new(AsynchronousState::Pending {
                    deadline: Instant::now() + timeout,
                }),
                monitor: manager.create_asset_monitor(as_asset),
            }
        });
        Self { asset }
    }

    pub fn is_pending(&self) -> bool {
        matches!(*self.asset.state.lock(), AsynchronousState::Pending { .. })
    }

    /// Resume the waiting continuation.
    pub fn complete(&self) {
        {
            let mut state = self.asset.state.lock();
            if !matches!(*state, AsynchronousState::Pending { .. }) {
                return;
            }
            *state = AsynchronousState::Completed;
        }
        self.asset.monitor.activate_job_nodes(true).execute();
    }

    /// Fail the waiting continuation with `error`.
    pub fn fail(&self, error: Error) {
        let cause = Escalation::new(error);
        {
            let mut state = self.asset.state.lock();
            if !matches!(*state, AsynchronousState::Pending { .. }) {
                return;
            }
            *state = AsynchronousState::Failed(cause.clone());
        }
        self.asset.monitor.fail_job_nodes(cause, true).execute();
    }

    pub(crate) fn wait(&self, node: JobNodeRef) -> AsynchronousReadiness {
        let state = self.asset.state.lock();
        match &*state {
            AsynchronousState::Completed => AsynchronousReadiness::Completed,
            AsynchronousState::Failed(cause) => AsynchronousReadiness::Failed(cause.clone()),
            AsynchronousState::Pending { .. } => match self.asset.monitor.wait_on_asset(node) {
                WaitOutcome::Waiting => AsynchronousReadiness::Waiting,
                WaitOutcome::Resolved(activations) => AsynchronousReadiness::Resolved(activations),
            },
        }
    }
}

impl fmt::Debug for AsynchronousFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsynchronousFlow")
            .field("function", &self.asset.name)
            .field("pending", &self.is_pending())
            .finish()
    }
}
