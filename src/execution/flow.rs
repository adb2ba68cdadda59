//! Flow - one sequential chain of continuations within a thread.

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::escalate::escalate_in_flow;
use super::{FunctionState, Next, ThreadState};
use crate::escalation::{Escalation, EscalationLevel, EscalationProcedure};
use crate::function::FlowCallback;
use crate::kernel::with_recovery;

/// Callback awaiting a flow's completion. Holds a flow reservation on the
/// instigating thread so it cannot complete before the callback ran.
pub(crate) struct PendingCallback {
    callback: FlowCallback,
    instigator: Arc<ThreadState>,
}

impl PendingCallback {
    pub(crate) fn new(callback: FlowCallback, instigator: Arc<ThreadState>) -> Self {
        instigator.begin_flow();
        Self { callback, instigator }
    }
}

impl fmt::Debug for PendingCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingCallback")
            .field("instigator", &self.instigator.id())
            .finish_non_exhaustive()
    }
}

/// A chain of continuations. Counts as one active flow of its thread until
/// it completes.
pub struct Flow {
    thread: Arc<ThreadState>,
    escalation: EscalationProcedure,
    callback: Mutex<Option<PendingCallback>>,
    /// Parked continuation of the instigating flow (sequential flows only).
    continuation: Option<Arc<FunctionState>>,
    completed: AtomicBool,
}

impl Flow {
    pub(crate) fn new(
        thread: Arc<ThreadState>,
        escalation: EscalationProcedure,
        callback: Option<PendingCallback>,
        continuation: Option<Arc<FunctionState>>,
    ) -> Arc<Self> {
        thread.begin_flow();
        Self::adopt(thread, escalation, callback, continuation)
    }

    /// Create a flow whose slot in the thread's active count was already
    /// reserved.
    pub(crate) fn adopt(
        thread: Arc<ThreadState>,
        escalation: EscalationProcedure,
        callback: Option<PendingCallback>,
        continuation: Option<Arc<FunctionState>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            thread,
            escalation,
            callback: Mutex::new(callback),
            continuation,
            completed: AtomicBool::new(false),
        })
    }

    pub fn thread(&self) -> &Arc<ThreadState> {
        &self.thread
    }

    pub fn escalation_procedure(&self) -> &EscalationProcedure {
        &self.escalation
    }

    pub fn is_complete(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    pub(crate) fn has_callback(&self) -> bool {
        self.callback.lock().is_some()
    }

    pub(crate) fn continuation(&self) -> Option<&Arc<FunctionState>> {
        self.continuation.as_ref()
    }

    fn close(&self) -> bool {
        !self.completed.swap(true, Ordering::SeqCst)
    }

    /// Complete the flow, running its callback with the escalation that
    /// ended it. Resumes the parked continuation if any.
    pub(crate) fn finish(&self, escalation: Option<Escalation>) -> Next {
        if !self.close() {
            return Next::Complete;
        }

        let pending = self.callback.lock().take();
        let Some(PendingCallback { callback, instigator }) = pending else {
            self.thread.flow_completed();
            return self.resume();
        };

        let outcome = with_recovery(|| callback(escalation), "flow_callback");
        self.thread.flow_completed();

        match outcome {
            Ok(()) => {
                instigator.flow_completed();
                self.resume()
            }
            Err(error) => {
                let escalation = Escalation::new(error);
                tracing::debug!(
                    thread = %instigator.id(),
                    cause_type = %escalation.cause_type(),
                    "flow_callback_failed"
                );
                match &self.continuation {
                    Some(parked) => {
                        let next = escalate_in_flow(parked.flow().clone(), Some(EscalationLevel::Flow), escalation, None);
                        instigator.flow_completed();
                        next
                    }
                    // Escalate in the instigator under the reservation
                    None => {
                        let detached = Flow::adopt(instigator, EscalationProcedure::default(), None, None);
                        escalate_in_flow(detached, Some(EscalationLevel::Flow), escalation, None)
                    }
                }
            }
        }
    }

    /// Complete without running a callback. Used when an escalation moves
    /// from a sequential flow to its parked parent.
    pub(crate) fn close_transferred(&self) {
        if self.close() {
            self.thread.flow_completed();
        }
    }

    /// Complete the flow and every flow it parked without running anything.
    /// Used once the process was aborted.
    pub(crate) fn abandon(&self) {
        if !self.close() {
            return;
        }
        let pending = self.callback.lock().take();
        self.thread.flow_completed();
        if let Some(pending) = pending {
            pending.instigator.flow_completed();
        }
        if let Some(parked) = &self.continuation {
            parked.flow().abandon();
        }
    }

    fn resume(&self) -> Next {
        match &self.continuation {
            Some(parked) => Next::Continue(parked.clone()),
            None => Next::Complete,
        }
    }
}

impl fmt::Debug for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Flow")
            .field("thread", &self.thread.id())
            .field("escalation", &self.escalation)
            .field("sequential", &self.continuation.is_some())
            .field("completed", &self.is_complete())
            .finish()
    }
}
