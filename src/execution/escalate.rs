//! Escalation routing through the scopes of the ownership tree.

use std::sync::Arc;

use super::{Flow, FunctionState, Next};
use crate::escalation::{Escalation, EscalationLevel, EscalationReport};
use crate::function::Parameter;
use crate::office::FunctionIndex;

/// Whether a procedure at `level` may handle an escalation raised by a
/// handler that ran at `floor`.
fn searches(floor: Option<EscalationLevel>, level: EscalationLevel) -> bool {
    floor.map_or(true, |floor| level > floor)
}

/// Escalate a failure raised by `origin`. Returns the continuation to run
/// next in its place.
pub(crate) fn escalate(origin: &Arc<FunctionState>, escalation: Escalation) -> Next {
    origin.release_function_objects();
    let function = origin.function_name().map(str::to_string);
    tracing::debug!(
        thread = %origin.thread().id(),
        function = ?function,
        cause_type = %escalation.cause_type(),
        "escalation_raised"
    );

    // A function's own procedure is searched even when it runs as a
    // handler; only the enclosing levels are subject to its floor
    let handler = origin
        .function_meta()
        .and_then(|meta| meta.escalation.get_escalation(&escalation))
        .map(|flow| flow.handler);
    if let Some(handler) = handler {
        let floor = origin
            .handled_at()
            .map_or(EscalationLevel::Function, |floor| floor.max(EscalationLevel::Function));
        return handle(origin.flow(), handler, EscalationLevel::Function, floor, escalation, function);
    }

    escalate_in_flow(origin.flow().clone(), origin.handled_at(), escalation, function)
}

/// Escalate from flow level upwards, starting at `flow`.
pub(crate) fn escalate_in_flow(
    flow: Arc<Flow>,
    floor: Option<EscalationLevel>,
    escalation: Escalation,
    function: Option<String>,
) -> Next {
    let mut flow = flow;
    loop {
        if searches(floor, EscalationLevel::Flow) {
            let handler = flow
                .escalation_procedure()
                .get_escalation(&escalation)
                .map(|found| found.handler);
            if let Some(handler) = handler {
                return handle(&flow, handler, EscalationLevel::Flow, EscalationLevel::Flow, escalation, function);
            }
        }

        // The instigator's callback receives it
        if flow.has_callback() {
            let thread = flow.thread();
            thread.process().record(EscalationReport::new(
                &escalation,
                EscalationLevel::Flow,
                thread.id(),
                function,
            ));
            return flow.finish(Some(escalation));
        }

        // Sequential flow without callback: the parked parent takes over
        let Some(parked) = flow.continuation().cloned() else {
            break;
        };
        flow.close_transferred();
        flow = parked.flow().clone();
    }

    let thread = flow.thread().clone();
    let process = thread.process().clone();
    thread.set_failure(escalation.clone());

    if searches(floor, EscalationLevel::Thread) {
        let handler = thread
            .escalation_procedure()
            .get_escalation(&escalation)
            .map(|found| found.handler);
        if let Some(handler) = handler {
            return handle(&flow, handler, EscalationLevel::Thread, EscalationLevel::Thread, escalation, function);
        }
    }

    if searches(floor, EscalationLevel::Process) {
        let handler = process
            .escalation_procedure()
            .get_escalation(&escalation)
            .map(|found| found.handler);
        if let Some(handler) = handler {
            return handle(&flow, handler, EscalationLevel::Process, EscalationLevel::Process, escalation, function);
        }
    }

    process.handle_unhandled(&escalation, thread.id(), function);
    flow.finish(None)
}

/// Run `handler` in `flow` with the escalation as its parameter. Failures of
/// the handler search procedures strictly above `floor`.
fn handle(
    flow: &Arc<Flow>,
    handler: FunctionIndex,
    level: EscalationLevel,
    floor: EscalationLevel,
    escalation: Escalation,
    function: Option<String>,
) -> Next {
    let thread = flow.thread();
    thread.process().record(EscalationReport::new(&escalation, level, thread.id(), function));
    tracing::debug!(
        thread = %thread.id(),
        level = ?level,
        cause_type = %escalation.cause_type(),
        handler,
        "escalation_handled"
    );

    let parameter: Parameter = Arc::new(escalation);
    match FunctionState::function(flow.clone(), handler, Some(parameter), Some(floor)) {
        Ok(state) => Next::Continue(state),
        Err(error) => escalate_in_flow(flow.clone(), Some(floor), Escalation::new(error), None),
    }
}
