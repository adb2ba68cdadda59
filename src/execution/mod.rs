//! Execution - the runtime ownership tree and the scheduler driving it.
//!
//! ```text
//! ProcessState ─┬─ ThreadState ─┬─ Flow ── FunctionState → FunctionState → …
//!               │               └─ Flow ── …
//!               └─ ThreadState ── …
//! ```
//!
//! A [`FunctionState`] is one schedulable continuation. Running it yields the
//! next continuation, a suspension on an asset, or completion of its flow.
//! [`Job`] drives that loop on a team and hands continuations over when they
//! belong to another team.

mod escalate;
mod flow;
mod function_state;
mod job;
mod process;
mod thread;

pub use flow::Flow;
pub use function_state::FunctionState;
pub use job::Job;
pub use process::{ProcessOutcome, ProcessState};
pub use thread::{ThreadArena, ThreadState};

pub(crate) use flow::PendingCallback;
pub(crate) use function_state::start_flow;
pub(crate) use job::dispatch;

use std::sync::Arc;

/// What to do after running a continuation.
#[derive(Debug)]
pub(crate) enum Next {
    /// Run this continuation next.
    Continue(Arc<FunctionState>),
    /// Parked on an asset monitor; its activation re-dispatches it.
    Suspended,
    /// Nothing left on this chain.
    Complete,
}
