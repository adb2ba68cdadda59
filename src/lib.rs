//! # Office Kernel - continuation-based execution of function graphs
//!
//! An office is a graph of named functions wired to the managed objects they
//! use, the governance that must be active while they run, administration
//! duties around them and the escalation procedures handling their
//! failures. Invoking a function starts a process:
//!
//! - Functions run as continuations on teams; nothing blocks a worker while
//!   a managed object is sourced or an asynchronous flow is outstanding
//! - Managed objects are sourced once per process, thread or function scope
//!   and released when their scope completes
//! - Governance is activated, enforced or disregarded per thread, with a
//!   deactivation policy applied when the thread completes
//! - Failures escalate Function → Flow → Thread → Process → default handler
//!
//! ## Architecture
//!
//! ```text
//!                    ┌──────────────────────────────────────┐
//!  invoke_function → │               Office                 │
//!                    │  ┌──────────┐ ┌──────────┐           │
//!                    │  │OfficeMeta│ │  Teams   │ ◀── Jobs  │
//!                    │  └──────────┘ └──────────┘           │
//!                    │  ┌──────────────────────┐            │
//!                    │  │ AssetManagerRegistry │ ◀── sweep  │
//!                    │  └──────────────────────┘            │
//!                    └──────────────────────────────────────┘
//!                      Process ─ Thread ─ Flow ─ FunctionState
//! ```

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod administration;
pub mod asset;
pub mod escalation;
pub mod execution;
pub mod function;
pub mod governance;
pub mod kernel;
pub mod managed_object;
pub mod office;
pub mod team;
pub mod types;

// Internal utilities
pub mod observability;

pub use escalation::{CauseType, Escalation, EscalationLevel, EscalationReport};
pub use execution::ProcessOutcome;
pub use function::{parameter, FunctionContext, Parameter};
pub use kernel::Kernel;
pub use managed_object::Scope;
pub use office::{FlowDeclaration, Issue, IssueKind, Office, OfficeBuilder, ProcessHandle};
pub use types::{Config, Error, Result};
