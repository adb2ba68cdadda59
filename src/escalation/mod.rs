//! Escalation - scope-aware fault propagation.
//!
//! A failure raised anywhere in the function graph becomes an [`Escalation`].
//! The engine consults [`EscalationProcedure`]s bottom-up:
//!
//! ```text
//! Function → Flow → ThreadState → ProcessState procedure → default handler
//! ```
//!
//! Cause types form a dotted hierarchy (`timeout.sourcing` → `timeout` → `*`).
//! Within one procedure the most specific declared type wins; ties are broken
//! by configured order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::office::FunctionIndex;
use crate::types::{Error, ProcessId, Result, ThreadStateId};

/// Root cause type matching every escalation.
pub const ANY_CAUSE: &str = "*";

// =============================================================================
// Cause types
// =============================================================================

/// Hierarchical cause type name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CauseType(String);

impl CauseType {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        if name.is_empty() {
            return Self::any();
        }
        Self(name)
    }

    /// The root type every cause descends from.
    pub fn any() -> Self {
        Self(ANY_CAUSE.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_any(&self) -> bool {
        self.0 == ANY_CAUSE
    }

    /// Immediate supertype; `None` only for the root.
    pub fn parent(&self) -> Option<CauseType> {
        if self.is_any() {
            return None;
        }
        match self.0.rfind('.') {
            Some(pos) => Some(Self(self.0[..pos].to_string())),
            None => Some(Self::any()),
        }
    }

    /// This type followed by each supertype, most specific first.
    pub fn lineage(&self) -> Vec<CauseType> {
        let mut lineage = vec![self.clone()];
        let mut current = self.parent();
        while let Some(ty) = current {
            current = ty.parent();
            lineage.push(ty);
        }
        lineage
    }

    /// Whether `self` is `other` or one of its supertypes.
    pub fn is_assignable_from(&self, other: &CauseType) -> bool {
        self.is_any()
            || self == other
            || (other.0.starts_with(&self.0) && other.0[self.0.len()..].starts_with('.'))
    }
}

impl fmt::Display for CauseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CauseType {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for CauseType {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

// =============================================================================
// Escalation
// =============================================================================

/// A failure travelling through the escalation levels.
#[derive(Debug, Clone)]
pub struct Escalation {
    cause_type: CauseType,
    error: Arc<Error>,
}

impl Escalation {
    pub fn new(error: Error) -> Self {
        Self {
            cause_type: error.cause_type(),
            error: Arc::new(error),
        }
    }

    pub fn cause_type(&self) -> &CauseType {
        &self.cause_type
    }

    pub fn error(&self) -> &Error {
        &self.error
    }

    pub fn message(&self) -> String {
        self.error.to_string()
    }
}

impl From<Error> for Escalation {
    fn from(error: Error) -> Self {
        Self::new(error)
    }
}

impl fmt::Display for Escalation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.cause_type, self.error)
    }
}

/// Scope at which an escalation was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationLevel {
    Function,
    Flow,
    Thread,
    Process,
    Default,
}

impl EscalationLevel {
    /// Levels searched by the engine, bottom-up.
    pub const SEARCH_ORDER: [EscalationLevel; 4] = [
        EscalationLevel::Function,
        EscalationLevel::Flow,
        EscalationLevel::Thread,
        EscalationLevel::Process,
    ];
}

/// Record of an escalation and the level that took it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationReport {
    pub cause_type: CauseType,
    pub message: String,
    pub level: EscalationLevel,
    pub thread: ThreadStateId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl EscalationReport {
    pub fn new(
        escalation: &Escalation,
        level: EscalationLevel,
        thread: ThreadStateId,
        function: Option<String>,
    ) -> Self {
        Self {
            cause_type: escalation.cause_type().clone(),
            message: escalation.message(),
            level,
            thread,
            function,
            occurred_at: Utc::now(),
        }
    }
}

// =============================================================================
// Escalation procedure
// =============================================================================

/// Configured handler for a cause type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EscalationFlow {
    pub cause_type: CauseType,
    pub handler: FunctionIndex,
}

/// Ordered `(cause type → handler function)` table for one scope.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EscalationProcedure {
    flows: Vec<EscalationFlow>,
}

impl EscalationProcedure {
    pub fn new(flows: Vec<EscalationFlow>) -> Self {
        Self { flows }
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    pub fn flows(&self) -> &[EscalationFlow] {
        &self.flows
    }

    /// Most specific declared match: exact type, then each supertype in turn.
    pub fn get_escalation(&self, escalation: &Escalation) -> Option<&EscalationFlow> {
        if self.flows.is_empty() {
            return None;
        }
        escalation
            .cause_type()
            .lineage()
            .into_iter()
            .find_map(|ty| self.flows.iter().find(|flow| flow.cause_type == ty))
    }
}

// =============================================================================
// Default handler
// =============================================================================

/// Terminal sink for escalations no scope handled.
///
/// Must not fail; a failure aborts the process and is logged.
pub trait EscalationHandler: Send + Sync {
    fn handle(&self, process: &ProcessId, escalation: &Escalation) -> Result<()>;
}

impl<F> EscalationHandler for F
where
    F: Fn(&ProcessId, &Escalation) -> Result<()> + Send + Sync,
{
    fn handle(&self, process: &ProcessId, escalation: &Escalation) -> Result<()> {
        self(process, escalation)
    }
}

/// Default handler that logs the escalation.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingEscalationHandler;

impl EscalationHandler for LoggingEscalationHandler {
    fn handle(&self, process: &ProcessId, escalation: &Escalation) -> Result<()> {
        tracing::error!(
            process = %process,
            cause_type = %escalation.cause_type(),
            "unhandled escalation: {}",
            escalation.error()
        );
        Ok(())
    }
}
