//! Build-time issues.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Category of a meta-data problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    MissingTeam,
    /// Reference to an undeclared function, object, governance or administration.
    Unresolved,
    DependencyCycle,
    /// Object depending on an object of a narrower scope.
    ScopeViolation,
    MissingExtension,
    Duplicate,
    Invalid,
}

/// One problem found while building an office.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub kind: IssueKind,
    /// Name of the declaration the issue was found on.
    pub subject: String,
    pub message: String,
}

impl Issue {
    pub fn new(kind: IssueKind, subject: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            subject: subject.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} on '{}': {}", self.kind, self.subject, self.message)
    }
}

/// Receives issues found while building.
pub trait IssueSink {
    fn report(&mut self, issue: Issue);
}

impl IssueSink for Vec<Issue> {
    fn report(&mut self, issue: Issue) {
        self.push(issue);
    }
}
