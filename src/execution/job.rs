//! Job - a continuation chain running on one team.

use std::sync::Arc;

use super::escalate::escalate;
use super::{FunctionState, Next};
use crate::escalation::Escalation;
use crate::office::TeamIndex;
use crate::types::Error;

/// Unit of work handed to a [`Team`](crate::team::Team).
///
/// Running a job executes continuations until the chain suspends, completes
/// or reaches a continuation owned by another team.
#[derive(Debug)]
pub struct Job {
    node: Arc<FunctionState>,
    team: TeamIndex,
}

impl Job {
    pub(crate) fn new(node: Arc<FunctionState>, team: TeamIndex) -> Self {
        Self { node, team }
    }

    pub fn team(&self) -> TeamIndex {
        self.team
    }

    pub fn node(&self) -> &Arc<FunctionState> {
        &self.node
    }

    pub fn run(self) {
        let team = self.team;
        let mut current = self.node;
        loop {
            match current.run() {
                Next::Continue(next) => match next.team() {
                    Some(owner) if owner != team => {
                        dispatch(next);
                        return;
                    }
                    _ => current = next,
                },
                Next::Suspended | Next::Complete => return,
            }
        }
    }

    /// Escalate a job its team refused.
    pub(crate) fn cancel(self, team: &str) {
        let cause = Escalation::new(Error::cancelled(format!("team '{team}' is not accepting jobs")));
        tracing::warn!(team = %team, thread = %self.node.thread().id(), "job_cancelled");
        if let Next::Continue(next) = escalate(&self.node, cause) {
            dispatch(next);
        }
    }
}

/// Assign `state` to its team, or the office's default team.
pub(crate) fn dispatch(state: Arc<FunctionState>) {
    let office = state.process().office().clone();
    let index = state.team().unwrap_or_else(|| office.teams.default_index());
    let Some(team) = office.teams.get(index) else {
        Job::new(state, index).cancel("unknown");
        return;
    };
    if let Err(job) = team.assign_job(Job::new(state, index)) {
        job.cancel(team.name());
    }
}
