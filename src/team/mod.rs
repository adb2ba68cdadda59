//! Teams - named pools executing jobs.
//!
//! - [`PassiveTeam`]: runs the job on the thread assigning it
//! - [`WorkerPoolTeam`]: fixed pool of named OS threads fed by a channel
//! - [`RuntimeTeam`]: a tokio runtime's blocking pool
//!
//! A stopped team hands the job back; the engine then cancels it with a
//! `cancelled` escalation.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tokio::sync::mpsc;

use crate::execution::Job;
use crate::office::TeamIndex;
use crate::types::{Error, Result, TeamConfig, TeamKind};

/// A named pool of workers.
pub trait Team: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Accept the job for eventual execution, or hand it back if the team no
    /// longer accepts work.
    fn assign_job(&self, job: Job) -> std::result::Result<(), Job>;

    /// Stop accepting jobs. Jobs already queued still run.
    fn stop(&self);
}

/// Build a team from its configuration.
pub fn create_team(config: &TeamConfig) -> Result<Arc<dyn Team>> {
    let team: Arc<dyn Team> = match &config.kind {
        TeamKind::Passive => Arc::new(PassiveTeam::new(&config.name)),
        TeamKind::WorkerPool { size } => Arc::new(WorkerPoolTeam::new(&config.name, *size)?),
        TeamKind::Runtime => Arc::new(RuntimeTeam::current(&config.name)?),
    };
    Ok(team)
}

// =============================================================================
// Passive
// =============================================================================

/// Executes jobs immediately on the assigning thread.
#[derive(Debug)]
pub struct PassiveTeam {
    name: String,
    stopped: AtomicBool,
}

impl PassiveTeam {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stopped: AtomicBool::new(false),
        }
    }
}

impl Team for PassiveTeam {
    fn name(&self) -> &str {
        &self.name
    }

    fn assign_job(&self, job: Job) -> std::result::Result<(), Job> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(job);
        }
        job.run();
        Ok(())
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

// =============================================================================
// Worker pool
// =============================================================================

/// Fixed pool of dedicated worker threads.
pub struct WorkerPoolTeam {
    name: String,
    size: usize,
    sender: Mutex<Option<mpsc::UnboundedSender<Job>>>,
}

impl WorkerPoolTeam {
    pub fn new(name: impl Into<String>, size: usize) -> Result<Self> {
        let name = name.into();
        if size == 0 {
            return Err(Error::validation(format!("team '{name}' needs at least one worker")));
        }

        let (sender, receiver) = mpsc::unbounded_channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));

        for worker in 0..size {
            let receiver = receiver.clone();
            let team = name.clone();
            thread::Builder::new()
                .name(format!("{name}-{worker}"))
                .spawn(move || {
                    tracing::debug!(team = %team, worker, "team_worker_started");
                    loop {
                        let job = receiver.lock().blocking_recv();
                        match job {
                            Some(job) => job.run(),
                            None => break,
                        }
                    }
                    tracing::debug!(team = %team, worker, "team_worker_stopped");
                })?;
        }

        tracing::info!(team = %name, size, "team_started");
        Ok(Self {
            name,
            size,
            sender: Mutex::new(Some(sender)),
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

impl Team for WorkerPoolTeam {
    fn name(&self) -> &str {
        &self.name
    }

    fn assign_job(&self, job: Job) -> std::result::Result<(), Job> {
        let sender = self.sender.lock().clone();
        match sender {
            Some(sender) => sender.send(job).map_err(|rejected| rejected.0),
            None => Err(job),
        }
    }

    fn stop(&self) {
        if self.sender.lock().take().is_some() {
            tracing::info!(team = %self.name, "team_stopped");
        }
    }
}

impl fmt::Debug for WorkerPoolTeam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPoolTeam")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("stopped", &self.sender.lock().is_none())
            .finish()
    }
}

// =============================================================================
// Runtime
// =============================================================================

/// Runs jobs on a tokio runtime's blocking pool.
#[derive(Debug)]
pub struct RuntimeTeam {
    name: String,
    handle: tokio::runtime::Handle,
    stopped: AtomicBool,
}

impl RuntimeTeam {
    pub fn new(name: impl Into<String>, handle: tokio::runtime::Handle) -> Self {
        Self {
            name: name.into(),
            handle,
            stopped: AtomicBool::new(false),
        }
    }

    /// Bind to the runtime of the calling context.
    pub fn current(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::validation(format!("team '{name}' requires a tokio runtime: {e}")))?;
        Ok(Self::new(name, handle))
    }
}

impl Team for RuntimeTeam {
    fn name(&self) -> &str {
        &self.name
    }

    fn assign_job(&self, job: Job) -> std::result::Result<(), Job> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(job);
        }
        self.handle.spawn_blocking(move || job.run());
        Ok(())
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

// =============================================================================
// Registry
// =============================================================================

/// What makes a function prefer a team.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "name")]
pub enum Affinity {
    /// The function uses the named managed object.
    ManagedObject(String),
    /// The function requires the named governance.
    Governance(String),
}

impl Affinity {
    pub fn matches(&self, objects: &[&str], governance: &[&str]) -> bool {
        match self {
            Affinity::ManagedObject(name) => objects.contains(&name.as_str()),
            Affinity::Governance(name) => governance.contains(&name.as_str()),
        }
    }
}

/// Teams of an office, addressed by index.
#[derive(Debug)]
pub struct TeamRegistry {
    teams: Vec<Arc<dyn Team>>,
    by_name: HashMap<String, TeamIndex>,
    default: TeamIndex,
}

impl TeamRegistry {
    pub(crate) fn new(teams: Vec<Arc<dyn Team>>, default: TeamIndex) -> Self {
        let by_name = teams
            .iter()
            .enumerate()
            .map(|(index, team)| (team.name().to_string(), index))
            .collect();
        Self {
            teams,
            by_name,
            default,
        }
    }

    pub fn get(&self, index: TeamIndex) -> Option<&Arc<dyn Team>> {
        self.teams.get(index)
    }

    pub fn index_of(&self, name: &str) -> Option<TeamIndex> {
        self.by_name.get(name).copied()
    }

    pub fn default_index(&self) -> TeamIndex {
        self.default
    }

    pub fn len(&self) -> usize {
        self.teams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.teams.is_empty()
    }

    pub fn stop_all(&self) {
        for team in &self.teams {
            team.stop();
        }
    }
}
