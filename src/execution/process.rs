//! ProcessState - one top-level invocation of the function graph.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

use crate::escalation::{Escalation, EscalationLevel, EscalationProcedure, EscalationReport};
use crate::kernel::with_recovery;
use crate::managed_object::ManagedObjectContainer;
use crate::office::OfficeRuntime;
use crate::types::{ProcessId, ThreadStateId};

/// Final result of a process, published once its last thread completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessOutcome {
    pub process_id: ProcessId,
    /// Every escalation raised in the process, with the level that took it.
    pub escalations: Vec<EscalationReport>,
    /// Set when the default handler itself failed.
    pub aborted: bool,
    pub threads: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ProcessOutcome {
    /// Escalations no procedure handled.
    pub fn unhandled(&self) -> impl Iterator<Item = &EscalationReport> {
        self.escalations
            .iter()
            .filter(|report| report.level == EscalationLevel::Default)
    }

    pub fn is_success(&self) -> bool {
        !self.aborted && self.unhandled().next().is_none()
    }
}

#[derive(Debug, Default)]
struct ProcessInner {
    active_threads: usize,
    escalations: Vec<EscalationReport>,
    aborted: bool,
    finished: bool,
}

/// Owner of process-scoped managed objects and of the process escalation
/// boundary.
pub struct ProcessState {
    id: ProcessId,
    office: Arc<OfficeRuntime>,
    objects: Vec<Arc<ManagedObjectContainer>>,
    inner: Mutex<ProcessInner>,
    next_thread: AtomicU32,
    started_at: DateTime<Utc>,
    completion: watch::Sender<Option<ProcessOutcome>>,
}

impl ProcessState {
    pub(crate) fn new(office: Arc<OfficeRuntime>) -> (Arc<Self>, watch::Receiver<Option<ProcessOutcome>>) {
        let objects = office
            .meta
            .process_objects
            .iter()
            .map(|meta| ManagedObjectContainer::new(meta.clone(), &office.sourcing))
            .collect();
        let (completion, receiver) = watch::channel(None);
        office.process_started();

        let process = Arc::new(Self {
            id: ProcessId::new(),
            office,
            objects,
            inner: Mutex::new(ProcessInner::default()),
            next_thread: AtomicU32::new(0),
            started_at: Utc::now(),
            completion,
        });
        tracing::info!(process = %process.id, office = %process.office.meta.name, "process_started");
        (process, receiver)
    }

    pub fn id(&self) -> &ProcessId {
        &self.id
    }

    pub fn managed_object_container(&self, index: usize) -> Option<&Arc<ManagedObjectContainer>> {
        self.objects.get(index)
    }

    pub fn escalation_procedure(&self) -> &EscalationProcedure {
        &self.office.meta.process_escalation
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.lock().aborted
    }

    pub fn active_threads(&self) -> usize {
        self.inner.lock().active_threads
    }

    pub fn escalations(&self) -> Vec<EscalationReport> {
        self.inner.lock().escalations.clone()
    }

    pub(crate) fn office(&self) -> &Arc<OfficeRuntime> {
        &self.office
    }

    pub(crate) fn register_thread(&self) -> ThreadStateId {
        self.inner.lock().active_threads += 1;
        ThreadStateId(self.next_thread.fetch_add(1, Ordering::SeqCst))
    }

    pub(crate) fn record(&self, report: EscalationReport) {
        self.inner.lock().escalations.push(report);
    }

    /// Hand an escalation no procedure matched to the default handler.
    pub(crate) fn handle_unhandled(&self, escalation: &Escalation, thread: ThreadStateId, function: Option<String>) {
        self.record(EscalationReport::new(
            escalation,
            EscalationLevel::Default,
            thread,
            function,
        ));

        let handler = self.office.meta.default_handler.clone();
        let result = with_recovery(|| handler.handle(&self.id, escalation), "default_escalation_handler");
        if let Err(error) = result {
            tracing::error!(
                process = %self.id,
                cause_type = %escalation.cause_type(),
                "process_aborted: default escalation handler failed: {}",
                error
            );
            self.inner.lock().aborted = true;
        }
    }

    pub(crate) fn thread_completed(&self) {
        let finish = {
            let mut inner = self.inner.lock();
            inner.active_threads = inner.active_threads.saturating_sub(1);
            if inner.active_threads == 0 && !inner.finished {
                inner.finished = true;
                true
            } else {
                false
            }
        };
        if finish {
            self.finish();
        }
    }

    fn finish(&self) {
        for container in &self.objects {
            container.release();
        }

        let outcome = {
            let inner = self.inner.lock();
            ProcessOutcome {
                process_id: self.id.clone(),
                escalations: inner.escalations.clone(),
                aborted: inner.aborted,
                threads: self.next_thread.load(Ordering::SeqCst),
                started_at: self.started_at,
                finished_at: Utc::now(),
            }
        };

        tracing::info!(
            process = %self.id,
            success = outcome.is_success(),
            aborted = outcome.aborted,
            threads = outcome.threads,
            "process_finished"
        );
        self.completion.send_replace(Some(outcome));
        self.office.process_finished();
    }
}

impl fmt::Debug for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ProcessState")
            .field("id", &self.id)
            .field("active_threads", &inner.active_threads)
            .field("escalations", &inner.escalations.len())
            .field("aborted", &inner.aborted)
            .finish()
    }
}
