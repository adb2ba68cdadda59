//! Immutable meta-data graph of an office.
//!
//! Produced once by [`OfficeBuilder`](super::OfficeBuilder); every cross
//! reference is a small integer index resolved at build time.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::administration::{AdministrationSource, DutyAssociation};
use crate::escalation::{EscalationHandler, EscalationProcedure};
use crate::function::{InstigationStrategy, ManagedFunction};
use crate::governance::{GovernanceDeactivation, GovernanceSource};
use crate::managed_object::{ExtensionRef, ManagedObjectSource, ObjectRef, Scope};
use crate::types::KernelDefaults;

pub type FunctionIndex = usize;
pub type TeamIndex = usize;
pub type GovernanceIndex = usize;
pub type AdministrationIndex = usize;

pub struct ManagedObjectMeta {
    pub name: String,
    pub scope: Scope,
    pub source: Arc<dyn ManagedObjectSource>,
    /// Objects handed to the source, in declared order.
    pub dependencies: Vec<ObjectRef>,
    pub timeout: Duration,
}

impl fmt::Debug for ManagedObjectMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedObjectMeta")
            .field("name", &self.name)
            .field("scope", &self.scope)
            .field("dependencies", &self.dependencies)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

pub struct GovernanceMeta {
    pub name: String,
    pub source: Arc<dyn GovernanceSource>,
    /// Thread and process objects supplying the governed extension.
    pub extensions: Vec<ExtensionRef>,
    pub team: Option<TeamIndex>,
    pub deactivation: GovernanceDeactivation,
}

impl fmt::Debug for GovernanceMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GovernanceMeta")
            .field("name", &self.name)
            .field("extensions", &self.extensions)
            .field("team", &self.team)
            .field("deactivation", &self.deactivation)
            .finish_non_exhaustive()
    }
}

pub struct AdministrationMeta {
    pub name: String,
    pub source: Arc<dyn AdministrationSource>,
    /// Extensions handed to every duty, in declared order.
    pub extensions: Vec<ExtensionRef>,
    pub duties: Vec<DutyMeta>,
}

impl fmt::Debug for AdministrationMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdministrationMeta")
            .field("name", &self.name)
            .field("extensions", &self.extensions)
            .field("duties", &self.duties)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct DutyMeta {
    pub name: String,
    pub flows: Vec<Arc<FlowMeta>>,
    pub governance: Vec<GovernanceIndex>,
}

/// A flow that can be instigated, with its own escalation procedure.
#[derive(Debug, Clone)]
pub struct FlowMeta {
    pub function: FunctionIndex,
    pub strategy: InstigationStrategy,
    pub escalation: EscalationProcedure,
}

pub struct FunctionMeta {
    pub name: String,
    pub logic: Arc<dyn ManagedFunction>,
    pub team: TeamIndex,
    /// Objects handed to the logic, in declared order.
    pub objects: Vec<ObjectRef>,
    /// Every object to make ready before executing, dependencies first.
    pub load_order: Vec<ObjectRef>,
    pub governance: Vec<GovernanceIndex>,
    pub pre_duties: Vec<DutyAssociation>,
    pub post_duties: Vec<DutyAssociation>,
    pub flows: Vec<Arc<FlowMeta>>,
    pub next: Option<FunctionIndex>,
    pub escalation: EscalationProcedure,
}

impl fmt::Debug for FunctionMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionMeta")
            .field("name", &self.name)
            .field("team", &self.team)
            .field("objects", &self.objects)
            .field("load_order", &self.load_order)
            .field("governance", &self.governance)
            .field("flows", &self.flows)
            .field("next", &self.next)
            .finish_non_exhaustive()
    }
}

pub struct OfficeMeta {
    pub name: String,
    pub functions: Vec<Arc<FunctionMeta>>,
    pub process_objects: Vec<Arc<ManagedObjectMeta>>,
    pub thread_objects: Vec<Arc<ManagedObjectMeta>>,
    pub function_objects: Vec<Arc<ManagedObjectMeta>>,
    pub governance: Vec<Arc<GovernanceMeta>>,
    pub administrations: Vec<Arc<AdministrationMeta>>,
    pub thread_escalation: EscalationProcedure,
    pub process_escalation: EscalationProcedure,
    pub default_handler: Arc<dyn EscalationHandler>,
    pub defaults: KernelDefaults,
}

impl OfficeMeta {
    pub fn function_index(&self, name: &str) -> Option<FunctionIndex> {
        self.functions.iter().position(|function| function.name == name)
    }

    pub fn governance_index(&self, name: &str) -> Option<GovernanceIndex> {
        self.governance.iter().position(|governance| governance.name == name)
    }

    /// Reference of the managed object named `name`.
    pub fn object_ref(&self, name: &str) -> Option<ObjectRef> {
        [
            (Scope::Process, &self.process_objects),
            (Scope::Thread, &self.thread_objects),
            (Scope::Function, &self.function_objects),
        ]
        .into_iter()
        .find_map(|(scope, objects)| {
            objects
                .iter()
                .position(|object| object.name == name)
                .map(|index| ObjectRef::new(scope, index))
        })
    }
}

impl fmt::Debug for OfficeMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OfficeMeta")
            .field("name", &self.name)
            .field("functions", &self.functions.len())
            .field("process_objects", &self.process_objects.len())
            .field("thread_objects", &self.thread_objects.len())
            .field("function_objects", &self.function_objects.len())
            .field("governance", &self.governance.len())
            .field("administrations", &self.administrations.len())
            .field("defaults", &self.defaults)
            .finish_non_exhaustive()
    }
}
