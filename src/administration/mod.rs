//! Administration - reusable duties run around functions.
//!
//! An [`Administration`] is stateless logic invoked before or after a
//! function with the extensions of the managed objects it administers. Its
//! instance is created lazily on first use and cached for the lifetime of the
//! owning thread. Duties, their flows and their governance are addressed by
//! stable integer keys resolved when the office is built.

use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::function::{FlowCallback, FlowRequest, Parameter};
use crate::governance::GovernanceAction;
use crate::kernel::with_recovery;
use crate::managed_object::{downcast, Extension};
use crate::office::{AdministrationIndex, AdministrationMeta, DutyMeta, GovernanceIndex};
use crate::types::{Error, Result};

/// Administrative logic. `duty` is the index of the duty within the
/// administration.
pub trait Administration: Send + Sync {
    fn administer(&self, duty: usize, context: &mut DutyContext<'_>) -> Result<()>;
}

impl<F> Administration for F
where
    F: Fn(usize, &mut DutyContext<'_>) -> Result<()> + Send + Sync,
{
    fn administer(&self, duty: usize, context: &mut DutyContext<'_>) -> Result<()> {
        self(duty, context)
    }
}

/// Creates the administration instance.
pub trait AdministrationSource: Send + Sync {
    fn create_administration(&self) -> Result<Arc<dyn Administration>>;
}

impl<F> AdministrationSource for F
where
    F: Fn() -> Result<Arc<dyn Administration>> + Send + Sync,
{
    fn create_administration(&self) -> Result<Arc<dyn Administration>> {
        self()
    }
}

/// Stable integer key for a duty's flows and governance.
pub trait DutyKey {
    fn index(&self) -> usize;
}

impl DutyKey for usize {
    fn index(&self) -> usize {
        *self
    }
}

/// Binding of a function to one duty of one administration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DutyAssociation {
    pub administration: AdministrationIndex,
    pub duty: usize,
}

/// Requests recorded by a duty, applied by the engine after it returns.
#[derive(Debug, Default)]
pub struct DutyOutcome {
    pub flows: Vec<FlowRequest>,
    pub governance: Vec<(GovernanceIndex, GovernanceAction)>,
}

/// Context handed to [`Administration::administer`].
pub struct DutyContext<'a> {
    duty: &'a DutyMeta,
    extensions: Vec<Extension>,
    outcome: DutyOutcome,
}

impl<'a> DutyContext<'a> {
    pub(crate) fn new(duty: &'a DutyMeta, extensions: Vec<Extension>) -> Self {
        Self {
            duty,
            extensions,
            outcome: DutyOutcome::default(),
        }
    }

    pub fn duty_name(&self) -> &str {
        &self.duty.name
    }

    /// Extensions of the administered managed objects, in declared order.
    pub fn extensions(&self) -> &[Extension] {
        &self.extensions
    }

    pub fn extension<T: Any + Send + Sync>(&self, index: usize) -> Result<Arc<T>> {
        let extension = self.extensions.get(index).ok_or_else(|| {
            Error::not_found(format!("extension {} of duty '{}'", index, self.duty.name))
        })?;
        downcast(extension, &format!("extension {} of duty '{}'", index, self.duty.name))
    }

    /// Instigate one of the duty's flows once the duty completes.
    pub fn do_flow(&mut self, key: impl DutyKey, parameter: Option<Parameter>) -> Result<()> {
        self.request_flow(key.index(), parameter, None)
    }

    pub fn do_flow_with_callback(
        &mut self,
        key: impl DutyKey,
        parameter: Option<Parameter>,
        callback: FlowCallback,
    ) -> Result<()> {
        self.request_flow(key.index(), parameter, Some(callback))
    }

    /// Access one of the duty's governances.
    pub fn governance(&mut self, key: impl DutyKey) -> Result<GovernanceManager<'_, 'a>> {
        let index = *self.duty.governance.get(key.index()).ok_or_else(|| {
            Error::not_found(format!(
                "governance {} of duty '{}'",
                key.index(),
                self.duty.name
            ))
        })?;
        Ok(GovernanceManager {
            context: self,
            index,
        })
    }

    fn request_flow(
        &mut self,
        key: usize,
        parameter: Option<Parameter>,
        callback: Option<FlowCallback>,
    ) -> Result<()> {
        let flow = self.duty.flows.get(key).ok_or_else(|| {
            Error::not_found(format!("flow {} of duty '{}'", key, self.duty.name))
        })?;
        self.outcome.flows.push(FlowRequest::new(flow.clone(), parameter, callback));
        Ok(())
    }

    pub(crate) fn into_outcome(self) -> DutyOutcome {
        self.outcome
    }
}

impl fmt::Debug for DutyContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DutyContext")
            .field("duty", &self.duty.name)
            .field("extensions", &self.extensions.len())
            .field("outcome", &self.outcome)
            .finish()
    }
}

/// Queues governance transitions on behalf of a duty.
#[derive(Debug)]
pub struct GovernanceManager<'c, 'a> {
    context: &'c mut DutyContext<'a>,
    index: GovernanceIndex,
}

impl GovernanceManager<'_, '_> {
    pub fn activate(self) {
        self.request(GovernanceAction::Activate);
    }

    pub fn enforce(self) {
        self.request(GovernanceAction::Enforce);
    }

    pub fn disregard(self) {
        self.request(GovernanceAction::Disregard);
    }

    fn request(self, action: GovernanceAction) {
        self.context.outcome.governance.push((self.index, action));
    }
}

/// Per-thread holder of one administration's lazily created instance.
pub struct AdministrationContainer {
    meta: Arc<AdministrationMeta>,
    instance: Mutex<Option<Arc<dyn Administration>>>,
}

impl AdministrationContainer {
    pub fn new(meta: Arc<AdministrationMeta>) -> Self {
        Self {
            meta,
            instance: Mutex::new(None),
        }
    }

    pub fn meta(&self) -> &Arc<AdministrationMeta> {
        &self.meta
    }

    pub fn is_created(&self) -> bool {
        self.instance.lock().is_some()
    }

    /// The cached instance, creating it on first use.
    pub fn administration(&self) -> Result<Arc<dyn Administration>> {
        if let Some(instance) = self.instance.lock().as_ref() {
            return Ok(instance.clone());
        }

        let source = self.meta.source.clone();
        let created = with_recovery(|| source.create_administration(), &self.meta.name)?;
        tracing::debug!(administration = %self.meta.name, "administration_created");

        let mut slot = self.instance.lock();
        Ok(slot.get_or_insert(created).clone())
    }

    /// Run one duty with the given extensions.
    pub fn do_duty(&self, duty: usize, extensions: Vec<Extension>) -> Result<DutyOutcome> {
        let meta = self.meta.duties.get(duty).ok_or_else(|| {
            Error::not_found(format!("duty {} of administration '{}'", duty, self.meta.name))
        })?;
        let administration = self.administration()?;

        let mut context = DutyContext::new(meta, extensions);
        with_recovery(
            || administration.administer(duty, &mut context),
            &format!("{}.{}", self.meta.name, meta.name),
        )?;
        Ok(context.into_outcome())
    }
}

impl fmt::Debug for AdministrationContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdministrationContainer")
            .field("name", &self.meta.name)
            .field("created", &self.is_created())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::escalation::EscalationProcedure;
    use crate::function::InstigationStrategy;
    use crate::office::FlowMeta;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn meta(source: Arc<dyn AdministrationSource>) -> Arc<AdministrationMeta> {
        Arc::new(AdministrationMeta {
            name: "audit".to_string(),
            source,
            extensions: Vec::new(),
            duties: vec![DutyMeta {
                name: "check".to_string(),
                flows: vec![Arc::new(FlowMeta {
                    function: 4,
                    strategy: InstigationStrategy::Sequential,
                    escalation: EscalationProcedure::default(),
                })],
                governance: vec![2],
            }],
        })
    }

    /// Administration behaving according to `mode`.
    struct Scripted {
        mode: &'static str,
    }

    impl Administration for Scripted {
        fn administer(&self, _duty: usize, context: &mut DutyContext<'_>) -> Result<()> {
            match self.mode {
                "record" => {
                    assert_eq!(*context.extension::<u32>(0)?, 9);
                    context.do_flow(0usize, None)?;
                    context.governance(0usize)?.enforce();
                }
                "unknown" => {
                    assert!(context.do_flow(5usize, None).is_err());
                    assert!(context.governance(5usize).is_err());
                    assert!(context.extension::<u32>(0).is_err());
                }
                "panic" => panic!("duty exploded"),
                _ => {}
            }
            Ok(())
        }
    }

    struct ScriptedSource {
        mode: &'static str,
        created: AtomicUsize,
    }

    impl ScriptedSource {
        fn new(mode: &'static str) -> Arc<Self> {
            Arc::new(Self {
                mode,
                created: AtomicUsize::new(0),
            })
        }
    }

    impl AdministrationSource for ScriptedSource {
        fn create_administration(&self) -> Result<Arc<dyn Administration>> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(Scripted { mode: self.mode }))
        }
    }

    #[test]
    fn test_instance_created_once() {
        let source = ScriptedSource::new("noop");
        let container = AdministrationContainer::new(meta(source.clone()));

        assert!(!container.is_created());
        container.do_duty(0, Vec::new()).unwrap();
        container.do_duty(0, Vec::new()).unwrap();
        assert!(container.is_created());
        assert_eq!(source.created.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_duty_records_flows_and_governance() {
        let container = AdministrationContainer::new(meta(ScriptedSource::new("record")));

        let outcome = container.do_duty(0, vec![Arc::new(9u32)]).unwrap();
        assert_eq!(outcome.flows.len(), 1);
        assert_eq!(outcome.governance, vec![(2, GovernanceAction::Enforce)]);
    }

    #[test]
    fn test_unknown_keys_are_errors() {
        let container = AdministrationContainer::new(meta(ScriptedSource::new("unknown")));
        container.do_duty(0, Vec::new()).unwrap();
        assert!(container.do_duty(1, Vec::new()).is_err());
    }

    #[test]
    fn test_panicking_duty_is_recovered() {
        let container = AdministrationContainer::new(meta(ScriptedSource::new("panic")));
        let err = container.do_duty(0, Vec::new()).unwrap_err();
        assert_eq!(err.cause_type().as_str(), "internal");
    }
}
