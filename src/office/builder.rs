//! OfficeBuilder - assembles the meta-data graph by name.
//!
//! Declarations reference each other by name. [`OfficeBuilder::build`]
//! resolves every name to an index, computes load orders and team
//! assignments, and reports each problem found as an [`Issue`] instead of
//! stopping at the first one.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::issues::{Issue, IssueKind, IssueSink};
use super::meta::{
    AdministrationMeta, DutyMeta, FlowMeta, FunctionIndex, FunctionMeta, GovernanceMeta, ManagedObjectMeta,
    OfficeMeta, TeamIndex,
};
use super::validation::{find_cycle, load_order, validate_non_empty};
use super::Office;
use crate::administration::{AdministrationSource, DutyAssociation};
use crate::escalation::{CauseType, EscalationFlow, EscalationHandler, EscalationProcedure, LoggingEscalationHandler};
use crate::function::{FunctionContext, InstigationStrategy, ManagedFunction, Parameter};
use crate::governance::{Governance, GovernanceDeactivation, GovernanceSource};
use crate::managed_object::{Extension, ExtensionFactory, ExtensionRef, ManagedObjectSource, Object, ObjectRef, Scope, SourceContext};
use crate::team::{create_team, Affinity, Team, TeamRegistry};
use crate::types::{Config, KernelDefaults, Result};

type EscalationDeclaration = (CauseType, String);

// =============================================================================
// Declarations
// =============================================================================

pub struct ManagedObjectDeclaration {
    name: String,
    scope: Scope,
    source: Arc<dyn ManagedObjectSource>,
    timeout: Option<Duration>,
    dependencies: Vec<String>,
    extensions: Vec<(String, ExtensionFactory)>,
}

impl ManagedObjectDeclaration {
    /// Sourcing timeout; defaults to `managed_object_timeout`.
    pub fn timeout(&mut self, timeout: Duration) -> &mut Self {
        self.timeout = Some(timeout);
        self
    }

    /// Object handed to the source before this one is sourced.
    pub fn depends_on(&mut self, object: impl Into<String>) -> &mut Self {
        self.dependencies.push(object.into());
        self
    }

    /// Supply the extension `key` built by `factory`.
    pub fn extension<F>(&mut self, key: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&Object) -> Result<Extension> + Send + Sync + 'static,
    {
        self.extensions.push((key.into(), Arc::new(factory)));
        self
    }

    fn supplies(&self, key: &str) -> Option<&ExtensionFactory> {
        self.extensions
            .iter()
            .find(|(supplied, _)| supplied == key)
            .map(|(_, factory)| factory)
    }
}

impl fmt::Debug for ManagedObjectDeclaration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedObjectDeclaration")
            .field("name", &self.name)
            .field("scope", &self.scope)
            .field("timeout", &self.timeout)
            .field("dependencies", &self.dependencies)
            .finish_non_exhaustive()
    }
}

pub struct GovernanceDeclaration {
    name: String,
    extension_key: String,
    source: Arc<dyn GovernanceSource>,
    team: Option<String>,
    deactivation: GovernanceDeactivation,
}

impl GovernanceDeclaration {
    /// Team running activation, enforcement and disregard.
    pub fn team(&mut self, team: impl Into<String>) -> &mut Self {
        self.team = Some(team.into());
        self
    }

    /// Policy applied when the thread completes with the governance active.
    pub fn deactivation(&mut self, deactivation: GovernanceDeactivation) -> &mut Self {
        self.deactivation = deactivation;
        self
    }
}

impl fmt::Debug for GovernanceDeclaration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GovernanceDeclaration")
            .field("name", &self.name)
            .field("extension_key", &self.extension_key)
            .field("team", &self.team)
            .field("deactivation", &self.deactivation)
            .finish_non_exhaustive()
    }
}

pub struct AdministrationDeclaration {
    name: String,
    source: Arc<dyn AdministrationSource>,
    administered: Vec<(String, String)>,
    duties: Vec<DutyDeclaration>,
}

impl AdministrationDeclaration {
    /// Hand extension `key` of `object` to every duty.
    pub fn administer(&mut self, object: impl Into<String>, key: impl Into<String>) -> &mut Self {
        self.administered.push((object.into(), key.into()));
        self
    }

    /// Declare a duty. Its index is its declaration order.
    pub fn duty(&mut self, name: impl Into<String>) -> &mut DutyDeclaration {
        self.duties.push(DutyDeclaration {
            name: name.into(),
            flows: Vec::new(),
            governance: Vec::new(),
        });
        let last = self.duties.len() - 1;
        &mut self.duties[last]
    }
}

impl fmt::Debug for AdministrationDeclaration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdministrationDeclaration")
            .field("name", &self.name)
            .field("administered", &self.administered)
            .field("duties", &self.duties)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct DutyDeclaration {
    name: String,
    flows: Vec<FlowDeclaration>,
    governance: Vec<String>,
}

impl DutyDeclaration {
    /// Flow addressed by its declaration order through `DutyContext::do_flow`.
    pub fn flow(&mut self, flow: FlowDeclaration) -> &mut Self {
        self.flows.push(flow);
        self
    }

    /// Governance addressed by its declaration order through
    /// `DutyContext::governance`.
    pub fn governance(&mut self, governance: impl Into<String>) -> &mut Self {
        self.governance.push(governance.into());
        self
    }
}

/// A flow a function or duty may instigate.
#[derive(Debug, Clone)]
pub struct FlowDeclaration {
    function: String,
    strategy: InstigationStrategy,
    escalation: Vec<EscalationDeclaration>,
}

impl FlowDeclaration {
    pub fn new(function: impl Into<String>, strategy: InstigationStrategy) -> Self {
        Self {
            function: function.into(),
            strategy,
            escalation: Vec::new(),
        }
    }

    pub fn sequential(function: impl Into<String>) -> Self {
        Self::new(function, InstigationStrategy::Sequential)
    }

    pub fn parallel_thread(function: impl Into<String>) -> Self {
        Self::new(function, InstigationStrategy::ParallelThread)
    }

    pub fn asynchronous(function: impl Into<String>) -> Self {
        Self::new(function, InstigationStrategy::Asynchronous)
    }

    /// Flow-level handler for `cause`.
    pub fn escalation(mut self, cause: impl Into<CauseType>, handler: impl Into<String>) -> Self {
        self.escalation.push((cause.into(), handler.into()));
        self
    }
}

pub struct FunctionDeclaration {
    name: String,
    logic: Arc<dyn ManagedFunction>,
    team: Option<String>,
    objects: Vec<String>,
    governance: Vec<String>,
    pre_duties: Vec<(String, String)>,
    post_duties: Vec<(String, String)>,
    flows: Vec<FlowDeclaration>,
    next: Option<String>,
    escalation: Vec<EscalationDeclaration>,
}

impl FunctionDeclaration {
    pub fn team(&mut self, team: impl Into<String>) -> &mut Self {
        self.team = Some(team.into());
        self
    }

    /// Managed object handed to the logic, addressed by declaration order.
    pub fn object(&mut self, object: impl Into<String>) -> &mut Self {
        self.objects.push(object.into());
        self
    }

    /// Governance activated before the function runs.
    pub fn governance(&mut self, governance: impl Into<String>) -> &mut Self {
        self.governance.push(governance.into());
        self
    }

    pub fn pre_duty(&mut self, administration: impl Into<String>, duty: impl Into<String>) -> &mut Self {
        self.pre_duties.push((administration.into(), duty.into()));
        self
    }

    pub fn post_duty(&mut self, administration: impl Into<String>, duty: impl Into<String>) -> &mut Self {
        self.post_duties.push((administration.into(), duty.into()));
        self
    }

    /// Flow addressed by declaration order through `FunctionContext::do_flow`.
    pub fn flow(&mut self, flow: FlowDeclaration) -> &mut Self {
        self.flows.push(flow);
        self
    }

    /// Function receiving this one's result once it completes.
    pub fn next(&mut self, function: impl Into<String>) -> &mut Self {
        self.next = Some(function.into());
        self
    }

    /// Function-level handler for `cause`.
    pub fn escalation(&mut self, cause: impl Into<CauseType>, handler: impl Into<String>) -> &mut Self {
        self.escalation.push((cause.into(), handler.into()));
        self
    }
}

impl fmt::Debug for FunctionDeclaration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionDeclaration")
            .field("name", &self.name)
            .field("team", &self.team)
            .field("objects", &self.objects)
            .field("governance", &self.governance)
            .field("flows", &self.flows)
            .field("next", &self.next)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Assembles an [`Office`].
pub struct OfficeBuilder {
    name: String,
    defaults: KernelDefaults,
    teams: Vec<Arc<dyn Team>>,
    default_team: Option<String>,
    affinities: Vec<(Affinity, String)>,
    objects: Vec<ManagedObjectDeclaration>,
    governance: Vec<GovernanceDeclaration>,
    administrations: Vec<AdministrationDeclaration>,
    functions: Vec<FunctionDeclaration>,
    thread_escalation: Vec<EscalationDeclaration>,
    process_escalation: Vec<EscalationDeclaration>,
    default_handler: Arc<dyn EscalationHandler>,
    pending: Vec<Issue>,
}

impl OfficeBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            defaults: KernelDefaults::default(),
            teams: Vec::new(),
            default_team: None,
            affinities: Vec::new(),
            objects: Vec::new(),
            governance: Vec::new(),
            administrations: Vec::new(),
            functions: Vec::new(),
            thread_escalation: Vec::new(),
            process_escalation: Vec::new(),
            default_handler: Arc::new(LoggingEscalationHandler),
            pending: Vec::new(),
        }
    }

    /// Apply the configured defaults and teams.
    pub fn with_config(&mut self, config: &Config) -> &mut Self {
        self.defaults = config.defaults.clone();
        self.add_configured_teams(config)
    }

    pub fn defaults(&mut self, defaults: KernelDefaults) -> &mut Self {
        self.defaults = defaults;
        self
    }

    pub fn add_team(&mut self, team: Arc<dyn Team>) -> &mut Self {
        self.teams.push(team);
        self
    }

    /// Create every team of `config`. Failures are reported at build time.
    pub fn add_configured_teams(&mut self, config: &Config) -> &mut Self {
        for team in &config.teams {
            match create_team(team) {
                Ok(created) => self.teams.push(created),
                Err(error) => self
                    .pending
                    .push(Issue::new(IssueKind::Invalid, &team.name, error.to_string())),
            }
        }
        self
    }

    /// Team for continuations without a team of their own. Defaults to the
    /// first team added.
    pub fn default_team(&mut self, team: impl Into<String>) -> &mut Self {
        self.default_team = Some(team.into());
        self
    }

    /// Functions matching `affinity` without an explicit team run on `team`.
    pub fn team_affinity(&mut self, affinity: Affinity, team: impl Into<String>) -> &mut Self {
        self.affinities.push((affinity, team.into()));
        self
    }

    pub fn managed_object<F>(&mut self, name: impl Into<String>, scope: Scope, source: F) -> &mut ManagedObjectDeclaration
    where
        F: Fn(SourceContext) -> Result<()> + Send + Sync + 'static,
    {
        self.managed_object_source(name, scope, Arc::new(source))
    }

    pub fn managed_object_source(
        &mut self,
        name: impl Into<String>,
        scope: Scope,
        source: Arc<dyn ManagedObjectSource>,
    ) -> &mut ManagedObjectDeclaration {
        self.objects.push(ManagedObjectDeclaration {
            name: name.into(),
            scope,
            source,
            timeout: None,
            dependencies: Vec::new(),
            extensions: Vec::new(),
        });
        let last = self.objects.len() - 1;
        &mut self.objects[last]
    }

    /// Governance over every thread and process object supplying extension
    /// `extension_key`.
    pub fn governance<F>(
        &mut self,
        name: impl Into<String>,
        extension_key: impl Into<String>,
        source: F,
    ) -> &mut GovernanceDeclaration
    where
        F: Fn() -> Result<Box<dyn Governance>> + Send + Sync + 'static,
    {
        self.governance_source(name, extension_key, Arc::new(source))
    }

    pub fn governance_source(
        &mut self,
        name: impl Into<String>,
        extension_key: impl Into<String>,
        source: Arc<dyn GovernanceSource>,
    ) -> &mut GovernanceDeclaration {
        self.governance.push(GovernanceDeclaration {
            name: name.into(),
            extension_key: extension_key.into(),
            source,
            team: None,
            deactivation: GovernanceDeactivation::default(),
        });
        let last = self.governance.len() - 1;
        &mut self.governance[last]
    }

    pub fn administration(
        &mut self,
        name: impl Into<String>,
        source: Arc<dyn AdministrationSource>,
    ) -> &mut AdministrationDeclaration {
        self.administrations.push(AdministrationDeclaration {
            name: name.into(),
            source,
            administered: Vec::new(),
            duties: Vec::new(),
        });
        let last = self.administrations.len() - 1;
        &mut self.administrations[last]
    }

    pub fn function<F>(&mut self, name: impl Into<String>, logic: F) -> &mut FunctionDeclaration
    where
        F: Fn(&mut FunctionContext<'_>) -> Result<Option<Parameter>> + Send + Sync + 'static,
    {
        self.function_logic(name, Arc::new(logic))
    }

    pub fn function_logic(&mut self, name: impl Into<String>, logic: Arc<dyn ManagedFunction>) -> &mut FunctionDeclaration {
        self.functions.push(FunctionDeclaration {
            name: name.into(),
            logic,
            team: None,
            objects: Vec::new(),
            governance: Vec::new(),
            pre_duties: Vec::new(),
            post_duties: Vec::new(),
            flows: Vec::new(),
            next: None,
            escalation: Vec::new(),
        });
        let last = self.functions.len() - 1;
        &mut self.functions[last]
    }

    /// Thread-level handler for `cause`.
    pub fn thread_escalation(&mut self, cause: impl Into<CauseType>, handler: impl Into<String>) -> &mut Self {
        self.thread_escalation.push((cause.into(), handler.into()));
        self
    }

    /// Process-level handler for `cause`.
    pub fn process_escalation(&mut self, cause: impl Into<CauseType>, handler: impl Into<String>) -> &mut Self {
        self.process_escalation.push((cause.into(), handler.into()));
        self
    }

    /// Sink for escalations no procedure handles.
    pub fn default_handler(&mut self, handler: Arc<dyn EscalationHandler>) -> &mut Self {
        self.default_handler = handler;
        self
    }

    /// Resolve the graph. Returns `None` if any issue was reported.
    pub fn build(self, sink: &mut dyn IssueSink) -> Option<Office> {
        let mut resolver = Resolver {
            issues: self.pending,
        };

        resolver.check_name(&self.name, "office");
        for name in self
            .objects
            .iter()
            .map(|o| &o.name)
            .chain(self.governance.iter().map(|g| &g.name))
            .chain(self.administrations.iter().map(|a| &a.name))
            .chain(self.functions.iter().map(|f| &f.name))
        {
            resolver.check_name(name, "declaration name");
        }

        // Teams
        let team_names: Vec<&str> = self.teams.iter().map(|team| team.name()).collect();
        let team_index = resolver.index_names(&team_names, "team");
        if self.teams.is_empty() {
            resolver.report(IssueKind::MissingTeam, &self.name, "no teams configured");
        }
        let default_team = match &self.default_team {
            Some(name) => team_index.get(name.as_str()).copied().unwrap_or_else(|| {
                resolver.report(IssueKind::MissingTeam, &self.name, format!("default team '{name}' not found"));
                0
            }),
            None => 0,
        };

        // Managed objects
        let object_names: Vec<&str> = self.objects.iter().map(|o| o.name.as_str()).collect();
        let object_index = resolver.index_names(&object_names, "managed object");
        let mut counters: HashMap<Scope, usize> = HashMap::new();
        let refs: Vec<ObjectRef> = self
            .objects
            .iter()
            .map(|object| {
                let counter = counters.entry(object.scope).or_insert(0);
                let reference = ObjectRef::new(object.scope, *counter);
                *counter += 1;
                reference
            })
            .collect();

        let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); self.objects.len()];
        for (id, object) in self.objects.iter().enumerate() {
            for dependency in &object.dependencies {
                let Some(&target) = object_index.get(dependency.as_str()) else {
                    resolver.report(
                        IssueKind::Unresolved,
                        &object.name,
                        format!("dependency '{dependency}' not declared"),
                    );
                    continue;
                };
                let target_scope = self.objects[target].scope;
                if !object.scope.can_depend_on(target_scope) {
                    resolver.report(
                        IssueKind::ScopeViolation,
                        &object.name,
                        format!(
                            "{} object cannot depend on {} object '{}'",
                            object.scope, target_scope, dependency
                        ),
                    );
                }
                adjacency[id].push(target);
            }
        }
        let acyclic = match find_cycle(&adjacency) {
            Some(cycle) => {
                let path: Vec<&str> = cycle.iter().map(|id| object_names[*id]).collect();
                resolver.report(
                    IssueKind::DependencyCycle,
                    path.first().copied().unwrap_or_default(),
                    path.join(" -> "),
                );
                false
            }
            None => true,
        };

        let mut process_objects = Vec::new();
        let mut thread_objects = Vec::new();
        let mut function_objects = Vec::new();
        for (id, object) in self.objects.iter().enumerate() {
            let meta = Arc::new(ManagedObjectMeta {
                name: object.name.clone(),
                scope: object.scope,
                source: object.source.clone(),
                dependencies: adjacency[id].iter().map(|target| refs[*target]).collect(),
                timeout: object.timeout.unwrap_or(self.defaults.managed_object_timeout),
            });
            match object.scope {
                Scope::Process => process_objects.push(meta),
                Scope::Thread => thread_objects.push(meta),
                Scope::Function => function_objects.push(meta),
            }
        }

        // Governance
        let governance_names: Vec<&str> = self.governance.iter().map(|g| g.name.as_str()).collect();
        let governance_index = resolver.index_names(&governance_names, "governance");
        let governance: Vec<Arc<GovernanceMeta>> = self
            .governance
            .iter()
            .map(|declaration| {
                let extensions: Vec<ExtensionRef> = self
                    .objects
                    .iter()
                    .enumerate()
                    .filter(|(_, object)| object.scope != Scope::Function)
                    .filter_map(|(id, object)| {
                        object.supplies(&declaration.extension_key).map(|factory| ExtensionRef {
                            object: refs[id],
                            factory: factory.clone(),
                        })
                    })
                    .collect();
                if extensions.is_empty() {
                    resolver.report(
                        IssueKind::MissingExtension,
                        &declaration.name,
                        format!("no thread or process object supplies '{}'", declaration.extension_key),
                    );
                }
                let team = declaration
                    .team
                    .as_ref()
                    .and_then(|name| resolver.team(&team_index, name, &declaration.name));
                Arc::new(GovernanceMeta {
                    name: declaration.name.clone(),
                    source: declaration.source.clone(),
                    extensions,
                    team,
                    deactivation: declaration.deactivation,
                })
            })
            .collect();

        let function_names: Vec<&str> = self.functions.iter().map(|f| f.name.as_str()).collect();
        let function_index = resolver.index_names(&function_names, "function");

        // Administrations
        let administration_names: Vec<&str> = self.administrations.iter().map(|a| a.name.as_str()).collect();
        let administration_index = resolver.index_names(&administration_names, "administration");
        let mut administered_objects: Vec<Vec<usize>> = Vec::new();
        let administrations: Vec<Arc<AdministrationMeta>> = self
            .administrations
            .iter()
            .map(|declaration| {
                let mut objects = Vec::new();
                let mut extensions = Vec::new();
                for (object, key) in &declaration.administered {
                    let Some(&id) = object_index.get(object.as_str()) else {
                        resolver.report(
                            IssueKind::Unresolved,
                            &declaration.name,
                            format!("administered object '{object}' not declared"),
                        );
                        continue;
                    };
                    match self.objects[id].supplies(key) {
                        Some(factory) => {
                            objects.push(id);
                            extensions.push(ExtensionRef {
                                object: refs[id],
                                factory: factory.clone(),
                            });
                        }
                        None => resolver.report(
                            IssueKind::MissingExtension,
                            &declaration.name,
                            format!("object '{object}' does not supply '{key}'"),
                        ),
                    }
                }
                administered_objects.push(objects);

                let duties = declaration
                    .duties
                    .iter()
                    .map(|duty| {
                        let subject = format!("{}.{}", declaration.name, duty.name);
                        DutyMeta {
                            name: duty.name.clone(),
                            flows: duty
                                .flows
                                .iter()
                                .filter_map(|flow| resolver.flow(&function_index, flow, &subject))
                                .collect(),
                            governance: duty
                                .governance
                                .iter()
                                .filter_map(|name| resolver.lookup(&governance_index, name, "governance", &subject))
                                .collect(),
                        }
                    })
                    .collect();

                Arc::new(AdministrationMeta {
                    name: declaration.name.clone(),
                    source: declaration.source.clone(),
                    extensions,
                    duties,
                })
            })
            .collect();

        // Functions
        let functions: Vec<Arc<FunctionMeta>> = self
            .functions
            .iter()
            .map(|declaration| {
                let subject = declaration.name.as_str();
                let object_ids: Vec<usize> = declaration
                    .objects
                    .iter()
                    .filter_map(|name| resolver.lookup(&object_index, name, "managed object", subject))
                    .collect();
                let governance_ids: Vec<usize> = declaration
                    .governance
                    .iter()
                    .filter_map(|name| resolver.lookup(&governance_index, name, "governance", subject))
                    .collect();

                let mut duty = |(administration, duty): &(String, String)| -> Option<DutyAssociation> {
                    let index = resolver.lookup(&administration_index, administration, "administration", subject)?;
                    let position = self.administrations[index]
                        .duties
                        .iter()
                        .position(|declared| &declared.name == duty);
                    match position {
                        Some(duty) => Some(DutyAssociation {
                            administration: index,
                            duty,
                        }),
                        None => {
                            resolver.report(
                                IssueKind::Unresolved,
                                subject,
                                format!("duty '{administration}.{duty}' not declared"),
                            );
                            None
                        }
                    }
                };
                let pre_duties: Vec<DutyAssociation> = declaration.pre_duties.iter().filter_map(&mut duty).collect();
                let post_duties: Vec<DutyAssociation> = declaration.post_duties.iter().filter_map(&mut duty).collect();

                let mut roots = object_ids.clone();
                for association in pre_duties.iter().chain(&post_duties) {
                    if let Some(objects) = administered_objects.get(association.administration) {
                        roots.extend(objects);
                    }
                }
                let load = if acyclic {
                    load_order(&adjacency, &roots).into_iter().map(|id| refs[id]).collect()
                } else {
                    Vec::new()
                };

                let team = match &declaration.team {
                    Some(name) => resolver.team(&team_index, name, subject).unwrap_or(default_team),
                    None => {
                        let objects: Vec<&str> = object_ids.iter().map(|id| object_names[*id]).collect();
                        let governed: Vec<&str> = governance_ids.iter().map(|id| governance_names[*id]).collect();
                        self.affinities
                            .iter()
                            .find(|(affinity, _)| affinity.matches(&objects, &governed))
                            .and_then(|(_, team)| resolver.team(&team_index, team, subject))
                            .unwrap_or(default_team)
                    }
                };

                let flows = declaration
                    .flows
                    .iter()
                    .filter_map(|flow| resolver.flow(&function_index, flow, subject))
                    .collect();
                let next = declaration
                    .next
                    .as_ref()
                    .and_then(|name| resolver.lookup(&function_index, name, "function", subject));
                let escalation = resolver.procedure(&function_index, &declaration.escalation, subject);

                Arc::new(FunctionMeta {
                    name: declaration.name.clone(),
                    logic: declaration.logic.clone(),
                    team,
                    objects: object_ids.iter().map(|id| refs[*id]).collect(),
                    load_order: load,
                    governance: governance_ids,
                    pre_duties,
                    post_duties,
                    flows,
                    next,
                    escalation,
                })
            })
            .collect();

        let thread_escalation = resolver.procedure(&function_index, &self.thread_escalation, "thread escalation");
        let process_escalation = resolver.procedure(&function_index, &self.process_escalation, "process escalation");

        if !resolver.issues.is_empty() {
            for issue in resolver.issues {
                tracing::warn!(office = %self.name, kind = ?issue.kind, subject = %issue.subject, "office_issue: {}", issue.message);
                sink.report(issue);
            }
            return None;
        }

        let meta = OfficeMeta {
            name: self.name,
            functions,
            process_objects,
            thread_objects,
            function_objects,
            governance,
            administrations,
            thread_escalation,
            process_escalation,
            default_handler: self.default_handler,
            defaults: self.defaults,
        };
        tracing::info!(
            office = %meta.name,
            functions = meta.functions.len(),
            teams = self.teams.len(),
            "office_built"
        );
        Some(Office::new(meta, TeamRegistry::new(self.teams, default_team)))
    }
}

impl fmt::Debug for OfficeBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OfficeBuilder")
            .field("name", &self.name)
            .field("teams", &self.teams)
            .field("objects", &self.objects)
            .field("governance", &self.governance)
            .field("administrations", &self.administrations)
            .field("functions", &self.functions)
            .finish_non_exhaustive()
    }
}

/// Name resolution collecting issues.
struct Resolver {
    issues: Vec<Issue>,
}

impl Resolver {
    fn report(&mut self, kind: IssueKind, subject: &str, message: impl Into<String>) {
        self.issues.push(Issue::new(kind, subject, message));
    }

    fn check_name(&mut self, name: &str, field: &str) {
        if let Err(error) = validate_non_empty(name, field) {
            self.report(IssueKind::Invalid, name, error.to_string());
        }
    }

    /// Index of each name; later duplicates are reported.
    fn index_names<'n>(&mut self, names: &[&'n str], what: &str) -> HashMap<&'n str, usize> {
        let mut index = HashMap::new();
        for (position, name) in names.iter().enumerate() {
            if index.insert(*name, position).is_some() {
                self.report(IssueKind::Duplicate, name, format!("{what} declared more than once"));
            }
        }
        // The first declaration wins
        for (position, name) in names.iter().enumerate().rev() {
            index.insert(*name, position);
        }
        index
    }

    fn lookup(&mut self, index: &HashMap<&str, usize>, name: &str, what: &str, subject: &str) -> Option<usize> {
        let found = index.get(name).copied();
        if found.is_none() {
            self.report(IssueKind::Unresolved, subject, format!("{what} '{name}' not declared"));
        }
        found
    }

    fn team(&mut self, index: &HashMap<&str, usize>, name: &str, subject: &str) -> Option<TeamIndex> {
        let found = index.get(name).copied();
        if found.is_none() {
            self.report(IssueKind::MissingTeam, subject, format!("team '{name}' not found"));
        }
        found
    }

    fn procedure(
        &mut self,
        functions: &HashMap<&str, FunctionIndex>,
        declarations: &[EscalationDeclaration],
        subject: &str,
    ) -> EscalationProcedure {
        EscalationProcedure::new(
            declarations
                .iter()
                .filter_map(|(cause_type, handler)| {
                    self.lookup(functions, handler, "handler", subject).map(|handler| EscalationFlow {
                        cause_type: cause_type.clone(),
                        handler,
                    })
                })
                .collect(),
        )
    }

    fn flow(
        &mut self,
        functions: &HashMap<&str, FunctionIndex>,
        declaration: &FlowDeclaration,
        subject: &str,
    ) -> Option<Arc<FlowMeta>> {
        let function = self.lookup(functions, &declaration.function, "function", subject)?;
        let escalation = self.procedure(functions, &declaration.escalation, subject);
        Some(Arc::new(FlowMeta {
            function,
            strategy: declaration.strategy,
            escalation,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::team::PassiveTeam;

    fn noop(_context: &mut FunctionContext<'_>) -> Result<Option<Parameter>> {
        Ok(None)
    }

    fn ready(context: SourceContext) -> Result<()> {
        context.complete_with(1u32);
        Ok(())
    }

    fn builder() -> OfficeBuilder {
        let mut builder = OfficeBuilder::new("office");
        builder.add_team(Arc::new(PassiveTeam::new("default")));
        builder
    }

    fn kinds(issues: &[Issue]) -> Vec<IssueKind> {
        issues.iter().map(|issue| issue.kind).collect()
    }

    #[test]
    fn test_build_resolves_indices_and_load_order() {
        let mut builder = builder();
        builder.add_team(Arc::new(PassiveTeam::new("io")));
        builder.managed_object("config", Scope::Process, ready);
        builder.managed_object("db", Scope::Thread, ready).depends_on("config");
        builder.managed_object("cursor", Scope::Function, ready).depends_on("db");
        builder.function("load", noop).object("cursor").next("save").team("io");
        builder.function("save", noop);

        let mut issues = Vec::new();
        let office = builder.build(&mut issues).unwrap();
        assert!(issues.is_empty());

        let meta = office.meta();
        let load = &meta.functions[0];
        assert_eq!(load.team, 1);
        assert_eq!(load.next, Some(1));
        assert_eq!(load.objects, vec![ObjectRef::new(Scope::Function, 0)]);
        assert_eq!(
            load.load_order,
            vec![
                ObjectRef::new(Scope::Process, 0),
                ObjectRef::new(Scope::Thread, 0),
                ObjectRef::new(Scope::Function, 0),
            ]
        );
        assert_eq!(meta.functions[1].team, 0);
        assert_eq!(meta.object_ref("db"), Some(ObjectRef::new(Scope::Thread, 0)));
    }

    #[test]
    fn test_missing_team_is_an_issue() {
        let mut builder = OfficeBuilder::new("office");
        builder.function("f", noop);
        let mut issues = Vec::new();
        assert!(builder.build(&mut issues).is_none());
        assert_eq!(kinds(&issues), vec![IssueKind::MissingTeam]);
    }

    #[test]
    fn test_unknown_team_is_missing_team() {
        let mut builder = builder();
        builder.function("f", noop).team("gpu");
        let mut issues = Vec::new();
        assert!(builder.build(&mut issues).is_none());
        assert_eq!(kinds(&issues), vec![IssueKind::MissingTeam]);
    }

    #[test]
    fn test_dependency_cycle_reported() {
        let mut builder = builder();
        builder.managed_object("a", Scope::Process, ready).depends_on("b");
        builder.managed_object("b", Scope::Process, ready).depends_on("a");
        let mut issues = Vec::new();
        assert!(builder.build(&mut issues).is_none());
        assert_eq!(kinds(&issues), vec![IssueKind::DependencyCycle]);
        assert_eq!(issues[0].message, "a -> b -> a");
    }

    #[test]
    fn test_scope_violation_reported() {
        let mut builder = builder();
        builder.managed_object("conn", Scope::Thread, ready);
        builder.managed_object("pool", Scope::Process, ready).depends_on("conn");
        let mut issues = Vec::new();
        assert!(builder.build(&mut issues).is_none());
        assert_eq!(kinds(&issues), vec![IssueKind::ScopeViolation]);
    }

    #[test]
    fn test_unresolved_references_reported() {
        let mut builder = builder();
        builder
            .function("f", noop)
            .object("missing")
            .next("nowhere")
            .flow(FlowDeclaration::sequential("ghost"))
            .escalation("timeout", "no_handler");
        let mut issues = Vec::new();
        assert!(builder.build(&mut issues).is_none());
        assert_eq!(issues.len(), 4);
        assert!(issues.iter().all(|issue| issue.kind == IssueKind::Unresolved));
    }

    #[test]
    fn test_governance_without_extension_is_missing_extension() {
        let mut builder = builder();
        builder.managed_object("db", Scope::Thread, ready);
        builder.governance("tx", "transactional", || -> Result<Box<dyn Governance>> {
            Err(crate::types::Error::internal("unused"))
        });
        let mut issues = Vec::new();
        assert!(builder.build(&mut issues).is_none());
        assert_eq!(kinds(&issues), vec![IssueKind::MissingExtension]);
    }

    #[test]
    fn test_duplicates_reported() {
        let mut builder = builder();
        builder.function("f", noop);
        builder.function("f", noop);
        let mut issues = Vec::new();
        assert!(builder.build(&mut issues).is_none());
        assert_eq!(kinds(&issues), vec![IssueKind::Duplicate]);
    }

    #[test]
    fn test_affinity_assigns_team() {
        let mut builder = builder();
        builder.add_team(Arc::new(PassiveTeam::new("db-team")));
        builder.team_affinity(Affinity::ManagedObject("db".to_string()), "db-team");
        builder.managed_object("db", Scope::Process, ready);
        builder.function("query", noop).object("db");
        builder.function("other", noop);

        let office = builder.build(&mut Vec::new()).unwrap();
        assert_eq!(office.meta().functions[0].team, 1);
        assert_eq!(office.meta().functions[1].team, 0);
    }

    #[test]
    fn test_default_timeout_applies() {
        let mut builder = builder();
        builder.defaults(KernelDefaults {
            managed_object_timeout: Duration::from_millis(250),
            ..KernelDefaults::default()
        });
        builder.managed_object("a", Scope::Process, ready);
        builder.managed_object("b", Scope::Process, ready).timeout(Duration::from_secs(1));

        let office = builder.build(&mut Vec::new()).unwrap();
        assert_eq!(office.meta().process_objects[0].timeout, Duration::from_millis(250));
        assert_eq!(office.meta().process_objects[1].timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_configured_teams() {
        let config = Config::from_json_str(
            r#"{ "teams": [ { "name": "inline", "kind": "passive" }, { "name": "bad", "kind": "worker_pool", "size": 0 } ] }"#,
        )
        .unwrap();
        let mut builder = OfficeBuilder::new("office");
        builder.with_config(&config);
        builder.function("f", noop);

        let mut issues = Vec::new();
        assert!(builder.build(&mut issues).is_none());
        assert_eq!(kinds(&issues), vec![IssueKind::Invalid]);
        assert_eq!(issues[0].subject, "bad");
    }
}
