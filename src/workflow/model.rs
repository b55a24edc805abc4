//! Declarative phase table and lookup functions for the build pipeline.
//!
//! The model is pure data: an ordered list of [`PhaseSpec`] entries plus
//! query functions the bus and coordinator consult. It never performs I/O.
//! Phase ordering is decided here and only here; message arrival order never
//! implies phase order.

use crate::bus::Priority;
use crate::errors::WorkflowError;
use crate::workflow::decision::{ArchitectureDecision, Backend, CiCd, Database, Frontend, Platform};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Category of a phase, used for priority defaults and parallelism caps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseCategory {
    /// Fixed front-of-pipeline phases; strictly ordered, each blocking the next.
    Orchestration,
    /// Phases that produce the architecture decision; also strictly ordered.
    Architecture,
    /// Conditional phases activated by the architecture decision.
    Implementation,
    /// Reporting-only phases; lowest priority.
    Reporting,
}

impl PhaseCategory {
    /// Whether phases of this category execute in the strictly ordered chain.
    pub fn is_ordered(&self) -> bool {
        matches!(self, Self::Orchestration | Self::Architecture)
    }
}

/// Pure activation predicate over the architecture decision.
///
/// Conditional predicates evaluate to `false` while no decision exists, so a
/// conditional phase can never activate before the architecture phases
/// complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationPredicate {
    Always,
    PlatformIs(Platform),
    FrontendIs(Frontend),
    BackendIs(Backend),
    DatabaseIs(Database),
    CiCdIs(CiCd),
    IacRequired,
    ContainerizationRequired,
}

impl ActivationPredicate {
    /// Evaluate against the current decision, if any.
    pub fn evaluate(&self, decision: Option<&ArchitectureDecision>) -> bool {
        let d = match (self, decision) {
            (Self::Always, _) => return true,
            (_, None) => return false,
            (_, Some(d)) => d,
        };
        match self {
            Self::Always => true,
            Self::PlatformIs(p) => d.platform == *p,
            Self::FrontendIs(f) => d.frontend == *f,
            Self::BackendIs(b) => d.backend == *b,
            Self::DatabaseIs(db) => d.database == *db,
            Self::CiCdIs(c) => d.ci_cd == *c,
            Self::IacRequired => d.iac_required,
            Self::ContainerizationRequired => d.containerization_required,
        }
    }

    /// Whether the predicate is unconditionally true.
    pub fn is_always(&self) -> bool {
        matches!(self, Self::Always)
    }
}

/// One entry in the phase table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseSpec {
    /// Position in the pipeline (0..N).
    pub number: u32,
    /// Stable identifier, e.g. "azure-architect".
    pub phase_id: String,
    /// The agent responsible for this phase.
    pub agent_id: String,
    pub category: PhaseCategory,
    pub predicate: ActivationPredicate,
    /// Does the next ordered phase wait for this one?
    #[serde(default = "default_true")]
    pub blocking: bool,
    /// Phase numbers that must be COMPLETED or SKIPPED first.
    #[serde(default)]
    pub depends_on: Vec<u32>,
    /// Phases sharing a mutex group are mutually exclusive; at most one of
    /// the group may activate for a given decision.
    #[serde(default)]
    pub mutex_group: Option<String>,
    /// Requires an approval decision before its execution message dispatches.
    #[serde(default)]
    pub requires_approval: bool,
}

fn default_true() -> bool {
    true
}

impl PhaseSpec {
    /// Shorthand for an ordered (orchestration/architecture) phase.
    pub fn ordered(number: u32, phase_id: &str, agent_id: &str, category: PhaseCategory) -> Self {
        let depends_on = if number == 0 { vec![] } else { vec![number - 1] };
        Self {
            number,
            phase_id: phase_id.to_string(),
            agent_id: agent_id.to_string(),
            category,
            predicate: ActivationPredicate::Always,
            blocking: true,
            depends_on,
            mutex_group: None,
            requires_approval: false,
        }
    }

    /// Shorthand for a conditional implementation phase.
    pub fn conditional(
        number: u32,
        phase_id: &str,
        agent_id: &str,
        predicate: ActivationPredicate,
        depends_on: Vec<u32>,
    ) -> Self {
        Self {
            number,
            phase_id: phase_id.to_string(),
            agent_id: agent_id.to_string(),
            category: PhaseCategory::Implementation,
            predicate,
            blocking: false,
            depends_on,
            mutex_group: None,
            requires_approval: false,
        }
    }

    /// Assign this phase to a mutex group.
    pub fn with_mutex_group(mut self, group: &str) -> Self {
        self.mutex_group = Some(group.to_string());
        self
    }

    /// Mark this phase as requiring approval before dispatch.
    pub fn with_approval(mut self) -> Self {
        self.requires_approval = true;
        self
    }

    /// Whether this phase is conditional (non-trivial predicate).
    pub fn is_conditional(&self) -> bool {
        !self.predicate.is_always()
    }
}

/// The validated workflow: phase table plus indexes.
#[derive(Debug, Clone)]
pub struct Workflow {
    phases: Vec<PhaseSpec>,
    by_number: HashMap<u32, usize>,
}

impl Workflow {
    /// Build and validate a workflow from phase specs.
    ///
    /// Validation rules:
    /// - phase numbers are unique and dependencies refer to earlier phases;
    /// - ordered-category phases form a chain, each depending on the previous
    ///   ordered phase;
    /// - mutex groups only contain conditional phases.
    pub fn new(mut phases: Vec<PhaseSpec>) -> Result<Self, WorkflowError> {
        phases.sort_by_key(|p| p.number);

        let mut by_number = HashMap::new();
        for (idx, phase) in phases.iter().enumerate() {
            if by_number.insert(phase.number, idx).is_some() {
                return Err(WorkflowError::DuplicatePhase(phase.number));
            }
        }

        for phase in &phases {
            for dep in &phase.depends_on {
                if !by_number.contains_key(dep) {
                    return Err(WorkflowError::UnknownDependency {
                        phase: phase.number,
                        dependency: *dep,
                    });
                }
                if *dep >= phase.number {
                    return Err(WorkflowError::ForwardDependency {
                        phase: phase.number,
                        dependency: *dep,
                    });
                }
            }
            if let Some(group) = &phase.mutex_group {
                if !phase.is_conditional() {
                    return Err(WorkflowError::UnconditionalMutex {
                        group: group.clone(),
                        phase: phase.number,
                    });
                }
            }
        }

        // Ordered phases must chain through their immediate ordered predecessor.
        let ordered: Vec<&PhaseSpec> = phases
            .iter()
            .filter(|p| p.category.is_ordered())
            .collect();
        for pair in ordered.windows(2) {
            let (prev, next) = (pair[0], pair[1]);
            if !next.depends_on.contains(&prev.number) {
                return Err(WorkflowError::BrokenChain {
                    phase: next.number,
                    expected: prev.number,
                });
            }
        }

        Ok(Self { phases, by_number })
    }

    /// All phases in pipeline order.
    pub fn phases(&self) -> &[PhaseSpec] {
        &self.phases
    }

    /// Look up a phase by number.
    pub fn phase(&self, number: u32) -> Result<&PhaseSpec, WorkflowError> {
        self.by_number
            .get(&number)
            .map(|idx| &self.phases[*idx])
            .ok_or(WorkflowError::UnknownPhase(number))
    }

    /// Phases that may follow `current` given the decision: every phase that
    /// depends on `current` and whose predicate passes.
    pub fn next_phases(
        &self,
        current: u32,
        decision: Option<&ArchitectureDecision>,
    ) -> Result<Vec<&PhaseSpec>, WorkflowError> {
        self.phase(current)?;
        Ok(self
            .phases
            .iter()
            .filter(|p| p.depends_on.contains(&current) && p.predicate.evaluate(decision))
            .collect())
    }

    /// Validate a handoff edge. Allowed iff `to` lists `from` as a dependency.
    pub fn is_transition_allowed(&self, from: u32, to: u32) -> Result<(), WorkflowError> {
        self.phase(from)?;
        let target = self.phase(to)?;
        if target.depends_on.contains(&from) {
            Ok(())
        } else {
            Err(WorkflowError::DisallowedTransition { from, to })
        }
    }

    /// Default message priority for a phase, by position and category.
    pub fn priority_for(&self, number: u32) -> Result<Priority, WorkflowError> {
        let phase = self.phase(number)?;
        Ok(match phase.category {
            PhaseCategory::Reporting => Priority::Low,
            _ if phase.number <= 2 => Priority::Critical,
            _ if phase.number <= 5 => Priority::High,
            _ => Priority::Normal,
        })
    }

    /// Whether the phase sits behind an approval gate.
    pub fn requires_approval(&self, number: u32) -> Result<bool, WorkflowError> {
        Ok(self.phase(number)?.requires_approval)
    }

    /// Whether two phases belong to the same mutex group.
    pub fn mutually_exclusive(&self, a: u32, b: u32) -> Result<bool, WorkflowError> {
        let (pa, pb) = (self.phase(a)?, self.phase(b)?);
        Ok(a != b
            && pa.mutex_group.is_some()
            && pa.mutex_group == pb.mutex_group)
    }

    /// The conditional phases whose predicate passes for `decision`.
    ///
    /// Also enforces the mutex rule: a decision that activates two phases of
    /// the same group is rejected.
    pub fn activated_phases(
        &self,
        decision: &ArchitectureDecision,
    ) -> Result<Vec<&PhaseSpec>, WorkflowError> {
        let active: Vec<&PhaseSpec> = self
            .phases
            .iter()
            .filter(|p| p.is_conditional() && p.predicate.evaluate(Some(decision)))
            .collect();

        let mut seen_groups: HashMap<&str, u32> = HashMap::new();
        for phase in &active {
            if let Some(group) = &phase.mutex_group {
                if let Some(first) = seen_groups.insert(group.as_str(), phase.number) {
                    return Err(WorkflowError::MutexViolation {
                        group: group.clone(),
                        first,
                        second: phase.number,
                    });
                }
            }
        }
        Ok(active)
    }

    /// The highest architecture phase: completing it finalizes the decision.
    pub fn decision_phase(&self) -> Option<u32> {
        self.phases
            .iter()
            .filter(|p| p.category == PhaseCategory::Architecture)
            .map(|p| p.number)
            .max()
    }

    /// The highest ordered (orchestration/architecture) phase number.
    pub fn last_ordered_phase(&self) -> Option<u32> {
        self.phases
            .iter()
            .filter(|p| p.category.is_ordered())
            .map(|p| p.number)
            .max()
    }
}

/// The standard 17-phase build pipeline.
///
/// Phases 0-6 run the orchestration chain, 7-8 produce the architecture
/// decision, and 9-16 are the conditional implementation fan-out gated by it.
pub fn default_workflow() -> Workflow {
    use ActivationPredicate as Ap;
    use PhaseCategory as Pc;

    let phases = vec![
        PhaseSpec::ordered(0, "intake", "intake-analyst", Pc::Orchestration),
        PhaseSpec::ordered(1, "requirements", "requirements-analyst", Pc::Orchestration),
        PhaseSpec::ordered(2, "planning", "project-planner", Pc::Orchestration),
        PhaseSpec::ordered(3, "work-breakdown", "work-breakdown-agent", Pc::Orchestration),
        PhaseSpec::ordered(4, "design-review", "design-reviewer", Pc::Orchestration).with_approval(),
        PhaseSpec::ordered(5, "interface-design", "interface-designer", Pc::Orchestration),
        PhaseSpec::ordered(6, "quality-control", "quality-controller", Pc::Orchestration),
        PhaseSpec::ordered(7, "platform-architecture", "platform-architect", Pc::Architecture),
        PhaseSpec::ordered(8, "solution-architecture", "solution-architect", Pc::Architecture),
        PhaseSpec::conditional(
            9,
            "azure-architecture",
            "azure-architect",
            Ap::PlatformIs(Platform::Azure),
            vec![8],
        )
        .with_mutex_group("platform"),
        PhaseSpec::conditional(
            10,
            "aws-architecture",
            "aws-architect",
            Ap::PlatformIs(Platform::Aws),
            vec![8],
        )
        .with_mutex_group("platform"),
        PhaseSpec::conditional(11, "iac", "iac-specialist", Ap::IacRequired, vec![8]),
        PhaseSpec::conditional(
            12,
            "frontend-react",
            "react-specialist",
            Ap::FrontendIs(Frontend::React),
            vec![8],
        ),
        PhaseSpec::conditional(
            13,
            "backend-dotnet",
            "dotnet-specialist",
            Ap::BackendIs(Backend::DotNet),
            vec![8],
        ),
        PhaseSpec::conditional(
            14,
            "database-mysql",
            "mysql-specialist",
            Ap::DatabaseIs(Database::MySql),
            vec![8],
        ),
        PhaseSpec::conditional(
            15,
            "cicd-github",
            "cicd-github-specialist",
            Ap::CiCdIs(CiCd::GitHub),
            vec![8],
        )
        .with_mutex_group("cicd"),
        PhaseSpec::conditional(
            16,
            "cicd-azure-devops",
            "cicd-azure-devops-specialist",
            Ap::CiCdIs(CiCd::AzureDevOps),
            vec![8],
        )
        .with_mutex_group("cicd"),
    ];

    match Workflow::new(phases) {
        Ok(workflow) => workflow,
        Err(err) => unreachable!("default workflow table is invalid: {err}"),
    }
}
