//! Typed error hierarchy for the conductor orchestration core.
//!
//! One enum per subsystem boundary:
//! - `WorkflowError` — phase model lookups and transition validation
//! - `BusError` — message routing, approval gates, dead-lettering
//! - `TrackerError` — run/phase/task state machine violations
//! - `TransportError` — transport selection and configuration
//! - `StoreError` — artifact store writes, versioning, status moves

use thiserror::Error;

/// Errors from the workflow model (phase table queries and validation).
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Unknown phase {0}")]
    UnknownPhase(u32),

    #[error("Transition from phase {from} to phase {to} is not allowed")]
    DisallowedTransition { from: u32, to: u32 },

    #[error("Duplicate phase number {0} in workflow definition")]
    DuplicatePhase(u32),

    #[error("Phase {phase} depends on unknown phase {dependency}")]
    UnknownDependency { phase: u32, dependency: u32 },

    #[error("Phase {phase} depends on later phase {dependency}")]
    ForwardDependency { phase: u32, dependency: u32 },

    #[error("Ordered phase {phase} must depend on its predecessor {expected}")]
    BrokenChain { phase: u32, expected: u32 },

    #[error("Mutex group '{group}' contains unconditional phase {phase}")]
    UnconditionalMutex { group: String, phase: u32 },

    #[error("Mutex group '{group}' activates more than one phase: {first} and {second}")]
    MutexViolation {
        group: String,
        first: u32,
        second: u32,
    },
}

/// Errors from the message bus.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("Handoff message is missing from_phase or to_phase")]
    IncompleteHandoff,

    #[error(transparent)]
    DisallowedTransition(#[from] WorkflowError),

    #[error("No approval request pending with id {0}")]
    UnknownApprovalRequest(uuid::Uuid),

    #[error("Approval request {0} was already decided")]
    ApprovalAlreadyDecided(uuid::Uuid),

    #[error("Bus is draining; message rejected")]
    Draining,
}

/// Errors from the status tracker's state machines.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("No run started")]
    NoActiveRun,

    #[error("Unknown task {0}")]
    UnknownTask(uuid::Uuid),

    #[error("Unknown phase {0}")]
    UnknownPhase(u32),

    #[error("Task {task} cannot move from {from:?} to {to:?}")]
    InvalidTaskTransition {
        task: uuid::Uuid,
        from: crate::tracker::TaskState,
        to: crate::tracker::TaskState,
    },

    #[error("Phase {phase} cannot move from {from:?} to {to:?}")]
    InvalidPhaseTransition {
        phase: u32,
        from: crate::tracker::PhaseState,
        to: crate::tracker::PhaseState,
    },

    #[error("Run status is terminal ({0:?}) and cannot change")]
    RunAlreadyTerminal(crate::tracker::RunStatus),

    #[error("Architecture decision is already recorded and read-only")]
    DecisionAlreadyRecorded,
}

/// Errors from transport selection and agent invocation plumbing.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Agent '{0}' is not registered")]
    UnknownAgent(String),

    #[error("Agent '{agent}' has no configuration for transport {transport:?}")]
    TransportUnavailable {
        agent: String,
        transport: crate::exec::TransportKind,
    },

    #[error("Agent '{agent}' declares no usable transport")]
    NoTransport { agent: String },

    #[error("Invalid webhook endpoint '{endpoint}' for agent '{agent}': {reason}")]
    InvalidEndpoint {
        agent: String,
        endpoint: String,
        reason: String,
    },

    #[error("No in-process handler registered under id '{0}'")]
    UnknownHandler(String),
}

/// Errors from the artifact store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Artifact {0} not found")]
    ArtifactNotFound(String),

    #[error("Artifact {id} has no version {version}")]
    VersionNotFound { id: String, version: String },

    #[error("Version {version} is not greater than existing {existing} for artifact {id}")]
    NonMonotoneVersion {
        id: String,
        version: String,
        existing: String,
    },

    #[error("Invalid semver '{version}': {reason}")]
    InvalidVersion { version: String, reason: String },

    #[error("Artifact {id} cannot move from {from:?} to {to:?}")]
    InvalidStatusTransition {
        id: String,
        from: crate::store::ArtifactStatus,
        to: crate::store::ArtifactStatus,
    },

    #[error("No pointer named '{0}'")]
    PointerNotFound(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workflow_error_disallowed_transition_carries_endpoints() {
        let err = WorkflowError::DisallowedTransition { from: 3, to: 9 };
        match &err {
            WorkflowError::DisallowedTransition { from, to } => {
                assert_eq!(*from, 3);
                assert_eq!(*to, 9);
            }
            _ => panic!("Expected DisallowedTransition"),
        }
        assert!(err.to_string().contains('9'));
    }

    #[test]
    fn bus_error_wraps_workflow_error() {
        let inner = WorkflowError::DisallowedTransition { from: 1, to: 5 };
        let bus_err: BusError = inner.into();
        assert!(matches!(bus_err, BusError::DisallowedTransition(_)));
    }

    #[test]
    fn store_error_non_monotone_version_is_descriptive() {
        let err = StoreError::NonMonotoneVersion {
            id: "abc".into(),
            version: "1.0.0".into(),
            existing: "1.2.0".into(),
        };
        assert!(err.to_string().contains("1.2.0"));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&WorkflowError::UnknownPhase(42));
        assert_std_error(&BusError::IncompleteHandoff);
        assert_std_error(&TransportError::UnknownAgent("a".into()));
        assert_std_error(&StoreError::ArtifactNotFound("x".into()));
    }
}
