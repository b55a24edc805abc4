//! Workflow model: the declarative phase table and the architecture decision
//! record that gates conditional activation.

mod decision;
mod model;

pub use decision::{ArchitectureDecision, Backend, CiCd, Database, Frontend, Platform};
pub use model::{
    default_workflow, ActivationPredicate, PhaseCategory, PhaseSpec, Workflow,
};
