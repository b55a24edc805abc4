//! Architecture decision record produced by the architecture phases.
//!
//! The decision is created once per run, after the solution-architect phase
//! completes, and is read-only from that point on. Every conditional phase's
//! activation predicate is a pure function of this record.

use serde::{Deserialize, Serialize};

/// Target cloud platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Azure,
    Aws,
    Gcp,
    #[default]
    None,
}

/// Frontend framework selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Frontend {
    React,
    Angular,
    #[default]
    None,
}

/// Backend stack selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    #[serde(rename = "dotnet")]
    DotNet,
    Node,
    #[default]
    None,
}

/// Database engine selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Database {
    #[serde(rename = "mysql")]
    MySql,
    Postgres,
    #[default]
    None,
}

/// CI/CD provider selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CiCd {
    #[serde(rename = "github")]
    GitHub,
    #[serde(rename = "azure_devops")]
    AzureDevOps,
    #[default]
    None,
}

/// The record produced by the architecture phases.
///
/// Parametrizes every conditional activation downstream. Free-form `tags`
/// carry anything the architect wants to surface that has no dedicated field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ArchitectureDecision {
    #[serde(default)]
    pub platform: Platform,
    #[serde(default)]
    pub frontend: Frontend,
    #[serde(default)]
    pub backend: Backend,
    #[serde(default)]
    pub database: Database,
    #[serde(default)]
    pub ci_cd: CiCd,
    #[serde(default)]
    pub iac_required: bool,
    #[serde(default)]
    pub containerization_required: bool,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl ArchitectureDecision {
    /// Parse a decision out of an agent artifact.
    ///
    /// Accepts either the decision object itself or an object with a
    /// `decision` field wrapping it.
    pub fn from_artifact(value: &serde_json::Value) -> Option<Self> {
        let candidate = value.get("decision").unwrap_or(value);
        serde_json::from_value(candidate.clone()).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decision_defaults_to_none_selections() {
        let decision = ArchitectureDecision::default();
        assert_eq!(decision.platform, Platform::None);
        assert_eq!(decision.ci_cd, CiCd::None);
        assert!(!decision.iac_required);
    }

    #[test]
    fn decision_round_trips_through_json() {
        let decision = ArchitectureDecision {
            platform: Platform::Azure,
            frontend: Frontend::React,
            backend: Backend::None,
            database: Database::MySql,
            ci_cd: CiCd::GitHub,
            iac_required: true,
            containerization_required: false,
            tags: vec!["greenfield".into()],
        };

        let json = serde_json::to_string(&decision).unwrap();
        assert!(json.contains("\"platform\":\"azure\""));
        assert!(json.contains("\"ci_cd\":\"github\""));

        let parsed: ArchitectureDecision = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, decision);
    }

    #[test]
    fn from_artifact_accepts_wrapped_decision() {
        let artifact = json!({
            "decision": {
                "platform": "aws",
                "database": "postgres",
                "iac_required": true
            }
        });

        let decision = ArchitectureDecision::from_artifact(&artifact).unwrap();
        assert_eq!(decision.platform, Platform::Aws);
        assert_eq!(decision.database, Database::Postgres);
        assert!(decision.iac_required);
    }

    #[test]
    fn from_artifact_accepts_bare_decision() {
        let artifact = json!({ "platform": "azure", "frontend": "react" });
        let decision = ArchitectureDecision::from_artifact(&artifact).unwrap();
        assert_eq!(decision.platform, Platform::Azure);
        assert_eq!(decision.frontend, Frontend::React);
    }

    #[test]
    fn from_artifact_rejects_non_object() {
        assert!(ArchitectureDecision::from_artifact(&json!("nope")).is_none());
    }
}
