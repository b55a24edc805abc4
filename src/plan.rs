//! Plan files: the request payload plus per-agent transport configs for a
//! run, stored as JSON under `.conductor/plans/<id>.json`.

use crate::exec::AgentConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// A named plan: what to build and which agents to reach.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub plan_id: String,
    /// Free-form request payload handed to phase 0.
    #[serde(default)]
    pub request: serde_json::Value,
    /// Agent transport configurations registered for the run.
    #[serde(default)]
    pub agents: Vec<AgentConfig>,
}

impl Plan {
    pub fn new(plan_id: &str, request: serde_json::Value) -> Self {
        Self {
            plan_id: plan_id.to_string(),
            request,
            agents: Vec::new(),
        }
    }

    pub fn with_agents(mut self, agents: Vec<AgentConfig>) -> Self {
        self.agents = agents;
        self
    }

    /// Path of a plan file inside a plans directory.
    pub fn path_for(plans_dir: &Path, plan_id: &str) -> PathBuf {
        plans_dir.join(format!("{plan_id}.json"))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read plan file {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("failed to parse plan file {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self).context("failed to serialize plan")?;
        std::fs::write(path, content)
            .with_context(|| format!("failed to write plan file {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn plan_round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = Plan::path_for(dir.path(), "webshop");
        let plan = Plan::new("webshop", json!({"summary": "a web shop"})).with_agents(vec![
            AgentConfig::new("intake-analyst", "intake.in", "intake.out")
                .with_command(vec!["intake".into()]),
        ]);
        plan.save(&path).unwrap();

        let loaded = Plan::load(&path).unwrap();
        assert_eq!(loaded.plan_id, "webshop");
        assert_eq!(loaded.agents.len(), 1);
        assert_eq!(loaded.request["summary"], "a web shop");
    }

    #[test]
    fn missing_plan_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Plan::load(&Plan::path_for(dir.path(), "ghost")).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }
}
