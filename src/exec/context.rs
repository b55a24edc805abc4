//! Per-invocation execution context.
//!
//! The context is assembled once per attempt and never mutated afterwards.
//! Directories are created at build time; the temp dir is torn down by the
//! returned guard on every exit path.

use crate::exec::agent::AgentConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

/// Resource limits applied to one invocation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub timeout_ms: u64,
    pub memory_mb: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            timeout_ms: 120_000,
            memory_mb: 1024,
        }
    }
}

/// Filesystem locations for one invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPaths {
    /// Where the collector persists the invocation's artifact.
    pub artifact_dir: PathBuf,
    /// Where the collector writes `<execution_id>.log`.
    pub log_dir: PathBuf,
    /// Scratch space, removed when the invocation's guard drops.
    pub temp_dir: PathBuf,
}

/// Immutable context for a single agent invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub execution_id: Uuid,
    pub agent_id: String,
    pub phase: u32,
    pub attempt: u32,
    pub inputs: serde_json::Value,
    /// Environment the agent sees: `AGENT_NAME`, `PHASE`, `EXECUTION_ID`.
    pub env: BTreeMap<String, String>,
    pub limits: ResourceLimits,
    pub paths: ExecutionPaths,
}

impl ExecutionContext {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.limits.timeout_ms)
    }
}

/// Removes the invocation's temp dir when dropped.
#[derive(Debug)]
pub struct TempDirGuard {
    path: PathBuf,
}

impl TempDirGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempDirGuard {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_dir_all(&self.path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %err, "failed to remove temp dir");
            }
        }
    }
}

/// Builds execution contexts rooted at a run directory.
#[derive(Debug, Clone)]
pub struct ContextBuilder {
    run_root: PathBuf,
    default_limits: ResourceLimits,
}

impl ContextBuilder {
    pub fn new(run_root: impl AsRef<Path>) -> Self {
        Self {
            run_root: run_root.as_ref().to_path_buf(),
            default_limits: ResourceLimits::default(),
        }
    }

    pub fn with_default_limits(mut self, limits: ResourceLimits) -> Self {
        self.default_limits = limits;
        self
    }

    /// Assemble the context for one attempt. Creates the artifact, log, and
    /// temp directories; the caller must keep the guard alive for the
    /// invocation's duration.
    pub fn build(
        &self,
        agent: &AgentConfig,
        phase: u32,
        attempt: u32,
        inputs: serde_json::Value,
    ) -> anyhow::Result<(ExecutionContext, TempDirGuard)> {
        let execution_id = Uuid::new_v4();
        let exec_root = self.run_root.join("executions").join(execution_id.to_string());

        let paths = ExecutionPaths {
            artifact_dir: exec_root.join("artifacts"),
            log_dir: self.run_root.join("logs"),
            temp_dir: exec_root.join("tmp"),
        };
        std::fs::create_dir_all(&paths.artifact_dir)?;
        std::fs::create_dir_all(&paths.log_dir)?;
        std::fs::create_dir_all(&paths.temp_dir)?;

        let limits = ResourceLimits {
            timeout_ms: agent.timeout_ms.unwrap_or(self.default_limits.timeout_ms),
            memory_mb: agent.memory_mb.unwrap_or(self.default_limits.memory_mb),
        };

        let mut env = BTreeMap::new();
        env.insert("AGENT_NAME".to_string(), agent.agent_id.clone());
        env.insert("PHASE".to_string(), phase.to_string());
        env.insert("EXECUTION_ID".to_string(), execution_id.to_string());

        let context = ExecutionContext {
            execution_id,
            agent_id: agent.agent_id.clone(),
            phase,
            attempt: attempt.max(1),
            inputs,
            env,
            limits,
            paths,
        };
        let guard = TempDirGuard {
            path: context.paths.temp_dir.clone(),
        };
        Ok((context, guard))
    }
}
