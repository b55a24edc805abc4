//! Layered runtime configuration: `.conductor/conductor.toml` → environment
//! → CLI overrides, with named profiles.

use crate::bus::{ApprovalTimeoutPolicy, BusConfig};
use crate::exec::ResourceLimits;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// `[core]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreSettings {
    /// Parallelism cap for implementation-category phases.
    pub parallelism: usize,
    pub bus_tick_ms: u64,
    pub max_output_size: usize,
}

impl Default for CoreSettings {
    fn default() -> Self {
        Self {
            parallelism: 4,
            bus_tick_ms: 100,
            max_output_size: 256 * 1024,
        }
    }
}

/// `[retry]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub backoff_cap_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff_ms: 1_000,
            backoff_cap_ms: 30_000,
        }
    }
}

/// `[approval]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalSettings {
    pub timeout_ms: u64,
    pub on_timeout: ApprovalTimeoutPolicy,
}

impl Default for ApprovalSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 300_000,
            on_timeout: ApprovalTimeoutPolicy::Block,
        }
    }
}

/// `[limits]` section: per-invocation defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitSettings {
    pub timeout_ms: u64,
    pub memory_mb: u64,
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 120_000,
            memory_mb: 1024,
        }
    }
}

/// Per-profile overrides, applied over the base sections.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileOverrides {
    pub parallelism: Option<usize>,
    pub max_retries: Option<u32>,
    pub timeout_ms: Option<u64>,
    pub approval_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct ConfigFile {
    core: CoreSettings,
    retry: RetrySettings,
    approval: ApprovalSettings,
    limits: LimitSettings,
    profile: BTreeMap<String, ProfileOverrides>,
}

/// Resolved runtime configuration plus the project's directory layout.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub conductor_dir: PathBuf,
    pub runs_dir: PathBuf,
    pub plans_dir: PathBuf,
    pub store_dir: PathBuf,
    pub approvals_dir: PathBuf,
    pub core: CoreSettings,
    pub retry: RetrySettings,
    pub approval: ApprovalSettings,
    pub limits: LimitSettings,
}

impl Config {
    /// Load configuration for a project directory.
    ///
    /// Layering order: `conductor.toml` (when present) → `[profile.<name>]`
    /// overrides → environment → `--override k=v` pairs, last writer wins.
    pub fn load(
        project_dir: impl AsRef<Path>,
        profile: Option<&str>,
        overrides: &[(String, String)],
    ) -> Result<Self> {
        let project_dir = project_dir.as_ref().to_path_buf();
        let conductor_dir = project_dir.join(".conductor");

        let mut file = ConfigFile::default();
        let config_path = conductor_dir.join("conductor.toml");
        if config_path.is_file() {
            let content = std::fs::read_to_string(&config_path)
                .with_context(|| format!("failed to read {}", config_path.display()))?;
            file = toml::from_str(&content)
                .with_context(|| format!("failed to parse {}", config_path.display()))?;
        }

        let profile_name = profile
            .map(str::to_string)
            .or_else(|| std::env::var("CONDUCTOR_PROFILE").ok());
        if let Some(name) = &profile_name {
            match file.profile.get(name) {
                Some(overrides) => {
                    let overrides = overrides.clone();
                    apply_profile(&mut file, &overrides);
                }
                None => tracing::warn!(profile = %name, "unknown profile; ignoring"),
            }
        }

        if let Ok(value) = std::env::var("CONDUCTOR_PARALLELISM") {
            if let Ok(parallelism) = value.parse() {
                file.core.parallelism = parallelism;
            }
        }
        if let Ok(value) = std::env::var("CONDUCTOR_TIMEOUT_MS") {
            if let Ok(timeout_ms) = value.parse() {
                file.limits.timeout_ms = timeout_ms;
            }
        }

        for (key, value) in overrides {
            apply_override(&mut file, key, value);
        }

        let config = Self {
            runs_dir: conductor_dir.join("runs"),
            plans_dir: conductor_dir.join("plans"),
            store_dir: conductor_dir.join("store"),
            approvals_dir: conductor_dir.join("approvals"),
            project_dir,
            conductor_dir,
            core: file.core,
            retry: file.retry,
            approval: file.approval,
            limits: file.limits,
        };
        config.warn_on_suspicious_values();
        Ok(config)
    }

    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [
            &self.conductor_dir,
            &self.runs_dir,
            &self.plans_dir,
            &self.store_dir,
            &self.approvals_dir,
        ] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }

    /// Bus configuration derived from the retry/approval/core sections.
    pub fn bus_config(&self) -> BusConfig {
        BusConfig::default()
            .with_backoff(
                Duration::from_millis(self.retry.base_backoff_ms),
                Duration::from_millis(self.retry.backoff_cap_ms),
            )
            .with_max_retries(self.retry.max_retries)
            .with_tick(Duration::from_millis(self.core.bus_tick_ms))
            .with_approval_timeout(Duration::from_millis(self.approval.timeout_ms))
    }

    /// Default per-invocation limits.
    pub fn default_limits(&self) -> ResourceLimits {
        ResourceLimits {
            timeout_ms: self.limits.timeout_ms,
            memory_mb: self.limits.memory_mb,
        }
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.runs_dir.join(run_id)
    }

    fn warn_on_suspicious_values(&self) {
        if self.core.parallelism == 0 {
            tracing::warn!("core.parallelism is 0; nothing will run in parallel");
        }
        if self.retry.backoff_cap_ms < self.retry.base_backoff_ms {
            tracing::warn!(
                "retry.backoff_cap_ms ({}) is below base_backoff_ms ({})",
                self.retry.backoff_cap_ms,
                self.retry.base_backoff_ms
            );
        }
        if self.core.bus_tick_ms == 0 {
            tracing::warn!("core.bus_tick_ms is 0; dispatch loop will spin");
        }
    }
}

fn apply_profile(file: &mut ConfigFile, overrides: &ProfileOverrides) {
    if let Some(parallelism) = overrides.parallelism {
        file.core.parallelism = parallelism;
    }
    if let Some(max_retries) = overrides.max_retries {
        file.retry.max_retries = max_retries;
    }
    if let Some(timeout_ms) = overrides.timeout_ms {
        file.limits.timeout_ms = timeout_ms;
    }
    if let Some(approval_timeout_ms) = overrides.approval_timeout_ms {
        file.approval.timeout_ms = approval_timeout_ms;
    }
}

fn apply_override(file: &mut ConfigFile, key: &str, value: &str) {
    let applied = match key {
        "core.parallelism" => value.parse().map(|v| file.core.parallelism = v).is_ok(),
        "core.bus_tick_ms" => value.parse().map(|v| file.core.bus_tick_ms = v).is_ok(),
        "core.max_output_size" => value.parse().map(|v| file.core.max_output_size = v).is_ok(),
        "retry.max_retries" => value.parse().map(|v| file.retry.max_retries = v).is_ok(),
        "retry.base_backoff_ms" => value.parse().map(|v| file.retry.base_backoff_ms = v).is_ok(),
        "retry.backoff_cap_ms" => value.parse().map(|v| file.retry.backoff_cap_ms = v).is_ok(),
        "approval.timeout_ms" => value.parse().map(|v| file.approval.timeout_ms = v).is_ok(),
        "limits.timeout_ms" => value.parse().map(|v| file.limits.timeout_ms = v).is_ok(),
        "limits.memory_mb" => value.parse().map(|v| file.limits.memory_mb = v).is_ok(),
        _ => {
            tracing::warn!(key, "unknown override key; ignoring");
            return;
        }
    };
    if !applied {
        tracing::warn!(key, value, "override value failed to parse; ignoring");
    }
}
