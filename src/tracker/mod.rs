//! Per-run status tracking: execution status, phase and task state machines,
//! append-only event log, and metrics aggregation.
//!
//! The tracker is one of the two shared-mutable structures in the core (the
//! other is the bus); all access goes through its internal lock. State
//! transitions are validated against fixed graphs: an invalid transition is
//! a [`TrackerError`], never a silent overwrite.

mod events;
mod metrics;

pub use events::{Event, EventKind, EventLog};
pub use metrics::{percentile, RunMetrics};

use crate::errors::TrackerError;
use crate::workflow::{ArchitectureDecision, PhaseSpec};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

/// Run execution status. Monotone once terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Pending,
    Running,
    Succeeded,
    Partial,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Partial | Self::Failed | Self::Cancelled
        )
    }

    /// CLI exit code for a terminal status.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Succeeded => 0,
            Self::Partial => 2,
            Self::Cancelled => 130,
            _ => 1,
        }
    }
}

/// Phase lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PhaseState {
    #[default]
    Pending,
    Scheduled,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl PhaseState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    /// Legal moves in the phase state graph. A completed phase was running
    /// at some prior point; PENDING never jumps straight to COMPLETED.
    pub fn can_transition(from: Self, to: Self) -> bool {
        use PhaseState::*;
        matches!(
            (from, to),
            (Pending, Scheduled)
                | (Pending, Skipped)
                | (Pending, Failed)
                | (Scheduled, Running)
                | (Scheduled, Failed)
                | (Scheduled, Skipped)
                | (Running, Completed)
                | (Running, Failed)
        )
    }
}

/// Task (single agent invocation) lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    #[default]
    Pending,
    Scheduled,
    Running,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Timeout | Self::Cancelled
        )
    }

    /// Fixed task state graph. RUNNING→SCHEDULED is the retry edge; terminal
    /// states are sinks; RUNNING→RUNNING is disallowed.
    pub fn can_transition(from: Self, to: Self) -> bool {
        use TaskState::*;
        matches!(
            (from, to),
            (Pending, Scheduled)
                | (Pending, Cancelled)
                | (Scheduled, Running)
                | (Scheduled, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Timeout)
                | (Running, Cancelled)
                | (Running, Scheduled)
        )
    }
}

/// Error severity recorded alongside error events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Warning,
    Error,
    Fatal,
}

/// Per-phase record inside a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub number: u32,
    pub phase_id: String,
    pub agent_id: String,
    pub state: PhaseState,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Why the phase failed or was skipped, when it did.
    pub reason: Option<String>,
}

/// Per-task record: one agent invocation slot, re-armed on retry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: Uuid,
    /// Execution id of the latest attempt.
    pub execution_id: Uuid,
    pub agent_id: String,
    pub phase: u32,
    pub attempt: u32,
    pub state: TaskState,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// A recorded error, grouped into the error report at run end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub phase: Option<u32>,
    pub agent_id: Option<String>,
    pub kind: String,
    pub severity: ErrorSeverity,
    pub message: String,
    pub retries_exhausted: bool,
    pub at: DateTime<Utc>,
}

/// Immutable view of the full run state, used by reports and persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run_id: Uuid,
    pub plan_id: String,
    pub status: RunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub phases: Vec<PhaseRecord>,
    pub tasks: Vec<TaskRecord>,
    pub errors: Vec<ErrorRecord>,
    pub decision: Option<ArchitectureDecision>,
    /// Registered artifact ids keyed by phase id.
    pub artifacts: BTreeMap<String, String>,
    pub metrics: RunMetrics,
}

#[derive(Debug, Default)]
struct TrackerInner {
    run_id: Uuid,
    plan_id: String,
    status: RunStatus,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    phases: BTreeMap<u32, PhaseRecord>,
    tasks: BTreeMap<Uuid, TaskRecord>,
    errors: Vec<ErrorRecord>,
    decision: Option<ArchitectureDecision>,
    artifacts: BTreeMap<String, String>,
    log: EventLog,
    retries_total: u64,
    dead_letter_total: u64,
    bus_counters: Option<crate::bus::BusCountersSnapshot>,
}

/// Thread-safe per-run state tracker.
#[derive(Debug)]
pub struct StatusTracker {
    inner: Mutex<TrackerInner>,
}

const SOURCE: &str = "tracker";

impl StatusTracker {
    pub fn new(run_id: Uuid, plan_id: &str) -> Self {
        Self {
            inner: Mutex::new(TrackerInner {
                run_id,
                plan_id: plan_id.to_string(),
                ..Default::default()
            }),
        }
    }

    /// Mirror events to a JSONL file as they are appended.
    pub fn with_event_sink(self, path: PathBuf) -> Self {
        {
            let mut inner = self.lock();
            inner.log = std::mem::take(&mut inner.log).with_sink(path);
        }
        self
    }

    fn lock(&self) -> MutexGuard<'_, TrackerInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Initialize the run with its phase table and move it to RUNNING.
    pub fn start_run(&self, phases: &[PhaseSpec]) {
        let mut inner = self.lock();
        inner.status = RunStatus::Running;
        inner.started_at = Some(Utc::now());
        for spec in phases {
            inner.phases.insert(
                spec.number,
                PhaseRecord {
                    number: spec.number,
                    phase_id: spec.phase_id.clone(),
                    agent_id: spec.agent_id.clone(),
                    state: PhaseState::Pending,
                    started_at: None,
                    ended_at: None,
                    reason: None,
                },
            );
        }
        let run_id = inner.run_id;
        let plan_id = inner.plan_id.clone();
        inner.log.append(
            EventKind::RunStarted,
            SOURCE,
            run_id.to_string(),
            json!({ "plan_id": plan_id, "phases": phases.len() }),
        );
    }

    /// Create a task slot for a phase/agent pair. State starts PENDING.
    pub fn create_task(&self, phase: u32, agent_id: &str, execution_id: Uuid) -> Uuid {
        let mut inner = self.lock();
        let task_id = Uuid::new_v4();
        inner.tasks.insert(
            task_id,
            TaskRecord {
                task_id,
                execution_id,
                agent_id: agent_id.to_string(),
                phase,
                attempt: 1,
                state: TaskState::Pending,
                started_at: None,
                ended_at: None,
                error: None,
            },
        );
        task_id
    }

    /// Re-arm a task for its next attempt with a fresh execution id.
    pub fn begin_attempt(
        &self,
        task_id: Uuid,
        execution_id: Uuid,
        attempt: u32,
    ) -> Result<(), TrackerError> {
        let mut inner = self.lock();
        let task = inner
            .tasks
            .get_mut(&task_id)
            .ok_or(TrackerError::UnknownTask(task_id))?;
        task.execution_id = execution_id;
        task.attempt = attempt.max(1);
        Ok(())
    }

    /// Move a task through the fixed state graph, emitting events.
    pub fn update_task_state(&self, task_id: Uuid, new_state: TaskState) -> Result<(), TrackerError> {
        let mut inner = self.lock();
        let task = inner
            .tasks
            .get_mut(&task_id)
            .ok_or(TrackerError::UnknownTask(task_id))?;
        let from = task.state;
        if !TaskState::can_transition(from, new_state) {
            return Err(TrackerError::InvalidTaskTransition {
                task: task_id,
                from,
                to: new_state,
            });
        }

        task.state = new_state;
        match new_state {
            TaskState::Running => {
                if task.started_at.is_none() {
                    task.started_at = Some(Utc::now());
                }
            }
            s if s.is_terminal() => task.ended_at = Some(Utc::now()),
            _ => {}
        }

        let (execution_id, phase, agent) =
            (task.execution_id, task.phase, task.agent_id.clone());
        if new_state == TaskState::Running {
            inner.log.append(
                EventKind::TaskStarted,
                SOURCE,
                execution_id.to_string(),
                json!({ "phase": phase, "agent_id": agent }),
            );
        }
        inner.log.append(
            EventKind::TaskStateChanged,
            SOURCE,
            execution_id.to_string(),
            json!({ "phase": phase, "from": from, "to": new_state }),
        );
        Ok(())
    }

    /// Attach an error message to a task record.
    pub fn set_task_error(&self, task_id: Uuid, message: &str) -> Result<(), TrackerError> {
        let mut inner = self.lock();
        let task = inner
            .tasks
            .get_mut(&task_id)
            .ok_or(TrackerError::UnknownTask(task_id))?;
        task.error = Some(message.to_string());
        Ok(())
    }

    /// Move a phase through its state graph, emitting lifecycle events.
    pub fn update_phase_state(&self, number: u32, new_state: PhaseState) -> Result<(), TrackerError> {
        self.update_phase_state_with_reason(number, new_state, None)
    }

    /// Like [`Self::update_phase_state`], recording why (for FAILED/SKIPPED).
    pub fn update_phase_state_with_reason(
        &self,
        number: u32,
        new_state: PhaseState,
        reason: Option<&str>,
    ) -> Result<(), TrackerError> {
        let mut inner = self.lock();
        let phase = inner
            .phases
            .get_mut(&number)
            .ok_or(TrackerError::UnknownPhase(number))?;
        let from = phase.state;
        if from == new_state {
            return Ok(());
        }
        if !PhaseState::can_transition(from, new_state) {
            return Err(TrackerError::InvalidPhaseTransition {
                phase: number,
                from,
                to: new_state,
            });
        }

        phase.state = new_state;
        if let Some(reason) = reason {
            phase.reason = Some(reason.to_string());
        }
        match new_state {
            PhaseState::Running => phase.started_at = Some(Utc::now()),
            s if s.is_terminal() => phase.ended_at = Some(Utc::now()),
            _ => {}
        }

        let kind = match new_state {
            PhaseState::Running => Some(EventKind::PhaseStarted),
            PhaseState::Completed => Some(EventKind::PhaseCompleted),
            PhaseState::Failed => Some(EventKind::PhaseFailed),
            PhaseState::Skipped => Some(EventKind::PhaseSkipped),
            _ => None,
        };
        if let Some(kind) = kind {
            let attrs = json!({ "from": from, "reason": reason });
            inner.log.append(kind, SOURCE, number.to_string(), attrs);
        }
        Ok(())
    }

    /// Record an error for reporting and metrics.
    pub fn record_error(
        &self,
        phase: Option<u32>,
        agent_id: Option<&str>,
        kind: &str,
        severity: ErrorSeverity,
        message: &str,
        retries_exhausted: bool,
    ) {
        let mut inner = self.lock();
        inner.errors.push(ErrorRecord {
            phase,
            agent_id: agent_id.map(str::to_string),
            kind: kind.to_string(),
            severity,
            message: message.to_string(),
            retries_exhausted,
            at: Utc::now(),
        });
        let subject = phase.map(|p| p.to_string()).unwrap_or_else(|| "-".into());
        inner.log.append(
            EventKind::ErrorRecorded,
            SOURCE,
            subject,
            json!({ "kind": kind, "severity": severity, "message": message }),
        );
    }

    pub fn record_retry(&self) {
        self.lock().retries_total += 1;
    }

    pub fn record_dead_letter(&self, message_id: Uuid, reason: &str) {
        let mut inner = self.lock();
        inner.dead_letter_total += 1;
        inner.log.append(
            EventKind::MessageDeadLettered,
            "bus",
            message_id.to_string(),
            json!({ "reason": reason }),
        );
    }

    pub fn record_handoff(&self, from_phase: u32, to_phase: u32) {
        let mut inner = self.lock();
        inner.log.append(
            EventKind::HandoffCompleted,
            "bus",
            format!("{from_phase}->{to_phase}"),
            json!({ "from_phase": from_phase, "to_phase": to_phase }),
        );
    }

    pub fn record_approval_requested(&self, request_id: Uuid, phase: u32) {
        let mut inner = self.lock();
        inner.log.append(
            EventKind::ApprovalRequested,
            "bus",
            request_id.to_string(),
            json!({ "phase": phase }),
        );
    }

    pub fn record_approval_decided(&self, request_id: Uuid, approved: bool) {
        let mut inner = self.lock();
        inner.log.append(
            EventKind::ApprovalDecided,
            "bus",
            request_id.to_string(),
            json!({ "approved": approved }),
        );
    }

    /// Register an artifact produced by a phase.
    pub fn register_artifact(&self, phase_id: &str, artifact_id: &str) {
        let mut inner = self.lock();
        inner
            .artifacts
            .insert(phase_id.to_string(), artifact_id.to_string());
        inner.log.append(
            EventKind::ArtifactRegistered,
            SOURCE,
            artifact_id.to_string(),
            json!({ "phase_id": phase_id }),
        );
    }

    /// Force every non-terminal task to CANCELLED. Used on run cancellation.
    pub fn cancel_open_tasks(&self) {
        let open: Vec<Uuid> = {
            let inner = self.lock();
            inner
                .tasks
                .values()
                .filter(|t| !t.state.is_terminal())
                .map(|t| t.task_id)
                .collect()
        };
        for task_id in open {
            if let Err(err) = self.update_task_state(task_id, TaskState::Cancelled) {
                tracing::debug!(%task_id, error = %err, "task refused cancellation");
            }
        }
    }

    /// Record the architecture decision. Write-once: later writes fail.
    pub fn set_decision(&self, decision: ArchitectureDecision) -> Result<(), TrackerError> {
        let mut inner = self.lock();
        if inner.decision.is_some() {
            return Err(TrackerError::DecisionAlreadyRecorded);
        }
        inner.decision = Some(decision);
        Ok(())
    }

    pub fn decision(&self) -> Option<ArchitectureDecision> {
        self.lock().decision.clone()
    }

    /// Move the run status. Terminal statuses are sinks, except that setting
    /// the same terminal status again is a no-op (cancellation idempotence).
    pub fn set_run_status(&self, status: RunStatus) -> Result<(), TrackerError> {
        let mut inner = self.lock();
        if inner.status == status {
            return Ok(());
        }
        if inner.status.is_terminal() {
            return Err(TrackerError::RunAlreadyTerminal(inner.status));
        }
        inner.status = status;
        if status.is_terminal() {
            inner.ended_at = Some(Utc::now());
            let run_id = inner.run_id;
            inner.log.append(
                EventKind::RunCompleted,
                SOURCE,
                run_id.to_string(),
                json!({ "status": status }),
            );
        }
        Ok(())
    }

    pub fn run_status(&self) -> RunStatus {
        self.lock().status
    }

    pub fn phase_state(&self, number: u32) -> Result<PhaseState, TrackerError> {
        self.lock()
            .phases
            .get(&number)
            .map(|p| p.state)
            .ok_or(TrackerError::UnknownPhase(number))
    }

    pub fn task(&self, task_id: Uuid) -> Result<TaskRecord, TrackerError> {
        self.lock()
            .tasks
            .get(&task_id)
            .cloned()
            .ok_or(TrackerError::UnknownTask(task_id))
    }

    /// Attach the bus counter snapshot so metrics reflect message traffic.
    pub fn attach_bus_counters(&self, counters: crate::bus::BusCountersSnapshot) {
        self.lock().bus_counters = Some(counters);
    }

    /// Events strictly after `ts`. Finite and non-restartable: the returned
    /// batch does not grow as new events arrive.
    pub fn events_since(&self, ts: DateTime<Utc>) -> Vec<Event> {
        self.lock().log.events_since(ts)
    }

    pub fn events(&self) -> Vec<Event> {
        self.lock().log.events().to_vec()
    }

    /// Compute current metrics from tracker state.
    pub fn metrics(&self) -> RunMetrics {
        let inner = self.lock();
        let mut tasks_by_state: BTreeMap<String, u64> = BTreeMap::new();
        let mut durations: Vec<u64> = Vec::new();
        let mut terminal = 0u64;
        let mut completed = 0u64;
        for task in inner.tasks.values() {
            *tasks_by_state
                .entry(format!("{:?}", task.state).to_lowercase())
                .or_default() += 1;
            if task.state.is_terminal() {
                terminal += 1;
                if task.state == TaskState::Completed {
                    completed += 1;
                }
                if let (Some(start), Some(end)) = (task.started_at, task.ended_at) {
                    durations.push((end - start).num_milliseconds().max(0) as u64);
                }
            }
        }
        durations.sort_unstable();

        let mut phases_by_state: BTreeMap<String, u64> = BTreeMap::new();
        for phase in inner.phases.values() {
            *phases_by_state
                .entry(format!("{:?}", phase.state).to_lowercase())
                .or_default() += 1;
        }

        RunMetrics {
            tasks_total: inner.tasks.len() as u64,
            tasks_by_state,
            phases_by_state,
            success_rate: if terminal == 0 {
                1.0
            } else {
                completed as f64 / terminal as f64
            },
            retries_total: inner.retries_total,
            errors_total: inner.errors.len() as u64,
            dead_letter_total: inner.dead_letter_total,
            duration_ms_p50: percentile(&durations, 50.0),
            duration_ms_p90: percentile(&durations, 90.0),
            duration_ms_p99: percentile(&durations, 99.0),
            bus: inner.bus_counters.clone(),
        }
    }

    /// Immutable snapshot of the whole run, for reports and persistence.
    pub fn snapshot(&self) -> RunSnapshot {
        let metrics = self.metrics();
        let inner = self.lock();
        RunSnapshot {
            run_id: inner.run_id,
            plan_id: inner.plan_id.clone(),
            status: inner.status,
            started_at: inner.started_at,
            ended_at: inner.ended_at,
            phases: inner.phases.values().cloned().collect(),
            tasks: inner.tasks.values().cloned().collect(),
            errors: inner.errors.clone(),
            decision: inner.decision.clone(),
            artifacts: inner.artifacts.clone(),
            metrics,
        }
    }
}
