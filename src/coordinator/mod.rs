//! The coordinator: a thin driver that walks the workflow, dispatches ready
//! phases through the bus, reacts to bridge outcomes, and declares the run
//! done.
//!
//! A [`RunContext`] owns exactly one of each shared component (bus, tracker,
//! store, registries, decision engine); its lifecycle is the run's lifecycle.

mod bridge;

pub use bridge::ExecutionBridge;

use crate::bus::{
    ApprovalBroker, Dispatcher, ExecutionPayload, HandoffPayload, Message, MessageBus,
    MessageHandler,
};
use crate::collector::{CollectorConfig, OutputCollector};
use crate::config::Config;
use crate::decision::DecisionEngine;
use crate::errors::BusError;
use crate::exec::{AgentInvoker, AgentRegistry, ContextBuilder};
use crate::plan::Plan;
use crate::report::{build, write_report, ReportFormat, ReportKind};
use crate::schema::SchemaRegistry;
use crate::store::{ArtifactStatus, ArtifactStore};
use crate::tracker::{ErrorSeverity, PhaseState, RunStatus, StatusTracker};
use crate::workflow::{ArchitectureDecision, PhaseCategory, PhaseSpec, Workflow};
use anyhow::{Context, Result};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Grace window for in-flight work after a cancellation.
const CANCEL_GRACE: Duration = Duration::from_secs(2);

/// What the bridge reports back per phase.
#[derive(Debug, Clone)]
pub enum PhaseOutcome {
    Completed { artifact_id: Option<String> },
    Failed {
        kind: String,
        reason: String,
        escalated: bool,
    },
    Skipped,
}

/// One phase outcome signal from the execution bridge.
#[derive(Debug, Clone)]
pub struct PhaseSignal {
    pub phase: u32,
    pub outcome: PhaseOutcome,
}

/// Everything a run needs, owned once, threaded by reference.
pub struct RunContext {
    pub run_id: Uuid,
    pub run_dir: PathBuf,
    pub config: Config,
    pub workflow: Arc<Workflow>,
    pub bus: Arc<MessageBus>,
    pub tracker: Arc<StatusTracker>,
    pub store: Arc<ArtifactStore>,
    pub registry: Arc<AgentRegistry>,
    pub schemas: Arc<SchemaRegistry>,
    pub engine: Arc<DecisionEngine>,
    pub collector: OutputCollector,
    pub invoker: AgentInvoker,
    pub contexts: ContextBuilder,
    pub approvals: Arc<ApprovalBroker>,
    pub cancel: CancellationToken,
}

impl RunContext {
    /// Assemble a run context: one bus, one tracker, one store, one decision
    /// engine. Plan agents are registered into the registry here.
    pub fn new(
        config: Config,
        plan: &Plan,
        workflow: Arc<Workflow>,
        registry: Arc<AgentRegistry>,
        schemas: Arc<SchemaRegistry>,
    ) -> Result<Arc<Self>> {
        let run_id = Uuid::new_v4();
        let run_dir = config.run_dir(&run_id.to_string());
        std::fs::create_dir_all(&run_dir)
            .with_context(|| format!("failed to create run dir {}", run_dir.display()))?;

        for agent in &plan.agents {
            registry.register(agent.clone());
        }

        let tracker = Arc::new(
            StatusTracker::new(run_id, &plan.plan_id)
                .with_event_sink(run_dir.join("events").join("run.log")),
        );
        let bus = Arc::new(MessageBus::new(workflow.clone(), config.bus_config()));
        let store = Arc::new(ArtifactStore::open(&config.store_dir)?);
        let collector = OutputCollector::new(CollectorConfig {
            max_output_size: config.core.max_output_size,
        });
        let invoker = AgentInvoker::new(registry.clone());
        let contexts = ContextBuilder::new(&run_dir).with_default_limits(config.default_limits());

        Ok(Arc::new(Self {
            run_id,
            run_dir,
            config,
            workflow,
            bus,
            tracker,
            store,
            registry,
            schemas,
            engine: Arc::new(DecisionEngine::new()),
            collector,
            invoker,
            contexts,
            approvals: Arc::new(ApprovalBroker::new()),
            cancel: CancellationToken::new(),
        }))
    }
}

/// Result of a completed run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub run_dir: PathBuf,
    pub report_paths: Vec<PathBuf>,
}

#[derive(Default)]
struct DriveState {
    completed: HashSet<u32>,
    skipped: HashSet<u32>,
    dispatched: HashSet<u32>,
    artifacts: HashMap<u32, String>,
    fatal: bool,
}

/// The run driver.
pub struct Coordinator {
    ctx: Arc<RunContext>,
}

impl Coordinator {
    pub fn new(ctx: Arc<RunContext>) -> Self {
        Self { ctx }
    }

    /// Drive the workflow to completion and produce reports.
    pub async fn run(&self, request: serde_json::Value) -> Result<RunOutcome> {
        let ctx = self.ctx.clone();
        tracing::info!(run_id = %ctx.run_id, "run starting");
        ctx.tracker.start_run(ctx.workflow.phases());
        self.persist_snapshot()?;

        let (signal_tx, mut signal_rx) = mpsc::unbounded_channel::<PhaseSignal>();
        let bridge: Arc<dyn MessageHandler> =
            Arc::new(ExecutionBridge::new(ctx.clone(), signal_tx));

        // Infrastructure stops with this child token: it follows run
        // cancellation and is also cancelled on normal completion.
        let infra = ctx.cancel.child_token();
        let dispatcher = Arc::new(
            Dispatcher::new(
                ctx.bus.clone(),
                ctx.tracker.clone(),
                ctx.approvals.clone(),
                bridge,
            )
            .with_category_limit(PhaseCategory::Implementation, ctx.config.core.parallelism)
            .with_timeout_policy(ctx.config.approval.on_timeout),
        );
        let dispatch_handle = tokio::spawn(dispatcher.run(infra.clone()));

        let tick = Duration::from_millis(ctx.config.core.bus_tick_ms.max(10));
        let approval_handle =
            ctx.approvals
                .watch_directory(ctx.config.approvals_dir.clone(), tick, infra.clone());
        let marker_handle = self.spawn_cancel_marker_watcher(tick, infra.clone());

        let mut state = DriveState::default();
        self.dispatch_ready(&mut state, &request);

        let status = loop {
            if self.settled(&state) && ctx.bus.is_idle() {
                break self.final_status(&state);
            }
            tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    break self.finish_cancelled().await;
                }
                signal = signal_rx.recv() => {
                    match signal {
                        Some(signal) => self.apply_signal(&mut state, signal, &request),
                        None => break self.final_status(&state),
                    }
                }
                _ = tokio::time::sleep(tick * 5) => {}
            }
        };

        infra.cancel();
        let _ = dispatch_handle.await;
        let _ = approval_handle.await;
        let _ = marker_handle.await;

        let (status, report_paths) = self.finalize(status)?;
        tracing::info!(run_id = %ctx.run_id, status = ?status, "run finished");
        Ok(RunOutcome {
            run_id: ctx.run_id,
            status,
            run_dir: ctx.run_dir.clone(),
            report_paths,
        })
    }

    /// Request cancellation. Safe to call any number of times.
    pub fn cancel(&self) {
        self.ctx.cancel.cancel();
    }

    fn spawn_cancel_marker_watcher(
        &self,
        tick: Duration,
        infra: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let marker = self.ctx.run_dir.join("cancel");
        let cancel = self.ctx.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = infra.cancelled() => break,
                    _ = tokio::time::sleep(tick) => {}
                }
                if marker.exists() {
                    tracing::info!("cancel marker found");
                    cancel.cancel();
                    break;
                }
            }
        })
    }

    fn ready_phases(&self, state: &DriveState) -> Vec<PhaseSpec> {
        let decision = self.ctx.tracker.decision();
        self.ctx
            .workflow
            .phases()
            .iter()
            .filter(|p| {
                !state.dispatched.contains(&p.number)
                    && matches!(
                        self.ctx.tracker.phase_state(p.number),
                        Ok(PhaseState::Pending)
                    )
                    && p.depends_on
                        .iter()
                        .all(|d| state.completed.contains(d) || state.skipped.contains(d))
                    && p.predicate.evaluate(decision.as_ref())
            })
            .cloned()
            .collect()
    }

    /// Dispatch every ready phase: create its task, publish handoffs from its
    /// completed predecessors, then publish the EXECUTION message.
    fn dispatch_ready(&self, state: &mut DriveState, request: &serde_json::Value) {
        let ctx = &self.ctx;
        for spec in self.ready_phases(state) {
            let task_id = ctx
                .tracker
                .create_task(spec.number, &spec.agent_id, Uuid::new_v4());

            let mut upstream = serde_json::Map::new();
            for dep in &spec.depends_on {
                if let (Ok(dep_spec), Some(artifact_id)) =
                    (ctx.workflow.phase(*dep), state.artifacts.get(dep))
                {
                    upstream.insert(
                        dep_spec.phase_id.clone(),
                        serde_json::Value::String(artifact_id.clone()),
                    );
                }
            }
            let inputs = serde_json::json!({
                "request": request,
                "artifacts": upstream,
            });

            if let Err(err) = ctx.tracker.update_phase_state(spec.number, PhaseState::Scheduled) {
                tracing::warn!(phase = spec.number, error = %err, "phase refused scheduling");
                continue;
            }

            for dep in &spec.depends_on {
                if let Some(artifact_id) = state.artifacts.get(dep) {
                    let handoff = Message::handoff(
                        *dep,
                        spec.number,
                        HandoffPayload {
                            from_phase: *dep,
                            to_phase: spec.number,
                            artifact_id: artifact_id.clone(),
                        },
                    );
                    match ctx.bus.publish(handoff) {
                        Ok(_) => {
                            // A consumed artifact is in use from here on.
                            if let Err(err) =
                                ctx.store.set_status(artifact_id, ArtifactStatus::InUse)
                            {
                                tracing::debug!(error = %err, "artifact status unchanged");
                            }
                        }
                        Err(BusError::Draining) => {}
                        Err(err) => {
                            // A refused handoff is a workflow-model violation.
                            ctx.tracker.record_error(
                                Some(spec.number),
                                Some(&spec.agent_id),
                                "disallowed_transition",
                                ErrorSeverity::Fatal,
                                &err.to_string(),
                                false,
                            );
                            state.fatal = true;
                        }
                    }
                }
            }

            let message = Message::execution(
                spec.number,
                &spec.agent_id,
                ExecutionPayload {
                    phase: spec.number,
                    agent_id: spec.agent_id.clone(),
                    task_id,
                    inputs,
                },
            )
            .with_max_retries(ctx.config.retry.max_retries);

            match ctx.bus.publish(message) {
                Ok(_) => {
                    tracing::info!(phase = spec.number, agent_id = %spec.agent_id, "phase dispatched");
                    state.dispatched.insert(spec.number);
                }
                Err(BusError::Draining) => {}
                Err(err) => {
                    tracing::warn!(phase = spec.number, error = %err, "dispatch failed");
                }
            }
        }
    }

    fn apply_signal(
        &self,
        state: &mut DriveState,
        signal: PhaseSignal,
        request: &serde_json::Value,
    ) {
        let PhaseSignal { phase, outcome } = signal;
        match outcome {
            PhaseOutcome::Completed { artifact_id } => {
                if !state.completed.insert(phase) {
                    return;
                }
                if let Some(artifact_id) = artifact_id {
                    state.artifacts.insert(phase, artifact_id);
                }
                if Some(phase) == self.ctx.workflow.decision_phase() {
                    self.finalize_decision(state, phase);
                }
            }
            PhaseOutcome::Failed { .. } => {
                // The tracker already holds the phase's terminal state; a
                // failed predecessor simply never satisfies its dependents.
            }
            PhaseOutcome::Skipped => {
                state.skipped.insert(phase);
            }
        }
        self.dispatch_ready(state, request);
    }

    /// The decision phase completed: parse the decision out of its artifact,
    /// record it, and settle every conditional phase whose predicate fails.
    fn finalize_decision(&self, state: &mut DriveState, phase: u32) {
        let ctx = &self.ctx;
        let parsed = state
            .artifacts
            .get(&phase)
            .and_then(|id| ctx.store.get(id, None).ok())
            .and_then(|bytes| serde_json::from_slice::<serde_json::Value>(&bytes).ok())
            .and_then(|value| ArchitectureDecision::from_artifact(&value));
        let decision = match parsed {
            Some(decision) => decision,
            None => {
                tracing::warn!(
                    phase,
                    "architecture phase produced no parsable decision; all conditional phases will be skipped"
                );
                ArchitectureDecision::default()
            }
        };

        if let Err(err) = ctx.workflow.activated_phases(&decision) {
            ctx.tracker.record_error(
                Some(phase),
                None,
                "disallowed_transition",
                ErrorSeverity::Fatal,
                &err.to_string(),
                false,
            );
            state.fatal = true;
        }
        if let Err(err) = ctx.tracker.set_decision(decision.clone()) {
            tracing::warn!(error = %err, "decision not recorded");
        }

        for spec in ctx.workflow.phases() {
            if !spec.is_conditional() {
                continue;
            }
            let active = !state.fatal && spec.predicate.evaluate(Some(&decision));
            if !active {
                let reason = if state.fatal {
                    "activation_conflict"
                } else if spec.mutex_group.is_some() {
                    "mutex_alternative_selected"
                } else {
                    "predicate_false"
                };
                if ctx
                    .tracker
                    .update_phase_state_with_reason(spec.number, PhaseState::Skipped, Some(reason))
                    .is_ok()
                {
                    state.skipped.insert(spec.number);
                }
            }
        }
    }

    /// True when nothing is running and nothing more can start.
    fn settled(&self, state: &DriveState) -> bool {
        let in_flight = state.dispatched.iter().any(|n| {
            matches!(
                self.ctx.tracker.phase_state(*n),
                Ok(PhaseState::Scheduled | PhaseState::Running)
            )
        });
        !in_flight && self.ready_phases(state).is_empty()
    }

    fn final_status(&self, state: &DriveState) -> RunStatus {
        if state.fatal {
            return RunStatus::Failed;
        }
        let snapshot = self.ctx.tracker.snapshot();
        let any_failed = snapshot
            .phases
            .iter()
            .any(|p| p.state == PhaseState::Failed);
        if !any_failed {
            return RunStatus::Succeeded;
        }
        let ordered_ok = self
            .ctx
            .workflow
            .phases()
            .iter()
            .filter(|p| p.category.is_ordered())
            .all(|p| {
                matches!(
                    self.ctx.tracker.phase_state(p.number),
                    Ok(PhaseState::Completed)
                )
            });
        if ordered_ok {
            RunStatus::Partial
        } else {
            RunStatus::Failed
        }
    }

    /// Cancellation: flush the queues (DLQ stays), give in-flight work a
    /// grace window, then cancel whatever tasks remain open.
    async fn finish_cancelled(&self) -> RunStatus {
        let ctx = &self.ctx;
        tracing::warn!(run_id = %ctx.run_id, "cancelling run");
        let flushed = ctx.bus.drain();
        tracing::info!(flushed, "queues flushed");

        let deadline = tokio::time::Instant::now() + CANCEL_GRACE;
        while !ctx.bus.is_idle() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        ctx.tracker.cancel_open_tasks();
        RunStatus::Cancelled
    }

    /// Close out phase states, set the run status, and write reports.
    fn finalize(&self, status: RunStatus) -> Result<(RunStatus, Vec<PathBuf>)> {
        let ctx = &self.ctx;

        for spec in ctx.workflow.phases() {
            let current = match ctx.tracker.phase_state(spec.number) {
                Ok(state) => state,
                Err(_) => continue,
            };
            if current.is_terminal() {
                continue;
            }
            let reason = if status == RunStatus::Cancelled {
                "run_cancelled"
            } else {
                "not_reached"
            };
            let target = if current == PhaseState::Running {
                PhaseState::Failed
            } else {
                PhaseState::Skipped
            };
            if let Err(err) =
                ctx.tracker
                    .update_phase_state_with_reason(spec.number, target, Some(reason))
            {
                tracing::debug!(phase = spec.number, error = %err, "close-out transition refused");
            }
        }

        ctx.tracker.attach_bus_counters(ctx.bus.counters());
        if let Err(err) = ctx.tracker.set_run_status(status) {
            tracing::debug!(error = %err, "run status already terminal");
        }
        let status = ctx.tracker.run_status();

        let snapshot = ctx.tracker.snapshot();
        let mut report_paths = Vec::new();
        for kind in [
            ReportKind::Status,
            ReportKind::Completion,
            ReportKind::Performance,
            ReportKind::Error,
        ] {
            let report = build(kind, &snapshot);
            report_paths.push(write_report(&ctx.run_dir, &report, ReportFormat::Structured)?);
        }
        report_paths.push(write_report(
            &ctx.run_dir,
            &build(ReportKind::Completion, &snapshot),
            ReportFormat::Markdown,
        )?);
        self.persist_snapshot()?;
        Ok((status, report_paths))
    }

    fn persist_snapshot(&self) -> Result<()> {
        let snapshot = self.ctx.tracker.snapshot();
        let json = serde_json::to_string_pretty(&snapshot)
            .context("failed to serialize run snapshot")?;
        std::fs::write(self.ctx.run_dir.join("run.json"), json)
            .context("failed to write run.json")?;
        Ok(())
    }
}
