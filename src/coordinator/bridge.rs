//! Execution bridge: the bus handler that turns a delivered EXECUTION
//! message into an agent invocation, collects the output, consults the
//! decision engine, and reports the phase outcome back to the coordinator.

use crate::bus::{
    ApprovalOutcome, ApprovalSignal, DeliveryOutcome, ErrorPayload, ExecutionPayload,
    HandoffPayload, Message, MessageHandler, MessageType,
};
use crate::bus::ApprovalDecisionPayload;
use crate::collector::canonical_bytes;
use crate::coordinator::{PhaseOutcome, PhaseSignal, RunContext};
use crate::decision::{DecisionOutcome, ErrorKind, NextAction};
use crate::errors::BusError;
use crate::exec::{select_transport, InvocationResult};
use crate::store::ArtifactMeta;
use crate::tracker::{ErrorSeverity, PhaseState, TaskState};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Cap on failure text carried into events and reports.
const MAX_REASON_LEN: usize = 500;

pub struct ExecutionBridge {
    ctx: Arc<RunContext>,
    signals: mpsc::UnboundedSender<PhaseSignal>,
    /// Latest task id per phase, for failures surfaced via ERROR messages.
    task_by_phase: Mutex<HashMap<u32, Uuid>>,
    /// Latest decision per phase, to record eventual outcomes.
    decision_by_phase: Mutex<HashMap<u32, Uuid>>,
}

impl ExecutionBridge {
    pub fn new(ctx: Arc<RunContext>, signals: mpsc::UnboundedSender<PhaseSignal>) -> Self {
        Self {
            ctx,
            signals,
            task_by_phase: Mutex::new(HashMap::new()),
            decision_by_phase: Mutex::new(HashMap::new()),
        }
    }

    fn lock<'a, T>(mutex: &'a Mutex<T>) -> MutexGuard<'a, T> {
        match mutex.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn signal(&self, phase: u32, outcome: PhaseOutcome) {
        if self.signals.send(PhaseSignal { phase, outcome }).is_err() {
            tracing::debug!(phase, "coordinator stopped listening for signals");
        }
    }

    async fn handle_execution(&self, message: &Message) -> DeliveryOutcome {
        let payload: ExecutionPayload = match serde_json::from_value(message.payload.clone()) {
            Ok(payload) => payload,
            Err(err) => {
                return DeliveryOutcome::Failed {
                    kind: ErrorKind::Unknown.label().to_string(),
                    reason: format!("malformed execution payload: {err}"),
                }
            }
        };
        let ctx = &self.ctx;
        let phase = payload.phase;
        let attempt = message.retry_count + 1;
        Self::lock(&self.task_by_phase).insert(phase, payload.task_id);

        let config = match ctx.registry.config(&payload.agent_id) {
            Ok(config) => config,
            Err(err) => {
                return self.terminal(
                    phase,
                    payload.task_id,
                    &payload.agent_id,
                    ErrorKind::DependencyMissing,
                    &err.to_string(),
                    false,
                )
            }
        };
        let transport = match select_transport(None, &config) {
            Ok(transport) => transport,
            Err(err) => {
                return self.terminal(
                    phase,
                    payload.task_id,
                    &payload.agent_id,
                    ErrorKind::DependencyMissing,
                    &err.to_string(),
                    false,
                )
            }
        };

        // The guard keeps the temp dir alive exactly as long as this attempt.
        let (exec_ctx, _temp_guard) =
            match ctx.contexts.build(&config, phase, attempt, payload.inputs.clone()) {
                Ok(built) => built,
                Err(err) => {
                    return self.terminal(
                        phase,
                        payload.task_id,
                        &payload.agent_id,
                        ErrorKind::Unknown,
                        &format!("failed to build execution context: {err:#}"),
                        true,
                    )
                }
            };

        let _ = ctx
            .tracker
            .begin_attempt(payload.task_id, exec_ctx.execution_id, attempt);
        if attempt == 1 {
            let _ = ctx
                .tracker
                .update_task_state(payload.task_id, TaskState::Scheduled);
        }
        let _ = ctx.tracker.update_phase_state(phase, PhaseState::Running);
        if let Err(err) = ctx
            .tracker
            .update_task_state(payload.task_id, TaskState::Running)
        {
            tracing::warn!(phase, error = %err, "task refused RUNNING transition");
        }

        let result = ctx.invoker.invoke(transport, &exec_ctx, &ctx.cancel).await;
        if result.cancelled() {
            let _ = ctx
                .tracker
                .update_task_state(payload.task_id, TaskState::Cancelled);
            return DeliveryOutcome::Failed {
                kind: "cancelled".to_string(),
                reason: "run cancelled".to_string(),
            };
        }

        let collected = match ctx.collector.collect(&result, &exec_ctx) {
            Ok(collected) => collected,
            Err(err) => {
                return self.terminal(
                    phase,
                    payload.task_id,
                    &payload.agent_id,
                    ErrorKind::Unknown,
                    &format!("output collection failed: {err:#}"),
                    true,
                )
            }
        };

        let validation_errors: Option<Vec<String>> = collected.artifact.as_ref().and_then(
            |artifact| match ctx
                .schemas
                .validate(&config.output_schema, &canonical_bytes(artifact))
            {
                Ok(()) => None,
                Err(errors) => Some(errors),
            },
        );

        match ctx.engine.classify(&result, validation_errors.as_deref()) {
            None => self.complete(phase, &payload, collected, attempt),
            Some(kind) => self.fail(
                phase,
                &payload,
                kind,
                &result,
                validation_errors.as_deref(),
                attempt,
            ),
        }
    }

    /// Successful invocation: persist the artifact, close the task, and tell
    /// the coordinator the phase is done.
    fn complete(
        &self,
        phase: u32,
        payload: &ExecutionPayload,
        collected: crate::collector::CollectedOutput,
        attempt: u32,
    ) -> DeliveryOutcome {
        let ctx = &self.ctx;
        let phase_id = ctx
            .workflow
            .phase(phase)
            .map(|spec| spec.phase_id.clone())
            .unwrap_or_else(|_| format!("phase-{phase}"));

        let mut artifact_id = None;
        if let Some(artifact) = &collected.artifact {
            let bytes = canonical_bytes(artifact);
            let version = artifact
                .get("version")
                .and_then(|v| v.as_str())
                .filter(|v| semver::Version::parse(v).is_ok())
                .unwrap_or("0.1.0")
                .to_string();
            let dependencies = payload
                .inputs
                .get("artifacts")
                .and_then(|v| v.as_object())
                .map(|map| {
                    map.values()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default();
            let meta = ArtifactMeta::new(&phase_id, &version, &payload.agent_id)
                .with_dependencies(dependencies);
            match ctx.store.put(&bytes, meta) {
                Ok(id) => {
                    ctx.tracker.register_artifact(&phase_id, &id);
                    artifact_id = Some(id);
                }
                Err(err) => {
                    return self.terminal(
                        phase,
                        payload.task_id,
                        &payload.agent_id,
                        ErrorKind::Unknown,
                        &format!("artifact store rejected output: {err}"),
                        true,
                    )
                }
            }
        }

        if attempt > 1 {
            if let Some(decision_id) = Self::lock(&self.decision_by_phase).remove(&phase) {
                let _ = ctx
                    .engine
                    .record_outcome(decision_id, DecisionOutcome::Recovered);
            }
        }

        let _ = ctx
            .tracker
            .update_task_state(payload.task_id, TaskState::Completed);
        let _ = ctx.tracker.update_phase_state(phase, PhaseState::Completed);
        tracing::info!(phase, agent_id = %payload.agent_id, attempt, "phase completed");
        self.signal(phase, PhaseOutcome::Completed { artifact_id });
        DeliveryOutcome::Delivered
    }

    /// Failed invocation: consult the decision engine and act.
    fn fail(
        &self,
        phase: u32,
        payload: &ExecutionPayload,
        kind: ErrorKind,
        result: &InvocationResult,
        validation_errors: Option<&[String]>,
        attempt: u32,
    ) -> DeliveryOutcome {
        let ctx = &self.ctx;
        let reason = failure_reason(kind, result, validation_errors);
        let decision = ctx.engine.decide(kind, attempt);
        Self::lock(&self.decision_by_phase).insert(phase, decision.decision_id);

        match decision.action {
            NextAction::Retry => {
                let _ = ctx.tracker.set_task_error(payload.task_id, &reason);
                ctx.tracker.record_error(
                    Some(phase),
                    Some(&payload.agent_id),
                    kind.label(),
                    ErrorSeverity::Warning,
                    &reason,
                    false,
                );
                let _ = ctx
                    .tracker
                    .update_task_state(payload.task_id, TaskState::Scheduled);
                DeliveryOutcome::Retry {
                    kind: kind.label().to_string(),
                    reason,
                    backoff_multiplier: ctx.engine.backoff_multiplier(kind),
                }
            }
            NextAction::Block => {
                self.terminal(phase, payload.task_id, &payload.agent_id, kind, &reason, false)
            }
            NextAction::Escalate => {
                self.terminal(phase, payload.task_id, &payload.agent_id, kind, &reason, true)
            }
            NextAction::Skip => {
                let _ = ctx
                    .tracker
                    .update_task_state(payload.task_id, TaskState::Completed);
                self.signal(phase, PhaseOutcome::Skipped);
                DeliveryOutcome::Delivered
            }
            NextAction::Proceed => {
                // The seed table never maps an error to PROCEED; close the
                // task without an artifact if a tuned policy does.
                let _ = ctx
                    .tracker
                    .update_task_state(payload.task_id, TaskState::Completed);
                self.signal(phase, PhaseOutcome::Completed { artifact_id: None });
                DeliveryOutcome::Delivered
            }
        }
    }

    /// Terminal phase failure: fail the task and phase, surface the error,
    /// optionally escalate via an ERROR message.
    fn terminal(
        &self,
        phase: u32,
        task_id: Uuid,
        agent_id: &str,
        kind: ErrorKind,
        reason: &str,
        escalate: bool,
    ) -> DeliveryOutcome {
        let ctx = &self.ctx;
        let task_state = if kind == ErrorKind::Timeout {
            TaskState::Timeout
        } else {
            TaskState::Failed
        };
        let _ = ctx.tracker.set_task_error(task_id, reason);
        let _ = ctx.tracker.update_task_state(task_id, task_state);
        let _ = ctx.tracker.update_phase_state_with_reason(
            phase,
            PhaseState::Failed,
            Some(kind.label()),
        );
        let severity = if escalate {
            ErrorSeverity::Fatal
        } else {
            ErrorSeverity::Error
        };
        ctx.tracker
            .record_error(Some(phase), Some(agent_id), kind.label(), severity, reason, false);

        if let Some(decision_id) = Self::lock(&self.decision_by_phase).remove(&phase) {
            let _ = ctx.engine.record_outcome(decision_id, DecisionOutcome::Failed);
        }

        if escalate {
            let error = Message::error(ErrorPayload {
                phase: Some(phase),
                agent_id: Some(agent_id.to_string()),
                kind: kind.label().to_string(),
                message: reason.to_string(),
                retries_exhausted: false,
            });
            if let Err(err) = ctx.bus.publish(error) {
                if !matches!(err, BusError::Draining) {
                    tracing::warn!(phase, error = %err, "failed to publish escalation");
                }
            }
        }

        tracing::warn!(phase, agent_id, kind = kind.label(), reason, "phase failed");
        self.signal(
            phase,
            PhaseOutcome::Failed {
                kind: kind.label().to_string(),
                reason: reason.to_string(),
                escalated: escalate,
            },
        );
        DeliveryOutcome::Failed {
            kind: kind.label().to_string(),
            reason: reason.to_string(),
        }
    }

    /// A dead-lettered execution surfaces here as an ERROR message with
    /// `retries_exhausted` set; fail the phase it belonged to.
    fn handle_error_message(&self, message: &Message) -> DeliveryOutcome {
        let payload: ErrorPayload = match serde_json::from_value(message.payload.clone()) {
            Ok(payload) => payload,
            Err(_) => return DeliveryOutcome::Delivered,
        };
        if !payload.retries_exhausted {
            // Escalations published at decision time were already applied.
            return DeliveryOutcome::Delivered;
        }
        let Some(phase) = payload.phase else {
            return DeliveryOutcome::Delivered;
        };

        let ctx = &self.ctx;
        if let Some(task_id) = Self::lock(&self.task_by_phase).get(&phase).copied() {
            let _ = ctx.tracker.set_task_error(task_id, &payload.message);
            let _ = ctx.tracker.update_task_state(task_id, TaskState::Failed);
        }
        if let Some(decision_id) = Self::lock(&self.decision_by_phase).remove(&phase) {
            let _ = ctx.engine.record_outcome(decision_id, DecisionOutcome::Failed);
        }
        let _ = ctx.tracker.update_phase_state_with_reason(
            phase,
            PhaseState::Failed,
            Some(&payload.kind),
        );
        ctx.tracker.record_error(
            Some(phase),
            payload.agent_id.as_deref(),
            &payload.kind,
            ErrorSeverity::Fatal,
            &payload.message,
            true,
        );
        self.signal(
            phase,
            PhaseOutcome::Failed {
                kind: payload.kind.clone(),
                reason: payload.message.clone(),
                escalated: true,
            },
        );
        DeliveryOutcome::Delivered
    }
}

#[async_trait]
impl MessageHandler for ExecutionBridge {
    async fn handle(&self, message: Message) -> DeliveryOutcome {
        match message.message_type {
            MessageType::Execution => self.handle_execution(&message).await,
            MessageType::Handoff => {
                if let Ok(payload) =
                    serde_json::from_value::<HandoffPayload>(message.payload.clone())
                {
                    self.ctx
                        .tracker
                        .record_handoff(payload.from_phase, payload.to_phase);
                }
                DeliveryOutcome::Delivered
            }
            MessageType::ApprovalDecision => {
                if let Ok(payload) =
                    serde_json::from_value::<ApprovalDecisionPayload>(message.payload.clone())
                {
                    let signal = if payload.approved {
                        ApprovalSignal::Approved {
                            notes: payload.notes,
                        }
                    } else {
                        ApprovalSignal::Rejected {
                            notes: payload.notes,
                        }
                    };
                    if let Err(err) = self.ctx.approvals.decide(payload.request_id, signal) {
                        tracing::warn!(error = %err, "approval decision not applicable");
                    }
                }
                DeliveryOutcome::Delivered
            }
            MessageType::Error => self.handle_error_message(&message),
            MessageType::ApprovalRequest | MessageType::Notification => DeliveryOutcome::Delivered,
        }
    }

    async fn on_approval_denied(&self, message: Message, outcome: ApprovalOutcome) {
        let Ok(payload) = serde_json::from_value::<ExecutionPayload>(message.payload.clone())
        else {
            return;
        };
        let ctx = &self.ctx;
        let (reason, notes) = match outcome {
            ApprovalOutcome::Rejected { notes } => ("approval_rejected", notes),
            _ => ("approval_timeout", None),
        };
        let _ = ctx
            .tracker
            .update_task_state(payload.task_id, TaskState::Cancelled);
        let _ = ctx.tracker.update_phase_state_with_reason(
            payload.phase,
            PhaseState::Failed,
            Some(reason),
        );
        let detail = notes.unwrap_or_else(|| reason.to_string());
        ctx.tracker.record_error(
            Some(payload.phase),
            Some(&payload.agent_id),
            reason,
            ErrorSeverity::Error,
            &detail,
            false,
        );
        tracing::warn!(phase = payload.phase, reason, "approval gate denied phase");
        self.signal(
            payload.phase,
            PhaseOutcome::Failed {
                kind: reason.to_string(),
                reason: detail,
                escalated: false,
            },
        );
    }
}

/// Compose the most useful short failure text for reports.
fn failure_reason(
    kind: ErrorKind,
    result: &InvocationResult,
    validation_errors: Option<&[String]>,
) -> String {
    let text = if kind == ErrorKind::SchemaInvalid {
        match validation_errors {
            Some(errors) => errors.join("; "),
            None => "output failed schema validation".to_string(),
        }
    } else if let Some(failure) = &result.failure {
        failure.message.clone()
    } else if !result.stderr.trim().is_empty() {
        result.stderr.trim().to_string()
    } else if let Some(status) = result.http_status {
        format!("agent responded with HTTP {status}")
    } else {
        format!("agent exited with code {:?}", result.exit_code)
    };
    if text.len() > MAX_REASON_LEN {
        let mut cut = MAX_REASON_LEN;
        while cut > 0 && !text.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}…", &text[..cut])
    } else {
        text
    }
}
