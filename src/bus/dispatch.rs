//! Bus dispatch loop: pops messages in strict priority order and hands them
//! to the registered handler on parallel worker tasks, capped per phase
//! category. Owns the retry/backoff/dead-letter cycle and the approval gate
//! that fronts gated EXECUTION messages.

use crate::bus::approval::{ApprovalBroker, ApprovalOutcome, ApprovalTimeoutPolicy};
use crate::bus::{ErrorPayload, Message, MessageBus, MessageType, RetryDisposition};
use crate::tracker::StatusTracker;
use crate::workflow::PhaseCategory;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// What the handler did with a delivered message.
#[derive(Debug, Clone)]
pub enum DeliveryOutcome {
    /// Handled; message leaves the bus.
    Delivered,
    /// Recoverable failure; the bus re-enqueues with backoff until the
    /// message's retry budget runs out.
    Retry {
        kind: String,
        reason: String,
        /// Multiplier on the base backoff (rate-limited failures pass 2).
        backoff_multiplier: u32,
    },
    /// Terminal handler failure; no retry, message leaves the bus.
    Failed { kind: String, reason: String },
}

/// Receives delivered messages. Implemented by the execution bridge.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Message) -> DeliveryOutcome;

    /// Called instead of `handle` when an approval gate denied the message.
    async fn on_approval_denied(&self, _message: Message, _outcome: ApprovalOutcome) {}
}

/// The dispatch loop. One per run.
pub struct Dispatcher {
    bus: Arc<MessageBus>,
    tracker: Arc<StatusTracker>,
    approvals: Arc<ApprovalBroker>,
    handler: Arc<dyn MessageHandler>,
    category_limits: HashMap<PhaseCategory, Arc<Semaphore>>,
    approved_phases: Mutex<HashSet<u32>>,
    timeout_policy: ApprovalTimeoutPolicy,
}

impl Dispatcher {
    pub fn new(
        bus: Arc<MessageBus>,
        tracker: Arc<StatusTracker>,
        approvals: Arc<ApprovalBroker>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        let mut category_limits = HashMap::new();
        for category in [
            PhaseCategory::Orchestration,
            PhaseCategory::Architecture,
            PhaseCategory::Reporting,
        ] {
            category_limits.insert(category, Arc::new(Semaphore::new(2)));
        }
        category_limits.insert(PhaseCategory::Implementation, Arc::new(Semaphore::new(4)));
        Self {
            bus,
            tracker,
            approvals,
            handler,
            category_limits,
            approved_phases: Mutex::new(HashSet::new()),
            timeout_policy: ApprovalTimeoutPolicy::Block,
        }
    }

    /// Cap concurrent in-flight handling for one category.
    pub fn with_category_limit(mut self, category: PhaseCategory, limit: usize) -> Self {
        self.category_limits
            .insert(category, Arc::new(Semaphore::new(limit.max(1))));
        self
    }

    /// Policy for approval gates that time out.
    pub fn with_timeout_policy(mut self, policy: ApprovalTimeoutPolicy) -> Self {
        self.timeout_policy = policy;
        self
    }

    /// Run the dispatch loop until cancelled. Each popped message is handled
    /// on its own worker task; the loop itself never blocks on an agent.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let tick = self.bus.config().tick;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.bus.wait_for_message() => {}
                _ = tokio::time::sleep(tick) => {}
            }
            while let Some(message) = self.bus.pop_next() {
                let dispatcher = self.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    dispatcher.deliver(message, cancel).await;
                });
            }
        }
    }

    fn category_for(&self, message: &Message) -> Option<PhaseCategory> {
        let phase = message.to_phase?;
        self.bus
            .workflow()
            .phase(phase)
            .ok()
            .map(|spec| spec.category)
    }

    async fn deliver(&self, message: Message, cancel: CancellationToken) {
        // Approval gate fronts gated EXECUTION messages, once per phase.
        if message.message_type == MessageType::Execution {
            if let Some(phase) = message.to_phase {
                let gated = self
                    .bus
                    .workflow()
                    .requires_approval(phase)
                    .unwrap_or(false);
                let already_approved = self.approved(phase);
                if gated && !already_approved {
                    let outcome = self.gate(phase, &cancel).await;
                    match outcome {
                        ApprovalOutcome::Approved => self.mark_approved(phase),
                        denied => {
                            self.bus.abandon_delivery(&message);
                            self.handler.on_approval_denied(message, denied).await;
                            return;
                        }
                    }
                }
            }
        }

        // Copies for broadcast and escalation subscribers.
        match message.message_type {
            MessageType::Notification if message.to_agents.is_empty() => {
                self.bus
                    .forward_to_category(self.category_for(&message), &message);
            }
            MessageType::Error => self.bus.forward_escalation(&message),
            _ => {}
        }

        let permit = match self.category_for(&message) {
            Some(category) => match self.category_limits.get(&category) {
                Some(sem) => sem.clone().acquire_owned().await.ok(),
                None => None,
            },
            None => None,
        };
        let outcome = self.handler.handle(message.clone()).await;
        drop(permit);

        match outcome {
            DeliveryOutcome::Delivered => self.bus.finish_delivery(&message, true),
            DeliveryOutcome::Failed { kind, reason } => {
                tracing::warn!(
                    message_id = %message.message_id,
                    %kind,
                    %reason,
                    "terminal delivery failure"
                );
                self.bus.finish_delivery(&message, false);
            }
            DeliveryOutcome::Retry {
                kind,
                reason,
                backoff_multiplier,
            } => match self.bus.prepare_retry(message, &reason, backoff_multiplier) {
                RetryDisposition::Requeue { message, backoff } => {
                    self.tracker.record_retry();
                    tracing::info!(
                        message_id = %message.message_id,
                        retry = message.retry_count,
                        backoff_ms = backoff.as_millis() as u64,
                        "delivery retry scheduled"
                    );
                    let bus = self.bus.clone();
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = tokio::time::sleep(backoff) => {}
                            _ = cancel.cancelled() => {}
                        }
                        // requeue() drops the message when the bus drains.
                        bus.requeue(message);
                    });
                }
                RetryDisposition::DeadLettered { message } => {
                    self.tracker
                        .record_dead_letter(message.message_id, &reason);
                    let payload = ErrorPayload {
                        phase: message.to_phase,
                        agent_id: message.to_agents.first().cloned(),
                        kind,
                        message: reason,
                        retries_exhausted: true,
                    };
                    if let Err(err) = self.bus.publish(Message::error(payload)) {
                        tracing::warn!(error = %err, "failed to publish escalation error");
                    }
                }
            },
        }
    }

    fn approved(&self, phase: u32) -> bool {
        match self.approved_phases.lock() {
            Ok(guard) => guard.contains(&phase),
            Err(poisoned) => poisoned.into_inner().contains(&phase),
        }
    }

    fn mark_approved(&self, phase: u32) {
        match self.approved_phases.lock() {
            Ok(mut guard) => {
                guard.insert(phase);
            }
            Err(poisoned) => {
                poisoned.into_inner().insert(phase);
            }
        }
    }

    async fn gate(&self, phase: u32, cancel: &CancellationToken) -> ApprovalOutcome {
        let request_id = Uuid::new_v4();
        let rx = self.approvals.register(request_id);
        self.tracker.record_approval_requested(request_id, phase);
        if let Err(err) = self.bus.publish(Message::approval_request(phase, request_id)) {
            tracing::warn!(error = %err, phase, "failed to publish approval request");
        }
        tracing::info!(%request_id, phase, "awaiting approval");
        let mut outcome = self
            .approvals
            .await_decision(rx, self.bus.config().approval_timeout, cancel)
            .await;
        if outcome == ApprovalOutcome::TimedOut
            && self.timeout_policy == ApprovalTimeoutPolicy::AutoApprove
        {
            tracing::warn!(%request_id, phase, "approval timed out; auto-approving per policy");
            outcome = ApprovalOutcome::Approved;
        }
        self.tracker
            .record_approval_decided(request_id, outcome == ApprovalOutcome::Approved);
        outcome
    }
}
