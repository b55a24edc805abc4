//! Priority-queued, phase-aware message bus.
//!
//! One FIFO queue per priority level; the dispatcher drains CRITICAL, then
//! HIGH, NORMAL, LOW on each cycle. Handoff messages are validated against
//! the workflow model before they are accepted. Delivery failures retry with
//! capped exponential backoff until the retry budget is exhausted, at which
//! point the message moves to the dead-letter queue and an ERROR message is
//! published for escalation subscribers.
//!
//! The bus owns queued messages; a copy passes to the delivered handler.

mod approval;
mod dispatch;

pub use approval::{ApprovalBroker, ApprovalOutcome, ApprovalSignal, ApprovalTimeoutPolicy};
pub use dispatch::{DeliveryOutcome, Dispatcher, MessageHandler};

use crate::errors::BusError;
use crate::workflow::{PhaseCategory, Workflow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::Notify;
use uuid::Uuid;

/// Message priority. Strict ordering: a higher priority is always delivered
/// before a lower one that is queued at the same time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    Normal,
    Low,
}

impl Priority {
    /// All priorities, highest first. Drain order for the dispatcher.
    pub const ALL: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }
}

/// Kind of message routed by the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Execution,
    Handoff,
    ApprovalRequest,
    ApprovalDecision,
    Notification,
    Error,
}

impl MessageType {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Execution => "execution",
            Self::Handoff => "handoff",
            Self::ApprovalRequest => "approval_request",
            Self::ApprovalDecision => "approval_decision",
            Self::Notification => "notification",
            Self::Error => "error",
        }
    }
}

/// A routable work unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub message_id: Uuid,
    pub message_type: MessageType,
    pub priority: Priority,
    /// Set when the caller pinned the priority; otherwise the bus applies the
    /// workflow's phase default at publish time.
    #[serde(default)]
    pub priority_override: bool,
    pub from_phase: Option<u32>,
    pub to_phase: Option<u32>,
    #[serde(default)]
    pub to_agents: Vec<String>,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
}

impl Message {
    fn base(message_type: MessageType) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            message_type,
            priority: Priority::Normal,
            priority_override: false,
            from_phase: None,
            to_phase: None,
            to_agents: Vec::new(),
            payload: serde_json::Value::Null,
            retry_count: 0,
            max_retries: 3,
            created_at: Utc::now(),
        }
    }

    /// An execution order for one agent in one phase.
    pub fn execution(phase: u32, agent_id: &str, payload: ExecutionPayload) -> Self {
        let mut msg = Self::base(MessageType::Execution);
        msg.to_phase = Some(phase);
        msg.to_agents = vec![agent_id.to_string()];
        msg.payload = serde_json::to_value(payload).unwrap_or_default();
        msg
    }

    /// An artifact handoff between two phases.
    pub fn handoff(from_phase: u32, to_phase: u32, payload: HandoffPayload) -> Self {
        let mut msg = Self::base(MessageType::Handoff);
        msg.from_phase = Some(from_phase);
        msg.to_phase = Some(to_phase);
        msg.payload = serde_json::to_value(payload).unwrap_or_default();
        msg
    }

    /// An approval request for a gated phase.
    pub fn approval_request(phase: u32, request_id: Uuid) -> Self {
        let mut msg = Self::base(MessageType::ApprovalRequest);
        msg.to_phase = Some(phase);
        msg.priority = Priority::Critical;
        msg.priority_override = true;
        msg.payload = serde_json::to_value(ApprovalRequestPayload { request_id, phase })
            .unwrap_or_default();
        msg
    }

    /// An approval decision answering a prior request.
    pub fn approval_decision(request_id: Uuid, approved: bool, notes: Option<String>) -> Self {
        let mut msg = Self::base(MessageType::ApprovalDecision);
        msg.priority = Priority::Critical;
        msg.priority_override = true;
        msg.payload = serde_json::to_value(ApprovalDecisionPayload {
            request_id,
            approved,
            notes,
        })
        .unwrap_or_default();
        msg
    }

    /// A broadcast notification. With no recipients, the bus fans out to all
    /// subscribers of the target phase's category.
    pub fn notification(to_phase: Option<u32>, payload: serde_json::Value) -> Self {
        let mut msg = Self::base(MessageType::Notification);
        msg.to_phase = to_phase;
        msg.payload = payload;
        msg
    }

    /// An error surfaced to escalation subscribers.
    pub fn error(payload: ErrorPayload) -> Self {
        let mut msg = Self::base(MessageType::Error);
        msg.from_phase = payload.phase;
        msg.priority = Priority::Critical;
        msg.priority_override = true;
        msg.payload = serde_json::to_value(payload).unwrap_or_default();
        msg
    }

    /// Pin an explicit priority instead of the phase default.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self.priority_override = true;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// Payload of an EXECUTION message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPayload {
    pub phase: u32,
    pub agent_id: String,
    pub task_id: Uuid,
    pub inputs: serde_json::Value,
}

/// Payload of a HANDOFF message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffPayload {
    pub from_phase: u32,
    pub to_phase: u32,
    pub artifact_id: String,
}

/// Payload of an APPROVAL_REQUEST message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequestPayload {
    pub request_id: Uuid,
    pub phase: u32,
}

/// Payload of an APPROVAL_DECISION message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalDecisionPayload {
    pub request_id: Uuid,
    pub approved: bool,
    pub notes: Option<String>,
}

/// Payload of an ERROR message published toward escalation subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub phase: Option<u32>,
    pub agent_id: Option<String>,
    pub kind: String,
    pub message: String,
    pub retries_exhausted: bool,
}

/// A message parked in the dead-letter queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub message: Message,
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}

/// Observable bus counters. Enqueue/dequeue per priority, delivery outcomes
/// per message type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BusCountersSnapshot {
    pub enqueued_by_priority: BTreeMap<String, u64>,
    pub dequeued_by_priority: BTreeMap<String, u64>,
    pub delivered_by_type: BTreeMap<String, u64>,
    pub failed_by_type: BTreeMap<String, u64>,
    pub retried_by_type: BTreeMap<String, u64>,
    pub dead_lettered_by_type: BTreeMap<String, u64>,
    pub enqueued_total: u64,
    pub delivered_total: u64,
    pub retried_total: u64,
    pub dead_letter_total: u64,
}

impl BusCountersSnapshot {
    fn bump(map: &mut BTreeMap<String, u64>, key: &str) {
        *map.entry(key.to_string()).or_default() += 1;
    }
}

/// Bus tuning knobs.
#[derive(Debug, Clone)]
pub struct BusConfig {
    pub base_backoff: Duration,
    pub backoff_cap: Duration,
    pub default_max_retries: u32,
    /// Minimum dispatch loop tick.
    pub tick: Duration,
    pub approval_timeout: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            base_backoff: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(30),
            default_max_retries: 3,
            tick: Duration::from_millis(100),
            approval_timeout: Duration::from_secs(300),
        }
    }
}

impl BusConfig {
    pub fn with_backoff(mut self, base: Duration, cap: Duration) -> Self {
        self.base_backoff = base;
        self.backoff_cap = cap;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.default_max_retries = max_retries;
        self
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn with_approval_timeout(mut self, timeout: Duration) -> Self {
        self.approval_timeout = timeout;
        self
    }
}

/// What the bus decided to do with a failed delivery.
#[derive(Debug)]
pub enum RetryDisposition {
    /// Re-enqueue after the given backoff. The caller owns the sleep.
    Requeue { message: Message, backoff: Duration },
    /// Budget exhausted; message parked in the DLQ.
    DeadLettered { message: Message },
}

#[derive(Default)]
struct BusState {
    queues: BTreeMap<Priority, VecDeque<Message>>,
    dead_letters: Vec<DeadLetter>,
    counters: BusCountersSnapshot,
    category_subs: HashMap<PhaseCategory, Vec<mpsc::UnboundedSender<Message>>>,
    escalation_subs: Vec<mpsc::UnboundedSender<Message>>,
    draining: bool,
}

/// The message bus. Shared-mutable; all access goes through the internal lock.
pub struct MessageBus {
    workflow: Arc<Workflow>,
    config: BusConfig,
    state: Mutex<BusState>,
    notify: Notify,
    in_flight: AtomicUsize,
    pending_retries: AtomicUsize,
}

impl MessageBus {
    pub fn new(workflow: Arc<Workflow>, config: BusConfig) -> Self {
        Self {
            workflow,
            config,
            state: Mutex::new(BusState::default()),
            notify: Notify::new(),
            in_flight: AtomicUsize::new(0),
            pending_retries: AtomicUsize::new(0),
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn workflow(&self) -> &Arc<Workflow> {
        &self.workflow
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Enqueue a message. Handoffs are validated against the workflow's
    /// transition table; the phase default priority applies unless pinned.
    pub fn publish(&self, mut message: Message) -> Result<Uuid, BusError> {
        if message.message_type == MessageType::Handoff {
            let (from, to) = match (message.from_phase, message.to_phase) {
                (Some(from), Some(to)) => (from, to),
                _ => return Err(BusError::IncompleteHandoff),
            };
            self.workflow.is_transition_allowed(from, to)?;
        }

        if !message.priority_override {
            if let Some(phase) = message.to_phase {
                if let Ok(priority) = self.workflow.priority_for(phase) {
                    message.priority = priority;
                }
            }
        }

        let mut state = self.lock();
        if state.draining {
            return Err(BusError::Draining);
        }
        let id = message.message_id;
        BusCountersSnapshot::bump(
            &mut state.counters.enqueued_by_priority,
            message.priority.label(),
        );
        state.counters.enqueued_total += 1;
        tracing::debug!(
            message_id = %id,
            message_type = message.message_type.label(),
            priority = message.priority.label(),
            "message enqueued"
        );
        state
            .queues
            .entry(message.priority)
            .or_default()
            .push_back(message);
        drop(state);
        self.notify.notify_one();
        Ok(id)
    }

    /// Pop the next message: highest priority first, FIFO within a priority.
    /// Marks the message in flight until the delivery completes.
    pub fn pop_next(&self) -> Option<Message> {
        let mut state = self.lock();
        for priority in Priority::ALL {
            if let Some(queue) = state.queues.get_mut(&priority) {
                if let Some(message) = queue.pop_front() {
                    BusCountersSnapshot::bump(
                        &mut state.counters.dequeued_by_priority,
                        priority.label(),
                    );
                    self.in_flight.fetch_add(1, Ordering::SeqCst);
                    return Some(message);
                }
            }
        }
        None
    }

    /// Record a completed delivery (successful or terminally failed) and
    /// release the in-flight slot.
    pub fn finish_delivery(&self, message: &Message, delivered: bool) {
        let mut state = self.lock();
        let map = if delivered {
            &mut state.counters.delivered_by_type
        } else {
            &mut state.counters.failed_by_type
        };
        BusCountersSnapshot::bump(map, message.message_type.label());
        if delivered {
            state.counters.delivered_total += 1;
        }
        drop(state);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    /// Release the in-flight slot for a message that was withheld from its
    /// handler (e.g. a denied approval gate).
    pub fn abandon_delivery(&self, message: &Message) {
        let mut state = self.lock();
        BusCountersSnapshot::bump(
            &mut state.counters.failed_by_type,
            message.message_type.label(),
        );
        drop(state);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    /// Apply retry accounting to a failed delivery.
    ///
    /// Increments `retry_count`; once it exceeds `max_retries` the message is
    /// parked in the DLQ (so a dead-lettered message always carries
    /// `retry_count == max_retries + 1`). Otherwise the caller receives the
    /// message back with the backoff to sleep before [`Self::requeue`].
    /// `backoff_multiplier` widens the backoff for rate-limited failures.
    pub fn prepare_retry(
        &self,
        mut message: Message,
        reason: &str,
        backoff_multiplier: u32,
    ) -> RetryDisposition {
        message.retry_count += 1;
        let mut state = self.lock();
        if message.retry_count > message.max_retries {
            BusCountersSnapshot::bump(
                &mut state.counters.dead_lettered_by_type,
                message.message_type.label(),
            );
            state.counters.dead_letter_total += 1;
            state.dead_letters.push(DeadLetter {
                message: message.clone(),
                reason: reason.to_string(),
                dead_lettered_at: Utc::now(),
            });
            drop(state);
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            tracing::warn!(message_id = %message.message_id, reason, "message dead-lettered");
            RetryDisposition::DeadLettered { message }
        } else {
            BusCountersSnapshot::bump(
                &mut state.counters.retried_by_type,
                message.message_type.label(),
            );
            state.counters.retried_total += 1;
            drop(state);
            self.pending_retries.fetch_add(1, Ordering::SeqCst);
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            let backoff = self.backoff_for(message.retry_count, backoff_multiplier);
            RetryDisposition::Requeue { message, backoff }
        }
    }

    /// Re-enqueue a message after its retry backoff elapsed. Dropped silently
    /// when the bus is draining.
    pub fn requeue(&self, message: Message) {
        self.pending_retries.fetch_sub(1, Ordering::SeqCst);
        let mut state = self.lock();
        if state.draining {
            return;
        }
        state
            .queues
            .entry(message.priority)
            .or_default()
            .push_back(message);
        drop(state);
        self.notify.notify_one();
    }

    /// Exponential backoff: `min(base * 2^(retry_count - 1), cap)`.
    pub fn backoff_for(&self, retry_count: u32, multiplier: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1).min(16);
        let base = self.config.base_backoff * multiplier.max(1);
        let backoff = base.saturating_mul(2u32.saturating_pow(exponent));
        backoff.min(self.config.backoff_cap)
    }

    /// Subscribe to broadcast notifications for one phase category.
    pub fn subscribe(&self, category: PhaseCategory) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().category_subs.entry(category).or_default().push(tx);
        rx
    }

    /// Subscribe to escalation ERROR messages.
    pub fn subscribe_escalation(&self) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().escalation_subs.push(tx);
        rx
    }

    /// Fan a notification out to subscribers of `category` (or everyone when
    /// no category applies).
    pub fn forward_to_category(&self, category: Option<PhaseCategory>, message: &Message) {
        let state = self.lock();
        match category {
            Some(category) => {
                if let Some(subs) = state.category_subs.get(&category) {
                    for tx in subs {
                        let _ = tx.send(message.clone());
                    }
                }
            }
            None => {
                for subs in state.category_subs.values() {
                    for tx in subs {
                        let _ = tx.send(message.clone());
                    }
                }
            }
        }
    }

    /// Deliver a copy of an ERROR message to every escalation subscriber.
    pub fn forward_escalation(&self, message: &Message) {
        let state = self.lock();
        for tx in &state.escalation_subs {
            let _ = tx.send(message.clone());
        }
    }

    /// Drop every queued message except the DLQ and refuse new publishes.
    /// Returns the number of flushed messages.
    pub fn drain(&self) -> usize {
        let mut state = self.lock();
        state.draining = true;
        let flushed = state.queues.values().map(VecDeque::len).sum();
        state.queues.clear();
        flushed
    }

    /// True when nothing is queued, in flight, or awaiting a retry backoff.
    pub fn is_idle(&self) -> bool {
        let queued: usize = {
            let state = self.lock();
            state.queues.values().map(VecDeque::len).sum()
        };
        queued == 0
            && self.in_flight.load(Ordering::SeqCst) == 0
            && self.pending_retries.load(Ordering::SeqCst) == 0
    }

    pub fn queued_len(&self) -> usize {
        self.lock().queues.values().map(VecDeque::len).sum()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.lock().dead_letters.clone()
    }

    pub fn counters(&self) -> BusCountersSnapshot {
        self.lock().counters.clone()
    }

    /// Await a signal that a message may be available.
    pub async fn wait_for_message(&self) {
        self.notify.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::default_workflow;
    use serde_json::json;

    fn bus() -> MessageBus {
        MessageBus::new(Arc::new(default_workflow()), BusConfig::default())
    }

    fn exec_message(phase: u32) -> Message {
        Message::execution(
            phase,
            "agent",
            ExecutionPayload {
                phase,
                agent_id: "agent".into(),
                task_id: Uuid::new_v4(),
                inputs: json!({}),
            },
        )
    }

    #[test]
    fn fifo_within_priority() {
        let bus = bus();
        let first = bus.publish(exec_message(9).with_priority(Priority::Normal)).unwrap();
        let second = bus.publish(exec_message(9).with_priority(Priority::Normal)).unwrap();
        let third = bus.publish(exec_message(9).with_priority(Priority::Normal)).unwrap();

        assert_eq!(bus.pop_next().unwrap().message_id, first);
        assert_eq!(bus.pop_next().unwrap().message_id, second);
        assert_eq!(bus.pop_next().unwrap().message_id, third);
    }

    #[test]
    fn strict_priority_ordering() {
        let bus = bus();
        let low = bus.publish(exec_message(9).with_priority(Priority::Low)).unwrap();
        let normal = bus.publish(exec_message(9).with_priority(Priority::Normal)).unwrap();
        let critical = bus.publish(exec_message(9).with_priority(Priority::Critical)).unwrap();
        let high = bus.publish(exec_message(9).with_priority(Priority::High)).unwrap();

        assert_eq!(bus.pop_next().unwrap().message_id, critical);
        assert_eq!(bus.pop_next().unwrap().message_id, high);
        assert_eq!(bus.pop_next().unwrap().message_id, normal);
        assert_eq!(bus.pop_next().unwrap().message_id, low);
    }

    #[test]
    fn phase_default_priority_applied_unless_pinned() {
        let bus = bus();
        bus.publish(exec_message(0)).unwrap();
        let msg = bus.pop_next().unwrap();
        assert_eq!(msg.priority, Priority::Critical);
        bus.finish_delivery(&msg, true);

        bus.publish(exec_message(0).with_priority(Priority::Low)).unwrap();
        let pinned = bus.pop_next().unwrap();
        assert_eq!(pinned.priority, Priority::Low);
    }

    #[test]
    fn handoff_requires_allowed_transition() {
        let bus = bus();
        let ok = Message::handoff(
            0,
            1,
            HandoffPayload {
                from_phase: 0,
                to_phase: 1,
                artifact_id: "a".into(),
            },
        );
        assert!(bus.publish(ok).is_ok());

        let bad = Message::handoff(
            0,
            5,
            HandoffPayload {
                from_phase: 0,
                to_phase: 5,
                artifact_id: "a".into(),
            },
        );
        assert!(matches!(
            bus.publish(bad),
            Err(BusError::DisallowedTransition(_))
        ));
    }

    #[test]
    fn handoff_requires_both_endpoints() {
        let bus = bus();
        let mut msg = Message::base(MessageType::Handoff);
        msg.from_phase = Some(0);
        assert!(matches!(bus.publish(msg), Err(BusError::IncompleteHandoff)));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let bus = bus();
        assert_eq!(bus.backoff_for(1, 1), Duration::from_secs(1));
        assert_eq!(bus.backoff_for(2, 1), Duration::from_secs(2));
        assert_eq!(bus.backoff_for(3, 1), Duration::from_secs(4));
        assert_eq!(bus.backoff_for(10, 1), Duration::from_secs(30));
        // Rate-limited failures double the base.
        assert_eq!(bus.backoff_for(1, 2), Duration::from_secs(2));
    }

    #[test]
    fn retry_exhaustion_moves_to_dlq_with_final_count() {
        let bus = bus();
        let mut message = exec_message(9).with_max_retries(2);
        message = match bus.publish(message.clone()) {
            Ok(_) => bus.pop_next().unwrap(),
            Err(_) => panic!("publish failed"),
        };

        for expected in 1..=2u32 {
            match bus.prepare_retry(message, "transport failure", 1) {
                RetryDisposition::Requeue { message: m, .. } => {
                    assert_eq!(m.retry_count, expected);
                    bus.requeue(m);
                    message = bus.pop_next().unwrap();
                }
                RetryDisposition::DeadLettered { .. } => panic!("dead-lettered too early"),
            }
        }

        match bus.prepare_retry(message, "transport failure", 1) {
            RetryDisposition::DeadLettered { message } => {
                assert_eq!(message.retry_count, 3); // max_retries + 1
            }
            RetryDisposition::Requeue { .. } => panic!("expected dead letter"),
        }

        let dlq = bus.dead_letters();
        assert_eq!(dlq.len(), 1);
        assert_eq!(dlq[0].message.retry_count, 3);
        assert_eq!(bus.counters().dead_letter_total, 1);
        assert!(bus.is_idle());
    }

    #[test]
    fn drain_flushes_queues_but_keeps_dlq() {
        let bus = bus();
        // Park one dead letter.
        bus.publish(exec_message(9).with_max_retries(0)).unwrap();
        let msg = bus.pop_next().unwrap();
        let _ = bus.prepare_retry(msg, "boom", 1);

        bus.publish(exec_message(9)).unwrap();
        bus.publish(exec_message(10)).unwrap();
        assert_eq!(bus.drain(), 2);
        assert_eq!(bus.queued_len(), 0);
        assert_eq!(bus.dead_letters().len(), 1);
        assert!(matches!(bus.publish(exec_message(9)), Err(BusError::Draining)));
    }

    #[test]
    fn counters_track_traffic() {
        let bus = bus();
        bus.publish(exec_message(9)).unwrap();
        let msg = bus.pop_next().unwrap();
        bus.finish_delivery(&msg, true);

        let counters = bus.counters();
        assert_eq!(counters.enqueued_total, 1);
        assert_eq!(counters.delivered_total, 1);
        assert_eq!(counters.enqueued_by_priority.get("normal"), Some(&1));
        assert_eq!(counters.delivered_by_type.get("execution"), Some(&1));
    }

    #[test]
    fn notification_broadcast_reaches_category_subscribers() {
        let bus = bus();
        let mut rx = bus.subscribe(PhaseCategory::Implementation);
        let msg = Message::notification(Some(9), json!({"note": "hello"}));
        bus.forward_to_category(Some(PhaseCategory::Implementation), &msg);
        let received = rx.try_recv().unwrap();
        assert_eq!(received.payload["note"], "hello");
    }

    #[test]
    fn escalation_subscribers_receive_error_copies() {
        let bus = bus();
        let mut rx = bus.subscribe_escalation();
        let msg = Message::error(ErrorPayload {
            phase: Some(3),
            agent_id: Some("agent".into()),
            kind: "transport".into(),
            message: "boom".into(),
            retries_exhausted: true,
        });
        bus.forward_escalation(&msg);
        let received = rx.try_recv().unwrap();
        assert_eq!(received.message_type, MessageType::Error);
    }
}
