//! Result handler and decision engine.
//!
//! Maps `(execution outcome, error pattern, retry budget)` to the next
//! action. Schema validation runs before anything else and is never retried.
//! Each decision carries a seeded confidence score and a unique id; executed
//! decisions record exactly one outcome.

use crate::exec::{InvocationResult, InvokeErrorKind};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, OnceLock};
use uuid::Uuid;

/// Error taxonomy driving recovery policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    Transport,
    SchemaInvalid,
    AgentInternal,
    DependencyMissing,
    RateLimited,
    DisallowedTransition,
    Unknown,
}

impl ErrorKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Transport => "transport",
            Self::SchemaInvalid => "schema_invalid",
            Self::AgentInternal => "agent_internal",
            Self::DependencyMissing => "dependency_missing",
            Self::RateLimited => "rate_limited",
            Self::DisallowedTransition => "disallowed_transition",
            Self::Unknown => "unknown",
        }
    }
}

/// The action the coordinator takes next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NextAction {
    Proceed,
    Retry,
    Block,
    Escalate,
    Skip,
}

/// Outcome recorded against an executed decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionOutcome {
    /// The recommended action led to recovery.
    Recovered,
    /// The failure stuck; the phase went down.
    Failed,
}

/// Retry allowance for one error kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryBudget {
    /// Retry at most this many times, then take the terminal action.
    Fixed(u32),
    /// Always recommend retry; the message's own `max_retries` governs, and
    /// exhaustion surfaces through the bus dead-letter path.
    MessageBudget,
}

/// Per-kind recovery policy. Seed values are tunable via
/// [`DecisionEngine::with_policy`].
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub retry_budget: RetryBudget,
    /// Backoff widening factor handed to the bus (rate limits use 2).
    pub backoff_multiplier: u32,
    /// Seeded confidence in the classification → action mapping.
    pub confidence: f64,
    /// Action once the budget is exhausted (or immediately when budget is 0).
    pub terminal_action: NextAction,
}

/// One classification + recommendation, with its eventual outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub decision_id: Uuid,
    pub kind: ErrorKind,
    pub action: NextAction,
    pub confidence: f64,
    pub attempt: u32,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub outcome: Option<DecisionOutcome>,
}

/// Classifies failures and recommends next actions.
pub struct DecisionEngine {
    policies: HashMap<ErrorKind, RetryPolicy>,
    decisions: Mutex<HashMap<Uuid, Decision>>,
}

impl Default for DecisionEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl DecisionEngine {
    /// Engine with the seed policy table.
    ///
    /// Transport-class kinds (timeout, transport, rate-limited) defer to the
    /// message's retry budget so exhaustion runs through the bus dead-letter
    /// path; the rest carry fixed budgets.
    pub fn new() -> Self {
        let mut policies = HashMap::new();
        policies.insert(
            ErrorKind::Timeout,
            RetryPolicy {
                retry_budget: RetryBudget::MessageBudget,
                backoff_multiplier: 1,
                confidence: 0.8,
                terminal_action: NextAction::Escalate,
            },
        );
        policies.insert(
            ErrorKind::Transport,
            RetryPolicy {
                retry_budget: RetryBudget::MessageBudget,
                backoff_multiplier: 1,
                confidence: 0.75,
                terminal_action: NextAction::Escalate,
            },
        );
        policies.insert(
            ErrorKind::RateLimited,
            RetryPolicy {
                retry_budget: RetryBudget::MessageBudget,
                backoff_multiplier: 2,
                confidence: 0.9,
                terminal_action: NextAction::Escalate,
            },
        );
        policies.insert(
            ErrorKind::AgentInternal,
            RetryPolicy {
                retry_budget: RetryBudget::Fixed(1),
                backoff_multiplier: 1,
                confidence: 0.6,
                terminal_action: NextAction::Escalate,
            },
        );
        policies.insert(
            ErrorKind::SchemaInvalid,
            RetryPolicy {
                retry_budget: RetryBudget::Fixed(0),
                backoff_multiplier: 1,
                confidence: 0.95,
                terminal_action: NextAction::Escalate,
            },
        );
        policies.insert(
            ErrorKind::DependencyMissing,
            RetryPolicy {
                retry_budget: RetryBudget::Fixed(0),
                backoff_multiplier: 1,
                confidence: 0.85,
                terminal_action: NextAction::Block,
            },
        );
        policies.insert(
            ErrorKind::DisallowedTransition,
            RetryPolicy {
                retry_budget: RetryBudget::Fixed(0),
                backoff_multiplier: 1,
                confidence: 1.0,
                terminal_action: NextAction::Block,
            },
        );
        policies.insert(
            ErrorKind::Unknown,
            RetryPolicy {
                retry_budget: RetryBudget::Fixed(1),
                backoff_multiplier: 1,
                confidence: 0.5,
                terminal_action: NextAction::Escalate,
            },
        );
        Self {
            policies,
            decisions: Mutex::new(HashMap::new()),
        }
    }

    /// Override one kind's policy.
    pub fn with_policy(mut self, kind: ErrorKind, policy: RetryPolicy) -> Self {
        self.policies.insert(kind, policy);
        self
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, Decision>> {
        match self.decisions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn policy(&self, kind: ErrorKind) -> RetryPolicy {
        self.policies.get(&kind).copied().unwrap_or(RetryPolicy {
            retry_budget: RetryBudget::Fixed(1),
            backoff_multiplier: 1,
            confidence: 0.5,
            terminal_action: NextAction::Escalate,
        })
    }

    /// Backoff widening for a kind (handed to the bus on retry).
    pub fn backoff_multiplier(&self, kind: ErrorKind) -> u32 {
        self.policy(kind).backoff_multiplier
    }

    /// Classify a failed invocation. `validation_errors` wins over everything
    /// else; otherwise transport failures map directly and agent output is
    /// matched against the error pattern table.
    pub fn classify(
        &self,
        result: &InvocationResult,
        validation_errors: Option<&[String]>,
    ) -> Option<ErrorKind> {
        if validation_errors.map(|v| !v.is_empty()).unwrap_or(false) {
            return Some(ErrorKind::SchemaInvalid);
        }
        if result.ok {
            return None;
        }
        if let Some(failure) = &result.failure {
            return Some(match failure.kind {
                InvokeErrorKind::Timeout => ErrorKind::Timeout,
                InvokeErrorKind::Transport => ErrorKind::Transport,
                // Cancellation is not an error pattern; callers check
                // `result.cancelled()` before classifying.
                InvokeErrorKind::Cancelled => ErrorKind::Unknown,
            });
        }
        if result.http_status == Some(429) {
            return Some(ErrorKind::RateLimited);
        }

        let text = format!("{}\n{}", result.stderr, result.stdout);
        Some(classify_text(&text))
    }

    /// Recommend the next action for a classified failure on attempt N
    /// (1-based). Retries used so far = N - 1.
    pub fn decide(&self, kind: ErrorKind, attempt: u32) -> Decision {
        let policy = self.policy(kind);
        let retries_used = attempt.saturating_sub(1);
        let action = match policy.retry_budget {
            RetryBudget::MessageBudget => NextAction::Retry,
            RetryBudget::Fixed(budget) if retries_used < budget => NextAction::Retry,
            RetryBudget::Fixed(_) => policy.terminal_action,
        };
        let decision = Decision {
            decision_id: Uuid::new_v4(),
            kind,
            action,
            confidence: policy.confidence,
            attempt,
            created_at: chrono::Utc::now(),
            outcome: None,
        };
        self.lock().insert(decision.decision_id, decision.clone());
        tracing::debug!(
            decision_id = %decision.decision_id,
            kind = kind.label(),
            action = ?action,
            attempt,
            "decision recorded"
        );
        decision
    }

    /// Record the single outcome of an executed decision.
    pub fn record_outcome(
        &self,
        decision_id: Uuid,
        outcome: DecisionOutcome,
    ) -> anyhow::Result<()> {
        let mut decisions = self.lock();
        let decision = decisions
            .get_mut(&decision_id)
            .ok_or_else(|| anyhow::anyhow!("unknown decision {decision_id}"))?;
        if decision.outcome.is_some() {
            anyhow::bail!("decision {decision_id} already has an outcome");
        }
        decision.outcome = Some(outcome);
        Ok(())
    }

    /// All decisions taken so far.
    pub fn decisions(&self) -> Vec<Decision> {
        let mut all: Vec<Decision> = self.lock().values().cloned().collect();
        all.sort_by_key(|d| d.created_at);
        all
    }
}

struct PatternTable {
    rate_limited: Regex,
    timeout: Regex,
    transport: Regex,
    dependency_missing: Regex,
    agent_internal: Regex,
}

fn patterns() -> &'static PatternTable {
    static TABLE: OnceLock<PatternTable> = OnceLock::new();
    TABLE.get_or_init(|| {
        let build = |pattern: &str| {
            Regex::new(pattern).unwrap_or_else(|err| unreachable!("bad pattern: {err}"))
        };
        PatternTable {
            rate_limited: build(r"(?i)rate.?limit|too many requests|\b429\b"),
            timeout: build(r"(?i)timed?\s?out|deadline exceeded"),
            transport: build(r"(?i)connection (refused|reset)|unreachable|broken pipe|dns"),
            dependency_missing: build(
                r"(?i)(dependency|artifact|predecessor)[^\n]*(missing|not found|absent)",
            ),
            agent_internal: build(r#""error""#),
        }
    })
}

/// Pattern-match free-form agent output into an error kind.
fn classify_text(text: &str) -> ErrorKind {
    let table = patterns();
    if table.rate_limited.is_match(text) {
        ErrorKind::RateLimited
    } else if table.timeout.is_match(text) {
        ErrorKind::Timeout
    } else if table.transport.is_match(text) {
        ErrorKind::Transport
    } else if table.dependency_missing.is_match(text) {
        ErrorKind::DependencyMissing
    } else if table.agent_internal.is_match(text) || !text.trim().is_empty() {
        ErrorKind::AgentInternal
    } else {
        ErrorKind::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::InvocationFailure;

    fn failed_result(stderr: &str) -> InvocationResult {
        InvocationResult {
            ok: false,
            exit_code: Some(1),
            http_status: None,
            stdout: String::new(),
            stderr: stderr.to_string(),
            duration_ms: 10,
            failure: None,
        }
    }

    #[test]
    fn validation_failure_wins_over_everything() {
        let engine = DecisionEngine::new();
        let ok_result = InvocationResult {
            ok: true,
            exit_code: Some(0),
            http_status: None,
            stdout: "{}".into(),
            stderr: String::new(),
            duration_ms: 1,
            failure: None,
        };
        let errors = vec!["missing key".to_string()];
        assert_eq!(
            engine.classify(&ok_result, Some(&errors)),
            Some(ErrorKind::SchemaInvalid)
        );
    }

    #[test]
    fn transport_failure_maps_directly() {
        let engine = DecisionEngine::new();
        let mut result = failed_result("");
        result.failure = Some(InvocationFailure {
            kind: InvokeErrorKind::Timeout,
            message: "slow".into(),
        });
        assert_eq!(engine.classify(&result, None), Some(ErrorKind::Timeout));
    }

    #[test]
    fn http_429_is_rate_limited() {
        let engine = DecisionEngine::new();
        let mut result = failed_result("");
        result.http_status = Some(429);
        assert_eq!(engine.classify(&result, None), Some(ErrorKind::RateLimited));
    }

    #[test]
    fn stderr_patterns_classify() {
        let engine = DecisionEngine::new();
        assert_eq!(
            engine.classify(&failed_result("upstream rate limit exceeded"), None),
            Some(ErrorKind::RateLimited)
        );
        assert_eq!(
            engine.classify(&failed_result("request timed out after 30s"), None),
            Some(ErrorKind::Timeout)
        );
        assert_eq!(
            engine.classify(&failed_result("connection refused by peer"), None),
            Some(ErrorKind::Transport)
        );
        assert_eq!(
            engine.classify(&failed_result("required artifact plan-v1 not found"), None),
            Some(ErrorKind::DependencyMissing)
        );
        assert_eq!(
            engine.classify(&failed_result("panic in agent worker"), None),
            Some(ErrorKind::AgentInternal)
        );
    }

    #[test]
    fn successful_result_yields_no_kind() {
        let engine = DecisionEngine::new();
        let result = InvocationResult {
            ok: true,
            exit_code: Some(0),
            http_status: None,
            stdout: "{}".into(),
            stderr: String::new(),
            duration_ms: 1,
            failure: None,
        };
        assert_eq!(engine.classify(&result, None), None);
    }

    #[test]
    fn timeout_defers_to_message_budget() {
        // The bus owns the retry count for transport-class kinds; the engine
        // keeps recommending retry and exhaustion dead-letters instead.
        let engine = DecisionEngine::new();
        assert_eq!(engine.decide(ErrorKind::Timeout, 1).action, NextAction::Retry);
        assert_eq!(engine.decide(ErrorKind::Timeout, 4).action, NextAction::Retry);
    }

    #[test]
    fn schema_invalid_never_retries() {
        let engine = DecisionEngine::new();
        let decision = engine.decide(ErrorKind::SchemaInvalid, 1);
        assert_eq!(decision.action, NextAction::Escalate);
        assert!(decision.confidence > 0.9);
    }

    #[test]
    fn dependency_missing_blocks() {
        let engine = DecisionEngine::new();
        assert_eq!(
            engine.decide(ErrorKind::DependencyMissing, 1).action,
            NextAction::Block
        );
    }

    #[test]
    fn agent_internal_retries_once() {
        let engine = DecisionEngine::new();
        assert_eq!(
            engine.decide(ErrorKind::AgentInternal, 1).action,
            NextAction::Retry
        );
        assert_eq!(
            engine.decide(ErrorKind::AgentInternal, 2).action,
            NextAction::Escalate
        );
    }

    #[test]
    fn rate_limited_widens_backoff() {
        let engine = DecisionEngine::new();
        assert_eq!(engine.backoff_multiplier(ErrorKind::RateLimited), 2);
        assert_eq!(engine.backoff_multiplier(ErrorKind::Timeout), 1);
    }

    #[test]
    fn outcome_recorded_exactly_once() {
        let engine = DecisionEngine::new();
        let decision = engine.decide(ErrorKind::Transport, 1);
        engine
            .record_outcome(decision.decision_id, DecisionOutcome::Recovered)
            .unwrap();
        assert!(engine
            .record_outcome(decision.decision_id, DecisionOutcome::Failed)
            .is_err());

        let stored = engine
            .decisions()
            .into_iter()
            .find(|d| d.decision_id == decision.decision_id)
            .unwrap();
        assert_eq!(stored.outcome, Some(DecisionOutcome::Recovered));
    }

    #[test]
    fn policy_override_applies() {
        let engine = DecisionEngine::new().with_policy(
            ErrorKind::Timeout,
            RetryPolicy {
                retry_budget: RetryBudget::Fixed(0),
                backoff_multiplier: 1,
                confidence: 0.4,
                terminal_action: NextAction::Block,
            },
        );
        assert_eq!(engine.decide(ErrorKind::Timeout, 1).action, NextAction::Block);
    }
}
