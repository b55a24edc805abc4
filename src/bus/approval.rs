//! Approval gate plumbing: single-shot decision channels per request.
//!
//! The dispatcher registers a request before emitting APPROVAL_REQUEST and
//! awaits the matching decision with a timeout. Decisions arrive either as
//! APPROVAL_DECISION messages on the bus or as JSON files dropped into the
//! approvals directory by `conductor approval decide`.

use crate::errors::BusError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// What happens when an approval gate times out. Blocking is the default;
/// auto-approval is an explicit opt-in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalTimeoutPolicy {
    #[default]
    Block,
    AutoApprove,
}

/// A decision for one approval request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum ApprovalSignal {
    Approved { notes: Option<String> },
    Rejected { notes: Option<String> },
}

/// Outcome of waiting at an approval gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalOutcome {
    Approved,
    Rejected { notes: Option<String> },
    /// No decision arrived inside the approval timeout. Policy: block.
    TimedOut,
}

#[derive(Default)]
struct BrokerState {
    pending: HashMap<Uuid, oneshot::Sender<ApprovalSignal>>,
    /// Requests that were registered at some point; guards against decisions
    /// for ids that never existed.
    known: HashMap<Uuid, bool>,
}

/// Routes approval decisions to the gate waiting on them.
#[derive(Default)]
pub struct ApprovalBroker {
    state: Mutex<BrokerState>,
}

impl ApprovalBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register a new request and get the receiver its decision resolves.
    pub fn register(&self, request_id: Uuid) -> oneshot::Receiver<ApprovalSignal> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.lock();
        state.pending.insert(request_id, tx);
        state.known.insert(request_id, false);
        rx
    }

    /// Resolve a pending request. A decision with no prior request is an
    /// error; a second decision for the same request is an error.
    pub fn decide(&self, request_id: Uuid, signal: ApprovalSignal) -> Result<(), BusError> {
        let mut state = self.lock();
        match state.known.get(&request_id) {
            None => return Err(BusError::UnknownApprovalRequest(request_id)),
            Some(true) => return Err(BusError::ApprovalAlreadyDecided(request_id)),
            Some(false) => {}
        }
        state.known.insert(request_id, true);
        if let Some(tx) = state.pending.remove(&request_id) {
            // Receiver may have timed out and dropped; the decision still
            // counts as consumed.
            let _ = tx.send(signal);
        }
        Ok(())
    }

    /// Await the decision for `request_id`, bounded by `timeout` and the run
    /// cancellation token.
    pub async fn await_decision(
        &self,
        rx: oneshot::Receiver<ApprovalSignal>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> ApprovalOutcome {
        tokio::select! {
            signal = rx => match signal {
                Ok(ApprovalSignal::Approved { .. }) => ApprovalOutcome::Approved,
                Ok(ApprovalSignal::Rejected { notes }) => ApprovalOutcome::Rejected { notes },
                Err(_) => ApprovalOutcome::TimedOut,
            },
            _ = tokio::time::sleep(timeout) => ApprovalOutcome::TimedOut,
            _ = cancel.cancelled() => ApprovalOutcome::TimedOut,
        }
    }

    /// Poll `dir` for decision files named `<request_id>.json` and resolve
    /// them. Files are consumed (removed) once applied. Runs until cancelled.
    pub fn watch_directory(
        self: &std::sync::Arc<Self>,
        dir: PathBuf,
        interval: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let broker = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                broker.sweep_directory(&dir);
            }
        })
    }

    fn sweep_directory(&self, dir: &PathBuf) {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(_) => return,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().map(|e| e == "json") != Some(true) {
                continue;
            }
            let stem = match path.file_stem().and_then(|s| s.to_str()) {
                Some(stem) => stem,
                None => continue,
            };
            let request_id = match Uuid::parse_str(stem) {
                Ok(id) => id,
                Err(_) => continue,
            };
            let signal: ApprovalSignal = match std::fs::read_to_string(&path)
                .ok()
                .and_then(|content| serde_json::from_str(&content).ok())
            {
                Some(signal) => signal,
                None => continue,
            };
            match self.decide(request_id, signal) {
                Ok(()) => {
                    let _ = std::fs::remove_file(&path);
                    tracing::info!(%request_id, "approval decision applied from file");
                }
                Err(BusError::UnknownApprovalRequest(_)) => {
                    // Leave the file for a broker that knows the request.
                }
                Err(_) => {
                    let _ = std::fs::remove_file(&path);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn decision_resolves_waiting_gate() {
        let broker = ApprovalBroker::new();
        let request_id = Uuid::new_v4();
        let rx = broker.register(request_id);

        broker
            .decide(request_id, ApprovalSignal::Approved { notes: None })
            .unwrap();

        let cancel = CancellationToken::new();
        let outcome = broker
            .await_decision(rx, Duration::from_secs(1), &cancel)
            .await;
        assert_eq!(outcome, ApprovalOutcome::Approved);
    }

    #[tokio::test]
    async fn rejection_carries_notes() {
        let broker = ApprovalBroker::new();
        let request_id = Uuid::new_v4();
        let rx = broker.register(request_id);
        broker
            .decide(
                request_id,
                ApprovalSignal::Rejected {
                    notes: Some("needs rework".into()),
                },
            )
            .unwrap();

        let cancel = CancellationToken::new();
        let outcome = broker
            .await_decision(rx, Duration::from_secs(1), &cancel)
            .await;
        assert_eq!(
            outcome,
            ApprovalOutcome::Rejected {
                notes: Some("needs rework".into())
            }
        );
    }

    #[tokio::test]
    async fn gate_times_out_without_decision() {
        let broker = ApprovalBroker::new();
        let rx = broker.register(Uuid::new_v4());
        let cancel = CancellationToken::new();
        let outcome = broker
            .await_decision(rx, Duration::from_millis(20), &cancel)
            .await;
        assert_eq!(outcome, ApprovalOutcome::TimedOut);
    }

    #[test]
    fn decision_without_request_is_rejected() {
        let broker = ApprovalBroker::new();
        let err = broker.decide(Uuid::new_v4(), ApprovalSignal::Approved { notes: None });
        assert!(matches!(err, Err(BusError::UnknownApprovalRequest(_))));
    }

    #[test]
    fn second_decision_is_rejected() {
        let broker = ApprovalBroker::new();
        let request_id = Uuid::new_v4();
        let _rx = broker.register(request_id);
        broker
            .decide(request_id, ApprovalSignal::Approved { notes: None })
            .unwrap();
        let err = broker.decide(request_id, ApprovalSignal::Approved { notes: None });
        assert!(matches!(err, Err(BusError::ApprovalAlreadyDecided(_))));
    }

    #[tokio::test]
    async fn directory_sweep_applies_decision_files() {
        let dir = tempfile::tempdir().unwrap();
        let broker = Arc::new(ApprovalBroker::new());
        let request_id = Uuid::new_v4();
        let rx = broker.register(request_id);

        let file = dir.path().join(format!("{request_id}.json"));
        std::fs::write(&file, r#"{"outcome":"approved","notes":null}"#).unwrap();

        broker.sweep_directory(&dir.path().to_path_buf());
        assert!(!file.exists());

        let cancel = CancellationToken::new();
        let outcome = broker
            .await_decision(rx, Duration::from_secs(1), &cancel)
            .await;
        assert_eq!(outcome, ApprovalOutcome::Approved);
    }

    #[tokio::test]
    async fn sweep_ignores_unknown_requests() {
        let dir = tempfile::tempdir().unwrap();
        let broker = Arc::new(ApprovalBroker::new());
        let file = dir.path().join(format!("{}.json", Uuid::new_v4()));
        std::fs::write(&file, r#"{"outcome":"approved","notes":null}"#).unwrap();

        broker.sweep_directory(&dir.path().to_path_buf());
        // File is left in place for the broker owning the request.
        assert!(file.exists());
    }
}
