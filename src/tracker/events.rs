//! Append-only event log with monotone timestamps.
//!
//! Every run owns one [`EventLog`]. Events are never mutated or removed, and
//! the pair `(timestamp, seq)` is strictly increasing, so consumers can rely
//! on log order for causality within a run. An optional JSONL sink mirrors
//! events to `events/run.log` for post-mortem reads.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

/// Well-known event kinds emitted by the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "run.started")]
    RunStarted,
    #[serde(rename = "run.completed")]
    RunCompleted,
    #[serde(rename = "phase.started")]
    PhaseStarted,
    #[serde(rename = "phase.completed")]
    PhaseCompleted,
    #[serde(rename = "phase.failed")]
    PhaseFailed,
    #[serde(rename = "phase.skipped")]
    PhaseSkipped,
    #[serde(rename = "task.started")]
    TaskStarted,
    #[serde(rename = "task.state_changed")]
    TaskStateChanged,
    #[serde(rename = "handoff.completed")]
    HandoffCompleted,
    #[serde(rename = "error.recorded")]
    ErrorRecorded,
    #[serde(rename = "artifact.registered")]
    ArtifactRegistered,
    #[serde(rename = "approval.requested")]
    ApprovalRequested,
    #[serde(rename = "approval.decided")]
    ApprovalDecided,
    #[serde(rename = "message.dead_lettered")]
    MessageDeadLettered,
}

/// A single timestamped record in the run's event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Per-run sequence number, strictly increasing.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Component that emitted the event (tracker, bus, coordinator, ...).
    pub source: String,
    /// What the event is about: a phase number, execution id, artifact id.
    pub subject: String,
    #[serde(default)]
    pub attrs: serde_json::Value,
}

/// Append-only, totally ordered event log.
#[derive(Debug, Default)]
pub struct EventLog {
    events: Vec<Event>,
    next_seq: u64,
    last_timestamp: Option<DateTime<Utc>>,
    sink: Option<PathBuf>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mirror every appended event as a JSON line at `path`.
    pub fn with_sink(mut self, path: PathBuf) -> Self {
        self.sink = Some(path);
        self
    }

    /// Append an event, assigning the next sequence number and a timestamp
    /// strictly greater than the previous event's.
    pub fn append(
        &mut self,
        kind: EventKind,
        source: &str,
        subject: impl Into<String>,
        attrs: serde_json::Value,
    ) -> &Event {
        let now = Utc::now();
        let timestamp = match self.last_timestamp {
            Some(last) if now <= last => last + Duration::microseconds(1),
            _ => now,
        };
        self.last_timestamp = Some(timestamp);

        let event = Event {
            seq: self.next_seq,
            timestamp,
            kind,
            source: source.to_string(),
            subject: subject.into(),
            attrs,
        };
        self.next_seq += 1;

        if let Some(path) = &self.sink {
            if let Err(err) = append_line(path, &event) {
                tracing::warn!(error = %err, "failed to write event sink line");
            }
        }

        self.events.push(event);
        self.events.last().unwrap_or_else(|| unreachable!())
    }

    /// All events so far, in order.
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// Events strictly after `ts`, in order. Finite: events appended after
    /// this call are not included.
    pub fn events_since(&self, ts: DateTime<Utc>) -> Vec<Event> {
        self.events
            .iter()
            .filter(|e| e.timestamp > ts)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

fn append_line(path: &PathBuf, event: &Event) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    let line = serde_json::to_string(event)?;
    writeln!(file, "{line}")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sequence_numbers_increase() {
        let mut log = EventLog::new();
        log.append(EventKind::RunStarted, "tracker", "run-1", json!({}));
        log.append(EventKind::PhaseStarted, "tracker", "0", json!({}));
        log.append(EventKind::PhaseCompleted, "tracker", "0", json!({}));

        let seqs: Vec<u64> = log.events().iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    #[test]
    fn timestamps_strictly_increase() {
        let mut log = EventLog::new();
        for i in 0..50 {
            log.append(EventKind::TaskStateChanged, "tracker", i.to_string(), json!({}));
        }
        for pair in log.events().windows(2) {
            assert!(pair[0].timestamp < pair[1].timestamp);
        }
    }

    #[test]
    fn events_since_filters_by_timestamp() {
        let mut log = EventLog::new();
        log.append(EventKind::RunStarted, "tracker", "run-1", json!({}));
        let cutoff = log.events()[0].timestamp;
        log.append(EventKind::PhaseStarted, "tracker", "0", json!({}));
        log.append(EventKind::PhaseCompleted, "tracker", "0", json!({}));

        let later = log.events_since(cutoff);
        assert_eq!(later.len(), 2);
        assert_eq!(later[0].kind, EventKind::PhaseStarted);
    }

    #[test]
    fn event_kind_serializes_dotted() {
        let json = serde_json::to_string(&EventKind::PhaseCompleted).unwrap();
        assert_eq!(json, "\"phase.completed\"");
    }

    #[test]
    fn sink_writes_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events").join("run.log");
        let mut log = EventLog::new().with_sink(path.clone());
        log.append(EventKind::RunStarted, "tracker", "run-1", json!({"plan": "p"}));
        log.append(EventKind::RunCompleted, "tracker", "run-1", json!({}));

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: Event = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.kind, EventKind::RunStarted);
    }
}
