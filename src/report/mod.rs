//! Report generation over a frozen run snapshot.
//!
//! Builders are pure functions of the snapshot; renderers are pure functions
//! of the report object. Nothing here touches live tracker state.

use crate::tracker::{percentile, PhaseState, RunSnapshot, TaskState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Report flavors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportKind {
    Status,
    Completion,
    Performance,
    Error,
}

impl ReportKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::Completion => "completion",
            Self::Performance => "performance",
            Self::Error => "error",
        }
    }
}

/// Output format chosen by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReportFormat {
    #[default]
    Structured,
    Markdown,
    Plain,
}

impl ReportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Structured => "json",
            Self::Markdown => "md",
            Self::Plain => "txt",
        }
    }
}

/// One phase line in the status report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseLine {
    pub number: u32,
    pub phase_id: String,
    pub agent_id: String,
    pub state: PhaseState,
    pub reason: Option<String>,
}

/// In-flight (or final) run status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub run_id: String,
    pub plan_id: String,
    pub status: crate::tracker::RunStatus,
    pub phases: Vec<PhaseLine>,
    pub tasks_total: u64,
    pub retries_total: u64,
}

/// Terminal summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionReport {
    pub run_id: String,
    pub plan_id: String,
    pub status: crate::tracker::RunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    pub phases_completed: u64,
    pub phases_failed: u64,
    pub phases_skipped: u64,
    pub artifacts: BTreeMap<String, String>,
}

/// Duration percentiles for one phase/agent pairing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhasePerformance {
    pub phase: u32,
    pub agent_id: String,
    pub tasks: u64,
    pub duration_ms_p50: u64,
    pub duration_ms_p90: u64,
    pub duration_ms_p99: u64,
}

/// Duration breakdown per phase/agent plus run-wide percentiles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceReport {
    pub run_id: String,
    pub per_phase: Vec<PhasePerformance>,
    pub duration_ms_p50: u64,
    pub duration_ms_p90: u64,
    pub duration_ms_p99: u64,
    pub success_rate: f64,
}

/// Grouped failures for one phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorGroup {
    pub phase: Option<u32>,
    pub agent_id: Option<String>,
    pub kind: String,
    pub count: u64,
    pub last_message: String,
    pub retries_exhausted: bool,
}

/// Grouped failure report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReport {
    pub run_id: String,
    pub status: crate::tracker::RunStatus,
    pub groups: Vec<ErrorGroup>,
}

/// A built report, ready to render.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "report", rename_all = "snake_case")]
pub enum Report {
    Status(StatusReport),
    Completion(CompletionReport),
    Performance(PerformanceReport),
    Error(ErrorReport),
}

impl Report {
    pub fn kind(&self) -> ReportKind {
        match self {
            Self::Status(_) => ReportKind::Status,
            Self::Completion(_) => ReportKind::Completion,
            Self::Performance(_) => ReportKind::Performance,
            Self::Error(_) => ReportKind::Error,
        }
    }
}

/// Build one report flavor from a snapshot.
pub fn build(kind: ReportKind, snapshot: &RunSnapshot) -> Report {
    match kind {
        ReportKind::Status => Report::Status(build_status(snapshot)),
        ReportKind::Completion => Report::Completion(build_completion(snapshot)),
        ReportKind::Performance => Report::Performance(build_performance(snapshot)),
        ReportKind::Error => Report::Error(build_error(snapshot)),
    }
}

fn build_status(snapshot: &RunSnapshot) -> StatusReport {
    StatusReport {
        run_id: snapshot.run_id.to_string(),
        plan_id: snapshot.plan_id.clone(),
        status: snapshot.status,
        phases: snapshot
            .phases
            .iter()
            .map(|p| PhaseLine {
                number: p.number,
                phase_id: p.phase_id.clone(),
                agent_id: p.agent_id.clone(),
                state: p.state,
                reason: p.reason.clone(),
            })
            .collect(),
        tasks_total: snapshot.metrics.tasks_total,
        retries_total: snapshot.metrics.retries_total,
    }
}

fn build_completion(snapshot: &RunSnapshot) -> CompletionReport {
    let count = |state: PhaseState| {
        snapshot.phases.iter().filter(|p| p.state == state).count() as u64
    };
    let duration_ms = match (snapshot.started_at, snapshot.ended_at) {
        (Some(start), Some(end)) => (end - start).num_milliseconds().max(0) as u64,
        _ => 0,
    };
    CompletionReport {
        run_id: snapshot.run_id.to_string(),
        plan_id: snapshot.plan_id.clone(),
        status: snapshot.status,
        started_at: snapshot.started_at,
        ended_at: snapshot.ended_at,
        duration_ms,
        phases_completed: count(PhaseState::Completed),
        phases_failed: count(PhaseState::Failed),
        phases_skipped: count(PhaseState::Skipped),
        artifacts: snapshot.artifacts.clone(),
    }
}

fn build_performance(snapshot: &RunSnapshot) -> PerformanceReport {
    let mut by_phase: BTreeMap<(u32, String), Vec<u64>> = BTreeMap::new();
    let mut all: Vec<u64> = Vec::new();
    let mut terminal = 0u64;
    let mut completed = 0u64;
    for task in &snapshot.tasks {
        if !task.state.is_terminal() {
            continue;
        }
        terminal += 1;
        if task.state == TaskState::Completed {
            completed += 1;
        }
        if let (Some(start), Some(end)) = (task.started_at, task.ended_at) {
            let ms = (end - start).num_milliseconds().max(0) as u64;
            by_phase
                .entry((task.phase, task.agent_id.clone()))
                .or_default()
                .push(ms);
            all.push(ms);
        }
    }
    all.sort_unstable();

    let per_phase = by_phase
        .into_iter()
        .map(|((phase, agent_id), mut durations)| {
            durations.sort_unstable();
            PhasePerformance {
                phase,
                agent_id,
                tasks: durations.len() as u64,
                duration_ms_p50: percentile(&durations, 50.0),
                duration_ms_p90: percentile(&durations, 90.0),
                duration_ms_p99: percentile(&durations, 99.0),
            }
        })
        .collect();

    PerformanceReport {
        run_id: snapshot.run_id.to_string(),
        per_phase,
        duration_ms_p50: percentile(&all, 50.0),
        duration_ms_p90: percentile(&all, 90.0),
        duration_ms_p99: percentile(&all, 99.0),
        success_rate: if terminal == 0 {
            1.0
        } else {
            completed as f64 / terminal as f64
        },
    }
}

fn build_error(snapshot: &RunSnapshot) -> ErrorReport {
    let mut groups: BTreeMap<(Option<u32>, String), ErrorGroup> = BTreeMap::new();
    for error in &snapshot.errors {
        let key = (error.phase, error.kind.clone());
        let entry = groups.entry(key).or_insert_with(|| ErrorGroup {
            phase: error.phase,
            agent_id: error.agent_id.clone(),
            kind: error.kind.clone(),
            count: 0,
            last_message: String::new(),
            retries_exhausted: false,
        });
        entry.count += 1;
        entry.last_message = error.message.clone();
        entry.retries_exhausted = entry.retries_exhausted || error.retries_exhausted;
    }
    ErrorReport {
        run_id: snapshot.run_id.to_string(),
        status: snapshot.status,
        groups: groups.into_values().collect(),
    }
}

/// Render a report in the requested format.
pub fn render(report: &Report, format: ReportFormat) -> String {
    match format {
        ReportFormat::Structured => {
            serde_json::to_string_pretty(report).unwrap_or_else(|_| "{}".to_string())
        }
        ReportFormat::Markdown => render_markdown(report),
        ReportFormat::Plain => render_plain(report),
    }
}

fn render_markdown(report: &Report) -> String {
    let mut out = String::new();
    match report {
        Report::Status(r) => {
            out.push_str(&format!("# Run status: {}\n\n", r.run_id));
            out.push_str(&format!("Plan `{}` — **{:?}**\n\n", r.plan_id, r.status));
            out.push_str("| # | Phase | Agent | State | Reason |\n|---|---|---|---|---|\n");
            for p in &r.phases {
                out.push_str(&format!(
                    "| {} | {} | {} | {:?} | {} |\n",
                    p.number,
                    p.phase_id,
                    p.agent_id,
                    p.state,
                    p.reason.as_deref().unwrap_or("-")
                ));
            }
        }
        Report::Completion(r) => {
            out.push_str(&format!("# Run complete: {}\n\n", r.run_id));
            out.push_str(&format!(
                "Status **{:?}** in {} ms — {} completed, {} failed, {} skipped\n",
                r.status, r.duration_ms, r.phases_completed, r.phases_failed, r.phases_skipped
            ));
            if !r.artifacts.is_empty() {
                out.push_str("\n## Artifacts\n\n");
                for (phase_id, artifact_id) in &r.artifacts {
                    out.push_str(&format!("- `{phase_id}` → `{artifact_id}`\n"));
                }
            }
        }
        Report::Performance(r) => {
            out.push_str(&format!("# Performance: {}\n\n", r.run_id));
            out.push_str(&format!(
                "p50 {} ms, p90 {} ms, p99 {} ms, success rate {:.0}%\n\n",
                r.duration_ms_p50,
                r.duration_ms_p90,
                r.duration_ms_p99,
                r.success_rate * 100.0
            ));
            out.push_str("| Phase | Agent | Tasks | p50 | p90 | p99 |\n|---|---|---|---|---|---|\n");
            for p in &r.per_phase {
                out.push_str(&format!(
                    "| {} | {} | {} | {} | {} | {} |\n",
                    p.phase, p.agent_id, p.tasks, p.duration_ms_p50, p.duration_ms_p90, p.duration_ms_p99
                ));
            }
        }
        Report::Error(r) => {
            out.push_str(&format!("# Errors: {}\n\n", r.run_id));
            if r.groups.is_empty() {
                out.push_str("No errors recorded.\n");
            }
            for g in &r.groups {
                out.push_str(&format!(
                    "- phase {} ({}) — `{}` ×{}{}: {}\n",
                    g.phase.map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
                    g.agent_id.as_deref().unwrap_or("-"),
                    g.kind,
                    g.count,
                    if g.retries_exhausted {
                        ", retries exhausted"
                    } else {
                        ""
                    },
                    g.last_message
                ));
            }
        }
    }
    out
}

fn render_plain(report: &Report) -> String {
    match report {
        Report::Status(r) => {
            let mut out = format!("run {} plan {} status {:?}\n", r.run_id, r.plan_id, r.status);
            for p in &r.phases {
                out.push_str(&format!(
                    "phase {} {} [{}] {:?}\n",
                    p.number, p.phase_id, p.agent_id, p.state
                ));
            }
            out
        }
        Report::Completion(r) => format!(
            "run {} {:?} duration_ms={} completed={} failed={} skipped={}\n",
            r.run_id, r.status, r.duration_ms, r.phases_completed, r.phases_failed, r.phases_skipped
        ),
        Report::Performance(r) => format!(
            "run {} p50={}ms p90={}ms p99={}ms success_rate={:.2}\n",
            r.run_id, r.duration_ms_p50, r.duration_ms_p90, r.duration_ms_p99, r.success_rate
        ),
        Report::Error(r) => {
            let mut out = format!("run {} status {:?}\n", r.run_id, r.status);
            for g in &r.groups {
                out.push_str(&format!(
                    "error phase={:?} kind={} count={} exhausted={} msg={}\n",
                    g.phase, g.kind, g.count, g.retries_exhausted, g.last_message
                ));
            }
            out
        }
    }
}

/// Write a rendered report to `dir/report/<kind>.<ext>` and return the path.
pub fn write_report(
    dir: &Path,
    report: &Report,
    format: ReportFormat,
) -> anyhow::Result<PathBuf> {
    let report_dir = dir.join("report");
    std::fs::create_dir_all(&report_dir)?;
    let path = report_dir.join(format!(
        "{}.{}",
        report.kind().label(),
        format.extension()
    ));
    std::fs::write(&path, render(report, format))?;
    Ok(path)
}
