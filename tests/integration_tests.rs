//! End-to-end tests: the coordinator driving full workflows over in-process
//! agents, plus the CLI surface.

use async_trait::async_trait;
use conductor::bus::MessageType;
use conductor::config::Config;
use conductor::coordinator::{Coordinator, RunContext, RunOutcome};
use conductor::exec::{AgentConfig, AgentHandler, AgentRegistry, ExecutionContext};
use conductor::plan::Plan;
use conductor::schema::SchemaRegistry;
use conductor::tracker::{EventKind, PhaseState, RunStatus, TaskState};
use conductor::workflow::{default_workflow, PhaseCategory, PhaseSpec, Workflow};
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

// =============================================================================
// Harness
// =============================================================================

struct EchoAgent;

#[async_trait]
impl AgentHandler for EchoAgent {
    async fn handle(&self, ctx: &ExecutionContext) -> anyhow::Result<serde_json::Value> {
        Ok(json!({
            "artifact": {
                "phase": ctx.phase,
                "agent": ctx.agent_id,
                "summary": "done",
            }
        }))
    }
}

struct DecisionAgent;

#[async_trait]
impl AgentHandler for DecisionAgent {
    async fn handle(&self, _ctx: &ExecutionContext) -> anyhow::Result<serde_json::Value> {
        Ok(json!({
            "artifact": {
                "decision": {
                    "platform": "azure",
                    "frontend": "react",
                    "backend": "none",
                    "database": "mysql",
                    "ci_cd": "github",
                    "iac_required": true,
                    "containerization_required": false,
                }
            }
        }))
    }
}

/// Times out on the first attempt, succeeds afterwards.
struct FlakyAgent {
    calls: AtomicU32,
}

#[async_trait]
impl AgentHandler for FlakyAgent {
    async fn handle(&self, ctx: &ExecutionContext) -> anyhow::Result<serde_json::Value> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        Ok(json!({ "artifact": { "phase": ctx.phase, "recovered": true } }))
    }
}

struct SlowAgent;

#[async_trait]
impl AgentHandler for SlowAgent {
    async fn handle(&self, _ctx: &ExecutionContext) -> anyhow::Result<serde_json::Value> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(json!({}))
    }
}

/// A linear orchestration-only workflow of `n` phases.
fn orchestration_workflow(n: u32, approval_phase: Option<u32>) -> Workflow {
    let phases: Vec<PhaseSpec> = (0..n)
        .map(|i| {
            let spec = PhaseSpec::ordered(
                i,
                &format!("stage-{i}"),
                &format!("agent-{i}"),
                PhaseCategory::Orchestration,
            );
            if approval_phase == Some(i) {
                spec.with_approval()
            } else {
                spec
            }
        })
        .collect();
    Workflow::new(phases).unwrap()
}

/// Fast bus settings for tests.
fn test_config(dir: &std::path::Path) -> Config {
    let overrides = vec![
        ("core.bus_tick_ms".to_string(), "10".to_string()),
        ("retry.base_backoff_ms".to_string(), "20".to_string()),
        ("retry.backoff_cap_ms".to_string(), "100".to_string()),
    ];
    let config = Config::load(dir, None, &overrides).unwrap();
    config.ensure_directories().unwrap();
    config
}

fn register_echo_agents(registry: &AgentRegistry, workflow: &Workflow) {
    registry.register_handler("echo", Arc::new(EchoAgent));
    for spec in workflow.phases() {
        registry.register(
            AgentConfig::new(&spec.agent_id, "agent.in", "agent.out").with_handler("echo"),
        );
    }
}

fn run_context(
    config: Config,
    workflow: Workflow,
    registry: Arc<AgentRegistry>,
    schemas: Arc<SchemaRegistry>,
) -> Arc<RunContext> {
    let plan = Plan::new("test-plan", json!({"summary": "a system"}));
    RunContext::new(config, &plan, Arc::new(workflow), registry, schemas).unwrap()
}

async fn drive(ctx: Arc<RunContext>) -> RunOutcome {
    let coordinator = Coordinator::new(ctx);
    tokio::time::timeout(
        Duration::from_secs(30),
        coordinator.run(json!({"summary": "a system"})),
    )
    .await
    .expect("run timed out")
    .expect("run errored")
}

// =============================================================================
// S-A: linear happy path, orchestration only
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn linear_happy_path_completes_all_phases_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let workflow = orchestration_workflow(8, None);
    let registry = Arc::new(AgentRegistry::new());
    register_echo_agents(&registry, &workflow);

    let ctx = run_context(
        test_config(dir.path()),
        workflow,
        registry,
        Arc::new(SchemaRegistry::new()),
    );
    let outcome = drive(ctx.clone()).await;

    assert_eq!(outcome.status, RunStatus::Succeeded);
    assert_eq!(outcome.status.exit_code(), 0);

    let snapshot = ctx.tracker.snapshot();
    let completed = snapshot
        .phases
        .iter()
        .filter(|p| p.state == PhaseState::Completed)
        .count();
    assert_eq!(completed, 8);
    assert!(!snapshot.phases.iter().any(|p| p.state == PhaseState::Failed));
    assert!(!snapshot.phases.iter().any(|p| p.state == PhaseState::Skipped));

    let completions: Vec<String> = ctx
        .tracker
        .events()
        .into_iter()
        .filter(|e| e.kind == EventKind::PhaseCompleted)
        .map(|e| e.subject)
        .collect();
    let expected: Vec<String> = (0..8).map(|i| i.to_string()).collect();
    assert_eq!(completions, expected);
}

// =============================================================================
// S-B: retry then success
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn timeout_retries_then_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    let workflow = orchestration_workflow(4, None);
    let registry = Arc::new(AgentRegistry::new());
    register_echo_agents(&registry, &workflow);

    // Phase 3's agent times out on the first attempt.
    registry.register_handler("flaky", Arc::new(FlakyAgent { calls: AtomicU32::new(0) }));
    registry.register(
        AgentConfig::new("agent-3", "agent.in", "agent.out")
            .with_handler("flaky")
            .with_timeout_ms(150),
    );

    let ctx = run_context(
        test_config(dir.path()),
        workflow,
        registry,
        Arc::new(SchemaRegistry::new()),
    );
    let outcome = drive(ctx.clone()).await;

    assert_eq!(outcome.status, RunStatus::Succeeded);

    let snapshot = ctx.tracker.snapshot();
    let task = snapshot.tasks.iter().find(|t| t.phase == 3).unwrap();
    assert_eq!(task.attempt, 2);
    assert_eq!(task.state, TaskState::Completed);
    assert_eq!(
        ctx.tracker.phase_state(3).unwrap(),
        PhaseState::Completed
    );
    assert!(snapshot.metrics.retries_total >= 1);
}

// =============================================================================
// S-C: schema-invalid output is fatal with zero retries
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn schema_invalid_escalates_without_retry() {
    let dir = tempfile::tempdir().unwrap();
    let workflow = orchestration_workflow(4, None);
    let registry = Arc::new(AgentRegistry::new());
    register_echo_agents(&registry, &workflow);
    registry.register(
        AgentConfig::new("agent-2", "agent.in", "broken.out").with_handler("echo"),
    );

    let schemas = Arc::new(SchemaRegistry::new());
    schemas.register(
        "broken.out",
        Arc::new(|_bytes: &[u8]| Err(vec!["missing field 'milestones'".to_string()])),
    );

    let ctx = run_context(test_config(dir.path()), workflow, registry, schemas);
    let outcome = drive(ctx.clone()).await;

    assert_eq!(outcome.status, RunStatus::Failed);
    assert_eq!(outcome.status.exit_code(), 1);

    let snapshot = ctx.tracker.snapshot();
    assert_eq!(ctx.tracker.phase_state(2).unwrap(), PhaseState::Failed);

    // Exactly one attempt: validator failures never retry.
    let task = snapshot.tasks.iter().find(|t| t.phase == 2).unwrap();
    assert_eq!(task.attempt, 1);
    assert_eq!(snapshot.metrics.retries_total, 0);

    let error = snapshot
        .errors
        .iter()
        .find(|e| e.phase == Some(2))
        .unwrap();
    assert_eq!(error.kind, "schema_invalid");
    assert!(error.message.contains("milestones"));

    // Downstream phase 3 never ran.
    assert_eq!(ctx.tracker.phase_state(3).unwrap(), PhaseState::Skipped);
}

// =============================================================================
// S-D: conditional branching and parallel fan-out
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn conditional_branching_follows_architecture_decision() {
    let dir = tempfile::tempdir().unwrap();
    let workflow = default_workflow();
    let registry = Arc::new(AgentRegistry::new());
    register_echo_agents(&registry, &workflow);

    // The solution architect emits the decision record.
    registry.register_handler("decision", Arc::new(DecisionAgent));
    registry.register(
        AgentConfig::new("solution-architect", "agent.in", "agent.out")
            .with_handler("decision"),
    );

    // Phase 4 carries an approval gate; resolve it by policy.
    let mut config = test_config(dir.path());
    config.approval.timeout_ms = 50;
    config.approval.on_timeout = conductor::bus::ApprovalTimeoutPolicy::AutoApprove;

    let ctx = run_context(
        config,
        workflow,
        registry,
        Arc::new(SchemaRegistry::new()),
    );
    let outcome = drive(ctx.clone()).await;

    assert_eq!(outcome.status, RunStatus::Succeeded);

    let state = |n: u32| ctx.tracker.phase_state(n).unwrap();
    // Activated: azure (9), iac (11), react (12), mysql (14), cicd-github (15).
    for phase in [9, 11, 12, 14, 15] {
        assert_eq!(state(phase), PhaseState::Completed, "phase {phase}");
    }
    // Skipped alternatives: aws (10), dotnet (13), cicd-azure-devops (16).
    for phase in [10, 13, 16] {
        assert_eq!(state(phase), PhaseState::Skipped, "phase {phase}");
    }

    let snapshot = ctx.tracker.snapshot();
    let conditional_completed = snapshot
        .phases
        .iter()
        .filter(|p| p.number >= 9 && p.state == PhaseState::Completed)
        .count();
    assert_eq!(conditional_completed, 5);
    assert_eq!(
        snapshot.decision.as_ref().unwrap().platform,
        conductor::workflow::Platform::Azure
    );
}

// =============================================================================
// S-E: approval rejection blocks the run
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn approval_rejection_fails_phase_and_run() {
    let dir = tempfile::tempdir().unwrap();
    let workflow = orchestration_workflow(8, Some(4));
    let registry = Arc::new(AgentRegistry::new());
    register_echo_agents(&registry, &workflow);

    let ctx = run_context(
        test_config(dir.path()),
        workflow,
        registry,
        Arc::new(SchemaRegistry::new()),
    );

    let run_ctx = ctx.clone();
    let run_handle = tokio::spawn(async move { drive(run_ctx).await });

    // Wait for the approval request, then reject it.
    let request_id = {
        let mut found = None;
        for _ in 0..300 {
            if let Some(event) = ctx
                .tracker
                .events()
                .into_iter()
                .find(|e| e.kind == EventKind::ApprovalRequested)
            {
                found = Some(Uuid::parse_str(&event.subject).unwrap());
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        found.expect("no approval request observed")
    };
    ctx.approvals
        .decide(
            request_id,
            conductor::bus::ApprovalSignal::Rejected {
                notes: Some("design incomplete".into()),
            },
        )
        .unwrap();

    let outcome = run_handle.await.unwrap();
    assert_eq!(outcome.status, RunStatus::Failed);
    assert_eq!(outcome.status.exit_code(), 1);

    let snapshot = ctx.tracker.snapshot();
    let phase4 = snapshot.phases.iter().find(|p| p.number == 4).unwrap();
    assert_eq!(phase4.state, PhaseState::Failed);
    assert_eq!(phase4.reason.as_deref(), Some("approval_rejected"));

    // Phases 5..7 never dispatched; they settle as SKIPPED on close.
    for phase in 5..8 {
        assert_eq!(
            ctx.tracker.phase_state(phase).unwrap(),
            PhaseState::Skipped,
            "phase {phase}"
        );
    }
}

// =============================================================================
// S-F: transport failures exhaust retries into the DLQ
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn transport_errors_exhaust_retries_and_dead_letter() {
    let dir = tempfile::tempdir().unwrap();
    let workflow = orchestration_workflow(1, None);
    let registry = Arc::new(AgentRegistry::new());
    // Port 9 (discard) refuses connections.
    registry.register(
        AgentConfig::new("agent-0", "agent.in", "agent.out")
            .with_endpoint("http://127.0.0.1:9/run")
            .with_timeout_ms(2000),
    );

    let ctx = run_context(
        test_config(dir.path()),
        workflow,
        registry,
        Arc::new(SchemaRegistry::new()),
    );
    let mut escalation = ctx.bus.subscribe_escalation();
    let outcome = drive(ctx.clone()).await;

    assert_eq!(outcome.status, RunStatus::Failed);

    let dlq = ctx.bus.dead_letters();
    assert_eq!(dlq.len(), 1);
    assert_eq!(dlq[0].message.retry_count, dlq[0].message.max_retries + 1);

    let escalated = escalation.recv().await.unwrap();
    assert_eq!(escalated.message_type, MessageType::Error);

    let snapshot = ctx.tracker.snapshot();
    assert_eq!(snapshot.metrics.dead_letter_total, 1);
    assert_eq!(ctx.tracker.phase_state(0).unwrap(), PhaseState::Failed);
    let error = snapshot.errors.iter().find(|e| e.retries_exhausted).unwrap();
    assert_eq!(error.kind, "transport");
}

// =============================================================================
// Cancellation
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancellation_is_idempotent_and_cancels_in_flight_tasks() {
    let dir = tempfile::tempdir().unwrap();
    let workflow = orchestration_workflow(3, None);
    let registry = Arc::new(AgentRegistry::new());
    registry.register_handler("slow", Arc::new(SlowAgent));
    for spec in workflow.phases() {
        registry.register(
            AgentConfig::new(&spec.agent_id, "agent.in", "agent.out").with_handler("slow"),
        );
    }

    let ctx = run_context(
        test_config(dir.path()),
        workflow,
        registry,
        Arc::new(SchemaRegistry::new()),
    );
    let coordinator = Arc::new(Coordinator::new(ctx.clone()));

    let run_coordinator = coordinator.clone();
    let run_handle =
        tokio::spawn(async move { run_coordinator.run(json!({"summary": "x"})).await });

    // Let phase 0 start, then cancel twice.
    tokio::time::sleep(Duration::from_millis(200)).await;
    coordinator.cancel();
    coordinator.cancel();

    let outcome = tokio::time::timeout(Duration::from_secs(10), run_handle)
        .await
        .expect("cancel did not settle")
        .unwrap()
        .unwrap();

    assert_eq!(outcome.status, RunStatus::Cancelled);
    assert_eq!(outcome.status.exit_code(), 130);

    let snapshot = ctx.tracker.snapshot();
    assert!(snapshot
        .tasks
        .iter()
        .all(|t| t.state == TaskState::Cancelled));

    // A second cancel after the fact leaves the terminal state unchanged.
    coordinator.cancel();
    assert_eq!(ctx.tracker.run_status(), RunStatus::Cancelled);
}

// =============================================================================
// Artifacts flow between phases
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn downstream_phases_receive_upstream_artifact_ids() {
    struct InspectingAgent;

    #[async_trait]
    impl AgentHandler for InspectingAgent {
        async fn handle(&self, ctx: &ExecutionContext) -> anyhow::Result<serde_json::Value> {
            if ctx.phase == 1 {
                let upstream = ctx.inputs.get("artifacts").and_then(|a| a.get("stage-0"));
                anyhow::ensure!(upstream.is_some(), "missing upstream artifact reference");
            }
            Ok(json!({ "artifact": { "phase": ctx.phase } }))
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let workflow = orchestration_workflow(2, None);
    let registry = Arc::new(AgentRegistry::new());
    registry.register_handler("inspect", Arc::new(InspectingAgent));
    for spec in workflow.phases() {
        registry.register(
            AgentConfig::new(&spec.agent_id, "agent.in", "agent.out").with_handler("inspect"),
        );
    }

    let ctx = run_context(
        test_config(dir.path()),
        workflow,
        registry,
        Arc::new(SchemaRegistry::new()),
    );
    let outcome = drive(ctx.clone()).await;
    assert_eq!(outcome.status, RunStatus::Succeeded);

    // Handoff events were recorded for the 0→1 edge.
    assert!(ctx
        .tracker
        .events()
        .iter()
        .any(|e| e.kind == EventKind::HandoffCompleted));

    // The stored artifacts are readable through the store.
    let snapshot = ctx.tracker.snapshot();
    for artifact_id in snapshot.artifacts.values() {
        assert!(ctx.store.get(artifact_id, None).is_ok());
    }
}

// =============================================================================
// Run persistence
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn run_writes_reports_events_and_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let workflow = orchestration_workflow(2, None);
    let registry = Arc::new(AgentRegistry::new());
    register_echo_agents(&registry, &workflow);

    let ctx = run_context(
        test_config(dir.path()),
        workflow,
        registry,
        Arc::new(SchemaRegistry::new()),
    );
    let outcome = drive(ctx.clone()).await;

    assert!(outcome.run_dir.join("run.json").is_file());
    assert!(outcome.run_dir.join("events").join("run.log").is_file());
    assert!(outcome.run_dir.join("report").join("status.json").is_file());
    assert!(outcome.run_dir.join("report").join("completion.json").is_file());
    assert!(outcome.run_dir.join("report").join("performance.json").is_file());
    assert!(outcome.run_dir.join("report").join("error.json").is_file());
    assert!(outcome.run_dir.join("report").join("completion.md").is_file());

    let content = std::fs::read_to_string(outcome.run_dir.join("run.json")).unwrap();
    let snapshot: conductor::tracker::RunSnapshot = serde_json::from_str(&content).unwrap();
    assert_eq!(snapshot.status, RunStatus::Succeeded);
}

// =============================================================================
// CLI surface
// =============================================================================

mod cli {
    use assert_cmd::Command;
    use predicates::prelude::*;

    fn conductor() -> Command {
        Command::cargo_bin("conductor").unwrap()
    }

    #[test]
    fn help_and_version() {
        conductor().arg("--help").assert().success();
        conductor().arg("--version").assert().success();
    }

    #[test]
    fn run_status_unknown_run_exits_64() {
        let dir = tempfile::tempdir().unwrap();
        conductor()
            .args(["--project-dir"])
            .arg(dir.path())
            .args(["run", "status", "no-such-run"])
            .assert()
            .code(64)
            .stderr(predicate::str::contains("not found"));
    }

    #[test]
    fn run_cancel_unknown_run_exits_64() {
        let dir = tempfile::tempdir().unwrap();
        conductor()
            .args(["--project-dir"])
            .arg(dir.path())
            .args(["run", "cancel", "no-such-run"])
            .assert()
            .code(64);
    }

    #[test]
    fn artifact_get_unknown_exits_64() {
        let dir = tempfile::tempdir().unwrap();
        conductor()
            .args(["--project-dir"])
            .arg(dir.path())
            .args(["artifact", "get", "deadbeef"])
            .assert()
            .code(64);
    }

    #[test]
    fn approval_decide_rejects_invalid_request_id() {
        let dir = tempfile::tempdir().unwrap();
        conductor()
            .args(["--project-dir"])
            .arg(dir.path())
            .args(["approval", "decide", "not-a-uuid", "--outcome", "approved"])
            .assert()
            .code(64);
    }

    #[test]
    fn approval_decide_writes_decision_file() {
        let dir = tempfile::tempdir().unwrap();
        let request_id = uuid::Uuid::new_v4().to_string();
        conductor()
            .args(["--project-dir"])
            .arg(dir.path())
            .args([
                "approval",
                "decide",
                &request_id,
                "--outcome",
                "rejected",
                "--notes",
                "needs rework",
            ])
            .assert()
            .success();

        let path = dir
            .path()
            .join(".conductor")
            .join("approvals")
            .join(format!("{request_id}.json"));
        let content = std::fs::read_to_string(path).unwrap();
        assert!(content.contains("rejected"));
        assert!(content.contains("needs rework"));
    }

    #[test]
    fn run_start_with_unknown_plan_fails() {
        let dir = tempfile::tempdir().unwrap();
        conductor()
            .args(["--project-dir"])
            .arg(dir.path())
            .args(["run", "start", "--plan", "missing-plan"])
            .assert()
            .code(1)
            .stderr(predicate::str::contains("missing-plan"));
    }

    #[test]
    fn run_list_is_empty_for_fresh_project() {
        let dir = tempfile::tempdir().unwrap();
        conductor()
            .args(["--project-dir"])
            .arg(dir.path())
            .args(["run", "list"])
            .assert()
            .success()
            .stdout(predicate::str::is_empty());
    }
}
