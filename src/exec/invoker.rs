//! Agent invoker: runs one invocation over the selected transport and
//! captures stdout/stderr/exit/duration into a structured result.
//!
//! The invoker never panics and never suspends the coordinator: every failure
//! comes back as an [`InvocationResult`] with `ok == false`. Timeouts kill
//! the underlying process or abort the request; cancellation is honored at
//! every await point.

use crate::exec::agent::AgentRegistry;
use crate::exec::context::ExecutionContext;
use crate::exec::transport::TransportKind;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Failure classes the transport layer itself can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvokeErrorKind {
    /// The invocation exceeded `timeout_ms`.
    Timeout,
    /// The transport could not complete the exchange.
    Transport,
    /// The run was cancelled mid-flight.
    Cancelled,
}

/// A transport-level failure attached to a result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationFailure {
    pub kind: InvokeErrorKind,
    pub message: String,
}

/// Raw outcome of one agent invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationResult {
    pub ok: bool,
    pub exit_code: Option<i32>,
    pub http_status: Option<u16>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub failure: Option<InvocationFailure>,
}

impl InvocationResult {
    fn completed(
        exit_code: Option<i32>,
        http_status: Option<u16>,
        stdout: String,
        stderr: String,
        duration_ms: u64,
    ) -> Self {
        let ok = exit_code.map(|c| c == 0).unwrap_or(true)
            && http_status.map(|s| (200..300).contains(&s)).unwrap_or(true);
        Self {
            ok,
            exit_code,
            http_status,
            stdout,
            stderr,
            duration_ms,
            failure: None,
        }
    }

    fn transport_failure(kind: InvokeErrorKind, message: String, duration_ms: u64) -> Self {
        Self {
            ok: false,
            exit_code: None,
            http_status: None,
            stdout: String::new(),
            stderr: message.clone(),
            duration_ms,
            failure: Some(InvocationFailure { kind, message }),
        }
    }

    /// Whether the failure was a transport timeout.
    pub fn timed_out(&self) -> bool {
        matches!(
            self.failure,
            Some(InvocationFailure {
                kind: InvokeErrorKind::Timeout,
                ..
            })
        )
    }

    /// Whether the invocation was cancelled.
    pub fn cancelled(&self) -> bool {
        matches!(
            self.failure,
            Some(InvocationFailure {
                kind: InvokeErrorKind::Cancelled,
                ..
            })
        )
    }
}

/// Invokes agents over their selected transport.
pub struct AgentInvoker {
    registry: Arc<AgentRegistry>,
    http: reqwest::Client,
    container_runtime: String,
}

impl AgentInvoker {
    pub fn new(registry: Arc<AgentRegistry>) -> Self {
        let container_runtime =
            std::env::var("CONDUCTOR_CONTAINER_RUNTIME").unwrap_or_else(|_| "docker".to_string());
        Self {
            registry,
            http: reqwest::Client::new(),
            container_runtime,
        }
    }

    /// Run one invocation. All failure modes return a structured result.
    pub async fn invoke(
        &self,
        transport: TransportKind,
        ctx: &ExecutionContext,
        cancel: &CancellationToken,
    ) -> InvocationResult {
        let started = Instant::now();
        tracing::debug!(
            execution_id = %ctx.execution_id,
            agent_id = %ctx.agent_id,
            transport = ?transport,
            "invoking agent"
        );
        let result = match transport {
            TransportKind::InProcess => self.invoke_in_process(ctx, cancel, started).await,
            TransportKind::Subprocess => {
                self.invoke_command(ctx, cancel, started, CommandInput::Argument)
                    .await
            }
            TransportKind::StdioChannel => {
                self.invoke_command(ctx, cancel, started, CommandInput::Stdin)
                    .await
            }
            TransportKind::Container => self.invoke_container(ctx, cancel, started).await,
            TransportKind::Webhook => self.invoke_webhook(ctx, cancel, started).await,
        };
        tracing::debug!(
            execution_id = %ctx.execution_id,
            ok = result.ok,
            duration_ms = result.duration_ms,
            "invocation finished"
        );
        result
    }

    async fn invoke_in_process(
        &self,
        ctx: &ExecutionContext,
        cancel: &CancellationToken,
        started: Instant,
    ) -> InvocationResult {
        let config = match self.registry.config(&ctx.agent_id) {
            Ok(config) => config,
            Err(err) => return transport_err(err.to_string(), started),
        };
        let handler_id = match config.handler_id.as_deref() {
            Some(id) => id,
            None => return transport_err("no handler id configured".into(), started),
        };
        let handler = match self.registry.handler(handler_id) {
            Ok(handler) => handler,
            Err(err) => return transport_err(err.to_string(), started),
        };

        tokio::select! {
            res = tokio::time::timeout(ctx.timeout(), handler.handle(ctx)) => {
                let duration_ms = elapsed_ms(started);
                match res {
                    Ok(Ok(value)) => InvocationResult::completed(
                        Some(0),
                        None,
                        value.to_string(),
                        String::new(),
                        duration_ms,
                    ),
                    Ok(Err(err)) => InvocationResult::completed(
                        Some(1),
                        None,
                        String::new(),
                        format!("{err:#}"),
                        duration_ms,
                    ),
                    Err(_) => InvocationResult::transport_failure(
                        InvokeErrorKind::Timeout,
                        format!("in-process handler exceeded {} ms", ctx.limits.timeout_ms),
                        duration_ms,
                    ),
                }
            }
            _ = cancel.cancelled() => cancelled_result(started),
        }
    }

    async fn invoke_command(
        &self,
        ctx: &ExecutionContext,
        cancel: &CancellationToken,
        started: Instant,
        input: CommandInput,
    ) -> InvocationResult {
        let config = match self.registry.config(&ctx.agent_id) {
            Ok(config) => config,
            Err(err) => return transport_err(err.to_string(), started),
        };
        let argv = match config.command {
            Some(argv) if !argv.is_empty() => argv,
            _ => return transport_err("no command configured".into(), started),
        };

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        if matches!(input, CommandInput::Argument) {
            cmd.arg(ctx.inputs.to_string());
        }
        cmd.envs(&ctx.env)
            .current_dir(&ctx.paths.temp_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        self.run_child(cmd, ctx, cancel, started, input).await
    }

    async fn invoke_container(
        &self,
        ctx: &ExecutionContext,
        cancel: &CancellationToken,
        started: Instant,
    ) -> InvocationResult {
        let config = match self.registry.config(&ctx.agent_id) {
            Ok(config) => config,
            Err(err) => return transport_err(err.to_string(), started),
        };
        let image = match config.image {
            Some(image) => image,
            None => return transport_err("no container image configured".into(), started),
        };

        let mut cmd = Command::new(&self.container_runtime);
        cmd.arg("run").arg("--rm").arg("-i");
        for (key, value) in &ctx.env {
            cmd.arg("-e").arg(format!("{key}={value}"));
        }
        cmd.arg("-m").arg(format!("{}m", ctx.limits.memory_mb));
        cmd.arg(&image);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        self.run_child(cmd, ctx, cancel, started, CommandInput::Stdin)
            .await
    }

    /// Spawn the child, feed it input, and race completion against the
    /// timeout and cancellation. `kill_on_drop` tears the child down on both
    /// losing branches.
    async fn run_child(
        &self,
        mut cmd: Command,
        ctx: &ExecutionContext,
        cancel: &CancellationToken,
        started: Instant,
        input: CommandInput,
    ) -> InvocationResult {
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => return transport_err(format!("spawn failed: {err}"), started),
        };

        if let Some(mut stdin) = child.stdin.take() {
            if matches!(input, CommandInput::Stdin) {
                let payload = ctx.inputs.to_string();
                if let Err(err) = stdin.write_all(payload.as_bytes()).await {
                    tracing::debug!(error = %err, "failed to write agent stdin");
                }
            }
            // Dropping stdin closes the pipe either way.
        }

        let wait = child.wait_with_output();
        tokio::pin!(wait);

        tokio::select! {
            output = &mut wait => {
                let duration_ms = elapsed_ms(started);
                match output {
                    // A signal-killed child has no exit code; report -1.
                    Ok(output) => InvocationResult::completed(
                        output.status.code().or(Some(-1)),
                        None,
                        String::from_utf8_lossy(&output.stdout).into_owned(),
                        String::from_utf8_lossy(&output.stderr).into_owned(),
                        duration_ms,
                    ),
                    Err(err) => InvocationResult::transport_failure(
                        InvokeErrorKind::Transport,
                        format!("wait failed: {err}"),
                        duration_ms,
                    ),
                }
            }
            _ = tokio::time::sleep(ctx.timeout()) => {
                InvocationResult::transport_failure(
                    InvokeErrorKind::Timeout,
                    format!("process exceeded {} ms", ctx.limits.timeout_ms),
                    elapsed_ms(started),
                )
            }
            _ = cancel.cancelled() => cancelled_result(started),
        }
    }

    async fn invoke_webhook(
        &self,
        ctx: &ExecutionContext,
        cancel: &CancellationToken,
        started: Instant,
    ) -> InvocationResult {
        let config = match self.registry.config(&ctx.agent_id) {
            Ok(config) => config,
            Err(err) => return transport_err(err.to_string(), started),
        };
        let endpoint = match config.endpoint {
            Some(endpoint) => endpoint,
            None => return transport_err("no endpoint configured".into(), started),
        };

        let request = self
            .http
            .post(&endpoint)
            .header("X-Agent-Name", &ctx.agent_id)
            .header("X-Phase", ctx.phase.to_string())
            .header("X-Execution-Id", ctx.execution_id.to_string())
            .json(&ctx.inputs)
            .timeout(ctx.timeout());

        tokio::select! {
            response = request.send() => {
                let duration_ms = elapsed_ms(started);
                match response {
                    Ok(response) => {
                        let status = response.status().as_u16();
                        let body = response.text().await.unwrap_or_default();
                        InvocationResult::completed(None, Some(status), body, String::new(), duration_ms)
                    }
                    Err(err) if err.is_timeout() => InvocationResult::transport_failure(
                        InvokeErrorKind::Timeout,
                        format!("webhook exceeded {} ms", ctx.limits.timeout_ms),
                        duration_ms,
                    ),
                    Err(err) => InvocationResult::transport_failure(
                        InvokeErrorKind::Transport,
                        format!("webhook request failed: {err}"),
                        duration_ms,
                    ),
                }
            }
            _ = cancel.cancelled() => cancelled_result(started),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum CommandInput {
    /// Inputs appended as a trailing JSON argument.
    Argument,
    /// Inputs streamed to the child's stdin.
    Stdin,
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

fn transport_err(message: String, started: Instant) -> InvocationResult {
    InvocationResult::transport_failure(InvokeErrorKind::Transport, message, elapsed_ms(started))
}

fn cancelled_result(started: Instant) -> InvocationResult {
    InvocationResult::transport_failure(
        InvokeErrorKind::Cancelled,
        "invocation cancelled".to_string(),
        elapsed_ms(started),
    )
}
