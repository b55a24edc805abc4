//! Output collector: normalizes raw invocation results into a structured
//! artifact, classified logs, and metrics, and persists the artifact bytes.
//!
//! The artifact id downstream is derived from the canonical byte form
//! produced here, so two invocations emitting the same content always
//! collide to the same id.

use crate::exec::{ExecutionContext, InvocationResult};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::OnceLock;

/// Marker appended to output cut at `max_output_size`.
pub const TRUNCATED_MARKER: &str = "[TRUNCATED]";

/// Log line severity, parsed from conventional level prefixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Which stream a log line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogSource {
    Stdout,
    Stderr,
}

/// One classified log line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    pub level: LogLevel,
    pub source: LogSource,
    pub message: String,
}

/// Invocation-level metrics carried into reports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationMetrics {
    pub duration_ms: u64,
    pub exit_code: Option<i32>,
    pub http_status: Option<u16>,
    pub ok: bool,
}

/// The normalized output of one invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectedOutput {
    /// The extracted artifact object, when the agent produced one.
    pub artifact: Option<Value>,
    /// Where the artifact bytes were persisted.
    pub artifact_path: Option<PathBuf>,
    /// Hex sha-256 of the artifact's canonical bytes.
    pub artifact_hash: Option<String>,
    pub logs: Vec<LogLine>,
    pub metrics: InvocationMetrics,
    pub stdout: String,
    pub stderr: String,
    pub truncated: bool,
}

/// Collector tuning.
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Per-stream output cap in bytes before truncation.
    pub max_output_size: usize,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            max_output_size: 256 * 1024,
        }
    }
}

/// Normalizes invocation results.
#[derive(Debug, Clone, Default)]
pub struct OutputCollector {
    config: CollectorConfig,
}

impl OutputCollector {
    pub fn new(config: CollectorConfig) -> Self {
        Self { config }
    }

    /// Normalize one invocation result and persist its artifact and log file.
    pub fn collect(
        &self,
        result: &InvocationResult,
        ctx: &ExecutionContext,
    ) -> anyhow::Result<CollectedOutput> {
        let (stdout, stdout_truncated) = truncate(&result.stdout, self.config.max_output_size);
        let (stderr, stderr_truncated) = truncate(&result.stderr, self.config.max_output_size);
        let truncated = stdout_truncated || stderr_truncated;

        let artifact = if result.ok {
            extract_artifact(&result.stdout)
        } else {
            None
        };

        let (artifact_path, artifact_hash) = match &artifact {
            Some(value) => {
                let bytes = canonical_bytes(value);
                let hash = content_hash(&bytes);
                let path = ctx.paths.artifact_dir.join("artifact.json");
                std::fs::write(&path, &bytes)?;
                (Some(path), Some(hash))
            }
            None => (None, None),
        };

        let mut logs = classify_lines(&stderr, LogSource::Stderr);
        logs.extend(classify_lines(&stdout, LogSource::Stdout));

        self.write_log_file(ctx, &stdout, &stderr)?;

        Ok(CollectedOutput {
            artifact,
            artifact_path,
            artifact_hash,
            logs,
            metrics: InvocationMetrics {
                duration_ms: result.duration_ms,
                exit_code: result.exit_code,
                http_status: result.http_status,
                ok: result.ok,
            },
            stdout,
            stderr,
            truncated,
        })
    }

    fn write_log_file(
        &self,
        ctx: &ExecutionContext,
        stdout: &str,
        stderr: &str,
    ) -> anyhow::Result<()> {
        let path = ctx.paths.log_dir.join(format!("{}.log", ctx.execution_id));
        let mut file = std::fs::File::create(path)?;
        writeln!(file, "# agent: {} phase: {}", ctx.agent_id, ctx.phase)?;
        if !stdout.is_empty() {
            writeln!(file, "--- stdout ---")?;
            writeln!(file, "{stdout}")?;
        }
        if !stderr.is_empty() {
            writeln!(file, "--- stderr ---")?;
            writeln!(file, "{stderr}")?;
        }
        Ok(())
    }
}

/// Pull the artifact object out of agent stdout: a typed `artifact` field
/// wins, otherwise the whole stdout JSON object counts.
fn extract_artifact(stdout: &str) -> Option<Value> {
    let raw = extract_json_object(stdout)?;
    let value: Value = serde_json::from_str(&raw).ok()?;
    match value.get("artifact") {
        Some(artifact) if artifact.is_object() => Some(artifact.clone()),
        _ if value.is_object() => Some(value),
        _ => None,
    }
}

/// Find the outermost JSON object in free-form text by brace counting.
/// Braces inside string literals are accounted for.
pub fn extract_json_object(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(text[start..start + i + 1].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

/// Canonical byte serialization: object keys sorted recursively, no
/// insignificant whitespace. Equal content yields equal bytes.
pub fn canonical_bytes(value: &Value) -> Vec<u8> {
    serde_json::to_vec(&canonicalize(value)).unwrap_or_default()
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, Value> =
                map.iter().map(|(k, v)| (k, canonicalize(v))).collect();
            let mut out = serde_json::Map::new();
            for (key, val) in sorted {
                out.insert(key.clone(), val);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Hex sha-256 over bytes.
pub fn content_hash(bytes: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

fn level_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)^\s*\[?(trace|debug|info|warn(?:ing)?|error|err)\]?[:\s]").unwrap_or_else(
            |err| unreachable!("level pattern is invalid: {err}"),
        )
    })
}

fn classify_lines(text: &str, source: LogSource) -> Vec<LogLine> {
    let default_level = match source {
        LogSource::Stdout => LogLevel::Info,
        LogSource::Stderr => LogLevel::Warn,
    };
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let level = match level_pattern().captures(line) {
                Some(caps) => match caps
                    .get(1)
                    .map(|m| m.as_str().to_ascii_lowercase())
                    .as_deref()
                {
                    Some("trace") | Some("debug") => LogLevel::Debug,
                    Some("info") => LogLevel::Info,
                    Some("warn") | Some("warning") => LogLevel::Warn,
                    Some("error") | Some("err") => LogLevel::Error,
                    _ => default_level,
                },
                None => default_level,
            };
            LogLine {
                level,
                source,
                message: line.to_string(),
            }
        })
        .collect()
}

/// Cut `text` at `max` bytes (on a char boundary) and flag the cut.
fn truncate(text: &str, max: usize) -> (String, bool) {
    if text.len() <= max {
        return (text.to_string(), false);
    }
    let mut cut = max;
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    (format!("{}\n{}", &text[..cut], TRUNCATED_MARKER), true)
}
