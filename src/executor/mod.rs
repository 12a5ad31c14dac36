//! Subprocess executor — runs a skill's entry script over the
//! JSON-over-stdin/stdout contract.
//!
//! Invocation is `<entry_script> --json`; one request object
//! `{"command": …, "parameters": …}` goes to the child's stdin, stdin is
//! closed, and stdout is read to completion.  Calls are bounded by a
//! per-call deadline and a shared worker pool; saturated calls queue on
//! the pool semaphore.
//!
//! Child-level problems never raise; they come back as data in
//! [`ExecutionResult`].  Only a missing entry script is fatal.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::skills::Skill;

/// Default per-call deadline.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Hard ceiling on any per-call deadline override.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(120);

/// Grace period between SIGTERM and SIGKILL when tearing a child down.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Marker error: the skill's entry script cannot be started at all.
#[derive(Debug)]
pub struct SubprocessFailure(pub String);

impl std::fmt::Display for SubprocessFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "subprocess failure: {}", self.0)
    }
}

impl std::error::Error for SubprocessFailure {}

/// Structured outcome of one subprocess call.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub success: bool,
    /// Parsed JSON on success; raw stdout text on fallback.
    pub output: Value,
    pub error: Option<String>,
    pub exit_code: i32,
    pub duration: Duration,
}

impl ExecutionResult {
    fn failure(error: impl Into<String>, output: Value, exit_code: i32, duration: Duration) -> Self {
        Self {
            success: false,
            output,
            error: Some(error.into()),
            exit_code,
            duration,
        }
    }
}

/// Reentrant executor with a bounded worker pool.
///
/// Pool size is `min(cpu count × 2, 8)`.  Calls are never deduplicated
/// or cached.
pub struct SubprocessExecutor {
    permits: Arc<Semaphore>,
    default_timeout: Duration,
}

impl Default for SubprocessExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl SubprocessExecutor {
    pub fn new() -> Self {
        Self::with_default_timeout(DEFAULT_TIMEOUT)
    }

    /// Executor whose unspecified per-call timeout is `default_timeout`.
    pub fn with_default_timeout(default_timeout: Duration) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(pool_size())),
            default_timeout: default_timeout.min(MAX_TIMEOUT),
        }
    }

    /// Run `command` of `skill` with `parameters`.
    ///
    /// `timeout` overrides the executor default (clamped to
    /// [`MAX_TIMEOUT`]).  Cancellation terminates the child's process
    /// tree with the same SIGTERM → SIGKILL sequence a timeout uses.
    pub async fn execute(
        &self,
        skill: &Skill,
        command: &str,
        parameters: Value,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<ExecutionResult> {
        let _permit = self
            .permits
            .acquire()
            .await
            .context("executor pool closed")?;

        if !skill.entry_script.is_file() {
            return Err(anyhow::Error::new(SubprocessFailure(format!(
                "entry script missing for skill '{}': {}",
                skill.name,
                skill.entry_script.display()
            ))));
        }

        let deadline = timeout.unwrap_or(self.default_timeout).min(MAX_TIMEOUT);
        let request = json!({ "command": command, "parameters": parameters }).to_string();
        let start = Instant::now();

        let mut cmd = tokio::process::Command::new(&skill.entry_script);
        cmd.arg("--json")
            .current_dir(&skill.path)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        debug!(skill = %skill.name, command, "spawning skill subprocess");
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return Ok(ExecutionResult::failure(
                    format!("spawn failed: {e}"),
                    Value::Null,
                    -1,
                    start.elapsed(),
                ));
            }
        };

        // Write the request and close stdin so the child sees EOF.
        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(request.as_bytes()).await {
                debug!(skill = %skill.name, error = %e, "stdin write failed (child may have exited)");
            }
            drop(stdin);
        }

        let pid = child.id();
        let wait = child.wait_with_output();
        tokio::pin!(wait);

        let outcome = tokio::select! {
            res = &mut wait => Some(res),
            _ = tokio::time::sleep(deadline) => None,
            _ = cancel.cancelled() => {
                if let Some(pid) = pid {
                    terminate_group(pid).await;
                }
                return Ok(ExecutionResult::failure(
                    "cancelled",
                    Value::Null,
                    -1,
                    start.elapsed(),
                ));
            }
        };

        let output = match outcome {
            Some(res) => match res {
                Ok(out) => out,
                Err(e) => {
                    return Ok(ExecutionResult::failure(
                        format!("I/O error: {e}"),
                        Value::Null,
                        -1,
                        start.elapsed(),
                    ));
                }
            },
            None => {
                warn!(skill = %skill.name, command, timeout = ?deadline, "skill subprocess timed out");
                if let Some(pid) = pid {
                    terminate_group(pid).await;
                }
                return Ok(ExecutionResult::failure(
                    "timeout",
                    Value::Null,
                    -1,
                    start.elapsed(),
                ));
            }
        };

        let duration = start.elapsed();
        let exit_code = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        Ok(interpret_output(&stdout, &stderr, exit_code, duration))
    }
}

/// Apply the output contract: JSON stdout is authoritative, raw text
/// falls back on the exit code.
fn interpret_output(stdout: &str, stderr: &str, exit_code: i32, duration: Duration) -> ExecutionResult {
    match serde_json::from_str::<Value>(stdout) {
        Ok(value) => match value.get("success").and_then(Value::as_bool) {
            Some(false) => {
                let error = value
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("skill reported failure")
                    .to_string();
                ExecutionResult::failure(error, value, exit_code, duration)
            }
            Some(true) => ExecutionResult {
                success: true,
                output: value,
                error: None,
                exit_code,
                duration,
            },
            None if exit_code == 0 => ExecutionResult {
                success: true,
                output: value,
                error: None,
                exit_code,
                duration,
            },
            None => ExecutionResult::failure(
                if stderr.is_empty() {
                    format!("exit code {exit_code}")
                } else {
                    stderr.to_string()
                },
                value,
                exit_code,
                duration,
            ),
        },
        Err(parse_err) => {
            if exit_code == 0 && !stdout.is_empty() {
                ExecutionResult {
                    success: true,
                    output: Value::String(stdout.to_string()),
                    error: None,
                    exit_code,
                    duration,
                }
            } else {
                let error = if !stderr.is_empty() {
                    stderr.to_string()
                } else if stdout.is_empty() {
                    format!("exit code {exit_code}")
                } else {
                    format!("unparseable stdout: {parse_err}")
                };
                ExecutionResult::failure(error, Value::String(stdout.to_string()), exit_code, duration)
            }
        }
    }
}

/// Worker pool size: `min(cpu count × 2, 8)`, at least 1.
fn pool_size() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get() * 2)
        .unwrap_or(2)
        .clamp(1, 8)
}

/// SIGTERM the child's process group, wait the grace period, SIGKILL.
#[cfg(unix)]
async fn terminate_group(pid: u32) {
    let pgid = -(pid as i32);
    unsafe {
        libc::kill(pgid, libc::SIGTERM);
    }
    tokio::time::sleep(KILL_GRACE).await;
    unsafe {
        libc::kill(pgid, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
async fn terminate_group(_pid: u32) {
    // kill_on_drop covers the direct child on non-unix targets.
    let _ = KILL_GRACE;
}
