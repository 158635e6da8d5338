//! Isolated worker processes
//!
//! Every invocation gets its own child process: `<program> <args...> <entry>`.
//! The invocation request is written to the worker's stdin as one JSON
//! document. The worker prints its result as the last non-empty line of
//! stdout; everything on stderr is function logging. A line carrying
//! `streamPort` hands the body off to a TCP connection on localhost as soon
//! as it is printed, and the worker keeps running until the body is served.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::TcpStream;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::event::InvocationEvent;
use crate::identity::ClientContext;
use crate::invocation::{FunctionOutput, InvocationError};

pub const EXIT_ERROR: &str = "Runtime.ExitError";
pub const MALFORMED_OUTPUT: &str = "Runtime.MalformedOutput";
pub const SPAWN_ERROR: &str = "Runtime.SpawnError";
pub const STREAM_ERROR: &str = "Runtime.StreamError";

const STREAM_PORT_FIELD: &str = "streamPort";
const STDERR_TAIL_LINES: usize = 20;

/// Command used to start workers
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub program: String,
    pub args: Vec<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            program: "node".to_string(),
            args: Vec::new(),
        }
    }
}

/// Document written to the worker's stdin
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerRequest<'a> {
    /// JSON-encoded client context, `{}` when absent
    pub client_context: String,
    pub environment: &'a HashMap<String, String>,
    pub event: &'a InvocationEvent,
    pub entry_file_path: String,
    pub timeout_ms: u64,
}

/// What a worker reported
#[derive(Debug, PartialEq)]
pub enum WorkerOutcome {
    Complete(Value),
    Failed(InvocationError),
    StreamHandoff { port: u16, partial: Value },
}

impl WorkerOutcome {
    pub fn classify(message: Value) -> Self {
        if let Value::Object(mut fields) = message {
            if let Some(port) = fields.remove(STREAM_PORT_FIELD) {
                let port = port
                    .as_u64()
                    .or_else(|| port.as_str().and_then(|s| s.parse().ok()))
                    .and_then(|p| u16::try_from(p).ok());
                return match port {
                    Some(port) => Self::StreamHandoff {
                        port,
                        partial: Value::Object(fields),
                    },
                    None => Self::Failed(InvocationError::new(
                        STREAM_ERROR,
                        "Worker reported an invalid stream port",
                    )),
                };
            }

            let is_error = !fields.contains_key("statusCode")
                && (fields.contains_key("errorType") || fields.contains_key("errorMessage"));
            if is_error {
                return match serde_json::from_value(Value::Object(fields)) {
                    Ok(error) => Self::Failed(error),
                    Err(e) => Self::Failed(InvocationError::new(MALFORMED_OUTPUT, e.to_string())),
                };
            }

            return Self::Complete(Value::Object(fields));
        }
        Self::Complete(message)
    }
}

/// Connect to the port a worker streams its body on
pub async fn connect_stream(port: u16) -> Result<TcpStream, InvocationError> {
    TcpStream::connect(("127.0.0.1", port)).await.map_err(|e| {
        InvocationError::new(
            STREAM_ERROR,
            format!("Could not connect to response stream on port {port}: {e}"),
        )
    })
}

/// What the worker's stdout reported before it stopped talking
enum Report {
    Handoff { port: u16, partial: Value },
    Finished(Option<String>),
}

/// Spawns one worker per invocation
#[derive(Debug, Clone)]
pub struct WorkerRunner {
    config: WorkerConfig,
}

impl WorkerRunner {
    pub fn new(config: WorkerConfig) -> Self {
        Self { config }
    }

    pub async fn run(
        &self,
        function: &str,
        entry: &Path,
        event: &InvocationEvent,
        client_context: Option<&ClientContext>,
        environment: &HashMap<String, String>,
        timeout: Duration,
    ) -> Result<FunctionOutput, InvocationError> {
        let deadline = Instant::now() + timeout;

        let client_context = match client_context {
            Some(context) => serde_json::to_string(context),
            None => Ok("{}".to_string()),
        }
        .map_err(|e| InvocationError::new(MALFORMED_OUTPUT, e.to_string()))?;

        let entry_file_path = url::Url::from_file_path(entry)
            .map(|url| url.to_string())
            .unwrap_or_else(|_| entry.display().to_string());

        let request = WorkerRequest {
            client_context,
            environment,
            event,
            entry_file_path,
            timeout_ms: timeout.as_millis() as u64,
        };
        let payload = serde_json::to_vec(&request)
            .map_err(|e| InvocationError::new(MALFORMED_OUTPUT, e.to_string()))?;

        debug!(
            function = %function,
            program = %self.config.program,
            entry = %entry.display(),
            "Spawning worker"
        );

        let mut child = Command::new(&self.config.program)
            .args(&self.config.args)
            .arg(entry)
            .envs(environment)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                InvocationError::new(
                    SPAWN_ERROR,
                    format!("Could not start worker '{}': {e}", self.config.program),
                )
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            tokio::spawn(async move {
                // A worker may exit without reading its input
                if let Err(e) = stdin.write_all(&payload).await {
                    if e.kind() != std::io::ErrorKind::BrokenPipe {
                        debug!(error = %e, "Could not write invocation to worker");
                    }
                }
                let _ = stdin.shutdown().await;
            });
        }

        let stderr = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(log_stderr(function.to_string(), stderr)));

        let Some(stdout) = child.stdout.take() else {
            return Err(InvocationError::new(SPAWN_ERROR, "Worker has no stdout"));
        };
        let mut stdout = BufReader::new(stdout).lines();

        // Dropping the child on any early return kills it
        let report = match tokio::time::timeout_at(deadline, read_report(function, &mut stdout)).await
        {
            Ok(Ok(report)) => report,
            Ok(Err(e)) => {
                return Err(InvocationError::new(
                    EXIT_ERROR,
                    format!("Could not read worker output: {e}"),
                ))
            }
            Err(_) => return Err(timed_out(function, timeout)),
        };

        let message = match report {
            Report::Handoff { port, partial } => {
                let stream = match connect_stream(port).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = child.kill().await;
                        return Err(e);
                    }
                };
                debug!(function = %function, port, "Worker handed off its response stream");
                tokio::spawn(reap(function.to_string(), child, stdout, deadline));
                return Ok(FunctionOutput {
                    value: partial,
                    stream: Some(stream),
                });
            }
            Report::Finished(message) => message,
        };

        let status = match tokio::time::timeout_at(deadline, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                return Err(InvocationError::new(
                    EXIT_ERROR,
                    format!("Worker failed: {e}"),
                ))
            }
            Err(_) => return Err(timed_out(function, timeout)),
        };

        let exit_error = |tail: Vec<String>| {
            InvocationError::new(EXIT_ERROR, format!("Worker exited with {status}"))
                .with_stack_trace(tail)
        };

        match message {
            Some(line) => match serde_json::from_str::<Value>(&line) {
                Ok(value) => match WorkerOutcome::classify(value) {
                    WorkerOutcome::Complete(value) => Ok(FunctionOutput::value(value)),
                    WorkerOutcome::Failed(error) => Err(error),
                    WorkerOutcome::StreamHandoff { .. } => Err(InvocationError::new(
                        STREAM_ERROR,
                        "Worker exited before serving its response stream",
                    )),
                },
                Err(_) if !status.success() => Err(exit_error(stderr_tail(stderr, deadline).await)),
                Err(e) => Err(InvocationError::new(
                    MALFORMED_OUTPUT,
                    format!("Worker printed a result that is not JSON: {e}"),
                )),
            },
            None if status.success() => Ok(FunctionOutput::value(Value::Null)),
            None => Err(exit_error(stderr_tail(stderr, deadline).await)),
        }
    }
}

fn timed_out(function: &str, timeout: Duration) -> InvocationError {
    warn!(
        function = %function,
        timeout_ms = timeout.as_millis() as u64,
        "Worker timed out"
    );
    InvocationError::timeout(function, timeout)
}

/// Read stdout until the worker hands off a stream or closes its output.
/// Every line but the last is console output.
async fn read_report(
    function: &str,
    lines: &mut Lines<BufReader<ChildStdout>>,
) -> std::io::Result<Report> {
    let mut last: Option<String> = None;

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Ok(value) = serde_json::from_str::<Value>(line) {
            if let WorkerOutcome::StreamHandoff { port, partial } = WorkerOutcome::classify(value) {
                if let Some(previous) = last.take() {
                    info!(function = %function, "{previous}");
                }
                return Ok(Report::Handoff { port, partial });
            }
        }

        if let Some(previous) = last.replace(line.to_string()) {
            info!(function = %function, "{previous}");
        }
    }

    Ok(Report::Finished(last))
}

/// Log stderr as it arrives and keep the last lines for exit errors
async fn log_stderr(function: String, stderr: ChildStderr) -> Vec<String> {
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    let mut lines = BufReader::new(stderr).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        info!(function = %function, "{line}");
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }

    Vec::from(tail)
}

async fn stderr_tail(stderr: Option<JoinHandle<Vec<String>>>, deadline: Instant) -> Vec<String> {
    match stderr {
        Some(task) => match tokio::time::timeout_at(deadline, task).await {
            Ok(Ok(tail)) => tail,
            _ => Vec::new(),
        },
        None => Vec::new(),
    }
}

/// Keep a streaming worker alive until it exits, killing it at the deadline
async fn reap(
    function: String,
    mut child: Child,
    mut stdout: Lines<BufReader<ChildStdout>>,
    deadline: Instant,
) {
    let exited = tokio::time::timeout_at(deadline, async {
        while let Ok(Some(line)) = stdout.next_line().await {
            if !line.trim().is_empty() {
                info!(function = %function, "{line}");
            }
        }
        child.wait().await
    })
    .await;

    match exited {
        Ok(Ok(status)) => debug!(function = %function, %status, "Streaming worker exited"),
        Ok(Err(e)) => warn!(function = %function, error = %e, "Could not wait for streaming worker"),
        Err(_) => {
            warn!(function = %function, "Streaming worker still running at its deadline, killing it");
            let _ = child.kill().await;
        }
    }
}
