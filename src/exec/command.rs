// src/exec/command.rs

//! Worker backed by a shell command.
//!
//! The request is written to the child's stdin as JSON. On exit status 0
//! stdout is parsed as a [`WorkerOutput`]; any other JSON is taken as the
//! result payload, and non-JSON text as a string payload. The child is
//! killed when the call is cancelled.

use std::process::Stdio;

use anyhow::Context;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::WorkerError;
use crate::exec::worker::{Worker, WorkerFuture, WorkerOutput, WorkerRequest};
use crate::knowledge::ForwardedAdvice;
use crate::state::SharedState;

#[derive(Debug, Clone)]
pub struct CommandWorker {
    cmd: String,
}

#[derive(Serialize)]
struct RequestPayload<'a> {
    thread_id: &'a str,
    node_id: &'a str,
    worker: &'a str,
    description: &'a str,
    attempt: u32,
    context: &'a Value,
    advice: &'a [ForwardedAdvice],
    state: &'a SharedState,
}

impl CommandWorker {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self { cmd: cmd.into() }
    }

    pub fn cmd(&self) -> &str {
        &self.cmd
    }

    async fn run(
        &self,
        request: WorkerRequest,
        cancel: CancellationToken,
    ) -> Result<WorkerOutput, WorkerError> {
        let payload = serde_json::to_vec(&RequestPayload {
            thread_id: &request.thread_id,
            node_id: &request.node_id,
            worker: &request.worker,
            description: &request.description,
            attempt: request.attempt,
            context: &request.context,
            advice: &request.advice,
            state: request.state.state(),
        })
        .context("encoding worker request")?;

        info!(
            node = %request.node_id,
            attempt = request.attempt,
            cmd = %self.cmd,
            "starting worker process"
        );

        let mut cmd = if cfg!(windows) {
            let mut c = Command::new("cmd");
            c.arg("/C").arg(&self.cmd);
            c
        } else {
            let mut c = Command::new("sh");
            c.arg("-c").arg(&self.cmd);
            c
        };
        cmd.env("CONDUCTOR_THREAD", &request.thread_id)
            .env("CONDUCTOR_NODE", &request.node_id)
            .env("CONDUCTOR_ATTEMPT", request.attempt.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawning worker process for node '{}'", request.node_id))?;

        if let Some(mut stdin) = child.stdin.take() {
            let node = request.node_id.clone();
            tokio::spawn(async move {
                // A child that never reads stdin closes the pipe early.
                if let Err(e) = stdin.write_all(&payload).await {
                    debug!(node = %node, error = %e, "worker did not consume its request");
                }
            });
        }

        let stdout = child.stdout.take();
        let stdout_task = tokio::spawn(async move {
            let mut buf = String::new();
            if let Some(mut out) = stdout {
                let _ = out.read_to_string(&mut buf).await;
            }
            buf
        });

        let stderr = child.stderr.take();
        let node = request.node_id.clone();
        let stderr_task = tokio::spawn(async move {
            let mut last = None;
            if let Some(err) = stderr {
                let mut lines = BufReader::new(err).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(node = %node, "stderr: {}", line);
                    last = Some(line);
                }
            }
            last
        });

        tokio::select! {
            status = child.wait() => {
                let status = status.with_context(|| {
                    format!("waiting for worker process of node '{}'", request.node_id)
                })?;
                let stdout = stdout_task.await.unwrap_or_default();
                let last_err = stderr_task.await.ok().flatten();

                info!(
                    node = %request.node_id,
                    exit_code = status.code().unwrap_or(-1),
                    success = status.success(),
                    "worker process exited"
                );

                if !status.success() {
                    let mut msg = format!("command exited with code {}", status.code().unwrap_or(-1));
                    if let Some(line) = last_err {
                        msg.push_str(": ");
                        msg.push_str(&line);
                    }
                    return Err(WorkerError::Failed(msg));
                }
                Ok(parse_output(&stdout))
            }

            _ = cancel.cancelled() => {
                info!(node = %request.node_id, "cancellation requested; killing worker process");
                if let Err(e) = child.kill().await {
                    warn!(node = %request.node_id, error = %e, "failed to kill worker process");
                }
                Err(WorkerError::Cancelled)
            }
        }
    }
}

/// Interpret a worker's stdout.
pub fn parse_output(stdout: &str) -> WorkerOutput {
    let trimmed = stdout.trim();
    match serde_json::from_str::<Value>(trimmed) {
        Ok(value) => match serde_json::from_value::<WorkerOutput>(value.clone()) {
            Ok(output) if value.is_object() => output,
            _ => WorkerOutput::new(value),
        },
        Err(_) => WorkerOutput::new(Value::String(trimmed.to_string())),
    }
}

impl Worker for CommandWorker {
    fn execute(&self, request: WorkerRequest, cancel: CancellationToken) -> WorkerFuture<'_> {
        Box::pin(self.run(request, cancel))
    }
}
