//! Worker process supervision.
//!
//! Every worker call spawns one child process and consumes two channels
//! while it runs: stderr as a line-oriented status stream, and stdout as an
//! output buffer that is only interpreted once the process has exited.
//!
//! Nothing here retries, times out or cancels a worker. Once spawned, a
//! worker runs to completion and each request invokes it at most once.

use std::process::Stdio;

use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader, Split};
use tokio::process::{Child, ChildStderr, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::domain::{WorkerInvocation, WorkerResult};

/// Ways a worker call can fail
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The process could not be started
    #[error("Failed to spawn worker '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The process exited with a failure status
    #[error("Worker exited with code {code}: {diagnostics}")]
    NonZeroExit { code: i32, diagnostics: String },

    /// Exit succeeded but stdout was not a JSON document
    #[error("Failed to parse worker output: {reason}")]
    MalformedOutput {
        reason: String,
        output: String,
        diagnostics: String,
    },

    /// Output parsed but reported `success: false`
    #[error("{message}")]
    Application { message: String, diagnostics: String },

    /// Streaming call: the worker finished cleanly without ever emitting
    /// the status line the caller was waiting for
    #[error("Worker exited without emitting the expected status line")]
    MissingSignal { diagnostics: String },
}

impl WorkerError {
    /// Captured status-stream text, if any
    pub fn diagnostics(&self) -> &str {
        match self {
            Self::Spawn { .. } => "",
            Self::NonZeroExit { diagnostics, .. }
            | Self::MalformedOutput { diagnostics, .. }
            | Self::Application { diagnostics, .. }
            | Self::MissingSignal { diagnostics } => diagnostics,
        }
    }

    /// Stable kind tag used in responses
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Spawn { .. } => "worker_spawn",
            Self::NonZeroExit { .. } => "worker_exit",
            Self::MalformedOutput { .. } => "worker_output",
            Self::Application { .. } => "worker_application",
            Self::MissingSignal { .. } => "worker_signal",
        }
    }
}

/// How a worker process ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitReport {
    pub success: bool,

    /// Exit code, -1 when terminated by a signal or the wait failed
    pub code: i32,

    /// Everything the worker wrote to stdout
    pub output: Vec<u8>,
}

impl ExitReport {
    /// Resolve a finished request/response call
    pub fn into_result(self, diagnostics: String) -> Result<Value, WorkerError> {
        if !self.success {
            return Err(WorkerError::NonZeroExit {
                code: self.code,
                diagnostics,
            });
        }

        match WorkerResult::parse(&self.output) {
            Ok(WorkerResult::Success { payload }) => Ok(payload),
            Ok(WorkerResult::ApplicationError { message }) => {
                Err(WorkerError::Application { message, diagnostics })
            }
            Err(e) => Err(WorkerError::MalformedOutput {
                reason: e.to_string(),
                output: String::from_utf8_lossy(&self.output).into_owned(),
                diagnostics,
            }),
        }
    }
}

/// Observations from a running worker, in the order they happened
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    /// One line from the status stream
    Line(String),

    /// The process is gone; always the last event
    Exited(ExitReport),
}

/// A spawned worker process
pub(crate) struct WorkerProcess {
    child: Child,
    status: Option<Split<BufReader<ChildStderr>>>,
    output: Option<JoinHandle<std::io::Result<Vec<u8>>>>,
    exited: bool,
}

impl WorkerProcess {
    /// Launch the worker with both channels piped
    pub(crate) fn spawn(invocation: &WorkerInvocation) -> std::io::Result<Self> {
        let mut child = Command::new(&invocation.command)
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("worker stdout was not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| std::io::Error::other("worker stderr was not captured"))?;

        // Drain stdout concurrently so a chatty worker never blocks on a
        // full pipe while we are reading stderr.
        let output = tokio::spawn(async move {
            let mut buffer = Vec::new();
            stdout.read_to_end(&mut buffer).await?;
            Ok::<_, std::io::Error>(buffer)
        });

        Ok(Self {
            child,
            status: Some(BufReader::new(stderr).split(b'\n')),
            output: Some(output),
            exited: false,
        })
    }

    /// Next observation: status lines until stderr closes, then the exit.
    pub(crate) async fn next_event(&mut self) -> Option<WorkerEvent> {
        if let Some(status) = self.status.as_mut() {
            match status.next_segment().await {
                Ok(Some(bytes)) => return Some(WorkerEvent::Line(decode_line(&bytes))),
                Ok(None) => self.status = None,
                Err(e) => {
                    warn!(error = %e, "Failed to read worker status stream");
                    self.status = None;
                }
            }
        }

        if self.exited {
            return None;
        }
        self.exited = true;

        Some(WorkerEvent::Exited(self.finish().await))
    }

    async fn finish(&mut self) -> ExitReport {
        let output = match self.output.take() {
            Some(handle) => match handle.await {
                Ok(Ok(buffer)) => buffer,
                Ok(Err(e)) => {
                    warn!(error = %e, "Failed to read worker output");
                    Vec::new()
                }
                Err(e) => {
                    warn!(error = %e, "Worker output reader aborted");
                    Vec::new()
                }
            },
            None => Vec::new(),
        };

        match self.child.wait().await {
            Ok(status) => ExitReport {
                success: status.success(),
                code: status.code().unwrap_or(-1),
                output,
            },
            Err(e) => {
                warn!(error = %e, "Failed to wait for worker process");
                ExitReport {
                    success: false,
                    code: -1,
                    output,
                }
            }
        }
    }

    /// Consume every event, collecting the status text
    pub(crate) async fn run_to_exit(mut self) -> (ExitReport, String) {
        let mut lines = Vec::new();

        while let Some(event) = self.next_event().await {
            match event {
                WorkerEvent::Line(line) => {
                    debug!(%line, "worker status");
                    lines.push(line);
                }
                WorkerEvent::Exited(report) => return (report, lines.join("\n")),
            }
        }

        // next_event always yields Exited before None
        let report = ExitReport {
            success: false,
            code: -1,
            output: Vec::new(),
        };
        (report, lines.join("\n"))
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    text.strip_suffix('\r').unwrap_or(text.as_ref()).to_string()
}

/// Supervisor for external worker invocations.
///
/// Holds no state between calls: concurrent invocations share nothing, and
/// there is no cap on how many workers run at once.
#[derive(Debug, Clone, Default)]
pub struct ProcessOrchestrator;

impl ProcessOrchestrator {
    pub fn new() -> Self {
        Self
    }

    /// Request/response call: wait for exit, then parse the output.
    #[instrument(
        skip(self, invocation),
        fields(
            invocation_id = %Uuid::new_v4(),
            command = %invocation.command,
            args = %invocation.fingerprint(),
        )
    )]
    pub async fn invoke(&self, invocation: &WorkerInvocation) -> Result<Value, WorkerError> {
        let process = WorkerProcess::spawn(invocation).map_err(|source| WorkerError::Spawn {
            command: invocation.command.clone(),
            source,
        })?;

        let (report, diagnostics) = process.run_to_exit().await;
        let code = report.code;
        let result = report.into_result(diagnostics);

        match &result {
            Ok(_) => info!(code, "Worker completed"),
            Err(e) => warn!(code, kind = e.kind(), error = %e, "Worker failed"),
        }

        result
    }
}
