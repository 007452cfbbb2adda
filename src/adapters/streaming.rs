//! Streaming early-resolve with deferred durable completion.
//!
//! The worker performs two sequential actions: a primary submission the
//! caller is waiting on, then a slower batch the caller does not need. The
//! status stream is scanned for the primary identifier; the first match
//! answers the caller while the process keeps running. On exit the output
//! buffer is parsed independently and, if it holds a batch, persisted.
//!
//! Two single-assignment flags drive this and are deliberately independent:
//! `responded` (the caller is answered at most once) and `persisted` (the
//! batch is written at most once).

use std::marker::PhantomData;

use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use serde::de::DeserializeOwned;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use crate::domain::WorkerInvocation;

use super::worker::{ExitReport, ProcessOrchestrator, WorkerError, WorkerEvent, WorkerProcess};

/// Recognizes the status line that carries the early identifier.
#[derive(Debug, Clone)]
pub struct StatusMatcher {
    regex: Regex,
}

impl StatusMatcher {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            regex: Regex::new(pattern)?,
        })
    }

    /// Identifier carried by `line`: the first capture group, or the whole
    /// match when the pattern has no groups.
    pub fn extract(&self, line: &str) -> Option<String> {
        let captures = self.regex.captures(line)?;
        captures
            .get(1)
            .or_else(|| captures.get(0))
            .map(|m| m.as_str().to_string())
    }

    pub fn pattern(&self) -> &str {
        self.regex.as_str()
    }
}

/// Inputs to the resolution machine
#[derive(Debug)]
pub enum StreamEvent {
    LineObserved(String),
    ProcessExited(ExitReport),
    SpawnFailed {
        command: String,
        source: std::io::Error,
    },
}

impl From<WorkerEvent> for StreamEvent {
    fn from(event: WorkerEvent) -> Self {
        match event {
            WorkerEvent::Line(line) => Self::LineObserved(line),
            WorkerEvent::Exited(report) => Self::ProcessExited(report),
        }
    }
}

/// What the driver must do after an event
#[derive(Debug)]
pub enum Action<B> {
    /// Answer the caller
    Respond(Result<String, WorkerError>),

    /// Write the batch to durable storage
    Persist(B),

    /// Nothing for the caller; record for operators
    Diagnostic(String),
}

/// Finite-state machine reconciling the status stream with the exit.
#[derive(Debug)]
pub struct ResolutionMachine<B> {
    matcher: StatusMatcher,
    responded: bool,
    persisted: bool,
    exited: bool,
    status_lines: Vec<String>,
    _batch: PhantomData<fn() -> B>,
}

impl<B: DeserializeOwned> ResolutionMachine<B> {
    pub fn new(matcher: StatusMatcher) -> Self {
        Self {
            matcher,
            responded: false,
            persisted: false,
            exited: false,
            status_lines: Vec::new(),
            _batch: PhantomData,
        }
    }

    pub fn has_responded(&self) -> bool {
        self.responded
    }

    pub fn has_persisted(&self) -> bool {
        self.persisted
    }

    /// Status text observed so far
    pub fn diagnostics(&self) -> String {
        self.status_lines.join("\n")
    }

    /// Feed one event, get the actions it triggers
    pub fn handle(&mut self, event: StreamEvent) -> Vec<Action<B>> {
        match event {
            StreamEvent::LineObserved(line) => self.on_line(line),
            StreamEvent::ProcessExited(report) => self.on_exit(report),
            StreamEvent::SpawnFailed { command, source } => self.on_spawn_failed(command, source),
        }
    }

    fn on_line(&mut self, line: String) -> Vec<Action<B>> {
        let mut actions = Vec::new();

        if let Some(identifier) = self.matcher.extract(&line) {
            if self.responded {
                actions.push(Action::Diagnostic(format!(
                    "ignoring repeated status signal {}",
                    identifier
                )));
            } else {
                self.responded = true;
                actions.push(Action::Respond(Ok(identifier)));
            }
        }

        self.status_lines.push(line);
        actions
    }

    fn on_exit(&mut self, report: ExitReport) -> Vec<Action<B>> {
        if self.exited {
            return vec![Action::Diagnostic("ignoring duplicate exit".to_string())];
        }
        self.exited = true;

        let mut actions = Vec::new();

        if !self.persisted {
            match serde_json::from_slice::<B>(&report.output) {
                Ok(batch) => {
                    self.persisted = true;
                    actions.push(Action::Persist(batch));
                }
                Err(e) => actions.push(Action::Diagnostic(format!(
                    "worker output holds no batch result: {}",
                    e
                ))),
            }
        }

        if !self.responded {
            self.responded = true;
            let diagnostics = self.diagnostics();
            let failure = if report.success {
                WorkerError::MissingSignal { diagnostics }
            } else {
                WorkerError::NonZeroExit {
                    code: report.code,
                    diagnostics,
                }
            };
            actions.push(Action::Respond(Err(failure)));
        } else if !report.success {
            actions.push(Action::Diagnostic(format!(
                "worker exited with code {} after the caller was answered",
                report.code
            )));
        }

        actions
    }

    fn on_spawn_failed(&mut self, command: String, source: std::io::Error) -> Vec<Action<B>> {
        self.exited = true;
        if self.responded {
            return vec![Action::Diagnostic(format!("spawn failure after response: {}", source))];
        }
        self.responded = true;
        vec![Action::Respond(Err(WorkerError::Spawn { command, source }))]
    }
}

/// Durable destination for a completed batch
#[async_trait]
pub trait BatchSink<B>: Send + Sync {
    async fn persist(&self, batch: B) -> Result<()>;
}

/// What happened after the caller was answered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionReport {
    pub responded: bool,
    pub persisted: bool,
    pub diagnostics: String,
}

/// Handle on the background supervision of a streaming call.
///
/// Dropping it detaches: while the runtime lives, the worker still runs to
/// completion and the batch is still persisted. Shutting the runtime down
/// ends the supervision, so long-lived owners keep the handle and wait.
#[derive(Debug)]
pub struct CompletionHandle(JoinHandle<CompletionReport>);

impl CompletionHandle {
    pub fn is_finished(&self) -> bool {
        self.0.is_finished()
    }

    /// Wait for the worker to exit and the batch write to finish
    pub async fn wait(self) -> Result<CompletionReport, tokio::task::JoinError> {
        self.0.await
    }
}

/// The caller's answer from a streaming call
#[derive(Debug)]
pub struct EarlyResolution {
    /// Identifier extracted from the status stream
    pub identifier: String,

    pub completion: CompletionHandle,
}

impl ProcessOrchestrator {
    /// Streaming call: resolve on the first matching status line, persist
    /// the batch through `sink` once the worker exits.
    ///
    /// A failure status only reaches the caller if no status line matched
    /// first; afterwards it is logged and nothing else.
    pub async fn invoke_streaming<B, S>(
        &self,
        invocation: WorkerInvocation,
        matcher: StatusMatcher,
        sink: S,
    ) -> Result<EarlyResolution, WorkerError>
    where
        B: DeserializeOwned + Send + 'static,
        S: BatchSink<B> + 'static,
    {
        let span = tracing::info_span!(
            "invoke_streaming",
            invocation_id = %Uuid::new_v4(),
            command = %invocation.command,
            args = %invocation.fingerprint(),
        );

        let (tx, rx) = oneshot::channel();
        let machine = ResolutionMachine::<B>::new(matcher);
        let task = tokio::spawn(supervise(invocation, machine, sink, tx).instrument(span));

        match rx.await {
            Ok(Ok(identifier)) => Ok(EarlyResolution {
                identifier,
                completion: CompletionHandle(task),
            }),
            Ok(Err(e)) => Err(e),
            // The supervisor always answers before it finishes; this only
            // happens if it panicked.
            Err(_) => Err(WorkerError::MissingSignal {
                diagnostics: "worker supervisor ended without answering".to_string(),
            }),
        }
    }
}

async fn supervise<B, S>(
    invocation: WorkerInvocation,
    mut machine: ResolutionMachine<B>,
    sink: S,
    tx: oneshot::Sender<Result<String, WorkerError>>,
) -> CompletionReport
where
    B: DeserializeOwned + Send + 'static,
    S: BatchSink<B>,
{
    let mut responder = Some(tx);

    match WorkerProcess::spawn(&invocation) {
        Ok(mut process) => {
            while let Some(event) = process.next_event().await {
                if let WorkerEvent::Line(line) = &event {
                    debug!(%line, "worker status");
                }
                let actions = machine.handle(event.into());
                apply(actions, &mut responder, &sink).await;
            }
        }
        Err(source) => {
            let actions = machine.handle(StreamEvent::SpawnFailed {
                command: invocation.command.clone(),
                source,
            });
            apply(actions, &mut responder, &sink).await;
        }
    }

    CompletionReport {
        responded: machine.has_responded(),
        persisted: machine.has_persisted(),
        diagnostics: machine.diagnostics(),
    }
}

async fn apply<B, S>(
    actions: Vec<Action<B>>,
    responder: &mut Option<oneshot::Sender<Result<String, WorkerError>>>,
    sink: &S,
) where
    S: BatchSink<B>,
{
    for action in actions {
        match action {
            Action::Respond(result) => {
                match &result {
                    Ok(identifier) => info!(%identifier, "Status signal observed, answering caller"),
                    Err(e) => warn!(kind = e.kind(), error = %e, "Worker failed before signalling"),
                }
                if let Some(tx) = responder.take() {
                    if tx.send(result).is_err() {
                        debug!("Caller went away before the response was delivered");
                    }
                }
            }
            Action::Persist(batch) => match sink.persist(batch).await {
                Ok(()) => info!("Worker batch persisted"),
                Err(e) => error!(error = %e, "Failed to persist worker batch"),
            },
            Action::Diagnostic(message) => warn!(%message, "Worker diagnostic"),
        }
    }
}
