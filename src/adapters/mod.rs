//! Adapters for external worker processes.
//!
//! Workers are out-of-core executables that do the actual key generation,
//! balance queries, funding transfers and bundle submission. This module
//! only supervises them through their process-level contract:
//!
//! - `worker`: spawning, channel consumption, request/response calls
//! - `streaming`: early-resolve on a status line, durable write on exit
//! - `pipeline`: primary call with a conditional nested call

pub mod pipeline;
pub mod streaming;
pub mod worker;

pub use pipeline::{FollowUp, NestedCall, PipelineOutcome};
pub use streaming::{
    Action, BatchSink, CompletionHandle, CompletionReport, EarlyResolution, ResolutionMachine,
    StatusMatcher, StreamEvent,
};
pub use worker::{ExitReport, ProcessOrchestrator, WorkerError, WorkerEvent};
