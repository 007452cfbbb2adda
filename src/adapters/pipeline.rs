//! Pipeline with a conditional nested call.
//!
//! After the primary worker succeeds, a lookup decides whether a nested
//! request/response call runs. The nested outcome is reported next to the
//! primary result and never turns the whole call into a failure.

use std::future::Future;

use anyhow::Result;
use serde_json::Value;
use tracing::{info, warn};

use crate::domain::WorkerInvocation;

use super::worker::{ProcessOrchestrator, WorkerError};

/// The nested call to make, with whatever context the caller wants back
#[derive(Debug, Clone)]
pub struct NestedCall<C> {
    pub invocation: WorkerInvocation,
    pub context: C,
}

/// Outcome of the nested stage
#[derive(Debug)]
pub enum FollowUp<C> {
    /// The lookup found nothing to do
    Skipped,

    /// The lookup itself failed
    LookupFailed { error: String },

    /// The nested worker succeeded
    Completed { context: C, payload: Value },

    /// The nested worker failed
    Failed { context: C, error: WorkerError },
}

impl<C> FollowUp<C> {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

/// Primary payload plus the independent nested outcome
#[derive(Debug)]
pub struct PipelineOutcome<C> {
    pub primary: Value,
    pub follow_up: FollowUp<C>,
}

impl ProcessOrchestrator {
    /// Run `primary`; on success ask `lookup` for a nested call and run it.
    ///
    /// Only a primary failure is an `Err`.
    pub async fn invoke_pipeline<C, F, Fut>(
        &self,
        primary: &WorkerInvocation,
        lookup: F,
    ) -> Result<PipelineOutcome<C>, WorkerError>
    where
        F: FnOnce(Value) -> Fut,
        Fut: Future<Output = Result<Option<NestedCall<C>>>>,
    {
        let primary = self.invoke(primary).await?;

        let follow_up = match lookup(primary.clone()).await {
            Err(e) => {
                warn!(error = %e, "Nested stage lookup failed");
                FollowUp::LookupFailed {
                    error: e.to_string(),
                }
            }
            Ok(None) => {
                info!("Nested stage skipped, nothing to submit");
                FollowUp::Skipped
            }
            Ok(Some(call)) => match self.invoke(&call.invocation).await {
                Ok(payload) => FollowUp::Completed {
                    context: call.context,
                    payload,
                },
                Err(error) => FollowUp::Failed {
                    context: call.context,
                    error,
                },
            },
        };

        Ok(PipelineOutcome { primary, follow_up })
    }
}
