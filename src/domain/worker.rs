//! Worker invocation and result types.
//!
//! A worker is an external executable launched once per request. Its final
//! stdout is parsed as a single JSON document; `success: false` in that
//! document is an application-level failure regardless of the exit code.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// A single worker call: program plus ordered arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerInvocation {
    pub command: String,
    pub args: Vec<String>,
}

impl WorkerInvocation {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
        }
    }

    /// Append one argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Stable fingerprint of the argument list, safe to log.
    ///
    /// Arguments routinely carry secret keys, so logs identify an invocation
    /// by the first 16 hex chars of the SHA-256 of its NUL-joined args.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for (idx, arg) in self.args.iter().enumerate() {
            if idx > 0 {
                hasher.update([0u8]);
            }
            hasher.update(arg.as_bytes());
        }
        let digest = hasher.finalize();
        hex::encode(&digest[..8])
    }
}

/// How to launch a configured worker binary.
///
/// `args` are prepended to every invocation, which lets a worker be a script
/// run through an interpreter (`program: sh`, `args: [worker.sh]`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCommand {
    pub program: String,

    #[serde(default)]
    pub args: Vec<String>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Build an invocation of `subcommand` with its arguments
    pub fn invocation<I, S>(&self, subcommand: &str, args: I) -> WorkerInvocation
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        WorkerInvocation::new(self.program.clone())
            .args(self.args.iter().cloned())
            .arg(subcommand)
            .args(args)
    }
}

/// Outcome encoded in a worker's final output document.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerResult {
    /// Output parsed and did not report failure
    Success { payload: Value },

    /// Output parsed and reported `success: false`
    ApplicationError { message: String },
}

impl WorkerResult {
    /// Parse the accumulated output buffer.
    ///
    /// A missing `success` field counts as success: some worker commands
    /// (balance lookups) only emit their payload.
    pub fn parse(output: &[u8]) -> Result<Self, serde_json::Error> {
        let payload: Value = serde_json::from_slice(output)?;

        if payload.get("success").and_then(Value::as_bool) == Some(false) {
            return Ok(Self::ApplicationError {
                message: failure_message(&payload),
            });
        }

        Ok(Self::Success { payload })
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Pull the failure message out of a worker payload
fn failure_message(payload: &Value) -> String {
    ["error_message", "message", "error"]
        .iter()
        .find_map(|field| payload.get(*field).and_then(Value::as_str))
        .map(str::to_string)
        .unwrap_or_else(|| "worker reported failure".to_string())
}
