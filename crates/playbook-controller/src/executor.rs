//! Workflow execution contract
//!
//! One call runs one external workflow once. No retries happen at this layer.
//! Every failure mode maps to a failed outcome; the failure detail tells a
//! workflow that ran and failed apart from one that never started.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

/// The external workflows the controller knows how to run
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Workflow {
    /// Run when a resource is created
    Provision,
    /// Run when a resource is updated
    Update,
    /// Run when a resource is deleted
    Deprovision,
}

impl Workflow {
    /// Workflow identifier (also the playbook file stem)
    pub fn name(&self) -> &'static str {
        match self {
            Self::Provision => "provision",
            Self::Update => "update",
            Self::Deprovision => "deprovision",
        }
    }
}

impl fmt::Display for Workflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A single `key=value` workflow parameter
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Parameter {
    /// Parameter name
    pub key: String,
    /// Parameter value, already rendered as a string
    pub value: String,
}

impl Parameter {
    /// Create a parameter
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

/// Why a workflow did not succeed
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ExecutionFailure {
    /// The workflow ran and exited non-zero
    #[error("exit code {code}")]
    Exited {
        /// Process exit code
        code: i32,
    },

    /// The workflow was killed by a signal
    #[error("terminated by signal")]
    Signaled,

    /// The workflow could not be started at all
    #[error("failed to launch {program}: {message}")]
    LaunchFailed {
        /// Program that failed to start
        program: String,
        /// OS error description
        message: String,
    },

    /// The workflow exceeded its time limit and was killed
    #[error("timed out after {after:?}")]
    TimedOut {
        /// The limit that was exceeded
        after: Duration,
    },

    /// The operator shut down while the workflow was running
    #[error("interrupted by operator shutdown")]
    Interrupted,
}

/// Final outcome of one invocation
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// The workflow reported success
    Succeeded,
    /// The workflow failed or never ran
    Failed(ExecutionFailure),
}

/// Captured output and outcome of one invocation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutionResult {
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
    /// Success or the reason for failure
    pub outcome: ExecutionOutcome,
}

impl ExecutionResult {
    /// A successful run with the given output
    pub fn succeeded(stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: stderr.into(),
            outcome: ExecutionOutcome::Succeeded,
        }
    }

    /// A failed run with whatever output was captured
    pub fn failed(
        failure: ExecutionFailure,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: stderr.into(),
            outcome: ExecutionOutcome::Failed(failure),
        }
    }

    /// Whether the workflow succeeded
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, ExecutionOutcome::Succeeded)
    }

    /// The failure, if any
    pub fn failure(&self) -> Option<&ExecutionFailure> {
        match &self.outcome {
            ExecutionOutcome::Succeeded => None,
            ExecutionOutcome::Failed(failure) => Some(failure),
        }
    }

    /// Standard output followed by standard error
    pub fn combined_output(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => {
                let mut out = self.stdout.clone();
                if !out.ends_with('\n') {
                    out.push('\n');
                }
                out.push_str(&self.stderr);
                out
            }
        }
    }

    /// Text recorded in the resource status: the output on success, the
    /// failure detail followed by any output on failure
    pub fn summary(&self) -> String {
        let output = self.combined_output();
        match self.failure() {
            None => output,
            Some(failure) if output.is_empty() => failure.to_string(),
            Some(failure) => format!("{failure}\n{output}"),
        }
    }
}

/// Runs external workflows
///
/// Implementations must capture both output streams, must not leak the
/// external process when the returned future is dropped, and must report
/// timeouts as [`ExecutionFailure::TimedOut`].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WorkflowExecutor: Send + Sync {
    /// Run `workflow` once with the given ordered parameters
    async fn run(&self, workflow: Workflow, parameters: &[Parameter]) -> ExecutionResult;
}
