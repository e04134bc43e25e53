//! `ansible-playbook` backed workflow executor
//!
//! Each workflow maps to `<playbook_dir>/<workflow>.yml`; parameters are
//! passed as `-e key=value` extra vars in order.
//!
//! On unix the playbook is started as the leader of its own process group.
//! When a run ends or is cancelled (timeout or operator shutdown) the whole
//! group is killed, which also takes down the workers `ansible-playbook`
//! forks.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::executor::{ExecutionFailure, ExecutionResult, Parameter, Workflow, WorkflowExecutor};

/// Program run when none is configured
pub const DEFAULT_PROGRAM: &str = "ansible-playbook";

/// Runs playbooks from a directory with an external program
#[derive(Clone, Debug)]
pub struct PlaybookRunner {
    program: PathBuf,
    playbook_dir: PathBuf,
    timeout: Option<Duration>,
}

impl PlaybookRunner {
    /// Runner for the playbooks in `playbook_dir` using `ansible-playbook`
    /// from `PATH` and no time limit
    pub fn new(playbook_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: PathBuf::from(DEFAULT_PROGRAM),
            playbook_dir: playbook_dir.into(),
            timeout: None,
        }
    }

    /// Use a different program to run playbooks
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    /// Kill a playbook that runs longer than `timeout`
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Playbook file for `workflow`
    pub fn playbook_path(&self, workflow: Workflow) -> PathBuf {
        self.playbook_dir.join(format!("{}.yml", workflow.name()))
    }

    fn command(&self, workflow: Workflow, parameters: &[Parameter]) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg(self.playbook_path(workflow));
        for parameter in parameters {
            cmd.arg("-e").arg(parameter.to_string());
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }

    fn program_name(&self) -> String {
        self.program.display().to_string()
    }
}

#[async_trait]
impl WorkflowExecutor for PlaybookRunner {
    async fn run(&self, workflow: Workflow, parameters: &[Parameter]) -> ExecutionResult {
        let mut cmd = self.command(workflow, parameters);
        let started = Instant::now();
        info!(
            %workflow,
            playbook = %self.playbook_path(workflow).display(),
            parameters = parameters.len(),
            "running playbook"
        );

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(%workflow, program = %self.program_name(), error = %e, "failed to launch playbook");
                return ExecutionResult::failed(
                    ExecutionFailure::LaunchFailed {
                        program: self.program_name(),
                        message: e.to_string(),
                    },
                    String::new(),
                    String::new(),
                );
            }
        };
        let _group = ProcessGroup::led_by(child.id());

        let waited = child.wait_with_output();
        let output = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, waited).await {
                Ok(output) => output,
                Err(_) => {
                    warn!(%workflow, timeout = ?limit, "playbook timed out and was killed");
                    return ExecutionResult::failed(
                        ExecutionFailure::TimedOut { after: limit },
                        String::new(),
                        String::new(),
                    );
                }
            },
            None => waited.await,
        };

        let output = match output {
            Ok(output) => output,
            Err(e) => {
                warn!(%workflow, error = %e, "lost track of playbook process");
                return ExecutionResult::failed(
                    ExecutionFailure::LaunchFailed {
                        program: self.program_name(),
                        message: format!("waiting for playbook: {e}"),
                    },
                    String::new(),
                    String::new(),
                );
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let elapsed_ms = started.elapsed().as_millis();

        if output.status.success() {
            debug!(%workflow, elapsed_ms, "playbook succeeded");
            return ExecutionResult::succeeded(stdout, stderr);
        }

        let failure = match output.status.code() {
            Some(code) => ExecutionFailure::Exited { code },
            None => ExecutionFailure::Signaled,
        };
        warn!(%workflow, elapsed_ms, failure = %failure, "playbook failed");
        ExecutionResult::failed(failure, stdout, stderr)
    }
}

/// Kills the playbook's process group when dropped
struct ProcessGroup {
    #[cfg_attr(not(unix), allow(dead_code))]
    leader: Option<u32>,
}

impl ProcessGroup {
    fn led_by(leader: Option<u32>) -> Self {
        Self { leader }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(pgid) = self.leader.and_then(|pid| libc::pid_t::try_from(pid).ok()) {
            // ESRCH once every member has exited; nothing left to do then
            unsafe {
                libc::kill(-pgid, libc::SIGKILL);
            }
        }
    }
}
