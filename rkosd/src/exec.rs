//! Running external commands: one-shot, captured, and detached daemons.

use std::process::Stdio;

use async_trait::async_trait;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tracing::{debug, trace};

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("failed to start {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{name}: {command} exited with {code:?}: {stderr}")]
    Failed {
        name: String,
        command: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("failed to signal process {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: nix::errno::Errno,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("supervisor of {name} failed: {reason}")]
    Supervisor { name: String, reason: String },
}

/// A detached process started by [`Executor::start_execute_command`].
#[async_trait]
pub trait ProcessHandle: Send {
    fn id(&self) -> Option<u32>;

    /// Ask the process to exit.
    fn terminate(&mut self) -> Result<(), ExecError>;

    /// Wait for exit; `None` when the process was killed by a signal.
    async fn wait(&mut self) -> Result<Option<i32>, ExecError>;

    async fn kill(&mut self) -> Result<(), ExecError>;
}

#[async_trait]
pub trait Executor: Send + Sync {
    /// Run to completion, failing on a non-zero exit.
    async fn execute_command(&self, name: &str, command: &str, args: &[String])
    -> Result<(), ExecError>;

    /// Run to completion and return stdout.
    async fn execute_command_with_output(
        &self,
        name: &str,
        command: &str,
        args: &[String],
    ) -> Result<String, ExecError>;

    async fn start_execute_command(
        &self,
        name: &str,
        command: &str,
        args: &[String],
    ) -> Result<Box<dyn ProcessHandle>, ExecError>;
}

#[derive(Debug, Default, Clone)]
pub struct CommandExecutor;

impl CommandExecutor {
    async fn run(&self, name: &str, command: &str, args: &[String]) -> Result<String, ExecError> {
        debug!(name, command, ?args, "running command");
        let output = Command::new(command)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| ExecError::Spawn {
                command: command.to_string(),
                source,
            })?;

        if !output.status.success() {
            return Err(ExecError::Failed {
                name: name.to_string(),
                command: command.to_string(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        trace!(name, stdout, "command finished");
        Ok(stdout)
    }
}

#[async_trait]
impl Executor for CommandExecutor {
    async fn execute_command(
        &self,
        name: &str,
        command: &str,
        args: &[String],
    ) -> Result<(), ExecError> {
        self.run(name, command, args).await.map(|_| ())
    }

    async fn execute_command_with_output(
        &self,
        name: &str,
        command: &str,
        args: &[String],
    ) -> Result<String, ExecError> {
        self.run(name, command, args).await
    }

    async fn start_execute_command(
        &self,
        name: &str,
        command: &str,
        args: &[String],
    ) -> Result<Box<dyn ProcessHandle>, ExecError> {
        debug!(name, command, ?args, "starting process");
        let child = Command::new(command)
            .args(args)
            .stdin(Stdio::null())
            .spawn()
            .map_err(|source| ExecError::Spawn {
                command: command.to_string(),
                source,
            })?;
        Ok(Box::new(ChildProcess { child }))
    }
}

struct ChildProcess {
    child: Child,
}

#[async_trait]
impl ProcessHandle for ChildProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn terminate(&mut self) -> Result<(), ExecError> {
        // already reaped
        let Some(pid) = self.child.id() else {
            return Ok(());
        };
        kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
            .map_err(|source| ExecError::Signal { pid, source })
    }

    async fn wait(&mut self) -> Result<Option<i32>, ExecError> {
        let status = self.child.wait().await?;
        Ok(status.code())
    }

    async fn kill(&mut self) -> Result<(), ExecError> {
        self.child.kill().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_output_is_captured() {
        let out = CommandExecutor
            .execute_command_with_output("echo", "echo", &args(&["hello"]))
            .await
            .unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[tokio::test]
    async fn test_non_zero_exit_fails() {
        let err = CommandExecutor
            .execute_command("false", "false", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Failed { code: Some(1), .. }));
    }

    #[tokio::test]
    async fn test_missing_binary() {
        let err = CommandExecutor
            .execute_command("nope", "/nonexistent/binary", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_terminate_detached_process() {
        let mut handle = CommandExecutor
            .start_execute_command("sleep", "sleep", &args(&["30"]))
            .await
            .unwrap();
        assert!(handle.id().is_some());
        handle.terminate().unwrap();
        // killed by SIGTERM, no exit code
        assert_eq!(handle.wait().await.unwrap(), None);
    }
}
