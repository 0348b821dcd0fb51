//! Supervision of long-running OSD daemons.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{error, info, warn};

use crate::exec::{ExecError, Executor, ProcessHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    pub max_restarts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// How long a stopped process gets between SIGTERM and SIGKILL.
    pub stop_grace: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        RestartPolicy {
            max_restarts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            stop_grace: Duration::from_secs(10),
        }
    }
}

#[derive(Clone)]
pub struct ProcManager {
    executor: Arc<dyn Executor>,
    policy: RestartPolicy,
}

impl ProcManager {
    pub fn new(executor: Arc<dyn Executor>, policy: RestartPolicy) -> Self {
        ProcManager { executor, policy }
    }

    pub fn policy(&self) -> RestartPolicy {
        self.policy
    }

    /// Start `command` and keep it running until the returned handle is stopped.
    pub async fn start(
        &self,
        name: &str,
        command: &str,
        args: Vec<String>,
    ) -> Result<MonitoredProc, ExecError> {
        let child = self
            .executor
            .start_execute_command(name, command, &args)
            .await?;
        info!(name, pid = ?child.id(), "process started");

        let (stop_tx, stop_rx) = oneshot::channel();
        let supervisor = Supervisor {
            executor: self.executor.clone(),
            name: name.to_string(),
            command: command.to_string(),
            args,
            policy: self.policy,
        };
        let task = tokio::spawn(supervisor.run(child, stop_rx));

        Ok(MonitoredProc {
            name: name.to_string(),
            stop_tx: Some(stop_tx),
            task,
        })
    }
}

/// Handle to a supervised process.
pub struct MonitoredProc {
    name: String,
    stop_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<(), ExecError>>,
}

impl std::fmt::Debug for MonitoredProc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitoredProc")
            .field("name", &self.name)
            .field("finished", &self.task.is_finished())
            .finish()
    }
}

impl MonitoredProc {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True once the supervisor gave up restarting or was stopped.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn stop(mut self) -> Result<(), ExecError> {
        if let Some(tx) = self.stop_tx.take() {
            // the supervisor may already be gone
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(res) => res,
            Err(e) => Err(ExecError::Supervisor {
                name: self.name.clone(),
                reason: e.to_string(),
            }),
        }
    }
}

struct Supervisor {
    executor: Arc<dyn Executor>,
    name: String,
    command: String,
    args: Vec<String>,
    policy: RestartPolicy,
}

impl Supervisor {
    async fn run(
        self,
        mut child: Box<dyn ProcessHandle>,
        mut stop_rx: oneshot::Receiver<()>,
    ) -> Result<(), ExecError> {
        let mut restarts = 0;
        let mut backoff = self.policy.initial_backoff;

        loop {
            tokio::select! {
                _ = &mut stop_rx => {
                    return self.shutdown(child.as_mut()).await;
                }
                status = child.wait() => {
                    match status {
                        Ok(code) => warn!(name = %self.name, ?code, "process exited"),
                        Err(e) => warn!(name = %self.name, "failed to wait for process: {e}"),
                    }
                }
            }

            if restarts >= self.policy.max_restarts {
                error!(
                    name = %self.name,
                    restarts, "process keeps exiting, giving up"
                );
                return Ok(());
            }
            restarts += 1;

            tokio::select! {
                _ = &mut stop_rx => return Ok(()),
                _ = sleep(backoff) => {}
            }
            backoff = std::cmp::min(backoff * 2, self.policy.max_backoff);

            match self
                .executor
                .start_execute_command(&self.name, &self.command, &self.args)
                .await
            {
                Ok(new_child) => {
                    info!(name = %self.name, restarts, pid = ?new_child.id(), "process restarted");
                    child = new_child;
                }
                Err(e) => error!(name = %self.name, restarts, "failed to restart process: {e}"),
            }
        }
    }

    async fn shutdown(&self, child: &mut dyn ProcessHandle) -> Result<(), ExecError> {
        info!(name = %self.name, "stopping process");
        child.terminate()?;
        match timeout(self.policy.stop_grace, child.wait()).await {
            Ok(res) => res.map(|_| ()),
            Err(_) => {
                warn!(name = %self.name, "process ignored SIGTERM, killing it");
                child.kill().await
            }
        }
    }
}
