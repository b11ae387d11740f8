//! Worker process spawning and termination.

use std::collections::HashMap;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::{Child, Command};
use tracing::{error, info, warn};

use super::CORE_TAG_ENV_VAR;
use crate::config::SupervisorConfig;

/// Program, arguments and environment used to launch a core worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: HashMap::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Command from configuration.
    ///
    /// Without a configured program the current executable is re-run with
    /// the current arguments.
    pub fn from_config(config: &SupervisorConfig) -> io::Result<Self> {
        let (program, args) = match &config.program {
            Some(program) => (program.clone(), config.args.clone()),
            None => {
                let exe = std::env::current_exe()?;
                (
                    exe.to_string_lossy().into_owned(),
                    std::env::args().skip(1).collect(),
                )
            }
        };

        Ok(Self {
            program,
            args,
            env: config.env.clone(),
        })
    }
}

/// A running core worker in its own process group.
pub(crate) struct ManagedProcess {
    child: Child,
    tag: String,
}

impl ManagedProcess {
    /// Spawn `command` for the core tagged `tag`.
    pub(crate) fn spawn(tag: &str, command: &WorkerCommand) -> io::Result<Self> {
        info!(tag = %tag, program = %command.program, args = ?command.args, "Spawning core process");

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args);
        cmd.envs(&command.env);
        cmd.env(CORE_TAG_ENV_VAR, tag);

        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::inherit());

        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd.spawn().map_err(|e| {
            error!(tag = %tag, error = %e, "Failed to spawn core process");
            e
        })?;

        info!(tag = %tag, pid = ?child.id(), "Core process started");

        Ok(Self {
            child,
            tag: tag.to_string(),
        })
    }

    pub(crate) fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    pub(crate) async fn wait(&mut self) -> io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// SIGTERM the process group, then SIGKILL if it outlives `grace`.
    pub(crate) async fn terminate(&mut self, grace: Duration) -> io::Result<ExitStatus> {
        if let Some(status) = self.child.try_wait()? {
            return Ok(status);
        }

        if let Some(pid) = self.child.id() {
            info!(tag = %self.tag, pid = pid, "Terminating core process");

            #[cfg(unix)]
            signal_group(&self.tag, pid, nix::sys::signal::Signal::SIGTERM);

            #[cfg(not(unix))]
            let _ = self.child.start_kill();
        }

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(result) => result,
            Err(_) => {
                warn!(tag = %self.tag, "Core process ignored SIGTERM, sending SIGKILL");

                #[cfg(unix)]
                {
                    if let Some(pid) = self.child.id() {
                        signal_group(&self.tag, pid, nix::sys::signal::Signal::SIGKILL);
                    }
                }

                self.child.kill().await?;
                self.child.wait().await
            }
        }
    }
}

impl Drop for ManagedProcess {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            warn!(tag = %self.tag, pid = ?self.child.id(), "Killing orphaned core process on drop");

            #[cfg(unix)]
            {
                if let Some(pid) = self.child.id() {
                    signal_group(&self.tag, pid, nix::sys::signal::Signal::SIGKILL);
                }
            }

            let _ = self.child.start_kill();
        }
    }
}

#[cfg(unix)]
fn signal_group(tag: &str, pid: u32, signal: nix::sys::signal::Signal) {
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    if let Err(e) = killpg(Pid::from_raw(pid as i32), signal) {
        warn!(tag = %tag, signal = ?signal, error = %e, "Failed to signal process group");
    }
}
