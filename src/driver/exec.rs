use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use uuid::Uuid;

use crate::bag::ConfigBag;
use crate::driver::{Driver, ProgressSender};
use crate::error::DriverError;
use crate::scheduler::Job;

pub const EXEC_DRIVER: &str = "exec";

const STDOUT_PREFIX: &str = "STDOUT >> ";
const STDERR_PREFIX: &str = "STDERR >> ";

/// Command line and environment described by an exec job's driver config.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecSpec {
    pub cmd: String,
    pub args: Vec<String>,
    pub inherit_env: bool,
    pub env: Vec<(String, String)>,
    pub dir: Option<String>,
}

impl ExecSpec {
    /// Keys: `cmd` (required), `args`, `inherit_env`, `env` (`KEY=VALUE`
    /// strings) and `dir`.
    pub fn from_config(config: &ConfigBag) -> Result<Self, DriverError> {
        let cmd = config.get_str("cmd", "")?;
        if cmd.is_empty() {
            return Err(DriverError::MissingConfig("cmd"));
        }

        let env = config
            .get_string_list("env", &[])?
            .into_iter()
            .map(|pair| match pair.split_once('=') {
                Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
                _ => Err(DriverError::InvalidEnv(pair)),
            })
            .collect::<Result<Vec<_>, _>>()?;

        let dir = config.get_str("dir", "")?;

        Ok(Self {
            cmd,
            args: config.get_string_list("args", &[])?,
            inherit_env: config.get_bool("inherit_env", false)?,
            env,
            dir: (!dir.is_empty()).then_some(dir),
        })
    }

    /// The child only sees `env` when `inherit_env` is off and `env` is set;
    /// otherwise it keeps the agent's environment plus `env`.
    pub fn command(&self) -> Command {
        let mut command = Command::new(&self.cmd);
        command.args(&self.args);
        if !self.inherit_env && !self.env.is_empty() {
            command.env_clear();
        }
        command.envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        if let Some(dir) = &self.dir {
            command.current_dir(dir);
        }
        command
    }
}

#[derive(Debug, Default)]
struct ProcessHandle {
    pid: Option<u32>,
    interrupted: bool,
}

type ProcessTable = Arc<Mutex<HashMap<Uuid, ProcessHandle>>>;

fn lock(table: &ProcessTable) -> MutexGuard<'_, HashMap<Uuid, ProcessHandle>> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes a job's process handle on every exit path of `run`.
struct HandleGuard {
    table: ProcessTable,
    job_id: Uuid,
}

impl Drop for HandleGuard {
    fn drop(&mut self) {
        lock(&self.table).remove(&self.job_id);
    }
}

/// Runs jobs as local child processes.
///
/// Output is streamed back line by line as progress messages. Cancelling sends
/// SIGINT; a job that exits unsuccessfully after that counts as interrupted.
#[derive(Debug, Default)]
pub struct ExecDriver {
    processes: ProcessTable,
}

impl ExecDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self, job_id: &Uuid) -> bool {
        lock(&self.processes).contains_key(job_id)
    }

    fn register(&self, job_id: Uuid) -> Result<HandleGuard, DriverError> {
        let mut table = lock(&self.processes);
        if table.contains_key(&job_id) {
            return Err(DriverError::AlreadyRunning(job_id));
        }
        table.insert(job_id, ProcessHandle::default());
        Ok(HandleGuard {
            table: self.processes.clone(),
            job_id,
        })
    }
}

fn interrupt(pid: u32) -> Result<(), DriverError> {
    let pid = i32::try_from(pid).map_err(|e| DriverError::Signal(e.to_string()))?;
    kill(Pid::from_raw(pid), Signal::SIGINT).map_err(|e| DriverError::Signal(e.to_string()))
}

async fn drain<R>(pipe: Option<R>, prefix: &str, progress: &ProgressSender) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let Some(pipe) = pipe else {
        return Ok(());
    };
    let mut reader = BufReader::new(pipe);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            return Ok(());
        }
        let line = String::from_utf8_lossy(&buf);
        progress.send(0.0, format!("{prefix}{}", line.trim_end_matches(['\r', '\n'])));
    }
}

#[async_trait]
impl Driver for ExecDriver {
    fn name(&self) -> &str {
        EXEC_DRIVER
    }

    async fn run(&self, job: &Job, progress: ProgressSender) -> Result<(), DriverError> {
        let spec = ExecSpec::from_config(&job.driver_config)?;
        let _guard = self.register(job.id)?;

        tracing::info!(job_id = %job.id, cmd = %spec.cmd, args = ?spec.args, dir = ?spec.dir, "Executing job");

        let mut child = spec
            .command()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(DriverError::Spawn)?;

        let pid = child.id();
        let cancelled_early = {
            let mut table = lock(&self.processes);
            match table.get_mut(&job.id) {
                Some(handle) => {
                    handle.pid = pid;
                    handle.interrupted
                }
                None => false,
            }
        };
        if cancelled_early {
            if let Some(pid) = pid {
                interrupt(pid)?;
            }
        }

        let (out, err) = tokio::join!(
            drain(child.stdout.take(), STDOUT_PREFIX, &progress),
            drain(child.stderr.take(), STDERR_PREFIX, &progress),
        );
        out?;
        err?;

        let status = child.wait().await?;
        let interrupted = {
            let mut table = lock(&self.processes);
            table
                .get_mut(&job.id)
                .map(|handle| {
                    // reaped, the pid may be reused from here on
                    handle.pid = None;
                    handle.interrupted
                })
                .unwrap_or(false)
        };

        if status.success() {
            tracing::info!(job_id = %job.id, "Job completed");
            Ok(())
        } else if interrupted {
            tracing::info!(job_id = %job.id, status = %status, "Job interrupted");
            Err(DriverError::Interrupted(status.to_string()))
        } else {
            tracing::info!(job_id = %job.id, status = %status, "Job failed");
            Err(DriverError::ExitStatus(status.to_string()))
        }
    }

    async fn cancel(&self, job: &Job) -> Result<(), DriverError> {
        let pid = {
            let mut table = lock(&self.processes);
            let handle = table
                .get_mut(&job.id)
                .ok_or(DriverError::NotRunning(job.id))?;
            handle.interrupted = true;
            handle.pid
        };
        match pid {
            Some(pid) => {
                interrupt(pid)?;
                tracing::info!(job_id = %job.id, pid, "Interrupt signal sent");
            }
            None => {
                tracing::info!(job_id = %job.id, "Interrupt deferred until process starts");
            }
        }
        Ok(())
    }
}
