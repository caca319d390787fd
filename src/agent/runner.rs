use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::driver::{Driver, DriverRegistry, ProgressSender};
use crate::error::DriverError;
use crate::protocol::{
    AgentInfo, JobAccepted, JobCancelResponse, JobDone, JobUpdate, Message, Outbox, Payload,
};
use crate::scheduler::placement::is_subset;
use crate::scheduler::{GpuInfo, Job, JobStatus};

/// Poll interval while a cancel waits for the driver to pick the job up.
const CANCEL_RETRY: Duration = Duration::from_millis(10);

/// A job accepted by this agent and not yet reported done.
#[derive(Debug, Clone)]
pub struct RunningJob {
    pub job: Job,
    /// Set when a cancel arrived before the driver knew about the job.
    cancel: CancellationToken,
}

/// Jobs running on this agent. Shared by every session of the process so
/// capacity accounts for jobs left over from a previous session.
pub type RunningJobs = Arc<Mutex<HashMap<Uuid, RunningJob>>>;

/// Accepts job offers on an agent and executes them through the drivers.
///
/// One runner exists per controller session. Every message it produces goes
/// through the session's outbox.
pub struct JobRunner {
    name: String,
    capacity: u32,
    capabilities: Vec<String>,
    drivers: DriverRegistry,
    gpus: watch::Receiver<Vec<GpuInfo>>,
    outbox: Outbox,
    running: RunningJobs,
}

impl JobRunner {
    pub fn new(
        name: impl Into<String>,
        capacity: u32,
        capabilities: Vec<String>,
        drivers: DriverRegistry,
        gpus: watch::Receiver<Vec<GpuInfo>>,
        outbox: Outbox,
        running: RunningJobs,
    ) -> Self {
        Self {
            name: name.into(),
            capacity,
            capabilities,
            drivers,
            gpus,
            outbox,
            running,
        }
    }

    fn running(&self) -> MutexGuard<'_, HashMap<Uuid, RunningJob>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn jobs_running(&self) -> usize {
        self.running().len()
    }

    pub fn is_running(&self, job_id: &Uuid) -> bool {
        self.running().contains_key(job_id)
    }

    pub fn agent_info(&self) -> AgentInfo {
        AgentInfo {
            capacity: self.capacity,
            jobs_running: self.jobs_running() as u32,
            gpus: self.gpus.borrow().clone(),
        }
    }

    async fn send(&self, payload: impl Into<Payload>) {
        let message = Message::new(self.name.clone(), payload);
        let command = message.command();
        if let Err(e) = self.outbox.send(message).await {
            tracing::warn!(command = %command, error = %e, "Failed to send message to controller");
        }
    }

    /// Answer an offer. Accepted jobs start executing in the background.
    pub async fn offer(self: &Arc<Self>, mut job: Job) {
        let refusal = {
            let mut running = self.running();
            if running.len() >= self.capacity as usize {
                Some("no capacity".to_string())
            } else if !is_subset(&job.restrict, &self.capabilities) {
                Some(format!("missing capabilities, job requires {:?}", job.restrict))
            } else if running.contains_key(&job.id) {
                Some("job is already running".to_string())
            } else if !self.drivers.contains(&job.driver) {
                Some(format!("driver {} not registered", job.driver))
            } else {
                job.status = JobStatus::Scheduled;
                job.agent_name = Some(self.name.clone());
                running.insert(
                    job.id,
                    RunningJob {
                        job: job.clone(),
                        cancel: CancellationToken::new(),
                    },
                );
                None
            }
        };

        let accepted = refusal.is_none();
        match &refusal {
            None => tracing::info!(job_id = %job.id, identifier = %job.identifier, "Job accepted"),
            Some(reason) => tracing::info!(job_id = %job.id, reason = %reason, "Job refused"),
        }

        self.send(JobAccepted {
            accepted,
            refuse_reason: refusal.unwrap_or_default(),
            job: job.clone(),
            agent_info: self.agent_info(),
        })
        .await;

        if accepted {
            let runner = self.clone();
            tokio::spawn(async move { runner.execute(job).await });
        }
    }

    async fn execute(self: Arc<Self>, job: Job) {
        let cancel = self
            .running()
            .get(&job.id)
            .map(|entry| entry.cancel.clone())
            .unwrap_or_else(CancellationToken::new);

        let (progress, mut updates) = ProgressSender::channel();
        let forwarder = {
            let runner = self.clone();
            let job = job.clone();
            tokio::spawn(async move {
                while let Some(update) = updates.recv().await {
                    runner
                        .send(JobUpdate {
                            progress: update.progress,
                            message: update.message,
                            job: job.clone(),
                            agent_info: runner.agent_info(),
                        })
                        .await;
                }
            })
        };

        let outcome = match self.drivers.get(&job.driver) {
            Ok(_) if cancel.is_cancelled() => {
                drop(progress);
                Err(DriverError::Interrupted("cancelled before start".to_string()))
            }
            Ok(driver) => run_driver(driver.as_ref(), &job, progress, &cancel).await,
            Err(e) => Err(e),
        };

        let mut job = self
            .running()
            .remove(&job.id)
            .map(|entry| entry.job)
            .unwrap_or(job);
        let _ = forwarder.await;

        job.status = match &outcome {
            Ok(()) => JobStatus::Success,
            Err(DriverError::Interrupted(_)) => JobStatus::Cancel,
            Err(_) => JobStatus::Error,
        };
        match &outcome {
            Ok(()) => tracing::info!(job_id = %job.id, "Job succeeded"),
            Err(e) => tracing::warn!(job_id = %job.id, status = %job.status, error = %e, "Job did not succeed"),
        }

        self.send(JobDone {
            success: outcome.is_ok(),
            job,
            agent_info: self.agent_info(),
            error_message: outcome.err().map(|e| e.to_string()),
        })
        .await;
    }

    /// Forward a cancel request to the job's driver and report the result.
    pub async fn cancel(&self, job: Job) {
        let running = self.running().get(&job.id).cloned();
        let cancelled = match running {
            None => {
                tracing::info!(job_id = %job.id, "Cancel for job that is not running");
                false
            }
            Some(running) => self.request_cancel(&running).await,
        };

        self.send(JobCancelResponse {
            job,
            cancelled,
            agent_info: self.agent_info(),
        })
        .await;
    }

    /// Ask every running job to stop. Used when the controller session is lost.
    pub async fn cancel_all(&self) {
        let jobs: Vec<RunningJob> = self.running().values().cloned().collect();
        for running in jobs {
            self.request_cancel(&running).await;
        }
    }

    /// Deliver a cancel to the driver. A job the driver has not started yet
    /// is flagged instead and interrupted as soon as it starts.
    async fn request_cancel(&self, running: &RunningJob) -> bool {
        let job = &running.job;
        let driver = match self.drivers.get(&job.driver) {
            Ok(driver) => driver,
            Err(e) => {
                tracing::warn!(job_id = %job.id, error = %e, "Cancel failed");
                return false;
            }
        };
        match driver.cancel(job).await {
            Ok(()) => true,
            Err(DriverError::NotRunning(_)) => {
                tracing::info!(job_id = %job.id, "Driver has not started the job, cancel deferred");
                running.cancel.cancel();
                true
            }
            Err(e) => {
                tracing::warn!(job_id = %job.id, error = %e, "Cancel failed");
                false
            }
        }
    }
}

/// Run `job` on `driver`, catching panics. Once `cancel` fires the driver's
/// cancel is retried until the driver has registered the job or it finishes.
async fn run_driver(
    driver: &dyn Driver,
    job: &Job,
    progress: ProgressSender,
    cancel: &CancellationToken,
) -> Result<(), DriverError> {
    let run = AssertUnwindSafe(driver.run(job, progress)).catch_unwind();
    tokio::pin!(run);

    let result = tokio::select! {
        result = &mut run => result,
        _ = cancel.cancelled() => loop {
            match driver.cancel(job).await {
                Err(DriverError::NotRunning(_)) => {}
                Ok(()) => break (&mut run).await,
                Err(e) => {
                    tracing::warn!(job_id = %job.id, error = %e, "Deferred cancel failed");
                    break (&mut run).await;
                }
            }
            tokio::select! {
                result = &mut run => break result,
                _ = tokio::time::sleep(CANCEL_RETRY) => {}
            }
        },
    };
    result.unwrap_or_else(|panic| Err(DriverError::Panicked(panic_message(panic))))
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
