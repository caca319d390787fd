pub mod handler;
pub mod joblog;
pub mod notify;
pub mod registry;

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::api;
use crate::config::ControllerConfig;
use crate::error::{HerdError, Result};
use crate::protocol::{Connection, JobCancelRequest, Message};
use crate::scheduler::placement::NodeSnapshot;
use crate::scheduler::{Job, JobEvent, JobFilter, JobSpec, JobStatus, JobStore, OfferBook, Scheduler};

pub use handler::handle_connection;
pub use joblog::JobLogs;
pub use notify::{HandlerDispatcher, Notifier};
pub use registry::{Node, NodeRegistry};

/// What a cancel request did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job was waiting and is now cancelled.
    Cancelled,
    /// The job is running; its agent was asked to stop it.
    Requested,
}

/// State shared by the TCP sessions, the scheduler and the HTTP API.
pub struct ControllerContext {
    pub name: String,
    pub store: Arc<JobStore>,
    pub registry: Arc<NodeRegistry>,
    pub offers: Arc<OfferBook>,
    pub logs: Arc<JobLogs>,
    pub notifier: Arc<dyn Notifier>,
}

impl ControllerContext {
    pub async fn new(
        name: impl Into<String>,
        data_dir: impl AsRef<std::path::Path>,
        offer_timeout: Duration,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        Ok(Self {
            name: name.into(),
            store: Arc::new(JobStore::open(data_dir).await?),
            registry: Arc::new(NodeRegistry::new()),
            offers: Arc::new(OfferBook::new(offer_timeout)),
            logs: Arc::new(JobLogs::new(data_dir).await?),
            notifier,
        })
    }

    pub fn scheduler(&self, interval: Duration) -> Scheduler {
        Scheduler::new(
            self.name.clone(),
            interval,
            self.store.clone(),
            self.registry.clone(),
            self.offers.clone(),
        )
    }

    /// Validate a submission and queue it as WAITING.
    pub async fn submit(&self, spec: JobSpec) -> Result<Job> {
        let job = spec.into_job()?;
        self.store.insert(job.clone()).await?;
        tracing::info!(job_id = %job.id, identifier = %job.identifier, priority = job.priority, "Job submitted");
        Ok(job)
    }

    pub async fn job(&self, id: &Uuid) -> Result<Job> {
        self.store.get(id).await.ok_or(HerdError::JobNotFound(*id))
    }

    pub async fn jobs(&self, limit: Option<usize>) -> Vec<Job> {
        let filter = JobFilter {
            limit,
            ..Default::default()
        };
        self.store.list(&filter).await
    }

    pub async fn nodes(&self) -> Vec<NodeSnapshot> {
        self.registry.snapshot().await
    }

    /// Cancel a job. A WAITING job is cancelled on the spot; for a SCHEDULED
    /// job the agent is asked to stop it and reports the outcome later.
    pub async fn cancel_job(&self, id: &Uuid) -> Result<CancelOutcome> {
        let job = self.job(id).await?;
        match job.status {
            JobStatus::Waiting => {
                let job = self.store.update_status(id, JobStatus::Cancel).await?;
                self.offers.settle(id);
                tracing::info!(job_id = %id, "Waiting job cancelled");
                self.notifier
                    .notify(&job, JobEvent::Done, job.progress, "cancelled before scheduling")
                    .await;
                Ok(CancelOutcome::Cancelled)
            }
            JobStatus::Scheduled => {
                let agent = job
                    .agent_name
                    .clone()
                    .ok_or_else(|| HerdError::NodeNotFound(String::new()))?;
                let request = Message::new(self.name.clone(), JobCancelRequest { job });
                self.registry.unicast(&agent, request).await?;
                tracing::info!(job_id = %id, node = %agent, "Cancel requested");
                Ok(CancelOutcome::Requested)
            }
            from => Err(HerdError::InvalidTransition {
                id: *id,
                from,
                to: JobStatus::Cancel,
            }),
        }
    }

    /// Soft-delete a job that is not running.
    pub async fn delete_job(&self, id: &Uuid) -> Result<Job> {
        let job = self.store.update_status(id, JobStatus::Delete).await?;
        tracing::info!(job_id = %id, "Job deleted");
        Ok(job)
    }

    pub async fn job_log(&self, id: &Uuid) -> Result<Vec<String>> {
        let job = self.job(id).await?;
        let contents = self.logs.read(&job.id).await?;
        Ok(contents.lines().map(str::to_string).collect())
    }
}

/// Accept agent connections until shutdown, one session task per connection.
pub async fn serve(listener: TcpListener, ctx: Arc<ControllerContext>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("Agent listener stopped");
                break;
            }
            accepted = listener.accept() => {
                let stream = match accepted {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        tracing::warn!(error = %e, "Accept failed");
                        continue;
                    }
                };
                let conn = match Connection::from_tcp(stream) {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to set up connection");
                        continue;
                    }
                };
                tracing::debug!(peer = %conn.peer(), "Agent connected");
                tokio::spawn(handle_connection(ctx.clone(), conn));
            }
        }
    }
}

/// The controller process: agent listener, scheduler and HTTP API.
pub struct Controller {
    config: ControllerConfig,
}

impl Controller {
    pub fn new(config: ControllerConfig) -> Self {
        Self { config }
    }

    /// Run every controller subsystem until `shutdown` fires.
    ///
    /// # Errors
    ///
    /// Returns an error if the data directory can't be prepared or a listener
    /// can't be bound. Failures after startup are logged by the subsystems.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let config = self.config;
        let ctx = Arc::new(
            ControllerContext::new(
                config.name.clone(),
                &config.data_dir,
                config.scheduler.offer_timeout(),
                Arc::new(HandlerDispatcher::new()?),
            )
            .await?,
        );

        let listener = TcpListener::bind(&config.addresses.tcp).await?;
        tracing::info!(name = %config.name, addr = %config.addresses.tcp, "Controller listening for agents");

        let scheduler = ctx.scheduler(config.scheduler.interval());
        let scheduler_task = tokio::spawn(scheduler.run(shutdown.clone()));

        let http = TcpListener::bind(&config.addresses.http).await?;
        tracing::info!(addr = %config.addresses.http, "Starting API server");
        let api_task = tokio::spawn(api::serve(http, ctx.clone(), shutdown.clone()));

        serve(listener, ctx, shutdown).await;

        let _ = scheduler_task.await;
        let _ = api_task.await;
        Ok(())
    }
}
