pub mod runner;
pub mod telemetry;

use std::sync::{Arc, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::AgentConfig;
use crate::driver::DriverRegistry;
use crate::error::{HerdError, ProtocolError, Result};
use crate::protocol::{
    spawn_writer, AgentInfo, Command, Connection, HandshakeInitial, Message, Payload,
    NODE_TYPE_AGENT, OUTBOX_CAPACITY,
};
use crate::scheduler::GpuInfo;

pub use runner::{JobRunner, RunningJob, RunningJobs};

/// How long a closing session waits for running jobs to report back.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Worker process: connects to the controller and runs the jobs it offers.
pub struct Agent {
    config: AgentConfig,
    drivers: DriverRegistry,
    gpu_tx: Option<watch::Sender<Vec<GpuInfo>>>,
    gpus: watch::Receiver<Vec<GpuInfo>>,
    running: RunningJobs,
}

impl Agent {
    pub fn new(config: AgentConfig, drivers: DriverRegistry) -> Self {
        let (gpu_tx, gpus) = watch::channel(Vec::new());
        Self {
            config,
            drivers,
            gpu_tx: Some(gpu_tx),
            gpus,
            running: RunningJobs::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Jobs still running, including those left over from an earlier session.
    pub fn jobs_running(&self) -> usize {
        self.running.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Replace the advertised GPU inventory.
    pub fn set_gpus(&self, gpus: Vec<GpuInfo>) {
        if let Some(tx) = &self.gpu_tx {
            tx.send_replace(gpus);
        }
    }

    /// Connect to the cluster and serve sessions until shutdown. A lost or
    /// refused session is retried after the reconnect delay.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        if self.config.nvidia.enabled {
            if let Some(tx) = self.gpu_tx.take() {
                tokio::spawn(telemetry::run_poller(
                    self.config.nvidia.nvidia_smi.clone(),
                    self.config.nvidia.poll_interval(),
                    tx,
                    shutdown.clone(),
                ));
            }
        }

        loop {
            let result = match Connection::connect(&self.config.cluster).await {
                Ok(conn) => self.run_session(conn, &shutdown).await,
                Err(e) => Err(e.into()),
            };

            if shutdown.is_cancelled() {
                return Ok(());
            }

            let Some(delay) = self.config.reconnect_delay() else {
                return result;
            };
            match &result {
                Ok(()) => tracing::warn!(cluster = %self.config.cluster, "Session ended"),
                Err(e) => tracing::warn!(cluster = %self.config.cluster, error = %e, "Session failed"),
            }
            tracing::info!(delay_ms = delay.as_millis() as u64, "Reconnecting");

            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// One controller session: handshake, then serve offers and cancel
    /// requests until the connection drops or shutdown fires.
    pub async fn run_session<S>(&self, conn: Connection<S>, shutdown: &CancellationToken) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let peer = conn.peer().to_string();
        let (mut reader, mut writer) = conn.into_split();

        let capacity = self.config.capacity();
        let hello = Message::new(
            self.config.name.clone(),
            HandshakeInitial {
                node_type: NODE_TYPE_AGENT.to_string(),
                capabilities: self.config.capabilities.clone(),
                agent_info: AgentInfo {
                    capacity,
                    jobs_running: self.jobs_running() as u32,
                    gpus: self.gpus.borrow().clone(),
                },
            },
        );
        writer.write_message(&hello).await?;

        let response = reader.read_message().await?;
        let got = response.command();
        let Payload::HandshakeResponse(response) = response.payload else {
            return Err(ProtocolError::Unexpected {
                expected: Command::HandshakeResponse,
                got,
            }
            .into());
        };
        if !response.accepted {
            return Err(HerdError::HandshakeRefused(response.refuse_reason));
        }
        tracing::info!(name = %self.config.name, peer = %peer, capacity, "Connected to cluster");

        let (outbox, mut writer_task) = spawn_writer(writer, OUTBOX_CAPACITY);
        let runner = Arc::new(JobRunner::new(
            self.config.name.clone(),
            capacity,
            self.config.capabilities.clone(),
            self.drivers.clone(),
            self.gpus.clone(),
            outbox,
            self.running.clone(),
        ));

        let result = loop {
            tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                message = reader.read_message() => {
                    let message = match message {
                        Ok(message) => message,
                        Err(e) => break Err(HerdError::from(e)),
                    };
                    match message.payload {
                        Payload::NewJobOffer(offer) => runner.offer(offer.job).await,
                        Payload::JobCancelRequest(request) => runner.cancel(request.job).await,
                        other => {
                            tracing::warn!(command = %other.command(), "Unexpected message from controller");
                        }
                    }
                }
            }
        };

        if runner.jobs_running() > 0 {
            tracing::info!(jobs = runner.jobs_running(), "Session closing, cancelling running jobs");
            runner.cancel_all().await;
        }
        drop(runner);
        if tokio::time::timeout(DRAIN_TIMEOUT, &mut writer_task).await.is_err() {
            tracing::warn!("Jobs still running after session close");
            writer_task.abort();
        }
        result
    }
}
