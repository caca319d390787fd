pub mod gpu;
pub mod job;
pub mod offers;
pub mod placement;
pub mod store;

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;

use crate::controller::registry::NodeRegistry;
use crate::protocol::{Message, NewJobOffer};

pub use gpu::{GpuInfo, GpuRequirement};
pub use job::{Job, JobEvent, JobSpec, JobStatus, UpdateHandlerSpec};
pub use offers::OfferBook;
pub use placement::{distribute, Assignment, NodeSnapshot};
pub use store::{JobFilter, JobStore};

/// Periodically matches WAITING jobs to live agents and sends them offers.
///
/// A job's status is not touched here: it stays WAITING until the agent
/// accepts, and the offer book keeps it out of later passes meanwhile.
pub struct Scheduler {
    name: String,
    interval: Duration,
    store: Arc<JobStore>,
    registry: Arc<NodeRegistry>,
    offers: Arc<OfferBook>,
}

impl Scheduler {
    pub fn new(
        name: impl Into<String>,
        interval: Duration,
        store: Arc<JobStore>,
        registry: Arc<NodeRegistry>,
        offers: Arc<OfferBook>,
    ) -> Self {
        Self {
            name: name.into(),
            interval,
            store,
            registry,
            offers,
        }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Scheduler stopped");
                    break;
                }
                _ = interval.tick() => {
                    self.tick().await;
                }
            }
        }
    }

    /// One scheduling pass. Returns the number of offers sent.
    pub async fn tick(&self) -> usize {
        self.offers.prune();

        let waiting: Vec<Job> = self
            .store
            .list(&JobFilter::status(JobStatus::Waiting))
            .await
            .into_iter()
            .filter(|job| !self.offers.is_pending(&job.id))
            .collect();
        if waiting.is_empty() {
            return 0;
        }

        let nodes = self.registry.snapshot().await;
        if nodes.is_empty() {
            return 0;
        }

        let assignments = distribute(&waiting, &nodes);
        for assignment in &assignments {
            self.offers.record(assignment.job.id);
        }

        let sends = assignments.into_iter().map(|Assignment { node, job }| {
            let registry = self.registry.clone();
            let offers = self.offers.clone();
            let message = Message::new(self.name.clone(), NewJobOffer { job: job.clone() });
            async move {
                match registry.unicast(&node, message).await {
                    Ok(()) => {
                        tracing::debug!(job_id = %job.id, node = %node, "Job offered");
                        true
                    }
                    Err(e) => {
                        // Node went away or is not reading; retry next pass.
                        offers.settle(&job.id);
                        tracing::warn!(job_id = %job.id, node = %node, error = %e, "Failed to send job offer");
                        false
                    }
                }
            }
        });

        let sent = join_all(sends).await.into_iter().filter(|ok| *ok).count();
        if sent > 0 {
            tracing::info!(offers = sent, waiting = waiting.len(), "Scheduling pass complete");
        }
        sent
    }
}
