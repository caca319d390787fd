use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::bag::ConfigBag;
use crate::error::HerdError;
use crate::scheduler::gpu::GpuRequirement;

pub const DEFAULT_PRIORITY: u32 = 10;
pub const MAX_PRIORITY: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting to be placed on an agent
    Waiting,
    /// Accepted by an agent and executing there
    Scheduled,
    Success,
    Error,
    Cancel,
    Interrupt,
    /// Soft-deleted, hidden from listings
    Delete,
}

impl JobStatus {
    pub fn can_cancel(self) -> bool {
        matches!(self, JobStatus::Waiting | JobStatus::Scheduled)
    }

    pub fn can_delete(self) -> bool {
        !matches!(self, JobStatus::Scheduled | JobStatus::Delete)
    }

    /// Terminal outcome reported for an execution.
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            JobStatus::Success | JobStatus::Error | JobStatus::Cancel | JobStatus::Interrupt
        )
    }

    pub fn can_transition_to(self, next: JobStatus) -> bool {
        match next {
            JobStatus::Waiting => false,
            JobStatus::Scheduled => self == JobStatus::Waiting,
            JobStatus::Cancel => self.can_cancel(),
            JobStatus::Success | JobStatus::Error | JobStatus::Interrupt => {
                self == JobStatus::Scheduled
            }
            JobStatus::Delete => self.can_delete(),
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Waiting => write!(f, "waiting"),
            JobStatus::Scheduled => write!(f, "scheduled"),
            JobStatus::Success => write!(f, "success"),
            JobStatus::Error => write!(f, "error"),
            JobStatus::Cancel => write!(f, "cancel"),
            JobStatus::Interrupt => write!(f, "interrupt"),
            JobStatus::Delete => write!(f, "delete"),
        }
    }
}

/// Lifecycle events update handlers can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobEvent {
    Create,
    Update,
    Done,
}

impl std::fmt::Display for JobEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobEvent::Create => write!(f, "create"),
            JobEvent::Update => write!(f, "update"),
            JobEvent::Done => write!(f, "done"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateHandlerSpec {
    #[serde(rename = "type")]
    pub handler_type: String,
    #[serde(default)]
    pub on: Vec<JobEvent>,
    #[serde(default)]
    pub config: ConfigBag,
}

impl UpdateHandlerSpec {
    pub fn listens_to(&self, event: JobEvent) -> bool {
        self.on.contains(&event)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub identifier: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub agent_name: Option<String>,
    pub driver: String,
    #[serde(default)]
    pub driver_config: ConfigBag,
    #[serde(default)]
    pub update_handlers: Vec<UpdateHandlerSpec>,
    #[serde(default)]
    pub restrict: Vec<String>,
    #[serde(default)]
    pub gpu_requirements: Vec<GpuRequirement>,
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub progress: f32,
    #[serde(default)]
    pub user_data: BTreeMap<String, Value>,
}

impl Job {
    pub fn new(identifier: impl Into<String>, driver: impl Into<String>, driver_config: ConfigBag) -> Self {
        Self {
            id: Uuid::new_v4(),
            identifier: identifier.into(),
            status: JobStatus::Waiting,
            created_at: Utc::now(),
            agent_name: None,
            driver: driver.into(),
            driver_config,
            update_handlers: Vec::new(),
            restrict: Vec::new(),
            gpu_requirements: Vec::new(),
            priority: DEFAULT_PRIORITY,
            progress: 0.0,
            user_data: BTreeMap::new(),
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_restrict<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.restrict = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_gpu_requirements(mut self, requirements: Vec<GpuRequirement>) -> Self {
        self.gpu_requirements = requirements;
        self
    }
}

/// A job submission as received from the administrative API.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobSpec {
    #[serde(default)]
    pub identifier: String,
    #[serde(default)]
    pub driver: String,
    #[serde(default)]
    pub driver_config: ConfigBag,
    #[serde(default)]
    pub update_handlers: Vec<UpdateHandlerSpec>,
    #[serde(default)]
    pub restrict: Vec<String>,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub gpu_requirements: Vec<GpuRequirement>,
    #[serde(default)]
    pub user_data: BTreeMap<String, Value>,
}

impl JobSpec {
    /// Validate the submission and turn it into a fresh WAITING job.
    ///
    /// Priority is clamped to `0..=100`; zero selects [`DEFAULT_PRIORITY`].
    pub fn into_job(self) -> Result<Job, HerdError> {
        if self.identifier.is_empty() || self.driver.is_empty() || self.driver_config.is_empty() {
            return Err(HerdError::InvalidJob(
                "identifier, driver and driver_config must not be empty".to_string(),
            ));
        }

        let priority = match self.priority.clamp(0, MAX_PRIORITY as i64) {
            0 => DEFAULT_PRIORITY,
            p => p as u32,
        };

        let mut job = Job::new(self.identifier, self.driver, self.driver_config)
            .with_priority(priority)
            .with_restrict(self.restrict)
            .with_gpu_requirements(self.gpu_requirements);
        job.update_handlers = self.update_handlers;
        job.user_data = self.user_data;
        Ok(job)
    }
}
