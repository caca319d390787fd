//! Job execution backends.
//!
//! A driver turns a job's `driver_config` into actual work. Drivers are
//! registered by name once at agent startup and shared by every job.

pub mod exec;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::DriverError;
use crate::scheduler::Job;

pub use exec::{ExecDriver, EXEC_DRIVER};

/// One progress report from a running job.
#[derive(Debug, Clone, PartialEq)]
pub struct Progress {
    pub progress: f32,
    pub message: String,
}

/// Channel a driver reports progress through. Reports are delivered in the
/// order they were sent.
#[derive(Debug, Clone)]
pub struct ProgressSender {
    tx: mpsc::UnboundedSender<Progress>,
}

impl ProgressSender {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Progress>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Report progress. Reports sent after the receiver is gone are dropped.
    pub fn send(&self, progress: f32, message: impl Into<String>) {
        let _ = self.tx.send(Progress {
            progress,
            message: message.into(),
        });
    }
}

#[async_trait]
pub trait Driver: Send + Sync {
    fn name(&self) -> &str;

    /// Execute `job` to completion.
    ///
    /// Returns [`DriverError::Interrupted`] when the job stopped because of
    /// [`Driver::cancel`].
    async fn run(&self, job: &Job, progress: ProgressSender) -> Result<(), DriverError>;

    /// Ask a running job to stop. Returns once the request is delivered, not
    /// when the job has stopped.
    async fn cancel(&self, job: &Job) -> Result<(), DriverError>;
}

/// Drivers available on an agent, keyed by name.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    drivers: HashMap<String, Arc<dyn Driver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in driver.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ExecDriver::new()));
        registry
    }

    pub fn register(&mut self, driver: Arc<dyn Driver>) {
        self.drivers.insert(driver.name().to_string(), driver);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Driver>, DriverError> {
        self.drivers
            .get(name)
            .cloned()
            .ok_or_else(|| DriverError::UnknownDriver(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.drivers.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.drivers.keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("drivers", &self.names())
            .finish()
    }
}
