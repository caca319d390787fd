use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{HerdError, Result};
use crate::scheduler::job::{Job, JobStatus};

const DEFAULT_MAX_JOBS: usize = 100_000;

/// File under the data directory holding the job journal.
pub const JOURNAL_FILE: &str = "jobs.jsonl";

/// Query filter for [`JobStore::list`]. Deleted jobs are only returned when
/// asked for explicitly by status.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub agent: Option<String>,
    pub limit: Option<usize>,
}

impl JobFilter {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn on_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matches(&self, job: &Job) -> bool {
        let status_ok = match self.status {
            Some(status) => job.status == status,
            None => job.status != JobStatus::Delete,
        };
        let agent_ok = match &self.agent {
            Some(agent) => job.agent_name.as_deref() == Some(agent.as_str()),
            None => true,
        };
        status_ok && agent_ok
    }
}

/// Append-only record of job states, one JSON object per line. The last line
/// for a job id wins on replay.
#[derive(Debug)]
struct Journal {
    file: File,
}

impl Journal {
    async fn append(&mut self, job: &Job) -> Result<()> {
        let mut line = serde_json::to_vec(job)?;
        line.push(b'\n');
        self.file.write_all(&line).await?;
        self.file.flush().await?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<Uuid, Job>,
    /// Submission order, used for listing.
    order: Vec<Uuid>,
    journal: Option<Journal>,
}

impl Inner {
    /// Record `job` in the journal, then in memory.
    async fn commit(&mut self, job: Job) -> Result<Job> {
        if let Some(journal) = self.journal.as_mut() {
            journal.append(&job).await?;
        }
        if self.jobs.insert(job.id, job.clone()).is_none() {
            self.order.push(job.id);
        }
        Ok(job)
    }

    /// Forget deleted jobs. Returns how many were dropped.
    fn evict_deleted(&mut self) -> usize {
        let before = self.jobs.len();
        self.jobs.retain(|_, job| job.status != JobStatus::Delete);
        let jobs = &self.jobs;
        self.order.retain(|id| jobs.contains_key(id));
        before - self.jobs.len()
    }
}

/// Job store. Every operation takes the lock once, so each one is atomic on
/// its own; sequences of operations are not.
///
/// A store opened on a data directory journals every change to disk before
/// applying it, and replays the journal on the next open.
#[derive(Debug)]
pub struct JobStore {
    inner: RwLock<Inner>,
    max_jobs: usize,
}

impl Default for JobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl JobStore {
    /// A store that lives in memory only.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_JOBS)
    }

    pub fn with_capacity(max_jobs: usize) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            max_jobs,
        }
    }

    /// Open the store persisted under `data_dir`, replaying its journal.
    pub async fn open(data_dir: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_capacity(data_dir, DEFAULT_MAX_JOBS).await
    }

    /// Like [`JobStore::open`] with an explicit job limit.
    ///
    /// Jobs that were SCHEDULED when the journal was written have lost their
    /// agent session and are marked ERROR. The journal is compacted to one
    /// line per job before new entries are appended.
    pub async fn open_with_capacity(data_dir: impl AsRef<Path>, max_jobs: usize) -> Result<Self> {
        let dir = data_dir.as_ref();
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(JOURNAL_FILE);

        let mut inner = Inner::default();
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        for (number, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Job>(line) {
                Ok(job) => {
                    if inner.jobs.insert(job.id, job.clone()).is_none() {
                        inner.order.push(job.id);
                    }
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), line = number + 1, error = %e, "Skipping unreadable journal entry");
                }
            }
        }

        let mut orphaned = 0;
        for job in inner.jobs.values_mut() {
            if job.status == JobStatus::Scheduled {
                job.status = JobStatus::Error;
                orphaned += 1;
            }
        }
        if orphaned > 0 {
            tracing::warn!(jobs = orphaned, "Jobs were running when the controller stopped, marked as error");
        }

        let file = compact(&path, &inner).await?;
        inner.journal = Some(Journal { file });
        tracing::info!(path = %path.display(), jobs = inner.jobs.len(), "Job store opened");

        Ok(Self {
            inner: RwLock::new(inner),
            max_jobs,
        })
    }

    /// Add a job. When the store is full, deleted jobs are forgotten to make
    /// room before the insert is refused.
    pub async fn insert(&self, job: Job) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.jobs.len() >= self.max_jobs && inner.evict_deleted() > 0 {
            tracing::debug!(jobs = inner.jobs.len(), "Evicted deleted jobs");
        }
        if inner.jobs.len() >= self.max_jobs {
            return Err(HerdError::StoreFull(self.max_jobs));
        }
        inner.commit(job).await?;
        Ok(())
    }

    pub async fn get(&self, id: &Uuid) -> Option<Job> {
        self.inner.read().await.jobs.get(id).cloned()
    }

    /// Jobs matching `filter`, in submission order.
    pub async fn list(&self, filter: &JobFilter) -> Vec<Job> {
        let inner = self.inner.read().await;
        let matching = inner
            .order
            .iter()
            .filter_map(|id| inner.jobs.get(id))
            .filter(|job| filter.matches(job))
            .cloned();
        match filter.limit {
            Some(limit) if limit > 0 => matching.take(limit).collect(),
            _ => matching.collect(),
        }
    }

    /// Move a job to `status`, enforcing the lifecycle. Returns the updated job.
    pub async fn update_status(&self, id: &Uuid, status: JobStatus) -> Result<Job> {
        let mut inner = self.inner.write().await;
        let mut job = inner.jobs.get(id).cloned().ok_or(HerdError::JobNotFound(*id))?;
        if !job.status.can_transition_to(status) {
            return Err(HerdError::InvalidTransition {
                id: *id,
                from: job.status,
                to: status,
            });
        }
        job.status = status;
        inner.commit(job).await
    }

    pub async fn update_agent_name(&self, id: &Uuid, agent: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        let mut job = inner.jobs.get(id).cloned().ok_or(HerdError::JobNotFound(*id))?;
        job.agent_name = Some(agent.to_string());
        inner.commit(job).await?;
        Ok(())
    }

    pub async fn update_progress(&self, id: &Uuid, progress: f32) -> Result<()> {
        let mut inner = self.inner.write().await;
        let mut job = inner.jobs.get(id).cloned().ok_or(HerdError::JobNotFound(*id))?;
        job.progress = progress.clamp(0.0, 1.0);
        inner.commit(job).await?;
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.jobs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.jobs.is_empty()
    }
}

/// Rewrite the journal with the current state of every job and reopen it
/// for appending.
async fn compact(path: &Path, inner: &Inner) -> Result<File> {
    let tmp: PathBuf = path.with_extension("jsonl.tmp");
    let mut buf = Vec::new();
    for job in inner.order.iter().filter_map(|id| inner.jobs.get(id)) {
        serde_json::to_writer(&mut buf, job)?;
        buf.push(b'\n');
    }
    tokio::fs::write(&tmp, &buf).await?;
    tokio::fs::rename(&tmp, path).await?;

    let file = OpenOptions::new().create(true).append(true).open(path).await?;
    Ok(file)
}
