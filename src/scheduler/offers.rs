use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use uuid::Uuid;

/// Outstanding job offers.
///
/// A job stays WAITING until its agent answers the offer, so without this
/// book the next tick would offer it again. An offer is settled by any
/// JobAccepted reply for the job and otherwise expires after the TTL.
#[derive(Debug)]
pub struct OfferBook {
    ttl: Duration,
    pending: Mutex<HashMap<Uuid, Instant>>,
}

impl OfferBook {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<Uuid, Instant>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record(&self, job_id: Uuid) {
        self.pending().insert(job_id, Instant::now());
    }

    pub fn settle(&self, job_id: &Uuid) {
        self.pending().remove(job_id);
    }

    pub fn is_pending(&self, job_id: &Uuid) -> bool {
        self.pending()
            .get(job_id)
            .is_some_and(|offered| offered.elapsed() < self.ttl)
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let mut pending = self.pending();
        let before = pending.len();
        pending.retain(|_, offered| offered.elapsed() < self.ttl);
        before - pending.len()
    }
}
