//! In-process memory backend.
//!
//! All mutation happens under a single mutex, so reservation atomicity is
//! free. Delayed entries are migrated into the waiting list by a timer task
//! firing at their due time; each reservation spawns a lease timer that
//! returns the job to the waiting list if it is neither completed nor failed
//! before the lease elapses.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::backend::Backend;
use crate::error::{Result, ToilError};
use crate::job::{unix_now, JobId, JobMeta, JobRecord, JobStatus};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

struct StoredJob {
    id: u64,
    name: String,
    body: Vec<u8>,
    meta: JobMeta,
    /// Push-order rank within a priority band. Kept through delay migration;
    /// lease-expiry recycling assigns a fresh one (recycled jobs rank as
    /// freshly pushed).
    seq: u64,
}

impl StoredJob {
    fn to_record(&self) -> JobRecord {
        JobRecord {
            id: JobId::new(self.id.to_string()),
            name: self.name.clone(),
            body: self.body.clone(),
            meta: self.meta.clone(),
        }
    }
}

#[derive(Default)]
struct State {
    next_id: u64,
    next_seq: u64,
    /// Priority-descending, push-order within a band; maintained by
    /// insertion sort on (priority, seq).
    waiting: Vec<StoredJob>,
    delayed: HashMap<u64, StoredJob>,
    /// Reserved jobs tagged with a reservation epoch so a stale lease timer
    /// never recycles a job that was already resolved and re-reserved.
    reserved: HashMap<u64, (StoredJob, u64)>,
    finished: HashMap<u64, (JobStatus, Option<String>)>,
    next_epoch: u64,
}

fn insert_sorted(waiting: &mut Vec<StoredJob>, job: StoredJob) {
    let pos = waiting
        .iter()
        .position(|j| {
            j.meta.priority < job.meta.priority
                || (j.meta.priority == job.meta.priority && j.seq > job.seq)
        })
        .unwrap_or(waiting.len());
    waiting.insert(pos, job);
}

/// In-memory backend for job storage.
///
/// Jobs do not survive the process; intended for tests and single-process
/// deployments.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<State>>,
}

impl MemoryBackend {
    /// Create a new empty memory backend.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("memory backend state poisoned")
    }

    fn spawn_delay_timer(&self, id: u64, due_in: Duration) {
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            tokio::time::sleep(due_in).await;
            let mut state = state.lock().expect("memory backend state poisoned");
            if let Some(job) = state.delayed.remove(&id) {
                tracing::debug!(job_id = id, "delayed job became visible");
                insert_sorted(&mut state.waiting, job);
            }
        });
    }

    fn spawn_lease_timer(&self, id: u64, epoch: u64, ttr: Duration) {
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            tokio::time::sleep(ttr).await;
            let mut state = state.lock().expect("memory backend state poisoned");
            match state.reserved.remove(&id) {
                Some((mut job, e)) if e == epoch => {
                    job.meta.attempt += 1;
                    job.meta.reserved_at = None;
                    job.seq = state.next_seq;
                    state.next_seq += 1;
                    tracing::debug!(
                        job_id = id,
                        attempt = job.meta.attempt,
                        "lease expired, job recycled"
                    );
                    insert_sorted(&mut state.waiting, job);
                }
                Some(other) => {
                    // Reservation from a newer epoch; leave it alone.
                    state.reserved.insert(id, other);
                }
                None => {}
            }
        });
    }

    fn parse_id(id: &JobId) -> Result<u64> {
        id.as_str()
            .parse()
            .map_err(|_| ToilError::Backend(format!("Invalid job id: {}", id)))
    }

    fn try_claim(&self) -> Option<JobRecord> {
        let mut state = self.lock();
        if state.waiting.is_empty() {
            return None;
        }
        let mut job = state.waiting.remove(0);
        job.meta.reserved_at = Some(unix_now());
        let record = job.to_record();
        let epoch = state.next_epoch;
        state.next_epoch += 1;
        let id = job.id;
        let ttr = job.meta.ttr();
        state.reserved.insert(id, (job, epoch));
        drop(state);
        self.spawn_lease_timer(id, epoch, ttr);
        Some(record)
    }

    fn finish(&self, job: &JobRecord, status: JobStatus, error: Option<&str>) -> Result<()> {
        let id = Self::parse_id(&job.id)?;
        let mut state = self.lock();
        // The attempt counter fences the resolution: once the lease expired
        // and recovery bumped it, the stale claim no longer matches and its
        // resolution is dropped.
        let owns = matches!(
            state.reserved.get(&id),
            Some((j, _)) if j.meta.attempt == job.meta.attempt
        );
        if !owns {
            let known = state.reserved.contains_key(&id)
                || state.waiting.iter().any(|j| j.id == id)
                || state.finished.contains_key(&id);
            if known {
                tracing::debug!(job_id = %job.id, "resolution for a lost lease ignored");
                return Ok(());
            }
            return Err(ToilError::Backend(format!("Job not found: {}", job.id)));
        }
        state.reserved.remove(&id);
        state.finished.insert(id, (status, error.map(String::from)));
        Ok(())
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn insert(&self, name: &str, body: &[u8], meta: JobMeta) -> Result<JobId> {
        let now = unix_now();
        let due = meta.is_due(now);
        let due_in = Duration::from_secs(meta.delay_secs);
        let mut state = self.lock();
        let id = state.next_id;
        state.next_id += 1;
        let seq = state.next_seq;
        state.next_seq += 1;
        let job = StoredJob {
            id,
            name: name.to_string(),
            body: body.to_vec(),
            meta,
            seq,
        };
        if due {
            insert_sorted(&mut state.waiting, job);
        } else {
            state.delayed.insert(id, job);
            drop(state);
            self.spawn_delay_timer(id, due_in);
        }
        Ok(JobId::new(id.to_string()))
    }

    async fn reserve(&self, timeout: Duration) -> Result<Option<JobRecord>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(record) = self.try_claim() {
                return Ok(Some(record));
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn complete(&self, job: &JobRecord) -> Result<()> {
        self.finish(job, JobStatus::Done, None)
    }

    async fn fail(&self, job: &JobRecord, error: &str) -> Result<()> {
        self.finish(job, JobStatus::Failed, Some(error))
    }

    async fn status(&self, id: &JobId) -> Result<Option<JobStatus>> {
        let id = Self::parse_id(id)?;
        let state = self.lock();
        if state.delayed.contains_key(&id) {
            return Ok(Some(JobStatus::Delayed));
        }
        if state.waiting.iter().any(|j| j.id == id) {
            return Ok(Some(JobStatus::Waiting));
        }
        if state.reserved.contains_key(&id) {
            return Ok(Some(JobStatus::Reserved));
        }
        Ok(state.finished.get(&id).map(|(status, _)| *status))
    }
}
