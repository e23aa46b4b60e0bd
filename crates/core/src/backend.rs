//! Storage backend contract for job persistence.
//!
//! This module defines the narrow trait every persistence technology must
//! implement (SQLite, filesystem, in-memory, Redis). The engine only ever
//! touches storage through these five operations.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::job::{JobId, JobMeta, JobRecord, JobStatus};

/// Storage contract consumed by the processing engine.
///
/// Implementations must be thread-safe (Send + Sync). The binding guarantees
/// every backend must honor:
///
/// - `reserve` is atomic with respect to concurrent `reserve` calls against
///   the same store: no record is ever handed to two callers while reserved.
/// - Visible waiting records are served priority-descending, ties broken by
///   push order (FIFO within a priority band).
/// - A record with a delay is invisible to `reserve` until the delay elapses.
/// - A record whose lease (ttr) expired becomes reservable again with its
///   attempt counter incremented; it is exactly as eligible as a fresh
///   record of the same priority.
/// - `fail` is terminal; the engine never retries an explicitly failed job.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Persist a new job and return its backend-assigned id.
    async fn insert(&self, name: &str, body: &[u8], meta: JobMeta) -> Result<JobId>;

    /// Claim the best visible waiting job, flipping it to reserved.
    ///
    /// Returns `None` if no job became available within `timeout`. Before
    /// claiming, the backend recovers any reservation whose lease expired.
    async fn reserve(&self, timeout: Duration) -> Result<Option<JobRecord>>;

    /// Mark a reserved job done (terminal).
    async fn complete(&self, job: &JobRecord) -> Result<()>;

    /// Mark a reserved job failed (terminal), recording the error text.
    async fn fail(&self, job: &JobRecord, error: &str) -> Result<()>;

    /// Current lifecycle stage, or `None` if the record is gone (archived).
    async fn status(&self, id: &JobId) -> Result<Option<JobStatus>>;
}

/// A type-erased backend that can be shared across threads.
pub type DynBackend = Arc<dyn Backend>;

/// Wrapper around Arc<dyn Backend> for convenience.
#[derive(Clone)]
pub struct SharedBackend {
    inner: DynBackend,
}

impl SharedBackend {
    /// Create a new SharedBackend from any Backend implementation.
    pub fn new<B: Backend + 'static>(backend: B) -> Self {
        Self {
            inner: Arc::new(backend),
        }
    }

    /// Get a reference to the inner backend.
    pub fn inner(&self) -> &DynBackend {
        &self.inner
    }
}

#[async_trait]
impl Backend for SharedBackend {
    async fn insert(&self, name: &str, body: &[u8], meta: JobMeta) -> Result<JobId> {
        self.inner.insert(name, body, meta).await
    }

    async fn reserve(&self, timeout: Duration) -> Result<Option<JobRecord>> {
        self.inner.reserve(timeout).await
    }

    async fn complete(&self, job: &JobRecord) -> Result<()> {
        self.inner.complete(job).await
    }

    async fn fail(&self, job: &JobRecord, error: &str) -> Result<()> {
        self.inner.fail(job, error).await
    }

    async fn status(&self, id: &JobId) -> Result<Option<JobStatus>> {
        self.inner.status(id).await
    }
}
