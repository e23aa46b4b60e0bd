//! Job record model and scheduling metadata.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default lease duration (time-to-run) in seconds.
pub const DEFAULT_TTR_SECS: u64 = 300;

/// Unique identifier for a job, assigned by the storage backend.
///
/// Ids are opaque strings, unique within a single backend instance and
/// immutable for the lifetime of the record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub String);

impl JobId {
    /// Wrap a backend-assigned id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Lifecycle stage of a job record.
///
/// Transitions: waiting -> reserved (claim), reserved -> done (success),
/// reserved -> failed (explicit failure), reserved -> waiting (lease expiry,
/// attempt counter increments). `Done` and `Failed` are terminal. `Delayed`
/// is the externally-observable view of a waiting record whose delay has not
/// yet elapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Waiting,
    Delayed,
    Reserved,
    Done,
    Failed,
}

impl JobStatus {
    /// Whether the status permits no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Waiting => "waiting",
            JobStatus::Delayed => "delayed",
            JobStatus::Reserved => "reserved",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Scheduling metadata carried by every job record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobMeta {
    /// Lease duration in seconds; once elapsed the reservation is assumed
    /// abandoned and the job becomes reservable again.
    pub ttr_secs: u64,
    /// Seconds the job stays invisible to reservation after being pushed.
    pub delay_secs: u64,
    /// Higher priority is served first; ties break by push order.
    pub priority: i64,
    /// Unix timestamp of the push.
    pub pushed_at: i64,
    /// Unix timestamp of the current reservation, if any.
    pub reserved_at: Option<i64>,
    /// Unix timestamp of reaching a terminal state, if any.
    pub done_at: Option<i64>,
    /// Delivery attempt; starts at 1, incremented by lease-expiry recovery.
    pub attempt: u32,
    /// Backend-specific extra, e.g. a broker receipt token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt: Option<String>,
}

impl Default for JobMeta {
    fn default() -> Self {
        Self {
            ttr_secs: DEFAULT_TTR_SECS,
            delay_secs: 0,
            priority: 0,
            pushed_at: unix_now(),
            reserved_at: None,
            done_at: None,
            attempt: 1,
            receipt: None,
        }
    }
}

impl JobMeta {
    /// Unix timestamp at which the job becomes visible to reservation.
    pub fn visible_at(&self) -> i64 {
        self.pushed_at + self.delay_secs as i64
    }

    /// Whether the job is visible to reservation at `now`.
    pub fn is_due(&self, now: i64) -> bool {
        now >= self.visible_at()
    }

    /// Lease duration as a `Duration`.
    pub fn ttr(&self) -> Duration {
        Duration::from_secs(self.ttr_secs)
    }
}

/// A job as stored by and returned from a storage backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    /// Backend-assigned id.
    pub id: JobId,
    /// Selects which registered handler processes the job.
    pub name: String,
    /// Opaque serialized payload; backends never interpret it.
    pub body: Vec<u8>,
    /// Scheduling metadata.
    pub meta: JobMeta,
}

/// Options accepted when submitting a job.
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    /// Lease duration; falls back to the engine-wide default.
    pub ttr: Option<Duration>,
    /// Delay before the job becomes visible to reservation.
    pub delay: Option<Duration>,
    /// Higher priority is served first.
    pub priority: i64,
}

impl SubmitOptions {
    /// Create options with defaults (engine ttr, no delay, priority 0).
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the lease duration.
    pub fn ttr(mut self, ttr: Duration) -> Self {
        self.ttr = Some(ttr);
        self
    }

    /// Set the visibility delay.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Set the priority.
    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }
}

/// Get current Unix timestamp in seconds.
pub fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meta_defaults() {
        let meta = JobMeta::default();
        assert_eq!(meta.ttr_secs, 300);
        assert_eq!(meta.delay_secs, 0);
        assert_eq!(meta.priority, 0);
        assert_eq!(meta.attempt, 1);
        assert!(meta.reserved_at.is_none());
        assert!(meta.done_at.is_none());
        assert!(meta.receipt.is_none());
    }

    #[test]
    fn test_meta_visibility() {
        let meta = JobMeta {
            pushed_at: 1000,
            delay_secs: 5,
            ..Default::default()
        };
        assert_eq!(meta.visible_at(), 1005);
        assert!(!meta.is_due(1004));
        assert!(meta.is_due(1005));
        assert!(meta.is_due(2000));
    }

    #[test]
    fn test_meta_no_delay_is_immediately_due() {
        let meta = JobMeta {
            pushed_at: 1000,
            ..Default::default()
        };
        assert!(meta.is_due(1000));
    }

    #[test]
    fn test_meta_serde_roundtrip() {
        let meta = JobMeta {
            ttr_secs: 60,
            delay_secs: 2,
            priority: 7,
            pushed_at: 42,
            reserved_at: Some(43),
            done_at: None,
            attempt: 3,
            receipt: Some("token".to_string()),
        };
        let json = serde_json::to_string(&meta).unwrap();
        let back: JobMeta = serde_json::from_str(&json).unwrap();
        assert_eq!(back.ttr_secs, 60);
        assert_eq!(back.priority, 7);
        assert_eq!(back.attempt, 3);
        assert_eq!(back.receipt.as_deref(), Some("token"));
    }

    #[test]
    fn test_status_terminal() {
        assert!(JobStatus::Done.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Waiting.is_terminal());
        assert!(!JobStatus::Delayed.is_terminal());
        assert!(!JobStatus::Reserved.is_terminal());
    }

    #[test]
    fn test_status_serde_lowercase() {
        let json = serde_json::to_string(&JobStatus::Reserved).unwrap();
        assert_eq!(json, "\"reserved\"");
        let back: JobStatus = serde_json::from_str("\"failed\"").unwrap();
        assert_eq!(back, JobStatus::Failed);
    }

    #[test]
    fn test_job_id_display() {
        let id = JobId::new("42");
        assert_eq!(format!("{}", id), "42");
        assert_eq!(id.as_str(), "42");
    }

    #[test]
    fn test_submit_options_builder() {
        let opts = SubmitOptions::new()
            .ttr(Duration::from_secs(30))
            .delay(Duration::from_secs(2))
            .priority(9);
        assert_eq!(opts.ttr, Some(Duration::from_secs(30)));
        assert_eq!(opts.delay, Some(Duration::from_secs(2)));
        assert_eq!(opts.priority, 9);
    }
}
