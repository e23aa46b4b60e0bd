//! Redis backend for the toil job queue.
//!
//! Jobs live as JSON members of three sorted sets: `ready` (scored by a
//! composed priority/sequence value so ZPOPMIN yields the highest-priority,
//! oldest job), `delayed` (scored by the unix time the job becomes visible)
//! and `inflight` (scored by the lease deadline). Failed jobs are pushed to
//! a list for inspection. The broker owns delivery, so per-job status
//! lookups are not supported here.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use toil_redis::RedisBackend;
//! use toil_core::Engine;
//!
//! #[tokio::main]
//! async fn main() -> toil_core::Result<()> {
//!     let backend = RedisBackend::new("redis://localhost", "myapp").await?;
//!     let engine = Engine::builder().backend(backend).build()?;
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use toil_core::{unix_now, Backend, JobId, JobMeta, JobRecord, JobStatus, Result, ToilError};
use uuid::Uuid;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Sequence numbers occupy one score "band" per priority level.
const SEQ_RANGE: u64 = 1_000_000_000;

/// Largest priority magnitude the composed score can hold without bands
/// overlapping or the f64 score losing integer precision.
const MAX_PRIORITY: i64 = 1_000_000;

/// Table prefix for all toil-created keys.
const TOIL_TABLE_PREFIX: &str = "_toil_tb_";

/// Moves a member from one sorted set to another only if it is still present
/// in the source. Sweeps on separate engines can race on the same member; the
/// losing mover must not resurrect a job somebody else already moved on.
const MOVE_MEMBER_SCRIPT: &str = r#"
if redis.call('ZREM', KEYS[1], ARGV[1]) == 1 then
    redis.call('ZADD', KEYS[2], ARGV[3], ARGV[2])
    return 1
end
return 0
"#;

/// Manages Redis keys with a namespace prefix.
#[derive(Debug, Clone)]
pub struct ToilKeys {
    namespace: String,
}

impl ToilKeys {
    /// Create a new ToilKeys instance with the given namespace.
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    /// Get the namespace.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Key for the ready jobs sorted set (ZSET, priority/sequence score).
    pub fn ready(&self) -> String {
        format!("{}{}:ready", TOIL_TABLE_PREFIX, self.namespace)
    }

    /// Key for the delayed jobs sorted set (ZSET, scored by visible-at time).
    pub fn delayed(&self) -> String {
        format!("{}{}:delayed", TOIL_TABLE_PREFIX, self.namespace)
    }

    /// Key for the in-flight jobs sorted set (ZSET, scored by lease deadline).
    pub fn inflight(&self) -> String {
        format!("{}{}:inflight", TOIL_TABLE_PREFIX, self.namespace)
    }

    /// Key for the failed jobs list (LIST).
    pub fn failed(&self) -> String {
        format!("{}{}:failed", TOIL_TABLE_PREFIX, self.namespace)
    }

    /// Key for the monotonic submission sequence counter.
    pub fn seq(&self) -> String {
        format!("{}{}:seq", TOIL_TABLE_PREFIX, self.namespace)
    }
}

/// The JSON member stored in the sorted sets.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredJob {
    id: String,
    name: String,
    body: Vec<u8>,
    meta: JobMeta,
    seq: u64,
}

impl StoredJob {
    fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    fn decode(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Compose the ready-set score: higher priority sorts first under
    /// ZPOPMIN, and within one priority band lower sequence (earlier
    /// submission) wins.
    fn ready_score(&self) -> Result<i64> {
        if self.meta.priority.abs() > MAX_PRIORITY {
            return Err(ToilError::Config(format!(
                "Priority {} out of range (max magnitude {})",
                self.meta.priority, MAX_PRIORITY
            )));
        }
        if self.seq >= SEQ_RANGE {
            return Err(ToilError::Backend(format!(
                "Submission sequence {} exhausted the score band",
                self.seq
            )));
        }
        Ok(-self.meta.priority * SEQ_RANGE as i64 + self.seq as i64)
    }
}

/// Redis backend for job queue storage.
#[derive(Clone)]
pub struct RedisBackend {
    conn: ConnectionManager,
    keys: ToilKeys,
}

impl RedisBackend {
    /// Create a new Redis backend.
    pub async fn new(redis_url: &str, namespace: &str) -> Result<Self> {
        let client =
            redis::Client::open(redis_url).map_err(|e| ToilError::Backend(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| ToilError::Backend(e.to_string()))?;
        Ok(Self::with_connection(conn, namespace))
    }

    /// Create a new Redis backend with an existing connection manager.
    pub fn with_connection(conn: ConnectionManager, namespace: &str) -> Self {
        Self {
            conn,
            keys: ToilKeys::new(namespace),
        }
    }

    /// Get the Redis keys manager.
    pub fn keys(&self) -> &ToilKeys {
        &self.keys
    }

    /// Atomically move `member` from one sorted set to another, replacing it
    /// with `replacement` at `score`. Returns false if `member` had already
    /// left the source set.
    async fn move_member(
        &self,
        from: &str,
        to: &str,
        member: &str,
        replacement: &str,
        score: i64,
    ) -> Result<bool> {
        let mut conn = self.conn.clone();
        let moved: i32 = redis::Script::new(MOVE_MEMBER_SCRIPT)
            .key(from)
            .key(to)
            .arg(member)
            .arg(replacement)
            .arg(score)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| ToilError::Backend(e.to_string()))?;
        Ok(moved == 1)
    }

    /// Move due delayed jobs into the ready set.
    async fn promote_delayed(&self, now: i64) -> Result<()> {
        let mut conn = self.conn.clone();
        let due: Vec<String> = conn
            .zrangebyscore(self.keys.delayed(), "-inf", now)
            .await
            .map_err(|e| ToilError::Backend(e.to_string()))?;

        for member in due {
            let job = StoredJob::decode(&member)?;
            let score = job.ready_score()?;
            self.move_member(&self.keys.delayed(), &self.keys.ready(), &member, &member, score)
                .await?;
        }
        Ok(())
    }

    /// Return expired in-flight jobs to the ready set with a bumped attempt
    /// counter.
    async fn recover_expired(&self, now: i64) -> Result<()> {
        let mut conn = self.conn.clone();
        let expired: Vec<String> = conn
            .zrangebyscore(self.keys.inflight(), "-inf", now)
            .await
            .map_err(|e| ToilError::Backend(e.to_string()))?;

        for member in expired {
            let mut job = StoredJob::decode(&member)?;
            job.meta.attempt += 1;
            job.meta.reserved_at = None;
            job.meta.receipt = None;
            let score = job.ready_score()?;
            let recycled = job.encode()?;
            // Conditional on the member still being in-flight: a concurrent
            // sweeper may have recycled it first, and its successor may
            // already be leased again.
            let moved = self
                .move_member(
                    &self.keys.inflight(),
                    &self.keys.ready(),
                    &member,
                    &recycled,
                    score,
                )
                .await?;
            if moved {
                tracing::debug!(job_id = %job.id, attempt = job.meta.attempt, "lease expired, job recycled");
            }
        }
        Ok(())
    }

    /// Claim the best ready job and park it in the in-flight set until its
    /// lease deadline.
    async fn try_claim(&self) -> Result<Option<JobRecord>> {
        let now = unix_now();
        self.promote_delayed(now).await?;
        self.recover_expired(now).await?;

        let mut conn = self.conn.clone();
        let popped: Vec<(String, f64)> = conn
            .zpopmin(self.keys.ready(), 1)
            .await
            .map_err(|e| ToilError::Backend(e.to_string()))?;
        let Some((member, _)) = popped.into_iter().next() else {
            return Ok(None);
        };

        let mut job = StoredJob::decode(&member)?;
        job.meta.reserved_at = Some(now);
        let leased = job.encode()?;
        let deadline = now + job.meta.ttr_secs as i64;
        conn.zadd::<_, _, _, ()>(self.keys.inflight(), &leased, deadline)
            .await
            .map_err(|e| ToilError::Backend(e.to_string()))?;

        // The in-flight member doubles as the claim receipt: complete/fail
        // remove exactly this serialization, so a recycled job (different
        // attempt) no longer matches.
        job.meta.receipt = Some(leased);
        Ok(Some(JobRecord {
            id: JobId::new(job.id),
            name: job.name,
            body: job.body,
            meta: job.meta,
        }))
    }

    async fn take_inflight(&self, job: &JobRecord) -> Result<Option<String>> {
        let receipt = job.meta.receipt.as_deref().ok_or_else(|| {
            ToilError::Backend(format!("Job {} carries no claim receipt", job.id))
        })?;
        let mut conn = self.conn.clone();
        let removed: i64 = conn
            .zrem(self.keys.inflight(), receipt)
            .await
            .map_err(|e| ToilError::Backend(e.to_string()))?;
        if removed == 0 {
            tracing::debug!(job_id = %job.id, "resolution for a lost lease ignored");
            return Ok(None);
        }
        Ok(Some(receipt.to_string()))
    }
}

#[async_trait]
impl Backend for RedisBackend {
    async fn insert(&self, name: &str, body: &[u8], meta: JobMeta) -> Result<JobId> {
        let mut conn = self.conn.clone();
        let seq: u64 = conn
            .incr(self.keys.seq(), 1)
            .await
            .map_err(|e| ToilError::Backend(e.to_string()))?;

        let job = StoredJob {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            body: body.to_vec(),
            meta,
            seq,
        };
        // Validates priority/sequence bounds even for delayed jobs, so a bad
        // submission fails at insert rather than at promotion.
        let score = job.ready_score()?;
        let member = job.encode()?;

        let now = unix_now();
        if job.meta.is_due(now) {
            conn.zadd::<_, _, _, ()>(self.keys.ready(), &member, score)
                .await
                .map_err(|e| ToilError::Backend(e.to_string()))?;
        } else {
            conn.zadd::<_, _, _, ()>(self.keys.delayed(), &member, job.meta.visible_at())
                .await
                .map_err(|e| ToilError::Backend(e.to_string()))?;
        }
        Ok(JobId::new(job.id))
    }

    async fn reserve(&self, timeout: Duration) -> Result<Option<JobRecord>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(record) = self.try_claim().await? {
                return Ok(Some(record));
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn complete(&self, job: &JobRecord) -> Result<()> {
        self.take_inflight(job).await?;
        Ok(())
    }

    async fn fail(&self, job: &JobRecord, error: &str) -> Result<()> {
        let Some(receipt) = self.take_inflight(job).await? else {
            return Ok(());
        };
        let mut failed: StoredJob = StoredJob::decode(&receipt)?;
        failed.meta.done_at = Some(unix_now());
        let entry = serde_json::to_string(&serde_json::json!({
            "job": failed,
            "error": error,
        }))?;
        let mut conn = self.conn.clone();
        conn.lpush::<_, _, ()>(self.keys.failed(), entry)
            .await
            .map_err(|e| ToilError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn status(&self, _id: &JobId) -> Result<Option<JobStatus>> {
        Err(ToilError::Unsupported(
            "job status lookup is not available on the redis backend",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stored(priority: i64, seq: u64) -> StoredJob {
        StoredJob {
            id: "j1".to_string(),
            name: "email".to_string(),
            body: b"{}".to_vec(),
            meta: JobMeta {
                priority,
                ..Default::default()
            },
            seq,
        }
    }

    #[test]
    fn test_toil_keys() {
        let keys = ToilKeys::new("myapp");
        assert_eq!(keys.ready(), "_toil_tb_myapp:ready");
        assert_eq!(keys.delayed(), "_toil_tb_myapp:delayed");
        assert_eq!(keys.inflight(), "_toil_tb_myapp:inflight");
        assert_eq!(keys.failed(), "_toil_tb_myapp:failed");
        assert_eq!(keys.seq(), "_toil_tb_myapp:seq");
        assert_eq!(keys.namespace(), "myapp");
    }

    #[test]
    fn test_toil_keys_empty_namespace() {
        let keys = ToilKeys::new("");
        assert_eq!(keys.ready(), "_toil_tb_:ready");
    }

    #[test]
    fn test_score_orders_by_priority_then_sequence() {
        let high_early = stored(10, 1).ready_score().unwrap();
        let high_late = stored(10, 2).ready_score().unwrap();
        let low_early = stored(1, 0).ready_score().unwrap();
        let negative = stored(-5, 0).ready_score().unwrap();

        // ZPOPMIN takes the smallest score first.
        assert!(high_early < high_late);
        assert!(high_late < low_early);
        assert!(low_early < negative);
    }

    #[test]
    fn test_score_rejects_out_of_range_priority() {
        let err = stored(MAX_PRIORITY + 1, 0).ready_score().unwrap_err();
        assert!(matches!(err, ToilError::Config(_)));
        let err = stored(-(MAX_PRIORITY + 1), 0).ready_score().unwrap_err();
        assert!(matches!(err, ToilError::Config(_)));
        assert!(stored(MAX_PRIORITY, 0).ready_score().is_ok());
    }

    #[test]
    fn test_score_rejects_exhausted_sequence() {
        let err = stored(0, SEQ_RANGE).ready_score().unwrap_err();
        assert!(matches!(err, ToilError::Backend(_)));
        assert!(stored(0, SEQ_RANGE - 1).ready_score().is_ok());
    }

    #[test]
    fn test_stored_job_round_trip() {
        let job = stored(3, 42);
        let json = job.encode().unwrap();
        let back = StoredJob::decode(&json).unwrap();
        assert_eq!(back.id, job.id);
        assert_eq!(back.name, job.name);
        assert_eq!(back.body, job.body);
        assert_eq!(back.meta.priority, 3);
        assert_eq!(back.seq, 42);
    }
}

// ========== Integration Tests (require Redis) ==========

#[cfg(test)]
mod integration_tests {
    use super::*;

    fn redis_url() -> String {
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
    }

    fn test_namespace() -> String {
        use std::time::{SystemTime, UNIX_EPOCH};
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        format!("toil_test_{}", ts)
    }

    async fn backend() -> RedisBackend {
        RedisBackend::new(&redis_url(), &test_namespace())
            .await
            .expect("Failed to connect to Redis")
    }

    fn meta_with(priority: i64, delay_secs: u64, ttr_secs: u64) -> JobMeta {
        JobMeta {
            priority,
            delay_secs,
            ttr_secs,
            ..Default::default()
        }
    }

    #[tokio::test]
    #[ignore = "requires running Redis server"]
    async fn test_insert_reserve_complete_round_trip() {
        let backend = backend().await;
        let id = backend
            .insert("email", b"{\"to\":\"a\"}", JobMeta::default())
            .await
            .unwrap();

        let record = backend.reserve(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(record.id, id);
        assert_eq!(record.name, "email");
        assert_eq!(record.body, b"{\"to\":\"a\"}");
        assert!(record.meta.receipt.is_some());

        backend.complete(&record).await.unwrap();
        assert!(backend.reserve(Duration::ZERO).await.unwrap().is_none());
    }

    #[tokio::test]
    #[ignore = "requires running Redis server"]
    async fn test_priority_ordering() {
        let backend = backend().await;
        backend.insert("low", b"{}", meta_with(1, 0, 300)).await.unwrap();
        let high = backend.insert("high", b"{}", meta_with(10, 0, 300)).await.unwrap();

        let first = backend.reserve(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(first.id, high);
    }

    #[tokio::test]
    #[ignore = "requires running Redis server"]
    async fn test_delayed_job_becomes_visible() {
        let backend = backend().await;
        backend.insert("slow", b"{}", meta_with(0, 1, 300)).await.unwrap();
        assert!(backend.reserve(Duration::ZERO).await.unwrap().is_none());
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(backend.reserve(Duration::ZERO).await.unwrap().is_some());
    }

    #[tokio::test]
    #[ignore = "requires running Redis server"]
    async fn test_expired_lease_redelivers_with_attempt_bump() {
        let backend = backend().await;
        backend.insert("a", b"{}", meta_with(0, 0, 1)).await.unwrap();
        let stale = backend.reserve(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(stale.meta.attempt, 1);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        let fresh = backend.reserve(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(fresh.meta.attempt, 2);

        // The stale claim's receipt no longer matches the in-flight member.
        backend.complete(&stale).await.unwrap();
        backend.complete(&fresh).await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires running Redis server"]
    async fn test_stale_recovery_sweep_cannot_resurrect_a_claimed_job() {
        let backend = backend().await;
        backend.insert("a", b"{}", meta_with(0, 0, 1)).await.unwrap();
        backend.reserve(Duration::ZERO).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;

        // Snapshot the expired member the way a second engine's sweep would.
        let mut conn = backend.conn.clone();
        let stale: Vec<String> = conn
            .zrangebyscore(backend.keys.inflight(), "-inf", unix_now())
            .await
            .unwrap();
        assert_eq!(stale.len(), 1);

        // The first engine recycles and re-claims the job.
        let fresh = backend.reserve(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(fresh.meta.attempt, 2);

        // The second engine now applies its stale read; the move must be a
        // no-op because the member already left the in-flight set.
        let mut job = StoredJob::decode(&stale[0]).unwrap();
        job.meta.attempt += 1;
        job.meta.reserved_at = None;
        let score = job.ready_score().unwrap();
        let recycled = job.encode().unwrap();
        let moved = backend
            .move_member(
                &backend.keys.inflight(),
                &backend.keys.ready(),
                &stale[0],
                &recycled,
                score,
            )
            .await
            .unwrap();
        assert!(!moved);
        assert!(backend.reserve(Duration::ZERO).await.unwrap().is_none());
    }

    #[tokio::test]
    #[ignore = "requires running Redis server"]
    async fn test_fail_records_error() {
        let backend = backend().await;
        backend.insert("a", b"{}", JobMeta::default()).await.unwrap();
        let record = backend.reserve(Duration::ZERO).await.unwrap().unwrap();
        backend.fail(&record, "boom").await.unwrap();

        let mut conn = backend.conn.clone();
        let entries: Vec<String> = conn.lrange(backend.keys.failed(), 0, -1).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].contains("boom"));
    }

    #[tokio::test]
    #[ignore = "requires running Redis server"]
    async fn test_status_is_unsupported() {
        let backend = backend().await;
        let err = backend.status(&JobId::new("nope")).await.unwrap_err();
        assert!(matches!(err, ToilError::Unsupported(_)));
    }
}
