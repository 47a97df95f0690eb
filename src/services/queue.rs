//! Durable priority job queue.
//!
//! Jobs live in Redis under a name of the form `thumbnail:<record_id>`:
//!
//! All keys live under a namespace (`thumbgen` by default):
//!
//! - `<ns>:job:<name>` hash holds the payload, score, attempt counter,
//!   retry budget and the token of the current lease;
//! - `ready` sorted set orders claimable jobs by `priority * 10^13 + enqueued_ms`
//!   (lower first, FIFO within a priority);
//! - `delayed` sorted set holds retries until their backoff elapses;
//! - `leased` sorted set tracks claimed jobs by lease deadline. An expired
//!   lease (crashed worker) is returned to `ready` on the next claim, which
//!   gives at-least-once delivery.
//!
//! Each transition is a single Lua script, so claims are exclusive per
//! delivery attempt.

use async_trait::async_trait;
use redis::Script;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::models::account::Tier;
use crate::models::generation::{GenerationRequest, ReferenceImage};
use crate::models::thumbnail::{AspectRatio, ColorScheme, Style};
use crate::services::encryption::{EncryptionError, EncryptionService};

const DEFAULT_NAMESPACE: &str = "thumbgen";

/// Finished jobs kept for inspection.
const KEEP_COMPLETED: i64 = 100;
const KEEP_FAILED: i64 = 50;

/// Multiplier separating priority classes in the ready score.
const PRIORITY_SPAN: f64 = 1e13;

/// Retry budget, backoff and lease settings shared by all jobs.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub lease: Duration,
    pub retention: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_millis(5000),
            backoff_cap: Duration::from_secs(15 * 60),
            lease: Duration::from_secs(300),
            retention: Duration::from_secs(3600),
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry that follows failed attempt `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.max(1) - 1;
        let factor = 1u32.checked_shl(exp).unwrap_or(u32::MAX);
        self.backoff_base
            .checked_mul(factor)
            .unwrap_or(self.backoff_cap)
            .min(self.backoff_cap)
    }
}

/// Redis keys of one queue namespace.
#[derive(Debug, Clone)]
struct QueueKeys {
    ready: String,
    delayed: String,
    leased: String,
    completed: String,
    failed: String,
    job_prefix: String,
}

impl QueueKeys {
    fn new(namespace: &str) -> Self {
        Self {
            ready: format!("{}:queue:ready", namespace),
            delayed: format!("{}:queue:delayed", namespace),
            leased: format!("{}:queue:leased", namespace),
            completed: format!("{}:queue:completed", namespace),
            failed: format!("{}:queue:failed", namespace),
            job_prefix: format!("{}:job:", namespace),
        }
    }

    fn job(&self, name: &str) -> String {
        format!("{}{}", self.job_prefix, name)
    }
}

/// Score of a job in the ready set.
pub fn ready_score(priority: u32, enqueued_at_ms: i64) -> f64 {
    priority as f64 * PRIORITY_SPAN + enqueued_at_ms as f64
}

/// A claimed job. Must be acknowledged or failed by the holder.
#[derive(Debug, Clone)]
pub struct Lease {
    pub name: String,
    pub token: String,
    /// 1-based delivery attempt number.
    pub attempt: u32,
    pub max_attempts: u32,
    pub job: GenerationRequest,
}

impl Lease {
    /// The last attempt the retry budget allows.
    pub fn is_final_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Redelivered past the budget, e.g. after a crash during the final attempt.
    pub fn is_exhausted(&self) -> bool {
        self.attempt > self.max_attempts
    }
}

/// What happened to a job after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    Retry { delay: Duration },
    Exhausted,
    /// The lease was taken over by another delivery; nothing was changed.
    Stale,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Durably enqueue a job. Returns `false` if a job with the same name exists.
    async fn enqueue(&self, job: &GenerationRequest, priority: u32) -> Result<bool, QueueError>;

    /// Claim the most urgent ready job, if any.
    async fn claim(&self) -> Result<Option<Lease>, QueueError>;

    /// Acknowledge successful processing. Returns `false` for a stale lease.
    async fn ack(&self, lease: &Lease) -> Result<bool, QueueError>;

    /// Record a failed attempt and schedule a retry or fail terminally.
    async fn fail(&self, lease: &Lease, error: &str) -> Result<FailOutcome, QueueError>;

    /// Jobs waiting to be claimed, including scheduled retries.
    async fn depth(&self) -> Result<u64, QueueError>;
}

/// Sealed reference image on the wire.
#[derive(Debug, Serialize, Deserialize)]
struct SealedImage {
    mime: String,
    ciphertext: String,
}

/// Job payload serialized into Redis.
#[derive(Debug, Serialize, Deserialize)]
struct QueuedJob {
    record_id: Uuid,
    owner_id: Uuid,
    title: String,
    detail: Option<String>,
    style: Style,
    color_scheme: ColorScheme,
    aspect_ratio: AspectRatio,
    tier: Tier,
    credits_required: i32,
    uses_reference_image: bool,
    reference_image: Option<SealedImage>,
}

const ENQUEUE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
  return 0
end
redis.call('HSET', KEYS[1],
  'payload', ARGV[2], 'priority', ARGV[3], 'score', ARGV[4],
  'enqueued_at', ARGV[5], 'attempts', 0, 'max_attempts', ARGV[6], 'state', 'waiting')
redis.call('ZADD', KEYS[2], ARGV[4], ARGV[1])
return 1
"#;

const CLAIM_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local prefix = ARGV[3]

local function requeue(set, name)
  redis.call('ZREM', set, name)
  local score = redis.call('HGET', prefix .. name, 'score')
  if score then
    redis.call('HSET', prefix .. name, 'state', 'waiting')
    redis.call('HDEL', prefix .. name, 'lease_token')
    redis.call('ZADD', KEYS[1], score, name)
  end
end

for _, name in ipairs(redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', now)) do
  requeue(KEYS[2], name)
end
for _, name in ipairs(redis.call('ZRANGEBYSCORE', KEYS[3], '-inf', now)) do
  requeue(KEYS[3], name)
end

while true do
  local popped = redis.call('ZPOPMIN', KEYS[1])
  if #popped == 0 then
    return false
  end
  local name = popped[1]
  local key = prefix .. name
  local payload = redis.call('HGET', key, 'payload')
  if payload then
    local attempts = redis.call('HINCRBY', key, 'attempts', 1)
    local max_attempts = tonumber(redis.call('HGET', key, 'max_attempts'))
    redis.call('HSET', key, 'state', 'active', 'lease_token', ARGV[4])
    redis.call('ZADD', KEYS[3], ARGV[2], name)
    return {name, payload, attempts, max_attempts}
  end
end
"#;

const ACK_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[2], 'lease_token') ~= ARGV[2] then
  return 0
end
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('HSET', KEYS[2], 'state', 'completed')
redis.call('HDEL', KEYS[2], 'lease_token', 'payload')
redis.call('EXPIRE', KEYS[2], ARGV[3])
redis.call('LPUSH', KEYS[3], ARGV[1])
redis.call('LTRIM', KEYS[3], 0, ARGV[4])
return 1
"#;

const FAIL_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[3], 'lease_token') ~= ARGV[2] then
  return -1
end
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('HDEL', KEYS[3], 'lease_token')
redis.call('HSET', KEYS[3], 'last_error', ARGV[4])
local attempts = tonumber(redis.call('HGET', KEYS[3], 'attempts'))
local max_attempts = tonumber(redis.call('HGET', KEYS[3], 'max_attempts'))
if attempts < max_attempts then
  redis.call('HSET', KEYS[3], 'state', 'delayed')
  redis.call('ZADD', KEYS[2], ARGV[3], ARGV[1])
  return 1
end
redis.call('HSET', KEYS[3], 'state', 'failed')
redis.call('HDEL', KEYS[3], 'payload')
redis.call('EXPIRE', KEYS[3], ARGV[5])
redis.call('LPUSH', KEYS[4], ARGV[1])
redis.call('LTRIM', KEYS[4], 0, ARGV[6])
return 0
"#;

/// Redis-backed implementation of [`JobQueue`].
pub struct RedisJobQueue {
    client: redis::Client,
    encryption: Arc<EncryptionService>,
    policy: RetryPolicy,
    keys: QueueKeys,
    enqueue_script: Script,
    claim_script: Script,
    ack_script: Script,
    fail_script: Script,
}

impl RedisJobQueue {
    pub fn new(
        redis_url: &str,
        encryption: Arc<EncryptionService>,
        policy: RetryPolicy,
    ) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client,
            encryption,
            policy,
            keys: QueueKeys::new(DEFAULT_NAMESPACE),
            enqueue_script: Script::new(ENQUEUE_SCRIPT),
            claim_script: Script::new(CLAIM_SCRIPT),
            ack_script: Script::new(ACK_SCRIPT),
            fail_script: Script::new(FAIL_SCRIPT),
        })
    }

    /// Keep all keys under `namespace` instead of the default one.
    pub fn with_namespace(mut self, namespace: &str) -> Self {
        self.keys = QueueKeys::new(namespace);
        self
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, QueueError> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    /// Check Redis connectivity (for health checks).
    pub async fn health_check(&self) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }

    fn encode(&self, job: &GenerationRequest) -> Result<String, QueueError> {
        let reference_image = match &job.reference_image {
            Some(image) => Some(SealedImage {
                mime: image.mime.clone(),
                ciphertext: self.encryption.seal(&image.bytes)?,
            }),
            None => None,
        };

        let queued = QueuedJob {
            record_id: job.record_id,
            owner_id: job.owner_id,
            title: job.title.clone(),
            detail: job.detail.clone(),
            style: job.style,
            color_scheme: job.color_scheme,
            aspect_ratio: job.aspect_ratio,
            tier: job.tier,
            credits_required: job.credits_required,
            uses_reference_image: job.uses_reference_image,
            reference_image,
        };
        Ok(serde_json::to_string(&queued)?)
    }

    fn decode(&self, payload: &str) -> Result<GenerationRequest, QueueError> {
        let queued: QueuedJob = serde_json::from_str(payload)?;
        let reference_image = match queued.reference_image {
            Some(sealed) => Some(ReferenceImage {
                bytes: self.encryption.open(&sealed.ciphertext)?,
                mime: sealed.mime,
            }),
            None => None,
        };

        Ok(GenerationRequest {
            record_id: queued.record_id,
            owner_id: queued.owner_id,
            title: queued.title,
            detail: queued.detail,
            style: queued.style,
            color_scheme: queued.color_scheme,
            aspect_ratio: queued.aspect_ratio,
            reference_image,
            tier: queued.tier,
            credits_required: queued.credits_required,
            uses_reference_image: queued.uses_reference_image,
        })
    }

    /// Move a job whose payload cannot be decoded straight to the failed set.
    async fn bury(&self, name: &str, token: &str, error: &str) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let key = self.keys.job(name);
        let _: () = redis::cmd("HSET")
            .arg(&key)
            .arg("max_attempts")
            .arg(0)
            .query_async(&mut conn)
            .await?;
        let _: i64 = self
            .fail_script
            .key(&self.keys.leased)
            .key(&self.keys.delayed)
            .key(&key)
            .key(&self.keys.failed)
            .arg(name)
            .arg(token)
            .arg(0)
            .arg(error)
            .arg(self.policy.retention.as_secs())
            .arg(KEEP_FAILED - 1)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn enqueue(&self, job: &GenerationRequest, priority: u32) -> Result<bool, QueueError> {
        let name = job.job_name();
        let payload = self.encode(job)?;
        let now = now_ms();

        let mut conn = self.connection().await?;
        let created: i64 = self
            .enqueue_script
            .key(self.keys.job(&name))
            .key(&self.keys.ready)
            .arg(&name)
            .arg(payload)
            .arg(priority)
            .arg(ready_score(priority, now))
            .arg(now)
            .arg(self.policy.max_attempts)
            .invoke_async(&mut conn)
            .await?;

        Ok(created == 1)
    }

    async fn claim(&self) -> Result<Option<Lease>, QueueError> {
        let now = now_ms();
        let deadline = now + self.policy.lease.as_millis() as i64;
        let token = Uuid::new_v4().to_string();

        let mut conn = self.connection().await?;
        let claimed: Option<(String, String, u32, u32)> = self
            .claim_script
            .key(&self.keys.ready)
            .key(&self.keys.delayed)
            .key(&self.keys.leased)
            .arg(now)
            .arg(deadline)
            .arg(&self.keys.job_prefix)
            .arg(&token)
            .invoke_async(&mut conn)
            .await?;

        let Some((name, payload, attempt, max_attempts)) = claimed else {
            return Ok(None);
        };

        match self.decode(&payload) {
            Ok(job) => Ok(Some(Lease {
                name,
                token,
                attempt,
                max_attempts,
                job,
            })),
            Err(e) => {
                tracing::error!(job = %name, error = %e, "Undecodable job payload, burying");
                self.bury(&name, &token, &e.to_string()).await?;
                Err(QueueError::Corrupt { name })
            }
        }
    }

    async fn ack(&self, lease: &Lease) -> Result<bool, QueueError> {
        let mut conn = self.connection().await?;
        let acked: i64 = self
            .ack_script
            .key(&self.keys.leased)
            .key(self.keys.job(&lease.name))
            .key(&self.keys.completed)
            .arg(&lease.name)
            .arg(&lease.token)
            .arg(self.policy.retention.as_secs())
            .arg(KEEP_COMPLETED - 1)
            .invoke_async(&mut conn)
            .await?;
        Ok(acked == 1)
    }

    async fn fail(&self, lease: &Lease, error: &str) -> Result<FailOutcome, QueueError> {
        let delay = self.policy.backoff(lease.attempt);
        let retry_at = now_ms() + delay.as_millis() as i64;

        let mut conn = self.connection().await?;
        let outcome: i64 = self
            .fail_script
            .key(&self.keys.leased)
            .key(&self.keys.delayed)
            .key(self.keys.job(&lease.name))
            .key(&self.keys.failed)
            .arg(&lease.name)
            .arg(&lease.token)
            .arg(retry_at)
            .arg(error)
            .arg(self.policy.retention.as_secs())
            .arg(KEEP_FAILED - 1)
            .invoke_async(&mut conn)
            .await?;

        Ok(match outcome {
            1 => FailOutcome::Retry { delay },
            0 => FailOutcome::Exhausted,
            _ => FailOutcome::Stale,
        })
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        let mut conn = self.connection().await?;
        let (ready, delayed): (u64, u64) = redis::pipe()
            .zcard(&self.keys.ready)
            .zcard(&self.keys.delayed)
            .query_async(&mut conn)
            .await?;
        Ok(ready + delayed)
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Payload sealing error: {0}")]
    Encryption(#[from] EncryptionError),

    #[error("Job {name} has an undecodable payload and was moved to the failed set")]
    Corrupt { name: String },
}
