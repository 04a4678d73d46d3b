//! Redis job queue.
//!
//! Jobs live in a sorted set scored by ready time (epoch millis) with their
//! payloads in a hash. Both enqueue and claim run as Lua scripts, so a claimed
//! job is removed with `ZREM` by exactly one worker.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{JobQueue, QueueError, QueueResult, ScheduledMessage};
use crate::cache::redis::redact_url;

const READY_KEY: &str = "scheduled:messages";
const PAYLOAD_KEY: &str = "scheduled:messages:jobs";

const ENQUEUE: &str = r#"
if redis.call('HSETNX', KEYS[2], ARGV[1], ARGV[3]) == 0 then
  return 0
end
redis.call('ZADD', KEYS[1], ARGV[2], ARGV[1])
return 1
"#;

const CLAIM: &str = r#"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
local jobs = {}
for _, id in ipairs(ids) do
  if redis.call('ZREM', KEYS[1], id) == 1 then
    local payload = redis.call('HGET', KEYS[2], id)
    redis.call('HDEL', KEYS[2], id)
    if payload then
      table.insert(jobs, payload)
    end
  end
end
return jobs
"#;

#[derive(Clone)]
pub struct RedisJobQueue {
    connection_manager: ::redis::aio::ConnectionManager,
    enqueue_script: ::redis::Script,
    claim_script: ::redis::Script,
}

impl RedisJobQueue {
    pub async fn connect(url: &str) -> QueueResult<Self> {
        let client = ::redis::Client::open(url).map_err(|e| {
            QueueError::Connection(format!("Failed to create Redis client: {}", e))
        })?;

        let connection_manager = ::redis::aio::ConnectionManager::new(client)
            .await
            .map_err(|e| QueueError::Connection(format!("Failed to connect to Redis: {}", e)))?;

        tracing::info!(url = %redact_url(url), "redis job queue connected");

        Ok(Self {
            connection_manager,
            enqueue_script: ::redis::Script::new(ENQUEUE),
            claim_script: ::redis::Script::new(CLAIM),
        })
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn enqueue(&self, job: &ScheduledMessage, ready_at: DateTime<Utc>) -> QueueResult<bool> {
        let payload = serde_json::to_string(job)
            .map_err(|e| QueueError::Serialization(e.to_string()))?;
        let mut conn = self.connection_manager.clone();

        let created: i64 = self
            .enqueue_script
            .key(READY_KEY)
            .key(PAYLOAD_KEY)
            .arg(&job.job_id)
            .arg(ready_at.timestamp_millis())
            .arg(payload)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| QueueError::Backend(format!("Redis enqueue failed: {}", e)))?;

        Ok(created == 1)
    }

    async fn claim_ready(&self, now: DateTime<Utc>, max: usize) -> QueueResult<Vec<ScheduledMessage>> {
        let mut conn = self.connection_manager.clone();

        let payloads: Vec<String> = self
            .claim_script
            .key(READY_KEY)
            .key(PAYLOAD_KEY)
            .arg(now.timestamp_millis())
            .arg(max)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| QueueError::Backend(format!("Redis claim failed: {}", e)))?;

        let mut jobs = Vec::with_capacity(payloads.len());
        for payload in payloads {
            match serde_json::from_str::<ScheduledMessage>(&payload) {
                Ok(job) => jobs.push(job),
                // Already removed from the queue; nothing to retry.
                Err(e) => tracing::error!(error = %e, "dropping undecodable scheduled message"),
            }
        }
        Ok(jobs)
    }

    fn provider_name(&self) -> &'static str {
        "redis"
    }
}
