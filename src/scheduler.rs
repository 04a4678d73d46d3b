//! Deferred delivery: messages scheduled for a future time re-enter the
//! normal send path from a worker pool and are broadcast by the worker.

pub mod memory;
pub mod redis;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::history::{HistoryService, MAX_TEXT_LEN};
use crate::membership::MembershipService;
use crate::models::websocket::ServerEvent;
use crate::websocket::manager::RoomRegistry;

/// Upper bound on a single queue call unless overridden with `with_timeout`.
const DEFAULT_QUEUE_TIMEOUT: Duration = Duration::from_secs(2);

/// Namespace for idempotency keys of scheduled messages.
const SCHEDULE_NAMESPACE: Uuid = Uuid::from_u128(0x5c4e_d0b1_7a3f_4e2c_9d81_2f6a_b03c_e914);

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue connection error: {0}")]
    Connection(String),

    #[error("Queue serialization error: {0}")]
    Serialization(String),

    #[error("Queue backend error: {0}")]
    Backend(String),

    #[error("Queue operation timed out after {0:?}")]
    Timeout(Duration),
}

pub type QueueResult<T> = Result<T, QueueError>;

async fn bounded<T, F>(timeout: Duration, fut: F) -> QueueResult<T>
where
    F: Future<Output = QueueResult<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(QueueError::Timeout(timeout)),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledMessage {
    pub job_id: String,
    pub chat_id: Uuid,
    pub author_id: Uuid,
    pub text: Option<String>,
    pub attachment_ref: Option<String>,
    pub deliver_at: DateTime<Utc>,
}

impl ScheduledMessage {
    /// Same chat, author, delivery time and content always yield the same key.
    pub fn idempotency_key(
        chat_id: Uuid,
        author_id: Uuid,
        deliver_at: DateTime<Utc>,
        text: Option<&str>,
        attachment_ref: Option<&str>,
    ) -> String {
        let name = format!(
            "{}\n{}\n{}\n{}\n{}",
            chat_id,
            author_id,
            deliver_at.timestamp_millis(),
            text.unwrap_or_default(),
            attachment_ref.unwrap_or_default()
        );
        Uuid::new_v5(&SCHEDULE_NAMESPACE, name.as_bytes()).to_string()
    }
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Queues `job` to become ready at `ready_at`. Returns `false` when a job
    /// with the same id is already queued.
    async fn enqueue(&self, job: &ScheduledMessage, ready_at: DateTime<Utc>) -> QueueResult<bool>;

    /// Removes and returns up to `max` jobs that are ready at `now`. A job is
    /// handed to exactly one caller.
    async fn claim_ready(&self, now: DateTime<Utc>, max: usize) -> QueueResult<Vec<ScheduledMessage>>;

    fn provider_name(&self) -> &'static str;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleReceipt {
    pub job_id: String,
    pub deliver_at: DateTime<Utc>,
    pub delay_ms: i64,
    /// False when the same message was already scheduled.
    pub created: bool,
}

#[derive(Clone)]
pub struct Scheduler {
    queue: Arc<dyn JobQueue>,
    membership: MembershipService,
    timeout: Duration,
}

impl Scheduler {
    pub fn new(queue: Arc<dyn JobQueue>, membership: MembershipService) -> Self {
        Self {
            queue,
            membership,
            timeout: DEFAULT_QUEUE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn queue(&self) -> Arc<dyn JobQueue> {
        self.queue.clone()
    }

    pub async fn schedule(
        &self,
        author_id: Uuid,
        chat_id: Uuid,
        text: Option<String>,
        attachment_ref: Option<String>,
        deliver_at: DateTime<Utc>,
    ) -> AppResult<ScheduleReceipt> {
        let text = text.filter(|t| !t.trim().is_empty());
        let attachment_ref = attachment_ref.filter(|r| !r.trim().is_empty());
        if text.is_none() && attachment_ref.is_none() {
            return Err(AppError::BadRequest(anyhow!(
                "A message needs text or an attachment"
            )));
        }
        if text.as_ref().is_some_and(|t| t.chars().count() > MAX_TEXT_LEN) {
            return Err(AppError::BadRequest(anyhow!(
                "Message text must be at most {} characters",
                MAX_TEXT_LEN
            )));
        }

        self.membership.authorize(author_id, chat_id).await?;

        let now = Utc::now();
        let delay = (deliver_at - now).max(chrono::TimeDelta::zero());
        let job = ScheduledMessage {
            job_id: ScheduledMessage::idempotency_key(
                chat_id,
                author_id,
                deliver_at,
                text.as_deref(),
                attachment_ref.as_deref(),
            ),
            chat_id,
            author_id,
            text,
            attachment_ref,
            deliver_at,
        };

        let created = bounded(self.timeout, self.queue.enqueue(&job, now + delay))
            .await
            .map_err(|e| {
                tracing::error!(job_id = %job.job_id, %chat_id, error = %e, "failed to enqueue scheduled message");
                match e {
                    QueueError::Timeout(_) => {
                        AppError::ServiceUnavailable(anyhow!("Scheduling is temporarily unavailable"))
                    }
                    _ => AppError::InternalServerError(anyhow!("Failed to schedule message")),
                }
            })?;

        if created {
            tracing::info!(job_id = %job.job_id, %chat_id, delay_ms = delay.num_milliseconds(), "message scheduled");
        } else {
            tracing::debug!(job_id = %job.job_id, %chat_id, "message already scheduled");
        }

        Ok(ScheduleReceipt {
            job_id: job.job_id,
            deliver_at,
            delay_ms: delay.num_milliseconds(),
            created,
        })
    }
}

/// Polls the queue and delivers ready jobs through the regular send path.
#[derive(Clone)]
pub struct DeliveryWorker {
    queue: Arc<dyn JobQueue>,
    history: HistoryService,
    rooms: RoomRegistry,
    poll_interval: Duration,
    batch_size: usize,
    timeout: Duration,
}

impl DeliveryWorker {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        history: HistoryService,
        rooms: RoomRegistry,
        poll_interval: Duration,
    ) -> Self {
        Self {
            queue,
            history,
            rooms,
            poll_interval,
            batch_size: 16,
            timeout: DEFAULT_QUEUE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Starts `workers` polling tasks that stop once `shutdown` flips to true.
    pub fn spawn(self, workers: usize, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        tracing::info!(
            workers,
            queue = self.queue.provider_name(),
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "starting delivery workers"
        );

        (0..workers.max(1))
            .map(|worker| {
                let this = self.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { this.run(worker, shutdown).await })
            })
            .collect()
    }

    async fn run(self, worker: usize, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_once().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::debug!(worker, "delivery worker stopped");
    }

    /// Claims one batch of ready jobs and delivers them. Returns how many
    /// were delivered.
    pub async fn run_once(&self) -> usize {
        let jobs = match bounded(self.timeout, self.queue.claim_ready(Utc::now(), self.batch_size)).await {
            Ok(jobs) => jobs,
            Err(e) => {
                tracing::warn!(error = %e, "failed to claim scheduled messages");
                return 0;
            }
        };

        let mut delivered = 0;
        for job in jobs {
            if self.deliver(job).await {
                delivered += 1;
            }
        }
        delivered
    }

    async fn deliver(&self, job: ScheduledMessage) -> bool {
        let job_id = job.job_id.clone();
        let chat_id = job.chat_id;

        match self
            .history
            .send_message(job.author_id, chat_id, job.text, job.attachment_ref)
            .await
        {
            Ok(view) => {
                let message_id = view.message.id.clone();
                let reached = self
                    .rooms
                    .broadcast(chat_id, &ServerEvent::MessageSent(view), None);
                tracing::info!(%job_id, %chat_id, %message_id, reached, "scheduled message delivered");
                true
            }
            Err(e) => {
                tracing::error!(%job_id, %chat_id, error = %e, "scheduled message delivery failed");
                false
            }
        }
    }
}
