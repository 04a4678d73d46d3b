//! In-process job queue, used when no Redis URL is configured and in tests.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{JobQueue, QueueResult, ScheduledMessage};

#[derive(Default)]
struct QueueState {
    ready_order: BTreeSet<(i64, String)>,
    jobs: HashMap<String, ScheduledMessage>,
}

#[derive(Default)]
pub struct InMemoryJobQueue {
    state: Mutex<QueueState>,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, job: &ScheduledMessage, ready_at: DateTime<Utc>) -> QueueResult<bool> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.jobs.contains_key(&job.job_id) {
            return Ok(false);
        }
        state
            .ready_order
            .insert((ready_at.timestamp_millis(), job.job_id.clone()));
        state.jobs.insert(job.job_id.clone(), job.clone());
        Ok(true)
    }

    async fn claim_ready(&self, now: DateTime<Utc>, max: usize) -> QueueResult<Vec<ScheduledMessage>> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let now = now.timestamp_millis();

        let ready: Vec<(i64, String)> = state
            .ready_order
            .iter()
            .take_while(|(ready_at, _)| *ready_at <= now)
            .take(max)
            .cloned()
            .collect();

        let mut claimed = Vec::with_capacity(ready.len());
        for key in ready {
            state.ready_order.remove(&key);
            if let Some(job) = state.jobs.remove(&key.1) {
                claimed.push(job);
            }
        }
        Ok(claimed)
    }

    fn provider_name(&self) -> &'static str {
        "memory"
    }
}
