// Queue runtime.
//
// Three durable named queues over the shared Redis broker. Each queue is a
// ready list (LPUSH / BRPOP), a delayed sorted set scored by fire time, and
// a dead-letter list. Jobs are JSON envelopes carrying their own retry
// policy, so the control-plane producers and this worker agree without
// shared code.
//
// Handlers return an explicit outcome instead of throwing: `Retry` re-runs
// the job under its backoff schedule, `Terminal` drops it after the handler
// has already recorded the per-row failure. The failure callback runs on
// every failed attempt, last one included, and the exhausted envelope moves
// to the dead-letter list.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Semaphore;
use uuid::Uuid;

use gateway_shared::clients::redis::RedisClient;
use gateway_shared::GatewayResult;

pub const DEVICE_COMMANDS: &str = "device_commands";
pub const OUTBOUND_MESSAGES: &str = "outbound_messages";
pub const WEBHOOK_DISPATCH: &str = "webhook_dispatch";

pub const JOB_CONNECT: &str = "connect";
pub const JOB_DISCONNECT: &str = "disconnect";
pub const JOB_RESET_SENDER_SESSIONS: &str = "reset-sender-sessions";
pub const JOB_SEND: &str = "send";
pub const JOB_DELIVER: &str = "deliver";

const POP_TIMEOUT_SECS: u64 = 1;
const PROMOTE_BATCH: isize = 16;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Job {
    pub id: Uuid,
    pub name: String,
    pub payload: Value,
    /// Executions completed so far; 0 on the first run.
    pub attempt: u32,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub enqueued_at_ms: i64,
}

impl Job {
    /// Delay before executing attempt number `attempt` (1-based count of
    /// completed attempts): `base * 2^attempt`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(
            self.backoff_base_ms
                .saturating_mul(2u64.saturating_pow(attempt)),
        )
    }

    /// After a failure: the delay until the next attempt, or `None` when
    /// the schedule is exhausted.
    pub fn next_retry_delay(&self) -> Option<Duration> {
        let next_attempt = self.attempt + 1;
        if next_attempt < self.max_attempts {
            Some(self.backoff_delay(next_attempt))
        } else {
            None
        }
    }

    /// How long the job sat in the queue before this execution.
    pub fn queue_wait(&self) -> Duration {
        let waited_ms = Utc::now().timestamp_millis() - self.enqueued_at_ms;
        Duration::from_millis(waited_ms.max(0) as u64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobOptions {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 1000,
        }
    }
}

/// Result of one handler execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Ok,
    /// Transient failure: re-run under the backoff schedule.
    Retry(String),
    /// The handler recorded a terminal per-row failure; do not retry.
    Terminal(String),
}

/// Passed to the failure callback on every failed attempt.
#[derive(Debug, Clone)]
pub struct FailedJob {
    /// The job with `attempt` already advanced to the count of attempts
    /// made.
    pub job: Job,
    pub reason: String,
    /// `None` when the schedule is exhausted and the envelope goes to the
    /// dead-letter list.
    pub next_retry_in: Option<Duration>,
}

#[derive(Clone)]
pub struct Queue {
    name: String,
    redis: RedisClient,
}

impl Queue {
    pub fn new(redis: RedisClient, name: &str) -> Self {
        Self {
            name: name.to_string(),
            redis,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn ready_key(&self) -> String {
        format!("gw:queue:{}:ready", self.name)
    }

    fn delayed_key(&self) -> String {
        format!("gw:queue:{}:delayed", self.name)
    }

    fn dead_key(&self) -> String {
        format!("gw:queue:{}:dead", self.name)
    }

    pub async fn enqueue(
        &self,
        job_name: &str,
        payload: Value,
        options: JobOptions,
    ) -> GatewayResult<Uuid> {
        let job = Job {
            id: Uuid::now_v7(),
            name: job_name.to_string(),
            payload,
            attempt: 0,
            max_attempts: options.max_attempts,
            backoff_base_ms: options.backoff_base_ms,
            enqueued_at_ms: Utc::now().timestamp_millis(),
        };
        self.redis
            .lpush(&self.ready_key(), &serde_json::to_string(&job)?)
            .await?;
        tracing::debug!(queue = %self.name, job = %job_name, job_id = %job.id, "job enqueued");
        Ok(job.id)
    }

    async fn push_delayed(&self, job: &Job, fire_at_ms: i64) -> GatewayResult<()> {
        self.redis
            .zadd(&self.delayed_key(), &serde_json::to_string(job)?, fire_at_ms)
            .await?;
        Ok(())
    }

    async fn push_dead(&self, job: &Job) -> GatewayResult<()> {
        self.redis
            .lpush(&self.dead_key(), &serde_json::to_string(job)?)
            .await?;
        Ok(())
    }

    /// Move due delayed jobs onto the ready list. Returns how many moved.
    pub async fn promote_due(&self) -> GatewayResult<usize> {
        let now_ms = Utc::now().timestamp_millis();
        let due = self
            .redis
            .due_members(&self.delayed_key(), now_ms, PROMOTE_BATCH)
            .await?;

        let mut promoted = 0;
        for member in due {
            // Another worker may have claimed it between the range read and
            // the removal; only the one that removes it re-enqueues.
            if self.redis.zrem(&self.delayed_key(), &member).await? {
                self.redis.lpush(&self.ready_key(), &member).await?;
                promoted += 1;
            }
        }
        Ok(promoted)
    }

    pub async fn pop_ready(&self) -> GatewayResult<Option<Job>> {
        let Some(raw) = self.redis.brpop(&self.ready_key(), POP_TIMEOUT_SECS).await? else {
            return Ok(None);
        };
        match serde_json::from_str::<Job>(&raw) {
            Ok(job) => Ok(Some(job)),
            Err(e) => {
                tracing::error!(queue = %self.name, error = %e, "dropping undecodable job envelope");
                Ok(None)
            }
        }
    }
}

/// Producer seam: the pipelines enqueue through this so they can run
/// against a recording double in tests.
pub trait JobProducer: Send + Sync + 'static {
    fn enqueue<'a>(
        &'a self,
        queue: &'a str,
        job_name: &'a str,
        payload: Value,
        options: JobOptions,
    ) -> futures::future::BoxFuture<'a, GatewayResult<Uuid>>;
}

/// Production producer: routes to the named queue on the shared broker.
pub struct RedisJobProducer {
    redis: RedisClient,
}

impl RedisJobProducer {
    pub fn new(redis: RedisClient) -> Self {
        Self { redis }
    }
}

impl JobProducer for RedisJobProducer {
    fn enqueue<'a>(
        &'a self,
        queue: &'a str,
        job_name: &'a str,
        payload: Value,
        options: JobOptions,
    ) -> futures::future::BoxFuture<'a, GatewayResult<Uuid>> {
        Box::pin(async move {
            Queue::new(self.redis.clone(), queue)
                .enqueue(job_name, payload, options)
                .await
        })
    }
}


#[derive(Debug, Clone, Copy)]
pub struct ConsumerOptions {
    pub concurrency: usize,
}

/// Consume a queue forever with bounded parallelism.
///
/// `handler` decides the outcome; `on_failure` observes every failed
/// attempt (the last one with `next_retry_in = None`).
pub async fn run_consumer<H, HF, F, FF>(
    queue: Queue,
    options: ConsumerOptions,
    handler: H,
    on_failure: F,
) where
    H: Fn(Job) -> HF + Send + Sync + Clone + 'static,
    HF: Future<Output = JobOutcome> + Send + 'static,
    F: Fn(FailedJob) -> FF + Send + Sync + Clone + 'static,
    FF: Future<Output = ()> + Send + 'static,
{
    let permits = Arc::new(Semaphore::new(options.concurrency));
    tracing::info!(queue = %queue.name(), concurrency = options.concurrency, "queue consumer started");

    loop {
        if let Err(e) = queue.promote_due().await {
            tracing::error!(queue = %queue.name(), error = %e, "delayed promotion failed");
            tokio::time::sleep(Duration::from_secs(1)).await;
            continue;
        }

        let job = match queue.pop_ready().await {
            Ok(Some(job)) => job,
            Ok(None) => continue,
            Err(e) => {
                tracing::error!(queue = %queue.name(), error = %e, "queue pop failed");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        let permit = match permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };

        let queue = queue.clone();
        let handler = handler.clone();
        let on_failure = on_failure.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let outcome = handler(job.clone()).await;
            match outcome {
                JobOutcome::Ok => {}
                JobOutcome::Terminal(reason) => {
                    tracing::warn!(
                        queue = %queue.name(),
                        job = %job.name,
                        job_id = %job.id,
                        reason = %reason,
                        "job failed terminally"
                    );
                }
                JobOutcome::Retry(reason) => {
                    let next_retry_in = job.next_retry_delay();
                    let mut failed = job.clone();
                    failed.attempt += 1;

                    on_failure(FailedJob {
                        job: failed.clone(),
                        reason: reason.clone(),
                        next_retry_in,
                    })
                    .await;

                    match next_retry_in {
                        Some(delay) => {
                            let fire_at =
                                Utc::now().timestamp_millis() + delay.as_millis() as i64;
                            tracing::warn!(
                                queue = %queue.name(),
                                job = %job.name,
                                job_id = %job.id,
                                attempt = failed.attempt,
                                delay_ms = delay.as_millis() as u64,
                                reason = %reason,
                                "job failed, retrying"
                            );
                            if let Err(e) = queue.push_delayed(&failed, fire_at).await {
                                tracing::error!(queue = %queue.name(), error = %e, "failed to schedule retry");
                            }
                        }
                        None => {
                            tracing::error!(
                                queue = %queue.name(),
                                job = %job.name,
                                job_id = %job.id,
                                attempts = failed.attempt,
                                reason = %reason,
                                "job exhausted all attempts, dead-lettering"
                            );
                            if let Err(e) = queue.push_dead(&failed).await {
                                tracing::error!(queue = %queue.name(), error = %e, "failed to dead-letter job");
                            }
                        }
                    }
                }
            }
        });
    }
}
