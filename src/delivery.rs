//! # Delivery queue
//!
//! At-least-once webhook delivery for newly stored payments. Jobs are keyed
//! by `transaction_id`; finished jobs stay in the registry for a few days so
//! a re-observed payment cannot fire the webhook twice. Workers run
//! concurrently under a semaphore and retry with exponential backoff.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use metrics::counter;
use regex::Regex;
use tokio::sync::{mpsc, Semaphore};

use crate::config::WebhookConfig;
use crate::payment::{Payment, WebhookEnvelope};

/// Queue depth between enqueue and the worker pool.
const QUEUE_CAPACITY: usize = 1024;
const DELIVER_TIMEOUT: Duration = Duration::from_secs(10);

/// Retry policy and worker sizing. Defaults mirror production; tests shrink
/// the delays.
#[derive(Debug, Clone)]
pub struct DeliveryTuning {
    /// Total attempts per job, first try included.
    pub attempts: u32,
    /// Delay before the first retry; doubles per further attempt.
    pub backoff_base: Duration,
    /// Concurrent deliveries.
    pub concurrency: usize,
    /// How long finished jobs keep absorbing duplicate enqueues.
    pub retention: Duration,
}

impl Default for DeliveryTuning {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff_base: Duration::from_secs(60),
            concurrency: 5,
            retention: Duration::from_secs(3 * 24 * 60 * 60),
        }
    }
}

/// Where a tracked job currently sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Active,
    Completed,
    Failed,
}

/// What [`DeliveryQueue::enqueue`] did with a payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    Duplicate,
    Filtered,
    /// Worker pool unavailable; only happens during shutdown.
    Rejected,
}

#[derive(Debug, Clone, Copy)]
struct JobRecord {
    state: JobState,
    finished_at: Option<DateTime<Utc>>,
}

struct DeliveryJob {
    id: String,
    envelope: WebhookEnvelope<Payment>,
}

/// Transport seam so the queue can be exercised without sockets.
#[async_trait::async_trait]
pub trait WebhookTransport: Send + Sync {
    async fn deliver(&self, envelope: &WebhookEnvelope<Payment>) -> anyhow::Result<()>;
}

/// Production transport: POST the envelope as JSON, token in `X-Log-Token`.
pub struct HttpWebhookTransport {
    url: String,
    token: String,
    client: reqwest::Client,
}

impl HttpWebhookTransport {
    pub fn new(webhook: &WebhookConfig) -> Self {
        Self {
            url: webhook.url.clone(),
            token: webhook.token.clone(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait::async_trait]
impl WebhookTransport for HttpWebhookTransport {
    async fn deliver(&self, envelope: &WebhookEnvelope<Payment>) -> anyhow::Result<()> {
        let resp = self
            .client
            .post(&self.url)
            .timeout(DELIVER_TIMEOUT)
            .header("X-Log-Token", &self.token)
            .json(envelope)
            .send()
            .await
            .context("posting webhook")?;
        resp.error_for_status_ref()
            .with_context(|| format!("webhook endpoint returned {}", resp.status()))?;
        Ok(())
    }
}

pub struct DeliveryQueue {
    jobs: Mutex<HashMap<String, JobRecord>>,
    job_tx: mpsc::Sender<DeliveryJob>,
    content_regex: Option<Regex>,
    account_regex: Option<Regex>,
    source_name: String,
    tuning: DeliveryTuning,
}

impl DeliveryQueue {
    /// Spawns the worker pool, so this must run inside a Tokio runtime.
    /// `source_name` is stamped into every envelope.
    pub fn new(
        webhook: &WebhookConfig,
        source_name: String,
        transport: Arc<dyn WebhookTransport>,
        tuning: DeliveryTuning,
    ) -> Arc<Self> {
        let (job_tx, job_rx) = mpsc::channel(QUEUE_CAPACITY);
        let queue = Arc::new(Self {
            jobs: Mutex::new(HashMap::new()),
            job_tx,
            content_regex: webhook.content_regex.clone(),
            account_regex: webhook.account_regex.clone(),
            source_name,
            tuning,
        });
        tokio::spawn(worker_loop(Arc::clone(&queue), job_rx, transport));
        queue
    }

    /// Queue one payment for delivery. Filters and the duplicate registry
    /// are checked here, so a `Queued` outcome always produces at least one
    /// delivery attempt.
    pub async fn enqueue(&self, payment: Payment) -> EnqueueOutcome {
        if !passes_filters(
            self.content_regex.as_ref(),
            self.account_regex.as_ref(),
            &payment,
        ) {
            counter!("webhook_filtered_total").increment(1);
            tracing::debug!(txn = %payment.transaction_id, "payment filtered, webhook skipped");
            return EnqueueOutcome::Filtered;
        }
        let id = payment.transaction_id.clone();
        {
            let mut jobs = self.jobs.lock().expect("delivery registry mutex poisoned");
            prune_finished(&mut jobs, self.tuning.retention);
            if jobs.contains_key(&id) {
                tracing::debug!(txn = %id, "delivery already tracked, duplicate dropped");
                return EnqueueOutcome::Duplicate;
            }
            jobs.insert(
                id.clone(),
                JobRecord {
                    state: JobState::Queued,
                    finished_at: None,
                },
            );
        }
        let envelope = WebhookEnvelope::payment_created(self.source_name.clone(), payment);
        let job = DeliveryJob {
            id: id.clone(),
            envelope,
        };
        if self.job_tx.send(job).await.is_err() {
            // worker pool is gone; forget the job so a restart can retry it
            self.jobs
                .lock()
                .expect("delivery registry mutex poisoned")
                .remove(&id);
            tracing::error!(txn = %id, "delivery workers unavailable, job dropped");
            return EnqueueOutcome::Rejected;
        }
        counter!("webhook_enqueued_total").increment(1);
        tracing::info!(txn = %id, "webhook delivery queued");
        EnqueueOutcome::Queued
    }

    /// Enqueue a whole stored batch, one job per payment.
    pub async fn enqueue_batch(&self, batch: Vec<Payment>) {
        for payment in batch {
            self.enqueue(payment).await;
        }
    }

    /// Current state of a tracked job, while the registry remembers it.
    pub fn job_state(&self, transaction_id: &str) -> Option<JobState> {
        self.jobs
            .lock()
            .expect("delivery registry mutex poisoned")
            .get(transaction_id)
            .map(|rec| rec.state)
    }

    fn mark(&self, id: &str, state: JobState) {
        let mut jobs = self.jobs.lock().expect("delivery registry mutex poisoned");
        if let Some(rec) = jobs.get_mut(id) {
            rec.state = state;
            if matches!(state, JobState::Completed | JobState::Failed) {
                rec.finished_at = Some(Utc::now());
            }
        }
    }
}

/// The content filter matches the payment text; the account filter matches
/// either side of the transfer.
fn passes_filters(
    content_regex: Option<&Regex>,
    account_regex: Option<&Regex>,
    p: &Payment,
) -> bool {
    if let Some(re) = content_regex {
        if !re.is_match(&p.content) {
            return false;
        }
    }
    if let Some(re) = account_regex {
        if !re.is_match(&p.account_receiver) && !re.is_match(&p.account_sender) {
            return false;
        }
    }
    true
}

fn prune_finished(jobs: &mut HashMap<String, JobRecord>, retention: Duration) {
    let now = Utc::now();
    jobs.retain(|_, rec| match rec.finished_at {
        Some(done) => now
            .signed_duration_since(done)
            .to_std()
            .map(|age| age <= retention)
            .unwrap_or(true),
        None => true,
    });
}

async fn worker_loop(
    queue: Arc<DeliveryQueue>,
    mut job_rx: mpsc::Receiver<DeliveryJob>,
    transport: Arc<dyn WebhookTransport>,
) {
    let permits = Arc::new(Semaphore::new(queue.tuning.concurrency));
    while let Some(job) = job_rx.recv().await {
        let permit = match Arc::clone(&permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };
        let queue = Arc::clone(&queue);
        let transport = Arc::clone(&transport);
        tokio::spawn(async move {
            queue.mark(&job.id, JobState::Active);
            match deliver_with_retry(&queue, transport.as_ref(), &job).await {
                Ok(()) => {
                    counter!("webhook_delivered_total").increment(1);
                    tracing::info!(txn = %job.id, "webhook delivered");
                    queue.mark(&job.id, JobState::Completed);
                }
                Err(e) => {
                    counter!("webhook_failed_total").increment(1);
                    tracing::error!(txn = %job.id, "webhook delivery abandoned: {e:#}");
                    queue.mark(&job.id, JobState::Failed);
                }
            }
            drop(permit);
        });
    }
}

async fn deliver_with_retry(
    queue: &DeliveryQueue,
    transport: &dyn WebhookTransport,
    job: &DeliveryJob,
) -> anyhow::Result<()> {
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match transport.deliver(&job.envelope).await {
            Ok(()) => return Ok(()),
            Err(e) if attempt < queue.tuning.attempts => {
                let delay = queue.tuning.backoff_base * (1u32 << (attempt - 1));
                counter!("webhook_retries_total").increment(1);
                tracing::warn!(txn = %job.id, attempt, "webhook delivery failed, retrying in {delay:?}: {e:#}");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
