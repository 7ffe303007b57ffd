// tests/delivery_queue.rs
//
// Exercises the webhook queue end to end against a scripted transport:
// envelope shape, retry-then-success, abandonment after the attempt cap,
// duplicate absorption and enqueue-time filtering.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::bail;
use chrono::Utc;

use payment_gateway::config::WebhookConfig;
use payment_gateway::delivery::{
    DeliveryQueue, DeliveryTuning, EnqueueOutcome, JobState, WebhookTransport,
};
use payment_gateway::payment::{Payment, WebhookEnvelope, EVENT_PAYMENT_CREATED, WEBHOOK_VERSION};
use regex::Regex;

/// Refuses the first `fail_first` attempts per job, then accepts.
struct MockTransport {
    fail_first: u32,
    attempts: Mutex<HashMap<String, u32>>,
    delivered: Mutex<Vec<WebhookEnvelope<Payment>>>,
}

impl MockTransport {
    fn new(fail_first: u32) -> Arc<Self> {
        Arc::new(Self {
            fail_first,
            attempts: Mutex::new(HashMap::new()),
            delivered: Mutex::new(Vec::new()),
        })
    }

    fn attempts_for(&self, id: &str) -> u32 {
        self.attempts.lock().unwrap().get(id).copied().unwrap_or(0)
    }

    fn delivered(&self) -> Vec<WebhookEnvelope<Payment>> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl WebhookTransport for MockTransport {
    async fn deliver(&self, envelope: &WebhookEnvelope<Payment>) -> anyhow::Result<()> {
        let id = envelope.data.transaction_id.clone();
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let n = attempts.entry(id).or_insert(0);
            *n += 1;
            *n
        };
        if attempt <= self.fail_first {
            bail!("endpoint refused attempt {attempt}");
        }
        self.delivered.lock().unwrap().push(envelope.clone());
        Ok(())
    }
}

fn webhook_cfg(content: Option<&str>, account: Option<&str>) -> WebhookConfig {
    WebhookConfig {
        url: "http://127.0.0.1:9/hook".to_string(),
        token: "secret".to_string(),
        content_regex: content.map(|p| Regex::new(p).unwrap()),
        account_regex: account.map(|p| Regex::new(p).unwrap()),
    }
}

fn fast_tuning() -> DeliveryTuning {
    DeliveryTuning {
        attempts: 3,
        backoff_base: Duration::from_millis(10),
        concurrency: 5,
        retention: Duration::from_secs(3 * 24 * 60 * 60),
    }
}

fn payment(id: &str, content: &str) -> Payment {
    Payment {
        transaction_id: id.to_string(),
        content: content.to_string(),
        credit_amount: 250_000,
        debit_amount: 0,
        date: Utc::now(),
        account_receiver: "0123456789".to_string(),
        account_sender: "9876543210".to_string(),
        name_sender: "NGUYEN VAN A".to_string(),
    }
}

async fn wait_for_state(queue: &DeliveryQueue, id: &str, want: JobState) {
    for _ in 0..500 {
        if queue.job_state(id) == Some(want) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "job {id} never reached {want:?}, last seen {:?}",
        queue.job_state(id)
    );
}

#[tokio::test]
async fn delivered_envelope_carries_event_and_source() {
    let transport = MockTransport::new(0);
    let queue = DeliveryQueue::new(
        &webhook_cfg(None, None),
        "mbbank".to_string(),
        transport.clone(),
        fast_tuning(),
    );

    let p = payment("mbbank-FT100", "NAP GAME abc123");
    assert_eq!(queue.enqueue(p.clone()).await, EnqueueOutcome::Queued);
    wait_for_state(&queue, "mbbank-FT100", JobState::Completed).await;

    let delivered = transport.delivered();
    assert_eq!(delivered.len(), 1);
    let envelope = &delivered[0];
    assert_eq!(envelope.event, EVENT_PAYMENT_CREATED);
    assert_eq!(envelope.version, WEBHOOK_VERSION);
    assert_eq!(envelope.source, "mbbank");
    assert_eq!(envelope.data, p);
    assert_eq!(transport.attempts_for("mbbank-FT100"), 1);
}

#[tokio::test]
async fn retries_until_delivery_succeeds() {
    let transport = MockTransport::new(2);
    let queue = DeliveryQueue::new(
        &webhook_cfg(None, None),
        "mbbank".to_string(),
        transport.clone(),
        fast_tuning(),
    );

    queue.enqueue(payment("mbbank-FT101", "hello")).await;
    wait_for_state(&queue, "mbbank-FT101", JobState::Completed).await;

    assert_eq!(transport.attempts_for("mbbank-FT101"), 3);
    assert_eq!(transport.delivered().len(), 1);
}

#[tokio::test]
async fn gives_up_after_the_attempt_cap() {
    let transport = MockTransport::new(u32::MAX);
    let queue = DeliveryQueue::new(
        &webhook_cfg(None, None),
        "mbbank".to_string(),
        transport.clone(),
        fast_tuning(),
    );

    queue.enqueue(payment("mbbank-FT102", "hello")).await;
    wait_for_state(&queue, "mbbank-FT102", JobState::Failed).await;

    assert_eq!(transport.attempts_for("mbbank-FT102"), 3);
    assert!(transport.delivered().is_empty());
}

#[tokio::test]
async fn duplicate_enqueue_is_dropped_while_job_is_live() {
    let transport = MockTransport::new(u32::MAX);
    let queue = DeliveryQueue::new(
        &webhook_cfg(None, None),
        "mbbank".to_string(),
        transport.clone(),
        fast_tuning(),
    );

    let p = payment("mbbank-FT103", "hello");
    assert_eq!(queue.enqueue(p.clone()).await, EnqueueOutcome::Queued);
    assert_eq!(queue.enqueue(p).await, EnqueueOutcome::Duplicate);
}

#[tokio::test]
async fn finished_job_still_absorbs_duplicates() {
    let transport = MockTransport::new(0);
    let queue = DeliveryQueue::new(
        &webhook_cfg(None, None),
        "mbbank".to_string(),
        transport.clone(),
        fast_tuning(),
    );

    let p = payment("mbbank-FT104", "hello");
    queue.enqueue(p.clone()).await;
    wait_for_state(&queue, "mbbank-FT104", JobState::Completed).await;

    assert_eq!(queue.enqueue(p).await, EnqueueOutcome::Duplicate);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(transport.delivered().len(), 1, "webhook must fire only once");
}

#[tokio::test]
async fn filters_stop_payments_before_they_are_queued() {
    let transport = MockTransport::new(0);
    let queue = DeliveryQueue::new(
        &webhook_cfg(Some("^NAP"), None),
        "mbbank".to_string(),
        transport.clone(),
        fast_tuning(),
    );

    let p = payment("mbbank-FT105", "rut tien ATM");
    assert_eq!(queue.enqueue(p).await, EnqueueOutcome::Filtered);
    assert_eq!(queue.job_state("mbbank-FT105"), None);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(transport.delivered().is_empty());
}
