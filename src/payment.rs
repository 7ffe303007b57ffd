// src/payment.rs
use chrono::{DateTime, Utc};

/// Event tag carried by envelopes for newly stored payments.
pub const EVENT_PAYMENT_CREATED: &str = "payment.created";
/// Wire schema version of the webhook envelope.
pub const WEBHOOK_VERSION: u32 = 1;

/// One observed bank transaction. `transaction_id` is globally unique per
/// source and doubles as the dedup/idempotency key; a stored payment is
/// never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Payment {
    pub transaction_id: String,
    pub content: String,
    pub credit_amount: u64, // income
    pub debit_amount: u64,  // expense
    pub date: DateTime<Utc>,
    pub account_receiver: String,
    pub account_sender: String,
    pub name_sender: String,
}

/// Versioned wrapper around a delivered payload, carrying the event tag and
/// provenance metadata. Built at enqueue time, consumed within one delivery
/// job, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct WebhookEnvelope<T> {
    pub event: String,
    pub version: u32,
    pub occurred_at: DateTime<Utc>,
    pub source: String,
    pub data: T,
}

impl<T> WebhookEnvelope<T> {
    /// Envelope for a `payment.created` event, stamped with the current instant.
    pub fn payment_created(source: String, data: T) -> Self {
        Self {
            event: EVENT_PAYMENT_CREATED.to_string(),
            version: WEBHOOK_VERSION,
            occurred_at: Utc::now(),
            source,
            data,
        }
    }
}
