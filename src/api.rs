use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use tower_http::cors::CorsLayer;

use crate::delivery::{DeliveryQueue, EnqueueOutcome};
use crate::payment::Payment;
use crate::poller::{PollerHandle, TriggerOutcome};
use crate::store::{PaymentQuery, PaymentStore, SortOrder};

#[derive(Clone)]
pub struct AppState {
    pub poller: PollerHandle,
    pub store: Arc<PaymentStore>,
    pub delivery: Arc<DeliveryQueue>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/gateway/sync", get(trigger_sync))
        .route("/payments", get(get_payments))
        .route("/webhook", get(enqueue_test_payment))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

#[derive(serde::Serialize)]
struct SyncResp {
    message: &'static str,
}

async fn trigger_sync(State(state): State<AppState>) -> Json<SyncResp> {
    let message = match state.poller.trigger_sync() {
        TriggerOutcome::Started => "ok",
        TriggerOutcome::Busy => "busy",
    };
    Json(SyncResp { message })
}

async fn get_payments(
    State(state): State<AppState>,
    Query(q): Query<HashMap<String, String>>,
) -> Json<Vec<Payment>> {
    Json(state.store.payments(&parse_payment_query(&q)))
}

/// Unknown or malformed query parameters are ignored, never rejected.
fn parse_payment_query(q: &HashMap<String, String>) -> PaymentQuery {
    let parse_ts = |key: &str| {
        q.get(key)
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|d| d.with_timezone(&Utc))
    };
    PaymentQuery {
        from: parse_ts("from"),
        to: parse_ts("to"),
        sort: q.get("sort").and_then(|v| match v.as_str() {
            "asc" => Some(SortOrder::Asc),
            "desc" => Some(SortOrder::Desc),
            _ => None,
        }),
        limit: q.get("limit").and_then(|v| v.parse::<usize>().ok()),
    }
}

#[derive(serde::Serialize)]
struct TestPaymentResp {
    ok: bool,
    message: &'static str,
    transaction_id: String,
}

/// Push a synthetic payment through the delivery path, bypassing the store.
/// Handy for verifying the receiving endpoint without touching the bank.
async fn enqueue_test_payment(State(state): State<AppState>) -> Json<TestPaymentResp> {
    let now = Utc::now();
    let payment = Payment {
        transaction_id: format!("TEST-{}", now.timestamp_millis()),
        content: "Test payment content (auto-generated)".to_string(),
        credit_amount: 500_000,
        debit_amount: 0,
        date: now,
        account_receiver: "000123456789".to_string(),
        account_sender: "999987654321".to_string(),
        name_sender: "Test Sender".to_string(),
    };
    let transaction_id = payment.transaction_id.clone();
    let (ok, message) = match state.delivery.enqueue(payment).await {
        EnqueueOutcome::Queued => (true, "Enqueued test payment (no body accepted)"),
        EnqueueOutcome::Duplicate => (false, "Test payment already queued"),
        EnqueueOutcome::Filtered => (false, "Test payment rejected by the webhook filters"),
        EnqueueOutcome::Rejected => (false, "Delivery workers unavailable"),
    };
    Json(TestPaymentResp {
        ok,
        message,
        transaction_id,
    })
}
