//! Payment Gateway — Binary Entrypoint
//! Boots the polling pipeline, the delivery workers, and the Axum HTTP server.
//!
//! See `README.md` for quickstart and configuration reference.

use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use payment_gateway::api::{self, AppState};
use payment_gateway::bus::{self, EventBus};
use payment_gateway::config::AppConfig;
use payment_gateway::delivery::{DeliveryQueue, DeliveryTuning, HttpWebhookTransport};
use payment_gateway::metrics::Metrics;
use payment_gateway::poller::{self, SessionPoller};
use payment_gateway::source::captcha::CaptchaSolver;
use payment_gateway::source::login::RemoteAuthenticator;
use payment_gateway::source::mbbank::MbBankSource;
use payment_gateway::store::snapshot::FileSnapshotStore;
use payment_gateway::store::PaymentStore;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("payment_gateway=info,warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env in local/dev; no-op in prod environments.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cfg = AppConfig::from_env().context("invalid configuration")?;
    let metrics = Metrics::init();

    let mut events = EventBus::default();

    // --- Payment store with snapshot persistence ---
    let snapshot = Arc::new(FileSnapshotStore::new(&cfg.snapshot.state_dir));
    let store = Arc::new(PaymentStore::new(
        cfg.gate.tz,
        snapshot,
        events.created_tx.clone(),
    ));
    store.rehydrate_if_enabled(!cfg.snapshot.disable_sync).await;

    // --- Webhook delivery workers ---
    let transport = Arc::new(HttpWebhookTransport::new(&cfg.webhook));
    let delivery = DeliveryQueue::new(
        &cfg.webhook,
        cfg.app_name.clone(),
        transport,
        DeliveryTuning::default(),
    );

    // --- Pipeline pumps, one consumer per channel ---
    let history_rx = events.take_history_rx().context("history receiver")?;
    let created_rx = events.take_created_rx().context("created receiver")?;
    let signal_rx = events.take_signal_rx().context("signal receiver")?;
    bus::spawn_store_pump(history_rx, Arc::clone(&store));
    bus::spawn_delivery_pump(created_rx, Arc::clone(&delivery));
    bus::spawn_signal_monitor(signal_rx);

    // --- Bank source and its poller ---
    let solver = CaptchaSolver::new(cfg.source.captcha_base_url.clone());
    let auth = Arc::new(RemoteAuthenticator::new(
        cfg.source.login_base_url.clone(),
        cfg.gate.login_id.clone(),
        cfg.gate.password.clone(),
        solver,
    ));
    let source = Arc::new(MbBankSource::new(
        cfg.source.api_base.clone(),
        cfg.gate.tz,
        auth,
    ));
    let gate = cfg.gate.clone();
    let handle = SessionPoller::new(
        gate,
        source,
        events.history_tx.clone(),
        events.signal_tx.clone(),
    )
    .spawn();
    if let Some(at) = cfg.gate.daily_sync_at {
        poller::spawn_daily_kickoff(handle.clone(), at, cfg.gate.tz);
    }

    // --- HTTP surface ---
    let state = AppState {
        poller: handle,
        store: Arc::clone(&store),
        delivery: Arc::clone(&delivery),
    };
    let router = api::create_router(state).merge(metrics.router());

    let addr = format!("{}:{}", cfg.server.host, cfg.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(%addr, gate = %cfg.gate.name, "payment gateway listening");
    axum::serve(listener, router).await.context("http server")?;
    Ok(())
}
