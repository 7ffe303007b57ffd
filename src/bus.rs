//! # Event bus
//!
//! Typed channels wiring the pipeline: the poller publishes fetched history
//! batches and health signals, the store publishes created payments, and
//! small pump tasks move each stream to its single consumer.

use std::sync::Arc;

use metrics::counter;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::delivery::DeliveryQueue;
use crate::payment::Payment;
use crate::store::PaymentStore;

const DEFAULT_CAPACITY: usize = 256;

/// Health events the poller publishes alongside the data stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollerSignal {
    /// Consecutive failures crossed the streak threshold; emitted once per
    /// outage, not per cooldown round.
    ErrorStreak { gate: String, error: String },
    /// First success after an error streak.
    Recovered { gate: String },
}

/// Owns every channel pair; senders are cloned into producers, each
/// receiver is taken exactly once by its consumer.
pub struct EventBus {
    pub history_tx: mpsc::Sender<Vec<Payment>>,
    history_rx: Option<mpsc::Receiver<Vec<Payment>>>,
    pub created_tx: mpsc::Sender<Vec<Payment>>,
    created_rx: Option<mpsc::Receiver<Vec<Payment>>>,
    pub signal_tx: mpsc::Sender<PollerSignal>,
    signal_rx: Option<mpsc::Receiver<PollerSignal>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (history_tx, history_rx) = mpsc::channel(capacity);
        let (created_tx, created_rx) = mpsc::channel(capacity);
        let (signal_tx, signal_rx) = mpsc::channel(capacity);
        Self {
            history_tx,
            history_rx: Some(history_rx),
            created_tx,
            created_rx: Some(created_rx),
            signal_tx,
            signal_rx: Some(signal_rx),
        }
    }

    /// Fetched-history receiver; `None` after the first call.
    pub fn take_history_rx(&mut self) -> Option<mpsc::Receiver<Vec<Payment>>> {
        self.history_rx.take()
    }

    /// Created-payment receiver; `None` after the first call.
    pub fn take_created_rx(&mut self) -> Option<mpsc::Receiver<Vec<Payment>>> {
        self.created_rx.take()
    }

    /// Poller-signal receiver; `None` after the first call.
    pub fn take_signal_rx(&mut self) -> Option<mpsc::Receiver<PollerSignal>> {
        self.signal_rx.take()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// Feed fetched history batches into the store.
pub fn spawn_store_pump(
    mut rx: mpsc::Receiver<Vec<Payment>>,
    store: Arc<PaymentStore>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(batch) = rx.recv().await {
            store.add_payments(batch).await;
        }
    })
}

/// Feed newly created payments into the delivery queue.
pub fn spawn_delivery_pump(
    mut rx: mpsc::Receiver<Vec<Payment>>,
    queue: Arc<DeliveryQueue>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(batch) = rx.recv().await {
            queue.enqueue_batch(batch).await;
        }
    })
}

/// Log and count poller health signals. Operational notification fan-out
/// (chat alerts and the like) hangs off this stream.
pub fn spawn_signal_monitor(mut rx: mpsc::Receiver<PollerSignal>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(signal) = rx.recv().await {
            match signal {
                PollerSignal::ErrorStreak { gate, error } => {
                    counter!("gateway_error_streaks_total").increment(1);
                    tracing::error!(gate = %gate, "sync error streak, poller cooling down: {error}");
                }
                PollerSignal::Recovered { gate } => {
                    counter!("gateway_recoveries_total").increment(1);
                    tracing::info!(gate = %gate, "sync recovered after error streak");
                }
            }
        }
    })
}
