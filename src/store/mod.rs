//! # Payment store
//!
//! Authoritative in-memory record of observed payments: deduplicated by
//! `transaction_id`, capped to the most recent entries, snapshotted to a
//! [`SnapshotStore`] after every accepted batch. The in-memory view stays
//! authoritative even when the snapshot backing fails.

pub mod snapshot;

use std::sync::{Arc, Mutex};

use chrono::{DateTime, FixedOffset, Timelike, Utc};
use metrics::{counter, gauge};
use tokio::sync::mpsc;

use crate::payment::Payment;
use snapshot::SnapshotStore;

/// Retain only this many most-recent payments.
pub const RETENTION_CAP: usize = 100;
/// Snapshot key holding the serialized payment array.
pub const SNAPSHOT_KEY: &str = "payments";

/// Sort order for queries; newest first unless asked otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

/// Range/sort/limit filter for [`PaymentStore::payments`]. Every field is
/// optional; bounds are inclusive.
#[derive(Debug, Clone, Copy, Default)]
pub struct PaymentQuery {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub sort: Option<SortOrder>,
    pub limit: Option<usize>,
}

pub struct PaymentStore {
    inner: Mutex<Vec<Payment>>,
    tz: FixedOffset,
    created_tx: mpsc::Sender<Vec<Payment>>,
    persist_tx: mpsc::UnboundedSender<String>,
    snapshot: Arc<dyn SnapshotStore>,
}

impl PaymentStore {
    /// Spawns the snapshot writer task, so this must run inside a Tokio
    /// runtime. `created_tx` receives each batch of genuinely new payments.
    pub fn new(
        tz: FixedOffset,
        snapshot: Arc<dyn SnapshotStore>,
        created_tx: mpsc::Sender<Vec<Payment>>,
    ) -> Self {
        let (persist_tx, mut persist_rx) = mpsc::unbounded_channel::<String>();
        let writer_snapshot = Arc::clone(&snapshot);
        // One writer keeps snapshot writes ordered; failures are logged,
        // never surfaced to the ingest path.
        tokio::spawn(async move {
            while let Some(json) = persist_rx.recv().await {
                if let Err(e) = writer_snapshot.set(SNAPSHOT_KEY, &json).await {
                    tracing::warn!("persisting payment snapshot failed: {e:#}");
                }
            }
        });
        Self {
            inner: Mutex::new(Vec::new()),
            tz,
            created_tx,
            persist_tx,
            snapshot,
        }
    }

    /// Load the persisted snapshot into memory. A missing or unreadable
    /// snapshot leaves the store empty and the process running.
    pub async fn rehydrate(&self) {
        let raw = match self.snapshot.get(SNAPSHOT_KEY).await {
            Ok(Some(raw)) if !raw.trim().is_empty() => raw,
            Ok(_) => return,
            Err(e) => {
                tracing::warn!("loading payment snapshot failed, starting empty: {e:#}");
                return;
            }
        };
        match serde_json::from_str::<Vec<Payment>>(&raw) {
            Ok(mut list) => {
                list.sort_by(|a, b| b.date.cmp(&a.date));
                list.truncate(RETENTION_CAP);
                let count = list.len();
                let mut inner = self.inner.lock().expect("payment store mutex poisoned");
                *inner = list;
                drop(inner);
                gauge!("payments_retained").set(count as f64);
                tracing::info!(count, "rehydrated payment store from snapshot");
            }
            Err(e) => tracing::warn!("payment snapshot unreadable, starting empty: {e:#}"),
        }
    }

    /// [`Self::rehydrate`] gated by configuration: when rehydration is
    /// switched off the snapshot stays unread and the store starts empty.
    pub async fn rehydrate_if_enabled(&self, enabled: bool) {
        if !enabled {
            tracing::info!("snapshot rehydration disabled, starting empty");
            return;
        }
        self.rehydrate().await;
    }

    /// Ingest one fetched batch: drop duplicates (against the store and
    /// within the batch), normalize same-day timestamps, append, re-sort,
    /// trim to the cap, then announce the survivors and snapshot the result.
    /// Returns how many payments were genuinely new.
    pub async fn add_payments(&self, batch: Vec<Payment>) -> usize {
        counter!("payments_observed_total").increment(batch.len() as u64);
        let now = Utc::now();
        let (fresh, retained_json) = {
            let mut inner = self.inner.lock().expect("payment store mutex poisoned");
            let mut fresh: Vec<Payment> = Vec::new();
            for mut p in batch {
                let seen = inner.iter().any(|e| e.transaction_id == p.transaction_id)
                    || fresh.iter().any(|e| e.transaction_id == p.transaction_id);
                if seen {
                    continue;
                }
                p.date = normalize_same_day(self.tz, p.date, now);
                fresh.push(p);
            }
            if fresh.is_empty() {
                return 0;
            }
            inner.extend(fresh.iter().cloned());
            inner.sort_by(|a, b| b.date.cmp(&a.date));
            inner.truncate(RETENTION_CAP);
            gauge!("payments_retained").set(inner.len() as f64);
            let json = serde_json::to_string(&*inner).unwrap_or_else(|e| {
                tracing::warn!("serializing payment snapshot failed: {e}");
                String::new()
            });
            (fresh, json)
        };
        let count = fresh.len();
        counter!("payments_created_total").increment(count as u64);
        tracing::info!(count, "stored new payments");
        if self.created_tx.send(fresh).await.is_err() {
            tracing::warn!("created-payment channel closed, event dropped");
        }
        if !retained_json.is_empty() {
            let _ = self.persist_tx.send(retained_json);
        }
        count
    }

    /// Filtered, sorted, limited view of the retained payments.
    pub fn payments(&self, q: &PaymentQuery) -> Vec<Payment> {
        let inner = self.inner.lock().expect("payment store mutex poisoned");
        let mut out: Vec<Payment> = inner
            .iter()
            .filter(|p| q.from.map_or(true, |from| p.date >= from))
            .filter(|p| q.to.map_or(true, |to| p.date <= to))
            .cloned()
            .collect();
        drop(inner);
        out.sort_by(|a, b| a.date.cmp(&b.date));
        if q.sort.unwrap_or_default() == SortOrder::Desc {
            out.reverse();
        }
        if let Some(limit) = q.limit {
            if limit > 0 {
                out.truncate(limit);
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .expect("payment store mutex poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Same-day rows arrive from the bank with the time truncated to local
/// midnight; stamp those with the current instant so ordering within the
/// day survives. Anything else passes through untouched.
fn normalize_same_day(tz: FixedOffset, date: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
    let local = date.with_timezone(&tz);
    let at_midnight = local.hour() == 0 && local.minute() == 0 && local.second() == 0;
    let today = local.date_naive() == now.with_timezone(&tz).date_naive();
    if at_midnight && today {
        now
    } else {
        date
    }
}
