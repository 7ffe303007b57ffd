// tests/poller_state.rs
//
// Drives the sync state machine with a scripted source and shrunken delays:
// single-flight triggers, continuous vs one-shot modes, quick retries,
// the error-streak cooldown with its once-per-outage signal, the hard-retry
// stop, and the transparent session refetch.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, FixedOffset, TimeZone, Utc};
use tokio::sync::mpsc;

use payment_gateway::bus::PollerSignal;
use payment_gateway::config::{Gate, SyncMode};
use payment_gateway::payment::Payment;
use payment_gateway::poller::{PollerHandle, PollerState, PollerTuning, SessionPoller, TriggerOutcome};
use payment_gateway::source::{FetchWindow, SourceError, TransactionSource};

#[derive(Clone)]
enum Step {
    Batch(Vec<Payment>),
    Transient,
    Expired,
}

impl Step {
    fn result(&self) -> Result<Vec<Payment>, SourceError> {
        match self {
            Step::Batch(b) => Ok(b.clone()),
            Step::Transient => Err(SourceError::Transient("scripted failure".into())),
            Step::Expired => Err(SourceError::SessionExpired),
        }
    }
}

/// Plays back a scripted sequence of fetch results, then repeats `fallback`.
struct ScriptedSource {
    steps: Mutex<VecDeque<Step>>,
    fallback: Step,
    calls: Arc<AtomicU32>,
}

impl ScriptedSource {
    fn new(steps: Vec<Step>, fallback: Step) -> (Self, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        (
            Self {
                steps: Mutex::new(steps.into()),
                fallback,
                calls: Arc::clone(&calls),
            },
            calls,
        )
    }
}

#[async_trait::async_trait]
impl TransactionSource for ScriptedSource {
    async fn fetch(&self, _account: &str, _window: FetchWindow) -> Result<Vec<Payment>, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self.steps.lock().unwrap().pop_front();
        step.unwrap_or_else(|| self.fallback.clone()).result()
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

fn bank_tz() -> FixedOffset {
    FixedOffset::east_opt(7 * 3600).unwrap()
}

fn sample_payment(id: &str) -> Payment {
    let date: DateTime<Utc> = bank_tz()
        .with_ymd_and_hms(2025, 4, 20, 10, 0, 0)
        .unwrap()
        .with_timezone(&Utc);
    Payment {
        transaction_id: id.to_string(),
        content: format!("payment {id}"),
        credit_amount: 100_000,
        debit_amount: 0,
        date,
        account_receiver: "0123456789".to_string(),
        account_sender: "9876543210".to_string(),
        name_sender: "NGUYEN VAN A".to_string(),
    }
}

fn gate(mode: SyncMode, repeat: Duration) -> Gate {
    Gate {
        name: "mbbank-test".to_string(),
        login_id: "user".to_string(),
        password: "pass".to_string(),
        account: "0123456789".to_string(),
        repeat_interval: repeat,
        day_limit: 14,
        sync_mode: mode,
        daily_sync_at: None,
        tz: bank_tz(),
    }
}

fn fast_tuning() -> PollerTuning {
    PollerTuning {
        quick_retry: Duration::from_millis(10),
        cooldown: Duration::from_millis(200),
        error_streak_threshold: 5,
        hard_retry_cap: 3,
        fetch_timeout: Duration::from_secs(5),
    }
}

#[allow(clippy::type_complexity)]
fn spawn_poller(
    mode: SyncMode,
    source: ScriptedSource,
    tuning: PollerTuning,
) -> (
    PollerHandle,
    mpsc::Receiver<Vec<Payment>>,
    mpsc::Receiver<PollerSignal>,
) {
    let (history_tx, history_rx) = mpsc::channel(64);
    let (signal_tx, signal_rx) = mpsc::channel(64);
    let handle = SessionPoller::new(
        gate(mode, Duration::from_millis(20)),
        Arc::new(source),
        history_tx,
        signal_tx,
    )
    .with_tuning(tuning)
    .spawn();
    (handle, history_rx, signal_rx)
}

async fn wait_until(label: &str, cond: impl Fn() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting until {label}");
}

async fn recv_signal(rx: &mut mpsc::Receiver<PollerSignal>, label: &str) -> PollerSignal {
    tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {label}"))
        .unwrap_or_else(|| panic!("signal channel closed waiting for {label}"))
}

#[tokio::test]
async fn trigger_fetches_and_publishes_history() {
    let (source, calls) = ScriptedSource::new(
        vec![Step::Batch(vec![sample_payment("mbbank-1")])],
        Step::Batch(vec![]),
    );
    let (handle, mut history_rx, _signals) =
        spawn_poller(SyncMode::OneShot, source, fast_tuning());

    assert_eq!(handle.trigger_sync(), TriggerOutcome::Started);
    let batch = tokio::time::timeout(Duration::from_secs(5), history_rx.recv())
        .await
        .expect("history batch in time")
        .expect("history channel open");
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].transaction_id, "mbbank-1");

    wait_until("poller parks idle", || handle.state() == PollerState::Idle).await;
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1, "one-shot must not repoll");

    // parked means a new trigger is welcome
    assert_eq!(handle.trigger_sync(), TriggerOutcome::Started);
}

#[tokio::test]
async fn concurrent_trigger_is_refused_while_active() {
    let (source, _calls) = ScriptedSource::new(vec![], Step::Batch(vec![]));
    let (handle, _history_rx, _signals) =
        spawn_poller(SyncMode::Continuous, source, fast_tuning());

    assert_eq!(handle.trigger_sync(), TriggerOutcome::Started);
    assert_eq!(handle.trigger_sync(), TriggerOutcome::Busy);

    handle.stop();
    wait_until("poller stops", || handle.state() == PollerState::Stopped).await;
    assert_eq!(handle.trigger_sync(), TriggerOutcome::Started);
    handle.stop();
}

#[tokio::test]
async fn continuous_mode_keeps_polling() {
    let (source, calls) = ScriptedSource::new(vec![], Step::Batch(vec![]));
    let (handle, _history_rx, _signals) =
        spawn_poller(SyncMode::Continuous, source, fast_tuning());

    handle.trigger_sync();
    wait_until("three polling cycles", || calls.load(Ordering::SeqCst) >= 3).await;
    handle.stop();
    wait_until("poller stops", || handle.state() == PollerState::Stopped).await;
}

#[tokio::test]
async fn session_expiry_refetches_without_counting_as_failure() {
    // threshold 0 turns any counted failure into an immediate streak signal,
    // so a clean run proves the expiry retry stayed off the failure path
    let tuning = PollerTuning {
        error_streak_threshold: 0,
        ..fast_tuning()
    };
    let (source, calls) = ScriptedSource::new(
        vec![Step::Expired, Step::Batch(vec![sample_payment("mbbank-1")])],
        Step::Batch(vec![]),
    );
    let (handle, mut history_rx, mut signals) = spawn_poller(SyncMode::OneShot, source, tuning);

    handle.trigger_sync();
    let batch = tokio::time::timeout(Duration::from_secs(5), history_rx.recv())
        .await
        .expect("history batch in time")
        .expect("history channel open");
    assert_eq!(batch[0].transaction_id, "mbbank-1");
    assert_eq!(calls.load(Ordering::SeqCst), 2, "expired fetch plus one refetch");
    assert!(signals.try_recv().is_err(), "no failure signal for a session refresh");
    wait_until("poller parks idle", || handle.state() == PollerState::Idle).await;
}

#[tokio::test]
async fn second_session_expiry_counts_as_cycle_failure() {
    let tuning = PollerTuning {
        error_streak_threshold: 0,
        ..fast_tuning()
    };
    let (source, calls) =
        ScriptedSource::new(vec![Step::Expired, Step::Expired], Step::Batch(vec![]));
    let (handle, _history_rx, mut signals) = spawn_poller(SyncMode::OneShot, source, tuning);

    handle.trigger_sync();
    let signal = recv_signal(&mut signals, "error streak after double expiry").await;
    assert!(matches!(signal, PollerSignal::ErrorStreak { .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    handle.stop();
}

#[tokio::test]
async fn error_streak_cools_down_and_signals_once() {
    let tuning = PollerTuning {
        cooldown: Duration::from_secs(1),
        ..fast_tuning()
    };
    let (source, _calls) = ScriptedSource::new(vec![Step::Transient; 6], Step::Batch(vec![]));
    let (handle, _history_rx, mut signals) = spawn_poller(SyncMode::OneShot, source, tuning);

    handle.trigger_sync();
    let first = recv_signal(&mut signals, "error streak signal").await;
    match first {
        PollerSignal::ErrorStreak { gate, error } => {
            assert_eq!(gate, "mbbank-test");
            assert!(error.contains("scripted failure"));
        }
        other => panic!("expected error streak, got {other:?}"),
    }
    wait_until("cooldown state", || handle.state() == PollerState::CooldownWait).await;

    let second = recv_signal(&mut signals, "recovery signal").await;
    assert_eq!(
        second,
        PollerSignal::Recovered {
            gate: "mbbank-test".to_string()
        }
    );
    assert!(signals.try_recv().is_err(), "exactly one streak and one recovery");
    wait_until("poller parks idle", || handle.state() == PollerState::Idle).await;
}

#[tokio::test]
async fn persistent_outage_signals_only_once_across_cooldown_rounds() {
    let (source, calls) = ScriptedSource::new(vec![Step::Transient; 12], Step::Batch(vec![]));
    let (handle, _history_rx, mut signals) =
        spawn_poller(SyncMode::OneShot, source, fast_tuning());

    handle.trigger_sync();
    let first = recv_signal(&mut signals, "error streak signal").await;
    assert!(matches!(first, PollerSignal::ErrorStreak { .. }));
    let second = recv_signal(&mut signals, "recovery signal").await;
    assert!(
        matches!(second, PollerSignal::Recovered { .. }),
        "second cooldown round must not emit another streak signal, got {second:?}"
    );
    assert!(signals.try_recv().is_err());
    // 6 failures, cooldown, 6 more, cooldown, then the first success
    assert_eq!(calls.load(Ordering::SeqCst), 13);
}

#[tokio::test]
async fn hard_retry_cap_force_stops_the_poller() {
    let tuning = PollerTuning {
        cooldown: Duration::from_millis(100),
        ..fast_tuning()
    };
    let (source, calls) = ScriptedSource::new(vec![], Step::Transient);
    let (handle, _history_rx, mut signals) = spawn_poller(SyncMode::OneShot, source, tuning);

    handle.trigger_sync();
    let first = recv_signal(&mut signals, "error streak signal").await;
    assert!(matches!(first, PollerSignal::ErrorStreak { .. }));
    wait_until("force stop", || handle.state() == PollerState::Stopped).await;
    // three streak rounds of six failures each, stop instead of a third cooldown
    assert_eq!(calls.load(Ordering::SeqCst), 18);
    assert!(signals.try_recv().is_err(), "no extra signals on the way down");

    // a stopped poller can be started again by hand
    assert_eq!(handle.trigger_sync(), TriggerOutcome::Started);
    handle.stop();
}

#[tokio::test]
async fn stop_during_cooldown_exits_promptly() {
    let tuning = PollerTuning {
        cooldown: Duration::from_secs(30),
        ..fast_tuning()
    };
    let (source, _calls) = ScriptedSource::new(vec![Step::Transient; 6], Step::Batch(vec![]));
    let (handle, _history_rx, mut signals) = spawn_poller(SyncMode::Continuous, source, tuning);

    handle.trigger_sync();
    recv_signal(&mut signals, "error streak signal").await;
    wait_until("cooldown state", || handle.state() == PollerState::CooldownWait).await;

    let stopped_at = Instant::now();
    handle.stop();
    wait_until("poller stops", || handle.state() == PollerState::Stopped).await;
    assert!(
        stopped_at.elapsed() < Duration::from_secs(5),
        "stop must not wait out the cooldown"
    );
}
