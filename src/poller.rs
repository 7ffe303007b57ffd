//! # Session poller
//!
//! One owning task per gate runs the sync state machine: triggered manually
//! or by the daily kick-off, it pulls history on the repeat interval and
//! absorbs faults in layers. Short outages get a quick retry, persistent
//! streaks get a long cooldown plus a single health signal, and repeated
//! cooldown rounds force the poller to stop. An expired bank session is
//! refetched once in place without counting as a failure.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{Duration as ChronoDuration, FixedOffset, NaiveTime, Utc};
use metrics::{counter, gauge};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::bus::PollerSignal;
use crate::config::{Gate, SyncMode};
use crate::payment::Payment;
use crate::source::{FetchWindow, SourceError, TransactionSource};

/// Lifecycle of the polling state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerState {
    Idle,
    Running,
    CooldownWait,
    Stopped,
}

/// Result of a manual trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    Started,
    /// A cycle is running or cooling down; the trigger was a no-op.
    Busy,
}

/// Retry and cooldown policy. Production defaults; tests shrink the delays
/// to drive the machine through its transitions quickly.
#[derive(Debug, Clone)]
pub struct PollerTuning {
    /// Delay before retrying an ordinary failed cycle.
    pub quick_retry: Duration,
    /// Pause after the failure streak crosses the threshold.
    pub cooldown: Duration,
    /// Streak length that must be exceeded to enter cooldown.
    pub error_streak_threshold: u32,
    /// Cooldown rounds before the poller gives up and stops.
    pub hard_retry_cap: u32,
    /// Upper bound on a single fetch, session retry included.
    pub fetch_timeout: Duration,
}

impl Default for PollerTuning {
    fn default() -> Self {
        Self {
            quick_retry: Duration::from_secs(5),
            cooldown: Duration::from_secs(5 * 60),
            error_streak_threshold: 5,
            hard_retry_cap: 3,
            fetch_timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug)]
enum Command {
    Start,
    Stop,
}

#[derive(Debug)]
struct Shared {
    /// Single-flight guard; owned by a trigger until its run winds down.
    active: AtomicBool,
    state: Mutex<PollerState>,
}

/// Cheap cloneable control handle for one poller task.
#[derive(Clone)]
pub struct PollerHandle {
    cmd_tx: mpsc::Sender<Command>,
    shared: Arc<Shared>,
    gate_name: String,
}

impl PollerHandle {
    /// Start a sync run unless one is already active. The guard is claimed
    /// here, before the command is queued, so concurrent triggers cannot
    /// both win.
    pub fn trigger_sync(&self) -> TriggerOutcome {
        if self
            .shared
            .active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::warn!(gate = %self.gate_name, "sync already running, trigger ignored");
            return TriggerOutcome::Busy;
        }
        if self.cmd_tx.try_send(Command::Start).is_err() {
            // poller task is gone; release the guard so a restart can claim it
            self.shared.active.store(false, Ordering::SeqCst);
            tracing::error!(gate = %self.gate_name, "poller task unavailable, trigger dropped");
            return TriggerOutcome::Busy;
        }
        TriggerOutcome::Started
    }

    /// Ask the active run to wind down at its next checkpoint. A no-op when
    /// nothing is running.
    pub fn stop(&self) {
        let _ = self.cmd_tx.try_send(Command::Stop);
    }

    pub fn state(&self) -> PollerState {
        *self.shared.state.lock().expect("poller state mutex poisoned")
    }

    pub fn name(&self) -> &str {
        &self.gate_name
    }
}

/// Recurring synchronization driver for one gate.
pub struct SessionPoller {
    gate: Gate,
    tuning: PollerTuning,
    source: Arc<dyn TransactionSource>,
    history_tx: mpsc::Sender<Vec<Payment>>,
    signal_tx: mpsc::Sender<PollerSignal>,
}

impl SessionPoller {
    pub fn new(
        gate: Gate,
        source: Arc<dyn TransactionSource>,
        history_tx: mpsc::Sender<Vec<Payment>>,
        signal_tx: mpsc::Sender<PollerSignal>,
    ) -> Self {
        Self {
            gate,
            tuning: PollerTuning::default(),
            source,
            history_tx,
            signal_tx,
        }
    }

    pub fn with_tuning(mut self, tuning: PollerTuning) -> Self {
        self.tuning = tuning;
        self
    }

    /// Spawn the owning task and hand back its control handle.
    pub fn spawn(self) -> PollerHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let shared = Arc::new(Shared {
            active: AtomicBool::new(false),
            state: Mutex::new(PollerState::Idle),
        });
        let handle = PollerHandle {
            cmd_tx,
            shared: Arc::clone(&shared),
            gate_name: self.gate.name.clone(),
        };
        tokio::spawn(run(self, shared, cmd_rx));
        handle
    }
}

enum Exit {
    /// One-shot run completed; back to idle.
    Finished,
    /// Stop command honored.
    Stopped,
    /// Hard-retry cap exhausted.
    ForceStopped,
}

async fn run(poller: SessionPoller, shared: Arc<Shared>, mut cmd_rx: mpsc::Receiver<Command>) {
    while let Some(cmd) = cmd_rx.recv().await {
        match cmd {
            // nothing is running, so there is nothing to wind down
            Command::Stop => {
                set_state(&shared, PollerState::Stopped);
                continue;
            }
            Command::Start => {}
        }
        tracing::info!(gate = %poller.gate.name, "sync run started");
        let exit = drive(&poller, &shared, &mut cmd_rx).await;
        match exit {
            Exit::Finished => {
                tracing::info!(gate = %poller.gate.name, "one-shot sync finished");
                set_state(&shared, PollerState::Idle);
            }
            Exit::Stopped => {
                tracing::info!(gate = %poller.gate.name, "sync stopped");
                set_state(&shared, PollerState::Stopped);
            }
            Exit::ForceStopped => set_state(&shared, PollerState::Stopped),
        }
        shared.active.store(false, Ordering::SeqCst);
    }
}

/// One activation of the machine: loops through fetch cycles until it
/// finishes, is stopped, or gives up. Streak counters live and die with
/// the activation.
async fn drive(p: &SessionPoller, shared: &Shared, cmd_rx: &mut mpsc::Receiver<Command>) -> Exit {
    let mut error_streak: u32 = 0;
    let mut hard_retries: u32 = 0;
    let mut errored = false;

    loop {
        set_state(shared, PollerState::Running);

        // 1) pull history; a stop cannot abort the fetch, only discard it
        let result = fetch_once(p).await;
        if drain_saw_stop(cmd_rx) {
            return Exit::Stopped;
        }

        match result {
            Ok(batch) => {
                counter!("gateway_sync_runs_total").increment(1);
                gauge!("gateway_last_sync_ts").set(Utc::now().timestamp().max(0) as f64);
                tracing::info!(gate = %p.gate.name, count = batch.len(), "history fetched");

                // 2) hand the batch to the store pipeline
                if p.history_tx.send(batch).await.is_err() {
                    tracing::warn!(gate = %p.gate.name, "history channel closed, winding down");
                    return Exit::Stopped;
                }

                // 3) recovery and streak bookkeeping
                if errored {
                    let _ = p
                        .signal_tx
                        .send(PollerSignal::Recovered {
                            gate: p.gate.name.clone(),
                        })
                        .await;
                    errored = false;
                }
                error_streak = 0;
                hard_retries = 0;

                // 4) park or wait out the repeat interval
                match p.gate.sync_mode {
                    SyncMode::OneShot => return Exit::Finished,
                    SyncMode::Continuous => {
                        if sleep_or_stop(cmd_rx, p.gate.repeat_interval).await == Wait::Stop {
                            return Exit::Stopped;
                        }
                    }
                }
            }
            Err(err) => {
                log_failure(&p.gate.name, &err);
                error_streak += 1;

                if error_streak > p.tuning.error_streak_threshold {
                    hard_retries += 1;
                    if hard_retries >= p.tuning.hard_retry_cap {
                        tracing::error!(
                            gate = %p.gate.name,
                            hard_retries,
                            "giving up after repeated cooldowns, poller stopped"
                        );
                        return Exit::ForceStopped;
                    }
                    if !errored {
                        // one signal per outage, no matter how many
                        // cooldown rounds it takes
                        errored = true;
                        let _ = p
                            .signal_tx
                            .send(PollerSignal::ErrorStreak {
                                gate: p.gate.name.clone(),
                                error: err.to_string(),
                            })
                            .await;
                    }
                    tracing::warn!(
                        gate = %p.gate.name,
                        error_streak,
                        hard_retries,
                        "error streak, cooling down for {:?}",
                        p.tuning.cooldown
                    );
                    set_state(shared, PollerState::CooldownWait);
                    if sleep_or_stop(cmd_rx, p.tuning.cooldown).await == Wait::Stop {
                        return Exit::Stopped;
                    }
                    error_streak = 0;
                } else if sleep_or_stop(cmd_rx, p.tuning.quick_retry).await == Wait::Stop {
                    return Exit::Stopped;
                }
            }
        }
    }
}

/// Fetch the configured window. An expired session gets one transparent
/// in-place refetch; the source re-authenticates on demand. A second
/// expiry counts as an ordinary cycle failure.
async fn fetch_once(p: &SessionPoller) -> Result<Vec<Payment>, SourceError> {
    let window = FetchWindow::last_days(p.gate.day_limit);
    match fetch_with_timeout(p, window).await {
        Err(e) if e.is_session_expired() => {
            tracing::info!(gate = %p.gate.name, "bank session expired, refetching");
            fetch_with_timeout(p, window).await
        }
        other => other,
    }
}

async fn fetch_with_timeout(
    p: &SessionPoller,
    window: FetchWindow,
) -> Result<Vec<Payment>, SourceError> {
    match tokio::time::timeout(p.tuning.fetch_timeout, p.source.fetch(&p.gate.account, window))
        .await
    {
        Ok(result) => result,
        Err(_) => Err(SourceError::Transient(format!(
            "fetch timed out after {:?}",
            p.tuning.fetch_timeout
        ))),
    }
}

fn log_failure(gate: &str, err: &SourceError) {
    counter!("gateway_sync_errors_total").increment(1);
    match err {
        SourceError::CaptchaUnresolved(_) => {
            counter!("gateway_captcha_failures_total").increment(1);
            tracing::warn!(gate = %gate, "sync failed on captcha: {err}");
        }
        SourceError::LoginFailed(_) => {
            counter!("gateway_login_failures_total").increment(1);
            tracing::warn!(gate = %gate, "sync failed on login: {err}");
        }
        _ => tracing::warn!(gate = %gate, "sync failed: {err}"),
    }
}

fn set_state(shared: &Shared, next: PollerState) {
    *shared.state.lock().expect("poller state mutex poisoned") = next;
}

/// Drain queued commands without blocking; a stop anywhere in the backlog
/// wins.
fn drain_saw_stop(cmd_rx: &mut mpsc::Receiver<Command>) -> bool {
    let mut stop = false;
    while let Ok(cmd) = cmd_rx.try_recv() {
        if matches!(cmd, Command::Stop) {
            stop = true;
        }
    }
    stop
}

#[derive(PartialEq, Eq)]
enum Wait {
    Elapsed,
    Stop,
}

/// Sleep that a stop command can cut short. Spurious starts neither reset
/// nor shorten the timer.
async fn sleep_or_stop(cmd_rx: &mut mpsc::Receiver<Command>, d: Duration) -> Wait {
    let sleep = tokio::time::sleep(d);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return Wait::Elapsed,
            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Stop) | None => return Wait::Stop,
                Some(Command::Start) => continue,
            }
        }
    }
}

/// Fire one trigger per day at `at` bank-local time. A busy poller just
/// logs the refusal and waits for tomorrow.
pub fn spawn_daily_kickoff(
    handle: PollerHandle,
    at: NaiveTime,
    tz: FixedOffset,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let wait = until_next(Utc::now().with_timezone(&tz).time(), at);
            tokio::time::sleep(wait).await;
            tracing::info!(gate = %handle.name(), "daily sync kick-off");
            let _ = handle.trigger_sync();
        }
    })
}

/// Time until the next occurrence of `at` in the local clock frame.
fn until_next(now_local: NaiveTime, at: NaiveTime) -> Duration {
    let delta = if now_local < at {
        at - now_local
    } else {
        ChronoDuration::days(1) - (now_local - at)
    };
    delta.to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32, s: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, s).unwrap()
    }

    #[test]
    fn kickoff_later_today_when_time_not_yet_reached() {
        assert_eq!(
            until_next(t(18, 0, 0), t(19, 0, 0)),
            Duration::from_secs(60 * 60)
        );
    }

    #[test]
    fn kickoff_rolls_to_tomorrow_once_passed() {
        assert_eq!(
            until_next(t(19, 0, 1), t(19, 0, 0)),
            Duration::from_secs(24 * 60 * 60 - 1)
        );
    }

    #[test]
    fn kickoff_exactly_at_time_waits_a_full_day() {
        assert_eq!(
            until_next(t(19, 0, 0), t(19, 0, 0)),
            Duration::from_secs(24 * 60 * 60)
        );
    }
}
