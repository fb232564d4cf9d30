//! Expiration Reaper
//!
//! Periodically claims expired, unlocked sessions one at a time, notifies the
//! registered end-of-session callback and deletes them.
//!
//! Per instance the reaper moves `Idle -> Sweeping -> Idle` on each timer tick
//! and ends in `Stopped` once disposed. A tick that finds a sweep in progress
//! is dropped. Nothing coordinates sweeps across processes: the store's claim
//! is atomic, so concurrent sweeps never double-claim a record.

pub mod tick;

use chrono::Utc;
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::error::{SessionResult, SessionStateError};
use crate::session::{LockToken, SessionPayload};
use crate::store::SessionStore;

pub use tick::TickHandler;

pub const MIN_POLLING_INTERVAL_SECS: u64 = 1;
pub const MAX_POLLING_INTERVAL_SECS: u64 = 120;
pub const DEFAULT_POLLING_INTERVAL_SECS: u64 = 2;

/// Error returned by an end-of-session callback
pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

/// End-of-session notification `(session id, payload)`
pub type SessionEndCallback = Arc<dyn Fn(&str, &SessionPayload) -> Result<(), CallbackError> + Send + Sync>;

/// Decides whether registering a callback may start the timer
pub type StartGate = Arc<dyn Fn() -> bool + Send + Sync>;

/// Wrap a closure as a [`SessionEndCallback`]
pub fn session_end_callback<F>(f: F) -> SessionEndCallback
where
    F: Fn(&str, &SessionPayload) -> Result<(), CallbackError> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Check a polling interval against the accepted range
pub fn validate_polling_interval(secs: u64) -> SessionResult<Duration> {
    if secs < MIN_POLLING_INTERVAL_SECS {
        return Err(SessionStateError::Configuration(
            "The polling interval specified is too small.".into(),
        ));
    }
    if secs > MAX_POLLING_INTERVAL_SECS {
        return Err(SessionStateError::Configuration(
            "The polling interval specified is too high.".into(),
        ));
    }
    Ok(Duration::from_secs(secs))
}

/// Sweep state of one reaper instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaperState {
    Idle,
    Sweeping,
    /// Disposed; no further sweeps
    Stopped,
}

/// What a single tick did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// A sweep ran and removed this many sessions
    Swept(usize),
    /// Another sweep was in progress
    Skipped,
    /// The reaper is disposed
    Stopped,
    /// The sweep aborted; the next tick retries
    Failed,
}

/// Resets `Sweeping` to `Idle` when a sweep ends, even by unwinding
struct SweepGuard<'a> {
    state: &'a Mutex<ReaperState>,
}

impl Drop for SweepGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if *state == ReaperState::Sweeping {
            *state = ReaperState::Idle;
        }
    }
}

/// The sweep loop and its guard, shared with the timer task
pub struct Sweeper {
    store: Arc<SessionStore>,
    callback: RwLock<Option<SessionEndCallback>>,
    state: Mutex<ReaperState>,
    /// Set after a failed sweep has been reported, until a sweep succeeds
    failure_reported: AtomicBool,
}

impl Sweeper {
    fn new(store: Arc<SessionStore>) -> Self {
        Self {
            store,
            callback: RwLock::new(None),
            state: Mutex::new(ReaperState::Idle),
            failure_reported: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> ReaperState {
        *self.state.lock()
    }

    fn is_stopped(&self) -> bool {
        self.state() == ReaperState::Stopped
    }

    /// Replace the end-of-session callback without touching the timer
    pub fn set_callback(&self, callback: Option<SessionEndCallback>) {
        *self.callback.write() = callback;
    }

    pub fn has_callback(&self) -> bool {
        self.callback.read().is_some()
    }

    fn stop(&self) {
        *self.state.lock() = ReaperState::Stopped;
    }

    /// Handle one timer tick
    pub fn tick(&self) -> TickOutcome {
        {
            let mut state = self.state.lock();
            match *state {
                ReaperState::Stopped => return TickOutcome::Stopped,
                ReaperState::Sweeping => {
                    debug!("Expired session sweep already in progress; tick dropped");
                    return TickOutcome::Skipped;
                }
                ReaperState::Idle => *state = ReaperState::Sweeping,
            }
        }

        let result = {
            let _guard = SweepGuard { state: &self.state };
            self.sweep()
        };

        match result {
            Ok(reaped) => {
                if self.failure_reported.swap(false, Ordering::SeqCst) {
                    info!("Expired session processing recovered");
                }
                if reaped > 0 {
                    debug!("Removed {} expired sessions", reaped);
                }
                TickOutcome::Swept(reaped)
            }
            Err(e) => {
                if self.failure_reported.swap(true, Ordering::SeqCst) {
                    debug!("Expired session processing still failing: {}", e);
                } else {
                    error!(
                        "Failed processing expired sessions. These will be retried according to the polling interval: {}",
                        e
                    );
                }
                TickOutcome::Failed
            }
        }
    }

    /// Claim and remove expired sessions until none remain or the reaper stops
    fn sweep(&self) -> SessionResult<usize> {
        let mut reaped = 0;

        while !self.is_stopped() {
            let token = LockToken::generate(Utc::now());
            let expired = match self.store.reap_expired(&token) {
                Ok(Some(expired)) => expired,
                Ok(None) => break,
                Err(SessionStateError::CorruptSession { id, source }) => {
                    error!(
                        "Expired session {} has a malformed payload and is removed without notification: {}",
                        id, source
                    );
                    self.store.remove(&id, token.id())?;
                    reaped += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };

            self.execute_session_end(&expired.id, &expired.payload);
            self.store.remove(&expired.id, token.id())?;
            reaped += 1;
        }

        Ok(reaped)
    }

    /// Invoke the end-of-session callback, logging and swallowing failures
    pub fn execute_session_end(&self, id: &str, payload: &SessionPayload) {
        let Some(callback) = self.callback.read().clone() else {
            return;
        };

        match panic::catch_unwind(AssertUnwindSafe(|| callback(id, payload))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Error executing the session end callback. Id: {}: {}", id, e),
            Err(_) => error!("Session end callback panicked. Id: {}", id),
        }
    }
}

/// Timer-driven reaper owned by one store instance
pub struct ExpirationReaper {
    sweeper: Arc<Sweeper>,
    interval: Duration,
    tick_handler: TickHandler,
    runtime: Option<Handle>,
    timer: Mutex<Option<JoinHandle<()>>>,
    start_gate: Option<StartGate>,
    tried_to_start_timer: AtomicBool,
}

impl ExpirationReaper {
    /// Create a reaper polling every `polling_interval_secs` (1..=120).
    ///
    /// The timer runs on the Tokio runtime current at construction, if any;
    /// see [`ExpirationReaper::with_runtime`].
    pub fn new(store: Arc<SessionStore>, polling_interval_secs: u64) -> SessionResult<Self> {
        let interval = validate_polling_interval(polling_interval_secs)?;

        Ok(Self {
            sweeper: Arc::new(Sweeper::new(store)),
            interval,
            tick_handler: tick::offload(),
            runtime: Handle::try_current().ok(),
            timer: Mutex::new(None),
            start_gate: None,
            tried_to_start_timer: AtomicBool::new(false),
        })
    }

    pub fn with_tick_handler(mut self, handler: TickHandler) -> Self {
        self.tick_handler = handler;
        self
    }

    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn with_start_gate(mut self, gate: StartGate) -> Self {
        self.start_gate = Some(gate);
        self
    }

    pub fn polling_interval(&self) -> Duration {
        self.interval
    }

    pub fn sweeper(&self) -> &Arc<Sweeper> {
        &self.sweeper
    }

    pub fn state(&self) -> ReaperState {
        self.sweeper.state()
    }

    /// Run one tick on the calling thread
    pub fn tick(&self) -> TickOutcome {
        self.sweeper.tick()
    }

    /// Register the end-of-session callback.
    ///
    /// A callback starts the timer (subject to the start gate) and returns
    /// `true`; `None` stops the timer and returns `false`.
    pub fn set_expire_callback(&self, callback: Option<SessionEndCallback>) -> bool {
        let enabled = callback.is_some();
        self.sweeper.set_callback(callback);

        if !enabled {
            self.stop_timer();
            return false;
        }

        self.tried_to_start_timer.store(true, Ordering::SeqCst);
        let allowed = self.start_gate.as_ref().map(|gate| gate()).unwrap_or(true);
        if allowed {
            if let Err(e) = self.start_timer() {
                warn!("Expiration timer not started: {}", e);
            }
        } else {
            debug!("Start gate declined to start the expiration timer");
        }
        true
    }

    pub fn has_expire_callback(&self) -> bool {
        self.sweeper.has_callback()
    }

    /// Start the timer if it is not already running
    pub fn start_timer(&self) -> SessionResult<()> {
        if self.sweeper.is_stopped() {
            return Err(SessionStateError::Runtime("reaper is disposed".into()));
        }

        let mut timer = self.timer.lock();
        if timer.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            return Ok(());
        }

        let runtime = self
            .runtime
            .as_ref()
            .ok_or_else(|| SessionStateError::Runtime("no Tokio runtime to drive the expiration timer".into()))?;

        let sweeper = self.sweeper.clone();
        let handler = self.tick_handler.clone();
        let period = self.interval;

        *timer = Some(runtime.spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                if sweeper.is_stopped() {
                    break;
                }
                handler(sweeper.clone());
            }

            debug!("Expiration timer stopped");
        }));

        info!("Expiration timer started ({}s interval)", period.as_secs());
        Ok(())
    }

    pub fn stop_timer(&self) {
        if let Some(handle) = self.timer.lock().take() {
            handle.abort();
            debug!("Expiration timer cancelled");
        }
    }

    pub fn is_timer_enabled(&self) -> bool {
        self.timer
            .lock()
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    pub fn tried_to_start_timer(&self) -> bool {
        self.tried_to_start_timer.load(Ordering::SeqCst)
    }

    /// Stop for good. A sweep in flight finishes its current claim cycle and exits.
    pub fn dispose(&self) {
        self.sweeper.stop();
        self.stop_timer();
    }
}

impl Drop for ExpirationReaper {
    fn drop(&mut self) {
        self.dispose();
    }
}
