//! Heartbeat / liveness timer
//!
//! Fires `on_tick` every interval while running, and `on_expired` on every
//! tick where no `reset()` happened since the previous tick. The alive flag is
//! cleared by each tick, so a single early `reset()` does not keep the timer
//! satisfied forever.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::validate_timeout;
use crate::error::TransportError;

type Callback = Arc<dyn Fn() + Send + Sync>;

struct HeartbeatState {
    interval: Duration,
    task: Option<JoinHandle<()>>,
}

/// Periodic tick/expired callback pair
pub struct Heartbeat {
    state: Mutex<HeartbeatState>,
    received: Arc<AtomicBool>,
    on_tick: Option<Callback>,
    on_expired: Option<Callback>,
}

impl Heartbeat {
    /// Create a stopped heartbeat. The interval must be a positive finite value.
    pub fn new(interval: Duration) -> Result<Self, TransportError> {
        validate_timeout(interval)?;
        Ok(Self {
            state: Mutex::new(HeartbeatState { interval, task: None }),
            received: Arc::new(AtomicBool::new(false)),
            on_tick: None,
            on_expired: None,
        })
    }

    /// Callback run on every tick.
    pub fn on_tick<F>(mut self, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_tick = Some(Arc::new(callback));
        self
    }

    /// Callback run on ticks not preceded by a `reset()`.
    pub fn on_expired<F>(mut self, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_expired = Some(Arc::new(callback));
        self
    }

    pub fn interval(&self) -> Duration {
        self.state.lock().interval
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().task.is_some()
    }

    /// Start ticking. Returns `false` if already running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> bool {
        let mut state = self.state.lock();
        if state.task.is_some() {
            return false;
        }
        state.task = Some(self.spawn(state.interval));
        true
    }

    /// Stop ticking. Returns `false` if not running.
    pub fn stop(&self) -> bool {
        let mut state = self.state.lock();
        match state.task.take() {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }

    /// Mark an alive signal. Callable from any thread.
    pub fn reset(&self) {
        self.received.store(true, Ordering::Release);
    }

    /// Swap the interval, keeping the running/stopped state.
    ///
    /// Returns `false` when the value is unchanged.
    pub fn set_interval(&self, interval: Duration) -> Result<bool, TransportError> {
        validate_timeout(interval)?;
        let mut state = self.state.lock();
        if state.interval == interval {
            return Ok(false);
        }
        state.interval = interval;
        if let Some(task) = state.task.take() {
            task.abort();
            state.task = Some(self.spawn(interval));
        }
        Ok(true)
    }

    fn spawn(&self, interval: Duration) -> JoinHandle<()> {
        let received = self.received.clone();
        let on_tick = self.on_tick.clone();
        let on_expired = self.on_expired.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Some(tick) = &on_tick {
                    tick();
                }
                if !received.swap(false, Ordering::AcqRel) {
                    if let Some(expired) = &on_expired {
                        expired();
                    }
                }
            }
        })
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        if let Some(task) = self.state.get_mut().task.take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for Heartbeat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Heartbeat")
            .field("interval", &state.interval)
            .field("running", &state.task.is_some())
            .finish()
    }
}
