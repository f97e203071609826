//! Poll timeouts.
//!
//! This module provides:
//! - [`Timer`] - the seam the engine uses to arm and disarm poll deadlines
//! - [`PollTimeoutConfig`] - base duration, backoff and jitter for deadlines
//! - [`TimeoutScheduler`] - tokio-backed timer posting [`Event::Timeout`]
//! - [`ManualTimer`] - timer driven by hand, for tests and simulations
//!
//! Consecutive expirations grow the next deadline according to the backoff
//! mode; a poll that completes before its deadline resets the backoff.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::engine::Event;

/// Arms and disarms the deadline of outstanding polls
pub trait Timer: Send + Sync {
    /// Start the deadline for `request_id`
    fn register(&self, request_id: u32);

    /// Stop the deadline for `request_id`; unknown IDs are ignored
    fn cancel(&self, request_id: u32);
}

/// Backoff strategy for consecutive expirations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum BackoffMode {
    /// timeout = base + delta * expirations
    #[default]
    Linear,
    /// timeout = base * 2^min(expirations, max_exponent)
    Exponential {
        /// Cap on the exponent
        max_exponent: u32,
    },
}

impl BackoffMode {
    /// Exponential backoff capped at 2^6
    pub fn exponential() -> Self {
        BackoffMode::Exponential { max_exponent: 6 }
    }
}

/// Deadline configuration for outstanding polls
#[derive(Debug, Clone, PartialEq)]
pub struct PollTimeoutConfig {
    /// Deadline with no recent expirations
    pub base: Duration,
    /// Growth per consecutive expiration (linear backoff)
    pub delta: Duration,
    /// Upper bound on any deadline
    pub max_timeout: Duration,
    /// Growth strategy
    pub backoff_mode: BackoffMode,
    /// Extra random delay as a fraction of the deadline, in `[0.0, 0.5]`
    pub jitter_percent: f64,
}

impl Default for PollTimeoutConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(2000),
            delta: Duration::from_millis(500),
            max_timeout: Duration::from_secs(30),
            backoff_mode: BackoffMode::Linear,
            jitter_percent: 0.10,
        }
    }
}

impl PollTimeoutConfig {
    /// Short deadlines without jitter, for tests
    pub fn fast() -> Self {
        Self {
            base: Duration::from_millis(50),
            delta: Duration::from_millis(10),
            max_timeout: Duration::from_secs(1),
            backoff_mode: BackoffMode::Linear,
            jitter_percent: 0.0,
        }
    }

    /// Set the backoff mode
    pub fn with_backoff_mode(mut self, mode: BackoffMode) -> Self {
        self.backoff_mode = mode;
        self
    }

    /// Set the jitter fraction, clamped to `[0.0, 0.5]`
    pub fn with_jitter(mut self, percent: f64) -> Self {
        self.jitter_percent = percent.clamp(0.0, 0.5);
        self
    }

    /// Deadline after `expirations` consecutive timeouts
    pub fn timeout_for(&self, expirations: u64) -> Duration {
        let raw = match self.backoff_mode {
            BackoffMode::Linear => {
                let steps = u32::try_from(expirations).unwrap_or(u32::MAX);
                self.base.saturating_add(self.delta.saturating_mul(steps))
            }
            BackoffMode::Exponential { max_exponent } => {
                let exponent = expirations.min(max_exponent as u64).min(31) as u32;
                self.base.saturating_mul(1u32 << exponent)
            }
        };

        let with_jitter = if self.jitter_percent > 0.0 {
            let factor = 1.0 + rand::thread_rng().gen::<f64>() * self.jitter_percent;
            Duration::from_secs_f64(raw.as_secs_f64() * factor)
        } else {
            raw
        };

        with_jitter.min(self.max_timeout)
    }
}

/// Counters for deadline monitoring
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeoutMetrics {
    /// Deadlines armed
    pub registered: u64,
    /// Deadlines that expired
    pub fired: u64,
    /// Deadlines disarmed before expiring
    pub cancelled: u64,
}

/// Tokio timer posting [`Event::Timeout`] to the engine's event queue
pub struct TimeoutScheduler {
    config: PollTimeoutConfig,
    event_tx: mpsc::Sender<Event>,
    /// Armed deadlines, keyed by request ID, with the arming token
    pending: Arc<Mutex<HashMap<u32, u64>>>,
    next_token: AtomicU64,
    /// Expirations since the last poll completed in time
    consecutive: Arc<AtomicU64>,
    metrics: Arc<Mutex<TimeoutMetrics>>,
}

impl TimeoutScheduler {
    /// Create a scheduler posting expirations to `event_tx`
    pub fn new(config: PollTimeoutConfig, event_tx: mpsc::Sender<Event>) -> Self {
        Self {
            config,
            event_tx,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_token: AtomicU64::new(0),
            consecutive: Arc::new(AtomicU64::new(0)),
            metrics: Arc::new(Mutex::new(TimeoutMetrics::default())),
        }
    }

    /// Deadline configuration
    pub fn config(&self) -> &PollTimeoutConfig {
        &self.config
    }

    /// Number of armed deadlines
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Expirations since the last poll completed in time
    pub fn consecutive_timeouts(&self) -> u64 {
        self.consecutive.load(Ordering::SeqCst)
    }

    /// Snapshot of the counters
    pub fn metrics(&self) -> TimeoutMetrics {
        *self.metrics.lock()
    }

    /// Disarm every deadline
    pub fn cancel_all(&self) {
        self.pending.lock().clear();
    }
}

impl Timer for TimeoutScheduler {
    fn register(&self, request_id: u32) {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!(request_id, "No tokio runtime; poll deadline not armed");
                return;
            }
        };

        let duration = self.config.timeout_for(self.consecutive_timeouts());
        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        self.pending.lock().insert(request_id, token);
        self.metrics.lock().registered += 1;
        debug!(
            request_id,
            duration_ms = duration.as_millis() as u64,
            "Scheduling poll timeout"
        );

        let pending = Arc::clone(&self.pending);
        let consecutive = Arc::clone(&self.consecutive);
        let metrics = Arc::clone(&self.metrics);
        let event_tx = self.event_tx.clone();
        handle.spawn(async move {
            tokio::time::sleep(duration).await;

            let expired = {
                let mut pending = pending.lock();
                match pending.get(&request_id) {
                    Some(armed) if *armed == token => {
                        pending.remove(&request_id);
                        true
                    }
                    _ => false,
                }
            };
            if !expired {
                return;
            }

            consecutive.fetch_add(1, Ordering::SeqCst);
            metrics.lock().fired += 1;
            trace!(request_id, "Poll timeout fired");
            if event_tx.send(Event::Timeout { request_id }).await.is_err() {
                debug!(request_id, "Event queue closed; dropping timeout");
            }
        });
    }

    fn cancel(&self, request_id: u32) {
        if self.pending.lock().remove(&request_id).is_some() {
            self.consecutive.store(0, Ordering::SeqCst);
            self.metrics.lock().cancelled += 1;
            trace!(request_id, "Cancelled poll timeout");
        }
    }
}

/// Timer whose deadlines only expire when told to
#[derive(Debug, Default)]
pub struct ManualTimer {
    pending: Mutex<BTreeSet<u32>>,
}

impl ManualTimer {
    /// Create a timer with no armed deadlines
    pub fn new() -> Self {
        Self::default()
    }

    /// Armed request IDs in ascending order
    pub fn pending(&self) -> Vec<u32> {
        self.pending.lock().iter().copied().collect()
    }

    /// Whether `request_id` is armed
    pub fn is_pending(&self, request_id: u32) -> bool {
        self.pending.lock().contains(&request_id)
    }

    /// Disarm every deadline, returning the expired request IDs
    pub fn expire_all(&self) -> Vec<u32> {
        let mut pending = self.pending.lock();
        let expired = pending.iter().copied().collect();
        pending.clear();
        expired
    }
}

impl Timer for ManualTimer {
    fn register(&self, request_id: u32) {
        self.pending.lock().insert(request_id);
    }

    fn cancel(&self, request_id: u32) {
        self.pending.lock().remove(&request_id);
    }
}
