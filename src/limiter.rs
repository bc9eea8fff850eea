//! Rate-aware concurrency limiter.
//!
//! Bounds in-flight provider calls and adapts the bound with AIMD, the way
//! TCP congestion control does: +1 slot after a success, halve on a rate
//! limit, at most one adjustment per cooldown window.
//!
//! The limiter is shared across runners as an explicit `Arc` handle. All state
//! transitions happen inside one short critical section that is never held
//! across an `.await`, so acquire/release/adjust are atomic with respect to
//! each other.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::oneshot;
use tokio::time::Instant;

static RATE_LIMIT_MESSAGE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)429|rate limit|too many requests").expect("valid regex"));

/// Whether an error message looks like a provider throttling response.
pub fn is_rate_limit_message(message: &str) -> bool {
    RATE_LIMIT_MESSAGE.is_match(message)
}

#[derive(Debug, Clone)]
pub struct LimiterConfig {
    /// Starting concurrency.
    pub initial: usize,
    pub min: usize,
    pub max: usize,
    /// Minimum time between two adjustments.
    pub cooldown: Duration,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            initial: 100,
            min: 5,
            max: 500,
            cooldown: Duration::from_millis(2_000),
        }
    }
}

impl LimiterConfig {
    pub fn with_initial(mut self, initial: usize) -> Self {
        self.initial = initial;
        self
    }
}

#[derive(Debug)]
struct State {
    concurrency: usize,
    running: usize,
    queue: VecDeque<oneshot::Sender<()>>,
    last_adjust: Option<Instant>,
}

/// AIMD concurrency limiter.
#[derive(Debug)]
pub struct ConcurrencyLimiter {
    min: usize,
    max: usize,
    cooldown: Duration,
    state: Mutex<State>,
}

/// Held while a call runs; returns the slot on drop.
#[derive(Debug)]
pub struct SlotGuard<'a> {
    limiter: &'a ConcurrencyLimiter,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.limiter.release();
    }
}

/// A queued waiter. If it is dropped after a slot was handed to it but
/// before it observed the hand-off, the slot goes back to the pool.
struct Waiter<'a> {
    limiter: &'a ConcurrencyLimiter,
    rx: Option<oneshot::Receiver<()>>,
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        if let Some(mut rx) = self.rx.take() {
            rx.close();
            if rx.try_recv().is_ok() {
                self.limiter.release();
            }
        }
    }
}

impl ConcurrencyLimiter {
    pub fn new(config: LimiterConfig) -> Self {
        let min = config.min.max(1);
        let max = config.max.max(min);
        Self {
            min,
            max,
            cooldown: config.cooldown,
            state: Mutex::new(State {
                concurrency: config.initial.clamp(min, max),
                running: 0,
                queue: VecDeque::new(),
                last_adjust: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // The state is plain counters; a panic mid-update cannot leave it
        // half-written, so a poisoned lock is still usable.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn current_concurrency(&self) -> usize {
        self.lock().concurrency
    }

    pub fn current_running(&self) -> usize {
        self.lock().running
    }

    pub fn queued(&self) -> usize {
        self.lock().queue.len()
    }

    /// Wait for a free slot.
    pub async fn acquire(&self) -> SlotGuard<'_> {
        let rx = {
            let mut state = self.lock();
            if state.running < state.concurrency {
                state.running += 1;
                return SlotGuard { limiter: self };
            }
            let (tx, rx) = oneshot::channel();
            state.queue.push_back(tx);
            rx
        };

        let mut waiter = Waiter {
            limiter: self,
            rx: Some(rx),
        };
        if let Some(rx) = waiter.rx.as_mut() {
            // The sender is only dropped by `drain`, which always sends first.
            let _ = rx.await;
        }
        waiter.rx = None;
        SlotGuard { limiter: self }
    }

    /// Run `f` once a slot is free, adapting concurrency on its outcome.
    ///
    /// The result (or error) of `f` is returned unchanged; the limiter never
    /// retries.
    pub async fn run<F, T, E>(&self, f: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let _slot = self.acquire().await;
        let result = f.await;
        match &result {
            Ok(_) => self.on_success(),
            Err(err) if is_rate_limit_message(&err.to_string()) => self.on_rate_limit(),
            Err(_) => {}
        }
        result
    }

    /// Report a rate limit observed outside `run`, e.g. by retry logic.
    pub fn notify_rate_limit(&self) {
        self.on_rate_limit();
    }

    fn cooldown_elapsed(&self, state: &State, now: Instant) -> bool {
        match state.last_adjust {
            Some(at) => now.duration_since(at) >= self.cooldown,
            None => true,
        }
    }

    fn on_success(&self) {
        let now = Instant::now();
        let mut state = self.lock();
        if !self.cooldown_elapsed(&state, now) || state.concurrency >= self.max {
            return;
        }
        state.concurrency += 1;
        state.last_adjust = Some(now);
        tracing::debug!(concurrency = state.concurrency, "limiter increased concurrency");
        self.drain(&mut state);
    }

    fn on_rate_limit(&self) {
        let now = Instant::now();
        let mut state = self.lock();
        if !self.cooldown_elapsed(&state, now) {
            return;
        }
        let previous = state.concurrency;
        state.concurrency = (previous / 2).max(self.min);
        state.last_adjust = Some(now);
        tracing::debug!(
            from = previous,
            to = state.concurrency,
            "limiter backed off after rate limit"
        );
    }

    fn release(&self) {
        let mut state = self.lock();
        state.running = state.running.saturating_sub(1);
        self.drain(&mut state);
    }

    /// Hand free slots to queued waiters in FIFO order.
    fn drain(&self, state: &mut State) {
        while state.running < state.concurrency {
            let Some(tx) = state.queue.pop_front() else {
                break;
            };
            // Count the slot before sending so a dropped waiter's release
            // (see `Waiter::drop`) balances it.
            state.running += 1;
            if tx.send(()).is_err() {
                state.running -= 1;
            }
        }
    }
}

impl Default for ConcurrencyLimiter {
    fn default() -> Self {
        Self::new(LimiterConfig::default())
    }
}
