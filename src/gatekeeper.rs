//! Gatekeeper for the challenge bypass service.
//!
//! The bypass service runs a real browser per request, so every caller in
//! the process shares one `Gatekeeper`: a concurrency limit with a bounded
//! FIFO wait queue, a circuit breaker fed by explicit outcome reports, and
//! an hourly request quota per client identity.
//!
//! # Circuit
//!
//! ```text
//! Closed → Open:   failures >= threshold, or N consecutive slow responses
//! Open   → Closed: cooldown elapsed (no half-open probe)
//! ```
//!
//! A success decrements the failure counter by one rather than resetting
//! it, so a circuit that was close to tripping recovers gradually. After the
//! cooldown the counter sits one below the threshold and a single further
//! failure reopens the circuit.

use crate::config::GatekeeperConfig;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const QUOTA_WINDOW: Duration = Duration::from_secs(3600);
const IDENTITY_PRUNE_THRESHOLD: usize = 4096;

/// Why a slot was not granted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    CircuitOpen,
    RateLimited,
    QueueFull,
    Timeout,
    Aborted,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RejectReason::CircuitOpen => "circuit_open",
            RejectReason::RateLimited => "rate_limited",
            RejectReason::QueueFull => "queue_full",
            RejectReason::Timeout => "timeout",
            RejectReason::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// Structured refusal returned by [`Gatekeeper::acquire_slot`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("{reason}")]
pub struct Rejection {
    pub reason: RejectReason,
    /// Remaining hourly quota for the identity, set for `rate_limited`
    pub remaining: Option<u32>,
    /// Earliest point a retry can succeed, when known
    #[serde(skip)]
    pub retry_after: Option<Duration>,
}

impl Rejection {
    fn new(reason: RejectReason) -> Self {
        Self {
            reason,
            remaining: None,
            retry_after: None,
        }
    }

    /// Whether the caller should surface a "busy, try later" signal
    pub fn is_overload(&self) -> bool {
        matches!(
            self.reason,
            RejectReason::CircuitOpen | RejectReason::RateLimited | RejectReason::QueueFull
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CircuitState {
    Closed,
    Open,
}

#[derive(Debug, Clone, Serialize)]
pub struct GatekeeperStatus {
    pub active_calls: usize,
    pub max_concurrent: usize,
    pub queued: usize,
    pub queue_max_depth: usize,
    pub circuit: CircuitState,
    pub circuit_failures: u32,
    pub slow_responses: u32,
    pub circuit_open_remaining_ms: Option<u64>,
    pub circuit_trips: u64,
    pub tracked_identities: usize,
}

struct Waiter {
    id: u64,
    grant: oneshot::Sender<()>,
}

struct IdentityWindow {
    count: u32,
    window_start: Instant,
}

#[derive(Default)]
struct State {
    active: usize,
    queue: VecDeque<Waiter>,
    next_waiter_id: u64,
    circuit_failures: u32,
    slow_responses: u32,
    circuit_opened_at: Option<Instant>,
    circuit_trips: u64,
    identities: HashMap<String, IdentityWindow>,
}

struct Inner {
    config: GatekeeperConfig,
    state: Mutex<State>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand the slot to the oldest live waiter, or free it.
    fn release_locked(state: &mut State) {
        while let Some(waiter) = state.queue.pop_front() {
            if waiter.grant.send(()).is_ok() {
                return;
            }
        }
        state.active = state.active.saturating_sub(1);
    }

    fn refresh_circuit(&self, state: &mut State, now: Instant) {
        if let Some(opened_at) = state.circuit_opened_at {
            if now.saturating_duration_since(opened_at) >= self.config.circuit_cooldown() {
                state.circuit_opened_at = None;
                state.circuit_failures = state
                    .circuit_failures
                    .min(self.config.circuit_failure_threshold.saturating_sub(1));
                state.slow_responses = 0;
                log::info!("Bypass circuit closed after {}ms cooldown", self.config.circuit_cooldown_ms);
            }
        }
    }

    fn trip(&self, state: &mut State, now: Instant, cause: &str) {
        if state.circuit_opened_at.is_some() {
            return;
        }
        state.circuit_opened_at = Some(now);
        state.circuit_trips += 1;
        log::warn!(
            "Bypass circuit opened ({}): failures={} slow={} cooldown={}ms",
            cause,
            state.circuit_failures,
            state.slow_responses,
            self.config.circuit_cooldown_ms
        );
    }

    fn record_failure(&self, kind: &str) {
        let mut state = self.lock();
        let now = Instant::now();
        self.refresh_circuit(&mut state, now);
        state.circuit_failures = state.circuit_failures.saturating_add(1);
        log::debug!("Bypass {} reported, failures={}", kind, state.circuit_failures);

        let threshold = self.config.circuit_failure_threshold;
        if threshold > 0 && state.circuit_failures >= threshold {
            self.trip(&mut state, now, kind);
        }
    }
}

/// Ticket for a caller waiting in the queue. Dropping an unsettled ticket
/// removes the waiter, or gives back a slot that was already handed over.
struct QueueTicket {
    inner: Arc<Inner>,
    id: u64,
    rx: oneshot::Receiver<()>,
    remaining: Option<u32>,
    settled: bool,
}

impl QueueTicket {
    fn granted(mut self) -> SlotPermit {
        self.settled = true;
        SlotPermit {
            inner: self.inner.clone(),
            remaining: self.remaining,
        }
    }

    /// Leave the queue for `reason`. A slot that was handed over while the
    /// timer or cancellation fired is kept.
    fn abandon(mut self, reason: RejectReason) -> Result<SlotPermit, Rejection> {
        let mut state = self.inner.lock();
        if let Some(pos) = state.queue.iter().position(|w| w.id == self.id) {
            state.queue.remove(pos);
            drop(state);
            self.settled = true;
            return Err(Rejection::new(reason));
        }
        drop(state);
        Ok(self.granted())
    }
}

impl Drop for QueueTicket {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut state = self.inner.lock();
        if let Some(pos) = state.queue.iter().position(|w| w.id == self.id) {
            state.queue.remove(pos);
        } else {
            Inner::release_locked(&mut state);
        }
    }
}

/// A granted bypass slot. Dropping it frees the slot for the next waiter.
pub struct SlotPermit {
    inner: Arc<Inner>,
    remaining: Option<u32>,
}

impl SlotPermit {
    /// Remaining hourly quota for the identity at grant time
    pub fn remaining_quota(&self) -> Option<u32> {
        self.remaining
    }

    pub fn release(self) {}
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        let mut state = self.inner.lock();
        Inner::release_locked(&mut state);
    }
}

impl fmt::Debug for SlotPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotPermit")
            .field("remaining", &self.remaining)
            .finish()
    }
}

/// Process-wide guard in front of the bypass service. Cheap to clone.
#[derive(Clone)]
pub struct Gatekeeper {
    inner: Arc<Inner>,
}

impl Gatekeeper {
    pub fn new(config: GatekeeperConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(State::default()),
            }),
        }
    }

    pub fn config(&self) -> &GatekeeperConfig {
        &self.inner.config
    }

    /// Acquire a slot, waiting up to `timeout` in the queue.
    pub async fn acquire_slot(
        &self,
        timeout: Duration,
        identity: Option<&str>,
    ) -> Result<SlotPermit, Rejection> {
        self.acquire(timeout, identity, None).await
    }

    /// Like [`acquire_slot`](Self::acquire_slot); cancelling `cancel` while
    /// queued resolves with `aborted`.
    pub async fn acquire_slot_cancellable(
        &self,
        timeout: Duration,
        identity: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<SlotPermit, Rejection> {
        self.acquire(timeout, identity, Some(cancel)).await
    }

    async fn acquire(
        &self,
        timeout: Duration,
        identity: Option<&str>,
        cancel: Option<&CancellationToken>,
    ) -> Result<SlotPermit, Rejection> {
        if cancel.map_or(false, CancellationToken::is_cancelled) {
            return Err(Rejection::new(RejectReason::Aborted));
        }

        let mut ticket = match self.try_enter(identity)? {
            Entry::Granted(permit) => return Ok(permit),
            Entry::Queued(ticket) => ticket,
        };

        let cancelled = async {
            match cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending::<()>().await,
            }
        };

        let wake = tokio::select! {
            res = tokio::time::timeout(timeout, &mut ticket.rx) => match res {
                Ok(Ok(())) => Wake::Granted,
                Ok(Err(_)) => Wake::Aborted,
                Err(_) => Wake::TimedOut,
            },
            _ = cancelled => Wake::Aborted,
        };

        match wake {
            Wake::Granted => Ok(ticket.granted()),
            Wake::TimedOut => {
                log::debug!("Bypass slot wait timed out after {}ms", timeout.as_millis());
                ticket.abandon(RejectReason::Timeout)
            }
            Wake::Aborted => ticket.abandon(RejectReason::Aborted),
        }
    }

    fn try_enter(&self, identity: Option<&str>) -> Result<Entry, Rejection> {
        let config = &self.inner.config;
        let mut state = self.inner.lock();
        let now = Instant::now();

        self.inner.refresh_circuit(&mut state, now);
        if let Some(opened_at) = state.circuit_opened_at {
            let elapsed = now.saturating_duration_since(opened_at);
            return Err(Rejection {
                reason: RejectReason::CircuitOpen,
                remaining: None,
                retry_after: Some(config.circuit_cooldown().saturating_sub(elapsed)),
            });
        }

        let limit = config.per_identity_hourly_limit;
        if let (Some(id), true) = (identity, limit > 0) {
            if let Some(window) = state.identities.get(id) {
                let age = now.saturating_duration_since(window.window_start);
                if age < QUOTA_WINDOW && window.count >= limit {
                    log::warn!("Bypass quota exhausted for identity {}", id);
                    return Err(Rejection {
                        reason: RejectReason::RateLimited,
                        remaining: Some(0),
                        retry_after: Some(QUOTA_WINDOW - age),
                    });
                }
            }
        }

        if state.active >= config.max_concurrent && state.queue.len() >= config.queue_max_depth {
            return Err(Rejection::new(RejectReason::QueueFull));
        }

        let mut remaining = None;
        if let (Some(id), true) = (identity, limit > 0) {
            if state.identities.len() > IDENTITY_PRUNE_THRESHOLD {
                prune_windows(&mut state.identities, now);
            }
            let window = state
                .identities
                .entry(id.to_string())
                .or_insert(IdentityWindow {
                    count: 0,
                    window_start: now,
                });
            if now.saturating_duration_since(window.window_start) >= QUOTA_WINDOW {
                window.count = 0;
                window.window_start = now;
            }
            window.count += 1;
            remaining = Some(limit.saturating_sub(window.count));
        }

        if state.active < config.max_concurrent {
            state.active += 1;
            return Ok(Entry::Granted(SlotPermit {
                inner: self.inner.clone(),
                remaining,
            }));
        }

        let id = state.next_waiter_id;
        state.next_waiter_id += 1;
        let (tx, rx) = oneshot::channel();
        state.queue.push_back(Waiter { id, grant: tx });
        log::debug!(
            "Bypass slot busy ({} active), queued waiter {} at depth {}",
            state.active,
            id,
            state.queue.len()
        );

        Ok(Entry::Queued(QueueTicket {
            inner: self.inner.clone(),
            id,
            rx,
            remaining,
            settled: false,
        }))
    }

    /// Report a completed call. Slow completions count against the circuit.
    pub fn report_success(&self, elapsed: Duration) {
        let inner = &self.inner;
        let mut state = inner.lock();
        let now = Instant::now();
        inner.refresh_circuit(&mut state, now);

        if elapsed >= inner.config.slow_response() {
            state.slow_responses = state.slow_responses.saturating_add(1);
            state.circuit_failures = state.circuit_failures.saturating_add(1);
            log::warn!(
                "Slow bypass response: {}ms (consecutive slow: {})",
                elapsed.as_millis(),
                state.slow_responses
            );
            let slow_threshold = inner.config.slow_response_threshold;
            let threshold = inner.config.circuit_failure_threshold;
            if slow_threshold > 0 && state.slow_responses >= slow_threshold {
                inner.trip(&mut state, now, "slow responses");
            } else if threshold > 0 && state.circuit_failures >= threshold {
                inner.trip(&mut state, now, "failures");
            }
        } else {
            state.slow_responses = 0;
            state.circuit_failures = state.circuit_failures.saturating_sub(1);
        }
    }

    pub fn report_failure(&self) {
        self.inner.record_failure("failure");
    }

    pub fn report_timeout(&self) {
        self.inner.record_failure("timeout");
    }

    pub fn circuit_state(&self) -> CircuitState {
        let mut state = self.inner.lock();
        self.inner.refresh_circuit(&mut state, Instant::now());
        if state.circuit_opened_at.is_some() {
            CircuitState::Open
        } else {
            CircuitState::Closed
        }
    }

    /// Remaining hourly quota for `identity`, `None` when quotas are off
    pub fn remaining_quota(&self, identity: &str) -> Option<u32> {
        let limit = self.inner.config.per_identity_hourly_limit;
        if limit == 0 {
            return None;
        }
        let state = self.inner.lock();
        let used = match state.identities.get(identity) {
            Some(w) if w.window_start.elapsed() < QUOTA_WINDOW => w.count,
            _ => 0,
        };
        Some(limit.saturating_sub(used))
    }

    /// Forget identities whose quota window has rolled over
    pub fn prune_identities(&self) -> usize {
        let mut state = self.inner.lock();
        prune_windows(&mut state.identities, Instant::now())
    }

    pub fn status(&self) -> GatekeeperStatus {
        let config = &self.inner.config;
        let mut state = self.inner.lock();
        let now = Instant::now();
        self.inner.refresh_circuit(&mut state, now);

        let remaining = state.circuit_opened_at.map(|opened_at| {
            config
                .circuit_cooldown()
                .saturating_sub(now.saturating_duration_since(opened_at))
                .as_millis() as u64
        });

        GatekeeperStatus {
            active_calls: state.active,
            max_concurrent: config.max_concurrent,
            queued: state.queue.len(),
            queue_max_depth: config.queue_max_depth,
            circuit: if remaining.is_some() {
                CircuitState::Open
            } else {
                CircuitState::Closed
            },
            circuit_failures: state.circuit_failures,
            slow_responses: state.slow_responses,
            circuit_open_remaining_ms: remaining,
            circuit_trips: state.circuit_trips,
            tracked_identities: state.identities.len(),
        }
    }
}

enum Entry {
    Granted(SlotPermit),
    Queued(QueueTicket),
}

enum Wake {
    Granted,
    TimedOut,
    Aborted,
}

fn prune_windows(identities: &mut HashMap<String, IdentityWindow>, now: Instant) -> usize {
    let before = identities.len();
    identities.retain(|_, w| now.saturating_duration_since(w.window_start) < QUOTA_WINDOW);
    before - identities.len()
}
