//! Connection-manager state machine (§4.H): tracks reconnect attempts,
//! computes backoff delays, and detects staleness. This module holds no
//! transport or socket state of its own — it is driven by
//! [`crate::orchestrator::Connection`], which owns the actual socket and
//! reacts to the actions this type reports.
//!
//! The backoff formula (`min(maxDelay, baseDelay · 2^n · (1 + Uniform(0,
//! jitter)))`) is hand-rolled with [`rand`] rather than built on `backon`:
//! `backon` retries a single fallible closure with its own jitter strategy,
//! which does not fit a long-lived state machine that needs this exact
//! formula and needs to report state transitions as they happen.

use std::time::{Duration, Instant};

use rand::Rng as _;

use crate::config::RelayClientConfig;

/// Coarse connection-manager state (§4.H).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionManagerState {
    /// No transport, not attempting to reconnect.
    Disconnected,
    /// A transport is live and authenticated.
    Connected,
    /// A transport failed and a reconnect attempt is scheduled or running.
    Reconnecting,
}

/// A `stateChange(new, prev)` event (§4.H).
#[derive(Debug, Clone, Copy)]
pub struct StateChange {
    /// The state the manager was in before this transition.
    pub previous: ConnectionManagerState,
    /// The state the manager is in now.
    pub current: ConnectionManagerState,
}

/// What the owning [`crate::orchestrator::Connection`] should do in response
/// to a manager event.
pub(crate) enum ManagerAction {
    /// Wait `delay`, then attempt to reconnect.
    ScheduleReconnect { delay: Duration, change: StateChange },
    /// The failure was not retryable, or the attempt budget ran out; stop
    /// trying and surface the error.
    GiveUp { change: StateChange },
}

pub(crate) struct ConnectionManager {
    state: ConnectionManagerState,
    attempt: u32,
    last_event_at: Option<Instant>,
    saw_heartbeat: bool,
    base_delay: Duration,
    max_delay: Duration,
    jitter: f64,
    max_attempts: u32,
    stale_threshold: Duration,
}

impl ConnectionManager {
    pub(crate) fn new(config: &RelayClientConfig) -> Self {
        Self {
            state: ConnectionManagerState::Disconnected,
            attempt: 0,
            last_event_at: None,
            saw_heartbeat: false,
            base_delay: config.reconnect_base_delay,
            max_delay: config.reconnect_max_delay,
            jitter: config.reconnect_jitter,
            max_attempts: config.reconnect_max_attempts,
            stale_threshold: config.stale_threshold,
        }
    }

    pub(crate) fn state(&self) -> ConnectionManagerState {
        self.state
    }

    fn transition(&mut self, next: ConnectionManagerState) -> StateChange {
        let previous = self.state;
        self.state = next;
        tracing::info!(?previous, current = ?next, "connection manager state change");
        StateChange { previous, current: next }
    }

    /// `markConnected()`: resets the attempt counter and staleness tracking.
    pub(crate) fn mark_connected(&mut self, now: Instant) -> StateChange {
        self.attempt = 0;
        self.saw_heartbeat = false;
        self.last_event_at = Some(now);
        self.transition(ConnectionManagerState::Connected)
    }

    /// `recordEvent()`/`recordHeartbeat()`: refreshes the staleness clock.
    /// Heartbeats additionally arm stale detection — §4.H requires at least
    /// one heartbeat to have been observed before a connection can be
    /// declared stale.
    pub(crate) fn record_event(&mut self, now: Instant, is_heartbeat: bool) {
        self.last_event_at = Some(now);
        if is_heartbeat {
            self.saw_heartbeat = true;
        }
    }

    /// `handleError`/`handleClose`/`forceReconnect`: decides whether to back
    /// off and retry, or to give up, given whether the cause is retryable.
    pub(crate) fn handle_failure(&mut self, now: Instant, retryable: bool) -> ManagerAction {
        if !retryable {
            let change = self.transition(ConnectionManagerState::Disconnected);
            return ManagerAction::GiveUp { change };
        }
        match self.next_delay() {
            Some(delay) => {
                tracing::debug!(?delay, attempt = self.attempt, "scheduling reconnect");
                let change = self.transition(ConnectionManagerState::Reconnecting);
                ManagerAction::ScheduleReconnect { delay, change }
            }
            None => {
                let change = self.transition(ConnectionManagerState::Disconnected);
                ManagerAction::GiveUp { change }
            }
        }
    }

    /// `min(maxDelay, baseDelay * 2^n * (1 + Uniform(0, jitter)))`, `n` being
    /// the number of attempts already made. Returns `None` once the attempt
    /// budget is exhausted.
    fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        let n = self.attempt;
        self.attempt += 1;
        let exponential = self.base_delay.as_secs_f64() * 2f64.powi(n as i32);
        let jitter_factor = if self.jitter > 0.0 { 1.0 + rand::thread_rng().gen_range(0.0..self.jitter) } else { 1.0 };
        let delay = (exponential * jitter_factor).min(self.max_delay.as_secs_f64());
        Some(Duration::from_secs_f64(delay.max(0.0)))
    }

    /// Whether the connection should be considered stale at `now`, per the
    /// periodic check described in §4.H.
    pub(crate) fn is_stale(&self, now: Instant) -> bool {
        self.saw_heartbeat && self.last_event_at.is_some_and(|last| now.duration_since(last) > self.stale_threshold)
    }

    /// `stop()`: unconditionally returns to `disconnected`, clearing any
    /// pending reconnect attempt's significance (the caller is expected to
    /// drop whatever timer or task it was waiting on).
    pub(crate) fn stop(&mut self) -> StateChange {
        self.transition(ConnectionManagerState::Disconnected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_caps_at_max_delay_and_then_gives_up() {
        let mut manager = ConnectionManager::new(&RelayClientConfig::default());
        let now = Instant::now();
        let mut delays = Vec::new();
        for _ in 0..manager.max_attempts {
            match manager.handle_failure(now, true) {
                ManagerAction::ScheduleReconnect { delay, .. } => delays.push(delay),
                ManagerAction::GiveUp { .. } => panic!("should not give up within the attempt budget"),
            }
        }
        assert!(delays.iter().all(|d| *d <= manager.max_delay));
        assert!(matches!(manager.handle_failure(now, true), ManagerAction::GiveUp { .. }));
    }

    #[test]
    fn non_retryable_failure_gives_up_immediately_without_consuming_attempts() {
        let mut manager = ConnectionManager::new(&RelayClientConfig::default());
        let now = Instant::now();
        assert!(matches!(manager.handle_failure(now, false), ManagerAction::GiveUp { .. }));
        assert_eq!(manager.attempt, 0);
    }

    #[test]
    fn mark_connected_resets_attempt_counter() {
        let mut manager = ConnectionManager::new(&RelayClientConfig::default());
        let now = Instant::now();
        manager.handle_failure(now, true);
        manager.mark_connected(now);
        assert_eq!(manager.attempt, 0);
        assert_eq!(manager.state(), ConnectionManagerState::Connected);
    }

    #[test]
    fn stale_detection_requires_a_prior_heartbeat() {
        let mut manager = ConnectionManager::new(&RelayClientConfig::default());
        let now = Instant::now();
        manager.mark_connected(now);
        let later = now + Duration::from_secs(100);
        assert!(!manager.is_stale(later), "no heartbeat observed yet");
        manager.record_event(now, true);
        assert!(manager.is_stale(later));
    }

    #[test]
    fn fresh_heartbeat_is_not_stale() {
        let mut manager = ConnectionManager::new(&RelayClientConfig::default());
        let now = Instant::now();
        manager.mark_connected(now);
        manager.record_event(now, true);
        assert!(!manager.is_stale(now + Duration::from_secs(1)));
    }
}
