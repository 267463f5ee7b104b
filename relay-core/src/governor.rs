//! Adaptive push pacing and circuit breaking, per destination.
//!
//! Each destination carries its own interval between pushes and its own
//! breaker. The interval widens multiplicatively on every rejected or
//! transient failure (honouring a server retry-after hint) and tightens again
//! after a run of consecutive successes. Enough consecutive failures trip the
//! breaker: the destination is left alone until the cooldown elapses, then a
//! single probe decides whether it closes again or re-opens.
//!
//! State lives in a sharded map keyed by destination. Every read-modify-write
//! happens under that key's entry guard and never spans an await, so calls
//! for one destination are serialized while other destinations proceed.

use crate::types::DestinationId;
use dashmap::DashMap;
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq)]
pub struct GovernorPolicy {
    pub min_interval: Duration,
    pub baseline_interval: Duration,
    pub max_interval: Duration,
    pub backoff_factor: f64,
    pub recovery_factor: f64,
    pub recovery_successes: u32,
    pub breaker_threshold: u32,
    pub cooldown: Duration,
}

impl Default for GovernorPolicy {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(1),
            baseline_interval: Duration::from_secs(2),
            max_interval: Duration::from_secs(30),
            backoff_factor: 2.0,
            recovery_factor: 0.5,
            recovery_successes: 3,
            breaker_threshold: 5,
            cooldown: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    CircuitOpen { remaining: Duration },
    ProbeInFlight,
    Interval { remaining: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushPermit {
    Granted,
    /// The single half-open probe. Its outcome decides the breaker.
    Probe,
    Denied(DenyReason),
}

impl PushPermit {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Self::Denied(_))
    }

    pub fn is_probe(&self) -> bool {
        matches!(self, Self::Probe)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitTransition {
    Opened { until: Instant, cooldown: Duration },
    Closed,
}

#[derive(Debug, Clone, Serialize)]
pub struct DestinationStatus {
    pub destination: DestinationId,
    pub circuit: CircuitState,
    pub interval_ms: u64,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub probe_in_flight: bool,
    pub reopens_in_ms: Option<u64>,
    pub idle_ms: u64,
}

#[derive(Debug, Clone)]
struct DestinationState {
    interval: Duration,
    consecutive_failures: u32,
    consecutive_successes: u32,
    circuit_open_until: Option<Instant>,
    probe_in_flight: bool,
    last_attempt_at: Option<Instant>,
    last_activity_at: Instant,
}

impl DestinationState {
    fn new(policy: &GovernorPolicy, now: Instant) -> Self {
        Self {
            interval: policy.baseline_interval,
            consecutive_failures: 0,
            consecutive_successes: 0,
            circuit_open_until: None,
            probe_in_flight: false,
            last_attempt_at: None,
            last_activity_at: now,
        }
    }

    fn circuit_state(&self, now: Instant) -> CircuitState {
        match self.circuit_open_until {
            None => CircuitState::Closed,
            Some(until) if now < until => CircuitState::Open,
            Some(_) => CircuitState::HalfOpen,
        }
    }

    fn open_circuit(&mut self, now: Instant, cooldown: Duration) -> Instant {
        let until = now + cooldown;
        // Never move the reopen instant backwards.
        let until = self.circuit_open_until.map_or(until, |prev| prev.max(until));
        self.circuit_open_until = Some(until);
        self.consecutive_failures = 0;
        self.probe_in_flight = false;
        until
    }

    fn status(&self, destination: &DestinationId, now: Instant) -> DestinationStatus {
        DestinationStatus {
            destination: destination.clone(),
            circuit: self.circuit_state(now),
            interval_ms: duration_ms(self.interval),
            consecutive_failures: self.consecutive_failures,
            consecutive_successes: self.consecutive_successes,
            probe_in_flight: self.probe_in_flight,
            reopens_in_ms: self
                .circuit_open_until
                .filter(|until| now < *until)
                .map(|until| duration_ms(until - now)),
            idle_ms: duration_ms(now.saturating_duration_since(self.last_activity_at)),
        }
    }
}

pub struct RateGovernor {
    policy: GovernorPolicy,
    destinations: DashMap<DestinationId, DestinationState>,
}

impl RateGovernor {
    pub fn new(policy: GovernorPolicy) -> Self {
        Self {
            policy,
            destinations: DashMap::new(),
        }
    }

    pub fn policy(&self) -> &GovernorPolicy {
        &self.policy
    }

    /// Whether a push may go out now. A `true` answer consumes the slot.
    pub fn may_push(&self, destination: &DestinationId, now: Instant) -> bool {
        self.acquire_permit(destination, now).is_allowed()
    }

    /// Interval-gated permit for an incremental push.
    pub fn acquire_permit(&self, destination: &DestinationId, now: Instant) -> PushPermit {
        self.permit(destination, now, true)
    }

    /// Permit for the end-of-stream push: skips the interval gate, still
    /// honours the breaker.
    pub fn acquire_final_permit(&self, destination: &DestinationId, now: Instant) -> PushPermit {
        self.permit(destination, now, false)
    }

    fn permit(&self, destination: &DestinationId, now: Instant, gate_interval: bool) -> PushPermit {
        let mut entry = self
            .destinations
            .entry(destination.clone())
            .or_insert_with(|| DestinationState::new(&self.policy, now));
        let state = entry.value_mut();
        state.last_activity_at = now;

        match state.circuit_state(now) {
            CircuitState::Open => {
                let remaining = state
                    .circuit_open_until
                    .map(|until| until.saturating_duration_since(now))
                    .unwrap_or_default();
                return PushPermit::Denied(DenyReason::CircuitOpen { remaining });
            }
            CircuitState::HalfOpen => {
                if state.probe_in_flight {
                    return PushPermit::Denied(DenyReason::ProbeInFlight);
                }
                state.probe_in_flight = true;
                state.last_attempt_at = Some(now);
                return PushPermit::Probe;
            }
            CircuitState::Closed => {}
        }

        if gate_interval {
            if let Some(last) = state.last_attempt_at {
                let elapsed = now.saturating_duration_since(last);
                if elapsed < state.interval {
                    return PushPermit::Denied(DenyReason::Interval {
                        remaining: state.interval - elapsed,
                    });
                }
            }
        }
        state.last_attempt_at = Some(now);
        PushPermit::Granted
    }

    pub fn record_success(
        &self,
        destination: &DestinationId,
        now: Instant,
    ) -> Option<CircuitTransition> {
        let mut entry = self
            .destinations
            .entry(destination.clone())
            .or_insert_with(|| DestinationState::new(&self.policy, now));
        let state = entry.value_mut();
        state.last_activity_at = now;
        state.consecutive_failures = 0;

        let mut transition = None;
        if state.probe_in_flight && state.circuit_state(now) == CircuitState::HalfOpen {
            state.probe_in_flight = false;
            state.circuit_open_until = None;
            transition = Some(CircuitTransition::Closed);
            tracing::info!(destination = %destination, "circuit closed after successful probe");
        }

        state.consecutive_successes = state.consecutive_successes.saturating_add(1);
        if state.consecutive_successes >= self.policy.recovery_successes {
            state.consecutive_successes = 0;
            let tightened = state
                .interval
                .mul_f64(self.policy.recovery_factor)
                .max(self.policy.min_interval);
            if tightened != state.interval {
                tracing::debug!(
                    destination = %destination,
                    from_ms = duration_ms(state.interval),
                    to_ms = duration_ms(tightened),
                    "push interval tightened"
                );
                state.interval = tightened;
            }
        }
        transition
    }

    pub fn record_failure(
        &self,
        destination: &DestinationId,
        retry_after: Option<Duration>,
        now: Instant,
    ) -> Option<CircuitTransition> {
        let mut entry = self
            .destinations
            .entry(destination.clone())
            .or_insert_with(|| DestinationState::new(&self.policy, now));
        let state = entry.value_mut();
        state.last_activity_at = now;
        state.consecutive_successes = 0;

        let widened = state
            .interval
            .mul_f64(self.policy.backoff_factor)
            .max(retry_after.unwrap_or_default())
            .clamp(self.policy.min_interval, self.policy.max_interval);
        tracing::debug!(
            destination = %destination,
            from_ms = duration_ms(state.interval),
            to_ms = duration_ms(widened),
            retry_after_ms = retry_after.map(duration_ms),
            "push interval widened"
        );
        state.interval = widened;

        if state.probe_in_flight && state.circuit_state(now) == CircuitState::HalfOpen {
            let until = state.open_circuit(now, self.policy.cooldown);
            tracing::warn!(
                destination = %destination,
                cooldown_secs = self.policy.cooldown.as_secs(),
                "circuit re-opened after failed probe"
            );
            return Some(CircuitTransition::Opened {
                until,
                cooldown: self.policy.cooldown,
            });
        }

        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        if state.consecutive_failures >= self.policy.breaker_threshold {
            let until = state.open_circuit(now, self.policy.cooldown);
            tracing::warn!(
                destination = %destination,
                threshold = self.policy.breaker_threshold,
                cooldown_secs = self.policy.cooldown.as_secs(),
                "circuit opened after consecutive push failures"
            );
            return Some(CircuitTransition::Opened {
                until,
                cooldown: self.policy.cooldown,
            });
        }
        None
    }

    /// Releases a probe slot whose push never produced a countable outcome.
    pub fn abandon_probe(&self, destination: &DestinationId) {
        if let Some(mut state) = self.destinations.get_mut(destination) {
            state.probe_in_flight = false;
        }
    }

    /// Earliest instant an incremental push could be granted.
    pub fn ready_at(&self, destination: &DestinationId, now: Instant) -> Instant {
        let Some(state) = self.destinations.get(destination) else {
            return now;
        };
        match state.circuit_state(now) {
            CircuitState::Open => state.circuit_open_until.unwrap_or(now),
            CircuitState::HalfOpen if state.probe_in_flight => now + self.policy.min_interval,
            CircuitState::HalfOpen => now,
            CircuitState::Closed => state
                .last_attempt_at
                .map_or(now, |last| (last + state.interval).max(now)),
        }
    }

    pub fn circuit_state(&self, destination: &DestinationId, now: Instant) -> CircuitState {
        self.destinations
            .get(destination)
            .map_or(CircuitState::Closed, |state| state.circuit_state(now))
    }

    pub fn interval(&self, destination: &DestinationId) -> Duration {
        self.destinations
            .get(destination)
            .map_or(self.policy.baseline_interval, |state| state.interval)
    }

    pub fn status(&self, destination: &DestinationId, now: Instant) -> Option<DestinationStatus> {
        self.destinations
            .get(destination)
            .map(|state| state.status(destination, now))
    }

    pub fn snapshot(&self, now: Instant) -> Vec<DestinationStatus> {
        let mut out: Vec<DestinationStatus> = self
            .destinations
            .iter()
            .map(|entry| entry.value().status(entry.key(), now))
            .collect();
        out.sort_by(|a, b| a.destination.cmp(&b.destination));
        out
    }

    /// Drops destinations idle for at least `ttl`, unless the breaker is
    /// still open or a probe is out. An expired breaker nobody came back to
    /// is dropped like any other idle entry.
    pub fn prune_idle(&self, now: Instant, ttl: Duration) -> usize {
        let before = self.destinations.len();
        self.destinations.retain(|_, state| {
            let settled =
                state.circuit_state(now) != CircuitState::Open && !state.probe_in_flight;
            !(settled && now.saturating_duration_since(state.last_activity_at) >= ttl)
        });
        before.saturating_sub(self.destinations.len())
    }

    pub fn len(&self) -> usize {
        self.destinations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.destinations.is_empty()
    }
}

fn duration_ms(d: Duration) -> u64 {
    d.as_millis().min(u128::from(u64::MAX)) as u64
}
