//! Endpoint health tracking
//!
//! One breaker record per endpoint, shared by every operation of an
//! orchestrator. Consecutive transport failures open an endpoint's circuit;
//! after `recovery_timeout` the next caller gets a trial request through
//! (half-open) and its outcome closes or reopens the circuit.
//!
//! Open endpoints are excluded from fresh placements and asked last on
//! download. They are never dropped outright: the only copy of a share may
//! live there.

use crate::placement::{Endpoint, EndpointId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Breaker state of one endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Endpoint used as planned
    Closed,
    /// Endpoint failing; avoided until the recovery timeout passes
    Open,
    /// Recovery timeout passed; next outcome decides
    HalfOpen,
}

/// Breaker tuning
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u64,
    /// Time an open circuit waits before a trial request
    pub recovery_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
struct HealthRecord {
    state: CircuitState,
    consecutive_failures: u64,
    opened_at: Option<Instant>,
}

impl HealthRecord {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
        }
    }

    /// Current state, moving Open → HalfOpen once the timeout has passed
    fn poll(&mut self, config: &BreakerConfig, now: Instant) -> CircuitState {
        if self.state == CircuitState::Open {
            let waited = self
                .opened_at
                .map(|at| now.saturating_duration_since(at))
                .unwrap_or(Duration::MAX);
            if waited >= config.recovery_timeout {
                self.state = CircuitState::HalfOpen;
            }
        }
        self.state
    }

    /// Returns true when the endpoint recovered from HalfOpen
    fn succeed(&mut self) -> bool {
        let recovered = self.state == CircuitState::HalfOpen;
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.opened_at = None;
        recovered
    }

    /// Returns true when this failure opened the circuit
    fn fail(&mut self, config: &BreakerConfig, now: Instant) -> bool {
        self.consecutive_failures += 1;
        let opens = match self.state {
            CircuitState::Closed => self.consecutive_failures >= config.failure_threshold,
            CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        };
        if opens || self.state == CircuitState::Open {
            self.state = CircuitState::Open;
            self.opened_at = Some(now);
        }
        opens
    }
}

/// Breaker records for every endpoint an orchestrator talks to
pub struct EndpointHealth {
    config: BreakerConfig,
    records: Mutex<HashMap<EndpointId, HealthRecord>>,
}

impl EndpointHealth {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            records: Mutex::new(HashMap::new()),
        }
    }

    fn state_at(&self, endpoint: &EndpointId, now: Instant) -> CircuitState {
        self.records
            .lock()
            .get_mut(endpoint)
            .map(|record| record.poll(&self.config, now))
            .unwrap_or(CircuitState::Closed)
    }

    fn record_failure_at(&self, endpoint: &EndpointId, now: Instant) {
        let opened = self
            .records
            .lock()
            .entry(endpoint.clone())
            .or_insert_with(HealthRecord::new)
            .fail(&self.config, now);
        if opened {
            warn!(endpoint = %endpoint, "Circuit opened for endpoint");
        }
    }

    /// Current breaker state (`Closed` for endpoints never seen)
    pub fn state(&self, endpoint: &EndpointId) -> CircuitState {
        self.state_at(endpoint, Instant::now())
    }

    /// Whether `endpoint` should be used now
    pub fn allow(&self, endpoint: &EndpointId) -> bool {
        self.state(endpoint) != CircuitState::Open
    }

    pub fn record_success(&self, endpoint: &EndpointId) {
        let recovered = self
            .records
            .lock()
            .get_mut(endpoint)
            .map(HealthRecord::succeed)
            .unwrap_or(false);
        if recovered {
            info!(endpoint = %endpoint, "Endpoint recovered");
        }
    }

    pub fn record_failure(&self, endpoint: &EndpointId) {
        self.record_failure_at(endpoint, Instant::now());
    }

    /// Split endpoints into usable and open-circuit ones, keeping order
    pub fn partition(&self, endpoints: &[Endpoint]) -> (Vec<Endpoint>, Vec<Endpoint>) {
        endpoints.iter().cloned().partition(|e| self.allow(&e.id))
    }

    /// Endpoints with usable ones first, open-circuit ones last
    pub fn order(&self, endpoints: &[Endpoint]) -> Vec<Endpoint> {
        let (mut usable, open) = self.partition(endpoints);
        usable.extend(open);
        usable
    }
}

impl Default for EndpointHealth {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}
