//! Per-provider circuit breaker.
//!
//! Closed until `failure_threshold` consecutive transient failures land within
//! `window`; then open (fail fast) for `cooldown`; then half-open, letting a
//! single probe call through. The probe's outcome closes or re-opens the circuit.

use crate::error::{AdapterError, Error, Result};
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub window: Duration,
    pub cooldown: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BreakerState {
    Closed {
        failures: u32,
        first_failure: Option<Instant>,
    },
    Open {
        until: Instant,
    },
    /// `probe_started` is None until a probe is admitted
    HalfOpen {
        probe_started: Option<Instant>,
    },
}

impl BreakerState {
    fn closed() -> Self {
        BreakerState::Closed {
            failures: 0,
            first_failure: None,
        }
    }
}

pub struct CircuitBreaker {
    config: BreakerConfig,
    states: DashMap<String, BreakerState>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            states: DashMap::new(),
        }
    }

    /// Admit a call, or fail fast with `CircuitOpen`.
    pub fn try_begin(&self, provider: &str) -> Result<()> {
        let now = Instant::now();
        let mut state = self
            .states
            .entry(provider.to_string())
            .or_insert_with(BreakerState::closed);

        let current = *state;
        match current {
            BreakerState::Closed { .. } => Ok(()),
            BreakerState::Open { until } if now >= until => {
                tracing::info!(provider = %provider, "Circuit half-open, admitting probe");
                *state = BreakerState::HalfOpen {
                    probe_started: Some(now),
                };
                Ok(())
            }
            BreakerState::Open { until } => Err(Error::CircuitOpen {
                provider: provider.to_string(),
                retry_after: until.saturating_duration_since(now),
            }),
            BreakerState::HalfOpen { probe_started } => match probe_started {
                // A probe whose caller went away never reports back
                Some(started) if now.duration_since(started) < self.config.cooldown => {
                    Err(Error::CircuitOpen {
                        provider: provider.to_string(),
                        retry_after: self.config.cooldown - now.duration_since(started),
                    })
                }
                _ => {
                    *state = BreakerState::HalfOpen {
                        probe_started: Some(now),
                    };
                    Ok(())
                }
            },
        }
    }

    /// Give back an admission that never reached the platform.
    pub fn abandon(&self, provider: &str) {
        if let Some(mut state) = self.states.get_mut(provider) {
            if matches!(*state, BreakerState::HalfOpen { .. }) {
                *state = BreakerState::HalfOpen {
                    probe_started: None,
                };
            }
        }
    }

    /// Report the outcome of an admitted call.
    ///
    /// Only transient failures count against the circuit; any other answer
    /// from the platform proves it reachable.
    pub fn record<T>(&self, provider: &str, outcome: &std::result::Result<T, AdapterError>) {
        match outcome {
            Err(err) if err.trips_breaker() => self.record_failure(provider),
            _ => self.record_success(provider),
        }
    }

    fn record_success(&self, provider: &str) {
        let mut state = self
            .states
            .entry(provider.to_string())
            .or_insert_with(BreakerState::closed);
        if !matches!(*state, BreakerState::Closed { .. }) {
            tracing::info!(provider = %provider, "Circuit closed");
        }
        *state = BreakerState::closed();
    }

    fn record_failure(&self, provider: &str) {
        let now = Instant::now();
        let mut state = self
            .states
            .entry(provider.to_string())
            .or_insert_with(BreakerState::closed);

        let current = *state;
        *state = match current {
            BreakerState::Closed {
                failures,
                first_failure,
            } => {
                let (failures, first) = match first_failure {
                    Some(first) if now.duration_since(first) <= self.config.window => {
                        (failures + 1, first)
                    }
                    _ => (1, now),
                };

                if failures >= self.config.failure_threshold {
                    tracing::warn!(
                        provider = %provider,
                        failures = failures,
                        cooldown_secs = self.config.cooldown.as_secs(),
                        "Circuit opened after consecutive transient failures"
                    );
                    BreakerState::Open {
                        until: now + self.config.cooldown,
                    }
                } else {
                    BreakerState::Closed {
                        failures,
                        first_failure: Some(first),
                    }
                }
            }
            BreakerState::HalfOpen { .. } => {
                tracing::warn!(provider = %provider, "Probe failed, circuit re-opened");
                BreakerState::Open {
                    until: now + self.config.cooldown,
                }
            }
            open @ BreakerState::Open { .. } => open,
        };
    }

    pub fn is_open(&self, provider: &str) -> bool {
        self.states
            .get(provider)
            .map(|s| !matches!(*s, BreakerState::Closed { .. }))
            .unwrap_or(false)
    }
}
