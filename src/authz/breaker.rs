//! Circuit breaker guarding the policy engine gateway. Closed → Open once
//! consecutive failures reach the threshold; Open → HalfOpen after the
//! cool-down; a half-open probe decides recovery. No lock is held across a
//! network call: callers acquire, then report the outcome.

use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// How long the circuit stays open before probing.
    pub recovery_cooldown: Duration,
    /// Probes allowed through while half-open.
    pub half_open_max_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            recovery_cooldown: Duration::from_secs(30),
            half_open_max_requests: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
enum Inner {
    Closed { consecutive_failures: u32 },
    Open { since: Instant },
    HalfOpen { in_flight: u32 },
}

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner::Closed {
                consecutive_failures: 0,
            }),
        }
    }

    /// May a call go out right now? Open circuits short-circuit; an open
    /// circuit past its cool-down admits a half-open probe.
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match &mut *inner {
            Inner::Closed { .. } => true,
            Inner::Open { since } => {
                if since.elapsed() >= self.config.recovery_cooldown {
                    *inner = Inner::HalfOpen { in_flight: 1 };
                    true
                } else {
                    false
                }
            }
            Inner::HalfOpen { in_flight } => {
                if *in_flight < self.config.half_open_max_requests {
                    *in_flight += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn on_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        *inner = Inner::Closed {
            consecutive_failures: 0,
        };
    }

    pub fn on_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        match &mut *inner {
            Inner::Closed {
                consecutive_failures,
            } => {
                *consecutive_failures += 1;
                if *consecutive_failures >= self.config.failure_threshold {
                    tracing::warn!("policy engine circuit opened");
                    *inner = Inner::Open {
                        since: Instant::now(),
                    };
                }
            }
            Inner::HalfOpen { .. } => {
                tracing::warn!("half-open probe failed, circuit re-opened");
                *inner = Inner::Open {
                    since: Instant::now(),
                };
            }
            Inner::Open { .. } => {}
        }
    }

    pub fn state(&self) -> BreakerState {
        match *self.inner.lock().unwrap() {
            Inner::Closed { .. } => BreakerState::Closed,
            Inner::Open { .. } => BreakerState::Open,
            Inner::HalfOpen { .. } => BreakerState::HalfOpen,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(cooldown: Duration) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 3,
            recovery_cooldown: cooldown,
            half_open_max_requests: 1,
        })
    }

    #[test]
    fn opens_after_threshold_failures() {
        let cb = breaker(Duration::from_secs(30));
        assert!(cb.try_acquire());
        cb.on_failure();
        cb.on_failure();
        assert_eq!(cb.state(), BreakerState::Closed);
        cb.on_failure();
        assert_eq!(cb.state(), BreakerState::Open);
        assert!(!cb.try_acquire());
    }

    #[test]
    fn success_resets_the_failure_count() {
        let cb = breaker(Duration::from_secs(30));
        cb.on_failure();
        cb.on_failure();
        cb.on_success();
        cb.on_failure();
        cb.on_failure();
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_probe_gates_recovery() {
        let cb = breaker(Duration::from_millis(0));
        for _ in 0..3 {
            cb.on_failure();
        }
        assert_eq!(cb.state(), BreakerState::Open);

        // Cool-down elapsed: exactly one probe is admitted.
        assert!(cb.try_acquire());
        assert_eq!(cb.state(), BreakerState::HalfOpen);
        assert!(!cb.try_acquire());

        cb.on_success();
        assert_eq!(cb.state(), BreakerState::Closed);
        assert!(cb.try_acquire());
    }

    #[test]
    fn failed_probe_reopens() {
        let cb = breaker(Duration::from_millis(0));
        for _ in 0..3 {
            cb.on_failure();
        }
        assert!(cb.try_acquire());
        cb.on_failure();
        assert_eq!(cb.state(), BreakerState::Open);
    }
}
