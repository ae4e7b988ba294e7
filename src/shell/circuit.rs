use a2a_wire::A2aError;
use fabric_core::prelude::*;

use crate::config::CircuitConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
	Closed,
	Open,
	HalfOpen,
}

struct Inner {
	state: BreakerState,
	consecutive_failures: u32,
	opened_at: Option<Instant>,
}

/// Three-state circuit breaker. Opens on the `failure_threshold`-th consecutive
/// failure; half-opens after `reset_timeout`; one trial outcome decides from
/// there. While open, calls fast-fail with `agent_unavailable`, marked
/// retryable so a fallback chain can move on to the next provider.
pub struct CircuitBreaker {
	name: Strng,
	failure_threshold: u32,
	reset_timeout: Duration,
	inner: Mutex<Inner>,
}

impl CircuitBreaker {
	pub fn new(name: Strng, config: &CircuitConfig) -> CircuitBreaker {
		CircuitBreaker {
			name,
			failure_threshold: config.failure_threshold,
			reset_timeout: config.reset_timeout,
			inner: Mutex::new(Inner {
				state: BreakerState::Closed,
				consecutive_failures: 0,
				opened_at: None,
			}),
		}
	}

	pub fn state(&self) -> BreakerState {
		self.inner.lock().unwrap().state
	}

	/// Gate a call. Returns the fast-fail error while the breaker is open.
	pub fn check(&self) -> Result<(), A2aError> {
		let mut inner = self.inner.lock().unwrap();
		match inner.state {
			BreakerState::Closed | BreakerState::HalfOpen => Ok(()),
			BreakerState::Open => {
				let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
				if elapsed >= self.reset_timeout {
					debug!(breaker=%self.name, "reset timeout elapsed, trying half-open");
					inner.state = BreakerState::HalfOpen;
					Ok(())
				} else {
					Err(
						A2aError::unavailable(format!("circuit breaker for {} is open", self.name))
							.mark_retryable(true)
							.with_component("shell"),
					)
				}
			},
		}
	}

	pub fn record_success(&self) {
		let mut inner = self.inner.lock().unwrap();
		if inner.state == BreakerState::HalfOpen {
			debug!(breaker=%self.name, "trial succeeded, closing");
		}
		inner.state = BreakerState::Closed;
		inner.consecutive_failures = 0;
		inner.opened_at = None;
	}

	pub fn record_failure(&self) {
		let mut inner = self.inner.lock().unwrap();
		match inner.state {
			BreakerState::HalfOpen => {
				debug!(breaker=%self.name, "trial failed, reopening");
				inner.state = BreakerState::Open;
				inner.opened_at = Some(Instant::now());
			},
			BreakerState::Closed => {
				inner.consecutive_failures += 1;
				if inner.consecutive_failures >= self.failure_threshold {
					warn!(
						breaker=%self.name,
						failures = inner.consecutive_failures,
						"opening circuit breaker"
					);
					inner.state = BreakerState::Open;
					inner.opened_at = Some(Instant::now());
				}
			},
			BreakerState::Open => {},
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use fabric_core::strng;

	fn breaker(threshold: u32, reset: Duration) -> CircuitBreaker {
		CircuitBreaker::new(
			strng::new("test"),
			&CircuitConfig {
				failure_threshold: threshold,
				reset_timeout: reset,
			},
		)
	}

	#[test]
	fn opens_on_threshold_not_sooner() {
		let cb = breaker(5, Duration::from_secs(30));
		for _ in 0..4 {
			cb.record_failure();
			assert_eq!(cb.state(), BreakerState::Closed);
		}
		cb.record_failure();
		assert_eq!(cb.state(), BreakerState::Open);
		let err = cb.check().unwrap_err();
		assert_eq!(err.kind, a2a_wire::ErrorKind::AgentUnavailable);
		assert!(err.retryable());
	}

	#[test]
	fn success_resets_consecutive_count() {
		let cb = breaker(3, Duration::from_secs(30));
		cb.record_failure();
		cb.record_failure();
		cb.record_success();
		cb.record_failure();
		cb.record_failure();
		assert_eq!(cb.state(), BreakerState::Closed);
		cb.record_failure();
		assert_eq!(cb.state(), BreakerState::Open);
	}

	#[tokio::test]
	async fn half_open_trial_decides() {
		let cb = breaker(1, Duration::from_millis(20));
		cb.record_failure();
		assert_eq!(cb.state(), BreakerState::Open);
		assert!(cb.check().is_err());

		tokio::time::sleep(Duration::from_millis(30)).await;
		assert!(cb.check().is_ok());
		assert_eq!(cb.state(), BreakerState::HalfOpen);
		cb.record_failure();
		assert_eq!(cb.state(), BreakerState::Open);

		tokio::time::sleep(Duration::from_millis(30)).await;
		assert!(cb.check().is_ok());
		cb.record_success();
		assert_eq!(cb.state(), BreakerState::Closed);
	}
}
