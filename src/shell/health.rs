use std::collections::{HashMap, VecDeque};

use a2a_wire::now_ms;
use fabric_core::prelude::*;

use crate::config::AlertThresholds;
use crate::lifecycle::{HealthState, LifecycleSink};

const OUTCOME_WINDOW: usize = 100;
const LATENCY_WINDOW: usize = 1000;

struct TargetHealth {
	outcomes: VecDeque<bool>,
	latencies: VecDeque<f64>,
	total: u64,
	failures: u64,
	state: HealthState,
	last_update_ms: u64,
}

impl TargetHealth {
	fn new() -> TargetHealth {
		TargetHealth {
			outcomes: VecDeque::with_capacity(OUTCOME_WINDOW),
			latencies: VecDeque::with_capacity(64),
			total: 0,
			failures: 0,
			state: HealthState::Healthy,
			last_update_ms: 0,
		}
	}

	fn error_rate(&self) -> f64 {
		if self.outcomes.is_empty() {
			return 0.0;
		}
		let failures = self.outcomes.iter().filter(|ok| !**ok).count();
		failures as f64 / self.outcomes.len() as f64
	}

	fn avg_latency_ms(&self) -> f64 {
		if self.latencies.is_empty() {
			return 0.0;
		}
		self.latencies.iter().sum::<f64>() / self.latencies.len() as f64
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct HealthSnapshot {
	pub state: HealthState,
	pub error_rate: f64,
	pub avg_latency_ms: f64,
	pub total: u64,
	pub failures: u64,
	pub last_update_ms: u64,
}

/// Per-target health over a sliding outcome window. State transitions are
/// published through the lifecycle sink.
pub struct HealthTracker {
	targets: Mutex<HashMap<Strng, TargetHealth>>,
	thresholds: AlertThresholds,
	sink: Arc<dyn LifecycleSink>,
}

impl HealthTracker {
	pub fn new(thresholds: AlertThresholds, sink: Arc<dyn LifecycleSink>) -> HealthTracker {
		HealthTracker {
			targets: Mutex::new(HashMap::new()),
			thresholds,
			sink,
		}
	}

	pub fn record(&self, target: &Strng, latency: Duration, success: bool) {
		let (state, error_rate, changed) = {
			let mut targets = self.targets.lock().unwrap();
			let health = targets
				.entry(target.clone())
				.or_insert_with(TargetHealth::new);
			if health.outcomes.len() >= OUTCOME_WINDOW {
				health.outcomes.pop_front();
			}
			health.outcomes.push_back(success);
			if health.latencies.len() >= LATENCY_WINDOW {
				health.latencies.pop_front();
			}
			health.latencies.push_back(latency.as_secs_f64() * 1000.0);
			health.total += 1;
			if !success {
				health.failures += 1;
			}
			health.last_update_ms = now_ms();

			let error_rate = health.error_rate();
			let latency_threshold_ms = self.thresholds.latency.as_secs_f64() * 1000.0;
			let new_state = if error_rate > self.thresholds.error_rate * 2.0 {
				HealthState::Unhealthy
			} else if error_rate > self.thresholds.error_rate
				|| health.avg_latency_ms() > latency_threshold_ms
			{
				HealthState::Degraded
			} else {
				HealthState::Healthy
			};
			let changed = new_state != health.state;
			health.state = new_state;
			(new_state, error_rate, changed)
		};
		if changed {
			debug!(%target, ?state, "health state changed");
			self.sink.health_updated(target, state, error_rate);
		}
	}

	pub fn state(&self, target: &Strng) -> HealthState {
		self
			.targets
			.lock()
			.unwrap()
			.get(target)
			.map(|h| h.state)
			.unwrap_or(HealthState::Healthy)
	}

	pub fn error_rate(&self, target: &Strng) -> f64 {
		self
			.targets
			.lock()
			.unwrap()
			.get(target)
			.map(|h| h.error_rate())
			.unwrap_or(0.0)
	}

	pub fn avg_latency_ms(&self, target: &Strng) -> f64 {
		self
			.targets
			.lock()
			.unwrap()
			.get(target)
			.map(|h| h.avg_latency_ms())
			.unwrap_or(0.0)
	}

	pub fn snapshot(&self) -> HashMap<Strng, HealthSnapshot> {
		self
			.targets
			.lock()
			.unwrap()
			.iter()
			.map(|(target, h)| {
				(
					target.clone(),
					HealthSnapshot {
						state: h.state,
						error_rate: h.error_rate(),
						avg_latency_ms: h.avg_latency_ms(),
						total: h.total,
						failures: h.failures,
						last_update_ms: h.last_update_ms,
					},
				)
			})
			.collect()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::lifecycle::{LifecycleEvent, NoopSink, RecordingSink};
	use fabric_core::strng;

	fn tracker(sink: Arc<dyn LifecycleSink>) -> HealthTracker {
		HealthTracker::new(AlertThresholds::default(), sink)
	}

	#[test]
	fn unknown_target_is_healthy() {
		let t = tracker(Arc::new(NoopSink));
		assert_eq!(t.state(&strng::new("ghost")), HealthState::Healthy);
		assert_eq!(t.error_rate(&strng::new("ghost")), 0.0);
	}

	#[test]
	fn degrades_past_error_threshold() {
		let sink = Arc::new(RecordingSink::new());
		let t = tracker(sink.clone());
		let target = strng::new("g-fast");
		for _ in 0..8 {
			t.record(&target, Duration::from_millis(10), true);
		}
		// 2/10 failures: error rate 0.2 > 0.1 threshold.
		t.record(&target, Duration::from_millis(10), false);
		t.record(&target, Duration::from_millis(10), false);
		assert_eq!(t.state(&target), HealthState::Degraded);
		assert!(
			sink
				.events()
				.iter()
				.any(|e| matches!(e, LifecycleEvent::HealthUpdated { .. }))
		);
	}

	#[test]
	fn unhealthy_past_double_threshold() {
		let t = tracker(Arc::new(NoopSink));
		let target = strng::new("g-bad");
		for _ in 0..5 {
			t.record(&target, Duration::from_millis(10), false);
		}
		assert_eq!(t.state(&target), HealthState::Unhealthy);
	}

	#[test]
	fn recovers_as_window_slides() {
		let t = tracker(Arc::new(NoopSink));
		let target = strng::new("g-flappy");
		for _ in 0..5 {
			t.record(&target, Duration::from_millis(10), false);
		}
		for _ in 0..OUTCOME_WINDOW {
			t.record(&target, Duration::from_millis(10), true);
		}
		assert_eq!(t.state(&target), HealthState::Healthy);
	}
}
