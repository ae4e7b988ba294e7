//! Optimization strategy selection: before an invocation the shell evaluates
//! registered strategies against the tool's running statistics and applies at
//! most one.

use fabric_core::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StrategyKind {
	Caching,
	CircuitBreaker,
	LoadBalance,
	Parallel,
	Batch,
	Retry,
}

impl StrategyKind {
	pub fn name(&self) -> &'static str {
		match self {
			StrategyKind::Caching => "caching",
			StrategyKind::CircuitBreaker => "circuit_breaker",
			StrategyKind::LoadBalance => "load_balance",
			StrategyKind::Parallel => "parallel",
			StrategyKind::Batch => "batch",
			StrategyKind::Retry => "retry",
		}
	}
}

/// Running statistics a strategy condition is evaluated against.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ToolStats {
	pub avg_latency_ms: f64,
	pub error_rate: f64,
	pub resource_usage: f64,
}

type Predicate = dyn Fn(&ToolStats) -> bool + Send + Sync;

/// Thresholded condition set; every present clause must hold. `latency > X`,
/// `errorRate > Y` and `resourceUsage > Z` are strict comparisons, so a rate
/// sitting exactly on the threshold does not trigger.
#[derive(Default, Clone)]
pub struct Condition {
	pub latency_above_ms: Option<f64>,
	pub error_rate_above: Option<f64>,
	pub resource_above: Option<f64>,
	pub custom: Option<Arc<Predicate>>,
}

impl Condition {
	pub fn matches(&self, stats: &ToolStats) -> bool {
		if let Some(threshold) = self.latency_above_ms {
			if stats.avg_latency_ms <= threshold {
				return false;
			}
		}
		if let Some(threshold) = self.error_rate_above {
			if stats.error_rate <= threshold {
				return false;
			}
		}
		if let Some(threshold) = self.resource_above {
			if stats.resource_usage <= threshold {
				return false;
			}
		}
		if let Some(custom) = &self.custom {
			if !custom(stats) {
				return false;
			}
		}
		true
	}
}

#[derive(Debug, Clone, Copy)]
struct StrategyStats {
	activations: u64,
	successes: u64,
	avg_improvement: f64,
}

impl Default for StrategyStats {
	fn default() -> Self {
		Self {
			activations: 0,
			successes: 0,
			avg_improvement: 1.0,
		}
	}
}

pub struct Strategy {
	pub kind: StrategyKind,
	pub condition: Condition,
	pub priority: f64,
	stats: Mutex<StrategyStats>,
}

impl Strategy {
	pub fn new(kind: StrategyKind, condition: Condition, priority: f64) -> Arc<Strategy> {
		Arc::new(Strategy {
			kind,
			condition,
			priority,
			stats: Mutex::new(StrategyStats::default()),
		})
	}

	pub fn success_rate(&self) -> f64 {
		let stats = self.stats.lock().unwrap();
		if stats.activations == 0 {
			return 1.0;
		}
		stats.successes as f64 / stats.activations as f64
	}

	/// Selection weight: `priority × successRate × averageImprovement`.
	pub fn weight(&self) -> f64 {
		let improvement = self.stats.lock().unwrap().avg_improvement;
		self.priority * self.success_rate() * improvement
	}

	pub fn record_outcome(&self, succeeded: bool, improvement: f64) {
		let mut stats = self.stats.lock().unwrap();
		stats.activations += 1;
		if succeeded {
			stats.successes += 1;
		}
		let n = stats.activations as f64;
		stats.avg_improvement = (stats.avg_improvement * (n - 1.0) + improvement) / n;
	}
}

#[derive(Default)]
pub struct StrategyEngine {
	strategies: Mutex<Vec<Arc<Strategy>>>,
}

impl StrategyEngine {
	pub fn register(&self, strategy: Arc<Strategy>) {
		self.strategies.lock().unwrap().push(strategy);
	}

	/// The single best matching strategy for this call, if any.
	pub fn select(&self, stats: &ToolStats) -> Option<Arc<Strategy>> {
		let strategies = self.strategies.lock().unwrap();
		strategies
			.iter()
			.filter(|s| s.condition.matches(stats))
			.max_by(|a, b| a.weight().total_cmp(&b.weight()))
			.cloned()
	}

	pub fn len(&self) -> usize {
		self.strategies.lock().unwrap().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn stats(error_rate: f64) -> ToolStats {
		ToolStats {
			avg_latency_ms: 100.0,
			error_rate,
			resource_usage: 0.2,
		}
	}

	#[test]
	fn error_rate_condition_triggers_strictly_above() {
		let condition = Condition {
			error_rate_above: Some(0.1),
			..Default::default()
		};
		assert!(!condition.matches(&stats(0.09)));
		assert!(!condition.matches(&stats(0.1)));
		assert!(condition.matches(&stats(0.11)));
	}

	#[test]
	fn all_present_clauses_must_hold() {
		let condition = Condition {
			latency_above_ms: Some(50.0),
			error_rate_above: Some(0.1),
			..Default::default()
		};
		// Latency passes but error rate does not.
		assert!(!condition.matches(&stats(0.05)));
		assert!(condition.matches(&stats(0.2)));
	}

	#[test]
	fn custom_predicate() {
		let condition = Condition {
			custom: Some(Arc::new(|s: &ToolStats| s.resource_usage > 0.5)),
			..Default::default()
		};
		assert!(!condition.matches(&stats(0.0)));
		assert!(condition.matches(&ToolStats {
			resource_usage: 0.9,
			..stats(0.0)
		}));
	}

	#[test]
	fn selection_orders_by_weight() {
		let engine = StrategyEngine::default();
		let low = Strategy::new(
			StrategyKind::Retry,
			Condition {
				error_rate_above: Some(0.1),
				..Default::default()
			},
			1.0,
		);
		let high = Strategy::new(
			StrategyKind::CircuitBreaker,
			Condition {
				error_rate_above: Some(0.1),
				..Default::default()
			},
			5.0,
		);
		engine.register(low);
		engine.register(high.clone());
		let selected = engine.select(&stats(0.5)).unwrap();
		assert_eq!(selected.kind, StrategyKind::CircuitBreaker);
		assert!(engine.select(&stats(0.0)).is_none());
	}

	#[test]
	fn outcome_recording_shifts_weight() {
		let s = Strategy::new(StrategyKind::Retry, Condition::default(), 1.0);
		assert_eq!(s.success_rate(), 1.0);
		s.record_outcome(false, 0.5);
		assert_eq!(s.success_rate(), 0.0);
		s.record_outcome(true, 1.5);
		assert_eq!(s.success_rate(), 0.5);
		assert!(s.weight() < 1.0);
	}
}
