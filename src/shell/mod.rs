//! Health & optimization shell: circuit breakers, load balancing, batching,
//! latency prediction, health tracking, and pre-invocation strategy selection.

pub mod balance;
pub mod batch;
pub mod circuit;
pub mod health;
pub mod predict;
pub mod strategy;

use std::collections::HashMap;
use std::future::Future;

use a2a_wire::{A2aError, ErrorKind};
use fabric_core::prelude::*;

pub use balance::LoadBalancer;
pub use batch::{BatchHandler, Batcher};
pub use circuit::{BreakerState, CircuitBreaker};
pub use health::{HealthSnapshot, HealthTracker};
pub use predict::LatencyPredictor;
pub use strategy::{Condition, Strategy, StrategyEngine, StrategyKind, ToolStats};

use crate::config::{CircuitConfig, HealthConfig};
use crate::lifecycle::LifecycleSink;

pub struct Shell {
	circuit_config: CircuitConfig,
	breakers: Mutex<HashMap<Strng, Arc<CircuitBreaker>>>,
	balancers: Mutex<HashMap<Strng, Arc<LoadBalancer>>>,
	resource_usage: Mutex<HashMap<Strng, f64>>,
	pub predictor: LatencyPredictor,
	pub health: HealthTracker,
	pub strategies: StrategyEngine,
	sink: Arc<dyn LifecycleSink>,
}

impl Shell {
	pub fn new(
		circuit: CircuitConfig,
		health: HealthConfig,
		sink: Arc<dyn LifecycleSink>,
	) -> Arc<Shell> {
		Arc::new(Shell {
			circuit_config: circuit,
			breakers: Mutex::new(HashMap::new()),
			balancers: Mutex::new(HashMap::new()),
			resource_usage: Mutex::new(HashMap::new()),
			predictor: LatencyPredictor::new(),
			health: HealthTracker::new(health.alert_thresholds, sink.clone()),
			strategies: StrategyEngine::default(),
			sink,
		})
	}

	pub fn breaker(&self, target: &Strng) -> Arc<CircuitBreaker> {
		self
			.breakers
			.lock()
			.unwrap()
			.entry(target.clone())
			.or_insert_with(|| Arc::new(CircuitBreaker::new(target.clone(), &self.circuit_config)))
			.clone()
	}

	/// The balancer for a tool, created from its declared instances on first
	/// use.
	pub fn balancer(&self, tool: &Strng, instances: &[Strng]) -> Arc<LoadBalancer> {
		self
			.balancers
			.lock()
			.unwrap()
			.entry(tool.clone())
			.or_insert_with(|| Arc::new(LoadBalancer::new(instances.to_vec())))
			.clone()
	}

	pub fn set_resource_usage(&self, tool: &Strng, usage: f64) {
		self
			.resource_usage
			.lock()
			.unwrap()
			.insert(tool.clone(), usage);
	}

	pub fn tool_stats(&self, tool: &Strng) -> ToolStats {
		ToolStats {
			avg_latency_ms: self.health.avg_latency_ms(tool),
			error_rate: self.health.error_rate(tool),
			resource_usage: self
				.resource_usage
				.lock()
				.unwrap()
				.get(tool)
				.copied()
				.unwrap_or(0.0),
		}
	}

	/// Feed an observed outcome into the breaker and health tracking.
	pub fn record_outcome(&self, target: &Strng, latency: Duration, success: bool) {
		let breaker = self.breaker(target);
		if success {
			breaker.record_success();
		} else {
			breaker.record_failure();
		}
		self.health.record(target, latency, success);
	}

	async fn timed<T>(
		&self,
		tool: &Strng,
		fut: impl Future<Output = Result<T, A2aError>>,
	) -> Result<T, A2aError> {
		let started = Instant::now();
		let result = fut.await;
		self.record_outcome(tool, started.elapsed(), result.is_ok());
		result
	}

	/// Run an invocation with at most one selected strategy applied. A failing
	/// strategy falls back to a direct invocation and the fallback is recorded.
	pub async fn run<T, F, Fut>(&self, tool: &Strng, op: F) -> Result<T, A2aError>
	where
		F: Fn() -> Fut,
		Fut: Future<Output = Result<T, A2aError>>,
	{
		let stats = self.tool_stats(tool);
		let Some(strategy) = self.strategies.select(&stats) else {
			return self.timed(tool, op()).await;
		};
		trace!(%tool, strategy = strategy.kind.name(), "applying strategy");

		let before_ms = stats.avg_latency_ms.max(1.0);
		let started = Instant::now();
		let result = self.apply(strategy.kind, tool, &op).await;
		let elapsed_ms = (started.elapsed().as_secs_f64() * 1000.0).max(1.0);

		match result {
			Ok(value) => {
				let improvement = (before_ms / elapsed_ms).clamp(0.1, 10.0);
				strategy.record_outcome(true, improvement);
				self.sink.strategy_outcome(tool, strategy.kind.name(), true);
				Ok(value)
			},
			// An open breaker fast-failing is the intended outcome, not a
			// strategy failure; it must not be bypassed by a direct call.
			Err(e) if e.component == Some("shell") && e.kind == ErrorKind::AgentUnavailable => {
				strategy.record_outcome(true, 1.0);
				Err(e)
			},
			// The strategy mechanism itself failed: record the fallback and
			// invoke directly.
			Err(e) if e.component == Some("shell") => {
				strategy.record_outcome(false, 1.0);
				self.sink.strategy_outcome(tool, strategy.kind.name(), false);
				debug!(%tool, strategy = strategy.kind.name(), "strategy failed, direct invocation: {e}");
				self.timed(tool, op()).await
			},
			// An ordinary operation failure is an outcome, not a strategy
			// failure; surface it untouched.
			Err(e) => {
				strategy.record_outcome(false, 1.0);
				Err(e)
			},
		}
	}

	async fn apply<T, F, Fut>(&self, kind: StrategyKind, tool: &Strng, op: &F) -> Result<T, A2aError>
	where
		F: Fn() -> Fut,
		Fut: Future<Output = Result<T, A2aError>>,
	{
		match kind {
			StrategyKind::CircuitBreaker => {
				self.breaker(tool).check()?;
				self.timed(tool, op()).await
			},
			StrategyKind::Retry => match self.timed(tool, op()).await {
				Ok(value) => Ok(value),
				Err(e) if e.retryable() => {
					tokio::time::sleep(Duration::from_millis(100)).await;
					self.timed(tool, op()).await
				},
				Err(e) => Err(e),
			},
			StrategyKind::Parallel => {
				// Hedge: race two invocations, first success wins.
				let started = Instant::now();
				let result = match futures::future::select(Box::pin(op()), Box::pin(op())).await {
					futures::future::Either::Left((first, other)) => match first {
						Ok(value) => Ok(value),
						Err(_) => other.await,
					},
					futures::future::Either::Right((first, other)) => match first {
						Ok(value) => Ok(value),
						Err(_) => other.await,
					},
				};
				self.record_outcome(tool, started.elapsed(), result.is_ok());
				result
			},
			// Batching requires a wired batcher for the tool; the shell cannot
			// conjure one for an arbitrary invocation shape.
			StrategyKind::Batch => Err(
				A2aError::internal(format!("no batcher is wired for {tool}"))
					.with_component("shell"),
			),
			// Caching and load balancing act through their dedicated components
			// where the caller has wired them; selection alone does not change
			// the invocation.
			StrategyKind::Caching | StrategyKind::LoadBalance => self.timed(tool, op()).await,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::lifecycle::{LifecycleEvent, NoopSink, RecordingSink};
	use std::sync::atomic::{AtomicU32, Ordering};

	fn shell(sink: Arc<dyn LifecycleSink>) -> Arc<Shell> {
		Shell::new(CircuitConfig::default(), HealthConfig::default(), sink)
	}

	#[tokio::test]
	async fn direct_invocation_without_strategies() {
		let shell = shell(Arc::new(NoopSink));
		let tool = strng::new("t");
		let out = shell.run(&tool, || async { Ok::<_, A2aError>(7) }).await.unwrap();
		assert_eq!(out, 7);
		assert_eq!(shell.health.snapshot().get(&tool).unwrap().total, 1);
	}

	#[tokio::test]
	async fn breaker_strategy_fast_fails_after_threshold() {
		let shell = shell(Arc::new(NoopSink));
		shell.strategies.register(Strategy::new(
			StrategyKind::CircuitBreaker,
			Condition::default(),
			1.0,
		));
		let tool = strng::new("flaky");
		let calls = Arc::new(AtomicU32::new(0));

		for _ in 0..5 {
			let calls = calls.clone();
			let _ = shell
				.run(&tool, move || {
					let calls = calls.clone();
					async move {
						calls.fetch_add(1, Ordering::SeqCst);
						Err::<(), _>(A2aError::routing("down"))
					}
				})
				.await;
		}
		assert_eq!(calls.load(Ordering::SeqCst), 5);
		assert_eq!(shell.breaker(&tool).state(), BreakerState::Open);

		// Open window: the call fast-fails without invoking the operation.
		let calls2 = calls.clone();
		let err = shell
			.run(&tool, move || {
				let calls = calls2.clone();
				async move {
					calls.fetch_add(1, Ordering::SeqCst);
					Ok::<(), _>(())
				}
			})
			.await
			.unwrap_err();
		assert_eq!(err.kind, ErrorKind::AgentUnavailable);
		assert_eq!(calls.load(Ordering::SeqCst), 5);
	}

	#[tokio::test]
	async fn retry_strategy_retries_retryable() {
		let shell = shell(Arc::new(NoopSink));
		shell.strategies.register(Strategy::new(
			StrategyKind::Retry,
			Condition::default(),
			1.0,
		));
		let tool = strng::new("transient");
		let calls = Arc::new(AtomicU32::new(0));
		let c = calls.clone();
		let out = shell
			.run(&tool, move || {
				let calls = c.clone();
				async move {
					if calls.fetch_add(1, Ordering::SeqCst) == 0 {
						Err(A2aError::timeout("first try"))
					} else {
						Ok(42)
					}
				}
			})
			.await
			.unwrap();
		assert_eq!(out, 42);
		assert_eq!(calls.load(Ordering::SeqCst), 2);
	}

	#[tokio::test]
	async fn failed_strategy_falls_back_to_direct() {
		let sink = Arc::new(RecordingSink::new());
		let shell = shell(sink.clone());
		// A batch strategy with no batcher wired fails as a strategy, which must
		// fall back to a direct invocation.
		shell.strategies.register(Strategy::new(
			StrategyKind::Batch,
			Condition::default(),
			1.0,
		));
		let tool = strng::new("unbatched");
		let calls = Arc::new(AtomicU32::new(0));
		let c = calls.clone();
		let out = shell
			.run(&tool, move || {
				let calls = c.clone();
				async move {
					calls.fetch_add(1, Ordering::SeqCst);
					Ok::<_, A2aError>("direct")
				}
			})
			.await
			.unwrap();
		assert_eq!(out, "direct");
		assert_eq!(calls.load(Ordering::SeqCst), 1);
		assert!(sink.events().iter().any(|e| matches!(
			e,
			LifecycleEvent::StrategyOutcome {
				succeeded: false,
				..
			}
		)));
	}

	#[tokio::test]
	async fn op_failure_is_not_a_strategy_failure() {
		let shell = shell(Arc::new(NoopSink));
		shell.strategies.register(Strategy::new(
			StrategyKind::CircuitBreaker,
			Condition::default(),
			1.0,
		));
		let tool = strng::new("failing-op");
		let calls = Arc::new(AtomicU32::new(0));
		let c = calls.clone();
		let err = shell
			.run(&tool, move || {
				let calls = c.clone();
				async move {
					calls.fetch_add(1, Ordering::SeqCst);
					Err::<(), _>(A2aError::validation("bad input"))
				}
			})
			.await
			.unwrap_err();
		assert_eq!(err.kind, ErrorKind::Validation);
		// No direct-invocation fallback for an ordinary op failure.
		assert_eq!(calls.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn hedged_parallel_prefers_first_success() {
		let shell = shell(Arc::new(NoopSink));
		shell.strategies.register(Strategy::new(
			StrategyKind::Parallel,
			Condition::default(),
			1.0,
		));
		let tool = strng::new("hedged");
		let out = shell
			.run(&tool, || async { Ok::<_, A2aError>("fast") })
			.await
			.unwrap();
		assert_eq!(out, "fast");
	}

	#[tokio::test]
	async fn stats_feed_conditions() {
		let shell = shell(Arc::new(NoopSink));
		let tool = strng::new("watched");
		for _ in 0..8 {
			shell.record_outcome(&tool, Duration::from_millis(10), true);
		}
		shell.record_outcome(&tool, Duration::from_millis(10), false);
		shell.record_outcome(&tool, Duration::from_millis(10), false);
		let stats = shell.tool_stats(&tool);
		assert!(stats.error_rate > 0.1);

		let condition = Condition {
			error_rate_above: Some(0.1),
			..Default::default()
		};
		assert!(condition.matches(&stats));
	}
}
