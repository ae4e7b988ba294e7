//! Router & fallback core: strategy-scored provider selection, fingerprint
//! caching, fallback-chain execution with configurable backoff, and streaming
//! with consumer-side recovery.

pub mod fallback;
pub mod fingerprint;
pub mod metrics;
mod optimize;
pub mod provider;
pub mod stream;

use std::collections::HashMap;
use std::sync::RwLock;

use a2a_wire::A2aError;
use fabric_core::prelude::*;
use prometheus_client::registry::Registry;
use serde::Serialize;
use tracing::instrument;

pub use fingerprint::{CacheStats, Fingerprint, FingerprintCache};
pub use provider::{
	DispatchContext, GenerateParams, GenerateRequest, GenerateResponse, MediaHandle, MediaKind,
	ModelProvider, PerformanceProfile, ProfileSnapshot, ProviderSpec, ReasoningPreference,
	StreamChunk, UserTier,
};
pub use stream::ChunkStream;

use crate::config::{CacheConfig, RoutingConfig, RoutingStrategy};
use crate::lifecycle::HealthState;
use crate::shell::{BreakerState, Shell};
use metrics::{Metrics, ProviderErrorLabel, ProviderLabel};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
	BestScore,
	Preferred,
	OnlyProvider,
	CacheHit,
	Emergency,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RoutingDecision {
	pub provider: Strng,
	pub confidence: f64,
	pub reason: DecisionReason,
	pub alternatives: Vec<Strng>,
	pub decision_time: Duration,
	pub from_cache: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderHealth {
	pub health: HealthState,
	pub breaker: BreakerState,
	pub profile: ProfileSnapshot,
}

#[derive(Debug, Clone, Default)]
pub struct RouterSnapshot {
	pub cache: CacheStats,
	pub profiles: HashMap<Strng, ProfileSnapshot>,
}

struct Weights {
	latency: f64,
	cost: f64,
	quality: f64,
	success: f64,
}

fn weights(strategy: RoutingStrategy) -> Weights {
	match strategy {
		RoutingStrategy::Latency => Weights {
			latency: 0.6,
			success: 0.25,
			cost: 0.05,
			quality: 0.1,
		},
		RoutingStrategy::Cost => Weights {
			latency: 0.15,
			success: 0.15,
			cost: 0.6,
			quality: 0.1,
		},
		RoutingStrategy::Quality => Weights {
			latency: 0.1,
			success: 0.3,
			cost: 0.1,
			quality: 0.5,
		},
		RoutingStrategy::Balanced => Weights {
			latency: 0.25,
			success: 0.25,
			cost: 0.25,
			quality: 0.25,
		},
	}
}

pub struct Router {
	config: RoutingConfig,
	providers: RwLock<HashMap<Strng, Arc<dyn ModelProvider>>>,
	profiles: Mutex<HashMap<Strng, PerformanceProfile>>,
	cache: FingerprintCache,
	shell: Arc<Shell>,
	metrics: Metrics,
}

impl Router {
	pub fn new(
		config: RoutingConfig,
		cache: CacheConfig,
		shell: Arc<Shell>,
		registry: &mut Registry,
	) -> Arc<Router> {
		Arc::new(Router {
			config,
			providers: RwLock::new(HashMap::new()),
			profiles: Mutex::new(HashMap::new()),
			cache: FingerprintCache::new(cache),
			shell,
			metrics: Metrics::new(registry.sub_registry_with_prefix("router")),
		})
	}

	pub fn register_provider(&self, provider: Arc<dyn ModelProvider>) {
		let id = provider.spec().id;
		debug!(provider=%id, "registered provider");
		self.providers.write().unwrap().insert(id, provider);
	}

	pub fn provider_ids(&self) -> Vec<Strng> {
		let mut ids: Vec<Strng> = self.providers.read().unwrap().keys().cloned().collect();
		ids.sort();
		ids
	}

	fn provider(&self, id: &Strng) -> Option<Arc<dyn ModelProvider>> {
		self.providers.read().unwrap().get(id).cloned()
	}

	fn profile_snapshot(&self, id: &Strng) -> ProfileSnapshot {
		self
			.profiles
			.lock()
			.unwrap()
			.get(id)
			.map(|p| p.snapshot())
			.unwrap_or_default()
	}

	/// Rank providers for a request under the configured strategy. Ties break
	/// by provider id for determinism.
	#[instrument(level = "debug", skip_all)]
	pub fn routing_decision(&self, request: &GenerateRequest) -> Result<RoutingDecision, A2aError> {
		let started = Instant::now();
		let specs: Vec<ProviderSpec> = {
			let providers = self.providers.read().unwrap();
			providers.values().map(|p| p.spec()).collect()
		};
		if specs.is_empty() {
			return Err(A2aError::routing("no providers registered").with_component("router"));
		}

		if let Some(preferred) = &request.preferred_provider {
			if specs.iter().any(|s| &s.id == preferred)
				&& self.shell.breaker(preferred).state() != BreakerState::Open
			{
				return Ok(RoutingDecision {
					provider: preferred.clone(),
					confidence: 1.0,
					reason: DecisionReason::Preferred,
					alternatives: vec![],
					decision_time: started.elapsed(),
					from_cache: false,
				});
			}
		}

		let w = weights(self.config.strategy);
		let mut scored: Vec<(f64, Strng)> = specs
			.iter()
			.filter(|spec| !request.multimodal() || spec.multimodal)
			.map(|spec| {
				let profile = self.profile_snapshot(&spec.id);
				let latency_score = 1.0 / (1.0 + profile.avg_latency_ms / 1000.0);
				let cost_score = 1.0 / (1.0 + spec.cost_per_1k_tokens);
				let health_factor = match self.shell.health.state(&spec.id) {
					HealthState::Healthy => 1.0,
					HealthState::Degraded => 0.5,
					HealthState::Unhealthy => 0.1,
				};
				let breaker_factor = match self.shell.breaker(&spec.id).state() {
					BreakerState::Open => 0.0,
					_ => 1.0,
				};
				let score = breaker_factor
					* health_factor
					* (w.latency * latency_score
						+ w.success * profile.success_rate
						+ w.cost * cost_score
						+ w.quality * spec.quality);
				(score, spec.id.clone())
			})
			.collect();
		if scored.is_empty() {
			return Err(
				A2aError::routing("no provider supports this request").with_component("router"),
			);
		}
		scored.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.cmp(&b.1)));

		let (confidence, provider) = scored[0].clone();
		let alternatives = scored.iter().skip(1).map(|(_, id)| id.clone()).collect();
		let reason = if scored.len() == 1 {
			DecisionReason::OnlyProvider
		} else {
			DecisionReason::BestScore
		};
		Ok(RoutingDecision {
			provider,
			confidence: confidence.clamp(0.0, 1.0),
			reason,
			alternatives,
			decision_time: started.elapsed(),
			from_cache: false,
		})
	}

	/// One provider attempt, with outcome accounting into the shell, the
	/// predictor and the performance profile.
	async fn try_provider(
		&self,
		id: &Strng,
		request: &GenerateRequest,
		attempt: u32,
	) -> Result<GenerateResponse, A2aError> {
		let provider = self.provider(id).ok_or_else(|| {
			A2aError::routing(format!("provider {id} is not registered")).with_component("router")
		})?;
		self.shell.breaker(id).check()?;
		self
			.metrics
			.requests
			.get_or_create(&ProviderLabel {
				provider: id.clone().into(),
			})
			.inc();

		let ctx = DispatchContext { attempt };
		let started = Instant::now();
		let result = match request.timeout {
			Some(limit) => match tokio::time::timeout(limit, provider.generate(request, &ctx)).await
			{
				Ok(inner) => inner,
				Err(_) => Err(
					A2aError::timeout(format!("provider {id} exceeded {limit:?}"))
						.with_component("router"),
				),
			},
			None => provider.generate(request, &ctx).await,
		};
		let latency = started.elapsed();

		self.shell.record_outcome(id, latency, result.is_ok());
		self.shell.predictor.record(
			request.prompt.len(),
			request.multimodal(),
			request.params.max_tokens.unwrap_or(1024),
			latency,
		);
		self
			.profiles
			.lock()
			.unwrap()
			.entry(id.clone())
			.or_default()
			.record(latency, result.is_ok(), request.tier);

		match result {
			Ok(mut response) => {
				response.provider = id.clone();
				response.latency = latency;
				Ok(response)
			},
			Err(e) => {
				self
					.metrics
					.request_errors
					.get_or_create(&ProviderErrorLabel {
						provider: id.clone().into(),
						error_type: strng::new(e.kind.as_str()).into(),
					})
					.inc();
				Err(e)
			},
		}
	}

	/// Walk the fallback chain: retryable failures move to the next candidate
	/// with backoff, each counting against `max_retries`; non-retryable
	/// failures short-circuit; the emergency provider runs at most once per
	/// logical request and its failure is terminal.
	async fn execute_with_fallback(
		&self,
		decision: &RoutingDecision,
		request: &GenerateRequest,
	) -> Result<GenerateResponse, A2aError> {
		let total_attempts = self.config.max_retries as usize + 1;
		let order = fallback::candidates(
			&decision.provider,
			&self.config.fallback_chain,
			total_attempts,
		);
		let mut last_error: Option<A2aError> = None;
		for (i, provider_id) in order.iter().enumerate() {
			if i > 0 {
				self
					.metrics
					.fallback_attempts
					.get_or_create(&ProviderLabel {
						provider: provider_id.clone().into(),
					})
					.inc();
				let delay =
					fallback::backoff_delay(self.config.backoff, self.config.retry_delay, i as u32);
				tokio::time::sleep(delay).await;
			}
			match self.try_provider(provider_id, request, i as u32).await {
				Ok(response) => return Ok(response),
				Err(e) if e.retryable() => {
					debug!(provider=%provider_id, attempt = i, "provider failed, walking chain: {e}");
					last_error = Some(e);
				},
				Err(e) => return Err(e),
			}
		}

		if let Some(emergency) = &self.config.emergency_fallback {
			warn!(provider=%emergency, "retries exhausted, invoking emergency fallback");
			self.metrics.emergency_invocations.inc();
			return self
				.try_provider(emergency, request, total_attempts as u32)
				.await;
		}
		Err(
			last_error
				.unwrap_or_else(|| A2aError::routing("no provider attempt was made"))
				.with_component("router"),
		)
	}

	#[instrument(level = "debug", skip_all)]
	pub async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse, A2aError> {
		let mut request = request;
		if self.config.optimize_requests {
			optimize::optimize(&mut request, &self.shell.predictor);
		}

		// Cached responses are never served to streaming requests.
		let mut cached_decision = None;
		if !request.params.stream {
			if let Some(hit) = self.cache.lookup(&request) {
				self.metrics.cache_hits.inc();
				if let Some(mut response) = hit.response {
					response.from_cache = true;
					return Ok(response);
				}
				cached_decision = Some(hit.decision);
			} else {
				self.metrics.cache_misses.inc();
			}
		}

		let decision = match cached_decision {
			Some(decision) => decision,
			None => self.routing_decision(&request)?,
		};
		let response = self.execute_with_fallback(&decision, &request).await?;
		self
			.cache
			.store(&request, decision, Some(response.clone()));
		Ok(response)
	}

	#[instrument(level = "debug", skip_all)]
	pub async fn generate_stream(&self, request: GenerateRequest) -> Result<ChunkStream, A2aError> {
		let mut request = request;
		request.params.stream = true;
		if self.config.optimize_requests {
			optimize::optimize(&mut request, &self.shell.predictor);
		}
		let decision = self.routing_decision(&request)?;
		let provider = self.provider(&decision.provider).ok_or_else(|| {
			A2aError::routing(format!("provider {} is not registered", decision.provider))
				.with_component("router")
		})?;
		self
			.metrics
			.stream_requests
			.get_or_create(&ProviderLabel {
				provider: decision.provider.clone().into(),
			})
			.inc();
		Ok(stream::with_recovery(
			provider,
			request,
			self.config.max_stream_reconnects,
			Duration::from_secs(1),
		))
	}

	pub fn metrics_snapshot(&self) -> RouterSnapshot {
		RouterSnapshot {
			cache: self.cache.stats(),
			profiles: self
				.profiles
				.lock()
				.unwrap()
				.iter()
				.map(|(id, p)| (id.clone(), p.snapshot()))
				.collect(),
		}
	}

	pub fn health(&self) -> HashMap<Strng, ProviderHealth> {
		self
			.provider_ids()
			.into_iter()
			.map(|id| {
				let health = ProviderHealth {
					health: self.shell.health.state(&id),
					breaker: self.shell.breaker(&id).state(),
					profile: self.profile_snapshot(&id),
				};
				(id, health)
			})
			.collect()
	}
}
