//! Capability registry and composer: registration, querying, dependency-aware
//! composition execution, aggregation, and usage accounting.

pub mod aggregation;
pub mod capability;
pub mod composition;
pub mod metrics;

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::RwLock;

use a2a_wire::{A2aError, Value, now_ms};
use fabric_core::prelude::*;
use itertools::Itertools;
use prometheus_client::registry::Registry;
use tracing::instrument;

pub use aggregation::AggregationStrategy;
pub use capability::{
	CallerContext, Capability, CapabilityInvoker, CapabilityStatus, PerformanceDescriptor,
	Registration, RemoteInvoker, ResourceUsage, Schema, SecurityDescriptor, TrustLevel,
	UsageStats, invoker_fn,
};
pub use composition::{
	Composition, CompositionOutcome, CompositionSecurity, CompositionStatus, ConditionOp,
	ErrorPolicy, ExecutionStrategy, StepCondition,
};

use aggregation::AggregateInvoker;
use metrics::{CapabilityCall, CapabilityError, CompositionRun, Metrics};

/// Query filter. All present clauses must hold.
#[derive(Debug, Clone, Default)]
pub struct CapabilityFilter {
	/// Substring match on the capability name.
	pub name_contains: Option<String>,
	pub version: Option<Strng>,
	pub category: Option<Strng>,
	/// Keep registrations whose minimum trust level is at most this.
	pub trust_level: Option<TrustLevel>,
	/// Keep registrations whose required capabilities are all held.
	pub held_capabilities: Option<HashSet<Strng>>,
	pub max_latency_ms: Option<f64>,
	pub max_resource_usage: Option<ResourceUsage>,
	/// Keep registrations sharing at least one tag, when non-empty.
	pub tags: Vec<Strng>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiscoveryInfo {
	pub categories: Vec<Strng>,
	pub versions: BTreeMap<Strng, Vec<Strng>>,
	pub dependencies: BTreeMap<Strng, Vec<Strng>>,
	/// Top registrations by total invocations.
	pub popular: Vec<Strng>,
	/// Registrations used within the trending window, by invocations.
	pub trending: Vec<Strng>,
}

#[derive(Default)]
struct RegistryState {
	registrations: HashMap<Strng, Registration>,
	categories: HashMap<Strng, BTreeSet<Strng>>,
	/// Capability id → the capability names it requires.
	dependencies: HashMap<Strng, Vec<Strng>>,
	compositions: HashMap<Strng, Arc<Composition>>,
}

const POPULAR_LIMIT: usize = 10;
const TRENDING_WINDOW: Duration = Duration::from_secs(3600);

pub struct CapabilityRegistry {
	state: RwLock<RegistryState>,
	metrics: Metrics,
}

impl CapabilityRegistry {
	pub fn new(registry: &mut Registry) -> Arc<CapabilityRegistry> {
		Arc::new(CapabilityRegistry {
			state: RwLock::new(RegistryState::default()),
			metrics: Metrics::new(registry.sub_registry_with_prefix("registry")),
		})
	}

	/// Register a capability under an id. Overwriting is allowed but logged.
	pub fn register(
		&self,
		id: impl AsRef<str>,
		capability: Capability,
		invoker: Arc<dyn CapabilityInvoker>,
	) -> Result<(), A2aError> {
		capability.validate()?;
		let id = strng::new(id);
		let mut state = self.state.write().unwrap();
		if let Some(previous) = state.registrations.remove(&id) {
			warn!(%id, "overwriting existing capability registration");
			Self::unindex(&mut state, &id, &previous);
		}
		state
			.categories
			.entry(capability.category())
			.or_default()
			.insert(id.clone());
		state
			.dependencies
			.insert(id.clone(), capability.security.required_capabilities.clone());
		state
			.registrations
			.insert(id.clone(), Registration::new(capability, invoker));
		debug!(%id, "registered capability");
		Ok(())
	}

	fn unindex(state: &mut RegistryState, id: &Strng, registration: &Registration) {
		let category = registration.capability.category();
		if let Some(ids) = state.categories.get_mut(&category) {
			ids.remove(id);
			if ids.is_empty() {
				state.categories.remove(&category);
			}
		}
		state.dependencies.remove(id);
	}

	pub fn unregister(&self, id: &Strng) -> Result<(), A2aError> {
		let mut state = self.state.write().unwrap();
		let Some(registration) = state.registrations.remove(id) else {
			return Err(
				A2aError::capability_not_found(format!("no capability registered as {id}"))
					.with_component("registry"),
			);
		};
		Self::unindex(&mut state, id, &registration);
		Ok(())
	}

	pub fn get(&self, id: &Strng) -> Option<Registration> {
		self.state.read().unwrap().registrations.get(id).cloned()
	}

	pub fn list(&self, status: Option<CapabilityStatus>) -> Vec<(Strng, Registration)> {
		let state = self.state.read().unwrap();
		state
			.registrations
			.iter()
			.filter(|(_, r)| status.is_none_or(|s| r.status == s))
			.map(|(id, r)| (id.clone(), r.clone()))
			.collect()
	}

	pub fn set_status(&self, id: &Strng, status: CapabilityStatus) -> Result<(), A2aError> {
		let mut state = self.state.write().unwrap();
		let registration = state.registrations.get_mut(id).ok_or_else(|| {
			A2aError::capability_not_found(format!("no capability registered as {id}"))
				.with_component("registry")
		})?;
		registration.status = status;
		Ok(())
	}

	/// Filtered search, ranked by `successRate × (1 / max(avgLatency, 1))`.
	pub fn query(&self, filter: &CapabilityFilter) -> Vec<(Strng, Registration)> {
		let state = self.state.read().unwrap();
		let mut matches: Vec<(Strng, Registration)> = state
			.registrations
			.iter()
			.filter(|(_, r)| Self::matches(filter, r))
			.map(|(id, r)| (id.clone(), r.clone()))
			.collect();
		matches.sort_by(|a, b| {
			b.1
				.rank()
				.total_cmp(&a.1.rank())
				.then_with(|| a.0.cmp(&b.0))
		});
		matches
	}

	fn matches(filter: &CapabilityFilter, registration: &Registration) -> bool {
		let cap = &registration.capability;
		if let Some(fragment) = &filter.name_contains {
			if !cap.name.contains(fragment.as_str()) {
				return false;
			}
		}
		if let Some(version) = &filter.version {
			if &cap.version != version {
				return false;
			}
		}
		if let Some(category) = &filter.category {
			if &cap.category() != category {
				return false;
			}
		}
		if let Some(level) = filter.trust_level {
			if cap.security.min_trust_level > level {
				return false;
			}
		}
		if let Some(held) = &filter.held_capabilities {
			if !cap
				.security
				.required_capabilities
				.iter()
				.all(|r| held.contains(r))
			{
				return false;
			}
		}
		if let Some(max_latency) = filter.max_latency_ms {
			if cap.performance.avg_latency_ms > max_latency {
				return false;
			}
		}
		if let Some(max_usage) = filter.max_resource_usage {
			if cap.performance.resource_usage > max_usage {
				return false;
			}
		}
		if !filter.tags.is_empty() && !filter.tags.iter().any(|t| cap.tags.contains(t)) {
			return false;
		}
		true
	}

	/// Invoke one capability: schema validation and the security gate at the
	/// boundary, then the bound invoker, then usage accounting.
	#[instrument(level = "debug", skip_all, fields(capability=%id))]
	pub async fn invoke(
		&self,
		id: &Strng,
		params: Value,
		ctx: &CallerContext,
	) -> Result<Value, A2aError> {
		let registration = self.get(id).ok_or_else(|| {
			A2aError::capability_not_found(format!("no capability registered as {id}"))
				.with_component("registry")
		})?;
		match registration.status {
			CapabilityStatus::Disabled | CapabilityStatus::Maintenance => {
				return Err(
					A2aError::unavailable(format!("capability {id} is {:?}", registration.status))
						.with_component("registry"),
				);
			},
			CapabilityStatus::Deprecated => {
				warn!(%id, "invoking deprecated capability");
			},
			CapabilityStatus::Active => {},
		}
		let cap = &registration.capability;
		cap.parameters.validate(&params)?;
		if ctx.trust_level < cap.security.min_trust_level {
			return Err(
				A2aError::authorization(format!(
					"caller {} trust level {:?} is below {:?} required by {id}",
					ctx.agent, ctx.trust_level, cap.security.min_trust_level
				))
				.with_component("registry"),
			);
		}
		for required in &cap.security.required_capabilities {
			if !ctx.held_capabilities.contains(required) {
				return Err(
					A2aError::authorization(format!(
						"caller {} is missing capability {required} required by {id}",
						ctx.agent
					))
					.with_component("registry"),
				);
			}
		}

		let call = CapabilityCall {
			capability: id.clone().into(),
		};
		self.metrics.invocations.get_or_create(&call).inc();
		let started = Instant::now();
		let result = registration.invoker.invoke(params, ctx).await;
		let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
		self
			.metrics
			.invocation_latency
			.get_or_create(&call)
			.observe(latency_ms);
		if let Err(e) = &result {
			self
				.metrics
				.invocation_errors
				.get_or_create(&CapabilityError {
					capability: id.clone().into(),
					error_type: strng::new(e.kind.as_str()).into(),
				})
				.inc();
		}
		self.update_usage(id, result.is_ok(), latency_ms);
		result
	}

	pub fn update_usage(&self, id: &Strng, success: bool, latency_ms: f64) {
		let mut state = self.state.write().unwrap();
		if let Some(registration) = state.registrations.get_mut(id) {
			registration.stats.record(success, latency_ms);
			registration.last_used_ms = now_ms();
		}
	}

	pub fn create_composition(&self, composition: Composition) -> Result<(), A2aError> {
		composition.validate(self)?;
		let mut state = self.state.write().unwrap();
		state
			.compositions
			.insert(composition.id.clone(), Arc::new(composition));
		Ok(())
	}

	pub fn composition(&self, id: &Strng) -> Option<Arc<Composition>> {
		self.state.read().unwrap().compositions.get(id).cloned()
	}

	/// Execute a composition under its declared strategy, error policy, security
	/// policy and timeout.
	#[instrument(level = "debug", skip_all, fields(composition=%composition_id))]
	pub async fn execute(
		&self,
		composition_id: &Strng,
		params: Value,
		ctx: &CallerContext,
	) -> Result<CompositionOutcome, A2aError> {
		let composition = self.composition(composition_id).ok_or_else(|| {
			A2aError::capability_not_found(format!("no composition registered as {composition_id}"))
				.with_component("registry")
		})?;
		composition.security_gate(ctx)?;
		self
			.metrics
			.compositions_executed
			.get_or_create(&CompositionRun {
				composition: composition_id.clone().into(),
				strategy: strng::new(format!("{:?}", composition.strategy).to_lowercase()).into(),
			})
			.inc();
		let run = composition::run(self, &composition, params, ctx);
		match composition.timeout {
			Some(timeout) => tokio::time::timeout(timeout, run).await.map_err(|_| {
				A2aError::timeout(format!(
					"composition {composition_id} exceeded its {timeout:?} budget"
				))
				.with_component("registry")
			})?,
			None => run.await,
		}
	}

	/// Synthesize and register a composite capability over existing ones.
	pub fn create_aggregation(
		self: &Arc<Self>,
		ids: &[Strng],
		name: impl AsRef<str>,
		strategy: AggregationStrategy,
	) -> Result<Capability, A2aError> {
		if ids.is_empty() {
			return Err(A2aError::validation("aggregation requires at least one capability"));
		}
		let mut components = Vec::with_capacity(ids.len());
		for id in ids {
			let registration = self.get(id).ok_or_else(|| {
				A2aError::capability_not_found(format!("no capability registered as {id}"))
					.with_component("registry")
			})?;
			components.push((id.clone(), registration.capability));
		}
		let name = strng::new(name);
		let capability = aggregation::synthesize(&name, &components, strategy);
		let invoker = Arc::new(AggregateInvoker {
			registry: self.clone(),
			components: ids.to_vec(),
			strategy,
		});
		self.register(name.clone(), capability.clone(), invoker)?;
		Ok(capability)
	}

	pub fn discovery_info(&self) -> DiscoveryInfo {
		let state = self.state.read().unwrap();
		let mut versions: BTreeMap<Strng, Vec<Strng>> = BTreeMap::new();
		for registration in state.registrations.values() {
			let entry = versions
				.entry(registration.capability.name.clone())
				.or_default();
			if !entry.contains(&registration.capability.version) {
				entry.push(registration.capability.version.clone());
			}
		}
		for list in versions.values_mut() {
			list.sort();
		}

		let mut by_invocations: Vec<(&Strng, &Registration)> =
			state.registrations.iter().collect();
		by_invocations.sort_by(|a, b| {
			b.1
				.stats
				.invocations
				.cmp(&a.1.stats.invocations)
				.then_with(|| a.0.cmp(b.0))
		});
		let popular = by_invocations
			.iter()
			.take(POPULAR_LIMIT)
			.map(|(id, _)| (*id).clone())
			.collect();
		let cutoff = now_ms().saturating_sub(TRENDING_WINDOW.as_millis() as u64);
		let trending = by_invocations
			.iter()
			.filter(|(_, r)| r.last_used_ms >= cutoff && r.stats.invocations > 0)
			.take(POPULAR_LIMIT)
			.map(|(id, _)| (*id).clone())
			.collect();

		DiscoveryInfo {
			categories: state.categories.keys().cloned().sorted().collect(),
			versions,
			dependencies: state
				.dependencies
				.iter()
				.map(|(k, v)| (k.clone(), v.clone()))
				.collect(),
			popular,
			trending,
		}
	}
}
