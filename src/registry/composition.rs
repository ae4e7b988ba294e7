use std::collections::{BTreeMap, HashMap};

use a2a_wire::{A2aError, Value};
use fabric_core::prelude::*;
use serde::{Deserialize, Serialize};

use super::CapabilityRegistry;
use super::capability::{CallerContext, TrustLevel};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStrategy {
	#[default]
	Sequential,
	Parallel,
	Pipeline,
	Conditional,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "policy")]
pub enum ErrorPolicy {
	FailFast,
	Continue,
	Retry {
		max_attempts: u32,
		base_delay_ms: u64,
	},
}

impl Default for ErrorPolicy {
	fn default() -> Self {
		ErrorPolicy::FailFast
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOp {
	Exists,
	Eq,
	Ne,
	Gt,
	Lt,
}

/// Predicate evaluated over the accumulated execution state before a
/// conditional step runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepCondition {
	pub field: String,
	pub op: ConditionOp,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub value: Option<Value>,
}

impl StepCondition {
	pub fn evaluate(&self, state: &Value) -> bool {
		let found = state.lookup(&self.field);
		match self.op {
			ConditionOp::Exists => found.is_some(),
			ConditionOp::Eq => found == self.value.as_ref(),
			ConditionOp::Ne => found != self.value.as_ref(),
			ConditionOp::Gt => match (found.and_then(Value::as_f64), self.value.as_ref()) {
				(Some(a), Some(b)) => b.as_f64().is_some_and(|b| a > b),
				_ => false,
			},
			ConditionOp::Lt => match (found.and_then(Value::as_f64), self.value.as_ref()) {
				(Some(a), Some(b)) => b.as_f64().is_some_and(|b| a < b),
				_ => false,
			},
		}
	}
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompositionSecurity {
	#[serde(default)]
	pub min_trust_level: TrustLevel,
	#[serde(default)]
	pub required_capabilities: Vec<Strng>,
	#[serde(default)]
	pub elevated_privileges: bool,
}

/// A dependency-ordered grouping of capabilities executed under one policy.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Composition {
	pub id: Strng,
	/// Registration ids, in declared execution order.
	pub capabilities: Vec<Strng>,
	/// Adjacency list: capability id → prerequisites, all of which must be
	/// members of `capabilities`.
	#[serde(default)]
	pub dependencies: HashMap<Strng, Vec<Strng>>,
	#[serde(default)]
	pub strategy: ExecutionStrategy,
	#[serde(default)]
	pub error_policy: ErrorPolicy,
	#[serde(default, deserialize_with = "duration_str::deserialize_option_duration")]
	pub timeout: Option<Duration>,
	#[serde(default)]
	pub security: CompositionSecurity,
	#[serde(default)]
	pub conditions: HashMap<Strng, StepCondition>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompositionStatus {
	Completed,
	CompletedWithErrors,
}

/// Results keyed by capability id; `parallel` consumers must treat the map as
/// unordered.
#[derive(Debug)]
pub struct CompositionOutcome {
	pub results: BTreeMap<Strng, Value>,
	pub errors: BTreeMap<Strng, A2aError>,
	pub status: CompositionStatus,
	pub duration: Duration,
}

impl Composition {
	/// Structural validation against the registry: every referenced capability
	/// registered, every dependency endpoint a member, dependency graph acyclic.
	pub fn validate(&self, registry: &CapabilityRegistry) -> Result<(), A2aError> {
		if self.capabilities.is_empty() {
			return Err(A2aError::validation(format!(
				"composition {} has no capabilities",
				self.id
			)));
		}
		for cap in &self.capabilities {
			if registry.get(cap).is_none() {
				return Err(A2aError::capability_not_found(format!(
					"composition {} references unregistered capability {}",
					self.id, cap
				)));
			}
		}
		for (from, targets) in &self.dependencies {
			if !self.capabilities.contains(from) {
				return Err(A2aError::validation(format!(
					"dependency source {from} is not part of composition {}",
					self.id
				)));
			}
			for to in targets {
				if !self.capabilities.contains(to) {
					return Err(A2aError::validation(format!(
						"dependency target {to} is not part of composition {}",
						self.id
					)));
				}
			}
		}
		if let Some(node) = find_cycle(&self.capabilities, &self.dependencies) {
			return Err(A2aError::validation(format!(
				"composition {} dependency graph has a cycle through {node}",
				self.id
			)));
		}
		Ok(())
	}

	pub(super) fn security_gate(&self, ctx: &CallerContext) -> Result<(), A2aError> {
		if ctx.trust_level < self.security.min_trust_level {
			return Err(
				A2aError::authorization(format!(
					"caller {} trust level {:?} is below the required {:?}",
					ctx.agent, ctx.trust_level, self.security.min_trust_level
				))
				.with_component("registry"),
			);
		}
		for required in &self.security.required_capabilities {
			if !ctx.held_capabilities.contains(required) {
				return Err(
					A2aError::authorization(format!(
						"caller {} is missing required capability {required}",
						ctx.agent
					))
					.with_component("registry"),
				);
			}
		}
		Ok(())
	}
}

/// Iterative three-color DFS. Returns a node on a cycle, if any; recursion is
/// avoided so arbitrarily deep compositions cannot overflow the stack.
pub(super) fn find_cycle(
	nodes: &[Strng],
	edges: &HashMap<Strng, Vec<Strng>>,
) -> Option<Strng> {
	#[derive(Clone, Copy, PartialEq)]
	enum Color {
		White,
		Gray,
		Black,
	}
	let empty: Vec<Strng> = Vec::new();
	let mut color: HashMap<&Strng, Color> = nodes.iter().map(|n| (n, Color::White)).collect();

	for start in nodes {
		if color.get(start) != Some(&Color::White) {
			continue;
		}
		let mut stack: Vec<(&Strng, usize)> = vec![(start, 0)];
		color.insert(start, Color::Gray);
		while let Some((node, next_child)) = stack.last().copied() {
			let children = edges.get(node).unwrap_or(&empty);
			if next_child < children.len() {
				stack.last_mut().unwrap().1 += 1;
				let child = &children[next_child];
				match color.get(child) {
					Some(Color::White) => {
						color.insert(child, Color::Gray);
						stack.push((child, 0));
					},
					Some(Color::Gray) => return Some(child.clone()),
					// Black or a node outside the composition (caught by validate).
					_ => {},
				}
			} else {
				color.insert(node, Color::Black);
				stack.pop();
			}
		}
	}
	None
}

pub(super) async fn run(
	registry: &CapabilityRegistry,
	composition: &Composition,
	params: Value,
	ctx: &CallerContext,
) -> Result<CompositionOutcome, A2aError> {
	let started = Instant::now();
	let mut results = BTreeMap::new();
	let mut errors: BTreeMap<Strng, A2aError> = BTreeMap::new();

	match composition.strategy {
		ExecutionStrategy::Sequential => {
			for cap in &composition.capabilities {
				match invoke_step(registry, composition, cap, params.clone(), ctx).await {
					Ok(value) => {
						results.insert(cap.clone(), value);
					},
					Err(e) => {
						if matches!(composition.error_policy, ErrorPolicy::FailFast) {
							return Err(e);
						}
						errors.insert(cap.clone(), e);
					},
				}
			}
		},
		ExecutionStrategy::Parallel => {
			let steps = composition.capabilities.iter().map(|cap| {
				let params = params.clone();
				async move {
					(
						cap.clone(),
						invoke_step(registry, composition, cap, params, ctx).await,
					)
				}
			});
			let settled = futures::future::join_all(steps).await;
			// The error policy applies only after every step settles.
			for (cap, result) in settled {
				match result {
					Ok(value) => {
						results.insert(cap, value);
					},
					Err(e) => {
						errors.insert(cap, e);
					},
				}
			}
			if matches!(composition.error_policy, ErrorPolicy::FailFast) {
				if let Some(cap) = composition
					.capabilities
					.iter()
					.find(|cap| errors.contains_key(*cap))
				{
					return Err(errors.remove(cap).unwrap());
				}
			}
		},
		ExecutionStrategy::Pipeline => {
			// Each step's object result is merged into the next step's params.
			let mut acc = params;
			for cap in &composition.capabilities {
				match invoke_step(registry, composition, cap, acc.clone(), ctx).await {
					Ok(value) => {
						acc = acc.merged_with(&value);
						results.insert(cap.clone(), value);
					},
					Err(e) => {
						if matches!(composition.error_policy, ErrorPolicy::FailFast) {
							return Err(e);
						}
						errors.insert(cap.clone(), e);
					},
				}
			}
		},
		ExecutionStrategy::Conditional => {
			// Accumulated state: the input params with each step's result layered
			// under the step id. Steps without a condition always run.
			let mut state = params.clone();
			for cap in &composition.capabilities {
				if let Some(condition) = composition.conditions.get(cap) {
					if !condition.evaluate(&state) {
						debug!(step=%cap, "condition not met, skipping step");
						continue;
					}
				}
				match invoke_step(registry, composition, cap, params.clone(), ctx).await {
					Ok(value) => {
						if let Some(obj) = state.as_object_mut() {
							obj.insert(cap.to_string(), value.clone());
						}
						results.insert(cap.clone(), value);
					},
					Err(e) => {
						if matches!(composition.error_policy, ErrorPolicy::FailFast) {
							return Err(e);
						}
						errors.insert(cap.clone(), e);
					},
				}
			}
		},
	}

	let status = if errors.is_empty() {
		CompositionStatus::Completed
	} else {
		CompositionStatus::CompletedWithErrors
	};
	Ok(CompositionOutcome {
		results,
		errors,
		status,
		duration: started.elapsed(),
	})
}

/// One step under the composition's error policy: `retry` does capped
/// exponential per-step retries before surfacing the failure (which the caller
/// then treats as `continue` unless the policy is fail-fast).
async fn invoke_step(
	registry: &CapabilityRegistry,
	composition: &Composition,
	cap: &Strng,
	params: Value,
	ctx: &CallerContext,
) -> Result<Value, A2aError> {
	let (retries, base_delay) = match composition.error_policy {
		ErrorPolicy::Retry {
			max_attempts,
			base_delay_ms,
		} => (max_attempts, Duration::from_millis(base_delay_ms)),
		_ => (0, Duration::ZERO),
	};
	let mut attempt: u32 = 0;
	loop {
		attempt += 1;
		match registry.invoke(cap, params.clone(), ctx).await {
			Ok(value) => return Ok(value),
			Err(e) => {
				if attempt > retries {
					return Err(e);
				}
				let delay = base_delay * 2u32.pow(attempt - 1);
				debug!(step=%cap, attempt, ?delay, "step failed, retrying: {e}");
				tokio::time::sleep(delay).await;
			},
		}
	}
}
