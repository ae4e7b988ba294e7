//! Aggregations synthesize one composite capability out of several real ones:
//! a merged parameter schema, outputs wrapped per component id, and the most
//! conservative security/performance descriptors of the inputs.

use std::collections::BTreeMap;

use a2a_wire::{A2aError, Value};
use async_trait::async_trait;
use fabric_core::prelude::*;
use serde::{Deserialize, Serialize};

use super::CapabilityRegistry;
use super::capability::{
	Capability, CallerContext, CapabilityInvoker, PerformanceDescriptor, Schema,
	SecurityDescriptor,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationStrategy {
	/// Invoke all components concurrently with the same input.
	Merge,
	/// Chain components: each one sees the input merged with prior outputs.
	Compose,
	/// Invoke in declared order with the original input; later outputs shadow
	/// earlier ones when flattened by the consumer.
	Overlay,
}

/// Build the synthetic capability descriptor for an aggregation over the given
/// components.
pub(super) fn synthesize(
	name: &Strng,
	components: &[(Strng, Capability)],
	strategy: AggregationStrategy,
) -> Capability {
	let mut properties = BTreeMap::new();
	let mut required: Vec<String> = Vec::new();
	for (_, cap) in components {
		for (key, schema) in &cap.parameters.properties {
			// Merge silently shadows duplicate properties; later components win.
			properties.insert(key.clone(), schema.clone());
		}
		if strategy == AggregationStrategy::Compose {
			for req in &cap.parameters.required {
				if !required.contains(req) {
					required.push(req.clone());
				}
			}
		}
	}
	if strategy != AggregationStrategy::Compose {
		// For merge/overlay only the first component's requirements are binding;
		// downstream components tolerate missing inputs by design of shadowing.
		if let Some((_, first)) = components.first() {
			required = first.parameters.required.clone();
		}
	}

	let parameters = Schema {
		kind: Some("object".to_string()),
		properties,
		required,
		items: None,
		description: None,
	};

	let count = components.len().max(1) as f64;
	let avg_latency_ms = components
		.iter()
		.map(|(_, c)| c.performance.avg_latency_ms)
		.sum::<f64>()
		/ count;
	let resource_usage = components
		.iter()
		.map(|(_, c)| c.performance.resource_usage)
		.max()
		.unwrap_or_default();
	let cacheable = components.iter().all(|(_, c)| c.performance.cacheable);

	let min_trust_level = components
		.iter()
		.map(|(_, c)| c.security.min_trust_level)
		.max()
		.unwrap_or_default();
	let mut required_capabilities: Vec<Strng> = Vec::new();
	for (_, cap) in components {
		for req in &cap.security.required_capabilities {
			if !required_capabilities.contains(req) {
				required_capabilities.push(req.clone());
			}
		}
	}

	Capability {
		name: name.clone(),
		version: strng::literal!("1.0.0"),
		description: format!(
			"Aggregation over {}",
			components
				.iter()
				.map(|(id, _)| id.as_str())
				.collect::<Vec<_>>()
				.join(", ")
		),
		parameters,
		security: SecurityDescriptor {
			min_trust_level,
			required_capabilities,
			side_effects: components
				.iter()
				.flat_map(|(_, c)| c.security.side_effects.clone())
				.collect(),
		},
		performance: PerformanceDescriptor {
			avg_latency_ms,
			resource_usage,
			cacheable,
		},
		tags: vec![strng::literal!("aggregate")],
	}
}

/// The invoker behind a synthesized capability: dispatches to every component
/// per the aggregation strategy and wraps each output under its component id.
pub(super) struct AggregateInvoker {
	pub registry: Arc<CapabilityRegistry>,
	pub components: Vec<Strng>,
	pub strategy: AggregationStrategy,
}

#[async_trait]
impl CapabilityInvoker for AggregateInvoker {
	async fn invoke(&self, params: Value, ctx: &CallerContext) -> Result<Value, A2aError> {
		let mut wrapped = BTreeMap::new();
		match self.strategy {
			AggregationStrategy::Merge => {
				let calls = self.components.iter().map(|id| {
					let params = params.clone();
					async move { (id.clone(), self.registry.invoke(id, params, ctx).await) }
				});
				for (id, result) in futures::future::join_all(calls).await {
					wrapped.insert(id.to_string(), result?);
				}
			},
			AggregationStrategy::Compose => {
				let mut acc = params;
				for id in &self.components {
					let result = self.registry.invoke(id, acc.clone(), ctx).await?;
					acc = acc.merged_with(&result);
					wrapped.insert(id.to_string(), result);
				}
			},
			AggregationStrategy::Overlay => {
				for id in &self.components {
					let result = self.registry.invoke(id, params.clone(), ctx).await?;
					wrapped.insert(id.to_string(), result);
				}
			},
		}
		Ok(Value::Object(wrapped))
	}
}
