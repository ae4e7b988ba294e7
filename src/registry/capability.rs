use std::collections::{BTreeMap, HashSet};

use a2a_wire::{A2aError, A2aMessage, MessageType, Value, now_ms};
use async_trait::async_trait;
use fabric_core::prelude::*;
use serde::{Deserialize, Serialize};

use crate::transport::Transport;

/// Totally-ordered principal classification gating capability use.
#[derive(
	Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
	#[default]
	Untrusted,
	Basic,
	Verified,
	Trusted,
	Privileged,
}

#[derive(
	Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ResourceUsage {
	#[default]
	Low,
	Medium,
	High,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityStatus {
	#[default]
	Active,
	Deprecated,
	Disabled,
	Maintenance,
}

/// A JSON-Schema-like parameter description. Enough structure for the registry
/// to validate capability inputs at the boundary; not a full JSON Schema.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
	#[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
	pub kind: Option<String>,
	#[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
	pub properties: BTreeMap<String, Schema>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub required: Vec<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub items: Option<Box<Schema>>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub description: Option<String>,
}

impl Schema {
	pub fn typed(kind: &str) -> Schema {
		Schema {
			kind: Some(kind.to_string()),
			..Default::default()
		}
	}

	pub fn number() -> Schema {
		Schema::typed("number")
	}

	pub fn string() -> Schema {
		Schema::typed("string")
	}

	pub fn boolean() -> Schema {
		Schema::typed("boolean")
	}

	pub fn object(
		properties: impl IntoIterator<Item = (&'static str, Schema)>,
		required: impl IntoIterator<Item = &'static str>,
	) -> Schema {
		Schema {
			kind: Some("object".to_string()),
			properties: properties
				.into_iter()
				.map(|(k, v)| (k.to_string(), v))
				.collect(),
			required: required.into_iter().map(str::to_string).collect(),
			..Default::default()
		}
	}

	pub fn validate(&self, value: &Value) -> Result<(), A2aError> {
		self.validate_at(value, "$")
	}

	fn validate_at(&self, value: &Value, path: &str) -> Result<(), A2aError> {
		if let Some(kind) = &self.kind {
			let matches = match kind.as_str() {
				"object" => value.as_object().is_some(),
				"array" => value.as_array().is_some(),
				"string" => value.as_str().is_some(),
				"number" | "integer" => value.as_f64().is_some(),
				"boolean" => value.as_bool().is_some(),
				"bytes" => value.as_bytes().is_some(),
				"null" => value.is_null(),
				_ => true,
			};
			if !matches {
				return Err(A2aError::validation(format!(
					"{path}: expected {kind}, got {}",
					value.type_name()
				)));
			}
		}
		if let Some(object) = value.as_object() {
			for req in &self.required {
				if !object.contains_key(req) {
					return Err(A2aError::validation(format!(
						"{path}: missing required property {req:?}"
					)));
				}
			}
			for (key, schema) in &self.properties {
				if let Some(child) = object.get(key) {
					schema.validate_at(child, &format!("{path}.{key}"))?;
				}
			}
		}
		if let (Some(items), Some(array)) = (&self.items, value.as_array()) {
			for (i, child) in array.iter().enumerate() {
				items.validate_at(child, &format!("{path}[{i}]"))?;
			}
		}
		Ok(())
	}
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityDescriptor {
	#[serde(default)]
	pub min_trust_level: TrustLevel,
	#[serde(default)]
	pub required_capabilities: Vec<Strng>,
	#[serde(default)]
	pub side_effects: Vec<Strng>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceDescriptor {
	pub avg_latency_ms: f64,
	#[serde(default)]
	pub resource_usage: ResourceUsage,
	#[serde(default)]
	pub cacheable: bool,
}

impl Default for PerformanceDescriptor {
	fn default() -> Self {
		Self {
			avg_latency_ms: 100.0,
			resource_usage: ResourceUsage::default(),
			cacheable: false,
		}
	}
}

/// A named, versioned, schematized unit of remote work. `name` + `version`
/// uniquely identify a capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capability {
	pub name: Strng,
	pub version: Strng,
	pub description: String,
	#[serde(default)]
	pub parameters: Schema,
	#[serde(default)]
	pub security: SecurityDescriptor,
	#[serde(default)]
	pub performance: PerformanceDescriptor,
	#[serde(default)]
	pub tags: Vec<Strng>,
}

impl Capability {
	pub fn validate(&self) -> Result<(), A2aError> {
		if self.name.is_empty() {
			return Err(A2aError::validation("capability name must not be empty"));
		}
		if self.version.is_empty() {
			return Err(A2aError::validation("capability version must not be empty"));
		}
		if self.description.is_empty() {
			return Err(A2aError::validation(format!(
				"capability {} requires a description",
				self.name
			)));
		}
		if !self
			.version
			.split('.')
			.all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_digit()))
		{
			return Err(A2aError::validation(format!(
				"capability {} version {:?} is not a dotted version",
				self.name, self.version
			)));
		}
		Ok(())
	}

	/// Category is the name prefix before the first dot ("math.add" → "math").
	pub fn category(&self) -> Strng {
		match self.name.split_once('.') {
			Some((prefix, _)) => strng::new(prefix),
			None => strng::literal!("general"),
		}
	}
}

/// The principal invoking capabilities: identity, trust level, and the
/// capability names it holds.
#[derive(Debug, Clone, Default)]
pub struct CallerContext {
	pub agent: Strng,
	pub trust_level: TrustLevel,
	pub held_capabilities: HashSet<Strng>,
}

impl CallerContext {
	pub fn new(agent: impl AsRef<str>, trust_level: TrustLevel) -> CallerContext {
		CallerContext {
			agent: strng::new(agent),
			trust_level,
			held_capabilities: HashSet::new(),
		}
	}

	pub fn holding(mut self, capabilities: impl IntoIterator<Item = &'static str>) -> Self {
		self
			.held_capabilities
			.extend(capabilities.into_iter().map(strng::new));
		self
	}
}

#[async_trait]
pub trait CapabilityInvoker: Send + Sync {
	async fn invoke(&self, params: Value, ctx: &CallerContext) -> Result<Value, A2aError>;
}

/// Wrap a plain function as an invoker. Used for locally-implemented
/// capabilities and throughout the tests.
pub struct FnInvoker<F>(F);

#[async_trait]
impl<F> CapabilityInvoker for FnInvoker<F>
where
	F: Fn(Value) -> Result<Value, A2aError> + Send + Sync,
{
	async fn invoke(&self, params: Value, _ctx: &CallerContext) -> Result<Value, A2aError> {
		(self.0)(params)
	}
}

pub fn invoker_fn<F>(f: F) -> Arc<dyn CapabilityInvoker>
where
	F: Fn(Value) -> Result<Value, A2aError> + Send + Sync + 'static,
{
	Arc::new(FnInvoker(f))
}

/// Invoker backed by a transport connection: the capability call becomes a
/// `capability_query` request to the owning peer.
pub struct RemoteInvoker {
	transport: Arc<Transport>,
	conn_id: Strng,
	method: String,
	local_agent: Strng,
	peer: Strng,
}

impl RemoteInvoker {
	pub fn new(
		transport: Arc<Transport>,
		conn_id: Strng,
		method: impl Into<String>,
		local_agent: Strng,
		peer: Strng,
	) -> Arc<RemoteInvoker> {
		Arc::new(RemoteInvoker {
			transport,
			conn_id,
			method: method.into(),
			local_agent,
			peer,
		})
	}
}

#[async_trait]
impl CapabilityInvoker for RemoteInvoker {
	async fn invoke(&self, params: Value, _ctx: &CallerContext) -> Result<Value, A2aError> {
		let msg = A2aMessage::request(
			self.method.clone(),
			params,
			self.local_agent.to_string(),
			self.peer.to_string(),
		)
		.with_type(MessageType::CapabilityQuery);
		let response = self.transport.send_request(&self.conn_id, msg).await?;
		response.into_result()
	}
}

/// Running usage statistics: averages over the `(n−1)` prior samples plus the
/// new one. One increment per completed invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageStats {
	pub invocations: u64,
	pub success_rate: f64,
	pub avg_latency_ms: f64,
}

impl UsageStats {
	pub fn record(&mut self, success: bool, latency_ms: f64) {
		let n = (self.invocations + 1) as f64;
		let outcome = if success { 1.0 } else { 0.0 };
		self.success_rate = (self.success_rate * (n - 1.0) + outcome) / n;
		self.avg_latency_ms = (self.avg_latency_ms * (n - 1.0) + latency_ms) / n;
		self.invocations += 1;
	}
}

/// A bound capability: the descriptor plus its invoker and live usage state.
#[derive(Clone)]
pub struct Registration {
	pub capability: Capability,
	pub invoker: Arc<dyn CapabilityInvoker>,
	pub registered_at_ms: u64,
	pub last_used_ms: u64,
	pub stats: UsageStats,
	pub status: CapabilityStatus,
}

impl Registration {
	pub fn new(capability: Capability, invoker: Arc<dyn CapabilityInvoker>) -> Registration {
		Registration {
			capability,
			invoker,
			registered_at_ms: now_ms(),
			last_used_ms: 0,
			stats: UsageStats::default(),
			status: CapabilityStatus::Active,
		}
	}

	/// Query ranking weight: `successRate × (1 / max(avgLatency, 1))`.
	pub fn rank(&self) -> f64 {
		self.stats.success_rate * (1.0 / self.stats.avg_latency_ms.max(1.0))
	}
}
