pub mod error;
pub mod frame;
pub mod jsonrpc;
pub mod value;

pub use error::{A2aError, ErrorKind};
pub use frame::{Frame, FrameCodec, FrameType};
pub use jsonrpc::{JsonRpcError, JsonRpcVersion2_0, NumberOrString, RequestId};
pub use value::Value;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// The reserved `to` address for fan-out to every live connection.
pub const BROADCAST: &str = "broadcast";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
	Request,
	Response,
	Notification,
	Discovery,
	Registration,
	Heartbeat,
	CapabilityQuery,
	WorkflowCoordination,
	ResourceNegotiation,
	SecurityHandshake,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
	Low,
	Normal,
	High,
	Critical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Route {
	pub path: Vec<String>,
	pub hops: u32,
	pub max_hops: u32,
}

/// A JSON-RPC 2.0 message extended with the A2A envelope fields. A single type
/// covers requests, responses and notifications; `validate` enforces the shape
/// constraints the wire format requires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct A2aMessage {
	pub jsonrpc: JsonRpcVersion2_0,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub id: Option<RequestId>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub method: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub params: Option<Value>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub result: Option<Value>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub error: Option<JsonRpcError>,
	pub from: String,
	pub to: String,
	pub timestamp: u64,
	pub message_type: MessageType,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub priority: Option<Priority>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub route: Option<Route>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub signature: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub nonce: Option<String>,
}

pub fn now_ms() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_millis() as u64)
		.unwrap_or(0)
}

impl A2aMessage {
	pub fn request(
		method: impl Into<String>,
		params: Value,
		from: impl Into<String>,
		to: impl Into<String>,
	) -> A2aMessage {
		A2aMessage {
			jsonrpc: JsonRpcVersion2_0,
			id: None,
			method: Some(method.into()),
			params: Some(params),
			result: None,
			error: None,
			from: from.into(),
			to: to.into(),
			timestamp: now_ms(),
			message_type: MessageType::Request,
			priority: None,
			route: None,
			signature: None,
			nonce: None,
		}
	}

	pub fn notification(
		method: impl Into<String>,
		params: Value,
		from: impl Into<String>,
		to: impl Into<String>,
	) -> A2aMessage {
		let mut m = A2aMessage::request(method, params, from, to);
		m.message_type = MessageType::Notification;
		m
	}

	pub fn response_to(request: &A2aMessage, result: Value, from: impl Into<String>) -> A2aMessage {
		A2aMessage {
			jsonrpc: JsonRpcVersion2_0,
			id: request.id.clone(),
			method: None,
			params: None,
			result: Some(result),
			error: None,
			from: from.into(),
			to: request.from.clone(),
			timestamp: now_ms(),
			message_type: MessageType::Response,
			priority: None,
			route: None,
			signature: None,
			nonce: None,
		}
	}

	pub fn error_response_to(
		request: &A2aMessage,
		error: &A2aError,
		from: impl Into<String>,
	) -> A2aMessage {
		A2aMessage {
			jsonrpc: JsonRpcVersion2_0,
			id: request.id.clone(),
			method: None,
			params: None,
			result: None,
			error: Some(error.to_jsonrpc()),
			from: from.into(),
			to: request.from.clone(),
			timestamp: now_ms(),
			message_type: MessageType::Response,
			priority: None,
			route: None,
			signature: None,
			nonce: None,
		}
	}

	pub fn heartbeat(from: impl Into<String>, to: impl Into<String>) -> A2aMessage {
		let mut m = A2aMessage::request("heartbeat", Value::object(), from, to);
		m.message_type = MessageType::Heartbeat;
		m
	}

	pub fn with_id(mut self, id: impl Into<RequestId>) -> A2aMessage {
		self.id = Some(id.into());
		self
	}

	pub fn with_priority(mut self, priority: Priority) -> A2aMessage {
		self.priority = Some(priority);
		self
	}

	pub fn with_type(mut self, message_type: MessageType) -> A2aMessage {
		self.message_type = message_type;
		self
	}

	pub fn is_broadcast(&self) -> bool {
		self.to == BROADCAST
	}

	pub fn is_response(&self) -> bool {
		self.result.is_some() || self.error.is_some()
	}

	/// Extract the response payload, or the carried error.
	pub fn into_result(self) -> Result<Value, A2aError> {
		if let Some(err) = self.error {
			return Err(A2aError::from_jsonrpc(err));
		}
		Ok(self.result.unwrap_or(Value::Null))
	}

	pub fn validate(&self) -> Result<(), A2aError> {
		if self.is_response() {
			if self.result.is_some() && self.error.is_some() {
				return Err(A2aError::protocol(
					"response carries both result and error",
				));
			}
		} else if self.method.is_none() {
			return Err(A2aError::protocol("request is missing a method"));
		}
		if self.from.is_empty() || self.to.is_empty() {
			return Err(A2aError::protocol("message requires from and to"));
		}
		if let Some(route) = &self.route {
			if route.hops > route.max_hops {
				return Err(A2aError::protocol(format!(
					"route exceeded max hops ({} > {})",
					route.hops, route.max_hops
				)));
			}
		}
		Ok(())
	}

	pub fn from_slice(data: &[u8]) -> Result<A2aMessage, A2aError> {
		let de = &mut serde_json::Deserializer::from_slice(data);
		serde_path_to_error::deserialize(de)
			.map_err(|e| A2aError::serialization(e.to_string()))
	}

	pub fn to_bytes(&self) -> Result<Bytes, A2aError> {
		Ok(Bytes::from(serde_json::to_vec(self)?))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn request_roundtrip_preserves_envelope() {
		let msg = A2aMessage::request(
			"capability.invoke",
			Value::from_json(serde_json::json!({"a": 2, "b": 3})),
			"agent-1",
			"agent-2",
		)
		.with_id(7u64)
		.with_priority(Priority::High)
		.with_type(MessageType::CapabilityQuery);

		let bytes = msg.to_bytes().unwrap();
		let back = A2aMessage::from_slice(&bytes).unwrap();
		assert_eq!(back, msg);
		// Deserialize-then-serialize reproduces the exact bytes.
		assert_eq!(back.to_bytes().unwrap(), bytes);
	}

	#[test]
	fn wire_field_names() {
		let msg = A2aMessage::request("m", Value::object(), "a", "b").with_id("x");
		let json: serde_json::Value = serde_json::from_slice(&msg.to_bytes().unwrap()).unwrap();
		assert_eq!(json["jsonrpc"], "2.0");
		assert_eq!(json["messageType"], "request");
		assert_eq!(json["from"], "a");
		assert_eq!(json["to"], "b");
		assert!(json["timestamp"].is_u64());
	}

	#[test]
	fn response_exclusivity() {
		let req = A2aMessage::request("m", Value::object(), "a", "b").with_id(1u64);
		let mut resp = A2aMessage::response_to(&req, Value::from(5u64), "b");
		assert!(resp.validate().is_ok());
		assert_eq!(resp.to, "a");
		resp.error = Some(A2aError::internal("boom").to_jsonrpc());
		assert!(resp.validate().is_err());
	}

	#[test]
	fn error_response_carries_reserved_code() {
		let req = A2aMessage::request("m", Value::object(), "a", "b").with_id(1u64);
		let resp =
			A2aMessage::error_response_to(&req, &A2aError::capability_not_found("nope"), "b");
		assert_eq!(resp.error.as_ref().unwrap().code, -32601);
		assert!(resp.into_result().is_err());
	}

	#[test]
	fn route_hop_cap() {
		let mut msg = A2aMessage::request("m", Value::object(), "a", "b");
		msg.route = Some(Route {
			path: vec!["a".into(), "b".into()],
			hops: 3,
			max_hops: 2,
		});
		assert!(msg.validate().is_err());
	}

	#[test]
	fn broadcast_address() {
		let msg = A2aMessage::notification("ping", Value::object(), "a", BROADCAST);
		assert!(msg.is_broadcast());
	}
}
