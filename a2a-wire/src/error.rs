use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::jsonrpc::JsonRpcError;

/// Failure classification shared by every fabric component. Each kind maps to a
/// reserved JSON-RPC error code and carries a default retryability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
	Protocol,
	Validation,
	CapabilityNotFound,
	Serialization,
	Timeout,
	AgentUnavailable,
	Authentication,
	Authorization,
	ResourceExhausted,
	Routing,
	Internal,
}

impl ErrorKind {
	pub fn code(&self) -> i32 {
		match self {
			ErrorKind::Protocol => -32600,
			ErrorKind::Validation => -32602,
			ErrorKind::CapabilityNotFound => -32601,
			ErrorKind::Serialization => -32700,
			ErrorKind::Timeout => -32000,
			ErrorKind::AgentUnavailable => -32001,
			ErrorKind::Authentication => -32002,
			ErrorKind::Authorization => -32003,
			ErrorKind::ResourceExhausted => -32004,
			ErrorKind::Routing => -32005,
			ErrorKind::Internal => -32603,
		}
	}

	pub fn from_code(code: i32) -> Option<ErrorKind> {
		match code {
			-32600 => Some(ErrorKind::Protocol),
			-32602 => Some(ErrorKind::Validation),
			-32601 => Some(ErrorKind::CapabilityNotFound),
			-32700 => Some(ErrorKind::Serialization),
			-32000 => Some(ErrorKind::Timeout),
			-32001 => Some(ErrorKind::AgentUnavailable),
			-32002 => Some(ErrorKind::Authentication),
			-32003 => Some(ErrorKind::Authorization),
			-32004 => Some(ErrorKind::ResourceExhausted),
			-32005 => Some(ErrorKind::Routing),
			-32603 => Some(ErrorKind::Internal),
			_ => None,
		}
	}

	/// Default retryability for this kind. Components may override per-error
	/// with [`A2aError::mark_retryable`].
	pub fn default_retryable(&self) -> bool {
		matches!(
			self,
			ErrorKind::Timeout | ErrorKind::Routing | ErrorKind::ResourceExhausted
		)
	}

	pub fn as_str(&self) -> &'static str {
		match self {
			ErrorKind::Protocol => "protocol_error",
			ErrorKind::Validation => "validation_error",
			ErrorKind::CapabilityNotFound => "capability_not_found",
			ErrorKind::Serialization => "serialization_error",
			ErrorKind::Timeout => "timeout_error",
			ErrorKind::AgentUnavailable => "agent_unavailable",
			ErrorKind::Authentication => "authentication_error",
			ErrorKind::Authorization => "authorization_error",
			ErrorKind::ResourceExhausted => "resource_exhausted",
			ErrorKind::Routing => "routing_error",
			ErrorKind::Internal => "internal_error",
		}
	}
}

impl std::fmt::Display for ErrorKind {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

fn render(kind: &ErrorKind, component: &Option<&'static str>, message: &String) -> String {
	match component {
		Some(c) => format!("{kind} [{c}]: {message}"),
		None => format!("{kind}: {message}"),
	}
}

/// The structured error every caller observes: kind, message, originating
/// component, retryability and optional context.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{}", render(.kind, .component, .message))]
pub struct A2aError {
	pub kind: ErrorKind,
	pub message: String,
	/// The component the error originated from ("transport", "registry", ...).
	pub component: Option<&'static str>,
	/// HTTP status backing a routing error, when there is one.
	pub http_status: Option<u16>,
	pub context: Option<JsonValue>,
	retryable_override: Option<bool>,
}

impl A2aError {
	pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
		Self {
			kind,
			message: message.into(),
			component: None,
			http_status: None,
			context: None,
			retryable_override: None,
		}
	}

	pub fn protocol(message: impl Into<String>) -> Self {
		Self::new(ErrorKind::Protocol, message)
	}

	pub fn validation(message: impl Into<String>) -> Self {
		Self::new(ErrorKind::Validation, message)
	}

	pub fn capability_not_found(message: impl Into<String>) -> Self {
		Self::new(ErrorKind::CapabilityNotFound, message)
	}

	pub fn serialization(message: impl Into<String>) -> Self {
		Self::new(ErrorKind::Serialization, message)
	}

	pub fn timeout(message: impl Into<String>) -> Self {
		Self::new(ErrorKind::Timeout, message)
	}

	pub fn unavailable(message: impl Into<String>) -> Self {
		Self::new(ErrorKind::AgentUnavailable, message)
	}

	pub fn authentication(message: impl Into<String>) -> Self {
		Self::new(ErrorKind::Authentication, message)
	}

	pub fn authorization(message: impl Into<String>) -> Self {
		Self::new(ErrorKind::Authorization, message)
	}

	pub fn resource_exhausted(message: impl Into<String>) -> Self {
		Self::new(ErrorKind::ResourceExhausted, message)
	}

	pub fn routing(message: impl Into<String>) -> Self {
		Self::new(ErrorKind::Routing, message)
	}

	pub fn internal(message: impl Into<String>) -> Self {
		Self::new(ErrorKind::Internal, message)
	}

	pub fn with_component(mut self, component: &'static str) -> Self {
		self.component = Some(component);
		self
	}

	pub fn with_status(mut self, status: u16) -> Self {
		self.http_status = Some(status);
		self
	}

	pub fn with_context(mut self, context: JsonValue) -> Self {
		self.context = Some(context);
		self
	}

	pub fn mark_retryable(mut self, retryable: bool) -> Self {
		self.retryable_override = Some(retryable);
		self
	}

	/// Routing errors backed by a non-5xx HTTP status are not worth retrying;
	/// everything else follows the kind default unless explicitly overridden.
	pub fn retryable(&self) -> bool {
		if let Some(r) = self.retryable_override {
			return r;
		}
		if self.kind == ErrorKind::Routing {
			if let Some(status) = self.http_status {
				return (500..600).contains(&status);
			}
		}
		self.kind.default_retryable()
	}

	pub fn to_jsonrpc(&self) -> JsonRpcError {
		JsonRpcError {
			code: self.kind.code(),
			message: self.message.clone(),
			data: self.context.clone(),
		}
	}

	pub fn from_jsonrpc(err: JsonRpcError) -> Self {
		let kind = ErrorKind::from_code(err.code).unwrap_or(ErrorKind::Internal);
		let mut out = Self::new(kind, err.message);
		out.context = err.data;
		out
	}
}

impl From<JsonRpcError> for A2aError {
	fn from(value: JsonRpcError) -> Self {
		A2aError::from_jsonrpc(value)
	}
}

impl From<std::io::Error> for A2aError {
	fn from(value: std::io::Error) -> Self {
		A2aError::routing(value.to_string())
	}
}

impl From<serde_json::Error> for A2aError {
	fn from(value: serde_json::Error) -> Self {
		A2aError::serialization(value.to_string())
	}
}
