use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt::Display;
use std::sync::Arc;

// JSON RPC serde inspired by https://github.com/4t145/rmcp/
pub trait ConstString: Default {
	const VALUE: &str;
	fn as_string(&self) -> &'static str {
		Self::VALUE
	}
}

#[macro_export]
macro_rules! const_string {
	($name:ident = $value:literal) => {
		#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
		pub struct $name;

		impl $crate::jsonrpc::ConstString for $name {
			const VALUE: &str = $value;
		}

		impl serde::Serialize for $name {
			fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
			where
				S: serde::Serializer,
			{
				$value.serialize(serializer)
			}
		}

		impl<'de> serde::Deserialize<'de> for $name {
			fn deserialize<D>(deserializer: D) -> Result<$name, D::Error>
			where
				D: serde::Deserializer<'de>,
			{
				let s: String = serde::Deserialize::deserialize(deserializer)?;
				if s == $value {
					Ok($name)
				} else {
					Err(serde::de::Error::custom(format!(concat!(
						"expect const string value \"",
						$value,
						"\""
					))))
				}
			}
		}
	};
}

const_string!(JsonRpcVersion2_0 = "2.0");

/// JSON-RPC ids may be numbers or strings. Null ids (error responses to
/// unparseable requests) are modeled by omitting the id on the envelope.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum NumberOrString {
	Number(u64),
	String(Arc<str>),
}

pub type RequestId = NumberOrString;

impl NumberOrString {
	pub fn into_json_value(self) -> JsonValue {
		match self {
			NumberOrString::Number(n) => JsonValue::Number(serde_json::Number::from(n)),
			NumberOrString::String(s) => JsonValue::String(s.to_string()),
		}
	}
}

impl From<u64> for NumberOrString {
	fn from(value: u64) -> Self {
		NumberOrString::Number(value)
	}
}

impl From<&str> for NumberOrString {
	fn from(value: &str) -> Self {
		NumberOrString::String(value.into())
	}
}

impl From<String> for NumberOrString {
	fn from(value: String) -> Self {
		NumberOrString::String(value.into())
	}
}

impl Display for NumberOrString {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			NumberOrString::Number(n) => Display::fmt(&n, f),
			NumberOrString::String(s) => Display::fmt(&s, f),
		}
	}
}

impl Serialize for NumberOrString {
	fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: serde::Serializer,
	{
		match self {
			NumberOrString::Number(n) => n.serialize(serializer),
			NumberOrString::String(s) => s.serialize(serializer),
		}
	}
}

impl<'de> Deserialize<'de> for NumberOrString {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		let value: JsonValue = Deserialize::deserialize(deserializer)?;
		match value {
			JsonValue::Number(n) => Ok(NumberOrString::Number(
				n.as_u64()
					.ok_or(serde::de::Error::custom("Expect an integer"))?,
			)),
			JsonValue::String(s) => Ok(NumberOrString::String(s.into())),
			_ => Err(serde::de::Error::custom("Expect number or string")),
		}
	}
}

/// The JSON-RPC 2.0 error object: `{code, message, data?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
	pub code: i32,
	pub message: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub data: Option<JsonValue>,
}

impl Display for JsonRpcError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{} ({})", self.message, self.code)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn id_roundtrip() {
		let n: NumberOrString = serde_json::from_str("42").unwrap();
		assert_eq!(n, NumberOrString::Number(42));
		assert_eq!(serde_json::to_string(&n).unwrap(), "42");

		let s: NumberOrString = serde_json::from_str("\"abc\"").unwrap();
		assert_eq!(s, NumberOrString::String("abc".into()));
		assert_eq!(serde_json::to_string(&s).unwrap(), "\"abc\"");
	}

	#[test]
	fn version_tag_strict() {
		assert!(serde_json::from_str::<JsonRpcVersion2_0>("\"2.0\"").is_ok());
		assert!(serde_json::from_str::<JsonRpcVersion2_0>("\"1.0\"").is_err());
	}

	#[test]
	fn error_object_omits_empty_data() {
		let e = JsonRpcError {
			code: -32600,
			message: "bad".to_string(),
			data: None,
		};
		assert_eq!(
			serde_json::to_string(&e).unwrap(),
			r#"{"code":-32600,"message":"bad"}"#
		);
	}
}
