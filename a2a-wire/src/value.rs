use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Key marking an object as an encoded binary payload on the wire.
const BYTES_TAG: &str = "$bytes";

/// Tagged-union payload type for capability inputs/outputs and message params.
/// JSON scalars, arrays and objects, plus an opaque bytes variant for binary
/// payloads (base64 under a `$bytes` tag on the wire). Objects use a sorted map
/// so serialized forms are canonical.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
	#[default]
	Null,
	Bool(bool),
	Number(serde_json::Number),
	String(String),
	Bytes(Bytes),
	Array(Vec<Value>),
	Object(BTreeMap<String, Value>),
}

impl Value {
	pub fn object() -> Value {
		Value::Object(BTreeMap::new())
	}

	pub fn is_null(&self) -> bool {
		matches!(self, Value::Null)
	}

	pub fn as_bool(&self) -> Option<bool> {
		match self {
			Value::Bool(b) => Some(*b),
			_ => None,
		}
	}

	pub fn as_f64(&self) -> Option<f64> {
		match self {
			Value::Number(n) => n.as_f64(),
			_ => None,
		}
	}

	pub fn as_u64(&self) -> Option<u64> {
		match self {
			Value::Number(n) => n.as_u64(),
			_ => None,
		}
	}

	pub fn as_str(&self) -> Option<&str> {
		match self {
			Value::String(s) => Some(s),
			_ => None,
		}
	}

	pub fn as_bytes(&self) -> Option<&Bytes> {
		match self {
			Value::Bytes(b) => Some(b),
			_ => None,
		}
	}

	pub fn as_array(&self) -> Option<&[Value]> {
		match self {
			Value::Array(a) => Some(a),
			_ => None,
		}
	}

	pub fn as_object(&self) -> Option<&BTreeMap<String, Value>> {
		match self {
			Value::Object(o) => Some(o),
			_ => None,
		}
	}

	pub fn as_object_mut(&mut self) -> Option<&mut BTreeMap<String, Value>> {
		match self {
			Value::Object(o) => Some(o),
			_ => None,
		}
	}

	pub fn get(&self, key: &str) -> Option<&Value> {
		self.as_object().and_then(|o| o.get(key))
	}

	/// Dot-separated path lookup over nested objects.
	pub fn lookup(&self, path: &str) -> Option<&Value> {
		let mut cur = self;
		for part in path.split('.') {
			cur = cur.get(part)?;
		}
		Some(cur)
	}

	pub fn type_name(&self) -> &'static str {
		match self {
			Value::Null => "null",
			Value::Bool(_) => "boolean",
			Value::Number(_) => "number",
			Value::String(_) => "string",
			Value::Bytes(_) => "bytes",
			Value::Array(_) => "array",
			Value::Object(_) => "object",
		}
	}

	/// Shallow merge: `{...self, ...other}` when both sides are objects.
	/// A non-object `other` replaces `self`; a non-object `self` is replaced.
	pub fn merged_with(&self, other: &Value) -> Value {
		match (self, other) {
			(Value::Object(a), Value::Object(b)) => {
				let mut out = a.clone();
				for (k, v) in b {
					out.insert(k.clone(), v.clone());
				}
				Value::Object(out)
			},
			_ => other.clone(),
		}
	}

	pub fn from_json(value: JsonValue) -> Value {
		match value {
			JsonValue::Null => Value::Null,
			JsonValue::Bool(b) => Value::Bool(b),
			JsonValue::Number(n) => Value::Number(n),
			JsonValue::String(s) => Value::String(s),
			JsonValue::Array(a) => Value::Array(a.into_iter().map(Value::from_json).collect()),
			JsonValue::Object(o) => {
				// An object of exactly {"$bytes": "<base64>"} is an encoded binary payload.
				if o.len() == 1 {
					if let Some(JsonValue::String(encoded)) = o.get(BYTES_TAG) {
						if let Ok(decoded) = BASE64.decode(encoded) {
							return Value::Bytes(Bytes::from(decoded));
						}
					}
				}
				Value::Object(
					o.into_iter()
						.map(|(k, v)| (k, Value::from_json(v)))
						.collect(),
				)
			},
		}
	}

	pub fn to_json(&self) -> JsonValue {
		match self {
			Value::Null => JsonValue::Null,
			Value::Bool(b) => JsonValue::Bool(*b),
			Value::Number(n) => JsonValue::Number(n.clone()),
			Value::String(s) => JsonValue::String(s.clone()),
			Value::Bytes(b) => {
				let mut map = serde_json::Map::new();
				map.insert(
					BYTES_TAG.to_string(),
					JsonValue::String(BASE64.encode(b)),
				);
				JsonValue::Object(map)
			},
			Value::Array(a) => JsonValue::Array(a.iter().map(Value::to_json).collect()),
			Value::Object(o) => JsonValue::Object(
				o.iter()
					.map(|(k, v)| (k.clone(), v.to_json()))
					.collect(),
			),
		}
	}
}

impl Serialize for Value {
	fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: serde::Serializer,
	{
		match self {
			Value::Null => serializer.serialize_unit(),
			Value::Bool(b) => serializer.serialize_bool(*b),
			Value::Number(n) => n.serialize(serializer),
			Value::String(s) => serializer.serialize_str(s),
			Value::Bytes(b) => {
				use serde::ser::SerializeMap;
				let mut map = serializer.serialize_map(Some(1))?;
				map.serialize_entry(BYTES_TAG, &BASE64.encode(b))?;
				map.end()
			},
			Value::Array(a) => a.serialize(serializer),
			Value::Object(o) => o.serialize(serializer),
		}
	}
}

impl<'de> Deserialize<'de> for Value {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		let raw = JsonValue::deserialize(deserializer)?;
		Ok(Value::from_json(raw))
	}
}

impl From<bool> for Value {
	fn from(value: bool) -> Self {
		Value::Bool(value)
	}
}

impl From<i64> for Value {
	fn from(value: i64) -> Self {
		Value::Number(serde_json::Number::from(value))
	}
}

impl From<u64> for Value {
	fn from(value: u64) -> Self {
		Value::Number(serde_json::Number::from(value))
	}
}

impl From<f64> for Value {
	fn from(value: f64) -> Self {
		serde_json::Number::from_f64(value)
			.map(Value::Number)
			.unwrap_or(Value::Null)
	}
}

impl From<&str> for Value {
	fn from(value: &str) -> Self {
		Value::String(value.to_string())
	}
}

impl From<String> for Value {
	fn from(value: String) -> Self {
		Value::String(value)
	}
}

impl From<Bytes> for Value {
	fn from(value: Bytes) -> Self {
		Value::Bytes(value)
	}
}

impl From<Vec<Value>> for Value {
	fn from(value: Vec<Value>) -> Self {
		Value::Array(value)
	}
}

impl From<BTreeMap<String, Value>> for Value {
	fn from(value: BTreeMap<String, Value>) -> Self {
		Value::Object(value)
	}
}

impl From<JsonValue> for Value {
	fn from(value: JsonValue) -> Self {
		Value::from_json(value)
	}
}

impl FromIterator<(String, Value)> for Value {
	fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
		Value::Object(iter.into_iter().collect())
	}
}
