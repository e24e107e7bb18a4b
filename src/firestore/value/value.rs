use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::firestore::model::{DocumentKey, GeoPoint, Timestamp};
use crate::firestore::value::{ArrayValue, BytesValue, MapValue};

/// A single Firestore field value.
///
/// Equality follows Firestore semantics rather than Rust's float rules: `NaN`
/// equals `NaN`, and an integer never equals a double even when numerically
/// identical. Use [`compare_values`](crate::firestore::value::compare_values)
/// for the total ordering used by queries.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FirestoreValue {
    kind: ValueKind,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ValueKind {
    Null,
    Boolean(bool),
    Integer(i64),
    Double(#[serde(with = "double_repr")] f64),
    Timestamp(Timestamp),
    /// Placeholder written locally for a pending server timestamp transform.
    ServerTimestamp {
        local_write_time: Timestamp,
        previous: Option<Box<FirestoreValue>>,
    },
    String(String),
    Bytes(BytesValue),
    /// Document reference, stored as the referenced key's path.
    Reference(String),
    GeoPoint(GeoPoint),
    Array(ArrayValue),
    Map(MapValue),
}

impl FirestoreValue {
    pub fn null() -> Self {
        Self {
            kind: ValueKind::Null,
        }
    }

    pub fn from_bool(value: bool) -> Self {
        Self {
            kind: ValueKind::Boolean(value),
        }
    }

    pub fn from_integer(value: i64) -> Self {
        Self {
            kind: ValueKind::Integer(value),
        }
    }

    pub fn from_double(value: f64) -> Self {
        Self {
            kind: ValueKind::Double(value),
        }
    }

    pub fn from_timestamp(value: Timestamp) -> Self {
        Self {
            kind: ValueKind::Timestamp(value),
        }
    }

    pub fn server_timestamp(local_write_time: Timestamp, previous: Option<FirestoreValue>) -> Self {
        // Chained server timestamps keep the value that preceded the first one.
        let previous = match previous {
            Some(value) => match value.kind {
                ValueKind::ServerTimestamp { previous, .. } => previous,
                _ => Some(Box::new(value)),
            },
            None => None,
        };
        Self {
            kind: ValueKind::ServerTimestamp {
                local_write_time,
                previous,
            },
        }
    }

    pub fn from_string(value: impl Into<String>) -> Self {
        Self {
            kind: ValueKind::String(value.into()),
        }
    }

    pub fn from_bytes(value: BytesValue) -> Self {
        Self {
            kind: ValueKind::Bytes(value),
        }
    }

    pub fn from_reference(key: &DocumentKey) -> Self {
        Self {
            kind: ValueKind::Reference(key.path().canonical_string()),
        }
    }

    pub fn from_geo_point(value: GeoPoint) -> Self {
        Self {
            kind: ValueKind::GeoPoint(value),
        }
    }

    pub fn from_array(values: Vec<FirestoreValue>) -> Self {
        Self {
            kind: ValueKind::Array(ArrayValue::new(values)),
        }
    }

    pub fn from_map(map: BTreeMap<String, FirestoreValue>) -> Self {
        Self {
            kind: ValueKind::Map(MapValue::new(map)),
        }
    }

    pub fn kind(&self) -> &ValueKind {
        &self.kind
    }

    pub fn into_kind(self) -> ValueKind {
        self.kind
    }

    pub fn is_null(&self) -> bool {
        matches!(self.kind, ValueKind::Null)
    }

    pub fn is_number(&self) -> bool {
        matches!(self.kind, ValueKind::Integer(_) | ValueKind::Double(_))
    }

    pub fn is_nan(&self) -> bool {
        matches!(self.kind, ValueKind::Double(value) if value.is_nan())
    }

    pub fn is_array(&self) -> bool {
        matches!(self.kind, ValueKind::Array(_))
    }

    pub fn as_map(&self) -> Option<&MapValue> {
        match &self.kind {
            ValueKind::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&ArrayValue> {
        match &self.kind {
            ValueKind::Array(array) => Some(array),
            _ => None,
        }
    }

    /// Stable textual form used to build canonical query ids.
    pub fn canonical_string(&self) -> String {
        match &self.kind {
            ValueKind::Null => "null".to_string(),
            ValueKind::Boolean(value) => value.to_string(),
            ValueKind::Integer(value) => value.to_string(),
            ValueKind::Double(value) => format!("{value:?}"),
            ValueKind::Timestamp(ts) => format!("time({},{})", ts.seconds, ts.nanos),
            ValueKind::ServerTimestamp {
                local_write_time, ..
            } => format!(
                "serverTime({},{})",
                local_write_time.seconds, local_write_time.nanos
            ),
            ValueKind::String(value) => value.clone(),
            ValueKind::Bytes(bytes) => bytes.to_base64(),
            ValueKind::Reference(path) => path.clone(),
            ValueKind::GeoPoint(point) => format!("geo({},{})", point.latitude(), point.longitude()),
            ValueKind::Array(array) => {
                let parts: Vec<String> = array
                    .values()
                    .iter()
                    .map(FirestoreValue::canonical_string)
                    .collect();
                format!("[{}]", parts.join(","))
            }
            ValueKind::Map(map) => {
                let parts: Vec<String> = map
                    .fields()
                    .iter()
                    .map(|(key, value)| format!("{key}:{}", value.canonical_string()))
                    .collect();
                format!("{{{}}}", parts.join(","))
            }
        }
    }

    /// Rough in-memory footprint, used for remote document cache accounting.
    pub fn estimate_byte_size(&self) -> usize {
        match &self.kind {
            ValueKind::Null | ValueKind::Boolean(_) => 4,
            ValueKind::Integer(_) | ValueKind::Double(_) => 8,
            ValueKind::Timestamp(_) | ValueKind::GeoPoint(_) => 16,
            ValueKind::ServerTimestamp { previous, .. } => {
                16 + previous
                    .as_ref()
                    .map(|value| value.estimate_byte_size())
                    .unwrap_or(0)
            }
            ValueKind::String(value) => value.len() * 2,
            ValueKind::Bytes(bytes) => bytes.as_slice().len(),
            ValueKind::Reference(path) => path.len(),
            ValueKind::Array(array) => array
                .values()
                .iter()
                .map(FirestoreValue::estimate_byte_size)
                .sum(),
            ValueKind::Map(map) => map.estimate_byte_size(),
        }
    }
}

impl PartialEq for FirestoreValue {
    fn eq(&self, other: &Self) -> bool {
        match (&self.kind, &other.kind) {
            (ValueKind::Null, ValueKind::Null) => true,
            (ValueKind::Boolean(l), ValueKind::Boolean(r)) => l == r,
            (ValueKind::Integer(l), ValueKind::Integer(r)) => l == r,
            (ValueKind::Double(l), ValueKind::Double(r)) => {
                (l.is_nan() && r.is_nan()) || l == r
            }
            (ValueKind::Timestamp(l), ValueKind::Timestamp(r)) => l == r,
            (
                ValueKind::ServerTimestamp {
                    local_write_time: l,
                    ..
                },
                ValueKind::ServerTimestamp {
                    local_write_time: r,
                    ..
                },
            ) => l == r,
            (ValueKind::String(l), ValueKind::String(r)) => l == r,
            (ValueKind::Bytes(l), ValueKind::Bytes(r)) => l == r,
            (ValueKind::Reference(l), ValueKind::Reference(r)) => l == r,
            (ValueKind::GeoPoint(l), ValueKind::GeoPoint(r)) => l == r,
            (ValueKind::Array(l), ValueKind::Array(r)) => l == r,
            (ValueKind::Map(l), ValueKind::Map(r)) => l == r,
            _ => false,
        }
    }
}

impl From<i64> for FirestoreValue {
    fn from(value: i64) -> Self {
        Self::from_integer(value)
    }
}

impl From<f64> for FirestoreValue {
    fn from(value: f64) -> Self {
        Self::from_double(value)
    }
}

impl From<bool> for FirestoreValue {
    fn from(value: bool) -> Self {
        Self::from_bool(value)
    }
}

impl From<&str> for FirestoreValue {
    fn from(value: &str) -> Self {
        Self::from_string(value)
    }
}

impl From<String> for FirestoreValue {
    fn from(value: String) -> Self {
        Self::from_string(value)
    }
}

/// JSON cannot carry non-finite doubles, so those round-trip as strings.
mod double_repr {
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(f64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_nan() {
            serializer.serialize_str("NaN")
        } else if value.is_infinite() {
            serializer.serialize_str(if *value > 0.0 { "Infinity" } else { "-Infinity" })
        } else {
            serializer.serialize_f64(*value)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Number(value) => Ok(value),
            Repr::Text(text) => match text.as_str() {
                "NaN" => Ok(f64::NAN),
                "Infinity" => Ok(f64::INFINITY),
                "-Infinity" => Ok(f64::NEG_INFINITY),
                other => Err(serde::de::Error::custom(format!(
                    "invalid double value '{other}'"
                ))),
            },
        }
    }
}
