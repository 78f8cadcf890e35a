//! Conversions between [`Datum`] and JSON.
//!
//! JSON has no binary type, so binary data is represented by the pseudo-type
//! object `{"$reql_type$": "BINARY", "data": "<hex>"}`.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde::ser::{Serialize, SerializeMap, Serializer};
use serde_json::Value;

use crate::Datum;
use crate::codec::MAX_DOUBLE_INT;

pub const REQL_TYPE_KEY: &str = "$reql_type$";
pub const BINARY_TYPE: &str = "BINARY";

fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

fn from_hex(text: &str) -> Option<Vec<u8>> {
    if text.len() % 2 != 0 || !text.is_ascii() {
        return None;
    }
    text.as_bytes()
        .chunks(2)
        .map(|pair| {
            let digits = std::str::from_utf8(pair).ok()?;
            u8::from_str_radix(digits, 16).ok()
        })
        .collect()
}

fn whole_number(n: f64) -> Option<i64> {
    (n.is_finite() && n.trunc() == n && n.abs() <= MAX_DOUBLE_INT as f64).then_some(n as i64)
}

impl Serialize for Datum {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Null => serializer.serialize_unit(),
            Self::Bool(b) => serializer.serialize_bool(*b),
            Self::Number(n) => match whole_number(*n) {
                Some(i) if !(i == 0 && n.is_sign_negative()) => serializer.serialize_i64(i),
                _ => serializer.serialize_f64(*n),
            },
            Self::String(s) => serializer.serialize_str(s),
            Self::Binary(b) => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry(REQL_TYPE_KEY, BINARY_TYPE)?;
                map.serialize_entry("data", &to_hex(b))?;
                map.end()
            }
            Self::Array(items) => serializer.collect_seq(items.iter()),
            Self::Object(pairs) => serializer.collect_map(pairs.iter()),
        }
    }
}

impl Datum {
    /// Render as a JSON value.
    ///
    /// Non-finite numbers have no JSON form and become `null`.
    #[must_use]
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

impl From<Value> for Datum {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(b),
            Value::Number(n) => Self::Number(n.as_f64().unwrap_or(f64::NAN)),
            Value::String(s) => Self::from(s),
            Value::Array(items) => Self::array(items.into_iter().map(Self::from)),
            Value::Object(pairs) => {
                if let Some(bytes) = binary_pseudo_type(&pairs) {
                    return Self::binary(bytes);
                }
                let map: BTreeMap<String, Datum> =
                    pairs.into_iter().map(|(k, v)| (k, Self::from(v))).collect();
                Self::from(map)
            }
        }
    }
}

fn binary_pseudo_type(pairs: &serde_json::Map<String, Value>) -> Option<Vec<u8>> {
    if pairs.len() != 2 || pairs.get(REQL_TYPE_KEY)?.as_str()? != BINARY_TYPE {
        return None;
    }
    from_hex(pairs.get("data")?.as_str()?)
}
