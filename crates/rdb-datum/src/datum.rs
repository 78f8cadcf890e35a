//! The datum value type.

use std::collections::BTreeMap;
use std::sync::Arc;

/// An immutable, dynamically-typed document value.
///
/// Children are held behind `Arc`, so cloning a large datum is cheap. A datum
/// is never mutated after construction, which is what makes the sharing safe.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Datum {
    #[default]
    Null,
    Bool(bool),
    /// Always a double; whole numbers are only compacted on the wire.
    Number(f64),
    String(Arc<str>),
    /// Opaque bytes, kept distinct from text.
    Binary(Arc<[u8]>),
    Array(Arc<Vec<Datum>>),
    Object(Arc<BTreeMap<String, Datum>>),
}

/// Discriminant of a [`Datum`], used in error messages and by callers that
/// only need to branch on shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatumType {
    Null,
    Bool,
    Number,
    String,
    Binary,
    Array,
    Object,
}

impl Datum {
    #[must_use]
    pub fn string(value: impl Into<Arc<str>>) -> Self {
        Self::String(value.into())
    }

    #[must_use]
    pub fn binary(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self::Binary(bytes.into())
    }

    #[must_use]
    pub fn array(items: impl IntoIterator<Item = Datum>) -> Self {
        Self::Array(Arc::new(items.into_iter().collect()))
    }

    /// Build an object; later pairs overwrite earlier ones with the same key.
    #[must_use]
    pub fn object<K: Into<String>>(pairs: impl IntoIterator<Item = (K, Datum)>) -> Self {
        Self::Object(Arc::new(
            pairs.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        ))
    }

    #[must_use]
    pub fn empty_object() -> Self {
        Self::Object(Arc::default())
    }

    #[must_use]
    pub fn datum_type(&self) -> DatumType {
        match self {
            Self::Null => DatumType::Null,
            Self::Bool(_) => DatumType::Bool,
            Self::Number(_) => DatumType::Number,
            Self::String(_) => DatumType::String,
            Self::Binary(_) => DatumType::Binary,
            Self::Array(_) => DatumType::Array,
            Self::Object(_) => DatumType::Object,
        }
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_binary(&self) -> Option<&[u8]> {
        match self {
            Self::Binary(b) => Some(b),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_array(&self) -> Option<&[Datum]> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_object(&self) -> Option<&BTreeMap<String, Datum>> {
        match self {
            Self::Object(pairs) => Some(pairs),
            _ => None,
        }
    }

    /// Look up a field of an object.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Datum> {
        self.as_object()?.get(key)
    }
}

impl From<bool> for Datum {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<f64> for Datum {
    fn from(v: f64) -> Self {
        Self::Number(v)
    }
}

impl From<i32> for Datum {
    fn from(v: i32) -> Self {
        Self::Number(f64::from(v))
    }
}

impl From<&str> for Datum {
    fn from(v: &str) -> Self {
        Self::String(v.into())
    }
}

impl From<String> for Datum {
    fn from(v: String) -> Self {
        Self::String(v.into())
    }
}

impl From<Vec<Datum>> for Datum {
    fn from(v: Vec<Datum>) -> Self {
        Self::Array(Arc::new(v))
    }
}

impl From<BTreeMap<String, Datum>> for Datum {
    fn from(v: BTreeMap<String, Datum>) -> Self {
        Self::Object(Arc::new(v))
    }
}
