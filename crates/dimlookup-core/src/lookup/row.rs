//! Row, value, and key types shared by the lookup cache layer.
//!
//! A [`Row`] is an ordered list of [`ScalarValue`]s. Input records and
//! lookup-table rows use the same representation; a joined output row is
//! the input row followed by the lookup row.
//!
//! A [`LookupKey`] is the ordered tuple of key field values pulled out of a
//! row by a [`KeyExtractor`]. It is the index of every cache.

use std::fmt;
use std::hash::{Hash, Hasher};

use crate::lookup::source::LookupError;

/// A single field value.
///
/// Only the value types that can appear as lookup keys or in documents
/// returned by the remote store are represented.
#[derive(Debug, Clone)]
pub enum ScalarValue {
    /// SQL NULL
    Null,
    /// Boolean
    Bool(bool),
    /// 64-bit signed integer (covers i8/i16/i32/i64)
    Int64(i64),
    /// 64-bit float (covers f32/f64)
    Float64(f64),
    /// UTF-8 string
    Utf8(String),
    /// Raw binary data
    Binary(Vec<u8>),
    /// Timestamp as microseconds since Unix epoch
    Timestamp(i64),
}

impl ScalarValue {
    /// Returns `true` for [`ScalarValue::Null`].
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

// Floats compare by bit pattern so values can be used as hash map keys.
impl PartialEq for ScalarValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int64(a), Self::Int64(b)) | (Self::Timestamp(a), Self::Timestamp(b)) => a == b,
            (Self::Float64(a), Self::Float64(b)) => a.to_bits() == b.to_bits(),
            (Self::Utf8(a), Self::Utf8(b)) => a == b,
            (Self::Binary(a), Self::Binary(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for ScalarValue {}

impl Hash for ScalarValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Self::Null => {}
            Self::Bool(v) => v.hash(state),
            Self::Int64(v) | Self::Timestamp(v) => v.hash(state),
            Self::Float64(v) => v.to_bits().hash(state),
            Self::Utf8(v) => v.hash(state),
            Self::Binary(v) => v.hash(state),
        }
    }
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int64(v) => write!(f, "{v}"),
            Self::Float64(v) => write!(f, "{v}"),
            Self::Utf8(v) => write!(f, "'{v}'"),
            Self::Binary(v) => write!(f, "X'{}'", hex_encode(v)),
            Self::Timestamp(us) => write!(f, "TIMESTAMP '{us}'"),
        }
    }
}

impl From<i64> for ScalarValue {
    fn from(v: i64) -> Self {
        Self::Int64(v)
    }
}

impl From<&str> for ScalarValue {
    fn from(v: &str) -> Self {
        Self::Utf8(v.to_string())
    }
}

impl From<String> for ScalarValue {
    fn from(v: String) -> Self {
        Self::Utf8(v)
    }
}

impl From<bool> for ScalarValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<f64> for ScalarValue {
    fn from(v: f64) -> Self {
        Self::Float64(v)
    }
}

/// Encode bytes as lowercase hex string.
fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes
        .iter()
        .fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
            let _ = write!(s, "{b:02x}");
            s
        })
}

/// An ordered sequence of field values.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Row(Vec<ScalarValue>);

impl Row {
    /// Create a row from its values.
    #[must_use]
    pub fn new(values: Vec<ScalarValue>) -> Self {
        Self(values)
    }

    /// A row of `arity` NULLs, used to pad unmatched outer-join output.
    #[must_use]
    pub fn nulls(arity: usize) -> Self {
        Self(vec![ScalarValue::Null; arity])
    }

    /// Number of fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the row has no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Field value at `index`.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&ScalarValue> {
        self.0.get(index)
    }

    /// All field values.
    #[must_use]
    pub fn values(&self) -> &[ScalarValue] {
        &self.0
    }

    /// Consume the row, returning its values.
    #[must_use]
    pub fn into_values(self) -> Vec<ScalarValue> {
        self.0
    }

    /// This row's fields followed by `other`'s.
    #[must_use]
    pub fn join(&self, other: &Row) -> Row {
        let mut values = Vec::with_capacity(self.0.len() + other.0.len());
        values.extend_from_slice(&self.0);
        values.extend_from_slice(&other.0);
        Row(values)
    }
}

impl From<Vec<ScalarValue>> for Row {
    fn from(values: Vec<ScalarValue>) -> Self {
        Self(values)
    }
}

/// Cache index: the key field values of one row, in key order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LookupKey(Vec<ScalarValue>);

impl LookupKey {
    /// Build a key from its values.
    #[must_use]
    pub fn new(values: Vec<ScalarValue>) -> Self {
        Self(values)
    }

    /// Key values in key-field order.
    #[must_use]
    pub fn values(&self) -> &[ScalarValue] {
        &self.0
    }
}

impl From<ScalarValue> for LookupKey {
    fn from(value: ScalarValue) -> Self {
        Self(vec![value])
    }
}

impl fmt::Display for LookupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{v}")?;
        }
        write!(f, ")")
    }
}

/// Pulls a [`LookupKey`] out of a row from fixed field positions.
///
/// Used on both sides of the join: on input records (positions of the
/// stream columns equated with the key) and on lookup rows (positions of
/// the key columns in the lookup table schema).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyExtractor {
    positions: Vec<usize>,
}

impl KeyExtractor {
    /// Create an extractor reading the given positions, in key order.
    #[must_use]
    pub fn new(positions: Vec<usize>) -> Self {
        Self { positions }
    }

    /// Positions read by this extractor.
    #[must_use]
    pub fn positions(&self) -> &[usize] {
        &self.positions
    }

    /// Extract the key from `row`.
    ///
    /// Returns `Ok(None)` when any key component is NULL: a NULL key never
    /// matches anything, so it is not looked up.
    ///
    /// # Errors
    ///
    /// Returns [`LookupError::Codec`] if the row is narrower than a key
    /// position.
    pub fn extract(&self, row: &Row) -> Result<Option<LookupKey>, LookupError> {
        let mut values = Vec::with_capacity(self.positions.len());
        for &pos in &self.positions {
            let value = row.get(pos).ok_or_else(|| {
                LookupError::Codec(format!(
                    "key position {pos} out of range for row of width {}",
                    row.len()
                ))
            })?;
            if value.is_null() {
                return Ok(None);
            }
            values.push(value.clone());
        }
        Ok(Some(LookupKey(values)))
    }
}
