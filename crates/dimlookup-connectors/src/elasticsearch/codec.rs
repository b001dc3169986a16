//! Conversion between Elasticsearch JSON and rows.
//!
//! Documents are decoded field by field following the table schema: the
//! `_source` field with the column's name becomes the column's value.
//! Numbers stored as strings are accepted, as Elasticsearch returns
//! `_source` exactly as it was indexed.

use dimlookup_core::lookup::{LookupError, Row, RowCodec, ScalarValue};
use serde_json::{Number, Value};

use crate::elasticsearch::client::SearchHit;
use crate::elasticsearch::schema::{DataType, FieldDef, TableSchema};

/// Decodes search hits into rows of a [`TableSchema`].
#[derive(Debug, Clone)]
pub struct JsonRowCodec {
    schema: TableSchema,
}

impl JsonRowCodec {
    /// Create a codec for `schema`.
    #[must_use]
    pub fn new(schema: TableSchema) -> Self {
        Self { schema }
    }

    /// The target schema.
    #[must_use]
    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    /// Decode a `_source` object.
    ///
    /// # Errors
    ///
    /// Returns [`LookupError::Codec`] if the document is not an object, a
    /// `NOT NULL` field is missing, or a value does not fit its column.
    pub fn decode_source(&self, source: &Value) -> Result<Row, LookupError> {
        let object = source
            .as_object()
            .ok_or_else(|| LookupError::Codec("document _source is not an object".to_string()))?;
        self.schema
            .fields()
            .iter()
            .map(|field| decode_field(field, object.get(&field.name)))
            .collect::<Result<Vec<_>, _>>()
            .map(Row::new)
    }
}

impl RowCodec<SearchHit> for JsonRowCodec {
    fn decode(&self, record: &SearchHit) -> Result<Row, LookupError> {
        self.decode_source(&record.source)
            .map_err(|e| LookupError::Codec(format!("document '{}': {e}", record.id)))
    }

    fn arity(&self) -> usize {
        self.schema.len()
    }
}

fn mismatch(field: &FieldDef, value: &Value) -> LookupError {
    LookupError::Codec(format!(
        "field '{}' expects {:?}, got {value}",
        field.name, field.data_type
    ))
}

fn decode_field(field: &FieldDef, value: Option<&Value>) -> Result<ScalarValue, LookupError> {
    let value = match value {
        None | Some(Value::Null) if field.nullable => return Ok(ScalarValue::Null),
        None | Some(Value::Null) => {
            return Err(LookupError::Codec(format!(
                "NOT NULL field '{}' is missing",
                field.name
            )))
        }
        Some(v) => v,
    };

    let decoded = match (field.data_type, value) {
        (DataType::Boolean, Value::Bool(b)) => Some(ScalarValue::Bool(*b)),
        (DataType::Boolean, Value::String(s)) => s.parse().ok().map(ScalarValue::Bool),
        (DataType::Int64 | DataType::Timestamp, Value::Number(n)) => n.as_i64().map(|v| {
            integer_value(field.data_type, v)
        }),
        (DataType::Int64 | DataType::Timestamp, Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .ok()
            .map(|v| integer_value(field.data_type, v)),
        (DataType::Float64, Value::Number(n)) => n.as_f64().map(ScalarValue::Float64),
        (DataType::Float64, Value::String(s)) => s.trim().parse().ok().map(ScalarValue::Float64),
        (DataType::Utf8, Value::String(s)) => Some(ScalarValue::Utf8(s.clone())),
        (DataType::Utf8, Value::Number(n)) => Some(ScalarValue::Utf8(n.to_string())),
        (DataType::Utf8, Value::Bool(b)) => Some(ScalarValue::Utf8(b.to_string())),
        _ => None,
    };
    decoded.ok_or_else(|| mismatch(field, value))
}

fn integer_value(data_type: DataType, v: i64) -> ScalarValue {
    match data_type {
        // epoch millis -> micros
        DataType::Timestamp => ScalarValue::Timestamp(v.saturating_mul(1000)),
        _ => ScalarValue::Int64(v),
    }
}

/// Convert a key value into the JSON used in a `term` query.
///
/// # Errors
///
/// Returns [`LookupError::Codec`] for values that cannot be queried by
/// term: NULL, binary, and non-finite floats.
pub fn scalar_to_json(value: &ScalarValue) -> Result<Value, LookupError> {
    match value {
        ScalarValue::Bool(b) => Ok(Value::Bool(*b)),
        ScalarValue::Int64(v) => Ok(Value::from(*v)),
        ScalarValue::Timestamp(us) => Ok(Value::from(us.div_euclid(1000))),
        ScalarValue::Float64(f) => Number::from_f64(*f)
            .map(Value::Number)
            .ok_or_else(|| LookupError::Codec(format!("cannot query non-finite float {f}"))),
        ScalarValue::Utf8(s) => Ok(Value::String(s.clone())),
        ScalarValue::Null | ScalarValue::Binary(_) => Err(LookupError::Codec(format!(
            "unsupported lookup key value {value}"
        ))),
    }
}
