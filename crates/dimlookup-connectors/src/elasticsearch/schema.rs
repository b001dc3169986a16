//! Physical schema of an Elasticsearch-backed table.

use dimlookup_core::lookup::ConfigError;

/// Column types supported by the connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    /// `boolean`
    Boolean,
    /// `byte`, `short`, `integer`, `long`
    Int64,
    /// `float`, `double`, `scaled_float`
    Float64,
    /// `keyword`, `text`
    Utf8,
    /// `date` stored as epoch milliseconds
    Timestamp,
}

/// One column of the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDef {
    /// Column name, also the document field name.
    pub name: String,
    /// Column type.
    pub data_type: DataType,
    /// Whether missing or `null` document fields are allowed.
    pub nullable: bool,
}

impl FieldDef {
    /// A nullable column.
    #[must_use]
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: true,
        }
    }

    /// A `NOT NULL` column.
    #[must_use]
    pub fn not_null(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            nullable: false,
            ..Self::new(name, data_type)
        }
    }
}

/// Ordered list of columns.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TableSchema {
    fields: Vec<FieldDef>,
}

impl TableSchema {
    /// Create a schema from its columns.
    #[must_use]
    pub fn new(fields: Vec<FieldDef>) -> Self {
        Self { fields }
    }

    /// Columns in order.
    #[must_use]
    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    /// Number of columns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the schema has no columns.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Column names in order.
    #[must_use]
    pub fn field_names(&self) -> Vec<String> {
        self.fields.iter().map(|f| f.name.clone()).collect()
    }

    /// Position of the column called `name`.
    #[must_use]
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// Keep only the top-level columns at `paths`, in that order.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for a nested or out-of-range path.
    pub fn project(&self, paths: &[Vec<usize>]) -> Result<Self, ConfigError> {
        let fields = paths
            .iter()
            .map(|path| match path.as_slice() {
                [index] => self.fields.get(*index).cloned().ok_or_else(|| {
                    ConfigError::Invalid(format!("projected column {index} out of range"))
                }),
                _ => Err(ConfigError::Invalid(
                    "nested projection is not supported".to_string(),
                )),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { fields })
    }
}
