//! Connector error type.

use dimlookup_core::lookup::{ConfigError, LookupError, OpenError};

/// Errors raised while building or opening a connector.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectorError {
    /// A required option is absent.
    #[error("missing required option: '{0}'")]
    MissingOption(String),

    /// An option value could not be parsed.
    #[error("invalid value for option '{key}': '{value}'")]
    InvalidOption {
        /// Option name.
        key: String,
        /// Rejected value.
        value: String,
    },

    /// The lookup configuration was rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A lookup operation failed.
    #[error(transparent)]
    Lookup(#[from] LookupError),
}

impl From<OpenError> for ConnectorError {
    fn from(err: OpenError) -> Self {
        match err {
            OpenError::Config(e) => Self::Config(e),
            OpenError::Lookup(e) => Self::Lookup(e),
        }
    }
}
