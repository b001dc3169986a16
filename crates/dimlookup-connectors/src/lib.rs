//! # `dimlookup` Connectors
//!
//! External-store connectors for `dimlookup` lookup joins.

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

/// Elasticsearch lookup table connector
pub mod elasticsearch;

/// Connector errors
pub mod error;

pub use error::ConnectorError;
