//! Elasticsearch lookup table connector.
//!
//! - [`options`]: `WITH (...)` option parsing
//! - [`schema`]: physical table schema
//! - [`codec`]: JSON document to row conversion
//! - [`client`]: query building over a [`SearchTransport`](client::SearchTransport)
//! - [`table_source`]: scan/lookup table source

pub mod client;
pub mod codec;
pub mod options;
pub mod schema;
pub mod table_source;

pub use client::{EsLookupClient, SearchHit, SearchTransport, TransportError};
pub use codec::JsonRowCodec;
pub use options::{parse_elasticsearch_options, parse_lookup_options, ElasticsearchConfig};
pub use schema::{DataType, FieldDef, TableSchema};
pub use table_source::{
    ChangelogMode, ElasticsearchTableSource, LookupFunctionKind, LookupProvider, ScanDescriptor,
};
