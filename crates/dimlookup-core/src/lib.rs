//! # `dimlookup` Core
//!
//! Cache layer for lookup joins: enriching stream records with rows from
//! an external dimension table, either from a full local mirror reloaded
//! on a schedule or from a bounded LRU cache filled on demand.

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

/// Lookup caches, dispatcher, and refresh scheduling.
pub mod lookup;
