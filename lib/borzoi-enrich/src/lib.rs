//! Resolution and enrichment core of the trace-processing pipeline.
//!
//! Takes sequenced normalized spans, resolves their attribute and entity keys against remote metadata services
//! through coalescing caches, derives additional attributes from declarative projection rules, and assembles exactly
//! one enriched record per span, emitted in per-partition sequence order.
#![deny(warnings)]
#![deny(missing_docs)]

pub mod assemble;
pub mod cache;
pub mod client;
pub mod engine;
pub mod key;
pub mod projection;
pub mod record;
pub mod resolve;
pub mod sequence;

pub use self::engine::{EnrichmentConfiguration, EnrichmentEngine};
