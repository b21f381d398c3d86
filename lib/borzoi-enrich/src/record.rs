//! Core data model: input spans, primitive attribute values, and enriched output records.

use std::fmt;

use borzoi_common::collections::FastHashMap;
use serde::{Deserialize, Serialize};

use crate::{cache::ResolutionFailure, key::ResolutionKey};

/// A primitive attribute value.
///
/// Span attributes, resolved attribute values, and projected values all share this representation. Variants are tried
/// in declaration order during deserialization, so numeric and boolean literals keep their natural type and everything
/// else falls back to a string.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    /// A boolean value.
    Boolean(bool),

    /// A signed integer value.
    Integer(i64),

    /// A floating point value.
    Float(f64),

    /// A string value.
    String(String),
}

impl AttributeValue {
    /// Returns the value as a string slice, if it is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(value) => Some(value.as_str()),
            _ => None,
        }
    }

    /// Returns the value as a boolean, if it is a boolean.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(value) => Some(*value),
            _ => None,
        }
    }

    /// Returns the value as a signed integer, if it is an integer.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(value) => Some(*value),
            _ => None,
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Boolean(value) => write!(f, "{}", value),
            Self::Integer(value) => write!(f, "{}", value),
            Self::Float(value) => write!(f, "{}", value),
            Self::String(value) => f.write_str(value),
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

/// An immutable, normalized span record.
///
/// This is the engine's input: a single timed operation within a distributed trace, already normalized by the upstream
/// ingest layer so that attribute keys follow the canonical semantic conventions. The engine never mutates a span, and
/// only borrows it for the duration of a single enrichment pass.
#[derive(Clone, Debug)]
pub struct NormalizedSpan {
    trace_id: String,
    span_id: String,
    parent_span_id: Option<String>,
    service_name: String,
    start_time_unix_nanos: u64,
    end_time_unix_nanos: u64,
    attributes: FastHashMap<String, AttributeValue>,
    resource_attributes: FastHashMap<String, AttributeValue>,
}

impl NormalizedSpan {
    /// Creates a new `NormalizedSpan` with the given trace and span identifiers.
    ///
    /// All other fields start out empty and can be filled in through the `with_*` builder methods.
    pub fn new(trace_id: impl Into<String>, span_id: impl Into<String>) -> Self {
        Self {
            trace_id: trace_id.into(),
            span_id: span_id.into(),
            parent_span_id: None,
            service_name: String::new(),
            start_time_unix_nanos: 0,
            end_time_unix_nanos: 0,
            attributes: FastHashMap::default(),
            resource_attributes: FastHashMap::default(),
        }
    }

    /// Sets the name of the service that emitted this span.
    pub fn with_service_name(mut self, service_name: impl Into<String>) -> Self {
        self.service_name = service_name.into();
        self
    }

    /// Sets the identifier of this span's parent span.
    pub fn with_parent_span_id(mut self, parent_span_id: impl Into<String>) -> Self {
        self.parent_span_id = Some(parent_span_id.into());
        self
    }

    /// Sets the start and end time of the span, as unix nanoseconds.
    pub fn with_time_range(mut self, start_time_unix_nanos: u64, end_time_unix_nanos: u64) -> Self {
        self.start_time_unix_nanos = start_time_unix_nanos;
        self.end_time_unix_nanos = end_time_unix_nanos;
        self
    }

    /// Adds a span attribute.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Adds a resource-level attribute.
    ///
    /// Resource attributes describe the emitting process rather than the individual operation, and only reach the
    /// output record through configured promotion (see the assembler).
    pub fn with_resource_attribute(mut self, key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.resource_attributes.insert(key.into(), value.into());
        self
    }

    /// Returns the trace identifier.
    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    /// Returns the span identifier.
    pub fn span_id(&self) -> &str {
        &self.span_id
    }

    /// Returns the parent span identifier, if any.
    pub fn parent_span_id(&self) -> Option<&str> {
        self.parent_span_id.as_deref()
    }

    /// Returns the name of the service that emitted this span.
    ///
    /// May be empty if the upstream normalizer could not determine one.
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Returns the start time of the span, as unix nanoseconds.
    pub fn start_time_unix_nanos(&self) -> u64 {
        self.start_time_unix_nanos
    }

    /// Returns the end time of the span, as unix nanoseconds.
    pub fn end_time_unix_nanos(&self) -> u64 {
        self.end_time_unix_nanos
    }

    /// Returns the span's attributes.
    pub fn attributes(&self) -> &FastHashMap<String, AttributeValue> {
        &self.attributes
    }

    /// Returns the span's resource-level attributes.
    pub fn resource_attributes(&self) -> &FastHashMap<String, AttributeValue> {
        &self.resource_attributes
    }
}

/// A reference to a resolved real-world entity, such as a service instance.
#[derive(Clone, Debug, PartialEq)]
pub struct EntityRef {
    /// The entity type, such as `service`.
    pub entity_type: String,

    /// The stable identifier assigned by the entity service.
    pub id: String,

    /// The human-readable entity name.
    pub name: String,
}

impl EntityRef {
    /// Creates a new `EntityRef`.
    pub fn new(entity_type: impl Into<String>, id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            id: id.into(),
            name: name.into(),
        }
    }
}

/// A field that could not be resolved, along with the reason it failed.
///
/// Unresolved fields are markers, not errors: the record they belong to is still emitted, and downstream consumers are
/// expected to tolerate their absence from the attribute/entity maps.
#[derive(Clone, Debug, PartialEq)]
pub struct UnresolvedField {
    /// The resolution key that failed.
    pub key: ResolutionKey,

    /// Why resolution failed.
    pub reason: ResolutionFailure,
}

/// The enriched output record produced for a single input span.
///
/// Exactly one record is produced per input span. Resolution failures surface as entries in `unresolved` rather than
/// dropping or delaying the record.
#[derive(Clone, Debug)]
pub struct EnrichedRecord {
    /// The input partition this record belongs to.
    pub partition: u32,

    /// The externally-assigned, per-partition input sequence number.
    pub sequence: u64,

    /// The trace identifier.
    pub trace_id: String,

    /// The span identifier.
    pub span_id: String,

    /// The parent span identifier, if any.
    pub parent_span_id: Option<String>,

    /// The name of the service that emitted the span.
    pub service_name: String,

    /// The start time of the span, as unix nanoseconds.
    pub start_time_unix_nanos: u64,

    /// The end time of the span, as unix nanoseconds.
    pub end_time_unix_nanos: u64,

    /// The merged attribute map: raw span attributes overlaid with projected and resolved values.
    pub attributes: FastHashMap<String, AttributeValue>,

    /// Resolved entity references, keyed by entity scope.
    pub entities: FastHashMap<String, EntityRef>,

    /// Fields that could not be resolved.
    pub unresolved: Vec<UnresolvedField>,

    /// When this record was enriched, as unix milliseconds.
    pub enriched_at_unix_millis: u64,
}

/// A normalized span paired with its position in the input stream.
#[derive(Clone, Debug)]
pub struct SequencedSpan {
    /// The input partition the span arrived on.
    pub partition: u32,

    /// The externally-assigned, per-partition sequence number.
    pub sequence: u64,

    /// The span itself.
    pub span: NormalizedSpan,
}

impl SequencedSpan {
    /// Creates a new `SequencedSpan`.
    pub fn new(partition: u32, sequence: u64, span: NormalizedSpan) -> Self {
        Self {
            partition,
            sequence,
            span,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attribute_value_deserializes_with_natural_types() {
        let values: Vec<AttributeValue> = serde_yaml::from_str("[true, 42, 1.5, GET]").unwrap();
        assert_eq!(
            values,
            vec![
                AttributeValue::Boolean(true),
                AttributeValue::Integer(42),
                AttributeValue::Float(1.5),
                AttributeValue::String("GET".to_string()),
            ]
        );
    }

    #[test]
    fn attribute_value_display_is_stable() {
        assert_eq!(AttributeValue::from("GET").to_string(), "GET");
        assert_eq!(AttributeValue::from(42i64).to_string(), "42");
        assert_eq!(AttributeValue::from(true).to_string(), "true");
    }
}
