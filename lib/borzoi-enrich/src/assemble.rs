//! Enriched record assembly.

use borzoi_common::{collections::FastHashSet, time::get_unix_timestamp_millis};
use borzoi_error::{generic_error, GenericError};
use metrics::{counter, Counter};
use serde::Deserialize;
use tracing::debug;

use crate::{
    projection::ProjectionOutput,
    record::{AttributeValue, EnrichedRecord, SequencedSpan},
    resolve::ResolutionResult,
};

/// Value substituted for redacted attributes.
pub const REDACTION_MARKER: &str = "[REDACTED]";

/// A single resource-attribute promotion.
#[derive(Clone, Debug, Deserialize)]
pub struct PromotionMapping {
    /// Attribute key the promoted value is stored under.
    pub attribute: String,

    /// Resource attribute key the value is read from.
    ///
    /// Defaults to `attribute`.
    #[serde(default)]
    pub resource_key: Option<String>,
}

/// Configuration for record assembly.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct AssemblerConfig {
    /// Resource attributes promoted into the record's attribute map when not already present.
    #[serde(default)]
    pub promotions: Vec<PromotionMapping>,

    /// Attribute keys whose values are replaced with [`REDACTION_MARKER`] before the record is emitted.
    ///
    /// Keys match case-insensitively. Redaction applies after all merging and promotion.
    #[serde(default)]
    pub redacted_keys: Vec<String>,
}

struct CompiledPromotion {
    attribute: String,
    resource_key: String,
}

struct AssemblerTelemetry {
    collisions: Counter,
    promotions: Counter,
    redactions: Counter,
}

impl AssemblerTelemetry {
    fn new() -> Self {
        Self {
            collisions: counter!("assembler_attribute_collisions_total"),
            promotions: counter!("assembler_promoted_attributes_total"),
            redactions: counter!("assembler_redacted_attributes_total"),
        }
    }
}

/// Merges resolution and projection outputs into enriched records.
///
/// The merged attribute map layers resolved values over projected values over the span's raw attributes. A key
/// written by a higher-precedence layer with a different value than the one already present is a collision: logged
/// and counted, never fatal. Configured resource attributes are then promoted into any remaining gaps, and redaction
/// runs last over the finished map.
pub struct Assembler {
    promotions: Vec<CompiledPromotion>,
    redacted_keys: FastHashSet<String>,
    telemetry: AssemblerTelemetry,
}

impl Assembler {
    /// Creates a new `Assembler`.
    ///
    /// # Errors
    ///
    /// If a promotion names an empty attribute key, an error is returned.
    pub fn new(config: &AssemblerConfig) -> Result<Self, GenericError> {
        let mut promotions = Vec::with_capacity(config.promotions.len());
        for mapping in &config.promotions {
            if mapping.attribute.is_empty() {
                return Err(generic_error!("promotion mapping has an empty attribute key"));
            }
            promotions.push(CompiledPromotion {
                attribute: mapping.attribute.clone(),
                resource_key: mapping.resource_key.clone().unwrap_or_else(|| mapping.attribute.clone()),
            });
        }

        Ok(Self {
            promotions,
            redacted_keys: config.redacted_keys.iter().map(|key| key.to_lowercase()).collect(),
            telemetry: AssemblerTelemetry::new(),
        })
    }

    /// Assembles the enriched record for one span.
    pub fn assemble(
        &self, sequenced: &SequencedSpan, resolution: ResolutionResult, projection: ProjectionOutput,
    ) -> EnrichedRecord {
        let span = &sequenced.span;
        let mut attributes = span.attributes().clone();

        for (key, value) in projection.values {
            if let Some(previous) = attributes.get(&key) {
                if previous != &value {
                    self.telemetry.collisions.increment(1);
                    debug!(
                        attribute = key.as_str(),
                        "Projected value overrides a differing raw value."
                    );
                }
            }
            attributes.insert(key, value);
        }

        for (key, value) in resolution.attributes {
            if let Some(previous) = attributes.get(&key) {
                if previous != &value {
                    self.telemetry.collisions.increment(1);
                    debug!(
                        attribute = key.as_str(),
                        "Resolved value overrides a differing lower-precedence value."
                    );
                }
            }
            attributes.insert(key, value);
        }

        for promotion in &self.promotions {
            if attributes.contains_key(&promotion.attribute) {
                continue;
            }
            if let Some(value) = span.resource_attributes().get(&promotion.resource_key) {
                attributes.insert(promotion.attribute.clone(), value.clone());
                self.telemetry.promotions.increment(1);
            }
        }

        if !self.redacted_keys.is_empty() {
            for (key, value) in attributes.iter_mut() {
                if self.redacted_keys.contains(&key.to_lowercase()) {
                    *value = AttributeValue::from(REDACTION_MARKER);
                    self.telemetry.redactions.increment(1);
                }
            }
        }

        EnrichedRecord {
            partition: sequenced.partition,
            sequence: sequenced.sequence,
            trace_id: span.trace_id().to_string(),
            span_id: span.span_id().to_string(),
            parent_span_id: span.parent_span_id().map(str::to_string),
            service_name: span.service_name().to_string(),
            start_time_unix_nanos: span.start_time_unix_nanos(),
            end_time_unix_nanos: span.end_time_unix_nanos(),
            attributes,
            entities: resolution.entities,
            unresolved: resolution.unresolved,
            enriched_at_unix_millis: get_unix_timestamp_millis(),
        }
    }
}
