//! Resolution keys and key extraction.

use std::fmt;

use borzoi_common::collections::FastHashSet;
use serde::Deserialize;

use crate::record::NormalizedSpan;

/// Entity scope used for the key derived from a span's service name.
pub const SERVICE_ENTITY_SCOPE: &str = "service";

/// The kind of object a [`ResolutionKey`] addresses.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum KeyKind {
    /// An attribute definition, resolved through the attribute service.
    Attribute,

    /// A real-world entity, resolved through the entity service.
    Entity,
}

impl KeyKind {
    /// Returns the kind as a static string, suitable for metric labels.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Attribute => "attribute",
            Self::Entity => "entity",
        }
    }
}

/// A typed, hashable identifier addressing one resolvable attribute or entity.
///
/// Keys are the unit of caching and of remote resolution: equality and hashing are total and stable, so concurrent
/// lookups for the same logical object always land on the same cache slot and the same in-flight request.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ResolutionKey {
    kind: KeyKind,
    scope: String,
    raw_key: String,
}

impl ResolutionKey {
    /// Creates an attribute-kind key.
    pub fn attribute(scope: impl Into<String>, raw_key: impl Into<String>) -> Self {
        Self {
            kind: KeyKind::Attribute,
            scope: scope.into(),
            raw_key: raw_key.into(),
        }
    }

    /// Creates an entity-kind key.
    ///
    /// `identity` is the value that identifies the entity within `scope`, such as a service name within the
    /// `service` scope.
    pub fn entity(scope: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            kind: KeyKind::Entity,
            scope: scope.into(),
            raw_key: identity.into(),
        }
    }

    /// Returns the key kind.
    pub fn kind(&self) -> KeyKind {
        self.kind
    }

    /// Returns the key scope.
    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Returns the raw key within the scope.
    pub fn raw_key(&self) -> &str {
        &self.raw_key
    }
}

impl fmt::Display for ResolutionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.kind.as_str(), self.scope, self.raw_key)
    }
}

/// Maps an entity-bearing span attribute to the entity scope it identifies.
#[derive(Clone, Debug, Deserialize)]
pub struct EntityMappingConfig {
    /// The span attribute whose value identifies an entity.
    pub attribute: String,

    /// The entity scope the value belongs to.
    pub scope: String,
}

/// Derives the set of resolution keys referenced by a normalized span.
///
/// Every span attribute yields an attribute-kind key under a single configurable scope. A non-empty service name
/// yields an entity-kind key under the `service` scope, and additional entity keys come from configured
/// entity-bearing attributes.
pub struct KeyExtractor {
    attribute_scope: String,
    entity_mappings: Vec<EntityMappingConfig>,
}

impl KeyExtractor {
    /// Creates a new `KeyExtractor`.
    pub fn new(attribute_scope: String, entity_mappings: Vec<EntityMappingConfig>) -> Self {
        Self {
            attribute_scope,
            entity_mappings,
        }
    }

    /// Extracts the resolution key set for the given span.
    ///
    /// The returned keys are deduplicated but otherwise unordered.
    pub fn extract(&self, span: &NormalizedSpan) -> Vec<ResolutionKey> {
        let mut keys = Vec::with_capacity(span.attributes().len() + 1);
        let mut seen = FastHashSet::default();

        for name in span.attributes().keys() {
            let key = ResolutionKey::attribute(self.attribute_scope.clone(), name.clone());
            if seen.insert(key.clone()) {
                keys.push(key);
            }
        }

        if !span.service_name().is_empty() {
            let key = ResolutionKey::entity(SERVICE_ENTITY_SCOPE, span.service_name());
            if seen.insert(key.clone()) {
                keys.push(key);
            }
        }

        for mapping in &self.entity_mappings {
            if let Some(value) = span.attributes().get(&mapping.attribute) {
                let key = ResolutionKey::entity(mapping.scope.clone(), value.to_string());
                if seen.insert(key.clone()) {
                    keys.push(key);
                }
            }
        }

        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_attribute_service_and_mapped_entity_keys() {
        let extractor = KeyExtractor::new(
            "span".to_string(),
            vec![EntityMappingConfig {
                attribute: "k8s.pod.name".to_string(),
                scope: "k8s_pod".to_string(),
            }],
        );

        let span = NormalizedSpan::new("trace-1", "span-1")
            .with_service_name("checkout")
            .with_attribute("http.method", "GET")
            .with_attribute("k8s.pod.name", "checkout-7d4f");

        let keys = extractor.extract(&span);
        assert_eq!(keys.len(), 4);
        assert!(keys.contains(&ResolutionKey::attribute("span", "http.method")));
        assert!(keys.contains(&ResolutionKey::attribute("span", "k8s.pod.name")));
        assert!(keys.contains(&ResolutionKey::entity("service", "checkout")));
        assert!(keys.contains(&ResolutionKey::entity("k8s_pod", "checkout-7d4f")));
    }

    #[test]
    fn empty_service_name_yields_no_service_entity_key() {
        let extractor = KeyExtractor::new("span".to_string(), Vec::new());
        let span = NormalizedSpan::new("trace-1", "span-1").with_attribute("http.method", "GET");

        let keys = extractor.extract(&span);
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].kind(), KeyKind::Attribute);
    }

    #[test]
    fn duplicate_keys_are_deduplicated() {
        let extractor = KeyExtractor::new(
            "span".to_string(),
            vec![EntityMappingConfig {
                attribute: "peer.service".to_string(),
                scope: "service".to_string(),
            }],
        );

        // The mapped entity key collides with the service-name entity key.
        let span = NormalizedSpan::new("trace-1", "span-1")
            .with_service_name("checkout")
            .with_attribute("peer.service", "checkout");

        let keys = extractor.extract(&span);
        let entity_keys = keys.iter().filter(|k| k.kind() == KeyKind::Entity).count();
        assert_eq!(entity_keys, 1);
    }
}
