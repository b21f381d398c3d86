//! Remote metadata services, consumed through a capability trait.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use borzoi_common::collections::FastHashMap;

use crate::{
    cache::ResolutionFailure,
    key::ResolutionKey,
    record::{AttributeValue, EntityRef},
};

/// Definition metadata for a single attribute key, as published by the attribute service.
#[derive(Clone, Debug)]
pub struct AttributeDefinition {
    /// The raw attribute key the definition describes.
    pub key: String,

    /// Human-readable name for the attribute.
    pub display_name: String,
}

impl AttributeDefinition {
    /// Creates a new `AttributeDefinition`.
    pub fn new<K, D>(key: K, display_name: D) -> Self
    where
        K: Into<String>,
        D: Into<String>,
    {
        Self {
            key: key.into(),
            display_name: display_name.into(),
        }
    }
}

/// A client for the remote attribute and entity resolution services.
///
/// Implementations own transport, discovery and retry concerns. Batch calls report per-key outcomes positionally
/// through the returned map: a key absent from the map was definitively not found, while a transport-level problem
/// that sinks the whole batch is reported as an error. Implementations are expected to be cheap to clone or share,
/// and may be arbitrarily slow; callers bound them with their own timeouts.
#[async_trait]
pub trait MetadataClient: Send + Sync {
    /// Resolves a batch of attribute-kind keys to their canonical values.
    ///
    /// # Errors
    ///
    /// If the batch call fails as a whole, an error describing the failure is returned and no per-key results are
    /// available.
    async fn resolve_attributes(
        &self, keys: Vec<ResolutionKey>,
    ) -> Result<FastHashMap<ResolutionKey, AttributeValue>, ResolutionFailure>;

    /// Resolves a batch of entity-kind keys to entity references.
    ///
    /// # Errors
    ///
    /// If the batch call fails as a whole, an error describing the failure is returned and no per-key results are
    /// available.
    async fn resolve_entities(
        &self, keys: Vec<ResolutionKey>,
    ) -> Result<FastHashMap<ResolutionKey, EntityRef>, ResolutionFailure>;

    /// Fetches the attribute definitions registered under the given scope.
    ///
    /// # Errors
    ///
    /// If the call fails, an error describing the failure is returned.
    async fn attribute_definitions(&self, scope: &str) -> Result<Vec<AttributeDefinition>, ResolutionFailure>;
}

struct ClientState {
    attributes: FastHashMap<ResolutionKey, AttributeValue>,
    entities: FastHashMap<ResolutionKey, EntityRef>,
    definitions: FastHashMap<String, Vec<AttributeDefinition>>,
    call_delay: Duration,
    key_delays: FastHashMap<ResolutionKey, Duration>,
    outage: Option<ResolutionFailure>,
    attribute_calls: usize,
    entity_calls: usize,
    keys_requested: usize,
}

/// An in-memory [`MetadataClient`].
///
/// Serves canned attribute values, entity references and attribute definitions from memory, with optional artificial
/// latency (per call or per key) and an outage mode that fails every batch call with a fixed failure. Used for tests
/// and local development; production deployments plug in a transport-backed client instead.
#[derive(Clone)]
pub struct InMemoryMetadataClient {
    state: Arc<Mutex<ClientState>>,
}

impl InMemoryMetadataClient {
    /// Creates an empty `InMemoryMetadataClient`.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ClientState {
                attributes: FastHashMap::default(),
                entities: FastHashMap::default(),
                definitions: FastHashMap::default(),
                call_delay: Duration::ZERO,
                key_delays: FastHashMap::default(),
                outage: None,
                attribute_calls: 0,
                entity_calls: 0,
                keys_requested: 0,
            })),
        }
    }

    /// Adds a canned attribute value, returning `Self`.
    pub fn with_attribute(self, key: ResolutionKey, value: AttributeValue) -> Self {
        self.state.lock().unwrap().attributes.insert(key, value);
        self
    }

    /// Adds a canned entity reference, returning `Self`.
    pub fn with_entity(self, key: ResolutionKey, entity: EntityRef) -> Self {
        self.state.lock().unwrap().entities.insert(key, entity);
        self
    }

    /// Adds the attribute definitions for a scope, returning `Self`.
    pub fn with_definitions<S>(self, scope: S, definitions: Vec<AttributeDefinition>) -> Self
    where
        S: Into<String>,
    {
        self.state.lock().unwrap().definitions.insert(scope.into(), definitions);
        self
    }

    /// Sets a fixed artificial latency applied to every batch call, returning `Self`.
    pub fn with_call_delay(self, delay: Duration) -> Self {
        self.state.lock().unwrap().call_delay = delay;
        self
    }

    /// Sets an artificial latency applied to any batch call containing `key`, returning `Self`.
    ///
    /// When a batch touches multiple delayed keys, the longest delay wins.
    pub fn with_key_delay(self, key: ResolutionKey, delay: Duration) -> Self {
        self.state.lock().unwrap().key_delays.insert(key, delay);
        self
    }

    /// Sets or clears the outage mode.
    ///
    /// While an outage is set, every batch call fails with a clone of the given failure after any configured delay.
    pub fn set_outage(&self, outage: Option<ResolutionFailure>) {
        self.state.lock().unwrap().outage = outage;
    }

    /// Returns the number of attribute batch calls issued so far.
    pub fn attribute_calls(&self) -> usize {
        self.state.lock().unwrap().attribute_calls
    }

    /// Returns the number of entity batch calls issued so far.
    pub fn entity_calls(&self) -> usize {
        self.state.lock().unwrap().entity_calls
    }

    /// Returns the total number of keys requested across all batch calls so far.
    pub fn keys_requested(&self) -> usize {
        self.state.lock().unwrap().keys_requested
    }

    fn batch_delay(state: &ClientState, keys: &[ResolutionKey]) -> Duration {
        keys.iter()
            .filter_map(|key| state.key_delays.get(key).copied())
            .fold(state.call_delay, Duration::max)
    }
}

impl Default for InMemoryMetadataClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetadataClient for InMemoryMetadataClient {
    async fn resolve_attributes(
        &self, keys: Vec<ResolutionKey>,
    ) -> Result<FastHashMap<ResolutionKey, AttributeValue>, ResolutionFailure> {
        let (delay, outcome) = {
            let mut state = self.state.lock().unwrap();
            state.attribute_calls += 1;
            state.keys_requested += keys.len();

            let outcome = match state.outage.as_ref() {
                Some(failure) => Err(failure.clone()),
                None => Ok(keys
                    .iter()
                    .filter_map(|key| state.attributes.get(key).map(|value| (key.clone(), value.clone())))
                    .collect()),
            };
            (Self::batch_delay(&state, &keys), outcome)
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        outcome
    }

    async fn resolve_entities(
        &self, keys: Vec<ResolutionKey>,
    ) -> Result<FastHashMap<ResolutionKey, EntityRef>, ResolutionFailure> {
        let (delay, outcome) = {
            let mut state = self.state.lock().unwrap();
            state.entity_calls += 1;
            state.keys_requested += keys.len();

            let outcome = match state.outage.as_ref() {
                Some(failure) => Err(failure.clone()),
                None => Ok(keys
                    .iter()
                    .filter_map(|key| state.entities.get(key).map(|entity| (key.clone(), entity.clone())))
                    .collect()),
            };
            (Self::batch_delay(&state, &keys), outcome)
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        outcome
    }

    async fn attribute_definitions(&self, scope: &str) -> Result<Vec<AttributeDefinition>, ResolutionFailure> {
        let state = self.state.lock().unwrap();
        match state.outage.as_ref() {
            Some(failure) => Err(failure.clone()),
            None => Ok(state.definitions.get(scope).cloned().unwrap_or_default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_keys_are_absent_from_batch_results() {
        let known = ResolutionKey::attribute("span", "http.method");
        let unknown = ResolutionKey::attribute("span", "http.route");

        let client = InMemoryMetadataClient::new().with_attribute(known.clone(), AttributeValue::from("GET"));

        let results = client
            .resolve_attributes(vec![known.clone(), unknown.clone()])
            .await
            .unwrap();
        assert_eq!(results.get(&known), Some(&AttributeValue::from("GET")));
        assert!(!results.contains_key(&unknown));
        assert_eq!(client.attribute_calls(), 1);
        assert_eq!(client.keys_requested(), 2);
    }

    #[tokio::test]
    async fn outage_fails_batch_calls_until_cleared() {
        let key = ResolutionKey::entity("service", "checkout");
        let client =
            InMemoryMetadataClient::new().with_entity(key.clone(), EntityRef::new("service", "svc-1", "checkout"));

        client.set_outage(Some(ResolutionFailure::RemoteError {
            message: "unavailable".to_string(),
        }));
        assert!(client.resolve_entities(vec![key.clone()]).await.is_err());

        client.set_outage(None);
        let results = client.resolve_entities(vec![key.clone()]).await.unwrap();
        assert_eq!(results.get(&key).map(|e| e.name.as_str()), Some("checkout"));
    }
}
