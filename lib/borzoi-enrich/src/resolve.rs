//! Key resolution against the remote metadata services.

use std::{future::Future, num::NonZeroUsize, sync::Arc, time::Duration};

use borzoi_common::{collections::FastHashMap, task::spawn_traced};
use futures::future::join_all;
use metrics::{counter, Counter};
use tokio::{sync::Semaphore, time::timeout};
use tracing::debug;

use crate::{
    cache::{LookupOutcome, ResolutionCache, ResolutionFailure, ResolveClaim},
    client::MetadataClient,
    key::{KeyExtractor, KeyKind, ResolutionKey},
    record::{AttributeValue, EntityRef, NormalizedSpan, UnresolvedField},
};

/// Tuning knobs for a [`Resolver`].
#[derive(Clone, Debug)]
pub struct ResolverSettings {
    /// Maximum number of cached entries per key kind.
    pub cache_capacity: NonZeroUsize,

    /// How long a resolved value may be served from the cache.
    pub cache_ttl: Duration,

    /// Maximum number of concurrently outstanding remote batch calls, across both key kinds.
    pub max_in_flight: NonZeroUsize,

    /// How long a batch may wait for an in-flight slot before its keys surface as timed out.
    pub max_queue_delay: Duration,

    /// Time budget for a dispatched batch call. Waiters are released when it elapses; the call itself keeps running
    /// and may still back-fill the cache.
    pub resolve_timeout: Duration,
}

/// The per-span outcome of key resolution.
///
/// Every extracted key lands in exactly one place: a resolved attribute value, a resolved entity reference, or an
/// unresolved-field marker. Resolution never fails a span as a whole.
#[derive(Debug, Default)]
pub struct ResolutionResult {
    /// Resolved attribute values, keyed by raw attribute key.
    pub attributes: FastHashMap<String, AttributeValue>,

    /// Resolved entity references, keyed by entity scope.
    pub entities: FastHashMap<String, EntityRef>,

    /// Keys that could not be resolved, with the failure that stopped each one.
    pub unresolved: Vec<UnresolvedField>,
}

#[derive(Clone)]
struct KindTelemetry {
    batch_calls: Counter,
    batch_keys: Counter,
    queue_timeouts: Counter,
    call_timeouts: Counter,
    call_failures: Counter,
    not_found: Counter,
    timeouts: Counter,
    remote_errors: Counter,
}

impl KindTelemetry {
    fn new(kind: KeyKind) -> Self {
        let kind = kind.as_str();
        Self {
            batch_calls: counter!("resolver_batch_calls_total", "kind" => kind),
            batch_keys: counter!("resolver_batch_keys_total", "kind" => kind),
            queue_timeouts: counter!("resolver_queue_timeouts_total", "kind" => kind),
            call_timeouts: counter!("resolver_call_timeouts_total", "kind" => kind),
            call_failures: counter!("resolver_call_failures_total", "kind" => kind),
            not_found: counter!("resolver_unresolved_fields_total", "kind" => kind, "reason" => "not_found"),
            timeouts: counter!("resolver_unresolved_fields_total", "kind" => kind, "reason" => "timeout"),
            remote_errors: counter!("resolver_unresolved_fields_total", "kind" => kind, "reason" => "remote_error"),
        }
    }

    fn record_failure(&self, failure: &ResolutionFailure) {
        match failure {
            ResolutionFailure::NotFound => self.not_found.increment(1),
            ResolutionFailure::Timeout => self.timeouts.increment(1),
            ResolutionFailure::RemoteError { .. } => self.remote_errors.increment(1),
        }
    }
}

struct ResolverTelemetry {
    attribute: KindTelemetry,
    entity: KindTelemetry,
}

impl ResolverTelemetry {
    fn new() -> Self {
        Self {
            attribute: KindTelemetry::new(KeyKind::Attribute),
            entity: KindTelemetry::new(KeyKind::Entity),
        }
    }
}

/// Resolves a span's extracted keys against the remote metadata services.
///
/// Keys are partitioned by kind and resolved through one coalescing cache per kind, so concurrent spans referencing
/// the same key share a single remote resolution. Keys that miss are claimed and dispatched as one batched call per
/// kind per span. Batch dispatch is bounded by a shared in-flight ceiling: a batch that cannot get a slot within the
/// configured queue delay surfaces its keys as timed out without ever reaching the remote service.
pub struct Resolver {
    client: Arc<dyn MetadataClient>,
    extractor: KeyExtractor,
    attribute_cache: ResolutionCache<ResolutionKey, AttributeValue>,
    entity_cache: ResolutionCache<ResolutionKey, EntityRef>,
    dispatch_permits: Arc<Semaphore>,
    max_queue_delay: Duration,
    resolve_timeout: Duration,
    telemetry: ResolverTelemetry,
}

impl Resolver {
    /// Creates a new `Resolver`.
    pub fn new(client: Arc<dyn MetadataClient>, extractor: KeyExtractor, settings: ResolverSettings) -> Self {
        Self {
            client,
            extractor,
            attribute_cache: ResolutionCache::new("attribute", settings.cache_capacity, settings.cache_ttl),
            entity_cache: ResolutionCache::new("entity", settings.cache_capacity, settings.cache_ttl),
            dispatch_permits: Arc::new(Semaphore::new(settings.max_in_flight.get())),
            max_queue_delay: settings.max_queue_delay,
            resolve_timeout: settings.resolve_timeout,
            telemetry: ResolverTelemetry::new(),
        }
    }

    /// Resolves every key extracted from `span`.
    ///
    /// Always returns a result: per-key failures are absorbed into unresolved-field markers and never propagate.
    pub async fn resolve(&self, span: &NormalizedSpan) -> ResolutionResult {
        let mut attribute_claims = Vec::new();
        let mut entity_claims = Vec::new();
        let mut attribute_waits = Vec::new();
        let mut entity_waits = Vec::new();
        let mut result = ResolutionResult::default();

        for key in self.extractor.extract(span) {
            match key.kind() {
                KeyKind::Attribute => match self.attribute_cache.lookup(&key) {
                    LookupOutcome::Hit(value) => {
                        result.attributes.insert(key.raw_key().to_string(), value);
                    }
                    LookupOutcome::Joined(waiter) => attribute_waits.push((key, waiter)),
                    LookupOutcome::Claimed { claim, waiter } => {
                        attribute_claims.push(claim);
                        attribute_waits.push((key, waiter));
                    }
                },
                KeyKind::Entity => match self.entity_cache.lookup(&key) {
                    LookupOutcome::Hit(entity) => {
                        result.entities.insert(key.scope().to_string(), entity);
                    }
                    LookupOutcome::Joined(waiter) => entity_waits.push((key, waiter)),
                    LookupOutcome::Claimed { claim, waiter } => {
                        entity_claims.push(claim);
                        entity_waits.push((key, waiter));
                    }
                },
            }
        }

        if !attribute_claims.is_empty() {
            let client = Arc::clone(&self.client);
            self.dispatch(attribute_claims, self.telemetry.attribute.clone(), move |keys| async move {
                client.resolve_attributes(keys).await
            });
        }
        if !entity_claims.is_empty() {
            let client = Arc::clone(&self.client);
            self.dispatch(entity_claims, self.telemetry.entity.clone(), move |keys| async move {
                client.resolve_entities(keys).await
            });
        }

        let attribute_outcomes = join_all(
            attribute_waits
                .into_iter()
                .map(|(key, waiter)| async move { (key, waiter.wait().await) }),
        );
        for (key, outcome) in attribute_outcomes.await {
            match outcome {
                Ok(value) => {
                    result.attributes.insert(key.raw_key().to_string(), value);
                }
                Err(reason) => {
                    self.telemetry.attribute.record_failure(&reason);
                    result.unresolved.push(UnresolvedField { key, reason });
                }
            }
        }

        let entity_outcomes = join_all(
            entity_waits
                .into_iter()
                .map(|(key, waiter)| async move { (key, waiter.wait().await) }),
        );
        for (key, outcome) in entity_outcomes.await {
            match outcome {
                Ok(entity) => {
                    result.entities.insert(key.scope().to_string(), entity);
                }
                Err(reason) => {
                    self.telemetry.entity.record_failure(&reason);
                    result.unresolved.push(UnresolvedField { key, reason });
                }
            }
        }

        result
    }

    fn dispatch<V, F, Fut>(&self, claims: Vec<ResolveClaim<ResolutionKey, V>>, telemetry: KindTelemetry, call: F)
    where
        V: Clone + Send + 'static,
        F: FnOnce(Vec<ResolutionKey>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<FastHashMap<ResolutionKey, V>, ResolutionFailure>> + Send + 'static,
    {
        telemetry.batch_calls.increment(1);
        telemetry.batch_keys.increment(claims.len() as u64);

        spawn_traced(drive_batch(
            claims,
            Arc::clone(&self.dispatch_permits),
            self.max_queue_delay,
            self.resolve_timeout,
            call,
            telemetry,
        ));
    }
}

async fn drive_batch<V, F, Fut>(
    claims: Vec<ResolveClaim<ResolutionKey, V>>, permits: Arc<Semaphore>, max_queue_delay: Duration,
    call_timeout: Duration, call: F, telemetry: KindTelemetry,
) where
    V: Clone,
    F: FnOnce(Vec<ResolutionKey>) -> Fut,
    Fut: Future<Output = Result<FastHashMap<ResolutionKey, V>, ResolutionFailure>>,
{
    let permit = match timeout(max_queue_delay, permits.acquire_owned()).await {
        Ok(Ok(permit)) => permit,
        _ => {
            // Couldn't get an in-flight slot in time. The batch never reaches the remote service, so there is
            // nothing to leave running for a late back-fill.
            telemetry.queue_timeouts.increment(1);
            debug!(keys = claims.len(), "Batch timed out waiting for an in-flight slot.");
            for claim in claims {
                claim.complete(Err(ResolutionFailure::Timeout));
            }
            return;
        }
    };

    let keys: Vec<ResolutionKey> = claims.iter().map(|claim| claim.key().clone()).collect();
    let call_fut = call(keys);
    tokio::pin!(call_fut);

    let result = match timeout(call_timeout, &mut call_fut).await {
        Ok(result) => result,
        Err(_) => {
            // Release the waiters at the deadline but let the call run to completion, holding its in-flight slot
            // the whole way so the ceiling reflects calls actually outstanding at the remote service.
            telemetry.call_timeouts.increment(1);
            for claim in &claims {
                claim.abandon_waiters(ResolutionFailure::Timeout);
            }
            call_fut.await
        }
    };

    match result {
        Ok(mut resolved) => {
            for claim in claims {
                match resolved.remove(claim.key()) {
                    Some(value) => claim.complete(Ok(value)),
                    None => claim.complete(Err(ResolutionFailure::NotFound)),
                }
            }
        }
        Err(failure) => {
            telemetry.call_failures.increment(1);
            for claim in claims {
                claim.complete(Err(failure.clone()));
            }
        }
    }

    drop(permit);
}
