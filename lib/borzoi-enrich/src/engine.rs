//! The enrichment engine.

use std::{num::NonZeroUsize, sync::Arc, time::Duration};

use borzoi_common::{
    collections::{FastHashMap, FastHashSet},
    task::spawn_traced,
};
use borzoi_config::GenericConfiguration;
use borzoi_error::{generic_error, ErrorContext as _, GenericError};
use metrics::{counter, gauge, histogram, Counter, Gauge, Histogram};
use serde::Deserialize;
use tokio::{
    sync::{mpsc, Semaphore},
    time::Instant,
};
use tracing::{debug, error, warn};

use crate::{
    assemble::{Assembler, AssemblerConfig},
    client::MetadataClient,
    key::{EntityMappingConfig, KeyExtractor},
    projection::{ProjectionEngine, RuleSetConfig},
    record::{EnrichedRecord, SequencedSpan},
    resolve::{Resolver, ResolverSettings},
    sequence::ReorderBuffer,
};

const fn non_zero(value: usize) -> NonZeroUsize {
    match NonZeroUsize::new(value) {
        Some(value) => value,
        None => panic!("value must be non-zero"),
    }
}

fn default_attribute_scope() -> String {
    "span".to_string()
}

const fn default_cache_capacity() -> NonZeroUsize {
    non_zero(16384)
}

const fn default_cache_ttl_seconds() -> u64 {
    300
}

const fn default_max_in_flight() -> NonZeroUsize {
    non_zero(64)
}

const fn default_max_queue_delay_ms() -> u64 {
    500
}

const fn default_resolve_timeout_ms() -> u64 {
    2_000
}

const fn default_workers() -> NonZeroUsize {
    non_zero(8)
}

/// Configuration for the enrichment engine.
#[derive(Clone, Debug, Deserialize)]
pub struct EnrichmentConfiguration {
    /// Scope under which the attribute-kind keys of raw span attributes are resolved.
    ///
    /// Defaults to `span`.
    #[serde(rename = "enrichment_attribute_scope", default = "default_attribute_scope")]
    attribute_scope: String,

    /// Raw attribute keys whose values identify entities, mapped to the entity scope each resolves in.
    ///
    /// Defaults to empty.
    #[serde(rename = "enrichment_entity_mappings", default)]
    entity_mappings: Vec<EntityMappingConfig>,

    /// Maximum number of cached entries per key kind.
    ///
    /// Defaults to 16384.
    #[serde(rename = "enrichment_cache_capacity", default = "default_cache_capacity")]
    cache_capacity: NonZeroUsize,

    /// How long a resolved value may be served from the cache, in seconds.
    ///
    /// Defaults to 300 seconds.
    #[serde(rename = "enrichment_cache_ttl_seconds", default = "default_cache_ttl_seconds")]
    cache_ttl_seconds: u64,

    /// Maximum number of concurrently outstanding remote batch calls.
    ///
    /// Defaults to 64.
    #[serde(rename = "enrichment_max_in_flight_resolutions", default = "default_max_in_flight")]
    max_in_flight: NonZeroUsize,

    /// How long a batch may wait for an in-flight slot before its keys surface as timed out, in milliseconds.
    ///
    /// Defaults to 500 milliseconds.
    #[serde(rename = "enrichment_max_queue_delay_ms", default = "default_max_queue_delay_ms")]
    max_queue_delay_ms: u64,

    /// Time budget for a dispatched batch call, in milliseconds.
    ///
    /// Defaults to 2000 milliseconds.
    #[serde(rename = "enrichment_resolve_timeout_ms", default = "default_resolve_timeout_ms")]
    resolve_timeout_ms: u64,

    /// Number of spans enriched concurrently.
    ///
    /// Defaults to 8.
    #[serde(rename = "enrichment_workers", default = "default_workers")]
    workers: NonZeroUsize,

    /// The projection rule set.
    ///
    /// Defaults to no rules.
    #[serde(rename = "enrichment_projection_rules", default)]
    projection_rules: RuleSetConfig,

    /// Promotion and redaction behavior of record assembly.
    ///
    /// Defaults to no promotions and no redaction.
    #[serde(rename = "enrichment_assembly", default)]
    assembly: AssemblerConfig,

    /// Whether projection rule sources are validated against the attribute service's definitions at startup.
    ///
    /// When the definitions cannot be fetched, validation is skipped with a warning rather than failing startup.
    /// Defaults to `false`.
    #[serde(rename = "enrichment_validate_rule_sources", default)]
    validate_rule_sources: bool,
}

impl EnrichmentConfiguration {
    /// Creates an `EnrichmentConfiguration` from the given generic configuration.
    ///
    /// # Errors
    ///
    /// If the configuration cannot be deserialized, an error variant will be returned.
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, GenericError> {
        Ok(config.as_typed()?)
    }

    /// Sets the scope under which raw span attributes are resolved.
    pub fn with_attribute_scope<S: Into<String>>(mut self, scope: S) -> Self {
        self.attribute_scope = scope.into();
        self
    }

    /// Sets the entity-bearing attribute mappings.
    pub fn with_entity_mappings(mut self, mappings: Vec<EntityMappingConfig>) -> Self {
        self.entity_mappings = mappings;
        self
    }

    /// Sets the per-kind cache capacity.
    pub fn with_cache_capacity(mut self, capacity: NonZeroUsize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    /// Sets the cache time-to-live, in seconds.
    pub fn with_cache_ttl_seconds(mut self, seconds: u64) -> Self {
        self.cache_ttl_seconds = seconds;
        self
    }

    /// Sets the maximum number of concurrently outstanding remote batch calls.
    pub fn with_max_in_flight(mut self, max_in_flight: NonZeroUsize) -> Self {
        self.max_in_flight = max_in_flight;
        self
    }

    /// Sets the maximum batch queue delay, in milliseconds.
    pub fn with_max_queue_delay_ms(mut self, millis: u64) -> Self {
        self.max_queue_delay_ms = millis;
        self
    }

    /// Sets the batch call time budget, in milliseconds.
    pub fn with_resolve_timeout_ms(mut self, millis: u64) -> Self {
        self.resolve_timeout_ms = millis;
        self
    }

    /// Sets the number of spans enriched concurrently.
    pub fn with_workers(mut self, workers: NonZeroUsize) -> Self {
        self.workers = workers;
        self
    }

    /// Sets the projection rule set.
    pub fn with_projection_rules(mut self, rules: RuleSetConfig) -> Self {
        self.projection_rules = rules;
        self
    }

    /// Sets the promotion and redaction behavior of record assembly.
    pub fn with_assembly(mut self, assembly: AssemblerConfig) -> Self {
        self.assembly = assembly;
        self
    }

    /// Sets whether projection rule sources are validated against attribute definitions at startup.
    pub fn with_rule_source_validation(mut self, validate: bool) -> Self {
        self.validate_rule_sources = validate;
        self
    }
}

impl Default for EnrichmentConfiguration {
    fn default() -> Self {
        Self {
            attribute_scope: default_attribute_scope(),
            entity_mappings: Vec::new(),
            cache_capacity: default_cache_capacity(),
            cache_ttl_seconds: default_cache_ttl_seconds(),
            max_in_flight: default_max_in_flight(),
            max_queue_delay_ms: default_max_queue_delay_ms(),
            resolve_timeout_ms: default_resolve_timeout_ms(),
            workers: default_workers(),
            projection_rules: RuleSetConfig::default(),
            assembly: AssemblerConfig::default(),
            validate_rule_sources: false,
        }
    }
}

struct Stages {
    resolver: Resolver,
    projection: ProjectionEngine,
    assembler: Assembler,
    enrich_duration: Histogram,
}

impl Stages {
    async fn enrich_one(&self, sequenced: &SequencedSpan) -> EnrichedRecord {
        let start = Instant::now();

        let resolution = self.resolver.resolve(&sequenced.span).await;

        // Projection sees the effective attribute view: resolved values layered over the span's raw attributes.
        let mut view = sequenced.span.attributes().clone();
        for (key, value) in &resolution.attributes {
            view.insert(key.clone(), value.clone());
        }
        let projected = self.projection.project(view);

        let record = self.assembler.assemble(sequenced, resolution, projected);
        self.enrich_duration.record(start.elapsed().as_secs_f64());
        record
    }
}

struct EngineTelemetry {
    received_spans: Counter,
    discarded_spans: Counter,
    emitted_records: Counter,
    reorder_depth: Gauge,
}

impl EngineTelemetry {
    fn new() -> Self {
        Self {
            received_spans: counter!("enrichment_received_spans_total"),
            discarded_spans: counter!("enrichment_discarded_spans_total"),
            emitted_records: counter!("enrichment_emitted_records_total"),
            reorder_depth: gauge!("enrichment_reorder_buffer_depth"),
        }
    }
}

/// The enrichment core of the trace-processing pipeline.
///
/// Consumes sequenced normalized spans, resolves their attribute and entity keys through coalescing caches, derives
/// projected attributes, and emits exactly one enriched record per span. Spans are enriched concurrently across a
/// worker pool, while per-partition reorder buffers keep the output in input sequence order.
pub struct EnrichmentEngine {
    stages: Arc<Stages>,
    workers: NonZeroUsize,
    telemetry: EngineTelemetry,
}

impl EnrichmentEngine {
    /// Creates an `EnrichmentEngine` from its configuration.
    ///
    /// # Errors
    ///
    /// If the projection rule set or assembly configuration is invalid, an error describing the problem is returned.
    pub async fn from_configuration(
        config: EnrichmentConfiguration, client: Arc<dyn MetadataClient>,
    ) -> Result<Self, GenericError> {
        let catalog = if config.validate_rule_sources {
            match client.attribute_definitions(&config.attribute_scope).await {
                Ok(definitions) => Some(
                    definitions
                        .into_iter()
                        .map(|definition| definition.key)
                        .collect::<FastHashSet<_>>(),
                ),
                Err(e) => {
                    warn!(error = %e, "Failed to fetch attribute definitions; skipping projection source validation.");
                    None
                }
            }
        } else {
            None
        };

        let projection = ProjectionEngine::load(&config.projection_rules, catalog.as_ref())?;
        let assembler = Assembler::new(&config.assembly).error_context("invalid assembly configuration")?;

        let extractor = KeyExtractor::new(config.attribute_scope, config.entity_mappings);
        let resolver = Resolver::new(
            client,
            extractor,
            ResolverSettings {
                cache_capacity: config.cache_capacity,
                cache_ttl: Duration::from_secs(config.cache_ttl_seconds),
                max_in_flight: config.max_in_flight,
                max_queue_delay: Duration::from_millis(config.max_queue_delay_ms),
                resolve_timeout: Duration::from_millis(config.resolve_timeout_ms),
            },
        );

        Ok(Self {
            stages: Arc::new(Stages {
                resolver,
                projection,
                assembler,
                enrich_duration: histogram!("enrichment_duration_seconds"),
            }),
            workers: config.workers,
            telemetry: EngineTelemetry::new(),
        })
    }

    /// Enriches a single span.
    pub async fn enrich_one(&self, sequenced: &SequencedSpan) -> EnrichedRecord {
        self.stages.enrich_one(sequenced).await
    }

    /// Runs the engine until `input` is closed and every accepted span has been emitted.
    ///
    /// Spans are enriched concurrently, bounded by the configured worker count, and emitted to `output` strictly in
    /// per-partition sequence order. A span whose sequence number does not advance its partition is discarded with an
    /// error log; every other span produces exactly one record.
    ///
    /// # Errors
    ///
    /// If `output` is closed before all records have been emitted, an error is returned.
    pub async fn run(
        self, mut input: mpsc::Receiver<SequencedSpan>, output: mpsc::Sender<EnrichedRecord>,
    ) -> Result<(), GenericError> {
        let worker_count = self.workers.get();
        let worker_permits = Arc::new(Semaphore::new(worker_count));

        // Sized to the worker pool so a finishing worker never blocks on reporting its record.
        let (done_tx, mut done_rx) = mpsc::channel::<(u32, u64, EnrichedRecord)>(worker_count);

        let mut buffers: FastHashMap<u32, ReorderBuffer<EnrichedRecord>> = FastHashMap::default();
        let mut accepting = true;
        let mut in_flight = 0usize;

        loop {
            if !accepting && in_flight == 0 {
                break;
            }

            tokio::select! {
                maybe_span = input.recv(), if accepting => match maybe_span {
                    Some(sequenced) => {
                        self.telemetry.received_spans.increment(1);

                        let buffer = buffers.entry(sequenced.partition).or_default();
                        if buffer.admit(sequenced.sequence) {
                            self.telemetry.reorder_depth.increment(1.0);

                            let permit = Arc::clone(&worker_permits)
                                .acquire_owned()
                                .await
                                .map_err(|_| generic_error!("worker semaphore closed unexpectedly"))?;

                            let stages = Arc::clone(&self.stages);
                            let done = done_tx.clone();
                            spawn_traced(async move {
                                let _permit = permit;
                                let record = stages.enrich_one(&sequenced).await;
                                let _ = done.send((record.partition, record.sequence, record)).await;
                            });
                            in_flight += 1;
                        } else {
                            error!(
                                partition = sequenced.partition,
                                sequence = sequenced.sequence,
                                "Discarded span whose sequence number does not advance its partition."
                            );
                            self.telemetry.discarded_spans.increment(1);
                        }
                    }
                    None => {
                        debug!("Span input closed; draining in-flight work.");
                        accepting = false;
                    }
                },
                Some((partition, sequence, record)) = done_rx.recv() => {
                    in_flight -= 1;
                    if let Some(buffer) = buffers.get_mut(&partition) {
                        for record in buffer.complete(sequence, record) {
                            if output.send(record).await.is_err() {
                                return Err(generic_error!("enriched record receiver closed"));
                            }
                            self.telemetry.emitted_records.increment(1);
                            self.telemetry.reorder_depth.decrement(1.0);
                        }
                    }
                }
            }
        }

        debug!("Enrichment engine stopped.");
        Ok(())
    }
}
