//! Coalescing, TTL-bound, capacity-bound resolution cache.

use std::{
    collections::BTreeMap,
    fmt,
    future::Future,
    hash::Hash,
    num::NonZeroUsize,
    sync::{Arc, Mutex},
    time::Duration,
};

use borzoi_common::{collections::FastHashMap, task::spawn_traced, time::get_unix_timestamp};
use metrics::{counter, gauge, Counter, Gauge};
use tokio::{sync::oneshot, time::Instant};
use tracing::{debug, trace};

/// Why a key could not be resolved.
///
/// Failures are per-key and are never stored in the cache: the next lookup for a failed key starts a fresh resolution
/// cycle.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ResolutionFailure {
    /// The remote service has no record for the key.
    NotFound,

    /// The resolution did not complete within its time budget.
    Timeout,

    /// The remote service returned a definite error.
    RemoteError {
        /// A description of the remote error.
        message: String,
    },
}

impl ResolutionFailure {
    /// Returns the failure reason as a static string, suitable for metric labels.
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Timeout => "timeout",
            Self::RemoteError { .. } => "remote_error",
        }
    }
}

impl fmt::Display for ResolutionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => f.write_str("not found"),
            Self::Timeout => f.write_str("timed out"),
            Self::RemoteError { message } => write!(f, "remote error: {}", message),
        }
    }
}

/// A handle for receiving the shared result of an in-flight resolution.
pub struct Waiter<V>(oneshot::Receiver<Result<V, ResolutionFailure>>);

impl<V> Waiter<V> {
    /// Waits for the resolution this waiter is attached to.
    ///
    /// If the in-flight request is torn down without ever dispatching a result, this resolves to
    /// [`ResolutionFailure::Timeout`].
    pub async fn wait(self) -> Result<V, ResolutionFailure> {
        self.0.await.unwrap_or(Err(ResolutionFailure::Timeout))
    }
}

/// An exclusive claim on resolving a single key.
///
/// A claim is handed out to exactly one caller per in-flight request, and obligates that caller to eventually call
/// [`complete`][Self::complete]. Dropping a claim without completing it releases all attached waiters with a timeout
/// failure so that nobody waits on a resolution that will never happen.
pub struct ResolveClaim<K, V>
where
    K: Eq + Hash,
{
    key: K,
    generation: u64,
    cache: Option<ResolutionCache<K, V>>,
}

impl<K, V> ResolveClaim<K, V>
where
    K: Eq + Hash,
{
    /// Returns the key this claim resolves.
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Releases all waiters currently attached to this claim's request with the given failure.
    ///
    /// The claim itself stays live: a subsequent [`complete`][Self::complete] with a successful result still
    /// back-fills the cache, it just no longer reaches the released waiters. This is the timeout path: waiters get
    /// their answer at the deadline while the underlying call keeps running.
    pub fn abandon_waiters(&self, failure: ResolutionFailure) {
        if let Some(cache) = self.cache.as_ref() {
            cache.abandon_generation(&self.key, self.generation, failure);
        }
    }
}

impl<K, V> ResolveClaim<K, V>
where
    K: Clone + Eq + Hash,
    V: Clone,
{
    /// Completes this claim's resolution.
    ///
    /// On success the value is fanned out to all attached waiters and inserted into the cache. On failure the error
    /// is fanned out and nothing is cached. If the waiters were already released (see
    /// [`abandon_waiters`][Self::abandon_waiters]), a successful result still populates the cache for future lookups
    /// as long as no fresher value has landed in the meantime.
    pub fn complete(mut self, result: Result<V, ResolutionFailure>) {
        if let Some(cache) = self.cache.take() {
            cache.finish_claim(&self.key, self.generation, result);
        }
    }
}

impl<K, V> Drop for ResolveClaim<K, V>
where
    K: Eq + Hash,
{
    fn drop(&mut self) {
        if let Some(cache) = self.cache.take() {
            debug!("Resolve claim dropped without completion; releasing waiters.");
            cache.abandon_generation(&self.key, self.generation, ResolutionFailure::Timeout);
        }
    }
}

/// The outcome of a cache lookup.
pub enum LookupOutcome<K, V>
where
    K: Eq + Hash,
{
    /// The key had an unexpired cached value.
    Hit(V),

    /// A resolution for the key is already in flight; the caller has been attached as a waiter.
    Joined(Waiter<V>),

    /// The key had no value and no in-flight resolution; the caller now owns the resolution.
    Claimed {
        /// The claim obligating the caller to resolve the key.
        claim: ResolveClaim<K, V>,

        /// The caller's own waiter on the claimed request.
        waiter: Waiter<V>,
    },
}

#[derive(Clone)]
struct CacheTelemetry {
    hits: Counter,
    misses: Counter,
    expired_reads: Counter,
    inserts: Counter,
    evictions: Counter,
    coalesced_lookups: Counter,
    failure_fanouts: Counter,
    timeouts: Counter,
    late_backfills: Counter,
    entries: Gauge,
}

impl CacheTelemetry {
    fn new(cache_name: &'static str) -> Self {
        Self {
            hits: counter!("resolution_cache_hits_total", "cache" => cache_name),
            misses: counter!("resolution_cache_misses_total", "cache" => cache_name),
            expired_reads: counter!("resolution_cache_expired_reads_total", "cache" => cache_name),
            inserts: counter!("resolution_cache_inserts_total", "cache" => cache_name),
            evictions: counter!("resolution_cache_evictions_total", "cache" => cache_name),
            coalesced_lookups: counter!("resolution_cache_coalesced_lookups_total", "cache" => cache_name),
            failure_fanouts: counter!("resolution_cache_failure_fanouts_total", "cache" => cache_name),
            timeouts: counter!("resolution_cache_timeouts_total", "cache" => cache_name),
            late_backfills: counter!("resolution_cache_late_backfills_total", "cache" => cache_name),
            entries: gauge!("resolution_cache_entries", "cache" => cache_name),
        }
    }
}

struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
    access_seq: u64,

    // Unix timestamp of when the value was resolved. Carried for introspection/debugging only.
    resolved_at: u64,
}

struct PendingRequest<V> {
    generation: u64,
    waiters: Vec<oneshot::Sender<Result<V, ResolutionFailure>>>,
}

struct CacheState<K, V> {
    entries: FastHashMap<K, CacheEntry<V>>,
    recency: BTreeMap<u64, K>,
    in_flight: FastHashMap<K, PendingRequest<V>>,
    next_access_seq: u64,
    next_generation: u64,
}

struct Inner<K, V> {
    capacity: NonZeroUsize,
    ttl: Duration,
    state: Mutex<CacheState<K, V>>,
    telemetry: CacheTelemetry,
}

/// A coalescing resolution cache.
///
/// Maps keys to resolved values with two independent bounds: a time-to-live checked lazily on read, and a strict
/// capacity enforced on insert by evicting the least-recently-accessed entry. Lookups that miss while a resolution
/// for the same key is already in flight attach to that request instead of starting another one, so at most one
/// resolution per key is ever outstanding.
///
/// ## Design
///
/// All state lives behind a single mutex: value entries, a recency index for eviction, and the table of in-flight
/// requests. Every transition (claim creation, waiter attach, completion fan-out, eviction) happens atomically under
/// that lock, so callers never observe a half-updated cache. The resolution work itself always runs outside the lock.
///
/// Failures are fanned out to waiters but never cached. Timeouts release waiters without tearing down the underlying
/// call: its eventual result may still be inserted for future lookups, guarded by a per-request generation so a stale
/// completion can never touch the waiters of a newer request for the same key.
pub struct ResolutionCache<K, V> {
    inner: Arc<Inner<K, V>>,
}

impl<K, V> Clone for ResolutionCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> ResolutionCache<K, V> {
    /// Creates a new `ResolutionCache`.
    ///
    /// `name` labels the cache's telemetry. `capacity` bounds the number of cached entries, and `ttl` bounds how long
    /// any single entry may be served.
    pub fn new(name: &'static str, capacity: NonZeroUsize, ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                capacity,
                ttl,
                state: Mutex::new(CacheState {
                    entries: FastHashMap::default(),
                    recency: BTreeMap::new(),
                    in_flight: FastHashMap::default(),
                    next_access_seq: 0,
                    next_generation: 0,
                }),
                telemetry: CacheTelemetry::new(name),
            }),
        }
    }

    /// Returns the number of cached entries, including entries that have expired but not yet been read.
    pub fn len(&self) -> usize {
        self.inner.state.lock().unwrap().entries.len()
    }

    /// Returns `true` if the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, V> ResolutionCache<K, V>
where
    K: Eq + Hash,
{
    fn abandon_generation(&self, key: &K, generation: u64, failure: ResolutionFailure) {
        let mut guard = self.inner.state.lock().unwrap();
        let state = &mut *guard;

        let live = matches!(state.in_flight.get(key), Some(pending) if pending.generation == generation);
        if !live {
            return;
        }

        if let Some(pending) = state.in_flight.remove(key) {
            if matches!(failure, ResolutionFailure::Timeout) {
                self.inner.telemetry.timeouts.increment(1);
            }
            self.inner.telemetry.failure_fanouts.increment(1);
            for waiter in pending.waiters {
                let _ = waiter.send(Err(failure.clone()));
            }
        }
    }
}

impl<K, V> ResolutionCache<K, V>
where
    K: Clone + Eq + Hash,
    V: Clone,
{
    /// Looks up `key`, claiming the resolution if nobody else is working on it.
    ///
    /// An unexpired cached value is returned as [`LookupOutcome::Hit`] and refreshes the entry's recency. Otherwise
    /// the caller either joins an existing in-flight request ([`LookupOutcome::Joined`]) or receives a claim plus its
    /// own waiter ([`LookupOutcome::Claimed`]) and is responsible for driving the resolution.
    pub fn lookup(&self, key: &K) -> LookupOutcome<K, V> {
        let mut guard = self.inner.state.lock().unwrap();
        let state = &mut *guard;
        let now = Instant::now();

        if let Some(entry) = state.entries.get_mut(key) {
            if now < entry.expires_at {
                let new_seq = state.next_access_seq;
                state.next_access_seq += 1;
                state.recency.remove(&entry.access_seq);
                entry.access_seq = new_seq;
                state.recency.insert(new_seq, key.clone());

                self.inner.telemetry.hits.increment(1);
                return LookupOutcome::Hit(entry.value.clone());
            }
        }

        // Lazy expiry: an entry that aged past its TTL is logically absent, so drop it on the way through.
        if let Some(entry) = state.entries.remove(key) {
            trace!(resolved_at = entry.resolved_at, "Removed expired cache entry.");
            state.recency.remove(&entry.access_seq);
            self.inner.telemetry.expired_reads.increment(1);
            self.inner.telemetry.entries.decrement(1.0);
        }

        self.inner.telemetry.misses.increment(1);

        if let Some(pending) = state.in_flight.get_mut(key) {
            let (sender, receiver) = oneshot::channel();
            pending.waiters.push(sender);
            self.inner.telemetry.coalesced_lookups.increment(1);
            return LookupOutcome::Joined(Waiter(receiver));
        }

        let generation = state.next_generation;
        state.next_generation += 1;

        let (sender, receiver) = oneshot::channel();
        state.in_flight.insert(
            key.clone(),
            PendingRequest {
                generation,
                waiters: vec![sender],
            },
        );

        LookupOutcome::Claimed {
            claim: ResolveClaim {
                key: key.clone(),
                generation,
                cache: Some(self.clone()),
            },
            waiter: Waiter(receiver),
        }
    }

    /// Resolves `key` through the cache.
    ///
    /// On a hit the cached value is returned immediately. On a miss the caller either waits on the in-flight
    /// resolution for the key, or claims it and drives `resolver_fn` in a background task. If the resolution does not
    /// complete within `timeout`, every current waiter receives [`ResolutionFailure::Timeout`] while the underlying
    /// call keeps running; a late success still populates the cache for future lookups.
    pub async fn get_or_resolve<F, Fut>(&self, key: K, resolver_fn: F, timeout: Duration) -> Result<V, ResolutionFailure>
    where
        K: Send + 'static,
        V: Send + 'static,
        F: FnOnce(K) -> Fut,
        Fut: Future<Output = Result<V, ResolutionFailure>> + Send + 'static,
    {
        match self.lookup(&key) {
            LookupOutcome::Hit(value) => Ok(value),
            LookupOutcome::Joined(waiter) => waiter.wait().await,
            LookupOutcome::Claimed { claim, waiter } => {
                let call = resolver_fn(key);
                spawn_traced(drive_resolution(claim, call, timeout));
                waiter.wait().await
            }
        }
    }

    fn finish_claim(&self, key: &K, generation: u64, result: Result<V, ResolutionFailure>) {
        let mut guard = self.inner.state.lock().unwrap();
        let state = &mut *guard;

        let pending = match state.in_flight.remove(key) {
            Some(pending) if pending.generation == generation => Some(pending),
            Some(newer) => {
                // A newer request exists for this key; put it back untouched.
                state.in_flight.insert(key.clone(), newer);
                None
            }
            None => None,
        };

        match (pending, result) {
            (Some(pending), Ok(value)) => {
                self.insert_entry(state, key, value.clone());
                for waiter in pending.waiters {
                    let _ = waiter.send(Ok(value.clone()));
                }
            }
            (Some(pending), Err(failure)) => {
                self.inner.telemetry.failure_fanouts.increment(1);
                for waiter in pending.waiters {
                    let _ = waiter.send(Err(failure.clone()));
                }
            }
            (None, Ok(value)) => {
                // Late completion of a request whose waiters were already released. Populate the cache for future
                // lookups, unless a fresher value has landed since.
                let now = Instant::now();
                let has_live_value = state.entries.get(key).map(|e| now < e.expires_at).unwrap_or(false);
                if !has_live_value {
                    self.insert_entry(state, key, value);
                    self.inner.telemetry.late_backfills.increment(1);
                }
            }
            (None, Err(_)) => {
                trace!("Discarded late failure for abandoned resolution.");
            }
        }
    }

    fn insert_entry(&self, state: &mut CacheState<K, V>, key: &K, value: V) {
        let access_seq = state.next_access_seq;
        state.next_access_seq += 1;

        let entry = CacheEntry {
            value,
            expires_at: Instant::now() + self.inner.ttl,
            access_seq,
            resolved_at: get_unix_timestamp(),
        };

        if let Some(previous) = state.entries.insert(key.clone(), entry) {
            state.recency.remove(&previous.access_seq);
        } else {
            self.inner.telemetry.entries.increment(1.0);
        }
        state.recency.insert(access_seq, key.clone());
        self.inner.telemetry.inserts.increment(1);

        while state.entries.len() > self.inner.capacity.get() {
            match state.recency.pop_first() {
                Some((_, victim)) => {
                    if state.entries.remove(&victim).is_some() {
                        self.inner.telemetry.evictions.increment(1);
                        self.inner.telemetry.entries.decrement(1.0);
                    }
                }
                None => break,
            }
        }
    }
}

async fn drive_resolution<K, V, F>(claim: ResolveClaim<K, V>, call: F, budget: Duration)
where
    K: Clone + Eq + Hash,
    V: Clone,
    F: Future<Output = Result<V, ResolutionFailure>>,
{
    tokio::pin!(call);

    let result = match tokio::time::timeout(budget, &mut call).await {
        Ok(result) => result,
        Err(_) => {
            claim.abandon_waiters(ResolutionFailure::Timeout);
            call.await
        }
    };

    claim.complete(result);
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio_test::{assert_pending, assert_ready, task};

    use super::*;

    const RESOLVE_TIMEOUT: Duration = Duration::from_secs(1);

    fn test_cache(capacity: usize, ttl: Duration) -> ResolutionCache<String, String> {
        ResolutionCache::new("test", NonZeroUsize::new(capacity).unwrap(), ttl)
    }

    fn claimed(
        outcome: LookupOutcome<String, String>,
    ) -> (ResolveClaim<String, String>, Waiter<String>) {
        match outcome {
            LookupOutcome::Claimed { claim, waiter } => (claim, waiter),
            LookupOutcome::Hit(_) => panic!("expected a claim, got a hit"),
            LookupOutcome::Joined(_) => panic!("expected a claim, got a join"),
        }
    }

    fn joined(outcome: LookupOutcome<String, String>) -> Waiter<String> {
        match outcome {
            LookupOutcome::Joined(waiter) => waiter,
            LookupOutcome::Hit(_) => panic!("expected a join, got a hit"),
            LookupOutcome::Claimed { .. } => panic!("expected a join, got a claim"),
        }
    }

    fn hit(outcome: LookupOutcome<String, String>) -> String {
        match outcome {
            LookupOutcome::Hit(value) => value,
            LookupOutcome::Joined(_) => panic!("expected a hit, got a join"),
            LookupOutcome::Claimed { .. } => panic!("expected a hit, got a claim"),
        }
    }

    #[tokio::test]
    async fn hit_returns_cached_value_without_resolution() {
        let cache = test_cache(8, Duration::from_secs(60));
        let calls = Arc::new(AtomicUsize::new(0));

        let calls_first = Arc::clone(&calls);
        let first = cache
            .get_or_resolve(
                "svc".to_string(),
                move |_| async move {
                    calls_first.fetch_add(1, Ordering::Relaxed);
                    Ok("checkout".to_string())
                },
                RESOLVE_TIMEOUT,
            )
            .await;
        assert_eq!(first, Ok("checkout".to_string()));

        let calls_second = Arc::clone(&calls);
        let second = cache
            .get_or_resolve(
                "svc".to_string(),
                move |_| async move {
                    calls_second.fetch_add(1, Ordering::Relaxed);
                    Ok("different".to_string())
                },
                RESOLVE_TIMEOUT,
            )
            .await;
        assert_eq!(second, Ok("checkout".to_string()));

        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn concurrent_lookups_share_one_claim() {
        let cache = test_cache(8, Duration::from_secs(60));

        let (claim, first_waiter) = claimed(cache.lookup(&"svc".to_string()));
        let second_waiter = joined(cache.lookup(&"svc".to_string()));
        let third_waiter = joined(cache.lookup(&"svc".to_string()));

        let mut pending_wait = task::spawn(second_waiter.wait());
        assert_pending!(pending_wait.poll());

        claim.complete(Ok("checkout".to_string()));

        assert_eq!(assert_ready!(pending_wait.poll()), Ok("checkout".to_string()));
        assert_eq!(first_waiter.wait().await, Ok("checkout".to_string()));
        assert_eq!(third_waiter.wait().await, Ok("checkout".to_string()));

        assert_eq!(hit(cache.lookup(&"svc".to_string())), "checkout");
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_get_or_resolve_issues_one_call() {
        let cache = test_cache(8, Duration::from_secs(60));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..3 {
            let cache = cache.clone();
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_resolve(
                        "svc".to_string(),
                        move |_| async move {
                            calls.fetch_add(1, Ordering::Relaxed);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok("checkout".to_string())
                        },
                        RESOLVE_TIMEOUT,
                    )
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), Ok("checkout".to_string()));
        }
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_lazily_after_ttl() {
        let cache = test_cache(8, Duration::from_secs(60));
        let calls = Arc::new(AtomicUsize::new(0));

        async fn resolve(
            cache: &ResolutionCache<String, String>, calls: &Arc<AtomicUsize>,
        ) -> Result<String, ResolutionFailure> {
            let calls = Arc::clone(calls);
            cache
                .get_or_resolve(
                    "svc".to_string(),
                    move |_| async move {
                        calls.fetch_add(1, Ordering::Relaxed);
                        Ok("checkout".to_string())
                    },
                    RESOLVE_TIMEOUT,
                )
                .await
        }

        assert_eq!(resolve(&cache, &calls).await, Ok("checkout".to_string()));
        assert_eq!(calls.load(Ordering::Relaxed), 1);

        // Still fresh at 30s.
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(resolve(&cache, &calls).await, Ok("checkout".to_string()));
        assert_eq!(calls.load(Ordering::Relaxed), 1);

        // Past the TTL the entry is logically absent and gets re-fetched.
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(resolve(&cache, &calls).await, Ok("checkout".to_string()));
        assert_eq!(calls.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn capacity_eviction_removes_least_recently_used() {
        let cache = test_cache(2, Duration::from_secs(60));

        async fn resolve(cache: &ResolutionCache<String, String>, key: &str) -> Result<String, ResolutionFailure> {
            let value = format!("value-{}", key);
            cache
                .get_or_resolve(key.to_string(), move |_| async move { Ok(value) }, RESOLVE_TIMEOUT)
                .await
        }

        resolve(&cache, "a").await.unwrap();
        resolve(&cache, "b").await.unwrap();

        // Touch "a" so that "b" becomes the least recently used entry.
        assert_eq!(hit(cache.lookup(&"a".to_string())), "value-a");

        resolve(&cache, "c").await.unwrap();
        assert_eq!(cache.len(), 2);

        assert_eq!(hit(cache.lookup(&"a".to_string())), "value-a");
        assert_eq!(hit(cache.lookup(&"c".to_string())), "value-c");

        // "b" was evicted; looking it up yields a fresh claim.
        let (claim, _waiter) = claimed(cache.lookup(&"b".to_string()));
        claim.complete(Err(ResolutionFailure::NotFound));
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let cache = test_cache(8, Duration::from_secs(60));
        let calls = Arc::new(AtomicUsize::new(0));

        async fn resolve(
            cache: &ResolutionCache<String, String>, calls: &Arc<AtomicUsize>,
        ) -> Result<String, ResolutionFailure> {
            let calls = Arc::clone(calls);
            cache
                .get_or_resolve(
                    "svc".to_string(),
                    move |_| async move {
                        let call = calls.fetch_add(1, Ordering::Relaxed);
                        if call == 0 {
                            Err(ResolutionFailure::RemoteError {
                                message: "unavailable".to_string(),
                            })
                        } else {
                            Ok("checkout".to_string())
                        }
                    },
                    RESOLVE_TIMEOUT,
                )
                .await
        }

        assert_eq!(
            resolve(&cache, &calls).await,
            Err(ResolutionFailure::RemoteError {
                message: "unavailable".to_string()
            })
        );
        assert!(cache.is_empty());

        assert_eq!(resolve(&cache, &calls).await, Ok("checkout".to_string()));
        assert_eq!(calls.load(Ordering::Relaxed), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_resolution_still_populates_cache() {
        let cache = test_cache(8, Duration::from_secs(60));
        let calls = Arc::new(AtomicUsize::new(0));

        let calls_resolver = Arc::clone(&calls);
        let result = cache
            .get_or_resolve(
                "svc".to_string(),
                move |_| async move {
                    calls_resolver.fetch_add(1, Ordering::Relaxed);
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok("late".to_string())
                },
                Duration::from_secs(1),
            )
            .await;
        assert_eq!(result, Err(ResolutionFailure::Timeout));

        // Let the still-running resolution finish and back-fill the cache.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(hit(cache.lookup(&"svc".to_string())), "late");
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn abandoned_waiters_all_receive_the_failure() {
        let cache = test_cache(8, Duration::from_secs(60));

        let (claim, first_waiter) = claimed(cache.lookup(&"svc".to_string()));
        let second_waiter = joined(cache.lookup(&"svc".to_string()));

        claim.abandon_waiters(ResolutionFailure::Timeout);

        assert_eq!(first_waiter.wait().await, Err(ResolutionFailure::Timeout));
        assert_eq!(second_waiter.wait().await, Err(ResolutionFailure::Timeout));

        // The claim is still live, and its eventual success back-fills the cache.
        claim.complete(Ok("late".to_string()));
        assert_eq!(hit(cache.lookup(&"svc".to_string())), "late");
    }

    #[tokio::test]
    async fn late_completion_does_not_disturb_newer_request() {
        let cache = test_cache(8, Duration::from_secs(60));

        let (first_claim, first_waiter) = claimed(cache.lookup(&"svc".to_string()));
        first_claim.abandon_waiters(ResolutionFailure::Timeout);
        assert_eq!(first_waiter.wait().await, Err(ResolutionFailure::Timeout));

        // A retry claims the key anew while the first resolution is still outstanding.
        let (second_claim, second_waiter) = claimed(cache.lookup(&"svc".to_string()));

        // The first resolution completes late: it may back-fill the cache, but must not touch the new request.
        first_claim.complete(Ok("stale".to_string()));
        assert_eq!(hit(cache.lookup(&"svc".to_string())), "stale");

        second_claim.complete(Ok("fresh".to_string()));
        assert_eq!(second_waiter.wait().await, Ok("fresh".to_string()));
        assert_eq!(hit(cache.lookup(&"svc".to_string())), "fresh");
    }

    #[tokio::test]
    async fn dropped_claim_releases_waiters() {
        let cache = test_cache(8, Duration::from_secs(60));

        let (claim, waiter) = claimed(cache.lookup(&"svc".to_string()));
        let joined_waiter = joined(cache.lookup(&"svc".to_string()));

        drop(claim);

        assert_eq!(waiter.wait().await, Err(ResolutionFailure::Timeout));
        assert_eq!(joined_waiter.wait().await, Err(ResolutionFailure::Timeout));
    }
}
