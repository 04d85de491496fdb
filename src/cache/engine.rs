//! Output cache engine.
//!
//! The request pipeline calls [`OutputCache::before_handle`] before running an
//! operation and [`OutputCache::after_handle`] once it has produced a result.
//! A hit or a not-modified answer from the first call short-circuits the
//! operation entirely.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use metrics::counter;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::clock::{Clock, SystemClock};
use super::config::CacheConfig;
use super::error::CacheError;
use super::fingerprint;
use super::freshness::{Freshness, FreshnessSpec};
use super::invalidation::InvalidationCoordinator;
use super::keys::{
    ArgumentMap, DefaultKeyGenerator, KeyGenerator, ResourceIdentity, VarianceDescriptor,
    base_key_from_args, content_type_key, etag_key, representation_segment,
};
use super::registry::InvalidationRegistry;
use super::store::{CacheStore, MemoryStore};

pub(crate) const METRIC_CACHE_HIT_TOTAL: &str = "verbatim_cache_hit_total";
pub(crate) const METRIC_CACHE_MISS_TOTAL: &str = "verbatim_cache_miss_total";
pub(crate) const METRIC_CACHE_NOT_MODIFIED_TOTAL: &str = "verbatim_cache_not_modified_total";
pub(crate) const METRIC_CACHE_STORE_TOTAL: &str = "verbatim_cache_store_total";

/// Content type reported when neither the entry nor its key carries one.
pub const DEFAULT_CONTENT_TYPE: &str = "application/json";

/// Per-resource caching rules.
#[derive(Clone, Default)]
pub struct CachePolicy {
    pub freshness: FreshnessSpec,
    /// Leave request query pairs out of the variant key.
    pub exclude_query: bool,
    /// Argument names that scope the base key, see
    /// [`extension_from_args`](super::keys::extension_from_args).
    pub extension_args: Vec<String>,
    /// Bypass the cache for authenticated callers.
    pub anonymous_only: bool,
    /// Hash payloads for ETags even if the engine default is random tokens.
    pub hash_content_for_etag: bool,
    /// Overrides the engine's [`KeyGenerator`] for this resource.
    pub key_generator: Option<Arc<dyn KeyGenerator>>,
}

impl fmt::Debug for CachePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachePolicy")
            .field("freshness", &self.freshness)
            .field("exclude_query", &self.exclude_query)
            .field("extension_args", &self.extension_args)
            .field("anonymous_only", &self.anonymous_only)
            .field("hash_content_for_etag", &self.hash_content_for_etag)
            .field("custom_key_generator", &self.key_generator.is_some())
            .finish()
    }
}

impl CachePolicy {
    pub fn new(freshness: FreshnessSpec) -> Self {
        Self {
            freshness,
            ..Default::default()
        }
    }

    pub fn excluding_query(mut self) -> Self {
        self.exclude_query = true;
        self
    }

    pub fn anonymous_only(mut self) -> Self {
        self.anonymous_only = true;
        self
    }

    pub fn hashing_content(mut self) -> Self {
        self.hash_content_for_etag = true;
        self
    }

    pub fn with_extension_args<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extension_args = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_key_generator(mut self, generator: Arc<dyn KeyGenerator>) -> Self {
        self.key_generator = Some(generator);
        self
    }

    /// Scope by a comma-separated argument list such as `"feedId, locale"`.
    pub fn with_cache_args(self, list: &str) -> Self {
        self.with_extension_args(
            list.split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty()),
        )
    }
}

/// Everything the engine needs to know about one unit of work.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub identity: ResourceIdentity,
    pub arguments: ArgumentMap,
    pub query: Vec<(String, String)>,
    /// Negotiated representation, e.g. `application/json`.
    pub representation: Option<String>,
    /// Whether the pipeline allows caching this request at all.
    pub cacheable: bool,
    pub authenticated: bool,
    /// Raw tags from `If-None-Match`.
    pub if_none_match: Vec<String>,
}

impl RequestContext {
    pub fn new(identity: ResourceIdentity) -> Self {
        Self {
            identity,
            arguments: ArgumentMap::new(),
            query: Vec::new(),
            representation: None,
            cacheable: true,
            authenticated: false,
            if_none_match: Vec::new(),
        }
    }

    pub fn with_arguments(mut self, arguments: ArgumentMap) -> Self {
        self.arguments = arguments;
        self
    }

    pub fn with_query<I, N, V>(mut self, query: I) -> Self
    where
        I: IntoIterator<Item = (N, V)>,
        N: Into<String>,
        V: Into<String>,
    {
        self.query = query
            .into_iter()
            .map(|(name, value)| (name.into(), value.into()))
            .collect();
        self
    }

    pub fn with_representation(mut self, representation: impl Into<String>) -> Self {
        self.representation = Some(representation.into());
        self
    }

    pub fn with_cacheable(mut self, cacheable: bool) -> Self {
        self.cacheable = cacheable;
        self
    }

    pub fn with_authenticated(mut self, authenticated: bool) -> Self {
        self.authenticated = authenticated;
        self
    }

    pub fn with_if_none_match<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.if_none_match = tags.into_iter().map(Into::into).collect();
        self
    }
}

/// A cached variant ready to be served.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
    pub payload: Bytes,
    pub content_type: String,
    pub etag: String,
    pub freshness: Freshness,
}

/// Result of [`OutputCache::before_handle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// Run the operation.
    Miss,
    /// Serve the cached payload.
    Hit(CachedResponse),
    /// The client's copy is current; answer 304.
    NotModified { etag: String, freshness: Freshness },
}

/// What the operation produced.
#[derive(Debug, Clone, Default)]
pub struct Outcome {
    pub succeeded: bool,
    pub payload: Option<Bytes>,
    /// Declared representation; falls back to the negotiated one.
    pub content_type: Option<String>,
}

impl Outcome {
    pub fn success(payload: impl Into<Bytes>) -> Self {
        Self {
            succeeded: true,
            payload: Some(payload.into()),
            content_type: None,
        }
    }

    pub fn failure() -> Self {
        Self::default()
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

/// Headers to attach to a freshly produced response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directives {
    pub freshness: Freshness,
    pub etag: String,
}

struct ResolvedKeys {
    base: String,
    variant: String,
}

/// The output cache: key composition, storage, and invalidation behind one
/// handle. Cheap to clone.
#[derive(Clone)]
pub struct OutputCache {
    config: Arc<CacheConfig>,
    store: Arc<dyn CacheStore>,
    coordinator: InvalidationCoordinator,
    clock: Arc<dyn Clock>,
    key_generator: Arc<dyn KeyGenerator>,
}

impl OutputCache {
    pub fn new(
        config: CacheConfig,
        store: Arc<dyn CacheStore>,
        registry: Arc<InvalidationRegistry>,
    ) -> Self {
        Self::with_clock(config, store, registry, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: CacheConfig,
        store: Arc<dyn CacheStore>,
        registry: Arc<InvalidationRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let coordinator = InvalidationCoordinator::new(store.clone(), registry);
        Self {
            config: Arc::new(config),
            store,
            coordinator,
            clock,
            key_generator: Arc::new(DefaultKeyGenerator),
        }
    }

    /// Compose variant keys with `generator` unless a policy brings its own.
    pub fn with_key_generator(mut self, generator: Arc<dyn KeyGenerator>) -> Self {
        self.key_generator = generator;
        self
    }

    /// An engine over a fresh [`MemoryStore`] and an empty registry.
    pub fn in_memory(config: CacheConfig) -> Self {
        Self::new(
            config,
            Arc::new(MemoryStore::new()),
            Arc::new(InvalidationRegistry::new()),
        )
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    pub fn coordinator(&self) -> &InvalidationCoordinator {
        &self.coordinator
    }

    pub fn registry(&self) -> &Arc<InvalidationRegistry> {
        self.coordinator.registry()
    }

    /// A policy built from the configured defaults.
    pub fn default_policy(&self) -> CachePolicy {
        CachePolicy {
            hash_content_for_etag: self.config.hash_content_for_etag,
            ..CachePolicy::new(self.config.default_freshness())
        }
    }

    /// Look the request up before the operation runs.
    pub fn before_handle(
        &self,
        context: &RequestContext,
        policy: &CachePolicy,
    ) -> Result<Lookup, CacheError> {
        if !self.applies(context, policy) {
            return Ok(Lookup::Miss);
        }

        let keys = self.resolve(context, policy)?;
        let Some(cached) = self.read_variant(&keys.variant, policy) else {
            counter!(METRIC_CACHE_MISS_TOTAL).increment(1);
            debug!(cache = "output", outcome = "miss", key = %keys.variant);
            return Ok(Lookup::Miss);
        };

        if fingerprint::matches_any(&context.if_none_match, &cached.etag) {
            counter!(METRIC_CACHE_NOT_MODIFIED_TOTAL).increment(1);
            debug!(cache = "output", outcome = "not_modified", key = %keys.variant);
            return Ok(Lookup::NotModified {
                etag: cached.etag,
                freshness: cached.freshness,
            });
        }

        counter!(METRIC_CACHE_HIT_TOTAL).increment(1);
        debug!(cache = "output", outcome = "hit", key = %keys.variant);
        Ok(Lookup::Hit(cached))
    }

    /// Capture a successful result. Returns the directives to send with it,
    /// or `None` when the response is not cacheable.
    ///
    /// An existing unexpired variant is left untouched. The returned tag always
    /// fingerprints `outcome`'s payload, never the stored one.
    pub fn after_handle(
        &self,
        context: &RequestContext,
        policy: &CachePolicy,
        outcome: &Outcome,
    ) -> Result<Option<Directives>, CacheError> {
        if !outcome.succeeded || !self.applies(context, policy) {
            return Ok(None);
        }
        let Some(payload) = &outcome.payload else {
            return Ok(None);
        };

        let keys = self.resolve(context, policy)?;
        let now = self.clock.now();
        let freshness = policy.freshness.evaluate(now);

        let deterministic = policy.hash_content_for_etag || self.config.hash_content_for_etag;
        let etag = fingerprint::compute(payload, deterministic);

        if self.store.contains(&keys.variant) && self.store.contains(&etag_key(&keys.variant)) {
            trace!(cache = "output", key = %keys.variant, "variant already cached");
            return Ok(Some(Directives { freshness, etag }));
        }

        if freshness.absolute_expiration <= now {
            trace!(cache = "output", key = %keys.variant, "zero retention, not stored");
            return Ok(Some(Directives { freshness, etag }));
        }

        let content_type = outcome
            .content_type
            .clone()
            .or_else(|| context.representation.clone())
            .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());
        let expires = freshness.absolute_expiration;
        let base = Some(keys.base.as_str());

        // Siblings go in before the variant so a reader never finds the
        // variant without its tag.
        self.store.add(&keys.base, Bytes::new(), expires, None);
        self.store.add(
            &content_type_key(&keys.variant),
            Bytes::from(content_type),
            expires,
            base,
        );
        self.store.add(
            &etag_key(&keys.variant),
            Bytes::from(etag.clone()),
            expires,
            base,
        );
        self.store.add(&keys.variant, payload.clone(), expires, base);

        counter!(METRIC_CACHE_STORE_TOTAL).increment(1);
        debug!(
            cache = "output",
            outcome = "stored",
            key = %keys.variant,
            base_key = %keys.base
        );
        Ok(Some(Directives { freshness, etag }))
    }

    /// Post-mutation sweep, see [`InvalidationCoordinator::after_mutation`].
    pub fn after_mutation(
        &self,
        mutation: &ResourceIdentity,
        arguments: &ArgumentMap,
        succeeded: bool,
    ) -> usize {
        self.coordinator.after_mutation(mutation, arguments, succeeded)
    }

    /// Sorted snapshot of every stored key.
    pub fn keys_listing(&self) -> Vec<String> {
        let mut keys = self.store.all_keys();
        keys.sort_unstable();
        keys
    }

    /// Remove every entry under `prefix` (case-insensitive).
    pub fn purge(&self, prefix: &str) -> usize {
        self.coordinator.invalidate_base_key(&prefix.trim().to_lowercase())
    }

    /// Remove everything.
    pub fn clear(&self) -> usize {
        let removed = self.store.remove_by_prefix("");
        debug!(cache = "output", removed, "cleared");
        removed
    }

    /// Run [`CacheStore::purge_expired`] on the configured interval.
    ///
    /// Returns `None` when sweeping is disabled. Must be called inside a tokio
    /// runtime.
    pub fn spawn_sweeper(&self) -> Option<JoinHandle<()>> {
        let period = self.config.sweep_interval()?;
        let store = self.store.clone();
        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await; // Skip the first immediate tick
            loop {
                interval.tick().await;
                let removed = store.purge_expired();
                if removed > 0 {
                    debug!(cache = "sweep", removed, "purged expired entries");
                }
            }
        }))
    }

    fn applies(&self, context: &RequestContext, policy: &CachePolicy) -> bool {
        self.config.enabled
            && context.cacheable
            && !(policy.anonymous_only && context.authenticated)
    }

    fn resolve(
        &self,
        context: &RequestContext,
        policy: &CachePolicy,
    ) -> Result<ResolvedKeys, CacheError> {
        let base =
            base_key_from_args(&context.identity, &context.arguments, &policy.extension_args)?;
        let variance = VarianceDescriptor::new(
            context.arguments.key_pairs(),
            context.query.clone(),
            context.representation.clone(),
        );
        let generator = policy.key_generator.as_ref().unwrap_or(&self.key_generator);
        let variant = generator
            .variant_key(
                &base,
                &variance,
                policy.exclude_query,
                &self.config.callback_param,
            )?
            .to_lowercase();
        if variant.is_empty() {
            return Err(CacheError::invalid_key_context("variant_key"));
        }
        Ok(ResolvedKeys { base, variant })
    }

    fn read_variant(&self, variant: &str, policy: &CachePolicy) -> Option<CachedResponse> {
        let payload = self.store.get(variant)?;
        // A variant without its tag is a half-written or half-removed entry.
        let etag = self.read_text(&etag_key(variant))?;
        let content_type = self
            .read_text(&content_type_key(variant))
            .or_else(|| representation_segment(variant).map(str::to_string))
            .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());

        Some(CachedResponse {
            payload,
            content_type,
            etag,
            freshness: policy.freshness.evaluate(self.clock.now()),
        })
    }

    fn read_text(&self, key: &str) -> Option<String> {
        self.store
            .get(key)
            .and_then(|bytes| String::from_utf8(bytes.to_vec()).ok())
            .filter(|text| !text.is_empty())
    }
}
