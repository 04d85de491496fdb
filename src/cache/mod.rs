//! Output cache.
//!
//! Caches the serialized result of read operations keyed by resource identity
//! and request variance, and drops it again when a mutation makes it stale:
//!
//! - [`keys`]: base keys (`namespace-operation[extension]`) and variant keys
//!   (`base:params:representation`), with [`KeyGenerator`] as the seam for
//!   custom variant layouts
//! - [`store`]: the [`CacheStore`] seam and the in-memory [`MemoryStore`]
//! - [`engine`]: the two-phase [`OutputCache::before_handle`] /
//!   [`OutputCache::after_handle`] contract
//! - [`registry`] and [`invalidation`]: automatic and explicit invalidation
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! enabled = true
//! sweep_interval_ms = 60000
//! default_server_retention_secs = 300
//! default_client_max_age_secs = 60
//! hash_content_for_etag = false
//! callback_param = "callback"
//! ```

mod clock;
mod config;
pub mod engine;
mod error;
pub mod fingerprint;
mod freshness;
pub mod invalidation;
pub mod keys;
mod lock;
mod middleware;
pub mod registry;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::CacheConfig;
pub use engine::{
    CachePolicy, CachedResponse, DEFAULT_CONTENT_TYPE, Directives, Lookup, Outcome, OutputCache,
    RequestContext,
};
pub use error::CacheError;
pub use freshness::{CacheDirective, Freshness, FreshnessSpec};
pub use invalidation::InvalidationCoordinator;
pub use keys::{
    ArgValue, ArgumentMap, CacheKeySource, DefaultKeyGenerator, KeyGenerator, ResourceIdentity,
    VarianceDescriptor, base_key, base_key_from_args, variant_key,
};
pub use middleware::{CacheRoute, MutationRoute, invalidate_layer, output_cache_layer};
pub use registry::{
    InvalidationRegistry, OperationDescriptor, ReadTarget, Shape, SiblingMatcher, TargetScope,
};
pub use store::{CacheStore, MemoryStore};
