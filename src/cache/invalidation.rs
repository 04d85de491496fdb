//! Explicit and post-mutation invalidation.

use std::sync::Arc;

use metrics::counter;
use tracing::{debug, warn};

use super::error::CacheError;
use super::keys::{ArgumentMap, ResourceIdentity, base_key, base_key_from_args};
use super::registry::{InvalidationRegistry, ReadTarget, TargetScope};
use super::store::CacheStore;

pub(crate) const METRIC_CACHE_INVALIDATE_TOTAL: &str = "verbatim_cache_invalidate_total";

/// Turns resource identities into base keys and clears their scope.
///
/// Invalidation is idempotent: clearing an absent scope is a no-op.
#[derive(Clone)]
pub struct InvalidationCoordinator {
    store: Arc<dyn CacheStore>,
    registry: Arc<InvalidationRegistry>,
}

impl InvalidationCoordinator {
    pub fn new(store: Arc<dyn CacheStore>, registry: Arc<InvalidationRegistry>) -> Self {
        Self { store, registry }
    }

    pub fn registry(&self) -> &Arc<InvalidationRegistry> {
        &self.registry
    }

    /// Remove everything stored under `base_key`. Returns the number of
    /// entries removed.
    pub fn invalidate_base_key(&self, base_key: &str) -> usize {
        if base_key.is_empty() {
            return 0;
        }
        let removed = self.store.remove_by_prefix(base_key);
        counter!(METRIC_CACHE_INVALIDATE_TOTAL).increment(1);
        debug!(cache = "invalidate", base_key, removed, "invalidated scope");
        removed
    }

    /// Invalidate a resource, optionally narrowed to one extension.
    pub fn invalidate(
        &self,
        identity: &ResourceIdentity,
        extension: Option<&str>,
    ) -> Result<usize, CacheError> {
        let key = base_key(identity, extension)?;
        Ok(self.invalidate_base_key(&key))
    }

    /// Invalidate the base key a read operation would derive from `arguments`.
    pub fn invalidate_with_args(
        &self,
        identity: &ResourceIdentity,
        arguments: &ArgumentMap,
        extension_args: &[String],
    ) -> Result<usize, CacheError> {
        let key = base_key_from_args(identity, arguments, extension_args)?;
        Ok(self.invalidate_base_key(&key))
    }

    /// Invalidate one registered target using the mutation's arguments.
    pub fn invalidate_target(
        &self,
        target: &ReadTarget,
        arguments: &ArgumentMap,
    ) -> Result<usize, CacheError> {
        match &target.scope {
            TargetScope::Whole => self.invalidate(&target.identity, None),
            TargetScope::Arguments(names) => {
                self.invalidate_with_args(&target.identity, arguments, names)
            }
        }
    }

    /// Sweep every target registered for `mutation` once it has succeeded.
    ///
    /// Failed mutations and mutations without targets invalidate nothing.
    pub fn after_mutation(
        &self,
        mutation: &ResourceIdentity,
        arguments: &ArgumentMap,
        succeeded: bool,
    ) -> usize {
        if !succeeded {
            return 0;
        }

        let targets = self.registry.targets_for(mutation);
        if targets.is_empty() {
            debug!(cache = "invalidate", mutation = %mutation, "no registered targets");
            return 0;
        }

        targets
            .iter()
            .map(|target| match self.invalidate_target(target, arguments) {
                Ok(removed) => removed,
                Err(err) => {
                    warn!(
                        cache = "invalidate",
                        mutation = %mutation,
                        target = %target.identity,
                        error = %err,
                        "skipping invalidation target"
                    );
                    0
                }
            })
            .sum()
    }
}
