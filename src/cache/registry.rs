//! Registry of automatic invalidation targets.
//!
//! Maps each mutating operation to the read operations whose cached output it
//! makes stale. Targets are resolved once, at registration time, either from a
//! literal list or by matching an operation catalog against a predicate.

use std::collections::HashMap;
use std::sync::RwLock;

use super::error::CacheError;
use super::keys::{ResourceIdentity, base_key};
use super::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::registry";

/// How much of a read operation's cache a mutation clears.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetScope {
    /// Every cached variant of the operation.
    Whole,
    /// Only the base key derived from the mutation's arguments, using these
    /// names (or a self-describing argument) as the extension.
    Arguments(Vec<String>),
}

/// A read operation invalidated by a mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadTarget {
    pub identity: ResourceIdentity,
    pub scope: TargetScope,
}

impl ReadTarget {
    pub fn whole(identity: ResourceIdentity) -> Self {
        Self {
            identity,
            scope: TargetScope::Whole,
        }
    }

    pub fn scoped<I, S>(identity: ResourceIdentity, extension_args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            identity,
            scope: TargetScope::Arguments(extension_args.into_iter().map(Into::into).collect()),
        }
    }
}

/// Shape of the value an operation returns or accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Shape {
    One(String),
    Many(String),
}

impl Shape {
    pub fn element(&self) -> &str {
        match self {
            Self::One(name) | Self::Many(name) => name,
        }
    }
}

/// Catalog entry describing one operation of a resource group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationDescriptor {
    pub identity: ResourceIdentity,
    /// Explicitly marked as a safe read.
    pub read: bool,
    pub returns: Option<Shape>,
    /// Parameter shapes.
    pub accepts: Vec<String>,
}

impl OperationDescriptor {
    pub fn new(identity: ResourceIdentity) -> Self {
        Self {
            identity,
            read: false,
            returns: None,
            accepts: Vec::new(),
        }
    }

    pub fn read(identity: ResourceIdentity) -> Self {
        Self {
            read: true,
            ..Self::new(identity)
        }
    }

    pub fn returning(mut self, shape: Shape) -> Self {
        self.returns = Some(shape);
        self
    }

    pub fn accepting(mut self, shape: impl Into<String>) -> Self {
        self.accepts.push(shape.into());
        self
    }
}

/// Default sibling predicate for automatic invalidation.
///
/// A candidate is a sibling of a mutation when it lives in the same namespace,
/// is marked as a read or its operation name starts with `read_prefix`, and,
/// with `match_return_shape`, returns one or many of a shape the mutation
/// accepts.
#[derive(Debug, Clone)]
pub struct SiblingMatcher {
    pub read_prefix: String,
    pub match_return_shape: bool,
}

impl Default for SiblingMatcher {
    fn default() -> Self {
        Self {
            read_prefix: "get".to_string(),
            match_return_shape: false,
        }
    }
}

impl SiblingMatcher {
    pub fn matching_return_shape(mut self) -> Self {
        self.match_return_shape = true;
        self
    }

    pub fn matches(&self, mutation: &OperationDescriptor, candidate: &OperationDescriptor) -> bool {
        let (m, c) = (&mutation.identity, &candidate.identity);
        if !c.namespace().eq_ignore_ascii_case(m.namespace())
            || c.operation().eq_ignore_ascii_case(m.operation())
        {
            return false;
        }

        let prefixed = !self.read_prefix.is_empty()
            && c.operation()
                .to_lowercase()
                .starts_with(&self.read_prefix.to_lowercase());
        if !(candidate.read || prefixed) {
            return false;
        }

        if !self.match_return_shape {
            return true;
        }
        candidate.returns.as_ref().is_some_and(|shape| {
            mutation
                .accepts
                .iter()
                .any(|accepted| accepted == shape.element())
        })
    }
}

/// Tracks mutation → read targets.
///
/// Keyed by the mutation's base key, so lookups are case-insensitive.
pub struct InvalidationRegistry {
    targets: RwLock<HashMap<String, Vec<ReadTarget>>>,
}

impl InvalidationRegistry {
    pub fn new() -> Self {
        Self {
            targets: RwLock::new(HashMap::new()),
        }
    }

    /// Register literal targets for a mutation. Targets accumulate across
    /// calls; duplicates are ignored.
    pub fn register(
        &self,
        mutation: &ResourceIdentity,
        targets: impl IntoIterator<Item = ReadTarget>,
    ) -> Result<usize, CacheError> {
        let key = base_key(mutation, None)?;
        let targets = targets
            .into_iter()
            .map(|target| base_key(&target.identity, None).map(|_| target))
            .collect::<Result<Vec<_>, _>>()?;

        let mut guard = rw_write(&self.targets, SOURCE, "register");
        let registered = guard.entry(key).or_default();
        let mut added = 0;
        for target in targets {
            if !registered.contains(&target) {
                registered.push(target);
                added += 1;
            }
        }
        Ok(added)
    }

    /// Register every catalog entry accepted by `predicate` as a whole-resource
    /// target of `mutation`. The predicate runs now, not per request.
    pub fn register_where<F>(
        &self,
        mutation: &ResourceIdentity,
        catalog: &[OperationDescriptor],
        predicate: F,
    ) -> Result<usize, CacheError>
    where
        F: Fn(&OperationDescriptor) -> bool,
    {
        let targets: Vec<ReadTarget> = catalog
            .iter()
            .filter(|candidate| predicate(candidate))
            .map(|candidate| ReadTarget::whole(candidate.identity.clone()))
            .collect();
        self.register(mutation, targets)
    }

    /// Register the siblings `matcher` finds for `mutation` in `catalog`.
    pub fn register_matching(
        &self,
        mutation: &OperationDescriptor,
        catalog: &[OperationDescriptor],
        matcher: &SiblingMatcher,
    ) -> Result<usize, CacheError> {
        self.register_where(&mutation.identity, catalog, |candidate| {
            matcher.matches(mutation, candidate)
        })
    }

    /// Targets registered for `mutation`; empty when none or when the
    /// identity cannot form a key.
    pub fn targets_for(&self, mutation: &ResourceIdentity) -> Vec<ReadTarget> {
        let Ok(key) = base_key(mutation, None) else {
            return Vec::new();
        };
        rw_read(&self.targets, SOURCE, "targets_for")
            .get(&key)
            .cloned()
            .unwrap_or_default()
    }

    pub fn unregister(&self, mutation: &ResourceIdentity) {
        if let Ok(key) = base_key(mutation, None) {
            rw_write(&self.targets, SOURCE, "unregister").remove(&key);
        }
    }

    pub fn clear(&self) {
        rw_write(&self.targets, SOURCE, "clear").clear();
    }

    /// Number of mutations with registered targets.
    pub fn mutation_count(&self) -> usize {
        rw_read(&self.targets, SOURCE, "mutation_count").len()
    }
}

impl Default for InvalidationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(namespace: &str, operation: &str) -> ResourceIdentity {
        ResourceIdentity::new(namespace, operation)
    }

    fn catalog() -> Vec<OperationDescriptor> {
        vec![
            OperationDescriptor::new(op("Feeds", "GetRSSFeed"))
                .returning(Shape::One("Feed".into())),
            OperationDescriptor::new(op("Feeds", "GetAll")).returning(Shape::Many("Feed".into())),
            OperationDescriptor::read(op("Feeds", "Summary"))
                .returning(Shape::One("Stats".into())),
            OperationDescriptor::new(op("Feeds", "PostFeed")).accepting("Feed"),
            OperationDescriptor::new(op("Feeds", "Purge")),
            OperationDescriptor::new(op("Posts", "GetPost")).returning(Shape::One("Post".into())),
        ]
    }

    fn names(targets: &[ReadTarget]) -> Vec<&str> {
        targets.iter().map(|t| t.identity.operation()).collect()
    }

    #[test]
    fn register_and_lookup() {
        let registry = InvalidationRegistry::new();
        let added = registry
            .register(
                &op("Feeds", "PostFeed"),
                [ReadTarget::whole(op("Feeds", "GetAll"))],
            )
            .unwrap();

        assert_eq!(added, 1);
        assert_eq!(
            registry.targets_for(&op("feeds", "postfeed")),
            vec![ReadTarget::whole(op("Feeds", "GetAll"))]
        );
    }

    #[test]
    fn duplicate_targets_are_ignored() {
        let registry = InvalidationRegistry::new();
        let mutation = op("Feeds", "PostFeed");
        let target = ReadTarget::scoped(op("Feeds", "GetRSSFeed"), ["feedId"]);

        registry.register(&mutation, [target.clone()]).unwrap();
        let added = registry.register(&mutation, [target]).unwrap();

        assert_eq!(added, 0);
        assert_eq!(registry.targets_for(&mutation).len(), 1);
    }

    #[test]
    fn invalid_identities_are_rejected() {
        let registry = InvalidationRegistry::new();
        assert!(registry.register(&op("", "PostFeed"), []).is_err());
        assert!(
            registry
                .register(&op("Feeds", "PostFeed"), [ReadTarget::whole(op("Feeds", ""))])
                .is_err()
        );
        assert_eq!(registry.mutation_count(), 0);
    }

    #[test]
    fn default_matcher_uses_prefix_and_read_marker() {
        let registry = InvalidationRegistry::new();
        let catalog = catalog();
        let mutation = catalog[3].clone();

        registry
            .register_matching(&mutation, &catalog, &SiblingMatcher::default())
            .unwrap();

        let targets = registry.targets_for(&mutation.identity);
        assert_eq!(names(&targets), ["GetRSSFeed", "GetAll", "Summary"]);
        assert!(targets.iter().all(|t| t.scope == TargetScope::Whole));
    }

    #[test]
    fn return_shape_filter_accepts_one_and_many() {
        let registry = InvalidationRegistry::new();
        let catalog = catalog();
        let mutation = catalog[3].clone();

        registry
            .register_matching(
                &mutation,
                &catalog,
                &SiblingMatcher::default().matching_return_shape(),
            )
            .unwrap();

        assert_eq!(
            names(&registry.targets_for(&mutation.identity)),
            ["GetRSSFeed", "GetAll"]
        );
    }

    #[test]
    fn no_siblings_is_not_an_error() {
        let registry = InvalidationRegistry::new();
        let catalog = catalog();

        let added = registry
            .register_where(&op("Feeds", "Purge"), &catalog, |_| false)
            .unwrap();

        assert_eq!(added, 0);
        assert!(registry.targets_for(&op("Feeds", "Purge")).is_empty());
    }

    #[test]
    fn unregister_and_clear() {
        let registry = InvalidationRegistry::new();
        registry
            .register(&op("Feeds", "PostFeed"), [ReadTarget::whole(op("Feeds", "GetAll"))])
            .unwrap();
        registry
            .register(&op("Posts", "PutPost"), [ReadTarget::whole(op("Posts", "GetPost"))])
            .unwrap();
        assert_eq!(registry.mutation_count(), 2);

        registry.unregister(&op("Feeds", "PostFeed"));
        assert_eq!(registry.mutation_count(), 1);

        registry.clear();
        assert_eq!(registry.mutation_count(), 0);
    }
}
