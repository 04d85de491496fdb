//! A small feed API served behind the output cache.
//!
//! Reads are cached per operation; writes sweep the reads they affect. The
//! three write routes register their targets three different ways: a literal
//! list, a predicate over the operation catalog, and the default sibling
//! matcher.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{StatusCode, header},
    middleware,
    response::{IntoResponse, Response},
    routing::{MethodRouter, delete, get, post, put},
};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::cache::{
    CacheError, CachePolicy, CacheRoute, FreshnessSpec, InvalidationRegistry, MutationRoute,
    OperationDescriptor, OutputCache, ReadTarget, ResourceIdentity, Shape, SiblingMatcher,
    invalidate_layer, output_cache_layer,
};

pub const NAMESPACE: &str = "Feeds";
const RSS_CONTENT_TYPE: &str = "application/rss+xml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feed {
    pub id: u64,
    pub title: String,
    pub items: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedInput {
    pub title: String,
    #[serde(default)]
    pub items: Vec<String>,
}

/// In-memory feed storage.
#[derive(Clone, Default)]
pub struct FeedCatalog {
    feeds: Arc<RwLock<BTreeMap<u64, Feed>>>,
    next_id: Arc<AtomicU64>,
}

impl FeedCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn list(&self) -> Vec<Feed> {
        self.feeds.read().await.values().cloned().collect()
    }

    pub async fn get(&self, id: u64) -> Option<Feed> {
        self.feeds.read().await.get(&id).cloned()
    }

    pub async fn create(&self, input: FeedInput) -> Feed {
        let mut guard = self.feeds.write().await;
        let mut id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        while guard.contains_key(&id) {
            id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        }
        let feed = Feed {
            id,
            title: input.title,
            items: input.items,
        };
        guard.insert(id, feed.clone());
        feed
    }

    pub async fn upsert(&self, id: u64, input: FeedInput) -> Feed {
        let feed = Feed {
            id,
            title: input.title,
            items: input.items,
        };
        self.feeds.write().await.insert(id, feed.clone());
        feed
    }

    pub async fn remove(&self, id: u64) -> bool {
        self.feeds.write().await.remove(&id).is_some()
    }
}

pub fn operation(name: &str) -> ResourceIdentity {
    ResourceIdentity::new(NAMESPACE, name)
}

/// Every operation the feed API exposes.
pub fn operation_catalog() -> Vec<OperationDescriptor> {
    vec![
        OperationDescriptor::read(operation("GetAll")).returning(Shape::Many("Feed".into())),
        OperationDescriptor::new(operation("GetFeed")).returning(Shape::One("Feed".into())),
        OperationDescriptor::new(operation("GetRSSFeed")).returning(Shape::One("Rss".into())),
        OperationDescriptor::new(operation("PostFeed"))
            .accepting("Feed")
            .returning(Shape::One("Feed".into())),
        OperationDescriptor::new(operation("PutFeed")).accepting("Feed"),
        OperationDescriptor::new(operation("DeleteFeed")),
    ]
}

pub fn register_invalidation(registry: &InvalidationRegistry) -> Result<(), CacheError> {
    registry.register(
        &operation("PutFeed"),
        [
            ReadTarget::whole(operation("GetAll")),
            ReadTarget::scoped(operation("GetFeed"), ["feedId"]),
            ReadTarget::scoped(operation("GetRSSFeed"), ["feedId"]),
        ],
    )?;

    let catalog = operation_catalog();
    // A new feed can only show up in listings.
    registry.register_where(&operation("PostFeed"), &catalog, |candidate| {
        matches!(candidate.returns, Some(Shape::Many(_)))
    })?;
    registry.register_matching(
        &OperationDescriptor::new(operation("DeleteFeed")),
        &catalog,
        &SiblingMatcher::default(),
    )?;
    Ok(())
}

pub fn build_demo_router(cache: OutputCache, catalog: FeedCatalog) -> Router {
    let listing = cache.default_policy();
    // Authenticated reads bypass the cache.
    let single = cache
        .default_policy()
        .with_cache_args("feedId")
        .anonymous_only();
    let rss = CachePolicy::new(
        FreshnessSpec::from_secs(600, 120)
            .with_shared_max_age(Duration::from_secs(300))
            .with_must_revalidate(true),
    )
    .hashing_content()
    .with_cache_args("feedId");

    let read = |name: &str, policy: CachePolicy| {
        CacheRoute::new(cache.clone(), operation(name), policy)
    };
    let write = |name: &str| MutationRoute::new(cache.clone(), operation(name));

    Router::new()
        .route("/feeds", cached(get(list_feeds), read("GetAll", listing)))
        .route("/feeds", sweeping(post(create_feed), write("PostFeed")))
        .route("/feeds/{feedId}", cached(get(show_feed), read("GetFeed", single)))
        .route("/feeds/{feedId}", sweeping(put(put_feed), write("PutFeed")))
        .route("/feeds/{feedId}", sweeping(delete(delete_feed), write("DeleteFeed")))
        .route("/feeds/{feedId}/rss", cached(get(rss_feed), read("GetRSSFeed", rss)))
        .with_state(catalog)
}

fn cached(method: MethodRouter<FeedCatalog>, route: CacheRoute) -> MethodRouter<FeedCatalog> {
    method.layer(middleware::from_fn_with_state(route, output_cache_layer))
}

fn sweeping(
    method: MethodRouter<FeedCatalog>,
    route: MutationRoute,
) -> MethodRouter<FeedCatalog> {
    method.layer(middleware::from_fn_with_state(route, invalidate_layer))
}

async fn list_feeds(State(catalog): State<FeedCatalog>) -> Json<Vec<Feed>> {
    Json(catalog.list().await)
}

async fn create_feed(
    State(catalog): State<FeedCatalog>,
    Json(input): Json<FeedInput>,
) -> (StatusCode, Json<Feed>) {
    (StatusCode::CREATED, Json(catalog.create(input).await))
}

async fn show_feed(
    State(catalog): State<FeedCatalog>,
    Path(feed_id): Path<u64>,
) -> Result<Json<Feed>, StatusCode> {
    catalog.get(feed_id).await.map(Json).ok_or(StatusCode::NOT_FOUND)
}

async fn put_feed(
    State(catalog): State<FeedCatalog>,
    Path(feed_id): Path<u64>,
    Json(input): Json<FeedInput>,
) -> Json<Feed> {
    Json(catalog.upsert(feed_id, input).await)
}

async fn delete_feed(State(catalog): State<FeedCatalog>, Path(feed_id): Path<u64>) -> StatusCode {
    if catalog.remove(feed_id).await {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn rss_feed(State(catalog): State<FeedCatalog>, Path(feed_id): Path<u64>) -> Response {
    match catalog.get(feed_id).await {
        Some(feed) => {
            ([(header::CONTENT_TYPE, RSS_CONTENT_TYPE)], render_rss(&feed)).into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

fn render_rss(feed: &Feed) -> String {
    let mut xml = String::from(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<rss version=\"2.0\"><channel>",
    );
    xml.push_str(&format!("<title>{}</title>", escape_xml(&feed.title)));
    for item in &feed.items {
        xml.push_str(&format!("<item><title>{}</title></item>", escape_xml(item)));
    }
    xml.push_str("</channel></rss>");
    xml
}

fn escape_xml(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::TargetScope;

    #[test]
    fn registration_resolves_targets_up_front() {
        let registry = InvalidationRegistry::new();
        register_invalidation(&registry).expect("valid identities");

        let put_targets = registry.targets_for(&operation("PutFeed"));
        assert_eq!(put_targets.len(), 3);
        assert_eq!(
            put_targets[2].scope,
            TargetScope::Arguments(vec!["feedId".to_string()])
        );

        let post_targets = registry.targets_for(&operation("PostFeed"));
        assert_eq!(post_targets, [ReadTarget::whole(operation("GetAll"))]);

        let delete_targets: Vec<_> = registry
            .targets_for(&operation("DeleteFeed"))
            .into_iter()
            .map(|target| target.identity.operation().to_string())
            .collect();
        assert_eq!(delete_targets, ["GetAll", "GetFeed", "GetRSSFeed"]);
    }

    #[test]
    fn rss_escapes_markup() {
        let feed = Feed {
            id: 1,
            title: "Tom & Jerry".into(),
            items: vec!["<b>".into()],
        };
        let xml = render_rss(&feed);
        assert!(xml.contains("<title>Tom &amp; Jerry</title>"));
        assert!(xml.contains("<item><title>&lt;b&gt;</title></item>"));
    }

    #[tokio::test]
    async fn catalog_create_skips_taken_ids() {
        let catalog = FeedCatalog::new();
        catalog
            .upsert(1, FeedInput { title: "one".into(), items: vec![] })
            .await;
        let created = catalog
            .create(FeedInput { title: "two".into(), items: vec![] })
            .await;
        assert_eq!(created.id, 2);
        assert_eq!(catalog.list().await.len(), 2);
    }
}
