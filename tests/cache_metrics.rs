use std::collections::HashSet;
use std::sync::Arc;

use metrics_util::debugging::DebuggingRecorder;
use serial_test::serial;
use verbatim::cache::{
    ArgumentMap, CacheConfig, CachePolicy, FreshnessSpec, InvalidationRegistry, ManualClock,
    MemoryStore, Outcome, OutputCache, RequestContext, ResourceIdentity,
};

#[test]
#[serial]
fn cache_paths_emit_expected_metric_keys() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();

    let start = time::OffsetDateTime::now_utc();
    let clock = Arc::new(ManualClock::new(start));
    let store = Arc::new(MemoryStore::with_clock(clock.clone()));
    let cache = OutputCache::with_clock(
        CacheConfig::default(),
        store.clone(),
        Arc::new(InvalidationRegistry::new()),
        clock.clone(),
    );
    let policy = CachePolicy::new(FreshnessSpec::from_secs(60, 10)).hashing_content();
    let context = RequestContext::new(ResourceIdentity::new("Feeds", "GetRSSFeed"))
        .with_arguments(ArgumentMap::new().with("feedId", 33));

    metrics::with_local_recorder(&recorder, || {
        // miss, store, hit, not modified
        cache.before_handle(&context, &policy).unwrap();
        let directives = cache
            .after_handle(&context, &policy, &Outcome::success("<rss/>"))
            .unwrap()
            .unwrap();
        cache.before_handle(&context, &policy).unwrap();
        let conditional = context.clone().with_if_none_match([directives.etag]);
        cache.before_handle(&conditional, &policy).unwrap();

        // expiry on access
        clock.advance(time::Duration::minutes(5));
        cache.before_handle(&context, &policy).unwrap();

        // explicit invalidation
        cache.purge("feeds-getrssfeed");
    });

    let keys: HashSet<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(key, _, _, _)| key.key().name().to_string())
        .collect();

    for expected in [
        "verbatim_cache_miss_total",
        "verbatim_cache_store_total",
        "verbatim_cache_hit_total",
        "verbatim_cache_not_modified_total",
        "verbatim_cache_expired_total",
        "verbatim_cache_invalidate_total",
        "verbatim_cache_entries",
    ] {
        assert!(keys.contains(expected), "missing metric {expected}");
    }
}
