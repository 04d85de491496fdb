use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "verbatim_cache_hit_total",
            Unit::Count,
            "Total number of output cache hits."
        );
        describe_counter!(
            "verbatim_cache_miss_total",
            Unit::Count,
            "Total number of output cache misses."
        );
        describe_counter!(
            "verbatim_cache_not_modified_total",
            Unit::Count,
            "Total number of conditional requests answered with 304."
        );
        describe_counter!(
            "verbatim_cache_store_total",
            Unit::Count,
            "Total number of responses captured into the cache."
        );
        describe_counter!(
            "verbatim_cache_invalidate_total",
            Unit::Count,
            "Total number of base-key invalidations."
        );
        describe_counter!(
            "verbatim_cache_expired_total",
            Unit::Count,
            "Total number of entries dropped after expiring."
        );
        describe_gauge!(
            "verbatim_cache_entries",
            Unit::Count,
            "Current number of stored cache entries, siblings included."
        );
    });
}
