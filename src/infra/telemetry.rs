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

/// Install a global tracing subscriber using the provided logging settings and
/// register metric descriptions. Logs go to stderr; stdout carries command output.
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
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed(),
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
            "sentinel_cache_hit_total",
            Unit::Count,
            "Total number of fetches served from a fresh cache entry."
        );
        describe_counter!(
            "sentinel_cache_miss_total",
            Unit::Count,
            "Total number of fetches that started a backend load."
        );
        describe_counter!(
            "sentinel_cache_coalesced_total",
            Unit::Count,
            "Total number of fetches that joined a load already in flight."
        );
        describe_counter!(
            "sentinel_cache_load_error_total",
            Unit::Count,
            "Total number of failed backend loads."
        );
        describe_counter!(
            "sentinel_realtime_event_total",
            Unit::Count,
            "Total number of push events received, by event name."
        );
        describe_counter!(
            "sentinel_realtime_decode_error_total",
            Unit::Count,
            "Total number of push events dropped because their payload did not decode."
        );
        describe_counter!(
            "sentinel_optimistic_rollback_total",
            Unit::Count,
            "Total number of optimistic mutations reverted after a failed request."
        );
        describe_gauge!(
            "sentinel_realtime_connected",
            Unit::Count,
            "1 while the push channel is connected, 0 otherwise."
        );
    });
}
