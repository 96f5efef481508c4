use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
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

/// Register descriptions for every metric the engine emits.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "rendercache_page_hit_total",
            Unit::Count,
            "Page requests served from a fresh cache entry."
        );
        describe_counter!(
            "rendercache_page_miss_total",
            Unit::Count,
            "Page requests that required a synchronous render."
        );
        describe_counter!(
            "rendercache_page_stale_total",
            Unit::Count,
            "Page requests served from a stale entry pending revalidation."
        );
        describe_counter!(
            "rendercache_page_evict_total",
            Unit::Count,
            "Page entries evicted due to capacity."
        );
        describe_counter!(
            "rendercache_shell_hit_total",
            Unit::Count,
            "Static-shell requests served from a cached shell."
        );
        describe_counter!(
            "rendercache_shell_miss_total",
            Unit::Count,
            "Static-shell requests that required a shell build."
        );
        describe_counter!(
            "rendercache_shell_evict_total",
            Unit::Count,
            "Shell entries evicted due to capacity."
        );
        describe_counter!(
            "rendercache_render_coalesced_total",
            Unit::Count,
            "Cache misses that joined a render already in flight."
        );
        describe_counter!(
            "rendercache_revalidate_started_total",
            Unit::Count,
            "Background revalidations scheduled."
        );
        describe_counter!(
            "rendercache_revalidate_failed_total",
            Unit::Count,
            "Background revalidations whose render failed."
        );
        describe_counter!(
            "rendercache_slot_fallback_total",
            Unit::Count,
            "Slots replaced by an empty or fallback fragment."
        );
        describe_histogram!(
            "rendercache_render_ms",
            Unit::Milliseconds,
            "Page and shell render latency in milliseconds."
        );
        describe_histogram!(
            "rendercache_slot_render_ms",
            Unit::Milliseconds,
            "Slot render latency in milliseconds."
        );
    });
}
