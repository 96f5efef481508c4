//! Slot registration and per-request shell assembly.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use async_stream::stream;
use bytes::Bytes;
use futures::Stream;
use metrics::{counter, histogram};
use tracing::{error, warn};

use super::error::EngineError;
use super::lock::{rw_read, rw_write};
use super::render::{RenderProps, SlotRenderer};
use super::shell::{Segment, ShellEntry, slot_fallback};

const SOURCE: &str = "cache::slots";
const METRIC_SLOT_FALLBACK: &str = "rendercache_slot_fallback_total";
const METRIC_SLOT_RENDER_MS: &str = "rendercache_slot_render_ms";

/// Slot renderers registered for one route.
pub type RouteSlots = Arc<HashMap<String, Arc<dyn SlotRenderer>>>;

/// Route → slot name → renderer. Populated at startup, read-only afterwards.
#[derive(Default)]
pub struct SlotRegistry {
    routes: RwLock<HashMap<String, RouteSlots>>,
}

impl SlotRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `renderer` for `slot` on `route`, replacing any previous one.
    pub fn register(
        &self,
        route: &str,
        slot: &str,
        renderer: Arc<dyn SlotRenderer>,
    ) -> Result<(), EngineError> {
        let slot = slot.trim();
        if slot.is_empty() {
            return Err(EngineError::configuration(
                format!("routes.{route}.slots"),
                "slot names must not be empty",
            ));
        }

        let mut routes = rw_write(&self.routes, SOURCE, "register");
        let mut slots = routes
            .get(route)
            .map(|existing| existing.as_ref().clone())
            .unwrap_or_default();
        slots.insert(slot.to_string(), renderer);
        routes.insert(route.to_string(), Arc::new(slots));
        Ok(())
    }

    /// Snapshot of the renderers registered for `route`.
    pub fn route_slots(&self, route: &str) -> RouteSlots {
        rw_read(&self.routes, SOURCE, "route_slots")
            .get(route)
            .cloned()
            .unwrap_or_default()
    }

    pub fn contains(&self, route: &str, slot: &str) -> bool {
        rw_read(&self.routes, SOURCE, "contains")
            .get(route)
            .is_some_and(|slots| slots.contains_key(slot))
    }
}

/// Stream `shell` with every slot replaced by its per-request fragment.
///
/// Fragments are rendered lazily as the consumer pulls, so dropping the
/// stream stops further slot rendering. Missing registrations yield an empty
/// fragment; failing slots yield [`slot_fallback`]. Neither ends the stream.
pub fn assemble(
    route: String,
    shell: ShellEntry,
    slots: RouteSlots,
    props: RenderProps,
) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
    stream! {
        for segment in shell.segments().iter() {
            match segment {
                Segment::Static(bytes) => yield Ok(bytes.clone()),
                Segment::Slot(name) => {
                    let fragment = render_slot(&route, name, slots.get(name), &props).await;
                    if !fragment.is_empty() {
                        yield Ok(fragment);
                    }
                }
            }
        }
    }
}

async fn render_slot(
    route: &str,
    name: &str,
    renderer: Option<&Arc<dyn SlotRenderer>>,
    props: &RenderProps,
) -> Bytes {
    let Some(renderer) = renderer else {
        counter!(METRIC_SLOT_FALLBACK, "reason" => "missing").increment(1);
        warn!(
            route,
            slot = name,
            path = %props.path,
            "no renderer registered for slot; substituting empty fragment"
        );
        return Bytes::new();
    };

    let started = Instant::now();
    let result = renderer.render(props).await;
    histogram!(METRIC_SLOT_RENDER_MS).record(started.elapsed().as_secs_f64() * 1000.0);

    match result {
        Ok(bytes) => bytes,
        Err(err) => {
            counter!(METRIC_SLOT_FALLBACK, "reason" => "error").increment(1);
            error!(
                route,
                slot = name,
                path = %props.path,
                error = %err,
                "slot render failed; substituting fallback"
            );
            slot_fallback(name)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::StreamExt;

    use super::*;
    use crate::cache::error::RenderError;
    use crate::cache::render::slot_fn;
    use crate::cache::shell::slot_marker;

    fn shell() -> ShellEntry {
        ShellEntry::parse(Bytes::from(format!(
            "<header/>{}<hr/>{}<footer/>",
            slot_marker("greeting"),
            slot_marker("feed")
        )))
    }

    async fn collect(stream: impl Stream<Item = Result<Bytes, Infallible>>) -> String {
        let chunks: Vec<_> = stream.collect().await;
        let mut body = Vec::new();
        for chunk in chunks {
            body.extend_from_slice(&chunk.expect("assembly never fails"));
        }
        String::from_utf8(body).expect("utf-8 body")
    }

    #[tokio::test]
    async fn fills_slots_with_request_props() {
        let registry = SlotRegistry::new();
        registry
            .register(
                "/dashboard",
                "greeting",
                slot_fn(|props: RenderProps| async move {
                    let name = props.query("name").unwrap_or("guest").to_string();
                    Ok::<_, RenderError>(Bytes::from(format!("hi {name}")))
                }),
            )
            .expect("register greeting");
        registry
            .register(
                "/dashboard",
                "feed",
                slot_fn(|_props| async { Ok::<_, RenderError>(Bytes::from_static(b"[items]")) }),
            )
            .expect("register feed");

        let props = RenderProps::new("/dashboard").with_query("name", "ada");
        let body = collect(assemble(
            "/dashboard".to_string(),
            shell(),
            registry.route_slots("/dashboard"),
            props,
        ))
        .await;

        assert_eq!(body, "<header/>hi ada<hr/>[items]<footer/>");
    }

    #[tokio::test]
    async fn missing_slot_becomes_empty_fragment() {
        let registry = SlotRegistry::new();
        registry
            .register(
                "/dashboard",
                "feed",
                slot_fn(|_props| async { Ok::<_, RenderError>(Bytes::from_static(b"[items]")) }),
            )
            .expect("register feed");

        let body = collect(assemble(
            "/dashboard".to_string(),
            shell(),
            registry.route_slots("/dashboard"),
            RenderProps::new("/dashboard"),
        ))
        .await;

        assert_eq!(body, "<header/><hr/>[items]<footer/>");
    }

    #[tokio::test]
    async fn failing_slot_is_isolated() {
        let registry = SlotRegistry::new();
        registry
            .register(
                "/dashboard",
                "greeting",
                slot_fn(|_props| async { Err::<Bytes, _>(RenderError::failed("down")) }),
            )
            .expect("register greeting");
        registry
            .register(
                "/dashboard",
                "feed",
                slot_fn(|_props| async { Ok::<_, RenderError>(Bytes::from_static(b"[items]")) }),
            )
            .expect("register feed");

        let body = collect(assemble(
            "/dashboard".to_string(),
            shell(),
            registry.route_slots("/dashboard"),
            RenderProps::new("/dashboard"),
        ))
        .await;

        assert_eq!(
            body,
            "<header/><!--slot:greeting unavailable--><hr/>[items]<footer/>"
        );
    }

    #[tokio::test]
    async fn dropping_the_stream_stops_slot_rendering() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = SlotRegistry::new();
        for slot in ["greeting", "feed"] {
            let calls = Arc::clone(&calls);
            registry
                .register(
                    "/dashboard",
                    slot,
                    slot_fn(move |_props| {
                        let calls = Arc::clone(&calls);
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            Ok::<_, RenderError>(Bytes::from_static(b"x"))
                        }
                    }),
                )
                .expect("register slot");
        }

        let stream = assemble(
            "/dashboard".to_string(),
            shell(),
            registry.route_slots("/dashboard"),
            RenderProps::new("/dashboard"),
        );
        let mut stream = Box::pin(stream);

        // Header, then the first slot; the client disconnects afterwards.
        assert!(stream.next().await.is_some());
        assert!(stream.next().await.is_some());
        drop(stream);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn registration_is_per_route() {
        let registry = SlotRegistry::new();
        registry
            .register(
                "/a",
                "feed",
                slot_fn(|_props| async { Ok::<_, RenderError>(Bytes::new()) }),
            )
            .expect("register");
        assert!(registry.contains("/a", "feed"));
        assert!(!registry.contains("/b", "feed"));

        let blank = registry.register(
            "/a",
            "  ",
            slot_fn(|_props| async { Ok::<_, RenderError>(Bytes::new()) }),
        );
        assert!(blank.is_err());
    }
}
