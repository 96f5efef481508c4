//! Strategy dispatch for every page request.
//!
//! [`RenderEngine`] owns the registries, both stores, the miss coalescers and
//! the revalidation coordinator. A request is resolved to its route strategy
//! and then served by one of four paths: fresh render, page cache (with or
//! without background revalidation), or shell assembly.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use metrics::{counter, histogram};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::config::EngineConfig;
use super::error::{EngineError, RenderError};
use super::flight::{FlightRegistry, FlightRole};
use super::keys::CacheKey;
use super::lock::{rw_read, rw_write};
use super::render::{PageRenderer, RenderMode, RenderProps, SlotRenderer};
use super::response::{PageResponse, RenderOutcome};
use super::revalidate::{DrainReport, RevalidationCoordinator};
use super::shell::ShellEntry;
use super::slots::{SlotRegistry, assemble};
use super::store::{CacheEntry, CacheStore, MemoryStore, RenderSequence, StoreWrite};
use super::strategy::{RouteStrategy, StrategyKind, StrategyOverride, StrategyRegistry};

const SOURCE: &str = "cache::engine";
const METRIC_PAGE_HIT: &str = "rendercache_page_hit_total";
const METRIC_PAGE_MISS: &str = "rendercache_page_miss_total";
const METRIC_PAGE_STALE: &str = "rendercache_page_stale_total";
const METRIC_PAGE_EVICT: &str = "rendercache_page_evict_total";
const METRIC_SHELL_HIT: &str = "rendercache_shell_hit_total";
const METRIC_SHELL_MISS: &str = "rendercache_shell_miss_total";
const METRIC_SHELL_EVICT: &str = "rendercache_shell_evict_total";
const METRIC_RENDER_COALESCED: &str = "rendercache_render_coalesced_total";
const METRIC_RENDER_MS: &str = "rendercache_render_ms";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Freshness {
    Fresh,
    /// Servable, but a background refresh is due.
    Stale,
    /// Past its absolute TTL; must be re-rendered before serving.
    Expired,
}

fn classify(strategy: &RouteStrategy, entry: &CacheEntry, now: Instant) -> Freshness {
    let age = entry.age(now);
    match strategy.kind {
        StrategyKind::CacheWithRevalidation if age >= strategy.revalidate_after => {
            Freshness::Stale
        }
        StrategyKind::CacheOnce if strategy.ttl.is_some_and(|ttl| age >= ttl) => {
            Freshness::Expired
        }
        _ => Freshness::Fresh,
    }
}

pub struct RenderEngine {
    config: EngineConfig,
    strategies: StrategyRegistry,
    renderers: RwLock<HashMap<String, Arc<dyn PageRenderer>>>,
    slots: SlotRegistry,
    pages: Arc<dyn CacheStore<CacheEntry>>,
    shells: Arc<dyn CacheStore<ShellEntry>>,
    sequence: RenderSequence,
    page_flights: FlightRegistry<Bytes>,
    shell_flights: FlightRegistry<ShellEntry>,
    revalidation: RevalidationCoordinator,
}

impl RenderEngine {
    /// Engine backed by two in-memory stores bounded by `config.capacity`.
    pub fn new(config: EngineConfig) -> Self {
        let pages: Arc<dyn CacheStore<CacheEntry>> =
            Arc::new(MemoryStore::new("page", config.capacity));
        let shells: Arc<dyn CacheStore<ShellEntry>> =
            Arc::new(MemoryStore::new("shell", config.capacity));
        Self::with_stores(config, pages, shells)
    }

    /// Engine backed by caller-supplied stores.
    pub fn with_stores(
        config: EngineConfig,
        pages: Arc<dyn CacheStore<CacheEntry>>,
        shells: Arc<dyn CacheStore<ShellEntry>>,
    ) -> Self {
        let sequence = RenderSequence::new();
        let revalidation = RevalidationCoordinator::new(
            Arc::clone(&pages),
            sequence.clone(),
            config.revalidate_failure_cooldown,
        );
        Self {
            strategies: StrategyRegistry::new(config.defaults.clone()),
            config,
            renderers: RwLock::new(HashMap::new()),
            slots: SlotRegistry::new(),
            pages,
            shells,
            sequence,
            page_flights: FlightRegistry::new(),
            shell_flights: FlightRegistry::new(),
            revalidation,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Register `renderer` for `route` with its strategy overrides.
    ///
    /// Re-registering a route replaces both renderer and strategy.
    pub fn register_route(
        &self,
        route: &str,
        renderer: Arc<dyn PageRenderer>,
        overrides: StrategyOverride,
    ) -> Result<RouteStrategy, EngineError> {
        let strategy = self.strategies.register(route, &overrides)?;
        rw_write(&self.renderers, SOURCE, "register_route").insert(route.to_string(), renderer);
        Ok(strategy)
    }

    pub fn register_slot(
        &self,
        route: &str,
        slot: &str,
        renderer: Arc<dyn SlotRenderer>,
    ) -> Result<(), EngineError> {
        let strategy = self.strategies.resolve(route);
        if !strategy.slot_names.iter().any(|declared| declared == slot.trim()) {
            warn!(route, slot, "slot registered but not declared by the route strategy");
        }
        self.slots.register(route, slot, renderer)
    }

    /// Strategy registered for `route`, or the process default.
    pub fn resolve_strategy(&self, route: &str) -> RouteStrategy {
        self.strategies.resolve(route)
    }

    /// Strategy actually applied to requests, honouring the caching switch.
    pub fn effective_strategy(&self, route: &str) -> RouteStrategy {
        if self.config.is_enabled() {
            self.strategies.resolve(route)
        } else {
            RouteStrategy::fresh()
        }
    }

    /// Registered route patterns with their resolved strategies.
    pub fn routes(&self) -> Vec<(String, RouteStrategy)> {
        self.strategies.routes()
    }

    /// Serve one request for `route`, whose resolved path is `props.path`.
    pub async fn render(
        &self,
        route: &str,
        props: RenderProps,
    ) -> Result<PageResponse, EngineError> {
        let renderer = self.renderer(route)?;
        let strategy = self.effective_strategy(route);
        let key = CacheKey::from_path(&props.path);

        match strategy.kind {
            StrategyKind::Fresh => {
                let path = props.path.clone();
                let bytes = timed_render(route, RenderMode::Normal, async {
                    renderer.render(&props, RenderMode::Normal).await
                })
                .await
                .map_err(|err| EngineError::render(path, err))?;
                debug!(route, key = %key, outcome = "bypass", "page rendered fresh");
                Ok(PageResponse::full(bytes, &strategy, RenderOutcome::Bypass))
            }
            StrategyKind::CacheOnce | StrategyKind::CacheWithRevalidation => {
                self.serve_page(route, key, renderer, props, strategy).await
            }
            StrategyKind::StaticShell => {
                self.serve_shell(route, key, renderer, props, strategy).await
            }
        }
    }

    /// Drop cached page and shell entries for `path`.
    pub async fn invalidate(&self, path: &str) -> bool {
        let key = CacheKey::from_path(path);
        let page = self.pages.remove(&key).await;
        let shell = self.shells.remove(&key).await;
        self.revalidation.clear_failure(&key);
        if page || shell {
            info!(key = %key, page, shell, "cache entry invalidated");
        }
        page || shell
    }

    pub async fn invalidate_all(&self) {
        self.pages.clear().await;
        self.shells.clear().await;
        self.revalidation.clear_failures();
        info!("all cache entries invalidated");
    }

    /// Wait for the background revalidation of `path`, if one is running.
    pub async fn settled(&self, path: &str) {
        self.revalidation.settled(&CacheKey::from_path(path)).await;
    }

    pub fn revalidations_in_flight(&self) -> usize {
        self.revalidation.in_flight()
    }

    /// Stop scheduling revalidations and drain outstanding ones within `grace`.
    pub async fn shutdown(&self, grace: Duration) -> DrainReport {
        self.revalidation.shutdown(grace).await
    }

    fn renderer(&self, route: &str) -> Result<Arc<dyn PageRenderer>, EngineError> {
        rw_read(&self.renderers, SOURCE, "renderer")
            .get(route)
            .cloned()
            .ok_or_else(|| EngineError::UnknownRoute {
                route: route.to_string(),
            })
    }

    async fn serve_page(
        &self,
        route: &str,
        key: CacheKey,
        renderer: Arc<dyn PageRenderer>,
        props: RenderProps,
        strategy: RouteStrategy,
    ) -> Result<PageResponse, EngineError> {
        if let Some(entry) = self.pages.get(&key).await {
            match classify(&strategy, &entry, Instant::now()) {
                Freshness::Fresh => {
                    counter!(METRIC_PAGE_HIT).increment(1);
                    debug!(cache = "page", outcome = "hit", key = %key, "page served from cache");
                    return Ok(PageResponse::full(
                        entry.bytes().clone(),
                        &strategy,
                        RenderOutcome::Hit,
                    ));
                }
                Freshness::Stale => {
                    counter!(METRIC_PAGE_STALE).increment(1);
                    let scheduled = self.schedule_revalidation(route, &key, renderer, props);
                    debug!(
                        cache = "page",
                        outcome = "stale",
                        key = %key,
                        age_ms = entry.age(Instant::now()).as_millis() as u64,
                        scheduled,
                        "stale page served"
                    );
                    return Ok(PageResponse::full(
                        entry.bytes().clone(),
                        &strategy,
                        RenderOutcome::Stale,
                    ));
                }
                Freshness::Expired => {
                    debug!(cache = "page", key = %key, "page entry past ttl");
                }
            }
        }

        counter!(METRIC_PAGE_MISS).increment(1);
        debug!(cache = "page", outcome = "miss", key = %key, "page cache miss");
        let bytes = self.fill_page(route, &key, renderer, props, &strategy).await?;
        Ok(PageResponse::full(bytes, &strategy, RenderOutcome::Miss))
    }

    /// Render and store a missing page, coalescing concurrent misses.
    async fn fill_page(
        &self,
        route: &str,
        key: &CacheKey,
        renderer: Arc<dyn PageRenderer>,
        props: RenderProps,
        strategy: &RouteStrategy,
    ) -> Result<Bytes, EngineError> {
        let path = props.path.clone();
        let pages = Arc::clone(&self.pages);
        let sequence = self.sequence.clone();
        let owned_key = key.clone();
        let owned_route = route.to_string();
        let strategy = strategy.clone();

        let (result, role) = self
            .page_flights
            .run(key, move || {
                render_page(pages, sequence, owned_key, owned_route, renderer, props, strategy)
            })
            .await;

        if role == FlightRole::Follower {
            counter!(METRIC_RENDER_COALESCED).increment(1);
            debug!(cache = "page", key = %key, "joined in-flight render");
        }
        result.map_err(|err| EngineError::render(path, err))
    }

    fn schedule_revalidation(
        &self,
        route: &str,
        key: &CacheKey,
        renderer: Arc<dyn PageRenderer>,
        props: RenderProps,
    ) -> bool {
        let route = route.to_string();
        self.revalidation.trigger(key.clone(), async move {
            timed_render(&route, RenderMode::Normal, async {
                renderer.render(&props, RenderMode::Normal).await
            })
            .await
        })
    }

    async fn serve_shell(
        &self,
        route: &str,
        key: CacheKey,
        renderer: Arc<dyn PageRenderer>,
        props: RenderProps,
        strategy: RouteStrategy,
    ) -> Result<PageResponse, EngineError> {
        let (shell, outcome) = match self.shells.get(&key).await {
            Some(shell) => {
                counter!(METRIC_SHELL_HIT).increment(1);
                debug!(cache = "shell", outcome = "hit", key = %key, "shell served from cache");
                (shell, RenderOutcome::ShellHit)
            }
            None => {
                counter!(METRIC_SHELL_MISS).increment(1);
                debug!(cache = "shell", outcome = "miss", key = %key, "shell cache miss");
                let shell = self
                    .fill_shell(route, &key, renderer, props.clone(), &strategy)
                    .await?;
                (shell, RenderOutcome::ShellMiss)
            }
        };

        let body = assemble(route.to_string(), shell, self.slots.route_slots(route), props);
        Ok(PageResponse::streamed(body.boxed(), &strategy, outcome))
    }

    /// Render the shell in shell-build mode and record its slot positions.
    async fn fill_shell(
        &self,
        route: &str,
        key: &CacheKey,
        renderer: Arc<dyn PageRenderer>,
        props: RenderProps,
        strategy: &RouteStrategy,
    ) -> Result<ShellEntry, EngineError> {
        let path = props.path.clone();
        let shells = Arc::clone(&self.shells);
        let owned_key = key.clone();
        let owned_route = route.to_string();
        let declared = strategy.slot_names.clone();

        let (result, role) = self
            .shell_flights
            .run(key, move || {
                build_shell(shells, owned_key, owned_route, renderer, props, declared)
            })
            .await;

        if role == FlightRole::Follower {
            counter!(METRIC_RENDER_COALESCED).increment(1);
            debug!(cache = "shell", key = %key, "joined in-flight shell build");
        }
        result.map_err(|err| EngineError::render(path, err))
    }
}

/// Flight body for a page miss: re-check the store, render, store.
///
/// The write is skipped when the store already holds the result of a render
/// that started later, such as a background revalidation of the same key.
async fn render_page(
    pages: Arc<dyn CacheStore<CacheEntry>>,
    sequence: RenderSequence,
    key: CacheKey,
    route: String,
    renderer: Arc<dyn PageRenderer>,
    props: RenderProps,
    strategy: RouteStrategy,
) -> Result<Bytes, RenderError> {
    // A flight for this key may have finished just before ours began.
    if let Some(entry) = pages.get(&key).await {
        if classify(&strategy, &entry, Instant::now()) == Freshness::Fresh {
            return Ok(entry.bytes().clone());
        }
    }

    let generation = sequence.next();
    let bytes = timed_render(&route, RenderMode::Normal, async {
        renderer.render(&props, RenderMode::Normal).await
    })
    .await?;

    let entry = CacheEntry::new(bytes.clone(), generation);
    match pages.insert_unless(key.clone(), entry, CacheEntry::supersedes).await {
        StoreWrite::Stored {
            evicted: Some(evicted),
        } => {
            counter!(METRIC_PAGE_EVICT).increment(1);
            debug!(cache = "page", key = %evicted, "entry evicted");
        }
        StoreWrite::Stored { evicted: None } => {}
        StoreWrite::Kept => {
            debug!(cache = "page", key = %key, generation, "newer entry already stored");
        }
    }
    Ok(bytes)
}

/// Flight body for a shell miss: render in shell-build mode, locate slots, store.
async fn build_shell(
    shells: Arc<dyn CacheStore<ShellEntry>>,
    key: CacheKey,
    route: String,
    renderer: Arc<dyn PageRenderer>,
    props: RenderProps,
    declared: Vec<String>,
) -> Result<ShellEntry, RenderError> {
    if let Some(shell) = shells.get(&key).await {
        return Ok(shell);
    }

    let bytes = timed_render(&route, RenderMode::ShellBuild, async {
        renderer.render(&props, RenderMode::ShellBuild).await
    })
    .await?;

    let shell = ShellEntry::parse(bytes);
    let missing = shell.missing_slots(&declared).join(",");
    if !missing.is_empty() {
        warn!(
            route = %route,
            missing = %missing,
            "shell build emitted no marker for declared slots"
        );
    }

    if let Some(evicted) = shells.insert(key, shell.clone()).await {
        counter!(METRIC_SHELL_EVICT).increment(1);
        debug!(cache = "shell", key = %evicted, "entry evicted");
    }
    Ok(shell)
}

async fn timed_render<F>(route: &str, mode: RenderMode, render: F) -> Result<Bytes, RenderError>
where
    F: Future<Output = Result<Bytes, RenderError>>,
{
    let started = std::time::Instant::now();
    let result = render.await;
    let mode = match mode {
        RenderMode::Normal => "normal",
        RenderMode::ShellBuild => "shell-build",
    };
    histogram!(METRIC_RENDER_MS, "mode" => mode)
        .record(started.elapsed().as_secs_f64() * 1000.0);
    if let Err(err) = &result {
        debug!(route, mode, error = %err, "render failed");
    }
    result
}
