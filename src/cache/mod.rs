//! Render-strategy cache engine.
//!
//! Every route is served with one of four strategies:
//!
//! - **fresh**: rendered on every request
//! - **cache-once**: rendered once, then served from the page store
//! - **cache-with-revalidation**: served from the page store and refreshed in
//!   the background once older than the route's interval
//! - **static-shell**: a cached shell streamed with per-request slot fragments
//!
//! ## Configuration
//!
//! Defaults come from the `[render]` section of `rendercache.toml`:
//!
//! ```toml
//! [render]
//! default_strategy = "fresh"
//! default_revalidate_after_seconds = 60
//! cache_max_entries = 1000   # -1 or 0 for unbounded
//! caching_enabled = true
//! ```
//!
//! Per-route strategies are registered in code through
//! [`RenderEngine::register_route`].

mod config;
mod engine;
mod error;
mod flight;
mod keys;
mod lock;
mod render;
mod response;
mod revalidate;
mod shell;
mod slots;
mod store;
mod strategy;

pub use config::{Capacity, CapacityError, EngineConfig};
pub use engine::RenderEngine;
pub use error::{EngineError, RenderError};
pub use flight::{FlightRegistry, FlightRole};
pub use keys::CacheKey;
pub use render::{PageRenderer, RenderMode, RenderProps, SlotRenderer, page_fn, slot_fn};
pub use response::{PageBody, PageResponse, RENDER_CACHE_HEADER, RenderOutcome, cache_control};
pub use revalidate::{DrainReport, RevalidationCoordinator};
pub use shell::{Segment, ShellEntry, slot_fallback, slot_marker};
pub use slots::{RouteSlots, SlotRegistry, assemble};
pub use store::{CacheEntry, CacheStore, MemoryStore, RenderSequence, StoreWrite};
pub use strategy::{
    RouteStrategy, StrategyDefaults, StrategyKind, StrategyOverride, StrategyRegistry,
};
