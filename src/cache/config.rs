//! Engine configuration.
//!
//! Built from the `[render]` settings section; see `crate::config`.

use std::num::NonZeroUsize;
use std::time::Duration;

use thiserror::Error;

use super::strategy::StrategyDefaults;

const DEFAULT_CACHE_MAX_ENTRIES: usize = 1000;
const UNBOUNDED_SENTINEL: i64 = -1;

/// Upper bound on the number of entries a store may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capacity {
    Unbounded,
    Bounded(NonZeroUsize),
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("cache_max_entries must be -1 (unbounded), 0 (unbounded) or positive, got {0}")]
pub struct CapacityError(pub i64);

impl Capacity {
    /// Interpret the configured `cache_max_entries` value.
    ///
    /// `-1` and `0` both mean unbounded; other negatives are rejected.
    pub fn from_max_entries(value: i64) -> Result<Self, CapacityError> {
        match value {
            UNBOUNDED_SENTINEL | 0 => Ok(Capacity::Unbounded),
            v if v < 0 => Err(CapacityError(v)),
            v => usize::try_from(v)
                .ok()
                .and_then(NonZeroUsize::new)
                .map(Capacity::Bounded)
                .ok_or(CapacityError(v)),
        }
    }

    /// True when holding `len` entries exceeds this capacity.
    pub fn is_exceeded_by(self, len: usize) -> bool {
        match self {
            Capacity::Unbounded => false,
            Capacity::Bounded(max) => len > max.get(),
        }
    }
}

impl Default for Capacity {
    fn default() -> Self {
        NonZeroUsize::new(DEFAULT_CACHE_MAX_ENTRIES)
            .map(Capacity::Bounded)
            .unwrap_or(Capacity::Unbounded)
    }
}

/// Process-wide engine settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub defaults: StrategyDefaults,
    /// Applies independently to the page store and the shell store.
    pub capacity: Capacity,
    /// Master switch; when off every route renders fresh.
    pub caching_enabled: bool,
    /// Minimum delay before retrying a failed background revalidation.
    pub revalidate_failure_cooldown: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            defaults: StrategyDefaults::default(),
            capacity: Capacity::default(),
            caching_enabled: true,
            revalidate_failure_cooldown: Duration::ZERO,
        }
    }
}

impl From<&crate::config::RenderSettings> for EngineConfig {
    fn from(settings: &crate::config::RenderSettings) -> Self {
        Self {
            defaults: StrategyDefaults {
                kind: settings.default_strategy,
                revalidate_after: settings.default_revalidate_after,
                ttl: settings.cache_once_ttl,
            },
            capacity: settings.cache_capacity,
            caching_enabled: settings.caching_enabled,
            revalidate_failure_cooldown: settings.revalidate_failure_cooldown,
        }
    }
}

impl EngineConfig {
    /// Returns true if routes may be served from a cache at all.
    pub fn is_enabled(&self) -> bool {
        self.caching_enabled
    }

    pub fn with_capacity(mut self, capacity: Capacity) -> Self {
        self.capacity = capacity;
        self
    }
}
