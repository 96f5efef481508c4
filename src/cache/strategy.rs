//! Per-route render strategies.
//!
//! Each route is registered once at startup with an optional override; the
//! override is merged over the process-wide defaults when the strategy is
//! resolved. Unregistered routes resolve to the default strategy.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::RwLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::error::EngineError;
use super::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::strategy";

/// How a route's output is produced and cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    /// Rendered on every request.
    #[default]
    Fresh,
    /// Rendered once, then served from the page cache.
    CacheOnce,
    /// Served from the page cache and refreshed in the background once stale.
    CacheWithRevalidation,
    /// Static shell cached once, dynamic slots rendered per request.
    StaticShell,
}

impl StrategyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StrategyKind::Fresh => "fresh",
            StrategyKind::CacheOnce => "cache-once",
            StrategyKind::CacheWithRevalidation => "cache-with-revalidation",
            StrategyKind::StaticShell => "static-shell",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "fresh" => Ok(StrategyKind::Fresh),
            "cache-once" => Ok(StrategyKind::CacheOnce),
            "cache-with-revalidation" => Ok(StrategyKind::CacheWithRevalidation),
            "static-shell" => Ok(StrategyKind::StaticShell),
            other => Err(format!(
                "unknown strategy `{other}` (expected fresh, cache-once, cache-with-revalidation or static-shell)"
            )),
        }
    }
}

/// Fully resolved, immutable strategy for one route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteStrategy {
    pub kind: StrategyKind,
    /// Staleness window for `cache-with-revalidation`.
    pub revalidate_after: Duration,
    /// Declared slots in document order for `static-shell`.
    pub slot_names: Vec<String>,
    /// Hard expiry for `cache-once` entries; `None` caches forever.
    pub ttl: Option<Duration>,
}

impl RouteStrategy {
    pub fn fresh() -> Self {
        Self {
            kind: StrategyKind::Fresh,
            revalidate_after: Duration::ZERO,
            slot_names: Vec::new(),
            ttl: None,
        }
    }
}

/// Process-wide defaults that per-route overrides are merged over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrategyDefaults {
    pub kind: StrategyKind,
    pub revalidate_after: Duration,
    pub ttl: Option<Duration>,
}

impl Default for StrategyDefaults {
    fn default() -> Self {
        Self {
            kind: StrategyKind::Fresh,
            revalidate_after: Duration::from_secs(60),
            ttl: None,
        }
    }
}

impl StrategyDefaults {
    fn resolve(&self) -> RouteStrategy {
        RouteStrategy {
            kind: self.kind,
            revalidate_after: self.revalidate_after,
            slot_names: Vec::new(),
            ttl: self.ttl,
        }
    }
}

/// Per-route settings; unset fields fall back to the defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StrategyOverride {
    pub kind: Option<StrategyKind>,
    pub revalidate_after: Option<Duration>,
    pub slot_names: Option<Vec<String>>,
    pub ttl: Option<Duration>,
}

impl StrategyOverride {
    /// Inherit everything from the process defaults.
    pub fn inherit() -> Self {
        Self::default()
    }

    pub fn fresh() -> Self {
        Self::kind(StrategyKind::Fresh)
    }

    pub fn cache_once() -> Self {
        Self::kind(StrategyKind::CacheOnce)
    }

    /// `cache-with-revalidation` using the default interval.
    pub fn revalidate() -> Self {
        Self::kind(StrategyKind::CacheWithRevalidation)
    }

    pub fn revalidate_after(interval: Duration) -> Self {
        Self {
            revalidate_after: Some(interval),
            ..Self::revalidate()
        }
    }

    pub fn static_shell<I, S>(slots: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            slot_names: Some(slots.into_iter().map(Into::into).collect()),
            ..Self::kind(StrategyKind::StaticShell)
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    fn kind(kind: StrategyKind) -> Self {
        Self {
            kind: Some(kind),
            ..Self::default()
        }
    }

    fn merge_over(&self, defaults: &StrategyDefaults) -> RouteStrategy {
        let mut resolved = defaults.resolve();
        if let Some(kind) = self.kind {
            resolved.kind = kind;
        }
        if let Some(interval) = self.revalidate_after {
            resolved.revalidate_after = interval;
        }
        if let Some(ttl) = self.ttl {
            resolved.ttl = Some(ttl);
        }
        if let Some(slots) = self.slot_names.as_ref() {
            let mut ordered: Vec<String> = Vec::with_capacity(slots.len());
            for slot in slots {
                let slot = slot.trim().to_string();
                if !ordered.contains(&slot) {
                    ordered.push(slot);
                }
            }
            resolved.slot_names = ordered;
        }
        resolved
    }
}

/// Stores the resolved strategy for every registered route.
pub struct StrategyRegistry {
    defaults: StrategyDefaults,
    routes: RwLock<HashMap<String, RouteStrategy>>,
}

impl StrategyRegistry {
    pub fn new(defaults: StrategyDefaults) -> Self {
        Self {
            defaults,
            routes: RwLock::new(HashMap::new()),
        }
    }

    /// Register or replace the strategy for `route`. Last write wins.
    pub fn register(
        &self,
        route: &str,
        overrides: &StrategyOverride,
    ) -> Result<RouteStrategy, EngineError> {
        let resolved = overrides.merge_over(&self.defaults);
        validate(route, &resolved)?;

        debug!(
            route,
            strategy = %resolved.kind,
            revalidate_after_secs = resolved.revalidate_after.as_secs(),
            slots = ?resolved.slot_names,
            "route strategy registered"
        );

        rw_write(&self.routes, SOURCE, "register").insert(route.to_string(), resolved.clone());
        Ok(resolved)
    }

    /// Resolve the strategy for `route`; never fails.
    pub fn resolve(&self, route: &str) -> RouteStrategy {
        rw_read(&self.routes, SOURCE, "resolve")
            .get(route)
            .cloned()
            .unwrap_or_else(|| self.defaults.resolve())
    }

    /// All registered routes, sorted by pattern.
    pub fn routes(&self) -> Vec<(String, RouteStrategy)> {
        let mut routes: Vec<_> = rw_read(&self.routes, SOURCE, "routes")
            .iter()
            .map(|(route, strategy)| (route.clone(), strategy.clone()))
            .collect();
        routes.sort_by(|a, b| a.0.cmp(&b.0));
        routes
    }
}

/// `Cache-Control` carries whole seconds.
const MIN_REVALIDATE_AFTER: Duration = Duration::from_secs(1);

fn validate(route: &str, strategy: &RouteStrategy) -> Result<(), EngineError> {
    match strategy.kind {
        StrategyKind::CacheWithRevalidation
            if strategy.revalidate_after < MIN_REVALIDATE_AFTER =>
        {
            Err(EngineError::configuration(
                format!("routes.{route}.revalidate_after"),
                "must be at least one second",
            ))
        }
        StrategyKind::CacheOnce if strategy.ttl.is_some_and(|ttl| ttl.is_zero()) => {
            Err(EngineError::configuration(
                format!("routes.{route}.ttl"),
                "must be greater than zero when set",
            ))
        }
        StrategyKind::StaticShell if strategy.slot_names.iter().any(|slot| slot.is_empty()) => {
            Err(EngineError::configuration(
                format!("routes.{route}.slots"),
                "slot names must not be empty",
            ))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> StrategyRegistry {
        StrategyRegistry::new(StrategyDefaults {
            kind: StrategyKind::Fresh,
            revalidate_after: Duration::from_secs(120),
            ttl: None,
        })
    }

    #[test]
    fn unregistered_route_resolves_to_default() {
        let registry = registry();
        let strategy = registry.resolve("/nowhere");
        assert_eq!(strategy.kind, StrategyKind::Fresh);
    }

    #[test]
    fn override_wins_over_defaults() {
        let registry = registry();
        registry
            .register(
                "/posts/{slug}",
                &StrategyOverride::revalidate_after(Duration::from_secs(300)),
            )
            .expect("valid strategy");

        let strategy = registry.resolve("/posts/{slug}");
        assert_eq!(strategy.kind, StrategyKind::CacheWithRevalidation);
        assert_eq!(strategy.revalidate_after, Duration::from_secs(300));
    }

    #[test]
    fn unset_interval_inherits_default() {
        let registry = registry();
        registry
            .register("/news", &StrategyOverride::revalidate())
            .expect("valid strategy");
        assert_eq!(
            registry.resolve("/news").revalidate_after,
            Duration::from_secs(120)
        );
    }

    #[test]
    fn re_registering_replaces_prior_entry() {
        let registry = registry();
        registry
            .register("/about", &StrategyOverride::cache_once())
            .expect("valid strategy");
        registry
            .register("/about", &StrategyOverride::fresh())
            .expect("valid strategy");

        assert_eq!(registry.resolve("/about").kind, StrategyKind::Fresh);
        assert_eq!(registry.routes().len(), 1);
    }

    #[test]
    fn slot_names_keep_order_and_drop_duplicates() {
        let registry = registry();
        let strategy = registry
            .register(
                "/dashboard",
                &StrategyOverride::static_shell(["feed", "greeting", "feed"]),
            )
            .expect("valid strategy");
        assert_eq!(strategy.slot_names, vec!["feed", "greeting"]);
    }

    #[test]
    fn zero_revalidation_interval_is_rejected() {
        let registry = registry();
        let error = registry
            .register("/live", &StrategyOverride::revalidate_after(Duration::ZERO))
            .expect_err("zero interval must be rejected");
        assert!(matches!(error, EngineError::Configuration { .. }));
    }

    #[test]
    fn sub_second_revalidation_interval_is_rejected() {
        let registry = registry();
        let error = registry
            .register(
                "/live",
                &StrategyOverride::revalidate_after(Duration::from_millis(500)),
            )
            .expect_err("sub-second interval must be rejected");
        match error {
            EngineError::Configuration { key, reason } => {
                assert_eq!(key, "routes./live.revalidate_after");
                assert_eq!(reason, "must be at least one second");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(registry.routes().is_empty());

        let strategy = registry
            .register("/live", &StrategyOverride::revalidate_after(Duration::from_secs(1)))
            .expect("one second is the shortest interval");
        assert_eq!(strategy.revalidate_after, Duration::from_secs(1));
    }

    #[test]
    fn empty_slot_name_is_rejected() {
        let registry = registry();
        assert!(
            registry
                .register("/dashboard", &StrategyOverride::static_shell([" "]))
                .is_err()
        );
    }

    #[test]
    fn kind_parses_from_config_strings() {
        assert_eq!(
            "cache-with-revalidation".parse::<StrategyKind>(),
            Ok(StrategyKind::CacheWithRevalidation)
        );
        assert!("sometimes".parse::<StrategyKind>().is_err());
    }
}
