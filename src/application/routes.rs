//! Route listing for `rendercache routes`.

use std::fmt::Write as _;

use serde::Serialize;

use crate::cache::{RouteStrategy, StrategyKind, cache_control};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteSummary {
    pub route: String,
    pub strategy: StrategyKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revalidate_after_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub slots: Vec<String>,
    pub cache_control: String,
}

impl RouteSummary {
    pub fn new(route: String, strategy: &RouteStrategy) -> Self {
        let revalidate_after_seconds = (strategy.kind == StrategyKind::CacheWithRevalidation)
            .then(|| strategy.revalidate_after.as_secs());
        let ttl_seconds = match strategy.kind {
            StrategyKind::CacheOnce => strategy.ttl.map(|ttl| ttl.as_secs()),
            _ => None,
        };

        Self {
            route,
            strategy: strategy.kind,
            revalidate_after_seconds,
            ttl_seconds,
            slots: strategy.slot_names.clone(),
            cache_control: cache_control(strategy),
        }
    }

    fn detail(&self) -> String {
        match self.strategy {
            StrategyKind::Fresh => String::new(),
            StrategyKind::CacheOnce => self
                .ttl_seconds
                .map(|secs| format!("ttl {secs}s"))
                .unwrap_or_default(),
            StrategyKind::CacheWithRevalidation => format!(
                "revalidate after {}s",
                self.revalidate_after_seconds.unwrap_or_default()
            ),
            StrategyKind::StaticShell => format!("slots: {}", self.slots.join(", ")),
        }
    }
}

pub fn summarize(routes: Vec<(String, RouteStrategy)>) -> Vec<RouteSummary> {
    routes
        .into_iter()
        .map(|(route, strategy)| RouteSummary::new(route, &strategy))
        .collect()
}

/// Render summaries as an aligned plain-text table.
pub fn render_table(routes: &[RouteSummary]) -> String {
    let route_width = routes
        .iter()
        .map(|summary| summary.route.len())
        .chain(["ROUTE".len()])
        .max()
        .unwrap_or_default();
    let strategy_width = routes
        .iter()
        .map(|summary| summary.strategy.as_str().len())
        .chain(["STRATEGY".len()])
        .max()
        .unwrap_or_default();

    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<route_width$}  {:<strategy_width$}  DETAIL",
        "ROUTE", "STRATEGY"
    );
    for summary in routes {
        let line = format!(
            "{:<route_width$}  {:<strategy_width$}  {}",
            summary.route,
            summary.strategy.as_str(),
            summary.detail()
        );
        let _ = writeln!(out, "{}", line.trim_end());
    }
    out
}

pub fn render_json(routes: &[RouteSummary]) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(routes)
}
