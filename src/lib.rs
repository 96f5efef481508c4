//! Per-route render strategies for server-rendered pages.
//!
//! The [`cache`] module holds the engine; [`infra::http`] exposes it over
//! axum and [`application::site`] registers a small demonstration site.

pub mod application;
pub mod cache;
pub mod config;
pub mod infra;
