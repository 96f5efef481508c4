//! Render Invoker and slot renderer contracts.
//!
//! The markup engine lives outside this crate; routes hand the engine an
//! implementation of [`PageRenderer`] and, for static shells, one
//! [`SlotRenderer`] per slot.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use super::error::RenderError;

/// Whether slot regions are rendered or replaced by placeholder markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderMode {
    Normal,
    /// Emit [`slot_marker`](super::shell::slot_marker) for every declared slot.
    ShellBuild,
}

/// Request-scoped inputs handed to renderers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderProps {
    /// Resolved request path, e.g. `/posts/hello`.
    pub path: String,
    pub params: BTreeMap<String, String>,
    pub query: BTreeMap<String, String>,
}

impl RenderProps {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(name.into(), value.into());
        self
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    pub fn query(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }
}

#[async_trait]
pub trait PageRenderer: Send + Sync {
    async fn render(&self, props: &RenderProps, mode: RenderMode) -> Result<Bytes, RenderError>;
}

#[async_trait]
pub trait SlotRenderer: Send + Sync {
    async fn render(&self, props: &RenderProps) -> Result<Bytes, RenderError>;
}

struct FnPageRenderer<F>(F);

#[async_trait]
impl<F, Fut> PageRenderer for FnPageRenderer<F>
where
    F: Fn(RenderProps, RenderMode) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Bytes, RenderError>> + Send + 'static,
{
    async fn render(&self, props: &RenderProps, mode: RenderMode) -> Result<Bytes, RenderError> {
        (self.0)(props.clone(), mode).await
    }
}

struct FnSlotRenderer<F>(F);

#[async_trait]
impl<F, Fut> SlotRenderer for FnSlotRenderer<F>
where
    F: Fn(RenderProps) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Bytes, RenderError>> + Send + 'static,
{
    async fn render(&self, props: &RenderProps) -> Result<Bytes, RenderError> {
        (self.0)(props.clone()).await
    }
}

/// Wrap an async closure as a [`PageRenderer`].
pub fn page_fn<F, Fut>(render: F) -> Arc<dyn PageRenderer>
where
    F: Fn(RenderProps, RenderMode) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Bytes, RenderError>> + Send + 'static,
{
    Arc::new(FnPageRenderer(render))
}

/// Wrap an async closure as a [`SlotRenderer`].
pub fn slot_fn<F, Fut>(render: F) -> Arc<dyn SlotRenderer>
where
    F: Fn(RenderProps) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Bytes, RenderError>> + Send + 'static,
{
    Arc::new(FnSlotRenderer(render))
}
