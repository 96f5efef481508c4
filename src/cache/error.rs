use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::application::error::ErrorReport;

/// Failure reported by a page or slot renderer.
///
/// Cloneable so one failed render can be handed to every coalesced waiter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RenderError {
    #[error("render failed: {message}")]
    Failed { message: String },
}

impl RenderError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to render `{path}`")]
    Render {
        path: String,
        #[source]
        source: RenderError,
    },
    #[error("no route registered for `{route}`")]
    UnknownRoute { route: String },
    #[error("invalid configuration for `{key}`: {reason}")]
    Configuration { key: String, reason: String },
}

impl EngineError {
    pub fn render(path: impl Into<String>, source: RenderError) -> Self {
        Self::Render {
            path: path.into(),
            source,
        }
    }

    pub fn configuration(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Configuration {
            key: key.into(),
            reason: reason.into(),
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            EngineError::UnknownRoute { .. } => StatusCode::NOT_FOUND,
            EngineError::Render { .. } | EngineError::Configuration { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn presentation_message(&self) -> &'static str {
        match self {
            EngineError::UnknownRoute { .. } => "Page not found",
            EngineError::Render { .. } => "Page could not be rendered",
            EngineError::Configuration { .. } => "Service misconfigured",
        }
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let report = ErrorReport::from_error("cache::error::EngineError", status, &self);
        let mut response = (status, self.presentation_message()).into_response();
        report.attach(&mut response);
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_route_maps_to_not_found() {
        let response = EngineError::UnknownRoute {
            route: "/missing".to_string(),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn render_failure_report_keeps_source_chain() {
        let error = EngineError::render("/posts/a", RenderError::failed("template exploded"));
        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let report = response
            .extensions()
            .get::<ErrorReport>()
            .expect("error report attached");
        assert_eq!(report.messages.len(), 2);
        assert!(report.messages[1].contains("template exploded"));
    }
}
