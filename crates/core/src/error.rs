//! Failure taxonomy shared by every pipeline stage.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RenderError {
    /// Missing or malformed client input.
    #[error("{0}")]
    Validation(String),
    #[error("unauthorized")]
    Unauthorized,
    /// Filesystem or process allocation failure.
    #[error("resource error: {0}")]
    Resource(String),
    #[error("page did not reach network quiescence within {}s", .0.as_secs())]
    RenderTimeout(Duration),
    /// The browser failed after it was launched (protocol error, crash).
    #[error("render error: {0}")]
    Render(String),
    #[error("encoding failed: {0}")]
    Encoding(String),
    #[error("render cancelled: server is shutting down")]
    Cancelled,
}

impl RenderError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn resource(message: impl Into<String>) -> Self {
        Self::Resource(message.into())
    }

    pub fn render(message: impl Into<String>) -> Self {
        Self::Render(message.into())
    }

    pub fn encoding(message: impl Into<String>) -> Self {
        Self::Encoding(message.into())
    }

    /// Stable machine-readable name, used in logs and error payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::Unauthorized => "auth_error",
            Self::Resource(_) => "resource_error",
            Self::RenderTimeout(_) => "render_timeout_error",
            Self::Render(_) => "render_error",
            Self::Encoding(_) => "encoding_error",
            Self::Cancelled => "cancelled",
        }
    }

    /// Client errors are rejected before any resource is allocated.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::Unauthorized)
    }
}
