//! Error types for the rigscout-enrich crate.

use std::net::Ipv4Addr;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnrichError {
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Credential error: {0}")]
    Credential(#[from] rigscout_core::CoreError),

    #[error("Device not found: {0}")]
    NotFound(Ipv4Addr),

    #[error("Scheduler is already running")]
    AlreadyRunning,
}

pub type Result<T> = std::result::Result<T, EnrichError>;

/// Why one endpoint request did not produce usable JSON.
///
/// The `Display` text is what operators see in `Device::auth_error`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EndpointError {
    #[error("{0}")]
    Transport(String),

    #[error("request timeout")]
    Timeout,

    #[error("context canceled")]
    Cancelled,

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden")]
    Forbidden,

    #[error("http {0}")]
    Status(String),

    #[error("empty body")]
    EmptyBody,

    #[error("html response (no json api)")]
    Html,

    #[error("non-json response")]
    NonJson,
}

impl From<reqwest::Error> for EndpointError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else {
            Self::Transport(e.to_string())
        }
    }
}
