//! Error types for the rigscout-discover crate.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DiscoverError {
    #[error("Invalid address specification: {0}")]
    InvalidSpecification(String),

    #[error("Scan cancelled")]
    Cancelled,

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Enrichment error: {0}")]
    Enrich(#[from] rigscout_enrich::EnrichError),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for DiscoverError {
    fn from(e: config::ConfigError) -> Self {
        Self::Config(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DiscoverError>;
