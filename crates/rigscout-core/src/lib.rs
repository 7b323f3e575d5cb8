//! rigscout-core: Shared types, model normalization and events for rigscout.
//!
//! This crate provides the foundational types used across all rigscout crates:
//! - Device, scan and probe records
//! - Vendor/firmware classification and the monotonic merge rules
//! - Model-name normalization
//! - Fleet events and the sink trait they are published through

pub mod error;
pub mod events;
pub mod modelnorm;
pub mod types;

pub use error::CoreError;
pub use types::{
    AuthStatus, CredentialCandidate, Device, Facts, FirmwareClass, ProbeResult, ScanResult,
    Scheme, Telemetry, Vendor,
};
