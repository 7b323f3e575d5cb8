//! rigscout-enrich: authenticated vendor enrichment.
//!
//! Vendor probers log into a device's web interface, pull whatever JSON it
//! exposes and reduce it to [`Facts`](rigscout_core::Facts). The
//! [`EnrichScheduler`](scheduler::EnrichScheduler) decides when each device is
//! probed and folds the outcome into the registry.

pub mod antminer;
pub mod config;
pub mod credentials;
pub mod digest;
pub mod error;
pub mod extract;
pub mod http;
pub mod scheduler;
pub mod select;
pub mod vnish;
pub mod whatsminer;

pub use config::EnrichConfig;
pub use credentials::{CredentialBuilder, CredentialVault, PlaintextVault, StoredCredential};
pub use error::{EndpointError, EnrichError};
pub use scheduler::{EnrichScheduler, Probers};
pub use select::VendorProber;
