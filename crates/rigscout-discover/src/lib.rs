//! rigscout-discover: fleet scanner for rigscout.
//!
//! Resolves address specs, probes TCP ports, fingerprints mining hardware
//! without credentials and schedules periodic rescans whose results feed the
//! device registry and the enrichment queue.

pub mod config;
pub mod error;
pub mod fingerprint;
pub mod prober;
pub mod resolver;
pub mod scanner;
pub mod scheduler;

pub use error::{DiscoverError, Result};
pub use resolver::{preview, AddressPreview, AddressSpec};
pub use scanner::{ScanObserver, ScanSummary, Scanner};
