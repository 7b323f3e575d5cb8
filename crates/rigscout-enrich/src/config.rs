//! Configuration for the enrichment scheduler.

use std::time::Duration;

use serde::Deserialize;

use crate::credentials::StoredCredential;

/// Enrichment settings.
///
/// Loaded from the `[enrich]` section of `rigscout.toml` or
/// `RIGSCOUT__ENRICH__*` environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct EnrichConfig {
    /// Number of probe workers.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Capacity of the probe request queue; requests beyond it are dropped.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Minimum spacing between probes of one IP when the caller gives none.
    #[serde(default = "default_min_probe_interval")]
    pub min_probe_interval_secs: u64,

    /// Minimum spacing used when a scan hit requests enrichment.
    #[serde(default = "default_scan_probe_interval")]
    pub scan_probe_interval_secs: u64,

    /// How often the sweep looks for partially enriched devices.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Minimum spacing used by sweep re-enqueues.
    #[serde(default = "default_sweep_min_interval")]
    pub sweep_min_interval_secs: u64,

    /// How long a healthy `ok` status survives transient failures.
    #[serde(default = "default_anti_flap_grace")]
    pub anti_flap_grace_secs: u64,

    /// Append the built-in default credentials to every candidate list.
    #[serde(default)]
    pub try_default_creds: bool,

    /// Operator credentials, sealed.
    #[serde(default)]
    pub credentials: Vec<StoredCredential>,
}

impl EnrichConfig {
    pub fn min_probe_interval(&self) -> Duration {
        Duration::from_secs(self.min_probe_interval_secs)
    }

    pub fn scan_probe_interval(&self) -> Duration {
        Duration::from_secs(self.scan_probe_interval_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn sweep_min_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_min_interval_secs)
    }

    pub fn anti_flap_grace(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.anti_flap_grace_secs.min(i32::MAX as u64) as i64)
    }
}

fn default_workers() -> usize {
    48
}

fn default_queue_capacity() -> usize {
    8192
}

fn default_min_probe_interval() -> u64 {
    30
}

fn default_scan_probe_interval() -> u64 {
    15
}

fn default_sweep_interval() -> u64 {
    12
}

fn default_sweep_min_interval() -> u64 {
    60
}

fn default_anti_flap_grace() -> u64 {
    600
}

impl Default for EnrichConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            min_probe_interval_secs: default_min_probe_interval(),
            scan_probe_interval_secs: default_scan_probe_interval(),
            sweep_interval_secs: default_sweep_interval(),
            sweep_min_interval_secs: default_sweep_min_interval(),
            anti_flap_grace_secs: default_anti_flap_grace(),
            try_default_creds: false,
            credentials: Vec::new(),
        }
    }
}
