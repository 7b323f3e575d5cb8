//! Configuration for the rigscout scanner and daemon.

use std::time::Duration;

use serde::Deserialize;

use rigscout_enrich::EnrichConfig;

use crate::error::Result;

/// Top-level configuration.
///
/// Loaded from `rigscout.toml` or `RIGSCOUT__*` environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct RigscoutConfig {
    /// Identifier of this scanner instance, stamped on registry rows and events.
    #[serde(default = "default_shard_id")]
    pub shard_id: String,

    /// Maximum number of subnet scans running at once.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_scans: usize,

    #[serde(default)]
    pub scan: ScanConfig,

    #[serde(default)]
    pub enrich: EnrichConfig,

    /// Per-subnet scheduling configuration.
    #[serde(default)]
    pub subnets: Vec<SubnetSchedule>,
}

/// Settings of a single scan pass.
#[derive(Debug, Clone, Deserialize)]
pub struct ScanConfig {
    /// Addresses probed in parallel.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(default = "default_dial_timeout")]
    pub dial_timeout_ms: u64,

    #[serde(default = "default_http_timeout")]
    pub http_timeout_ms: u64,

    /// Ports dialled on every address, in order.
    #[serde(default = "default_ports")]
    pub ports: Vec<u16>,

    /// Try the built-in default credentials during the scan itself.
    #[serde(default)]
    pub try_default_creds: bool,
}

impl ScanConfig {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }
}

/// A scan target with its schedule.
#[derive(Debug, Clone, Deserialize)]
pub struct SubnetSchedule {
    /// Address specification, e.g. `10.10.0.0/16` or `10.10.1.10-10.10.1.200`.
    pub spec: String,

    /// Human-readable name for this subnet.
    pub name: Option<String>,

    /// Scan interval in seconds.
    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    /// Whether this subnet is enabled for scanning.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl SubnetSchedule {
    /// Name for logs: the configured name, else the spec.
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.spec)
    }
}

fn default_shard_id() -> String {
    "scanner".to_string()
}

fn default_max_concurrent() -> usize {
    2
}

fn default_concurrency() -> usize {
    256
}

fn default_dial_timeout() -> u64 {
    600
}

fn default_http_timeout() -> u64 {
    1000
}

fn default_ports() -> Vec<u16> {
    vec![80, 443, 4028, 22]
}

fn default_interval() -> u64 {
    3600
}

fn default_true() -> bool {
    true
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            dial_timeout_ms: default_dial_timeout(),
            http_timeout_ms: default_http_timeout(),
            ports: default_ports(),
            try_default_creds: false,
        }
    }
}

impl Default for RigscoutConfig {
    fn default() -> Self {
        Self {
            shard_id: default_shard_id(),
            max_concurrent_scans: default_max_concurrent(),
            scan: ScanConfig::default(),
            enrich: EnrichConfig::default(),
            subnets: Vec::new(),
        }
    }
}

/// Load `<prefix>.toml` (optional) overlaid with `RIGSCOUT__*` variables.
pub fn load_config(file_prefix: &str) -> Result<RigscoutConfig> {
    let cfg = config::Config::builder()
        .add_source(config::File::with_name(file_prefix).required(false))
        .add_source(
            config::Environment::with_prefix("RIGSCOUT")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    match cfg.try_deserialize::<RigscoutConfig>() {
        Ok(c) => Ok(c),
        Err(e) => {
            tracing::warn!(error = %e, "Invalid configuration, using defaults");
            Ok(RigscoutConfig::default())
        }
    }
}
