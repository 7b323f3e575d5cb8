//! Subnet rescan scheduling.
//!
//! Spawns one tokio task per configured subnet, each scanning at its own
//! interval. A semaphore limits how many scans run at once. Scan results
//! flow into the registry, and confirmed miners are queued for enrichment
//! and announced as fleet events.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::time::{interval, Duration};
use tokio_util::sync::CancellationToken;

use rigscout_core::events::{EventPayload, EventSink, FleetEvent};
use rigscout_core::ScanResult;
use rigscout_enrich::EnrichScheduler;
use rigscout_registry::DeviceRegistry;

use crate::config::{RigscoutConfig, SubnetSchedule};
use crate::error::{DiscoverError, Result};
use crate::resolver::AddressSpec;
use crate::scanner::{ScanObserver, ScanSummary, Scanner};

pub const SCAN_SOURCE: &str = "scanner.tcp";

/// Applies scan output to the registry and the enrichment queue.
pub struct ScanIngest {
    shard_id: String,
    spec: String,
    registry: Arc<DeviceRegistry>,
    enrich: Arc<EnrichScheduler>,
    sink: Arc<dyn EventSink>,
    last_percent: AtomicU64,
}

impl ScanIngest {
    pub fn new(
        shard_id: &str,
        spec: &str,
        registry: Arc<DeviceRegistry>,
        enrich: Arc<EnrichScheduler>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            shard_id: shard_id.to_string(),
            spec: spec.to_string(),
            registry,
            enrich,
            sink,
            last_percent: AtomicU64::new(0),
        }
    }
}

/// `done` as a whole percentage of `total`, clamped to 0..=100.
pub fn percent(done: u64, total: u64) -> u64 {
    if total == 0 {
        return 100;
    }
    (done.saturating_mul(100) / total).min(100)
}

impl ScanObserver for ScanIngest {
    fn on_progress(&self, done: u64, total: u64) {
        let pct = percent(done, total);
        if self.last_percent.swap(pct, Ordering::Relaxed) != pct {
            tracing::info!(spec = %self.spec, done, total, percent = pct, "Scan progress");
        }
    }

    fn on_result(&self, result: ScanResult) {
        let now = Utc::now();
        let ip = result.ip;
        self.registry.upsert_discovery(&self.shard_id, ip, "", now);
        self.registry.upsert_observed(&self.shard_id, ip, "", result.online, now);
        self.registry.update_enrichment(ip, |d| d.absorb_scan(&result));

        if !result.is_asic {
            return;
        }
        self.enrich
            .enqueue(ip, "scan", self.enrich.config().scan_probe_interval());

        let mut labels = BTreeMap::new();
        labels.insert("cidr".to_string(), self.spec.clone());
        if let Some(vendor) = result.vendor {
            labels.insert("vendor".to_string(), vendor.to_string());
        }
        self.sink.publish(FleetEvent::new(
            &self.shard_id,
            EventPayload::DeviceDiscovered {
                ip,
                mac: String::new(),
                source: SCAN_SOURCE.to_string(),
                labels,
            },
        ));

        let ports = result
            .open_ports
            .iter()
            .map(u16::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let mut facts = BTreeMap::new();
        facts.insert("open_ports".to_string(), ports);
        self.sink.publish(FleetEvent::new(
            &self.shard_id,
            EventPayload::NetworkObserved {
                ip,
                mac: String::new(),
                online: result.online,
                source: SCAN_SOURCE.to_string(),
                facts,
            },
        ));
    }
}

/// Manages periodic scans of the configured subnets.
pub struct ScanScheduler {
    config: RigscoutConfig,
    scanner: Scanner,
    registry: Arc<DeviceRegistry>,
    enrich: Arc<EnrichScheduler>,
    sink: Arc<dyn EventSink>,
    concurrency: Arc<Semaphore>,
}

impl ScanScheduler {
    pub fn new(
        config: RigscoutConfig,
        scanner: Scanner,
        registry: Arc<DeviceRegistry>,
        enrich: Arc<EnrichScheduler>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let concurrency = Arc::new(Semaphore::new(config.max_concurrent_scans.max(1)));
        Self {
            config,
            scanner,
            registry,
            enrich,
            sink,
            concurrency,
        }
    }

    /// Run one task per enabled subnet until `cancel` fires. With no valid
    /// enabled subnet it idles until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let mut handles = Vec::new();

        for subnet in &self.config.subnets {
            if !subnet.enabled {
                tracing::info!(subnet = %subnet.label(), "Subnet disabled, skipping");
                continue;
            }
            let spec = match AddressSpec::parse(&subnet.spec) {
                Ok(spec) => spec,
                Err(e) => {
                    tracing::error!(subnet = %subnet.label(), error = %e, "Invalid subnet, skipping");
                    continue;
                }
            };

            let ingest = Arc::new(ScanIngest::new(
                &self.config.shard_id,
                spec.as_str(),
                self.registry.clone(),
                self.enrich.clone(),
                self.sink.clone(),
            ));
            let scanner = self.scanner.clone();
            let subnet = subnet.clone();
            let semaphore = self.concurrency.clone();
            let cancel = cancel.clone();

            handles.push(tokio::spawn(async move {
                run_subnet_loop(scanner, subnet, spec, ingest, semaphore, cancel).await;
            }));
        }

        tracing::info!(subnet_count = handles.len(), "Scan scheduler started");

        if handles.is_empty() {
            tracing::warn!("No enabled subnets, scan scheduler idle until shutdown");
            cancel.cancelled().await;
            return Ok(());
        }

        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Subnet scan task panicked");
            }
        }

        Ok(())
    }
}

/// Per-subnet scan loop with configurable interval.
async fn run_subnet_loop(
    scanner: Scanner,
    subnet: SubnetSchedule,
    spec: AddressSpec,
    ingest: Arc<ScanIngest>,
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
) {
    let mut ticker = interval(Duration::from_secs(subnet.interval_secs.max(1)));

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        tracing::info!(subnet = %subnet.label(), "Scheduled scan triggered");

        let _permit = tokio::select! {
            _ = cancel.cancelled() => break,
            permit = semaphore.acquire() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        match run_single_scan(&scanner, &spec, ingest.clone(), &cancel).await {
            Ok(_) => {}
            Err(DiscoverError::Cancelled) => break,
            Err(e) => tracing::error!(subnet = %subnet.label(), error = %e, "Scheduled scan failed"),
        }
    }
}

/// Execute a single scan of `spec`, feeding `ingest`.
pub async fn run_single_scan(
    scanner: &Scanner,
    spec: &AddressSpec,
    ingest: Arc<ScanIngest>,
    cancel: &CancellationToken,
) -> Result<ScanSummary> {
    scanner.scan_spec(spec, cancel, ingest).await
}
