//! Enrichment scheduling engine.
//!
//! Owns a bounded request queue, a per-IP backoff map and a fixed pool of
//! probe workers. Requests that arrive inside an IP's backoff window or while
//! the queue is full are dropped; the periodic sweep re-requests devices that
//! are still missing data.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::interval_at;
use tokio_util::sync::CancellationToken;

use rigscout_core::types::vendor_is_unset;
use rigscout_core::{AuthStatus, Device, Facts, FirmwareClass, ProbeResult, Scheme, Vendor};
use rigscout_registry::DeviceRegistry;

use crate::antminer::StockCgiProber;
use crate::config::EnrichConfig;
use crate::credentials::{CredentialBuilder, CredentialVault};
use crate::error::{EndpointError, EnrichError, Result};
use crate::http::ProbeCtx;
use crate::select::VendorProber;
use crate::vnish::SpaApiProber;
use crate::whatsminer::WhatsminerProber;

/// Budget of an operator-triggered probe.
pub const PROBE_NOW_TIMEOUT: Duration = Duration::from_secs(5);

pub const ERR_NO_DATA: &str = "ok but no parsable data";
pub const ERR_OFFLINE: &str = "offline";
pub const ERR_UNSUPPORTED: &str = "unsupported vendor";
pub const ERR_NOT_FOUND: &str = "not found";

/// The vendor probers the scheduler dispatches to.
#[derive(Clone)]
pub struct Probers {
    pub stock: Arc<dyn VendorProber>,
    pub whatsminer: Arc<dyn VendorProber>,
    pub spa: Arc<dyn VendorProber>,
}

impl Probers {
    /// The real HTTP probers.
    pub fn http() -> Result<Self> {
        Ok(Self {
            stock: Arc::new(StockCgiProber::new()?),
            whatsminer: Arc::new(WhatsminerProber::new()?),
            spa: Arc::new(SpaApiProber::new()),
        })
    }
}

#[derive(Debug)]
struct ProbeRequest {
    ip: Ipv4Addr,
    reason: &'static str,
}

/// Result of one dispatched probe, ready to be folded into a device.
#[derive(Debug, Clone, Default)]
pub struct ProbeOutcome {
    pub result: ProbeResult,
    pub facts: Facts,
    /// Vendor implied by the prober that answered.
    pub vendor: Option<Vendor>,
}

impl ProbeOutcome {
    fn failed(error: &str) -> Self {
        Self {
            result: ProbeResult::failed(error),
            ..Default::default()
        }
    }
}

/// Schedules and runs authenticated enrichment probes.
pub struct EnrichScheduler {
    registry: Arc<DeviceRegistry>,
    config: EnrichConfig,
    creds: CredentialBuilder,
    probers: Probers,
    tx: mpsc::Sender<ProbeRequest>,
    rx: Mutex<Option<mpsc::Receiver<ProbeRequest>>>,
    next_allowed: Mutex<HashMap<Ipv4Addr, Instant>>,
}

impl EnrichScheduler {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        config: EnrichConfig,
        vault: Arc<dyn CredentialVault>,
        probers: Probers,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let creds = CredentialBuilder::new(config.credentials.clone(), vault, config.try_default_creds);
        Self {
            registry,
            config,
            creds,
            probers,
            tx,
            rx: Mutex::new(Some(rx)),
            next_allowed: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &EnrichConfig {
        &self.config
    }

    /// Request a probe of `ip`. Zero `min_interval` means the configured
    /// default. Returns whether the request was queued.
    pub fn enqueue(&self, ip: Ipv4Addr, reason: &'static str, min_interval: Duration) -> bool {
        let min_interval = if min_interval.is_zero() {
            self.config.min_probe_interval()
        } else {
            min_interval
        };
        let now = Instant::now();
        {
            let mut next = self.next_allowed.lock().unwrap_or_else(PoisonError::into_inner);
            if next.get(&ip).is_some_and(|t| now < *t) {
                tracing::trace!(ip = %ip, reason, "Probe request inside backoff window");
                return false;
            }
            next.insert(ip, now + min_interval);
        }

        match self.tx.try_send(ProbeRequest { ip, reason }) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::debug!(ip = %ip, reason, "Probe queue full, dropping request");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Re-request online devices that are still missing key fields.
    /// Returns the number of requests queued.
    pub fn sweep(&self) -> usize {
        let interval = self.config.sweep_min_interval();
        self.registry
            .list()
            .iter()
            .filter(|d| needs_enrichment(d))
            .filter(|d| self.enqueue(d.ip, "sweep", interval))
            .count()
    }

    /// Run the workers and the sweep until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let rx = self
            .rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(EnrichError::AlreadyRunning)?;
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let mut handles = Vec::with_capacity(self.config.workers + 1);
        for worker in 0..self.config.workers.max(1) {
            let sched = self.clone();
            let rx = rx.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                sched.worker_loop(worker, rx, cancel).await;
            }));
        }

        let sched = self.clone();
        let sweep_cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            sched.sweep_loop(sweep_cancel).await;
        }));

        tracing::info!(
            workers = self.config.workers,
            queue_capacity = self.config.queue_capacity,
            "Enrichment scheduler started"
        );

        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Enrichment task panicked");
            }
        }

        tracing::info!("Enrichment scheduler stopped");
        Ok(())
    }

    async fn worker_loop(
        &self,
        worker: usize,
        rx: Arc<tokio::sync::Mutex<mpsc::Receiver<ProbeRequest>>>,
        cancel: CancellationToken,
    ) {
        loop {
            let req = {
                let mut rx = rx.lock().await;
                tokio::select! {
                    _ = cancel.cancelled() => None,
                    req = rx.recv() => req,
                }
            };
            let Some(req) = req else {
                return;
            };

            let budget = adaptive_timeout(self.registry.get(req.ip).as_ref());
            let ctx = ProbeCtx::new(budget, cancel.child_token());
            let res = self.run_probe(&ctx, req.ip).await;
            tracing::debug!(
                worker,
                ip = %req.ip,
                reason = req.reason,
                ok = res.ok,
                cred = %res.used_cred,
                error = %res.error,
                "Enrichment probe finished"
            );
        }
    }

    async fn sweep_loop(&self, cancel: CancellationToken) {
        let period = self.config.sweep_interval();
        let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    let queued = self.sweep();
                    if queued > 0 {
                        tracing::debug!(queued, "Sweep re-queued partially enriched devices");
                    }
                }
            }
        }
    }

    /// Probe `ip` right away, bypassing the queue and backoff.
    pub async fn probe_now(&self, ip: Ipv4Addr) -> Result<ProbeResult> {
        if self.registry.get(ip).is_none() {
            return Err(EnrichError::NotFound(ip));
        }
        let ctx = ProbeCtx::new(PROBE_NOW_TIMEOUT, CancellationToken::new());
        Ok(self.run_probe(&ctx, ip).await)
    }

    /// One enrichment: dispatch to the matching prober and fold the outcome
    /// into the registry.
    pub async fn run_probe(&self, ctx: &ProbeCtx, ip: Ipv4Addr) -> ProbeResult {
        let Some(device) = self.registry.get(ip) else {
            return ProbeResult::failed(ERR_NOT_FOUND);
        };
        if !device.online {
            self.record_failure(ip, ERR_OFFLINE);
            return ProbeResult::failed(ERR_OFFLINE);
        }

        self.registry.update_enrichment(ip, |d| {
            if d.auth_status != AuthStatus::Ok {
                d.auth_status = AuthStatus::Trying;
                d.auth_error.clear();
                d.auth_updated_at = Some(Utc::now());
            }
        });

        let Some(outcome) = self.dispatch(ctx, &device).await else {
            self.record_failure(ip, ERR_UNSUPPORTED);
            return ProbeResult::failed(ERR_UNSUPPORTED);
        };

        let grace = self.config.anti_flap_grace();
        self.registry
            .update_enrichment(ip, |d| apply_outcome(d, &outcome, Utc::now(), grace));
        outcome.result
    }

    /// `None` when no prober handles the device's vendor.
    async fn dispatch(&self, ctx: &ProbeCtx, device: &Device) -> Option<ProbeOutcome> {
        let host = device.ip.to_string();
        let creds = self.creds.build(device.vendor, &device.firmware);

        if device.vendor == Some(Vendor::Whatsminer) {
            let p = &self.probers.whatsminer;
            let result = p.probe(ctx, &host, &creds, &[Scheme::Http]).await;
            return Some(outcome(p.as_ref(), result, Vendor::Whatsminer));
        }
        if !(vendor_is_unset(device.vendor) || device.vendor == Some(Vendor::Antminer)) {
            return None;
        }

        let schemes = schemes_for(device);
        if device.firmware_class() == FirmwareClass::Spa {
            let p = &self.probers.spa;
            let result = p.probe(ctx, &host, &creds, &schemes).await;
            return Some(outcome(p.as_ref(), result, Vendor::Antminer));
        }

        let stock = &self.probers.stock;
        let result = stock.probe(ctx, &host, &creds, &schemes).await;
        if result.ok || result.error != EndpointError::Html.to_string() {
            return Some(outcome(stock.as_ref(), result, Vendor::Antminer));
        }

        // The CGI paths served an app shell: try the SPA backend.
        tracing::debug!(ip = %device.ip, "Stock CGI returned HTML, trying SPA API");
        let spa = &self.probers.spa;
        let spa_result = spa.probe(ctx, &host, &creds, &schemes).await;
        if spa_result.ok {
            return Some(outcome(spa.as_ref(), spa_result, Vendor::Antminer));
        }
        let mut result = result;
        if result.firmware_hint.is_empty() {
            result.firmware_hint = spa_result.firmware_hint;
        }
        Some(outcome(stock.as_ref(), result, Vendor::Antminer))
    }

    fn record_failure(&self, ip: Ipv4Addr, error: &str) {
        self.registry.update_enrichment(ip, |d| {
            d.auth_status = AuthStatus::Fail;
            d.auth_error = error.to_string();
            d.auth_updated_at = Some(Utc::now());
        });
    }
}

fn outcome(prober: &dyn VendorProber, result: ProbeResult, vendor: Vendor) -> ProbeOutcome {
    let facts = if result.ok {
        prober.extract(&result)
    } else {
        Facts::default()
    };
    ProbeOutcome {
        result,
        facts,
        vendor: Some(vendor),
    }
}

/// http always; https only when 443 was seen open.
pub fn schemes_for(device: &Device) -> Vec<Scheme> {
    let mut schemes = vec![Scheme::Http];
    if device.has_port(443) {
        schemes.push(Scheme::Https);
    }
    schemes
}

/// Probe budget for a device, based on how its last probe went.
pub fn adaptive_timeout(device: Option<&Device>) -> Duration {
    let Some(d) = device else {
        return Duration::from_secs(6);
    };
    let err = d.auth_error.to_ascii_lowercase();
    if err.contains("deadline exceeded") || err.contains("timeout") {
        return Duration::from_secs(9);
    }
    if d.firmware_class() == FirmwareClass::Spa {
        return Duration::from_secs(8);
    }
    if d.auth_status == AuthStatus::Ok {
        return Duration::from_secs(4);
    }
    Duration::from_secs(6)
}

/// Online stock-family devices still missing MAC, worker, firmware or fans.
pub fn needs_enrichment(d: &Device) -> bool {
    if !d.online {
        return false;
    }
    if !(vendor_is_unset(d.vendor) || d.vendor == Some(Vendor::Antminer)) {
        return false;
    }
    d.mac.is_empty()
        || d.telemetry.worker.is_empty()
        || d.firmware.is_empty()
        || d.telemetry.fans_rpm.is_empty()
}

/// Fold a probe outcome into a device record.
///
/// A failure does not downgrade an `ok` status younger than `grace`; only
/// the error text changes.
pub fn apply_outcome(
    d: &mut Device,
    outcome: &ProbeOutcome,
    now: DateTime<Utc>,
    grace: chrono::Duration,
) {
    let res = &outcome.result;
    if d.firmware.is_empty() && !res.firmware_hint.is_empty() {
        d.firmware = res.firmware_hint.clone();
    }

    if res.ok && outcome.facts.is_empty() {
        d.auth_status = AuthStatus::Fail;
        d.auth_updated_at = Some(now);
        d.auth_cred_name = res.used_cred.clone();
        d.auth_error = ERR_NO_DATA.to_string();
        return;
    }

    if res.ok {
        d.auth_status = AuthStatus::Ok;
        d.auth_updated_at = Some(now);
        d.auth_cred_name = res.used_cred.clone();
        d.auth_error.clear();
        d.absorb_facts(&outcome.facts, outcome.vendor);
        return;
    }

    let recently_ok = d.auth_status == AuthStatus::Ok
        && d.auth_updated_at.is_some_and(|t| now - t < grace);
    if recently_ok {
        d.auth_error = res.error.clone();
        return;
    }
    d.auth_status = AuthStatus::Fail;
    d.auth_updated_at = Some(now);
    d.auth_cred_name = res.used_cred.clone();
    d.auth_error = res.error.clone();
}
