//! Address-space scanner.
//!
//! Feeds every address of a spec through a bounded queue to a fixed pool of
//! probe workers. Each online host is fingerprinted and handed to a
//! [`ScanObserver`]; progress is sampled on its own ticker so slow hosts do
//! not stall reporting.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::Client;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use rigscout_core::types::vendor_is_unset;
use rigscout_core::{modelnorm, ScanResult};
use rigscout_enrich::http::client_builder;

use crate::config::ScanConfig;
use crate::error::{DiscoverError, Result};
use crate::fingerprint::{self, MINER_API_PORT};
use crate::prober;
use crate::resolver::AddressSpec;

const PROGRESS_EVERY: Duration = Duration::from_millis(250);

/// Receives scan output. Called from worker tasks, so implementations must
/// be cheap and non-blocking.
pub trait ScanObserver: Send + Sync {
    /// `done` of `total` addresses processed so far.
    fn on_progress(&self, _done: u64, _total: u64) {}

    /// An online host was fingerprinted.
    fn on_result(&self, result: ScanResult);
}

/// Totals of one `scan_spec` run.
#[derive(Debug, Clone)]
pub struct ScanSummary {
    pub scan_id: Uuid,
    pub total: u64,
    pub online: u64,
    pub asic: u64,
    pub duration: Duration,
}

#[derive(Default)]
struct Counters {
    done: AtomicU64,
    online: AtomicU64,
    asic: AtomicU64,
}

/// Probes and fingerprints addresses.
#[derive(Clone)]
pub struct Scanner {
    config: ScanConfig,
    http: Client,
}

impl Scanner {
    pub fn new(config: ScanConfig) -> Result<Self> {
        let http = client_builder(config.dial_timeout(), config.http_timeout()).build()?;
        Ok(Self { config, http })
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    /// Probe one address: open ports, banner, miner API, optional default
    /// credentials, then model normalization and confidence.
    pub async fn probe_ip(&self, ip: Ipv4Addr) -> ScanResult {
        let mut r = ScanResult::new(ip);
        r.open_ports = prober::open_ports(ip, &self.config.ports, self.config.dial_timeout()).await;
        r.online = !r.open_ports.is_empty();
        if !r.online {
            return r;
        }

        if r.has_port(80) {
            fingerprint::sniff_http(&self.http, &format!("http://{ip}/"), &mut r).await;
        }
        if r.vendor.is_none() && r.has_port(443) {
            fingerprint::sniff_http(&self.http, &format!("https://{ip}/"), &mut r).await;
        }
        if r.has_port(MINER_API_PORT) {
            fingerprint::sniff_miner_api(ip, MINER_API_PORT, &mut r).await;
        }
        if self.config.try_default_creds && r.open_ports.iter().copied().any(fingerprint::is_web_port) {
            fingerprint::sniff_with_defaults(&self.http, &mut r).await;
        }

        let norm = modelnorm::normalize(&r.model);
        if !norm.model.is_empty() {
            r.model = norm.model;
            if vendor_is_unset(r.vendor) && norm.vendor.is_some() {
                r.vendor = norm.vendor;
            }
        }

        r.confidence = fingerprint::score(&r);
        r.is_asic = r.confidence >= fingerprint::ASIC_THRESHOLD;
        tracing::debug!(
            ip = %ip,
            ports = ?r.open_ports,
            vendor = ?r.vendor,
            model = %r.model,
            confidence = r.confidence,
            "Host fingerprinted"
        );
        r
    }

    /// Scan every address of `spec`.
    ///
    /// Only online hosts reach `observer.on_result`. On cancellation the
    /// producer stops, queued addresses are drained without probing and
    /// `DiscoverError::Cancelled` is returned.
    pub async fn scan_spec(
        &self,
        spec: &AddressSpec,
        cancel: &CancellationToken,
        observer: Arc<dyn ScanObserver>,
    ) -> Result<ScanSummary> {
        let scan_id = Uuid::new_v4();
        let start = Instant::now();
        let total = spec.total_hosts();
        let concurrency = self.config.concurrency.max(1);

        tracing::info!(
            scan_id = %scan_id,
            spec = %spec,
            total,
            concurrency,
            "Starting scan"
        );

        let (tx, rx) = mpsc::channel::<Ipv4Addr>(concurrency * 2);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let counters = Arc::new(Counters::default());

        let mut workers = Vec::with_capacity(concurrency);
        for _ in 0..concurrency {
            let scanner = self.clone();
            let rx = rx.clone();
            let counters = counters.clone();
            let observer = observer.clone();
            let cancel = cancel.clone();
            workers.push(tokio::spawn(async move {
                scanner.worker_loop(rx, counters, observer, cancel).await;
            }));
        }

        let ticker_stop = CancellationToken::new();
        let ticker = {
            let counters = counters.clone();
            let observer = observer.clone();
            let stop = ticker_stop.clone();
            tokio::spawn(async move {
                let mut tick = interval(PROGRESS_EVERY);
                tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = tick.tick() => {
                            observer.on_progress(counters.done.load(Ordering::Relaxed), total);
                        }
                    }
                }
            })
        };

        for ip in spec.iter() {
            tokio::select! {
                _ = cancel.cancelled() => break,
                sent = tx.send(ip) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }
        }
        drop(tx);

        for handle in workers {
            if let Err(e) = handle.await {
                tracing::error!(scan_id = %scan_id, error = %e, "Scan worker panicked");
            }
        }
        ticker_stop.cancel();
        if let Err(e) = ticker.await {
            tracing::error!(scan_id = %scan_id, error = %e, "Progress ticker panicked");
        }

        if cancel.is_cancelled() {
            tracing::info!(scan_id = %scan_id, spec = %spec, "Scan cancelled");
            return Err(DiscoverError::Cancelled);
        }

        let done = counters.done.load(Ordering::Relaxed);
        observer.on_progress(done, total);

        let summary = ScanSummary {
            scan_id,
            total,
            online: counters.online.load(Ordering::Relaxed),
            asic: counters.asic.load(Ordering::Relaxed),
            duration: start.elapsed(),
        };
        tracing::info!(
            scan_id = %scan_id,
            spec = %spec,
            total,
            online = summary.online,
            asic = summary.asic,
            duration_ms = summary.duration.as_millis(),
            "Scan complete"
        );
        Ok(summary)
    }

    async fn worker_loop(
        &self,
        rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Ipv4Addr>>>,
        counters: Arc<Counters>,
        observer: Arc<dyn ScanObserver>,
        cancel: CancellationToken,
    ) {
        loop {
            let next = rx.lock().await.recv().await;
            let Some(ip) = next else {
                break;
            };
            let result = if cancel.is_cancelled() {
                None
            } else {
                tokio::select! {
                    _ = cancel.cancelled() => None,
                    r = self.probe_ip(ip) => Some(r),
                }
            };
            counters.done.fetch_add(1, Ordering::Relaxed);

            let Some(result) = result else {
                continue;
            };
            if !result.online {
                continue;
            }
            counters.online.fetch_add(1, Ordering::Relaxed);
            if result.is_asic {
                counters.asic.fetch_add(1, Ordering::Relaxed);
            }
            observer.on_result(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::net::TcpListener;

    #[derive(Default)]
    struct Collect {
        results: Mutex<Vec<ScanResult>>,
        progress: Mutex<Vec<(u64, u64)>>,
    }

    impl ScanObserver for Collect {
        fn on_progress(&self, done: u64, total: u64) {
            self.progress.lock().unwrap().push((done, total));
        }

        fn on_result(&self, result: ScanResult) {
            self.results.lock().unwrap().push(result);
        }
    }

    fn scanner(ports: Vec<u16>) -> Scanner {
        Scanner::new(ScanConfig {
            concurrency: 4,
            dial_timeout_ms: 300,
            ports,
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_scan_reports_online_hosts_only() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                if listener.accept().await.is_err() {
                    break;
                }
            }
        });

        let spec = AddressSpec::parse("127.0.0.1-127.0.0.3").unwrap();
        let collect = Arc::new(Collect::default());
        let summary = scanner(vec![port])
            .scan_spec(&spec, &CancellationToken::new(), collect.clone())
            .await
            .unwrap();

        assert_eq!(summary.total, 3);
        assert_eq!(summary.online, 1);
        assert_eq!(summary.asic, 0);

        let results = collect.results.lock().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].ip, Ipv4Addr::LOCALHOST);
        assert_eq!(results[0].open_ports, vec![port]);
        assert!(!results[0].is_asic);

        let progress = collect.progress.lock().unwrap();
        assert_eq!(progress.last(), Some(&(3, 3)));
    }

    #[tokio::test]
    async fn test_cancelled_scan_returns_error() {
        let spec = AddressSpec::parse("127.0.0.0/24").unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let collect = Arc::new(Collect::default());
        let res = scanner(vec![9]).scan_spec(&spec, &cancel, collect.clone()).await;
        assert!(matches!(res, Err(DiscoverError::Cancelled)));
        assert!(collect.results.lock().unwrap().is_empty());
    }

    /// Cancels the scan as soon as the first host is reported.
    struct CancelOnFirst {
        cancel: CancellationToken,
        results: Mutex<Vec<ScanResult>>,
    }

    impl ScanObserver for CancelOnFirst {
        fn on_result(&self, result: ScanResult) {
            self.results.lock().unwrap().push(result);
            self.cancel.cancel();
        }
    }

    #[tokio::test]
    async fn test_cancel_during_scan_drains_queue() {
        // Every 127/8 address reaches a wildcard listener.
        let listener = TcpListener::bind("0.0.0.0:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                if listener.accept().await.is_err() {
                    break;
                }
            }
        });

        let spec = AddressSpec::parse("127.0.0.0/22").unwrap();
        let cancel = CancellationToken::new();
        let observer = Arc::new(CancelOnFirst {
            cancel: cancel.clone(),
            results: Mutex::new(Vec::new()),
        });

        let res = tokio::time::timeout(
            Duration::from_secs(10),
            scanner(vec![port]).scan_spec(&spec, &cancel, observer.clone()),
        )
        .await
        .unwrap();

        assert!(matches!(res, Err(DiscoverError::Cancelled)));
        let reported = observer.results.lock().unwrap().len() as u64;
        assert!(reported >= 1);
        assert!(reported < spec.total_hosts());
    }

    #[tokio::test]
    async fn test_offline_host() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let r = scanner(vec![port]).probe_ip(Ipv4Addr::LOCALHOST).await;
        assert!(!r.online);
        assert_eq!(r.confidence, 0);
    }
}
