//! CLI entry point for the rigscout fleet scanner.

use std::sync::Arc;

use clap::Parser;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use rigscout_core::events::{EventSink, TracingSink};
use rigscout_core::AuthStatus;
use rigscout_enrich::{EnrichScheduler, PlaintextVault, Probers};
use rigscout_registry::DeviceRegistry;

use rigscout_discover::config::{load_config, RigscoutConfig};
use rigscout_discover::fingerprint::ASIC_THRESHOLD;
use rigscout_discover::scheduler::{run_single_scan, ScanIngest, ScanScheduler};
use rigscout_discover::{preview, AddressSpec, Scanner};

#[derive(Parser)]
#[command(name = "rigscout")]
#[command(about = "Discovery and enrichment of ASIC mining fleets")]
struct Cli {
    /// Print the JSON preview of an address spec and exit.
    #[arg(long, value_name = "SPEC")]
    preview: Option<String>,

    /// Target to scan (CIDR or A-B range, comma separated).
    #[arg(short, long)]
    target: Option<String>,

    /// Run a single one-shot scan, enrich what it finds and print the fleet.
    #[arg(long)]
    once: bool,

    /// Run as daemon with scheduled scans and enrichment.
    #[arg(long)]
    daemon: bool,

    /// Config file prefix (default: rigscout).
    #[arg(short, long, default_value = "rigscout")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).json().init();

    let cli = Cli::parse();

    if let Some(spec) = cli.preview.as_deref() {
        println!("{}", serde_json::to_string_pretty(&preview(spec))?);
        return Ok(());
    }

    let config = load_config(&cli.config)?;
    let registry = Arc::new(DeviceRegistry::new());
    let enrich = Arc::new(EnrichScheduler::new(
        registry.clone(),
        config.enrich.clone(),
        Arc::new(PlaintextVault),
        Probers::http()?,
    ));
    let scanner = Scanner::new(config.scan.clone())?;
    let sink: Arc<dyn EventSink> = Arc::new(TracingSink);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Shutdown requested");
                cancel.cancel();
            }
        });
    }

    if cli.once {
        let target = cli
            .target
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("--target is required in --once mode"))?;
        let spec = AddressSpec::parse(target)?;
        let ingest = Arc::new(ScanIngest::new(
            &config.shard_id,
            spec.as_str(),
            registry.clone(),
            enrich.clone(),
            sink,
        ));
        run_single_scan(&scanner, &spec, ingest, &cancel).await?;
        enrich_found(&registry, &enrich, &config).await;
        println!("{}", serde_json::to_string_pretty(&registry.list())?);
    } else if cli.daemon {
        let enrich_task = tokio::spawn(enrich.clone().run(cancel.clone()));
        let fleet_task = tokio::spawn(log_fleet_changes(registry.clone(), cancel.clone()));

        let sched = ScanScheduler::new(config, scanner, registry, enrich, sink);
        sched.run(cancel.clone()).await?;

        cancel.cancel();
        enrich_task.await??;
        fleet_task.await?;
    } else {
        anyhow::bail!("Specify --preview, --once (one-shot scan) or --daemon (scheduled scanning)");
    }

    Ok(())
}

/// Probe every miner found by a one-shot scan, bounded by the worker count.
async fn enrich_found(registry: &DeviceRegistry, enrich: &Arc<EnrichScheduler>, config: &RigscoutConfig) {
    let permits = Arc::new(Semaphore::new(config.enrich.workers.max(1)));
    let mut tasks = JoinSet::new();

    for device in registry.list() {
        if !device.online || device.confidence < ASIC_THRESHOLD {
            continue;
        }
        let enrich = enrich.clone();
        let permits = permits.clone();
        tasks.spawn(async move {
            let Ok(_permit) = permits.acquire().await else {
                return;
            };
            match enrich.probe_now(device.ip).await {
                Ok(res) => tracing::info!(
                    ip = %device.ip,
                    ok = res.ok,
                    cred = %res.used_cred,
                    error = %res.error,
                    "Enrichment finished"
                ),
                Err(e) => tracing::warn!(ip = %device.ip, error = %e, "Enrichment failed"),
            }
        });
    }

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            tracing::error!(error = %e, "Enrichment task panicked");
        }
    }
}

/// Log fleet totals whenever the registry changes.
async fn log_fleet_changes(registry: Arc<DeviceRegistry>, cancel: CancellationToken) {
    let mut changes = registry.subscribe();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            woke = changes.recv() => {
                if woke.is_none() {
                    break;
                }
            }
        }

        let devices = registry.list();
        let online = devices.iter().filter(|d| d.online).count();
        let auth_ok = devices.iter().filter(|d| d.auth_status == AuthStatus::Ok).count();
        let auth_fail = devices.iter().filter(|d| d.auth_status == AuthStatus::Fail).count();
        tracing::info!(
            total = devices.len(),
            online,
            auth_ok,
            auth_fail,
            "Fleet updated"
        );
    }
}
