//! rigscout-registry: the live device registry.
//!
//! A concurrent map from IP to [`Device`]. All mutations run inside a short
//! write-locked section; readers always get owned copies. Subscribers are
//! woken through single-slot channels, so any burst of changes collapses into
//! at most one pending wake-up and the subscriber re-reads the snapshot.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Mutex, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use rigscout_core::Device;

/// Concurrent keyed store of device state.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: RwLock<HashMap<Ipv4Addr, Device>>,
    subscribers: Mutex<Vec<mpsc::Sender<()>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a discovery hit: create the device if absent, refresh MAC,
    /// shard and last-seen.
    pub fn upsert_discovery(&self, shard_id: &str, ip: Ipv4Addr, mac: &str, now: DateTime<Utc>) {
        self.mutate(ip, now, |d| {
            if !mac.is_empty() {
                d.mac = mac.to_string();
            }
            if !shard_id.is_empty() {
                d.shard_id = shard_id.to_string();
            }
        });
    }

    /// Record an observation: create the device if absent and set its
    /// online flag.
    pub fn upsert_observed(
        &self,
        shard_id: &str,
        ip: Ipv4Addr,
        mac: &str,
        online: bool,
        now: DateTime<Utc>,
    ) {
        self.mutate(ip, now, |d| {
            if !mac.is_empty() {
                d.mac = mac.to_string();
            }
            if !shard_id.is_empty() {
                d.shard_id = shard_id.to_string();
            }
            d.online = online;
        });
    }

    /// Apply `mutator` to an existing device under the write lock and bump
    /// its last-seen time. Unknown IPs are ignored; returns whether the
    /// device existed.
    pub fn update_enrichment<F>(&self, ip: Ipv4Addr, mutator: F) -> bool
    where
        F: FnOnce(&mut Device),
    {
        let found = {
            let mut devices = self.devices.write().unwrap_or_else(PoisonError::into_inner);
            match devices.get_mut(&ip) {
                Some(d) => {
                    mutator(d);
                    d.last_seen = Utc::now();
                    true
                }
                None => false,
            }
        };
        if found {
            self.notify();
        }
        found
    }

    /// Copy of a single device.
    pub fn get(&self, ip: Ipv4Addr) -> Option<Device> {
        let devices = self.devices.read().unwrap_or_else(PoisonError::into_inner);
        devices.get(&ip).cloned()
    }

    /// Snapshot of every device, ordered by IP.
    pub fn list(&self) -> Vec<Device> {
        let devices = self.devices.read().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<Device> = devices.values().cloned().collect();
        out.sort_by_key(|d| d.ip);
        out
    }

    pub fn len(&self) -> usize {
        self.devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register a change subscriber.
    ///
    /// The returned receiver holds at most one pending signal. Dropping it
    /// unsubscribes.
    pub fn subscribe(&self) -> mpsc::Receiver<()> {
        let (tx, rx) = mpsc::channel(1);
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    fn mutate<F>(&self, ip: Ipv4Addr, now: DateTime<Utc>, f: F)
    where
        F: FnOnce(&mut Device),
    {
        {
            let mut devices = self.devices.write().unwrap_or_else(PoisonError::into_inner);
            let device = devices.entry(ip).or_insert_with(|| {
                tracing::debug!(ip = %ip, "New device");
                Device::new(ip, now)
            });
            f(device);
            device.last_seen = now;
        }
        self.notify();
    }

    fn notify(&self) {
        let mut subs = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        subs.retain(|tx| match tx.try_send(()) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(())) => true,
            Err(mpsc::error::TrySendError::Closed(())) => false,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rigscout_core::AuthStatus;

    fn ip(last: u8) -> Ipv4Addr {
        Ipv4Addr::new(10, 0, 0, last)
    }

    #[test]
    fn test_upsert_creates_and_updates() {
        let reg = DeviceRegistry::new();
        let t0 = Utc::now();
        reg.upsert_discovery("scanner", ip(5), "", t0);
        reg.upsert_observed("scanner", ip(5), "aa:bb:cc:00:11:22", true, t0);

        let d = reg.get(ip(5)).unwrap();
        assert!(d.online);
        assert_eq!(d.shard_id, "scanner");
        assert_eq!(d.mac, "aa:bb:cc:00:11:22");
        assert_eq!(d.first_seen, t0);

        // Blank MAC must not erase the known one.
        reg.upsert_discovery("", ip(5), "", t0);
        assert_eq!(reg.get(ip(5)).unwrap().mac, "aa:bb:cc:00:11:22");
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_update_enrichment_unknown_ip() {
        let reg = DeviceRegistry::new();
        let applied = reg.update_enrichment(ip(9), |d| d.auth_status = AuthStatus::Ok);
        assert!(!applied);
        assert!(reg.is_empty());
    }

    #[test]
    fn test_update_enrichment_bumps_last_seen() {
        let reg = DeviceRegistry::new();
        let t0 = Utc::now() - chrono::Duration::hours(1);
        reg.upsert_discovery("scanner", ip(1), "", t0);

        assert!(reg.update_enrichment(ip(1), |d| d.model = "Antminer S19".to_string()));
        let d = reg.get(ip(1)).unwrap();
        assert_eq!(d.model, "Antminer S19");
        assert!(d.last_seen > t0);
    }

    #[test]
    fn test_list_returns_copies_sorted() {
        let reg = DeviceRegistry::new();
        let now = Utc::now();
        reg.upsert_discovery("scanner", ip(20), "", now);
        reg.upsert_discovery("scanner", ip(3), "", now);

        let mut snapshot = reg.list();
        assert_eq!(snapshot[0].ip, ip(3));
        snapshot[0].model = "mutated".to_string();
        assert_eq!(reg.get(ip(3)).unwrap().model, "");
    }

    #[test]
    fn test_notifications_coalesce() {
        let reg = DeviceRegistry::new();
        let mut rx = reg.subscribe();
        let now = Utc::now();

        for i in 0..50 {
            reg.upsert_discovery("scanner", ip(i), "", now);
        }

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());

        reg.upsert_observed("scanner", ip(1), "", true, now);
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_dropped_subscriber_is_pruned() {
        let reg = DeviceRegistry::new();
        let rx = reg.subscribe();
        let _keep = reg.subscribe();
        drop(rx);

        reg.upsert_discovery("scanner", ip(1), "", Utc::now());
        assert_eq!(reg.subscribers.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_subscriber_wakes_async() {
        let reg = std::sync::Arc::new(DeviceRegistry::new());
        let mut rx = reg.subscribe();

        let writer = reg.clone();
        tokio::spawn(async move {
            writer.upsert_discovery("scanner", ip(2), "", Utc::now());
        });

        let woke = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv()).await;
        assert_eq!(woke.unwrap(), Some(()));
        assert_eq!(reg.list().len(), 1);
    }
}
