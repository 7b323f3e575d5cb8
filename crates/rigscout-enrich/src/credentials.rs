//! Credential candidate builder.
//!
//! Turns stored (sealed) credentials plus a device's vendor/firmware hints
//! into the ordered list a vendor prober walks through. Plaintext only exists
//! in the returned candidates, which callers drop when the probe finishes.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use serde::Deserialize;

use rigscout_core::types::vendor_is_unset;
use rigscout_core::{CoreError, CredentialCandidate, FirmwareClass, Vendor};

/// A credential as persisted by the settings collaborator. Username and
/// password are sealed; a [`CredentialVault`] opens them.
#[derive(Clone, Deserialize)]
pub struct StoredCredential {
    #[serde(default)]
    pub id: String,
    pub name: String,
    /// Vendor tag; blank means "any vendor".
    #[serde(default)]
    pub vendor: String,
    /// Firmware class tag (`stock`, `vnish`, `anthill`); blank means none.
    #[serde(default)]
    pub firmware: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub username_enc: String,
    #[serde(default)]
    pub password_enc: String,
}

fn default_enabled() -> bool {
    true
}

impl StoredCredential {
    pub fn vendor(&self) -> Option<Vendor> {
        Vendor::parse(&self.vendor)
    }

    pub fn firmware_class(&self) -> Option<FirmwareClass> {
        match self.firmware.trim().to_ascii_lowercase().as_str() {
            "" => None,
            "stock" => Some(FirmwareClass::Stock),
            other => Some(FirmwareClass::of(other)),
        }
    }
}

impl fmt::Debug for StoredCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoredCredential")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("vendor", &self.vendor)
            .field("firmware", &self.firmware)
            .field("enabled", &self.enabled)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

/// Opens sealed credential fields.
pub trait CredentialVault: Send + Sync {
    fn open(&self, sealed: &str) -> Result<String, CoreError>;
}

/// Vault for deployments that keep credentials unsealed in config.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlaintextVault;

impl CredentialVault for PlaintextVault {
    fn open(&self, sealed: &str) -> Result<String, CoreError> {
        Ok(sealed.to_string())
    }
}

/// One entry of the built-in defaults table.
#[derive(Debug, Clone, Copy)]
pub struct DefaultEntry {
    /// Vendor tag or `generic`.
    pub vendor: &'static str,
    pub username: &'static str,
    pub password: &'static str,
}

pub const BUILTIN_DEFAULTS: &[DefaultEntry] = &[
    DefaultEntry {
        vendor: "whatsminer",
        username: "admin",
        password: "admin",
    },
    DefaultEntry {
        vendor: "avalonminer",
        username: "root",
        password: "root",
    },
    DefaultEntry {
        vendor: "generic",
        username: "admin",
        password: "admin",
    },
];

/// Factory pairs tried first on stock-looking devices.
const STOCK_PAIRS: &[(&str, &str, &str)] = &[
    ("stock:root/root", "root", "root"),
    ("stock:root/admin", "root", "admin"),
];

/// Ordering weight of a candidate for a device of class `device_class`.
pub fn rank_key(candidate: &CredentialCandidate, device_class: FirmwareClass) -> i32 {
    let bonus = if candidate.firmware == Some(device_class) {
        1000
    } else {
        0
    };
    bonus + candidate.priority
}

/// Descending by [`rank_key`].
pub fn compare_candidates(
    a: &CredentialCandidate,
    b: &CredentialCandidate,
    device_class: FirmwareClass,
) -> Ordering {
    rank_key(b, device_class).cmp(&rank_key(a, device_class))
}

/// Builds per-device credential lists.
pub struct CredentialBuilder {
    stored: Vec<StoredCredential>,
    vault: Arc<dyn CredentialVault>,
    try_defaults: bool,
}

impl CredentialBuilder {
    pub fn new(
        stored: Vec<StoredCredential>,
        vault: Arc<dyn CredentialVault>,
        try_defaults: bool,
    ) -> Self {
        Self {
            stored,
            vault,
            try_defaults,
        }
    }

    /// Ordered candidates for a device with the given vendor and firmware
    /// hints. Never empty.
    pub fn build(&self, vendor: Option<Vendor>, firmware: &str) -> Vec<CredentialCandidate> {
        let class = FirmwareClass::of(firmware);
        let mut out = Vec::with_capacity(self.stored.len() + STOCK_PAIRS.len() + 1);

        if class == FirmwareClass::Stock
            && (vendor_is_unset(vendor) || vendor == Some(Vendor::Antminer))
        {
            out.extend(
                STOCK_PAIRS
                    .iter()
                    .map(|(name, user, pass)| CredentialCandidate::new(name, user, pass)),
            );
        }

        let mut stored = self.open_stored(vendor);
        stored.sort_by(|a, b| compare_candidates(a, b, class));
        out.extend(stored);

        if self.try_defaults {
            let device_vendor = vendor.filter(|v| !v.is_generic());
            out.extend(
                BUILTIN_DEFAULTS
                    .iter()
                    .filter(|d| {
                        d.vendor == "generic"
                            || (device_vendor.is_some() && Vendor::parse(d.vendor) == device_vendor)
                    })
                    .map(|d| {
                        let mut c = CredentialCandidate::new(
                            &format!("default:{}", d.vendor),
                            d.username,
                            d.password,
                        );
                        c.vendor = Vendor::parse(d.vendor);
                        c
                    }),
            );
        }

        if out.is_empty() {
            out.push(CredentialCandidate::no_auth());
        }
        out
    }

    /// Enabled stored credentials matching `vendor`, opened. Credentials
    /// that fail to open are skipped.
    fn open_stored(&self, vendor: Option<Vendor>) -> Vec<CredentialCandidate> {
        let device_vendor = vendor.filter(|v| !v.is_generic());
        self.stored
            .iter()
            .filter(|s| s.enabled)
            .filter(|s| match device_vendor {
                Some(dv) => s.vendor.trim().is_empty() || s.vendor() == Some(dv),
                None => true,
            })
            .filter_map(|s| match self.open(s) {
                Ok(c) => Some(c),
                Err(e) => {
                    tracing::warn!(credential = %s.name, error = %e, "Skipping credential that failed to open");
                    None
                }
            })
            .collect()
    }

    fn open(&self, s: &StoredCredential) -> Result<CredentialCandidate, CoreError> {
        let username = self.vault.open(&s.username_enc)?;
        let password = self.vault.open(&s.password_enc)?;
        Ok(CredentialCandidate {
            name: s.name.clone(),
            username,
            password,
            vendor: s.vendor(),
            firmware: s.firmware_class(),
            priority: s.priority,
        })
    }
}

impl fmt::Debug for CredentialBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialBuilder")
            .field("stored", &self.stored.len())
            .field("try_defaults", &self.try_defaults)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Values prefixed `bad:` fail to open; `enc:` is stripped.
    struct TestVault;

    impl CredentialVault for TestVault {
        fn open(&self, sealed: &str) -> Result<String, CoreError> {
            if sealed.starts_with("bad:") {
                return Err(CoreError::Credential("authentication tag mismatch".to_string()));
            }
            Ok(sealed.trim_start_matches("enc:").to_string())
        }
    }

    fn stored(name: &str, vendor: &str, firmware: &str, priority: i32) -> StoredCredential {
        StoredCredential {
            id: name.to_string(),
            name: name.to_string(),
            vendor: vendor.to_string(),
            firmware: firmware.to_string(),
            enabled: true,
            priority,
            username_enc: "enc:root".to_string(),
            password_enc: format!("enc:{name}"),
        }
    }

    fn builder(stored: Vec<StoredCredential>, try_defaults: bool) -> CredentialBuilder {
        CredentialBuilder::new(stored, Arc::new(TestVault), try_defaults)
    }

    fn names(c: &[CredentialCandidate]) -> Vec<&str> {
        c.iter().map(|c| c.name.as_str()).collect()
    }

    #[test]
    fn test_stock_pairs_come_first() {
        let b = builder(vec![stored("site", "", "", 5)], false);
        let c = b.build(None, "");
        assert_eq!(names(&c), vec!["stock:root/root", "stock:root/admin", "site"]);
        assert_eq!(c[2].password, "site");
    }

    #[test]
    fn test_spa_device_skips_stock_pairs() {
        let b = builder(vec![stored("site", "", "", 5)], false);
        let c = b.build(Some(Vendor::Antminer), "Vnish 1.2.6");
        assert_eq!(names(&c), vec!["site"]);
    }

    #[test]
    fn test_firmware_match_beats_priority() {
        let b = builder(
            vec![
                stored("high", "", "stock", 500),
                stored("vnish", "", "vnish", 1),
                stored("mid", "", "", 200),
            ],
            false,
        );
        let c = b.build(Some(Vendor::Antminer), "anthill 1.0");
        assert_eq!(names(&c), vec!["vnish", "high", "mid"]);
    }

    #[test]
    fn test_sort_is_stable_for_equal_rank() {
        let b = builder(
            vec![stored("a", "", "", 10), stored("b", "", "", 10), stored("c", "", "", 11)],
            false,
        );
        let c = b.build(Some(Vendor::Whatsminer), "");
        assert_eq!(names(&c), vec!["c", "a", "b"]);
    }

    #[test]
    fn test_vendor_mismatch_and_disabled_are_skipped() {
        let mut disabled = stored("off", "", "", 99);
        disabled.enabled = false;
        let b = builder(
            vec![
                stored("wm", "whatsminer", "", 1),
                stored("am", "antminer", "", 1),
                stored("any", "", "", 0),
                disabled,
            ],
            false,
        );
        let c = b.build(Some(Vendor::Whatsminer), "");
        assert_eq!(names(&c), vec!["wm", "any"]);

        // A generic vendor tag accepts every stored vendor.
        let c = b.build(Some(Vendor::Asic), "");
        assert_eq!(names(&c)[2..], ["wm", "am", "any"]);
    }

    #[test]
    fn test_unknown_vendor_tag_only_matches_unknown_devices() {
        let b = builder(
            vec![stored("router", "ubiquiti", "", 5), stored("any", "", "", 0)],
            false,
        );
        let c = b.build(Some(Vendor::Whatsminer), "");
        assert_eq!(names(&c), vec!["any"]);

        let c = b.build(None, "");
        assert!(names(&c).contains(&"router"));
    }

    #[test]
    fn test_unopenable_credentials_are_skipped() {
        let mut broken = stored("broken", "", "", 100);
        broken.password_enc = "bad:xyz".to_string();
        let b = builder(vec![broken, stored("good", "", "", 0)], false);
        let c = b.build(Some(Vendor::Whatsminer), "");
        assert_eq!(names(&c), vec!["good"]);
    }

    #[test]
    fn test_defaults_filtered_by_vendor() {
        let b = builder(Vec::new(), true);
        let c = b.build(Some(Vendor::Whatsminer), "");
        assert_eq!(names(&c), vec!["default:whatsminer", "default:generic"]);

        let c = b.build(Some(Vendor::Iceriver), "");
        assert_eq!(names(&c), vec!["default:generic"]);

        let c = b.build(None, "");
        assert_eq!(names(&c), vec!["stock:root/root", "stock:root/admin", "default:generic"]);
    }

    #[test]
    fn test_no_auth_when_nothing_else() {
        let b = builder(Vec::new(), false);
        let c = b.build(Some(Vendor::Whatsminer), "");
        assert_eq!(names(&c), vec!["no-auth"]);
        assert!(!c[0].has_auth());
    }

    #[test]
    fn test_rank_key() {
        let mut c = CredentialCandidate::new("x", "u", "p");
        c.priority = 7;
        assert_eq!(rank_key(&c, FirmwareClass::Stock), 7);
        c.firmware = Some(FirmwareClass::Stock);
        assert_eq!(rank_key(&c, FirmwareClass::Stock), 1007);
        assert_eq!(rank_key(&c, FirmwareClass::Spa), 7);
    }

    #[test]
    fn test_stored_credential_deserialize() {
        let json = r#"{"id":"1","name":"site","vendor":"Antminer","firmware":"anthill","priority":3,"username_enc":"u","password_enc":"p"}"#;
        let s: StoredCredential = serde_json::from_str(json).unwrap();
        assert!(s.enabled);
        assert_eq!(s.vendor(), Some(Vendor::Antminer));
        assert_eq!(s.firmware_class(), Some(FirmwareClass::Spa));
        assert!(!format!("{s:?}").contains("password_enc"));
    }
}
