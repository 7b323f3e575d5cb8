//! Core domain types for the rigscout fleet registry.
//!
//! These types are shared by the scanner, the vendor enrichment probers and
//! the registry. Everything here is plain data plus the merge rules that
//! decide how a new observation is folded into an existing record.

use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::modelnorm;

// ── Vendor / Firmware ─────────────────────────────────────────────

/// Hardware vendor guess for a device.
///
/// `Asic` is the generic tag used when a host clearly runs miner software
/// but no brand could be identified.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Vendor {
    Antminer,
    Whatsminer,
    Avalonminer,
    Iceriver,
    Elphapex,
    Asic,
}

impl Vendor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Antminer => "antminer",
            Self::Whatsminer => "whatsminer",
            Self::Avalonminer => "avalonminer",
            Self::Iceriver => "iceriver",
            Self::Elphapex => "elphapex",
            Self::Asic => "asic",
        }
    }

    /// Parse a loosely formatted vendor tag. Blank and `unknown` yield `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "antminer" | "bitmain" => Some(Self::Antminer),
            "whatsminer" | "microbt" => Some(Self::Whatsminer),
            "avalonminer" | "avalon" | "canaan" => Some(Self::Avalonminer),
            "iceriver" => Some(Self::Iceriver),
            "elphapex" => Some(Self::Elphapex),
            "asic" => Some(Self::Asic),
            _ => None,
        }
    }

    pub fn is_generic(&self) -> bool {
        matches!(self, Self::Asic)
    }
}

impl fmt::Display for Vendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// True when the vendor hint is blank or only the generic `asic` tag.
pub fn vendor_is_unset(vendor: Option<Vendor>) -> bool {
    vendor.map_or(true, |v| v.is_generic())
}

/// Firmware family, used to rank credentials and pick a prober.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum FirmwareClass {
    /// Vendor stock firmware exposing CGI JSON endpoints.
    #[default]
    Stock,
    /// Third-party single-page-app firmware (Vnish, AnthillOS, Braiins).
    #[serde(alias = "vnish", alias = "anthill")]
    Spa,
}

impl FirmwareClass {
    /// Classify a free-form firmware string reported by a device.
    pub fn of(firmware: &str) -> Self {
        let fw = firmware.to_ascii_lowercase();
        if fw.contains("vnish") || fw.contains("anthill") || fw.contains("brains") {
            Self::Spa
        } else {
            Self::Stock
        }
    }
}

// ── Enrichment state ──────────────────────────────────────────────

/// Operator-facing summary of the last authenticated enrichment.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuthStatus {
    #[default]
    Idle,
    Trying,
    Ok,
    Fail,
}

impl AuthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Trying => "trying",
            Self::Ok => "ok",
            Self::Fail => "fail",
        }
    }
}

/// Best-effort runtime telemetry shared by scan results, facts and devices.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Telemetry {
    #[serde(default)]
    pub worker: String,
    #[serde(default)]
    pub uptime_s: u64,
    #[serde(default)]
    pub hashrate_ths: f64,
    #[serde(default)]
    pub fans_rpm: Vec<u32>,
    #[serde(default)]
    pub temps_c: Vec<f64>,
}

impl Telemetry {
    pub fn is_empty(&self) -> bool {
        self.worker.is_empty()
            && self.uptime_s == 0
            && self.hashrate_ths <= 0.0
            && self.fans_rpm.is_empty()
            && self.temps_c.is_empty()
    }

    /// Monotonic-on-non-empty merge: only non-empty values overwrite.
    pub fn absorb(&mut self, other: &Telemetry) {
        set_if_nonempty(&mut self.worker, &other.worker);
        if other.uptime_s > 0 {
            self.uptime_s = other.uptime_s;
        }
        if other.hashrate_ths > 0.0 {
            self.hashrate_ths = other.hashrate_ths;
        }
        if !other.fans_rpm.is_empty() {
            self.fans_rpm = other.fans_rpm.clone();
        }
        if !other.temps_c.is_empty() {
            self.temps_c = other.temps_c.clone();
        }
    }
}

fn set_if_nonempty(dst: &mut String, src: &str) {
    if !src.is_empty() {
        *dst = src.to_string();
    }
}

// ── Scan results ──────────────────────────────────────────────────

/// Outcome of fingerprinting one address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResult {
    pub ip: Ipv4Addr,
    pub online: bool,
    pub open_ports: Vec<u16>,
    pub vendor: Option<Vendor>,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub firmware: String,
    pub confidence: u8,
    pub is_asic: bool,
    #[serde(flatten)]
    pub telemetry: Telemetry,
}

impl ScanResult {
    pub fn new(ip: Ipv4Addr) -> Self {
        Self {
            ip,
            online: false,
            open_ports: Vec::new(),
            vendor: None,
            model: String::new(),
            firmware: String::new(),
            confidence: 0,
            is_asic: false,
            telemetry: Telemetry::default(),
        }
    }

    pub fn has_port(&self, port: u16) -> bool {
        self.open_ports.contains(&port)
    }
}

/// Normalized facts pulled out of vendor JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Facts {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub firmware: String,
    #[serde(default)]
    pub mac: String,
    #[serde(flatten)]
    pub telemetry: Telemetry,
}

impl Facts {
    pub fn is_empty(&self) -> bool {
        self.model.is_empty()
            && self.firmware.is_empty()
            && self.mac.is_empty()
            && self.telemetry.is_empty()
    }
}

// ── Probe results ─────────────────────────────────────────────────

/// URL scheme used by an enrichment attempt.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    #[default]
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one (credential, scheme) enrichment attempt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProbeResult {
    pub ok: bool,
    pub scheme: Scheme,
    pub used_cred: String,
    #[serde(default)]
    pub error: String,
    /// Endpoint path to parsed JSON body.
    #[serde(default)]
    pub responses: BTreeMap<String, serde_json::Value>,
    /// Endpoint path to truncated raw body, diagnostics only.
    #[serde(default)]
    pub raw: BTreeMap<String, String>,
    /// Firmware family spotted in a page shell (e.g. `anthill`), even when
    /// the attempt itself failed.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub firmware_hint: String,
}

impl ProbeResult {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            ..Default::default()
        }
    }
}

// ── Credentials ───────────────────────────────────────────────────

/// A decrypted credential ready to be tried against one device.
///
/// Instances are built per probe call and dropped with it; nothing in the
/// crate stores them.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct CredentialCandidate {
    pub name: String,
    pub username: String,
    pub password: String,
    pub vendor: Option<Vendor>,
    pub firmware: Option<FirmwareClass>,
    pub priority: i32,
}

impl CredentialCandidate {
    pub fn new(name: &str, username: &str, password: &str) -> Self {
        Self {
            name: name.to_string(),
            username: username.to_string(),
            password: password.to_string(),
            ..Default::default()
        }
    }

    pub fn no_auth() -> Self {
        Self::new("no-auth", "", "")
    }

    pub fn has_auth(&self) -> bool {
        !self.username.is_empty() || !self.password.is_empty()
    }
}

impl fmt::Debug for CredentialCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialCandidate")
            .field("name", &self.name)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("vendor", &self.vendor)
            .field("firmware", &self.firmware)
            .field("priority", &self.priority)
            .finish()
    }
}

// ── Device ────────────────────────────────────────────────────────

/// A registry record for one mining device, keyed by IP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub ip: Ipv4Addr,
    #[serde(default)]
    pub mac: String,
    #[serde(default)]
    pub shard_id: String,
    pub online: bool,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub vendor: Option<Vendor>,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub firmware: String,
    #[serde(default)]
    pub open_ports: Vec<u16>,
    pub confidence: u8,
    pub auth_status: AuthStatus,
    #[serde(default)]
    pub auth_cred_name: String,
    #[serde(default)]
    pub auth_error: String,
    pub auth_updated_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub telemetry: Telemetry,
}

impl Device {
    pub fn new(ip: Ipv4Addr, now: DateTime<Utc>) -> Self {
        Self {
            ip,
            mac: String::new(),
            shard_id: String::new(),
            online: false,
            first_seen: now,
            last_seen: now,
            vendor: None,
            model: String::new(),
            firmware: String::new(),
            open_ports: Vec::new(),
            confidence: 0,
            auth_status: AuthStatus::Idle,
            auth_cred_name: String::new(),
            auth_error: String::new(),
            auth_updated_at: None,
            telemetry: Telemetry::default(),
        }
    }

    pub fn has_port(&self, port: u16) -> bool {
        self.open_ports.contains(&port)
    }

    pub fn firmware_class(&self) -> FirmwareClass {
        FirmwareClass::of(&self.firmware)
    }

    /// Fold a fresh scan observation into the record.
    ///
    /// Port set and confidence always reflect the latest scan; identity and
    /// telemetry only move forward on non-empty values.
    pub fn absorb_scan(&mut self, result: &ScanResult) {
        self.open_ports = result.open_ports.clone();
        self.confidence = result.confidence;
        if result.vendor.is_some() {
            self.vendor = result.vendor;
        }
        set_if_nonempty(&mut self.model, &result.model);
        set_if_nonempty(&mut self.firmware, &result.firmware);
        self.telemetry.absorb(&result.telemetry);
    }

    /// Fold enrichment facts into the record.
    ///
    /// `fallback_vendor` fills a blank or generic vendor. MAC is only taken
    /// when the device has none yet.
    pub fn absorb_facts(&mut self, facts: &Facts, fallback_vendor: Option<Vendor>) {
        if vendor_is_unset(self.vendor) && fallback_vendor.is_some() {
            self.vendor = fallback_vendor;
        }
        if self.mac.is_empty() && !facts.mac.is_empty() {
            self.mac = facts.mac.clone();
        }
        if !facts.model.is_empty() {
            let norm = modelnorm::normalize(&facts.model);
            if norm.model.is_empty() {
                self.model = facts.model.clone();
            } else {
                self.model = norm.model;
                if vendor_is_unset(self.vendor) && norm.vendor.is_some() {
                    self.vendor = norm.vendor;
                }
            }
        }
        set_if_nonempty(&mut self.firmware, &facts.firmware);
        self.telemetry.absorb(&facts.telemetry);
    }
}
