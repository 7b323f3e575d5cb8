//! Tolerant fact extraction over arbitrary vendor JSON.
//!
//! Every lookup is a pure function of a `serde_json::Value` tree and a set of
//! key synonyms, so the extractors can be tested without devices. Keys are
//! matched case-insensitively after trimming; a node's own keys are checked
//! before descending into its children.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use rigscout_core::{Facts, Telemetry};

/// Unit a hashrate value is reported in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashUnit {
    Mh,
    Gh,
    Th,
}

impl HashUnit {
    /// Infer a unit from a free-form label, falling back to `default`.
    pub fn infer(label: &str, default: HashUnit) -> HashUnit {
        let label = label.to_ascii_lowercase();
        if label.contains("gh") {
            HashUnit::Gh
        } else if label.contains("th") {
            HashUnit::Th
        } else if label.contains("mh") {
            HashUnit::Mh
        } else {
            default
        }
    }

    pub fn to_ths(self, value: f64) -> f64 {
        match self {
            HashUnit::Mh => value / 1e6,
            HashUnit::Gh => value / 1e3,
            HashUnit::Th => value,
        }
    }
}

// ── Scalars ───────────────────────────────────────────────────────

/// Leading numeric prefix of a string, e.g. `"6120 rpm"` -> 6120.
fn leading_number(s: &str) -> Option<f64> {
    let s = s.trim();
    let end = s
        .char_indices()
        .find(|&(i, c)| !(c.is_ascii_digit() || c == '.' || ((c == '-' || c == '+') && i == 0)))
        .map_or(s.len(), |(i, _)| i);
    s[..end].parse().ok()
}

pub fn to_f64(v: &Value) -> f64 {
    match v {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => leading_number(s).unwrap_or(0.0),
        _ => 0.0,
    }
}

pub fn to_u64(v: &Value) -> u64 {
    let f = to_f64(v);
    if f.is_finite() && f > 0.0 {
        f as u64
    } else {
        0
    }
}

fn non_empty_str(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        _ => None,
    }
}

fn key_matches(key: &str, synonyms: &[&str]) -> bool {
    let key = key.trim();
    synonyms.iter().any(|s| s.eq_ignore_ascii_case(key))
}

// ── Exact-key picks ───────────────────────────────────────────────

/// First non-empty string under one of `keys`, in key order, exact match.
pub fn pick_str(map: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| map.get(*k).and_then(non_empty_str))
}

/// First positive integer under one of `keys`, in key order.
pub fn pick_u64(map: &Map<String, Value>, keys: &[&str]) -> u64 {
    keys.iter()
        .map(|k| map.get(*k).map_or(0, to_u64))
        .find(|&n| n > 0)
        .unwrap_or(0)
}

/// The object itself, or the first object of an array.
pub fn first_object(v: &Value) -> Option<&Map<String, Value>> {
    match v {
        Value::Object(m) => Some(m),
        Value::Array(items) => items.first().and_then(Value::as_object),
        _ => None,
    }
}

/// Every object directly inside an array (or the value itself).
pub fn objects(v: &Value) -> Vec<&Map<String, Value>> {
    match v {
        Value::Object(m) => vec![m],
        Value::Array(items) => items.iter().filter_map(Value::as_object).collect(),
        _ => Vec::new(),
    }
}

// ── Deep search ───────────────────────────────────────────────────

/// Depth-first search: own keys first, then children in order.
fn find_deep<T>(v: &Value, synonyms: &[&str], accept: &dyn Fn(&Value) -> Option<T>) -> Option<T> {
    match v {
        Value::Object(map) => map
            .iter()
            .filter(|(k, _)| key_matches(k, synonyms))
            .find_map(|(_, vv)| accept(vv))
            .or_else(|| map.values().find_map(|vv| find_deep(vv, synonyms, accept))),
        Value::Array(items) => items.iter().find_map(|vv| find_deep(vv, synonyms, accept)),
        _ => None,
    }
}

pub fn find_str(v: &Value, synonyms: &[&str]) -> Option<String> {
    find_deep(v, synonyms, &non_empty_str)
}

pub fn find_u64(v: &Value, synonyms: &[&str]) -> u64 {
    find_deep(v, synonyms, &|x| Some(to_u64(x)).filter(|&n| n > 0)).unwrap_or(0)
}

pub fn find_f64(v: &Value, synonyms: &[&str]) -> f64 {
    find_deep(v, synonyms, &|x| Some(to_f64(x)).filter(|&f| f > 0.0)).unwrap_or(0.0)
}

pub fn find_u32_list(v: &Value, synonyms: &[&str]) -> Vec<u32> {
    find_deep(v, synonyms, &|x| match x {
        Value::Array(items) if !items.is_empty() => Some(
            items
                .iter()
                .map(|e| to_u64(e).min(u64::from(u32::MAX)) as u32)
                .collect(),
        ),
        _ => None,
    })
    .unwrap_or_default()
}

pub fn find_f64_list(v: &Value, synonyms: &[&str]) -> Vec<f64> {
    find_deep(v, synonyms, &|x| match x {
        Value::Array(items) if !items.is_empty() => Some(items.iter().map(to_f64).collect()),
        _ => None,
    })
    .unwrap_or_default()
}

// ── Indexed series (fan1..fanN, temp1..tempN) ─────────────────────

/// Index from a key like `fan3` or `temp12`. The suffix must be all digits
/// and at least 1.
pub fn suffix_index(key: &str, prefix: &str) -> Option<usize> {
    let key = key.trim().to_ascii_lowercase();
    let rest = key.strip_prefix(prefix)?;
    if rest.is_empty() || !rest.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    rest.parse().ok().filter(|&n| n >= 1)
}

/// Values at indices `from..=to`, skipping gaps.
pub fn dense<T: Copy>(series: &BTreeMap<usize, T>, from: usize, to: usize) -> Vec<T> {
    series.range(from..=to).map(|(_, v)| *v).collect()
}

// ── Misc ──────────────────────────────────────────────────────────

/// Lowercase a MAC and use `:` separators.
pub fn normalize_mac(raw: &str) -> String {
    raw.trim().to_ascii_lowercase().replace('-', ":")
}

/// Synonym sets driving [`extract_generic`].
#[derive(Debug, Clone, Copy)]
pub struct Synonyms {
    pub model: &'static [&'static str],
    pub worker: &'static [&'static str],
    pub uptime: &'static [&'static str],
    pub hashrate: &'static [&'static str],
    pub hash_unit: &'static [&'static str],
    pub default_unit: HashUnit,
    pub fans: &'static [&'static str],
    pub temps: &'static [&'static str],
}

/// Synonym-driven extraction across responses given in endpoint order.
/// For each field the first response yielding a non-empty value wins.
pub fn extract_generic<'a>(responses: impl IntoIterator<Item = &'a Value>, syn: &Synonyms) -> Facts {
    let mut model = String::new();
    let mut t = Telemetry::default();

    for v in responses {
        if model.is_empty() {
            model = find_str(v, syn.model).unwrap_or_default();
        }
        if t.worker.is_empty() && !syn.worker.is_empty() {
            t.worker = find_str(v, syn.worker).unwrap_or_default();
        }
        if t.uptime_s == 0 {
            t.uptime_s = find_u64(v, syn.uptime);
        }
        if t.hashrate_ths <= 0.0 {
            let raw = find_f64(v, syn.hashrate);
            if raw > 0.0 {
                let label = find_str(v, syn.hash_unit).unwrap_or_default();
                t.hashrate_ths = HashUnit::infer(&label, syn.default_unit).to_ths(raw);
            }
        }
        if t.fans_rpm.is_empty() {
            t.fans_rpm = find_u32_list(v, syn.fans);
        }
        if t.temps_c.is_empty() {
            t.temps_c = find_f64_list(v, syn.temps);
        }
    }

    Facts {
        model,
        telemetry: t,
        ..Default::default()
    }
}
