//! Model-name normalization.
//!
//! Devices report their model in many shapes (`BTM_S19J_PRO`, `Antminer S21`,
//! `M50S`, `KS5PRO`). `normalize` turns these into one display string per
//! family plus a vendor guess and a grouping key.

use serde::Serialize;

use crate::types::Vendor;

/// A normalized model name.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct NormalizedModel {
    /// Vendor inferred from the model name, `None` when unknown.
    pub vendor: Option<Vendor>,
    /// Display form, e.g. `Antminer S19j Pro`.
    pub model: String,
    /// Stable uppercased key for filtering and grouping.
    pub key: String,
}

fn collapse_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn digit_at(s: &str, idx: usize) -> bool {
    s.as_bytes().get(idx).is_some_and(|b| b.is_ascii_digit())
}

pub fn normalize(raw: &str) -> NormalizedModel {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return NormalizedModel::default();
    }

    let mut up = collapse_ws(&trimmed.to_uppercase().replace('_', " "));
    let mut saw_antminer = false;

    for prefix in ["BTM ", "BTM-"] {
        if let Some(rest) = up.strip_prefix(prefix) {
            saw_antminer = true;
            up = rest.trim().to_string();
            break;
        }
    }
    if let Some(rest) = up.strip_prefix("ANTMINER ") {
        saw_antminer = true;
        up = rest.trim().to_string();
    }

    let vendor = if saw_antminer {
        Some(Vendor::Antminer)
    } else if up.starts_with('M') && up.len() >= 3 && digit_at(&up, 1) {
        Some(Vendor::Whatsminer)
    } else if up.starts_with('A') && up.len() >= 3 && digit_at(&up, 1) {
        Some(Vendor::Avalonminer)
    } else if up.starts_with("KS") || up.starts_with("AL") || up.starts_with("KA") {
        Some(Vendor::Iceriver)
    } else if up.starts_with('L') || up.starts_with('S') {
        Some(Vendor::Antminer)
    } else {
        None
    };

    let model = match vendor {
        Some(Vendor::Antminer) => {
            let m = up
                .replace("J PRO", "JPRO")
                .replace("JPRO", "j Pro")
                .replace(" PRO", " Pro")
                .replace("PRO", "Pro")
                .replace(" PLUS", "+")
                .replace("PLUS", "+");
            format!("Antminer {}", collapse_ws(&m))
        }
        Some(Vendor::Whatsminer) => format!("Whatsminer {up}"),
        Some(Vendor::Avalonminer) => format!("Avalon {up}"),
        Some(Vendor::Iceriver) => format!("IceRiver {up}"),
        _ => up,
    };

    let key = collapse_ws(&model).to_uppercase();
    NormalizedModel { vendor, model, key }
}
