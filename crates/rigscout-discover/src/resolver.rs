//! Address space resolution.
//!
//! A scan target is a comma- or newline-separated list of segments, each a
//! CIDR block (`10.10.0.0/16`) or an inclusive IPv4 range
//! (`10.10.1.10-10.10.1.200`). CIDR blocks exclude their network and
//! broadcast addresses. All counting is plain `u32` arithmetic, so previews
//! of large blocks never materialize addresses.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use ipnet::IpNet;
use serde::Serialize;

use crate::error::{DiscoverError, Result};

const ELLIPSIS: &str = "…";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SegmentKind {
    Cidr,
    Range,
}

/// One parsed segment. `bounds` is `None` when the segment has no hosts.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Segment {
    kind: SegmentKind,
    bounds: Option<(u32, u32)>,
}

impl Segment {
    fn parse(part: &str) -> Result<Self> {
        if part.contains('/') {
            Self::parse_cidr(part)
        } else {
            Self::parse_range(part)
        }
    }

    fn parse_cidr(part: &str) -> Result<Self> {
        let net: IpNet = part
            .parse()
            .map_err(|_| DiscoverError::InvalidSpecification(format!("invalid CIDR address: {part}")))?;
        let IpNet::V4(net) = net else {
            return Err(DiscoverError::InvalidSpecification(
                "only IPv4 is supported for discovery".to_string(),
            ));
        };
        let start = i64::from(u32::from(net.network())) + 1;
        let end = i64::from(u32::from(net.broadcast())) - 1;
        Ok(Self {
            kind: SegmentKind::Cidr,
            bounds: bounds(start, end),
        })
    }

    fn parse_range(part: &str) -> Result<Self> {
        let mut it = part.split('-');
        let (Some(a), Some(b), None) = (it.next(), it.next(), it.next()) else {
            return Err(DiscoverError::InvalidSpecification(format!(
                "bad range {part:?}, want A-B"
            )));
        };
        let parse = |s: &str| Ipv4Addr::from_str(s.trim()).ok();
        let (Some(a), Some(b)) = (parse(a), parse(b)) else {
            return Err(DiscoverError::InvalidSpecification(format!(
                "bad IPv4 range {part:?}"
            )));
        };
        Ok(Self {
            kind: SegmentKind::Range,
            bounds: bounds(i64::from(u32::from(a)), i64::from(u32::from(b))),
        })
    }

    fn hosts(&self) -> u64 {
        self.bounds
            .map_or(0, |(s, e)| u64::from(e) - u64::from(s) + 1)
    }

    fn samples(&self) -> Vec<String> {
        let Some((start, end)) = self.bounds else {
            return Vec::new();
        };
        let total = self.hosts();
        let addr = |v: u32| Ipv4Addr::from(v).to_string();
        let mut out = Vec::new();
        match self.kind {
            SegmentKind::Cidr => {
                out.extend((start..=end).take(3).map(addr));
                if total > 6 {
                    out.push(ELLIPSIS.to_string());
                }
                out.extend((start..=end).rev().take(3).map(addr));
            }
            SegmentKind::Range => {
                out.push(addr(start));
                if total > 2 {
                    out.push(ELLIPSIS.to_string());
                }
                out.push(addr(end));
            }
        }
        out
    }
}

fn bounds(start: i64, end: i64) -> Option<(u32, u32)> {
    if end < start {
        return None;
    }
    Some((u32::try_from(start).ok()?, u32::try_from(end).ok()?))
}

/// A parsed scan target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressSpec {
    raw: String,
    segments: Vec<Segment>,
}

impl AddressSpec {
    pub fn parse(spec: &str) -> Result<Self> {
        let raw = spec.trim();
        if raw.is_empty() {
            return Err(DiscoverError::InvalidSpecification("empty".to_string()));
        }
        let segments = raw
            .split(['\n', '\r', ','])
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(Segment::parse)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn total_hosts(&self) -> u64 {
        self.segments.iter().map(Segment::hosts).sum()
    }

    /// Lazily enumerate every address, segment by segment. The iterator can
    /// be recreated at will.
    pub fn iter(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        self.segments
            .iter()
            .filter_map(|s| s.bounds)
            .flat_map(|(start, end)| (start..=end).map(Ipv4Addr::from))
    }

    pub fn preview(&self) -> AddressPreview {
        let non_empty = self.segments.iter().filter(|s| s.bounds.is_some());
        let first = non_empty
            .clone()
            .filter_map(|s| s.bounds.map(|b| b.0))
            .min()
            .map(Ipv4Addr::from);
        let last = non_empty
            .clone()
            .filter_map(|s| s.bounds.map(|b| b.1))
            .max()
            .map(Ipv4Addr::from);
        let samples: Vec<String> = non_empty.flat_map(Segment::samples).collect();

        AddressPreview {
            valid: true,
            error: None,
            spec: self.raw.clone(),
            total_hosts: self.total_hosts(),
            first,
            last,
            samples: shrink_samples(samples),
        }
    }
}

impl FromStr for AddressSpec {
    type Err = DiscoverError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for AddressSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Summary of a scan target, shown before a scan starts.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct AddressPreview {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub spec: String,
    pub total_hosts: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first: Option<Ipv4Addr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last: Option<Ipv4Addr>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub samples: Vec<String>,
}

/// Preview `spec`. Invalid specs produce `valid: false` with the reason.
pub fn preview(spec: &str) -> AddressPreview {
    match AddressSpec::parse(spec) {
        Ok(parsed) => parsed.preview(),
        Err(DiscoverError::InvalidSpecification(reason)) => AddressPreview {
            error: Some(reason),
            ..Default::default()
        },
        Err(e) => AddressPreview {
            error: Some(e.to_string()),
            ..Default::default()
        },
    }
}

/// Parse `spec` and return its lazy address sequence.
pub fn enumerate(spec: &str) -> Result<impl Iterator<Item = Ipv4Addr>> {
    let parsed = AddressSpec::parse(spec)?;
    Ok(parsed
        .segments
        .into_iter()
        .filter_map(|s| s.bounds)
        .flat_map(|(start, end)| (start..=end).map(Ipv4Addr::from)))
}

fn shrink_samples(samples: Vec<String>) -> Vec<String> {
    if samples.len() <= 9 {
        return samples;
    }
    let mut out = Vec::with_capacity(7);
    out.extend_from_slice(&samples[..3]);
    out.push(ELLIPSIS.to_string());
    out.extend_from_slice(&samples[samples.len() - 3..]);
    out
}

/// Compact host count: `999`, `1.5k`, `2.0M`.
pub fn format_hosts(n: u64) -> String {
    match n {
        0..=999 => n.to_string(),
        1_000..=999_999 => format!("{:.1}k", n as f64 / 1e3),
        _ => format!("{:.1}M", n as f64 / 1e6),
    }
}
