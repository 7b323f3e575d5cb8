//! Unauthenticated fingerprinting of a reachable host.
//!
//! Two cheap probes run per online address: a GET of `/` on the web port,
//! matched against vendor signatures, and the plain-text miner API on port
//! 4028. The `apply_*` functions are pure so every parsing rule can be tested
//! against canned responses.

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use reqwest::header::SERVER;
use reqwest::{Client, StatusCode};
use serde_json::{Map, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};

use rigscout_core::{ScanResult, Vendor};
use rigscout_enrich::antminer;
use rigscout_enrich::credentials::BUILTIN_DEFAULTS;
use rigscout_enrich::extract::{dense, pick_str, suffix_index, to_f64, to_u64};

pub const MINER_API_PORT: u16 = 4028;

const BANNER_LIMIT: usize = 2048;
const DEFAULTS_BODY_LIMIT: usize = 64 * 1024;
const API_DIAL_TIMEOUT: Duration = Duration::from_millis(800);
const API_DEADLINE: Duration = Duration::from_millis(900);

/// Series keys are re-indexed densely over this range.
const SERIES_RANGE: (usize, usize) = (1, 8);

/// Score at or above which a host counts as a miner.
pub const ASIC_THRESHOLD: u8 = 60;

const STATS_FIRMWARE_KEYS: &[&str] = &["Firmware Version", "firmware", "version", "Miner Version", "BMMiner Version"];
const STATS_MODEL_KEYS: &[&str] = &["Type", "Model", "Product", "Miner Type", "miner_type", "Device Model"];
const STATS_CHIP_KEYS: &[&str] = &["Chip Type", "ChipType", "ASIC", "asic"];
const DEVS_MODEL_KEYS: &[&str] = &["Model", "Name", "Description"];

/// Hashrate keys in priority order with their divisor to TH/s.
const SUMMARY_HASHRATE_KEYS: &[(&str, f64)] = &[
    ("GHS 5s", 1e3),
    ("GHS av", 1e3),
    ("MHS 5s", 1e6),
    ("MHS av", 1e6),
];

pub fn is_web_port(port: u16) -> bool {
    port == 80 || port == 443
}

fn has_web_port(r: &ScanResult) -> bool {
    r.open_ports.iter().copied().any(is_web_port)
}

// ── HTTP banner ───────────────────────────────────────────────────

/// Match a `Server` header and the head of a page body against vendor
/// signatures. The first body match wins.
pub fn apply_banner(r: &mut ScanResult, server: &str, body: &str) {
    if server.to_ascii_lowercase().contains("antminer") {
        r.vendor = Some(Vendor::Antminer);
    }
    let body = body.to_ascii_lowercase();
    if body.contains("antminer") {
        r.vendor = Some(Vendor::Antminer);
    } else if body.contains("meta name=\"firmware\"") && body.contains("anthillos") {
        r.vendor = Some(Vendor::Antminer);
        if r.firmware.is_empty() {
            r.firmware = "AnthillOS".to_string();
        }
    } else if body.contains("whatsminer") {
        r.vendor = Some(Vendor::Whatsminer);
    } else if body.contains("avalon") || body.contains("canaan") {
        r.vendor = Some(Vendor::Avalonminer);
    } else if body.contains("iceriver") {
        r.vendor = Some(Vendor::Iceriver);
    } else if body.contains("elphapex") {
        r.vendor = Some(Vendor::Elphapex);
    } else if (body.contains("cgminer") || body.contains("bmminer")) && r.vendor.is_none() {
        r.vendor = Some(Vendor::Asic);
    }
}

/// Read at most `limit` bytes of a response body.
async fn read_head(resp: &mut reqwest::Response, limit: usize) -> Result<String, reqwest::Error> {
    let mut buf = Vec::new();
    while let Some(chunk) = resp.chunk().await? {
        let room = limit - buf.len();
        if chunk.len() >= room {
            buf.extend_from_slice(&chunk[..room]);
            break;
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// GET `url` without credentials and apply the banner rules. Errors only
/// mean there is nothing to learn.
pub async fn sniff_http(client: &Client, url: &str, r: &mut ScanResult) {
    let mut resp = match client.get(url).send().await {
        Ok(resp) => resp,
        Err(e) => {
            tracing::trace!(url, error = %e, "Banner request failed");
            return;
        }
    };
    let server = resp
        .headers()
        .get(SERVER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let body = read_head(&mut resp, BANNER_LIMIT).await.unwrap_or_default();
    apply_banner(r, &server, &body);
}

// ── Miner API (port 4028) ─────────────────────────────────────────

/// Send one `{"command": ...}` request and parse the reply. A connection
/// is used per command; the reply runs until the peer closes or the
/// deadline passes.
pub async fn miner_command(ip: Ipv4Addr, port: u16, command: &str) -> Option<Value> {
    let addr = SocketAddr::from((ip, port));
    let mut stream = timeout(API_DIAL_TIMEOUT, TcpStream::connect(addr)).await.ok()?.ok()?;
    let deadline = Instant::now() + API_DEADLINE;

    let request = serde_json::json!({ "command": command }).to_string();
    tokio::time::timeout_at(deadline, stream.write_all(request.as_bytes()))
        .await
        .ok()?
        .ok()?;

    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        match tokio::time::timeout_at(deadline, stream.read(&mut chunk)).await {
            Ok(Ok(0)) | Err(_) | Ok(Err(_)) => break,
            Ok(Ok(n)) => buf.extend_from_slice(&chunk[..n]),
        }
    }
    if buf.is_empty() {
        return None;
    }
    let text: String = String::from_utf8_lossy(&buf).chars().filter(|&c| c != '\0').collect();
    serde_json::from_str(text.trim()).ok()
}

fn section<'a>(reply: &'a Value, key: &str) -> Vec<&'a Map<String, Value>> {
    reply
        .get(key)
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_object).collect())
        .unwrap_or_default()
}

pub fn apply_summary(r: &mut ScanResult, reply: &Value) {
    let Some(m) = section(reply, "SUMMARY").into_iter().next() else {
        return;
    };
    if let Some(v) = m.get("Elapsed") {
        r.telemetry.uptime_s = to_u64(v);
    }
    if let Some((v, div)) = SUMMARY_HASHRATE_KEYS
        .iter()
        .find_map(|(k, div)| m.get(*k).map(|v| (v, *div)))
    {
        r.telemetry.hashrate_ths = to_f64(v) / div;
    }
}

pub fn apply_pools(r: &mut ScanResult, reply: &Value) {
    let user = section(reply, "POOLS")
        .into_iter()
        .find_map(|p| pick_str(p, &["User"]));
    if let Some(user) = user {
        r.telemetry.worker = user;
    }
}

pub fn apply_devs(r: &mut ScanResult, reply: &Value) {
    if !r.model.is_empty() {
        return;
    }
    if let Some(model) = section(reply, "DEVS")
        .into_iter()
        .next()
        .and_then(|m| pick_str(m, DEVS_MODEL_KEYS))
    {
        r.model = model;
    }
}

/// Firmware, model, chip marker and fan/temperature series from `stats`.
/// Stopped fans are kept as zero; zero temperatures are dropped.
pub fn apply_stats(r: &mut ScanResult, reply: &Value) {
    let entries = section(reply, "STATS");
    if entries.is_empty() {
        return;
    }

    let mut fans: BTreeMap<usize, u32> = BTreeMap::new();
    let mut temps: BTreeMap<usize, f64> = BTreeMap::new();
    let mut chip = String::new();

    for m in entries {
        if r.firmware.is_empty() {
            if let Some(fw) = pick_str(m, STATS_FIRMWARE_KEYS) {
                r.firmware = fw;
            }
        }
        if r.model.is_empty() {
            if let Some(model) = pick_str(m, STATS_MODEL_KEYS) {
                r.model = model;
            }
        }
        if chip.is_empty() {
            if let Some(c) = pick_str(m, STATS_CHIP_KEYS) {
                chip = c.to_ascii_uppercase();
            }
        }

        for (key, v) in m {
            if let Some(n) = suffix_index(key, "fan") {
                let rpm = u32::try_from(to_u64(v)).unwrap_or(u32::MAX);
                if rpm > 0 {
                    fans.insert(n, rpm);
                } else {
                    fans.entry(n).or_insert(0);
                }
            } else if let Some(n) = suffix_index(key, "temp") {
                let t = to_f64(v);
                if t != 0.0 {
                    temps.insert(n, t);
                }
            }
        }
    }

    if let Some(model) = model_from_chip(&r.model, &chip, r.telemetry.hashrate_ths) {
        r.model = model.to_string();
    }

    let (from, to) = SERIES_RANGE;
    if !fans.is_empty() {
        r.telemetry.fans_rpm = dense(&fans, from, to);
    }
    if !temps.is_empty() {
        r.telemetry.temps_c = dense(&temps, from, to);
    }
}

/// Some control boards report the model as a `SOC` placeholder; the hash
/// chip and observed hashrate narrow it down.
pub fn model_from_chip(model: &str, chip: &str, hashrate_ths: f64) -> Option<&'static str> {
    let up = model.trim().to_ascii_uppercase();
    if chip.is_empty() || !(up == "SOC" || up.contains(" SOC")) {
        return None;
    }
    if chip.contains("BM1370") {
        Some(if hashrate_ths >= 215.0 { "S21 Pro" } else { "S21" })
    } else if chip.contains("BM1397") {
        Some("S19")
    } else {
        None
    }
}

/// Run `summary`, `pools`, `devs` and `stats` in order against the miner API.
pub async fn sniff_miner_api(ip: Ipv4Addr, port: u16, r: &mut ScanResult) {
    if let Some(reply) = miner_command(ip, port, "summary").await {
        apply_summary(r, &reply);
    }
    if let Some(reply) = miner_command(ip, port, "pools").await {
        apply_pools(r, &reply);
    }
    if let Some(reply) = miner_command(ip, port, "devs").await {
        apply_devs(r, &reply);
    }
    if let Some(reply) = miner_command(ip, port, "stats").await {
        apply_stats(r, &reply);
    }
}

// ── Default-credential sniff ──────────────────────────────────────

/// Vendor and model hints from a body fetched with default credentials.
pub fn apply_authed_body(r: &mut ScanResult, body: &str) {
    if r.vendor.is_none() {
        let low = body.to_ascii_lowercase();
        if low.contains("antminer") {
            r.vendor = Some(Vendor::Antminer);
        } else if low.contains("whatsminer") {
            r.vendor = Some(Vendor::Whatsminer);
        } else if low.contains("avalon") || low.contains("canaan") {
            r.vendor = Some(Vendor::Avalonminer);
        } else if low.contains("iceriver") {
            r.vendor = Some(Vendor::Iceriver);
        } else if low.contains("elphapex") {
            r.vendor = Some(Vendor::Elphapex);
        }
    }
    if let Ok(Value::Object(m)) = serde_json::from_str::<Value>(body) {
        if r.model.is_empty() {
            if let Some(model) = pick_str(&m, &["model", "Model"]) {
                r.model = model;
            }
        }
        if r.firmware.is_empty() {
            if let Some(fw) = pick_str(&m, &["firmware", "Firmware"]) {
                r.firmware = fw;
            }
        }
    }
}

/// Try the built-in defaults against the stock CGI paths with Basic auth
/// and learn from the first non-empty body that is not an auth rejection.
pub async fn sniff_with_defaults(client: &Client, r: &mut ScanResult) {
    let scheme = if r.has_port(443) { "https" } else { "http" };
    for entry in BUILTIN_DEFAULTS {
        for &path in antminer::ENDPOINTS {
            let url = format!("{scheme}://{}{path}", r.ip);
            let resp = client
                .get(&url)
                .basic_auth(entry.username, Some(entry.password))
                .send()
                .await;
            let mut resp = match resp {
                Ok(resp) => resp,
                Err(_) => continue,
            };
            if matches!(resp.status(), StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
                continue;
            }
            let body = read_head(&mut resp, DEFAULTS_BODY_LIMIT).await.unwrap_or_default();
            if body.trim().is_empty() {
                continue;
            }
            tracing::debug!(ip = %r.ip, path, "Default credentials answered");
            apply_authed_body(r, &body);
            return;
        }
    }
}

// ── Confidence ────────────────────────────────────────────────────

/// How sure we are that `r` is a mining device, 0..=100.
pub fn score(r: &ScanResult) -> u8 {
    let web = has_web_port(r);
    let mut score: u32 = 0;
    match r.vendor {
        Some(Vendor::Asic) => score += 15,
        Some(_) => score += 40,
        None => {}
    }
    if r.vendor == Some(Vendor::Antminer) && web {
        score += 15;
    }
    if r.has_port(MINER_API_PORT) {
        score += 35;
    }
    if web {
        score += 10;
    }
    if !r.telemetry.worker.is_empty() {
        score += 10;
    }
    if r.telemetry.hashrate_ths > 0.0 {
        score += 5;
    }
    score.min(100) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::TcpListener;
    use warp::Filter;

    const IP: Ipv4Addr = Ipv4Addr::LOCALHOST;

    fn result(ports: &[u16]) -> ScanResult {
        let mut r = ScanResult::new(IP);
        r.online = true;
        r.open_ports = ports.to_vec();
        r
    }

    #[test]
    fn test_banner_signatures() {
        let mut r = result(&[80]);
        apply_banner(&mut r, "", "<title>WhatsMiner</title>");
        assert_eq!(r.vendor, Some(Vendor::Whatsminer));

        let mut r = result(&[80]);
        apply_banner(&mut r, "", r#"<meta name="firmware" content="AnthillOS">"#);
        assert_eq!(r.vendor, Some(Vendor::Antminer));
        assert_eq!(r.firmware, "AnthillOS");

        let mut r = result(&[80]);
        apply_banner(&mut r, "lighttpd", "<html>Canaan Avalon</html>");
        assert_eq!(r.vendor, Some(Vendor::Avalonminer));

        let mut r = result(&[80]);
        apply_banner(&mut r, "antMiner httpd", "<html></html>");
        assert_eq!(r.vendor, Some(Vendor::Antminer));
    }

    #[test]
    fn test_generic_token_does_not_override_vendor() {
        let mut r = result(&[80]);
        apply_banner(&mut r, "", "powered by cgminer");
        assert_eq!(r.vendor, Some(Vendor::Asic));

        let mut r = result(&[80]);
        r.vendor = Some(Vendor::Whatsminer);
        apply_banner(&mut r, "", "bmminer status");
        assert_eq!(r.vendor, Some(Vendor::Whatsminer));
    }

    #[test]
    fn test_summary_hashrate_priority() {
        let mut r = result(&[4028]);
        apply_summary(
            &mut r,
            &json!({"SUMMARY": [{"Elapsed": 3600, "GHS 5s": "95000.5", "MHS av": 1}]}),
        );
        assert_eq!(r.telemetry.uptime_s, 3600);
        assert!((r.telemetry.hashrate_ths - 95.0005).abs() < 1e-9);

        let mut r = result(&[4028]);
        apply_summary(&mut r, &json!({"SUMMARY": [{"MHS av": 14_000_000.0}]}));
        assert!((r.telemetry.hashrate_ths - 14.0).abs() < 1e-9);
    }

    #[test]
    fn test_pools_and_devs() {
        let mut r = result(&[4028]);
        apply_pools(&mut r, &json!({"POOLS": [{"User": " "}, {"User": "acct.rig7"}]}));
        assert_eq!(r.telemetry.worker, "acct.rig7");

        apply_devs(&mut r, &json!({"DEVS": [{"Name": "BTM_SOC", "Description": "x"}]}));
        assert_eq!(r.model, "BTM_SOC");

        // Never replaces a known model.
        apply_devs(&mut r, &json!({"DEVS": [{"Model": "S9"}]}));
        assert_eq!(r.model, "BTM_SOC");
    }

    #[test]
    fn test_stats_series_and_identity() {
        let mut r = result(&[4028]);
        apply_stats(
            &mut r,
            &json!({"STATS": [
                {"BMMiner Version": "2.0.0", "Type": "Antminer S19"},
                {"fan1": 6000, "fan2": 0, "fan3": 6120, "temp1": 0, "temp2": 61.5, "temp3": 63, "temp_max": 70, "fan_num": 4}
            ]}),
        );
        assert_eq!(r.firmware, "2.0.0");
        assert_eq!(r.model, "Antminer S19");
        assert_eq!(r.telemetry.fans_rpm, vec![6000, 0, 6120]);
        assert_eq!(r.telemetry.temps_c, vec![61.5, 63.0]);
    }

    #[test]
    fn test_soc_placeholder_resolved_by_chip() {
        let mut r = result(&[4028]);
        r.model = "BHB SOC".to_string();
        r.telemetry.hashrate_ths = 234.0;
        apply_stats(&mut r, &json!({"STATS": [{"Chip Type": "bm1370"}]}));
        assert_eq!(r.model, "S21 Pro");

        assert_eq!(model_from_chip("SOC", "BM1370", 200.0), Some("S21"));
        assert_eq!(model_from_chip("SOC", "BM1397AG", 0.0), Some("S19"));
        assert_eq!(model_from_chip("S19", "BM1397", 0.0), None);
        assert_eq!(model_from_chip("SOC", "", 0.0), None);
    }

    #[test]
    fn test_authed_body_hints() {
        let mut r = result(&[80]);
        apply_authed_body(&mut r, r#"{"model": "M30S++", "firmware": "20220101", "brand": "whatsminer"}"#);
        assert_eq!(r.vendor, Some(Vendor::Whatsminer));
        assert_eq!(r.model, "M30S++");
        assert_eq!(r.firmware, "20220101");
    }

    #[test]
    fn test_score_weights() {
        let mut r = result(&[80, 4028]);
        r.vendor = Some(Vendor::Antminer);
        r.telemetry.worker = "w".to_string();
        r.telemetry.hashrate_ths = 1.0;
        assert_eq!(score(&r), 100);

        let mut r = result(&[4028]);
        r.vendor = Some(Vendor::Asic);
        assert_eq!(score(&r), 50);

        let mut r = result(&[80]);
        r.vendor = Some(Vendor::Antminer);
        assert_eq!(score(&r), 65);
        assert!(score(&r) >= ASIC_THRESHOLD);

        assert_eq!(score(&result(&[22])), 0);
        assert_eq!(score(&result(&[443])), 10);
    }

    #[tokio::test]
    async fn test_sniff_http_reads_banner() {
        let route = warp::path::end().map(|| {
            warp::reply::with_header(
                warp::reply::html("<html><head><title>IceRiver KS5</title></head></html>"),
                "server",
                "lighttpd",
            )
        });
        let (addr, server) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);

        let client = Client::builder().timeout(Duration::from_secs(2)).build().unwrap();
        let mut r = result(&[80]);
        sniff_http(&client, &format!("http://{addr}/"), &mut r).await;
        assert_eq!(r.vendor, Some(Vendor::Iceriver));
    }

    #[tokio::test]
    async fn test_miner_command_strips_nul() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut req = [0u8; 256];
            let n = sock.read(&mut req).await.unwrap();
            assert_eq!(&req[..n], br#"{"command":"summary"}"#);
            sock.write_all(b"{\"SUMMARY\":[{\"Elapsed\":42,\"GHS av\":2000}]}\0")
                .await
                .unwrap();
        });

        let reply = miner_command(IP, port, "summary").await.unwrap();
        let mut r = result(&[4028]);
        apply_summary(&mut r, &reply);
        assert_eq!(r.telemetry.uptime_s, 42);
        assert!((r.telemetry.hashrate_ths - 2.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_miner_command_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        assert!(miner_command(IP, port, "summary").await.is_none());
    }
}
