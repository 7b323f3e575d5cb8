//! Stock Antminer CGI prober.
//!
//! Three JSON endpoints behind Basic auth, with a one-shot Digest retry when
//! the server answers 401 with a Digest challenge (lighttpd builds).

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{Map, Value};

use rigscout_core::{CredentialCandidate, Facts, ProbeResult, Scheme};

use crate::digest::DigestChallenge;
use crate::error::{EndpointError, Result};
use crate::extract::{self, HashUnit};
use crate::http::{self, Auth, ProbeCtx};
use crate::select::{Attempt, VendorProber};

pub const SYSTEM_INFO: &str = "/cgi-bin/get_system_info.cgi";
pub const SUMMARY: &str = "/cgi-bin/summary.cgi";
pub const STATS: &str = "/cgi-bin/stats.cgi";
pub const ENDPOINTS: &[&str] = &[SYSTEM_INFO, SUMMARY, STATS];

const CONNECT_TIMEOUT: Duration = Duration::from_millis(1400);
const CLIENT_TIMEOUT: Duration = Duration::from_millis(3500);
const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_millis(2400);
const HTTPS_REQUEST_TIMEOUT: Duration = Duration::from_millis(3200);

const MODEL_KEYS: &[&str] = &["model", "Model", "miner_type", "type", "minerType", "minertype"];
const FIRMWARE_KEYS: &[&str] = &["fw_ver", "firmware", "Firmware", "version", "miner_version", "minerVersion"];
const MAC_KEYS: &[&str] = &["mac", "Mac", "macaddr", "mac_addr", "mac_address", "MAC", "MacAddr"];
const MAC_DEEP_KEYS: &[&str] = &["mac", "macaddr", "mac_address", "macaddr0", "mac0"];
const UPTIME_KEYS: &[&str] = &["Elapsed", "elapsed", "uptime", "Uptime", "time"];
const WORKER_KEYS: &[&str] = &["user", "pooluser", "pool_user", "miner_user", "worker", "username"];

/// Model families recovered from raw bodies when the reported model is a
/// placeholder. Checked in order; the first hit wins.
const MODEL_FAMILIES: &[(&[&str], &str)] = &[
    (&["S21 PRO"], "Antminer S21 Pro"),
    (&[" S21"], "Antminer S21"),
    (&[" S19"], "Antminer S19"),
    (&[" L7"], "Antminer L7"),
    (&[" KS5 PRO", " KS5PRO"], "Antminer KS5 Pro"),
    (&[" KS5"], "Antminer KS5"),
];

pub struct StockCgiProber {
    client: Client,
}

impl StockCgiProber {
    pub fn new() -> Result<Self> {
        let client = http::client_builder(CONNECT_TIMEOUT, CLIENT_TIMEOUT).build()?;
        Ok(Self { client })
    }

    async fn fetch(
        &self,
        ctx: &ProbeCtx,
        url: &str,
        path: &str,
        cred: &CredentialCandidate,
        base: Duration,
    ) -> std::result::Result<(Value, String), (EndpointError, Option<String>)> {
        let auth = if cred.has_auth() {
            Auth::Basic(&cred.username, &cred.password)
        } else {
            Auth::None
        };
        let fetched = http::get(&self.client, url, auth, ctx.request_timeout(base), ctx)
            .await
            .map_err(|e| (e, None))?;

        if fetched.status == StatusCode::UNAUTHORIZED {
            let challenge = fetched.challenge.as_deref().and_then(DigestChallenge::parse);
            if let (Some(ch), false) = (challenge, cred.username.is_empty()) {
                let header = ch.authorization(&cred.username, &cred.password, "GET", path);
                let retry = http::get(
                    &self.client,
                    url,
                    Auth::Header(header),
                    ctx.request_timeout(base),
                    ctx,
                )
                .await;
                if let Ok(second) = retry {
                    if second.status.is_success() {
                        if let Ok(v) = http::parse_json_body(&second.body) {
                            return Ok((v, second.body));
                        }
                    }
                }
            }
            return Err((EndpointError::Unauthorized, None));
        }

        match http::classify(&fetched) {
            Ok(v) => Ok((v, fetched.body)),
            Err(e @ (EndpointError::Html | EndpointError::NonJson)) => Err((e, Some(fetched.body))),
            Err(e) => Err((e, None)),
        }
    }
}

#[async_trait]
impl VendorProber for StockCgiProber {
    fn name(&self) -> &'static str {
        "antminer"
    }

    fn default_error(&self) -> &'static str {
        "no endpoints succeeded (auth/blocked/offline)"
    }

    async fn attempt(
        &self,
        ctx: &ProbeCtx,
        host: &str,
        cred: &CredentialCandidate,
        scheme: Scheme,
    ) -> ProbeResult {
        let base = match scheme {
            Scheme::Http => HTTP_REQUEST_TIMEOUT,
            Scheme::Https => HTTPS_REQUEST_TIMEOUT,
        };
        let mut attempt = Attempt::new(scheme, cred);

        for path in ENDPOINTS {
            let url = format!("{scheme}://{host}{path}");
            match self.fetch(ctx, &url, path, cred, base).await {
                Ok((value, body)) => attempt.json(path, value, &body),
                Err((err, body)) => {
                    if let Some(body) = body {
                        attempt.raw(path, &body);
                    }
                    let stop = matches!(err, EndpointError::Cancelled);
                    attempt.fail(err);
                    if stop {
                        break;
                    }
                }
            }
        }
        attempt.finish()
    }

    fn extract(&self, result: &ProbeResult) -> Facts {
        extract_facts(result)
    }

    fn score(&self, result: &ProbeResult) -> i32 {
        score(result, &extract_facts(result))
    }
}

/// `-1` when not OK, else 10 per JSON endpoint plus per-fact bonuses.
pub fn score(result: &ProbeResult, facts: &Facts) -> i32 {
    if !result.ok {
        return -1;
    }
    let t = &facts.telemetry;
    let mut s = result.responses.len() as i32 * 10;
    if !facts.mac.is_empty() {
        s += 25;
    }
    if !facts.model.is_empty() {
        s += 10;
    }
    if !facts.firmware.is_empty() {
        s += 10;
    }
    if !t.worker.is_empty() {
        s += 15;
    }
    if t.hashrate_ths > 0.0 {
        s += 20;
    }
    if t.uptime_s > 0 {
        s += 10;
    }
    if !t.fans_rpm.is_empty() {
        s += 10;
    }
    if !t.temps_c.is_empty() {
        s += 10;
    }
    s
}

fn info_type(v: Option<&Value>) -> Option<String> {
    v?.get("INFO")?
        .get("type")?
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Facts from stock CGI responses.
pub fn extract_facts(result: &ProbeResult) -> Facts {
    let mut f = Facts::default();
    let summary = result.responses.get(SUMMARY);
    let stats = result.responses.get(STATS);

    if let Some(model) = info_type(summary).or_else(|| info_type(stats)) {
        f.model = model;
    }

    if let Some(info) = result.responses.get(SYSTEM_INFO).and_then(Value::as_object) {
        if let Some(model) = extract::pick_str(info, MODEL_KEYS) {
            f.model = model;
        }
        f.firmware = extract::pick_str(info, FIRMWARE_KEYS).unwrap_or_default();
        let mac = extract::pick_str(info, MAC_KEYS)
            .or_else(|| extract::find_str(&Value::Object(info.clone()), MAC_DEEP_KEYS))
            .unwrap_or_default();
        f.mac = extract::normalize_mac(&mac);
    }

    if f.model.is_empty() || f.model.to_uppercase().contains("SOC") {
        if let Some(model) = model_from_raw(&result.raw) {
            f.model = model.to_string();
        }
    }

    if let Some(summary) = summary.and_then(Value::as_object) {
        let obj = summary
            .get("SUMMARY")
            .and_then(extract::first_object)
            .unwrap_or(summary);
        f.telemetry.uptime_s = extract::pick_u64(obj, UPTIME_KEYS);
        f.telemetry.hashrate_ths = summary_hashrate(obj);
    }

    if let Some(stats) = stats.and_then(Value::as_object) {
        apply_stats(&mut f, stats);
    }

    f
}

fn model_from_raw(raw: &BTreeMap<String, String>) -> Option<&'static str> {
    let haystack: String = raw.values().map(|v| format!(" {}", v.to_uppercase())).collect();
    MODEL_FAMILIES
        .iter()
        .find(|(needles, _)| needles.iter().any(|n| haystack.contains(n)))
        .map(|(_, model)| *model)
}

fn summary_hashrate(obj: &Map<String, Value>) -> f64 {
    if let Some(v) = obj.get("rate_5s") {
        let unit = obj.get("rate_unit").and_then(Value::as_str).unwrap_or("");
        return HashUnit::infer(unit, HashUnit::Gh).to_ths(extract::to_f64(v));
    }
    let tagged = [
        ("GHS 5s", HashUnit::Gh),
        ("GHS av", HashUnit::Gh),
        ("MHS 5s", HashUnit::Mh),
        ("MHS av", HashUnit::Mh),
        ("hashrate", HashUnit::Th),
    ];
    tagged
        .iter()
        .find_map(|(key, unit)| obj.get(*key).map(|v| unit.to_ths(extract::to_f64(v))))
        .unwrap_or(0.0)
}

fn apply_stats(f: &mut Facts, stats: &Map<String, Value>) {
    let root = Value::Object(stats.clone());
    f.telemetry.worker = extract::find_str(&root, WORKER_KEYS).unwrap_or_default();

    let maps = match stats.get("STATS") {
        Some(v) => extract::objects(v),
        None => vec![stats],
    };

    let mut fans: BTreeMap<usize, u32> = BTreeMap::new();
    let mut temps: BTreeMap<usize, f64> = BTreeMap::new();
    for m in maps {
        if let Some(Value::Array(arr)) = m.get("fan") {
            for (i, x) in arr.iter().enumerate() {
                fans.insert(i + 1, extract::to_u64(x) as u32);
            }
        }
        if let Some(Value::Array(chains)) = m.get("chain") {
            for chain in chains {
                let max_chip = chain
                    .get("temp_chip")
                    .and_then(Value::as_array)
                    .map(|ts| ts.iter().map(extract::to_f64).fold(0.0, f64::max))
                    .unwrap_or(0.0);
                if max_chip > 0.0 {
                    temps.insert(temps.len() + 1, max_chip);
                }
            }
        }
        for (k, v) in m {
            if let Some(n) = extract::suffix_index(k, "fan") {
                fans.insert(n, extract::to_u64(v) as u32);
            }
            if let Some(n) = extract::suffix_index(k, "temp") {
                temps.insert(n, extract::to_f64(v));
            }
        }
    }

    f.telemetry.fans_rpm = extract::dense(&fans, 1, 8);
    f.telemetry.temps_c = extract::dense(&temps, 1, 12);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;
    use warp::Filter;

    fn result_with(responses: Vec<(&str, Value)>) -> ProbeResult {
        let mut r = ProbeResult {
            ok: true,
            ..Default::default()
        };
        for (path, v) in responses {
            r.raw.insert(path.to_string(), v.to_string());
            r.responses.insert(path.to_string(), v);
        }
        r
    }

    #[test]
    fn test_extract_stock_responses() {
        let r = result_with(vec![
            (
                SYSTEM_INFO,
                json!({"minertype": "Antminer S19j Pro", "fw_ver": "Tue Feb 27 2024", "macaddr": "AA-BB-CC-DD-EE-01"}),
            ),
            (
                SUMMARY,
                json!({"INFO": {"type": "Antminer S19j Pro"}, "SUMMARY": [{"elapsed": 7200, "rate_5s": 104000.5, "rate_unit": "GH/s"}]}),
            ),
            (
                STATS,
                json!({"STATS": [{"fan": [5880, 5940, 6000, 6060], "chain": [{"temp_chip": [60, 71, 68]}, {"temp_chip": [58, 66]}]}],
                       "POOLS": [{"user": "farm.rig42"}]}),
            ),
        ]);

        let f = extract_facts(&r);
        assert_eq!(f.model, "Antminer S19j Pro");
        assert_eq!(f.firmware, "Tue Feb 27 2024");
        assert_eq!(f.mac, "aa:bb:cc:dd:ee:01");
        assert_eq!(f.telemetry.uptime_s, 7200);
        assert!((f.telemetry.hashrate_ths - 104.0005).abs() < 1e-9);
        assert_eq!(f.telemetry.fans_rpm, vec![5880, 5940, 6000, 6060]);
        assert_eq!(f.telemetry.temps_c, vec![71.0, 66.0]);
        assert_eq!(f.telemetry.worker, "farm.rig42");

        // 3 endpoints + mac/model/firmware/worker/hashrate/uptime/fans/temps.
        assert_eq!(score(&r, &f), 30 + 25 + 10 + 10 + 15 + 20 + 10 + 10 + 10);
    }

    #[test]
    fn test_extract_legacy_cgminer_keys() {
        let r = result_with(vec![
            (SUMMARY, json!({"SUMMARY": [{"Elapsed": 3600, "GHS 5s": "13500.2"}]})),
            (STATS, json!({"STATS": [{"Type": "Antminer S9"}, {"fan3": 4200, "fan6": 4320, "temp2": 58, "temp_num": 3}]})),
        ]);
        let f = extract_facts(&r);
        assert_eq!(f.telemetry.uptime_s, 3600);
        assert!((f.telemetry.hashrate_ths - 13.5002).abs() < 1e-9);
        assert_eq!(f.telemetry.fans_rpm, vec![4200, 4320]);
        assert_eq!(f.telemetry.temps_c, vec![58.0]);
    }

    #[test]
    fn test_soc_placeholder_recovers_model_from_raw() {
        let mut r = result_with(vec![(SYSTEM_INFO, json!({"minertype": "Antminer SOC"}))]);
        r.raw.insert(SUMMARY.to_string(), "{\"info\":\"Antminer S21 Pro 234T\"}".to_string());
        assert_eq!(extract_facts(&r).model, "Antminer S21 Pro");

        let mut r = result_with(vec![]);
        r.raw.insert(STATS.to_string(), "miner KS5PRO".to_string());
        assert_eq!(extract_facts(&r).model, "Antminer KS5 Pro");
    }

    #[test]
    fn test_score_not_ok() {
        let r = ProbeResult::failed("unauthorized");
        assert_eq!(score(&r, &Facts::default()), -1);
    }

    fn creds() -> Vec<CredentialCandidate> {
        vec![CredentialCandidate::new("stock:root/root", "root", "root")]
    }

    #[tokio::test]
    async fn test_probe_basic_auth_against_server() {
        let system_info = warp::path!("cgi-bin" / "get_system_info.cgi")
            .and(warp::header::optional::<String>("authorization"))
            .map(|auth: Option<String>| {
                // "root:root" in base64.
                if auth.as_deref() == Some("Basic cm9vdDpyb290") {
                    warp::reply::with_status(
                        r#"{"minertype":"Antminer S19","macaddr":"AA:BB:CC:00:00:01","fw_ver":"2022"}"#.to_string(),
                        warp::http::StatusCode::OK,
                    )
                } else {
                    warp::reply::with_status(String::new(), warp::http::StatusCode::UNAUTHORIZED)
                }
            });
        let summary = warp::path!("cgi-bin" / "summary.cgi")
            .map(|| r#"{"SUMMARY":[{"elapsed":100,"rate_5s":95000,"rate_unit":"GH/s"}]}"#);
        let stats = warp::path!("cgi-bin" / "stats.cgi").map(|| "<!DOCTYPE html><html></html>");

        let (addr, server) =
            warp::serve(system_info.or(summary).or(stats)).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);

        let prober = StockCgiProber::new().unwrap();
        let ctx = ProbeCtx::new(Duration::from_secs(10), CancellationToken::new());
        let res = prober
            .probe(&ctx, &addr.to_string(), &creds(), &[Scheme::Http])
            .await;

        assert!(res.ok, "{}", res.error);
        assert_eq!(res.used_cred, "stock:root/root");
        assert_eq!(res.responses.len(), 2);
        assert!(res.raw[STATS].starts_with("<!DOCTYPE"));

        let f = prober.extract(&res);
        assert_eq!(f.model, "Antminer S19");
        assert_eq!(f.mac, "aa:bb:cc:00:00:01");
        assert_eq!(f.telemetry.hashrate_ths, 95.0);
    }

    #[tokio::test]
    async fn test_probe_digest_fallback() {
        let route = warp::path!("cgi-bin" / String)
            .and(warp::header::optional::<String>("authorization"))
            .map(|_page: String, auth: Option<String>| {
                let ok = auth.as_deref().is_some_and(|a| {
                    a.starts_with("Digest username=\"root\"") && a.contains("realm=\"antMiner Configuration\"")
                });
                if ok {
                    warp::http::Response::builder()
                        .status(200)
                        .body(r#"{"INFO":{"type":"Antminer L7"}}"#.to_string())
                        .unwrap()
                } else {
                    warp::http::Response::builder()
                        .status(401)
                        .header(
                            "www-authenticate",
                            "Digest realm=\"antMiner Configuration\", nonce=\"5f1c\", qop=\"auth\"",
                        )
                        .body(String::new())
                        .unwrap()
                }
            });
        let (addr, server) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);

        let prober = StockCgiProber::new().unwrap();
        let ctx = ProbeCtx::new(Duration::from_secs(10), CancellationToken::new());
        let res = prober
            .attempt(&ctx, &addr.to_string(), &creds()[0], Scheme::Http)
            .await;

        assert!(res.ok);
        assert_eq!(res.responses.len(), 3);
        assert_eq!(prober.extract(&res).model, "Antminer L7");
    }

    #[tokio::test]
    async fn test_probe_html_only_is_failure() {
        let route = warp::any().map(|| warp::reply::html("<html><body>app</body></html>"));
        let (addr, server) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);

        let prober = StockCgiProber::new().unwrap();
        let ctx = ProbeCtx::new(Duration::from_secs(10), CancellationToken::new());
        let res = prober
            .probe(&ctx, &addr.to_string(), &creds(), &[Scheme::Http])
            .await;

        assert!(!res.ok);
        assert_eq!(res.error, "html response (no json api)");
    }
}
