//! Whatsminer CGI prober. Basic auth only.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use rigscout_core::{CredentialCandidate, Facts, ProbeResult, Scheme};

use crate::error::{EndpointError, Result};
use crate::extract::{self, HashUnit, Synonyms};
use crate::http::{self, Auth, ProbeCtx};
use crate::select::{self, Attempt, VendorProber};

pub const ENDPOINTS: &[&str] = &[
    "/cgi-bin/get_miner_status.cgi",
    "/cgi-bin/get_system_info.cgi",
    "/cgi-bin/summary.cgi",
];

const CONNECT_TIMEOUT: Duration = Duration::from_millis(1800);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(4);
const REQUEST_TIMEOUT: Duration = Duration::from_millis(2500);

const SYNONYMS: Synonyms = Synonyms {
    model: &["model", "type", "miner_type", "product", "miner_model"],
    worker: &[],
    uptime: &["uptime", "elapsed", "elapsed_s", "uptime_s"],
    hashrate: &["hashrate", "rate_5s", "hashrate_5s", "hashrate5s", "mhs av", "mhs 5s", "ghs 5s"],
    hash_unit: &["rate_unit", "unit", "hashrate_unit"],
    // Unlabelled Whatsminer rates are MH/s.
    default_unit: HashUnit::Mh,
    fans: &["fan", "fans", "fan_rpm", "fans_rpm"],
    temps: &["temp", "temps", "temp_chip", "temperature", "temperatures"],
};

pub struct WhatsminerProber {
    client: Client,
}

impl WhatsminerProber {
    pub fn new() -> Result<Self> {
        let client = http::client_builder(CONNECT_TIMEOUT, CLIENT_TIMEOUT).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl VendorProber for WhatsminerProber {
    fn name(&self) -> &'static str {
        "whatsminer"
    }

    fn default_error(&self) -> &'static str {
        "no whatsminer json endpoints succeeded"
    }

    async fn attempt(
        &self,
        ctx: &ProbeCtx,
        host: &str,
        cred: &CredentialCandidate,
        scheme: Scheme,
    ) -> ProbeResult {
        let mut attempt = Attempt::new(scheme, cred);
        for path in ENDPOINTS {
            let url = format!("{scheme}://{host}{path}");
            let auth = if cred.has_auth() {
                Auth::Basic(&cred.username, &cred.password)
            } else {
                Auth::None
            };
            let fetched = match http::get(&self.client, &url, auth, ctx.bounded(REQUEST_TIMEOUT), ctx).await {
                Ok(f) => f,
                Err(EndpointError::Cancelled) => {
                    attempt.fail(EndpointError::Cancelled);
                    break;
                }
                Err(e) => {
                    attempt.fail(e);
                    continue;
                }
            };
            match http::classify(&fetched) {
                Ok(v) => attempt.json(path, v, &fetched.body),
                Err(EndpointError::Forbidden) => attempt.fail(EndpointError::Unauthorized),
                Err(e) => {
                    if matches!(e, EndpointError::Html | EndpointError::NonJson) {
                        attempt.raw(path, &fetched.body);
                    }
                    attempt.fail(e);
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

pub fn extract_facts(result: &ProbeResult) -> Facts {
    extract::extract_generic(select::in_order(result, ENDPOINTS), &SYNONYMS)
}

pub fn score(result: &ProbeResult, facts: &Facts) -> i32 {
    if !result.ok {
        return -1;
    }
    let t = &facts.telemetry;
    let mut s = result.responses.len() as i32 * 10;
    if !facts.model.is_empty() {
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

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;
    use warp::Filter;

    #[test]
    fn test_extract_defaults_to_megahash() {
        let mut r = ProbeResult {
            ok: true,
            ..Default::default()
        };
        r.responses.insert(
            ENDPOINTS[0].to_string(),
            json!({"Msg": {"MHS av": "98000000", "Elapsed": 86400, "temperature": [72.5, 70.1]}}),
        );
        r.responses.insert(
            ENDPOINTS[1].to_string(),
            json!({"Msg": {"miner_type": "M50S", "fan_rpm": [5400, 5520]}}),
        );

        let f = extract_facts(&r);
        assert_eq!(f.model, "M50S");
        assert_eq!(f.telemetry.hashrate_ths, 98.0);
        assert_eq!(f.telemetry.uptime_s, 86400);
        assert_eq!(f.telemetry.fans_rpm, vec![5400, 5520]);
        assert_eq!(f.telemetry.temps_c, vec![72.5, 70.1]);
        assert!(f.mac.is_empty());
        assert_eq!(score(&r, &f), 20 + 15 + 20 + 10 + 10 + 10);
    }

    #[test]
    fn test_extract_labelled_unit() {
        let mut r = ProbeResult {
            ok: true,
            ..Default::default()
        };
        r.responses.insert(
            ENDPOINTS[2].to_string(),
            json!({"hashrate": 112.4, "hashrate_unit": "TH/s"}),
        );
        assert_eq!(extract_facts(&r).telemetry.hashrate_ths, 112.4);
    }

    #[tokio::test]
    async fn test_forbidden_reports_unauthorized() {
        let route = warp::any().map(|| warp::reply::with_status("", warp::http::StatusCode::FORBIDDEN));
        let (addr, server) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);

        let prober = WhatsminerProber::new().unwrap();
        let ctx = ProbeCtx::new(Duration::from_secs(10), CancellationToken::new());
        let creds = vec![CredentialCandidate::new("site", "admin", "admin")];
        let res = prober.probe(&ctx, &addr.to_string(), &creds, &[Scheme::Http]).await;

        assert!(!res.ok);
        assert_eq!(res.error, "unauthorized");
    }

    #[tokio::test]
    async fn test_probe_collects_json() {
        let status = warp::path!("cgi-bin" / "get_miner_status.cgi")
            .map(|| r#"{"Code":131,"Msg":{"summary":{"MHS 5s":102000000,"Elapsed":500}}}"#);
        let fallback = warp::any().map(|| warp::reply::with_status("", warp::http::StatusCode::NOT_FOUND));
        let (addr, server) = warp::serve(status.or(fallback)).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);

        let prober = WhatsminerProber::new().unwrap();
        let ctx = ProbeCtx::new(Duration::from_secs(10), CancellationToken::new());
        let res = prober
            .probe(&ctx, &addr.to_string(), &[CredentialCandidate::no_auth()], &[Scheme::Http])
            .await;

        assert!(res.ok);
        assert_eq!(res.used_cred, "no-auth");
        let f = prober.extract(&res);
        assert_eq!(f.telemetry.hashrate_ths, 102.0);
        assert_eq!(f.telemetry.uptime_s, 500);
    }
}
