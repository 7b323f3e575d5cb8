//! Vnish / AnthillOS prober.
//!
//! These firmwares serve a single-page app and keep their data behind an
//! undocumented `/api/*` backend with a cookie session. Each credential gets
//! a fresh cookie jar, a best-effort login, then a sweep of candidate data
//! endpoints.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONNECTION};
use reqwest::redirect::Policy;
use reqwest::{Client, StatusCode};
use serde_json::json;

use rigscout_core::{CredentialCandidate, Facts, ProbeResult, Scheme};

use crate::error::{EndpointError, Result};
use crate::extract::{self, HashUnit, Synonyms};
use crate::http::{self, ProbeCtx};
use crate::select::{self, Attempt, VendorProber};

pub const DATA_ENDPOINTS: &[&str] = &[
    "/api/v1/summary",
    "/api/v1/stats",
    "/api/v1/status",
    "/api/summary",
    "/api/stats",
    "/api/status",
    "/api/miner/summary",
    "/api/miner/stats",
    "/api/system/info",
    "/api/info",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoginForm {
    Json,
    Form,
}

const LOGIN_ATTEMPTS: &[(&str, LoginForm)] = &[
    ("/api/login", LoginForm::Json),
    ("/api/v1/login", LoginForm::Json),
    ("/auth/login", LoginForm::Json),
    ("/login", LoginForm::Form),
];

const CONNECT_TIMEOUT: Duration = Duration::from_millis(1500);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(4);
const FETCH_TIMEOUT: Duration = Duration::from_millis(1600);

const SYNONYMS: Synonyms = Synonyms {
    model: &["model", "type", "miner_type", "device", "product"],
    worker: &["worker", "user", "pooluser", "username"],
    uptime: &["uptime", "elapsed", "elapsed_s", "uptime_s"],
    hashrate: &["hashrate", "rate_5s", "hashrate_5s", "hashrate5s"],
    hash_unit: &["rate_unit", "unit", "hashrate_unit"],
    default_unit: HashUnit::Gh,
    fans: &["fan", "fans", "fan_rpm", "fans_rpm"],
    temps: &["temp", "temps", "temp_chip", "temp_pcb", "temperature", "temperatures"],
};

/// Prober for SPA-style third-party firmware.
#[derive(Debug, Default)]
pub struct SpaApiProber;

impl SpaApiProber {
    pub fn new() -> Self {
        Self
    }

    /// A client with its own cookie jar that does not follow redirects, so a
    /// 302 after login is visible.
    fn session_client() -> Result<Client> {
        let client = http::client_builder(CONNECT_TIMEOUT, CLIENT_TIMEOUT)
            .cookie_store(true)
            .redirect(Policy::none())
            .build()?;
        Ok(client)
    }

    /// Try each login path until one answers 200/204/302/303.
    async fn login(&self, client: &Client, ctx: &ProbeCtx, base: &str, cred: &CredentialCandidate) -> bool {
        for (path, form) in LOGIN_ATTEMPTS {
            let url = format!("{base}{path}");
            let req = client
                .post(&url)
                .timeout(ctx.bounded(CLIENT_TIMEOUT))
                .header(CONNECTION, "close");
            let req = match form {
                LoginForm::Json => req.json(&json!({"username": cred.username, "password": cred.password})),
                LoginForm::Form => req.form(&[
                    ("username", cred.username.as_str()),
                    ("password", cred.password.as_str()),
                ]),
            };
            match http::send(req, ctx).await {
                Ok(f) if login_accepted(f.status) => return true,
                Ok(_) => {}
                Err(EndpointError::Cancelled) => return false,
                Err(_) => {}
            }
        }
        false
    }
}

/// Vendor behavior is inconsistent; any of these counts as a session.
fn login_accepted(status: StatusCode) -> bool {
    matches!(status.as_u16(), 200 | 204 | 302 | 303)
}

#[async_trait]
impl VendorProber for SpaApiProber {
    fn name(&self) -> &'static str {
        "vnish"
    }

    fn default_error(&self) -> &'static str {
        "no vnish/anthill json endpoints succeeded"
    }

    async fn attempt(
        &self,
        ctx: &ProbeCtx,
        host: &str,
        cred: &CredentialCandidate,
        scheme: Scheme,
    ) -> ProbeResult {
        let mut attempt = Attempt::new(scheme, cred);
        let client = match Self::session_client() {
            Ok(c) => c,
            Err(e) => {
                let mut res = attempt.finish();
                res.error = e.to_string();
                return res;
            }
        };

        let base = format!("{scheme}://{host}");
        let logged_in = self.login(&client, ctx, &base, cred).await;
        tracing::debug!(host = %host, cred = %cred.name, logged_in, "SPA login");

        let mut cancelled = false;
        for path in DATA_ENDPOINTS {
            let req = client
                .get(format!("{base}{path}"))
                .timeout(ctx.bounded(FETCH_TIMEOUT))
                .header(CONNECTION, "close")
                .header(ACCEPT, http::ACCEPT_JSON);
            let fetched = match http::send(req, ctx).await {
                Ok(f) => f,
                Err(EndpointError::Cancelled) => {
                    cancelled = true;
                    break;
                }
                Err(_) => continue,
            };
            if !fetched.status.is_success() {
                attempt.raw(path, &fetched.body);
                continue;
            }
            match http::parse_json_body(&fetched.body) {
                Ok(v) => attempt.json(path, v, &fetched.body),
                Err(_) => attempt.raw(path, &fetched.body),
            }
        }

        let mut res = attempt.finish();
        if let Some(kind) = res.raw.values().find_map(|body| http::firmware_meta(body)) {
            res.firmware_hint = kind.to_string();
        }
        if !res.ok {
            res.error = if cancelled {
                EndpointError::Cancelled.to_string()
            } else {
                "unauthorized or no json endpoints".to_string()
            };
        }
        res
    }

    fn extract(&self, result: &ProbeResult) -> Facts {
        extract_facts(result)
    }

    fn score(&self, result: &ProbeResult) -> i32 {
        score(result, &extract_facts(result))
    }
}

pub fn extract_facts(result: &ProbeResult) -> Facts {
    let mut f = extract::extract_generic(select::in_order(result, DATA_ENDPOINTS), &SYNONYMS);
    if !result.firmware_hint.is_empty() {
        f.firmware = result.firmware_hint.clone();
    }
    f
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
    if !facts.firmware.is_empty() {
        s += 10;
    }
    if !t.worker.is_empty() {
        s += 10;
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
