//! Shared HTTP plumbing for the vendor probers.
//!
//! Miner web stacks break on reused connections, so every client here keeps
//! no idle connections and every request carries `Connection: close`.

use std::time::Duration;

use reqwest::header::{ACCEPT, AUTHORIZATION, CONNECTION, WWW_AUTHENTICATE};
use reqwest::{Client, ClientBuilder, RequestBuilder, Response, StatusCode};
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::EndpointError;

pub const USER_AGENT: &str = concat!("rigscout/", env!("CARGO_PKG_VERSION"));
pub const ACCEPT_JSON: &str = "application/json,text/plain;q=0.9,*/*;q=0.8";
pub const MAX_BODY_BYTES: usize = 256 * 1024;
pub const RAW_LIMIT: usize = 4096;

const MIN_REQUEST_TIMEOUT: Duration = Duration::from_millis(900);
const PARSE_HEADROOM: Duration = Duration::from_millis(400);

/// Deadline and cancellation shared by every request of one probe call.
#[derive(Debug, Clone)]
pub struct ProbeCtx {
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl ProbeCtx {
    pub fn new(budget: Duration, cancel: CancellationToken) -> Self {
        Self {
            deadline: Some(Instant::now() + budget),
            cancel,
        }
    }

    pub fn unbounded(cancel: CancellationToken) -> Self {
        Self {
            deadline: None,
            cancel,
        }
    }

    /// Time left before the deadline, `None` when unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// The reason further requests are pointless, if any.
    pub fn done(&self) -> Option<EndpointError> {
        if self.cancel.is_cancelled() {
            return Some(EndpointError::Cancelled);
        }
        match self.remaining() {
            Some(rem) if rem.is_zero() => Some(EndpointError::Timeout),
            _ => None,
        }
    }

    /// Per-request timeout derived from the remaining budget.
    ///
    /// When less than `base` plus parse headroom is left, half of the
    /// remainder is used (never below 900ms), capped by the remainder.
    pub fn request_timeout(&self, base: Duration) -> Duration {
        match self.remaining() {
            None => base,
            Some(rem) if rem < base + PARSE_HEADROOM => (rem / 2).max(MIN_REQUEST_TIMEOUT).min(rem),
            Some(_) => base,
        }
    }

    /// `base` capped by the remaining budget.
    pub fn bounded(&self, base: Duration) -> Duration {
        match self.remaining() {
            Some(rem) => base.min(rem),
            None => base,
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Client builder with the settings every prober shares.
pub fn client_builder(connect_timeout: Duration, timeout: Duration) -> ClientBuilder {
    Client::builder()
        .connect_timeout(connect_timeout)
        .timeout(timeout)
        .pool_max_idle_per_host(0)
        .http1_only()
        .danger_accept_invalid_certs(true)
        .user_agent(USER_AGENT)
}

/// How a request authenticates.
#[derive(Debug, Clone)]
pub enum Auth<'a> {
    None,
    Basic(&'a str, &'a str),
    Header(String),
}

/// A completed exchange: status, Digest challenge if any, capped body.
#[derive(Debug, Clone)]
pub struct Fetched {
    pub status: StatusCode,
    pub challenge: Option<String>,
    pub body: String,
}

pub async fn get(
    client: &Client,
    url: &str,
    auth: Auth<'_>,
    timeout: Duration,
    ctx: &ProbeCtx,
) -> Result<Fetched, EndpointError> {
    let mut req = client
        .get(url)
        .timeout(timeout)
        .header(CONNECTION, "close")
        .header(ACCEPT, ACCEPT_JSON);
    match auth {
        Auth::None => {}
        Auth::Basic(user, pass) => req = req.basic_auth(user, Some(pass)),
        Auth::Header(value) => req = req.header(AUTHORIZATION, value),
    }
    send(req, ctx).await
}

/// Send a prepared request, racing it against the probe's cancellation.
pub async fn send(req: RequestBuilder, ctx: &ProbeCtx) -> Result<Fetched, EndpointError> {
    if let Some(reason) = ctx.done() {
        return Err(reason);
    }
    let exchange = async {
        let mut resp = req.send().await?;
        let status = resp.status();
        let challenge = resp
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = read_capped(&mut resp, MAX_BODY_BYTES).await?;
        Ok::<Fetched, EndpointError>(Fetched {
            status,
            challenge,
            body,
        })
    };
    tokio::select! {
        _ = ctx.cancel.cancelled() => Err(EndpointError::Cancelled),
        res = exchange => res,
    }
}

async fn read_capped(resp: &mut Response, limit: usize) -> Result<String, reqwest::Error> {
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

/// Map an exchange to parsed JSON or the reason it is not usable.
pub fn classify(fetched: &Fetched) -> Result<Value, EndpointError> {
    match fetched.status {
        StatusCode::UNAUTHORIZED => return Err(EndpointError::Unauthorized),
        StatusCode::FORBIDDEN => return Err(EndpointError::Forbidden),
        s if !s.is_success() => return Err(EndpointError::Status(s.to_string())),
        _ => {}
    }
    parse_json_body(&fetched.body)
}

pub fn parse_json_body(body: &str) -> Result<Value, EndpointError> {
    let body = body.trim();
    if body.is_empty() {
        return Err(EndpointError::EmptyBody);
    }
    if is_html(body) {
        return Err(EndpointError::Html);
    }
    serde_json::from_str(sanitize(body)).map_err(|_| EndpointError::NonJson)
}

pub fn is_html(body: &str) -> bool {
    let head: String = body
        .trim_start()
        .chars()
        .take(16)
        .collect::<String>()
        .to_ascii_lowercase();
    head.starts_with("<!doctype html") || head.starts_with("<html")
}

/// Drop junk some firmwares print before the JSON document.
pub fn sanitize(body: &str) -> &str {
    match body.find(['{', '[']) {
        Some(idx) => body[idx..].trim(),
        None => body,
    }
}

/// Raw body kept for diagnostics, cut at `RAW_LIMIT` bytes.
pub fn truncate_raw(body: &str) -> String {
    let body = body.trim();
    if body.len() <= RAW_LIMIT {
        return body.to_string();
    }
    let mut end = RAW_LIMIT;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &body[..end])
}

/// Firmware flavor named by an HTML `<meta name="firmware">` tag.
pub fn firmware_meta(body: &str) -> Option<&'static str> {
    let low = body.to_ascii_lowercase();
    if low.contains("meta name=\"firmware\"") && low.contains("anthillos") {
        Some("anthill")
    } else {
        None
    }
}
