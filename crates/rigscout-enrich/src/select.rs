//! Best-result selection across (credential × scheme) combinations.
//!
//! All vendor probers share one shape: try a bounded endpoint set per
//! combination, score each attempt with a pure per-vendor function and keep
//! the best. A combination scoring [`GOOD_ENOUGH`] ends the search early.

use async_trait::async_trait;
use serde_json::Value;

use rigscout_core::{CredentialCandidate, Facts, ProbeResult, Scheme};

use crate::error::EndpointError;
use crate::http::{self, ProbeCtx};

/// Score at which probing stops looking for a better combination.
pub const GOOD_ENOUGH: i32 = 70;

/// A vendor-specific authenticated prober.
#[async_trait]
pub trait VendorProber: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Error reported when no combination produced anything better.
    fn default_error(&self) -> &'static str;

    /// One (credential, scheme) attempt against `host` (`ip` or `ip:port`).
    async fn attempt(
        &self,
        ctx: &ProbeCtx,
        host: &str,
        cred: &CredentialCandidate,
        scheme: Scheme,
    ) -> ProbeResult;

    /// Normalized facts from a result's JSON responses.
    fn extract(&self, result: &ProbeResult) -> Facts;

    /// Value of a result; `-1` when it is not OK.
    fn score(&self, result: &ProbeResult) -> i32;

    /// Try every combination and return the best one.
    async fn probe(
        &self,
        ctx: &ProbeCtx,
        host: &str,
        creds: &[CredentialCandidate],
        schemes: &[Scheme],
    ) -> ProbeResult {
        probe_best(self, ctx, host, creds, schemes).await
    }
}

/// Iterate credentials (outer) and schemes (inner), keeping the highest score.
///
/// When nothing succeeds, the error of the last failing combination replaces
/// the prober's default error.
pub async fn probe_best<P>(
    prober: &P,
    ctx: &ProbeCtx,
    host: &str,
    creds: &[CredentialCandidate],
    schemes: &[Scheme],
) -> ProbeResult
where
    P: VendorProber + ?Sized,
{
    let schemes: &[Scheme] = if schemes.is_empty() { &[Scheme::Http] } else { schemes };
    let mut best = ProbeResult::failed(prober.default_error());
    let mut best_score = -1;
    let mut last_fail: Option<String> = None;

    'creds: for cred in creds {
        for &scheme in schemes {
            if let Some(reason) = ctx.done() {
                last_fail = Some(reason.to_string());
                break 'creds;
            }

            let result = prober.attempt(ctx, host, cred, scheme).await;
            let score = prober.score(&result);
            tracing::debug!(
                prober = prober.name(),
                host = %host,
                cred = %cred.name,
                scheme = %scheme,
                ok = result.ok,
                score,
                error = %result.error,
                "Probe attempt"
            );

            if score > best_score {
                best_score = score;
                best = result;
            } else if !result.ok && !result.error.is_empty() {
                last_fail = Some(result.error);
            }

            if best_score >= GOOD_ENOUGH {
                return best;
            }
        }
    }

    if !best.ok {
        if let Some(err) = last_fail {
            best.error = err;
        }
    }
    best
}

/// Accumulates endpoint outcomes for a single attempt.
#[derive(Debug)]
pub struct Attempt {
    result: ProbeResult,
    last_err: Option<EndpointError>,
}

impl Attempt {
    pub fn new(scheme: Scheme, cred: &CredentialCandidate) -> Self {
        Self {
            result: ProbeResult {
                scheme,
                used_cred: cred.name.clone(),
                ..Default::default()
            },
            last_err: None,
        }
    }

    pub fn json(&mut self, path: &str, value: Value, body: &str) {
        self.result.responses.insert(path.to_string(), value);
        self.raw(path, body);
    }

    pub fn raw(&mut self, path: &str, body: &str) {
        if !body.trim().is_empty() {
            self.result.raw.insert(path.to_string(), http::truncate_raw(body));
        }
    }

    pub fn fail(&mut self, err: EndpointError) {
        self.last_err = Some(err);
    }

    /// OK iff at least one endpoint returned JSON.
    pub fn finish(mut self) -> ProbeResult {
        self.result.ok = !self.result.responses.is_empty();
        if !self.result.ok {
            if let Some(err) = self.last_err {
                self.result.error = err.to_string();
            }
        }
        self.result
    }
}

/// JSON responses in the prober's endpoint order.
pub fn in_order<'a>(result: &'a ProbeResult, endpoints: &'a [&'a str]) -> impl Iterator<Item = &'a Value> {
    endpoints.iter().filter_map(|p| result.responses.get(*p))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio_util::sync::CancellationToken;

    /// Scripted prober: returns the queued (ok, score, error) per attempt.
    struct Scripted {
        script: Mutex<Vec<(bool, i32, &'static str)>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(script: Vec<(bool, i32, &'static str)>) -> Self {
            Self {
                script: Mutex::new(script.into_iter().rev().collect()),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl VendorProber for Scripted {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn default_error(&self) -> &'static str {
            "nothing worked"
        }

        async fn attempt(
            &self,
            _ctx: &ProbeCtx,
            _host: &str,
            cred: &CredentialCandidate,
            scheme: Scheme,
        ) -> ProbeResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let (ok, score, error) = self.script.lock().unwrap().pop().unwrap_or((false, -1, ""));
            ProbeResult {
                ok,
                scheme,
                used_cred: cred.name.clone(),
                error: error.to_string(),
                raw: [("score".to_string(), score.to_string())].into_iter().collect(),
                ..Default::default()
            }
        }

        fn extract(&self, _result: &ProbeResult) -> Facts {
            Facts::default()
        }

        fn score(&self, result: &ProbeResult) -> i32 {
            if !result.ok {
                return -1;
            }
            result.raw["score"].parse().unwrap()
        }
    }

    fn creds(n: usize) -> Vec<CredentialCandidate> {
        (0..n)
            .map(|i| CredentialCandidate::new(&format!("c{i}"), "root", "root"))
            .collect()
    }

    fn ctx() -> ProbeCtx {
        ProbeCtx::unbounded(CancellationToken::new())
    }

    #[tokio::test]
    async fn test_keeps_highest_score() {
        let p = Scripted::new(vec![(true, 20, ""), (true, 45, ""), (true, 30, "")]);
        let best = p.probe(&ctx(), "10.0.0.1", &creds(3), &[Scheme::Http]).await;
        assert!(best.ok);
        assert_eq!(best.used_cred, "c1");
        assert_eq!(p.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_stops_early_when_good_enough() {
        let p = Scripted::new(vec![(false, -1, "unauthorized"), (true, 80, ""), (true, 95, "")]);
        let best = p
            .probe(&ctx(), "10.0.0.1", &creds(2), &[Scheme::Http, Scheme::Https])
            .await;
        assert_eq!(best.used_cred, "c0");
        assert_eq!(best.scheme, Scheme::Https);
        assert_eq!(p.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_surfaces_last_failure() {
        let p = Scripted::new(vec![(false, -1, "unauthorized"), (false, -1, "html response (no json api)")]);
        let best = p.probe(&ctx(), "10.0.0.1", &creds(2), &[]).await;
        assert!(!best.ok);
        assert_eq!(best.error, "html response (no json api)");
    }

    #[tokio::test]
    async fn test_default_error_without_attempts() {
        let p = Scripted::new(vec![]);
        let best = p.probe(&ctx(), "10.0.0.1", &[], &[Scheme::Http]).await;
        assert_eq!(best.error, "nothing worked");
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let token = CancellationToken::new();
        token.cancel();
        let p = Scripted::new(vec![(true, 90, "")]);
        let best = p
            .probe(&ProbeCtx::unbounded(token), "10.0.0.1", &creds(1), &[Scheme::Http])
            .await;
        assert!(!best.ok);
        assert_eq!(best.error, "context canceled");
        assert_eq!(p.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_attempt_ok_requires_json() {
        let cred = CredentialCandidate::no_auth();
        let mut a = Attempt::new(Scheme::Http, &cred);
        a.raw("/x", "<html>");
        a.fail(EndpointError::Html);
        let r = a.finish();
        assert!(!r.ok);
        assert_eq!(r.error, "html response (no json api)");
        assert_eq!(r.raw["/x"], "<html>");

        let mut a = Attempt::new(Scheme::Http, &cred);
        a.fail(EndpointError::Unauthorized);
        a.json("/y", serde_json::json!({"a": 1}), "{\"a\":1}");
        let r = a.finish();
        assert!(r.ok);
        assert!(r.error.is_empty());
        assert_eq!(r.used_cred, "no-auth");
    }
}
