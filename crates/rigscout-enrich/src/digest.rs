//! HTTP Digest authentication (MD5, `qop=auth`).
//!
//! Only what miner web servers (mostly lighttpd) need: parse the
//! `WWW-Authenticate` challenge and answer it once.

use md5::{Digest, Md5};
use rand::Rng;

/// A parsed `WWW-Authenticate: Digest ...` challenge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub qop: String,
    pub algorithm: String,
    pub opaque: String,
}

impl DigestChallenge {
    /// Parse a challenge header. Returns `None` unless the scheme is Digest
    /// and both realm and nonce are present.
    pub fn parse(header: &str) -> Option<Self> {
        let header = header.trim();
        let scheme = header.get(..7)?;
        if !scheme.eq_ignore_ascii_case("digest ") {
            return None;
        }

        let mut challenge = Self::default();
        for part in split_params(&header[7..]) {
            let Some((key, value)) = part.split_once('=') else {
                continue;
            };
            let value = value.trim().trim_matches('"').to_string();
            match key.trim().to_ascii_lowercase().as_str() {
                "realm" => challenge.realm = value,
                "nonce" => challenge.nonce = value,
                "qop" => challenge.qop = value,
                "algorithm" => challenge.algorithm = value,
                "opaque" => challenge.opaque = value,
                _ => {}
            }
        }

        if challenge.realm.is_empty() || challenge.nonce.is_empty() {
            return None;
        }
        Some(challenge)
    }

    /// Build the `Authorization` header value with a fresh client nonce.
    pub fn authorization(&self, username: &str, password: &str, method: &str, uri: &str) -> String {
        let bytes: [u8; 8] = rand::thread_rng().gen();
        let cnonce: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
        self.authorization_with(username, password, method, uri, &cnonce, "00000001")
    }

    pub fn authorization_with(
        &self,
        username: &str,
        password: &str,
        method: &str,
        uri: &str,
        cnonce: &str,
        nc: &str,
    ) -> String {
        let ha1 = md5_hex(&format!("{username}:{}:{password}", self.realm));
        let ha2 = md5_hex(&format!("{method}:{uri}"));

        // Servers that advertise a qop without "auth" get the legacy RFC 2069 form.
        let use_qop = self.qop.is_empty() || self.qop.to_ascii_lowercase().contains("auth");
        let response = if use_qop {
            md5_hex(&format!("{ha1}:{}:{nc}:{cnonce}:auth:{ha2}", self.nonce))
        } else {
            md5_hex(&format!("{ha1}:{}:{ha2}", self.nonce))
        };

        let mut out = format!(
            "Digest username=\"{username}\", realm=\"{}\", nonce=\"{}\", uri=\"{uri}\", response=\"{response}\"",
            self.realm, self.nonce
        );
        if !self.opaque.is_empty() {
            out.push_str(&format!(", opaque=\"{}\"", self.opaque));
        }
        if use_qop {
            out.push_str(&format!(", qop=auth, nc={nc}, cnonce=\"{cnonce}\""));
        }
        out
    }
}

fn md5_hex(input: &str) -> String {
    format!("{:x}", Md5::digest(input.as_bytes()))
}

/// Split on commas that are not inside double quotes.
fn split_params(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;
    for (i, ch) in s.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(s[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(s[start..].trim());
    parts
}
