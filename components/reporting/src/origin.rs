/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Origin-only URL sanitization and the potentially-trustworthy check (spec
//! §3 invariant 1, §4.3, §6).
//!
//! This crate has no dependency on `servo_url`'s `ImmutableOrigin` (its
//! source is not part of this workspace's retrieved slice, only its test
//! suite at `components/net/tests/origin.rs`); `ReportUrl` reimplements the
//! narrow contract that test suite exercises — scheme, host, port, and a
//! potentially-trustworthy predicate — directly on top of the `url` crate.

use std::fmt;

use url::Url;

/// A URL that has been reduced to its origin: scheme, host, and port, with
/// no userinfo, path, query, or fragment (spec §3 invariant 1).
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ReportUrl(Url);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UrlSanitizeError {
    /// The URL cannot be a base (e.g. `data:`, `mailto:`) and therefore has
    /// no origin to reduce it to.
    CannotBeABase,
}

impl fmt::Display for UrlSanitizeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UrlSanitizeError::CannotBeABase => write!(f, "url has no origin"),
        }
    }
}

impl ReportUrl {
    /// Strips userinfo, path, query, and fragment, keeping scheme, host, and
    /// port only (spec §4.6 `queue_report`: "sanitizes url to its referrer
    /// form ... reject if not valid after stripping").
    pub fn sanitize(url: &Url) -> Result<Self, UrlSanitizeError> {
        if url.cannot_be_a_base() {
            return Err(UrlSanitizeError::CannotBeABase);
        }
        let mut sanitized = url.clone();
        sanitized.set_fragment(None);
        sanitized.set_query(None);
        let _ = sanitized.set_username("");
        let _ = sanitized.set_password(None);
        sanitized.set_path("/");
        Ok(ReportUrl(sanitized))
    }

    pub fn as_url(&self) -> &Url {
        &self.0
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn host_str(&self) -> Option<&str> {
        self.0.host_str()
    }

    pub fn scheme(&self) -> &str {
        self.0.scheme()
    }

    pub fn port(&self) -> Option<u16> {
        self.0.port_or_known_default()
    }
}

impl fmt::Display for ReportUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Whether `url`'s scheme alone implies transport security (spec §4.3: "the
/// scheme must be HTTPS").
pub fn is_secure_scheme(url: &Url) -> bool {
    matches!(url.scheme(), "https" | "wss")
}

/// Whether `url`'s origin is potentially-trustworthy (spec §3: endpoint
/// "target URL must be potentially-trustworthy; otherwise rejected at
/// ingest"). Secure schemes are always trustworthy; `http`/`ws` to loopback
/// hosts are trustworthy too, matching the locally-served-content carve-out
/// a browser's own potentially-trustworthy-origin check makes.
pub fn is_potentially_trustworthy(url: &Url) -> bool {
    if is_secure_scheme(url) {
        return true;
    }
    if !matches!(url.scheme(), "http" | "ws") {
        return false;
    }
    match url.host_str() {
        Some("localhost") => true,
        Some(host) => host
            .parse::<std::net::IpAddr>()
            .map(|ip| ip.is_loopback())
            .unwrap_or(false),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_path_query_fragment_userinfo() {
        let url = Url::parse("https://user:pw@a.test:8443/x/y?q=1#frag").unwrap();
        let sanitized = ReportUrl::sanitize(&url).unwrap();
        assert_eq!(sanitized.as_str(), "https://a.test:8443/");
    }

    #[test]
    fn sanitize_rejects_cannot_be_a_base() {
        let url = Url::parse("data:text/plain,hello").unwrap();
        assert_eq!(
            ReportUrl::sanitize(&url),
            Err(UrlSanitizeError::CannotBeABase)
        );
    }

    #[test]
    fn https_is_always_trustworthy() {
        let url = Url::parse("https://r.test/r").unwrap();
        assert!(is_potentially_trustworthy(&url));
        assert!(is_secure_scheme(&url));
    }

    #[test]
    fn http_to_loopback_is_trustworthy() {
        let url = Url::parse("http://127.0.0.1:8080/r").unwrap();
        assert!(is_potentially_trustworthy(&url));
        assert!(!is_secure_scheme(&url));
    }

    #[test]
    fn plain_http_is_not_trustworthy() {
        let url = Url::parse("http://r.test/r").unwrap();
        assert!(!is_potentially_trustworthy(&url));
    }
}
