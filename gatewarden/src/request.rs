// gatewarden/src/request.rs
//
// Per-request input record. Owned exclusively by one request; the signal
// bus inside is never touched after the request returns. Header insertion
// order is preserved for the ordering-anomaly checks.

use std::net::IpAddr;
use std::time::Instant;

use chrono::{DateTime, Utc};

use crate::identity::IdentityKeys;
use crate::signal_bus::SignalBus;

#[derive(Debug)]
pub struct RequestContext {
    pub method:         String,
    pub path:           String,
    pub query_count:    usize,
    pub content_length: u64,
    pub is_https:       bool,
    /// Headers in arrival order. Lookups are case-insensitive.
    headers:            Vec<(String, String)>,
    /// Cookie names only; values are never inspected.
    pub cookies:        Vec<String>,
    pub remote_addr:    Option<IpAddr>,
    /// Raw X-Forwarded-For chain, if any.
    pub forwarded_for:  Option<String>,
    pub user_id:        Option<String>,
    pub api_key:        Option<String>,
    /// Wall-clock arrival time (drives sliding-window accounting).
    pub received_at:    DateTime<Utc>,
    /// Monotonic arrival time (drives the deadline).
    pub started:        Instant,
    pub deadline:       Option<Instant>,
    pub signals:        SignalBus,
    /// Filled by the identity resolver before the first stage runs.
    pub identity:       IdentityKeys,
}

impl RequestContext {
    pub fn builder(method: impl Into<String>, path: impl Into<String>) -> RequestContextBuilder {
        RequestContextBuilder::new(method, path)
    }

    /// First value for a header, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.header(name).is_some()
    }

    pub fn header_count(&self) -> usize {
        self.headers.len()
    }

    /// Header names lowercased, in arrival order.
    pub fn header_names_in_order(&self) -> Vec<String> {
        self.headers.iter().map(|(k, _)| k.to_lowercase()).collect()
    }

    /// Zero-based position of a header in arrival order.
    pub fn header_position(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|(k, _)| k.eq_ignore_ascii_case(name))
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.header("user-agent").filter(|ua| !ua.trim().is_empty())
    }

    pub fn accept(&self) -> Option<&str> {
        self.header("accept")
    }

    pub fn cookie_count(&self) -> usize {
        self.cookies.len()
    }

    /// Client address: first token of X-Forwarded-For when present,
    /// otherwise the direct remote address.
    pub fn client_ip(&self) -> Option<IpAddr> {
        if let Some(chain) = &self.forwarded_for {
            if let Some(first) = chain.split(',').next() {
                if let Ok(ip) = first.trim().parse::<IpAddr>() {
                    return Some(ip);
                }
            }
        }
        self.remote_addr
    }

    /// Sub-request issued by in-page JavaScript (HTMX, fetch, XHR). Used
    /// as proof of script execution by the behavioral checks.
    pub fn is_fetch_subrequest(&self) -> bool {
        if self.has_header("hx-request") {
            return true;
        }
        if self.header("sec-fetch-dest").is_some_and(|d| d.eq_ignore_ascii_case("empty")) {
            return true;
        }
        self.header("x-requested-with")
            .is_some_and(|v| v.eq_ignore_ascii_case("xmlhttprequest"))
    }

    /// Time left before the request deadline. None means no deadline.
    pub fn remaining(&self) -> Option<std::time::Duration> {
        self.deadline.map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn past_deadline(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

// ── Builder ───────────────────────────────────────────────────────────────────

pub struct RequestContextBuilder {
    ctx: RequestContext,
}

impl RequestContextBuilder {
    fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            ctx: RequestContext {
                method:         method.into(),
                path:           path.into(),
                query_count:    0,
                content_length: 0,
                is_https:       true,
                headers:        Vec::new(),
                cookies:        Vec::new(),
                remote_addr:    None,
                forwarded_for:  None,
                user_id:        None,
                api_key:        None,
                received_at:    Utc::now(),
                started:        Instant::now(),
                deadline:       None,
                signals:        SignalBus::new(),
                identity:       IdentityKeys::default(),
            },
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        let value = value.into();
        if name.eq_ignore_ascii_case("x-forwarded-for") {
            self.ctx.forwarded_for = Some(value.clone());
        }
        if name.eq_ignore_ascii_case("cookie") {
            for pair in value.split(';') {
                if let Some(cookie_name) = pair.split('=').next() {
                    let cookie_name = cookie_name.trim();
                    if !cookie_name.is_empty() {
                        self.ctx.cookies.push(cookie_name.to_string());
                    }
                }
            }
        }
        self.ctx.headers.push((name, value));
        self
    }

    pub fn query_count(mut self, n: usize) -> Self {
        self.ctx.query_count = n;
        self
    }

    pub fn content_length(mut self, n: u64) -> Self {
        self.ctx.content_length = n;
        self
    }

    pub fn https(mut self, on: bool) -> Self {
        self.ctx.is_https = on;
        self
    }

    pub fn remote_addr(mut self, ip: IpAddr) -> Self {
        self.ctx.remote_addr = Some(ip);
        self
    }

    pub fn user_id(mut self, id: impl Into<String>) -> Self {
        self.ctx.user_id = Some(id.into());
        self
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.ctx.api_key = Some(key.into());
        self
    }

    pub fn received_at(mut self, at: DateTime<Utc>) -> Self {
        self.ctx.received_at = at;
        self
    }

    pub fn deadline_in(mut self, budget: std::time::Duration) -> Self {
        self.ctx.deadline = Some(self.ctx.started + budget);
        self
    }

    pub fn build(self) -> RequestContext {
        self.ctx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_lookup_is_case_insensitive_and_ordered() {
        let ctx = RequestContext::builder("GET", "/")
            .header("Host", "example.net")
            .header("User-Agent", "Mozilla/5.0")
            .header("Accept", "text/html")
            .build();
        assert_eq!(ctx.header("user-agent"), Some("Mozilla/5.0"));
        assert_eq!(ctx.header_position("accept"), Some(2));
        assert_eq!(ctx.header_names_in_order(), vec!["host", "user-agent", "accept"]);
    }

    #[test]
    fn client_ip_prefers_first_forwarded_token() {
        let ctx = RequestContext::builder("GET", "/")
            .header("X-Forwarded-For", "203.0.113.7, 10.0.0.1")
            .remote_addr("10.0.0.1".parse().unwrap())
            .build();
        assert_eq!(ctx.client_ip(), Some("203.0.113.7".parse().unwrap()));

        let ctx = RequestContext::builder("GET", "/")
            .remote_addr("198.51.100.2".parse().unwrap())
            .build();
        assert_eq!(ctx.client_ip(), Some("198.51.100.2".parse().unwrap()));
    }

    #[test]
    fn cookie_header_yields_names_only() {
        let ctx = RequestContext::builder("GET", "/")
            .header("Cookie", "session=abc123; theme=dark")
            .build();
        assert_eq!(ctx.cookies, vec!["session", "theme"]);
    }

    #[test]
    fn blank_user_agent_reads_as_absent() {
        let ctx = RequestContext::builder("GET", "/")
            .header("User-Agent", "   ")
            .build();
        assert!(ctx.user_agent().is_none());
    }

    #[test]
    fn fetch_subrequest_markers() {
        let htmx = RequestContext::builder("GET", "/fragment")
            .header("HX-Request", "true")
            .build();
        assert!(htmx.is_fetch_subrequest());

        let fetch = RequestContext::builder("GET", "/api/data")
            .header("Sec-Fetch-Dest", "empty")
            .build();
        assert!(fetch.is_fetch_subrequest());

        let page = RequestContext::builder("GET", "/index.html")
            .header("Sec-Fetch-Dest", "document")
            .build();
        assert!(!page.is_fetch_subrequest());
    }
}
