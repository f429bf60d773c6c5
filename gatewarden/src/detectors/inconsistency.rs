// gatewarden/src/detectors/inconsistency.rs
//
// Cross-signal contradiction checks — stage 2.
//
// Each rule catches a claim the rest of the request fails to back up: a
// desktop browser that ships no languages, a modern Chrome without its
// mandatory Sec-* headers, a regional crawler with the wrong locale, a
// Referer pointing into someone's loopback. Individually small, these
// stack into a solid scraper signature.

use async_trait::async_trait;

use crate::error::EngineError;
use crate::evidence::{AggregatedEvidence, BotType, Category, Contribution};
use crate::request::RequestContext;

use super::version_age::parse_browser;
use super::{Detector, DetectorDeps, Stage};

const NAME: &str = "inconsistency";

const DESKTOP_NO_LANGUAGE_IMPACT: f64 = 0.2;
const MOBILE_NO_LANGUAGE_IMPACT: f64 = 0.15;
const CHROME_NO_SEC_HEADERS_IMPACT: f64 = 0.15;
const LOCALE_MISMATCH_IMPACT: f64 = 0.1;
const GENERIC_ACCEPT_BROWSER_IMPACT: f64 = 0.2;
const EXPLICIT_KEEPALIVE_IMPACT: f64 = 0.05;
const PRIVATE_REFERER_IMPACT: f64 = 0.3;
const BOT_WITH_BROWSER_HEADERS_IMPACT: f64 = 0.1;
const COHERENT_CLAIMS_RELIEF: f64 = -0.15;

const SEC_FETCH_CHROME_MIN: u32 = 73;
const KEEPALIVE_CHROME_MIN: u32 = 90;
const SCRAPER_THRESHOLD: f64 = 0.3;

pub struct InconsistencyDetector {
    weight: f64,
}

impl InconsistencyDetector {
    pub fn new(deps: &DetectorDeps) -> Self {
        Self { weight: deps.options.detectors.inconsistency.weight }
    }

    fn contribution(&self, delta: f64, reason: impl Into<String>) -> Contribution {
        Contribution::new(NAME, Category::Inconsistency, delta, reason).with_weight(self.weight)
    }
}

fn is_desktop_ua(ua: &str) -> bool {
    let lower = ua.to_lowercase();
    !lower.contains("mobile")
        && (lower.contains("windows nt") || lower.contains("macintosh") || lower.contains("x11;"))
}

fn is_mobile_ua(ua: &str) -> bool {
    let lower = ua.to_lowercase();
    lower.contains("mobile") || lower.contains("android") || lower.contains("iphone")
}

fn is_browser_claim(ua: &str) -> bool {
    let lower = ua.to_lowercase();
    ["chrome/", "firefox/", "safari/", "edg/", "opr/"].iter().any(|t| lower.contains(t))
}

fn is_bot_claim(ua: &str) -> bool {
    let lower = ua.to_lowercase();
    ["bot", "crawler", "spider"].iter().any(|t| lower.contains(t))
}

/// Host portion of a Referer URL.
fn referer_host(referer: &str) -> Option<&str> {
    let rest = referer
        .strip_prefix("https://")
        .or_else(|| referer.strip_prefix("http://"))?;
    let host_port = rest.split(['/', '?', '#']).next()?;
    Some(host_port.split(':').next().unwrap_or(host_port))
}

fn is_private_host(host: &str) -> bool {
    if host.eq_ignore_ascii_case("localhost") || host == "::1" {
        return true;
    }
    if let Ok(ip) = host.parse::<std::net::IpAddr>() {
        return match ip {
            std::net::IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_link_local(),
            std::net::IpAddr::V6(v6) => v6.is_loopback(),
        };
    }
    host.ends_with(".local") || host.ends_with(".internal")
}

#[async_trait]
impl Detector for InconsistencyDetector {
    fn name(&self) -> &'static str {
        NAME
    }

    fn stage(&self) -> Stage {
        Stage::MetaAnalysis
    }

    async fn detect(
        &self,
        ctx: &RequestContext,
        _prior: &AggregatedEvidence,
    ) -> Result<Vec<Contribution>, EngineError> {
        let Some(ua) = ctx.user_agent() else {
            return Ok(Vec::new());
        };
        let ua = ua.to_string();
        let lower = ua.to_lowercase();
        let accept_language = ctx.header("accept-language");
        let mut out = Vec::new();

        if accept_language.is_none() {
            if is_desktop_ua(&ua) {
                out.push(self.contribution(
                    DESKTOP_NO_LANGUAGE_IMPACT,
                    "desktop browser claim without Accept-Language",
                ));
            } else if is_mobile_ua(&ua) {
                out.push(self.contribution(
                    MOBILE_NO_LANGUAGE_IMPACT,
                    "mobile browser claim without Accept-Language",
                ));
            }
        }

        let chrome = parse_browser(&ua).filter(|c| c.name == "chrome");
        if let Some(claim) = &chrome {
            if claim.version >= SEC_FETCH_CHROME_MIN
                && !ctx.has_header("sec-fetch-mode")
                && !ctx.has_header("sec-ch-ua")
            {
                out.push(self.contribution(
                    CHROME_NO_SEC_HEADERS_IMPACT,
                    format!("Chrome {} without Sec-Fetch-Mode or Sec-Ch-Ua", claim.version),
                ));
            }
            if claim.version >= KEEPALIVE_CHROME_MIN
                && ctx
                    .header("connection")
                    .is_some_and(|c| c.eq_ignore_ascii_case("keep-alive"))
            {
                out.push(self.contribution(
                    EXPLICIT_KEEPALIVE_IMPACT,
                    "modern Chrome sending explicit Connection: keep-alive",
                ));
            }
        }

        for (marker, language, crawler) in
            [("baidu", "zh", "Baidu"), ("yandex", "ru", "Yandex")]
        {
            if lower.contains(marker)
                && !accept_language
                    .map(|al| al.to_lowercase().contains(language))
                    .unwrap_or(false)
            {
                out.push(self.contribution(
                    LOCALE_MISMATCH_IMPACT,
                    format!("{crawler} claim without '{language}' in Accept-Language"),
                ));
            }
        }

        if ctx.accept().map(str::trim) == Some("*/*") && is_browser_claim(&ua) {
            out.push(self.contribution(
                GENERIC_ACCEPT_BROWSER_IMPACT,
                "generic */* Accept from a specific browser claim",
            ));
        }

        if let Some(host) = ctx.header("referer").and_then(referer_host) {
            if is_private_host(host) {
                out.push(self.contribution(
                    PRIVATE_REFERER_IMPACT,
                    format!("Referer points to private host '{host}'"),
                ));
            }
        }

        if is_bot_claim(&ua)
            && ctx.accept().is_some_and(|a| a.contains("text/html"))
            && accept_language.is_some()
        {
            out.push(self.contribution(
                BOT_WITH_BROWSER_HEADERS_IMPACT,
                "bot claim with a full browser header set",
            ));
        }

        // All claims corroborated: a real modern browser carries its
        // Sec-* headers and a language.
        if out.is_empty()
            && is_browser_claim(&ua)
            && ctx.has_header("sec-fetch-mode")
            && accept_language.is_some()
        {
            out.push(self.contribution(
                COHERENT_CLAIMS_RELIEF,
                "browser claims corroborated by Sec-* headers",
            ));
        }

        let total: f64 = out.iter().map(|c| c.confidence_delta).sum();
        if total >= SCRAPER_THRESHOLD && out.iter().all(|c| c.bot_type.is_none()) {
            if let Some(strongest) = out
                .iter_mut()
                .max_by(|a, b| a.confidence_delta.partial_cmp(&b.confidence_delta).unwrap())
            {
                strongest.bot_type = Some(BotType::Scraper);
            }
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::plain_deps;

    fn detector() -> InconsistencyDetector {
        InconsistencyDetector::new(&plain_deps())
    }

    async fn run(ctx: &RequestContext) -> Vec<Contribution> {
        detector().detect(ctx, &AggregatedEvidence::unknown()).await.unwrap()
    }

    #[tokio::test]
    async fn consistent_browser_earns_relief() {
        let ctx = RequestContext::builder("GET", "/")
            .header("User-Agent", "Mozilla/5.0 (Windows NT 10.0) Chrome/138.0.0.0 Safari/537.36")
            .header("Accept", "text/html,application/xhtml+xml")
            .header("Accept-Language", "en-US,en;q=0.9")
            .header("Sec-Fetch-Mode", "navigate")
            .header("Sec-Ch-Ua", "\"Chromium\";v=\"138\"")
            .build();
        let out = run(&ctx).await;
        assert_eq!(out.len(), 1, "unexpected: {out:?}");
        assert_eq!(out[0].confidence_delta, COHERENT_CLAIMS_RELIEF);
    }

    #[tokio::test]
    async fn desktop_without_language_and_missing_sec_headers() {
        let ctx = RequestContext::builder("GET", "/")
            .header("User-Agent", "Mozilla/5.0 (Windows NT 10.0) Chrome/120.0.0.0 Safari/537.36")
            .header("Accept", "text/html")
            .build();
        let out = run(&ctx).await;
        assert!(out.iter().any(|c| c.confidence_delta == DESKTOP_NO_LANGUAGE_IMPACT));
        assert!(out.iter().any(|c| c.confidence_delta == CHROME_NO_SEC_HEADERS_IMPACT));
        // 0.35 total crosses the scraper threshold.
        assert!(out.iter().any(|c| c.bot_type == Some(BotType::Scraper)));
    }

    #[tokio::test]
    async fn mobile_without_language_is_softer() {
        let ctx = RequestContext::builder("GET", "/")
            .header(
                "User-Agent",
                "Mozilla/5.0 (Linux; Android 14) Chrome/120.0.0.0 Mobile Safari/537.36",
            )
            .header("Accept", "text/html")
            .header("Sec-Fetch-Mode", "navigate")
            .build();
        let out = run(&ctx).await;
        assert!(out.iter().any(|c| c.confidence_delta == MOBILE_NO_LANGUAGE_IMPACT));
    }

    #[tokio::test]
    async fn locale_mismatch_for_regional_crawlers() {
        let ctx = RequestContext::builder("GET", "/")
            .header("User-Agent", "Mozilla/5.0 (compatible; Baiduspider-fake/2.0)")
            .header("Accept", "text/html")
            .header("Accept-Language", "en-US,en;q=0.9")
            .build();
        let out = run(&ctx).await;
        assert!(out.iter().any(|c| c.reason.contains("Baidu")));

        let ok = RequestContext::builder("GET", "/")
            .header("User-Agent", "Mozilla/5.0 (compatible; Baiduspider-fake/2.0)")
            .header("Accept", "text/html")
            .header("Accept-Language", "zh-CN,zh;q=0.9")
            .build();
        let out = run(&ok).await;
        assert!(!out.iter().any(|c| c.reason.contains("Baidu")));
    }

    #[tokio::test]
    async fn generic_accept_with_browser_claim() {
        let ctx = RequestContext::builder("GET", "/")
            .header("User-Agent", "Mozilla/5.0 Chrome/138.0.0.0 Safari/537.36")
            .header("Accept", "*/*")
            .header("Accept-Language", "en-US,en")
            .header("Sec-Fetch-Mode", "cors")
            .build();
        let out = run(&ctx).await;
        assert!(out.iter().any(|c| c.confidence_delta == GENERIC_ACCEPT_BROWSER_IMPACT));
    }

    #[tokio::test]
    async fn explicit_keepalive_on_modern_chrome() {
        let ctx = RequestContext::builder("GET", "/")
            .header("User-Agent", "Mozilla/5.0 Chrome/120.0.0.0 Safari/537.36")
            .header("Accept", "text/html")
            .header("Accept-Language", "en-US,en")
            .header("Sec-Fetch-Mode", "navigate")
            .header("Connection", "keep-alive")
            .build();
        let out = run(&ctx).await;
        assert!(out.iter().any(|c| c.confidence_delta == EXPLICIT_KEEPALIVE_IMPACT));
    }

    #[tokio::test]
    async fn private_referer_is_a_strong_tell() {
        for referer in [
            "http://localhost:3000/admin",
            "http://127.0.0.1/test",
            "http://192.168.1.10/panel",
        ] {
            let ctx = RequestContext::builder("GET", "/")
                .header("User-Agent", "Mozilla/5.0 Chrome/138 Safari/537.36")
                .header("Accept", "text/html")
                .header("Accept-Language", "en-US,en")
                .header("Sec-Fetch-Mode", "navigate")
                .header("Referer", referer)
                .build();
            let out = run(&ctx).await;
            assert!(
                out.iter().any(|c| c.confidence_delta == PRIVATE_REFERER_IMPACT),
                "{referer}: {out:?}"
            );
        }
    }

    #[tokio::test]
    async fn bot_with_full_browser_headers() {
        let ctx = RequestContext::builder("GET", "/")
            .header("User-Agent", "FancyCrawler/1.0 (bot)")
            .header("Accept", "text/html,application/xhtml+xml")
            .header("Accept-Language", "en-US,en;q=0.9")
            .build();
        let out = run(&ctx).await;
        assert!(out.iter().any(|c| c.confidence_delta == BOT_WITH_BROWSER_HEADERS_IMPACT));
    }
}
