// gatewarden/src/learning/features.rs
//
// Named sparse feature extraction for the heuristic model.
//
// Two modes. Early mode sees only the raw request (stage 0 has not run
// when the extractor is used for warm-path scoring); full mode folds in
// everything the pipeline has produced: per-detector maxima, category
// scores, signal presence, failures, fingerprint and LLM outcomes, and
// the running verdict.
//
// Extraction is pure: the same (request, evidence) pair always yields the
// same map. All values are clamped to [0, 1]; names are normalized to
// lowercase with separators collapsed to underscores.

use std::collections::BTreeMap;

use aho_corasick::{AhoCorasick, MatchKind};

use crate::evidence::{AggregatedEvidence, RiskBand};
use crate::request::RequestContext;
use crate::signal_bus::keys;

/// UA substrings that become `ua:<token>` features.
const UA_TOKENS: &[&str] = &[
    "bot", "spider", "crawler", "scraper", "headless", "phantomjs", "selenium", "curl", "wget",
    "python", "scrapy", "requests", "httpx", "aiohttp", "chrome", "firefox", "safari", "edge",
];

const BROWSER_TOKENS: &[&str] = &["chrome", "firefox", "safari", "edge"];

const VCS_PROBES: &[&str] = &["/.git", "/.svn", "/.hg"];
const ENV_PROBES: &[&str] = &["/.env", "/.aws", "web.config", "config.php", "/.htaccess"];
const ADMIN_PROBES: &[&str] = &["wp-admin", "wp-login", "phpmyadmin", "/admin", "/administrator"];

/// Lowercase, and collapse spaces, dashes, dots and inner colons to
/// underscores. The `kind:` prefix colon is kept.
pub fn normalize_name(name: &str) -> String {
    let lower = name.to_lowercase();
    let (prefix, rest) = match lower.split_once(':') {
        Some((p, r)) => (Some(p), r),
        None => (None, lower.as_str()),
    };
    let clean = |s: &str| -> String {
        s.chars()
            .map(|c| match c {
                ' ' | '-' | '.' | ':' => '_',
                c => c,
            })
            .collect()
    };
    match prefix {
        Some(p) => format!("{}:{}", clean(p), clean(rest)),
        None => clean(rest),
    }
}

fn clamp01(v: f64) -> f64 {
    v.clamp(0.0, 1.0)
}

pub struct FeatureExtractor {
    ua_tokens: AhoCorasick,
}

impl FeatureExtractor {
    pub fn new() -> Self {
        let ua_tokens = AhoCorasick::builder()
            .ascii_case_insensitive(true)
            .match_kind(MatchKind::Standard)
            .build(UA_TOKENS)
            .expect("ua token set builds");
        Self { ua_tokens }
    }

    /// Request-only features.
    pub fn early(&self, ctx: &RequestContext) -> BTreeMap<String, f64> {
        let mut map = BTreeMap::new();
        let mut put = |name: &str, value: f64| {
            map.insert(normalize_name(name), clamp01(value));
        };

        // Request shape
        put("req:path_length", ctx.path.len() as f64 / 200.0);
        put("req:query_count", ctx.query_count as f64 / 10.0);
        put("req:content_length", ctx.content_length as f64 / 100_000.0);
        put("req:cookie_count", ctx.cookie_count() as f64 / 5.0);
        put("req:is_get", if ctx.method.eq_ignore_ascii_case("GET") { 1.0 } else { 0.0 });
        put("req:https", if ctx.is_https { 1.0 } else { 0.0 });

        // Header presence
        put("hdr:count", ctx.header_count() as f64 / 20.0);
        for name in [
            "accept",
            "accept-language",
            "accept-encoding",
            "referer",
            "cache-control",
            "cookie",
            "sec-fetch-mode",
        ] {
            if ctx.has_header(name) {
                put(&format!("hdr:{name}"), 1.0);
            }
        }

        // User-Agent shape
        match ctx.user_agent() {
            None => put("ua:empty", 1.0),
            Some(ua) => {
                put("ua:length", ua.len() as f64 / 200.0);
                for m in self.ua_tokens.find_iter(ua) {
                    let token = UA_TOKENS[m.pattern().as_usize()];
                    if token == "bot" {
                        put("ua:contains_bot", 1.0);
                    } else {
                        put(&format!("ua:{token}"), 1.0);
                    }
                }
                let lower = ua.to_lowercase();
                if BROWSER_TOKENS.iter().any(|b| lower.contains(b))
                    && !ctx.has_header("accept-language")
                {
                    put("combo:browser_no_accept_lang", 1.0);
                }
            }
        }

        // Accept shape
        match ctx.accept() {
            None => put("accept:missing", 1.0),
            Some(accept) => {
                if accept.trim() == "*/*" {
                    put("accept:wildcard", 1.0);
                }
                if accept.contains("text/html") {
                    put("accept:html", 1.0);
                }
            }
        }

        // Probing paths
        let path = ctx.path.to_lowercase();
        if VCS_PROBES.iter().any(|p| path.contains(p)) {
            put("path:vcs_probe", 1.0);
        }
        if ENV_PROBES.iter().any(|p| path.contains(p)) {
            put("path:env_probe", 1.0);
        }
        if ADMIN_PROBES.iter().any(|p| path.contains(p)) {
            put("path:admin_probe", 1.0);
        }

        map
    }

    /// Early features plus everything the pipeline produced so far.
    pub fn full(&self, ctx: &RequestContext, evidence: &AggregatedEvidence) -> BTreeMap<String, f64> {
        let mut map = self.early(ctx);
        let mut put = |map: &mut BTreeMap<String, f64>, name: &str, value: f64| {
            map.insert(normalize_name(name), clamp01(value));
        };

        // Strongest positive delta per detector
        let mut per_detector: BTreeMap<&str, f64> = BTreeMap::new();
        for c in &evidence.contributions {
            let slot = per_detector.entry(c.detector.as_str()).or_insert(f64::MIN);
            *slot = slot.max(c.confidence_delta);
        }
        for (detector, delta) in &per_detector {
            put(&mut map, &format!("det:{detector}"), *delta);
        }

        // Category rollups
        for (category, score) in &evidence.category_breakdown {
            put(&mut map, &format!("cat:{category}"), score.score);
        }

        // Signal presence and failures
        for (signal, _) in evidence.signals.iter() {
            put(&mut map, &format!("sig:{signal}"), 1.0);
        }
        for failed in &evidence.failed_detectors {
            put(&mut map, &format!("fail:{failed}"), 1.0);
        }

        // Client-side fingerprint outcome
        match evidence.signals.get(keys::CLIENT_FINGERPRINT_HASH) {
            Some(_) => {
                put(&mut map, "fp:received", 1.0);
                let integrity = evidence
                    .signals
                    .get(keys::CLIENT_INTEGRITY_SCORE)
                    .and_then(|v| v.as_f64())
                    .unwrap_or(0.0);
                let headless = evidence
                    .signals
                    .get(keys::CLIENT_HEADLESS_LIKELIHOOD)
                    .and_then(|v| v.as_f64())
                    .unwrap_or(0.0);
                put(&mut map, "fp:integrity", integrity / 100.0);
                if headless >= 0.5 {
                    put(&mut map, "fp:suspicious", 1.0);
                }
                if integrity >= 70.0 && headless < 0.3 {
                    put(&mut map, "fp:legitimate", 1.0);
                }
            }
            None => put(&mut map, "fp:missing", 1.0),
        }

        // LLM outcome
        if let Some(prediction) = evidence.signals.get(keys::AI_PREDICTION).and_then(|v| v.as_text())
        {
            let confidence = evidence
                .signals
                .get(keys::AI_CONFIDENCE)
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0);
            let is_bot = prediction == "bot";
            put(&mut map, "ai:ran", 1.0);
            put(&mut map, "ai:prediction", if is_bot { 1.0 } else { 0.0 });
            put(&mut map, "ai:confidence", confidence);
            put(&mut map, "ai:bot_confidence", if is_bot { confidence } else { 0.0 });
            put(&mut map, "ai:human_confidence", if is_bot { 0.0 } else { confidence });
            put(
                &mut map,
                "ai:delta",
                if is_bot { 0.5 + confidence / 2.0 } else { 0.5 - confidence / 2.0 },
            );
        }

        // Aggregate statistics over contributions
        let n = evidence.contributions.len();
        if n > 0 {
            let magnitudes: Vec<f64> =
                evidence.contributions.iter().map(|c| c.confidence_delta.abs()).collect();
            let max = magnitudes.iter().cloned().fold(0.0, f64::max);
            let avg = magnitudes.iter().sum::<f64>() / n as f64;
            let variance = magnitudes.iter().map(|m| (m - avg).powi(2)).sum::<f64>() / n as f64;
            put(&mut map, "det:count", n as f64 / 20.0);
            put(&mut map, "det:max", max);
            put(&mut map, "det:avg", avg);
            put(&mut map, "det:variance", variance);
        }

        // Running verdict
        put(&mut map, "result:bot_probability", evidence.bot_probability);
        put(&mut map, "result:confidence", evidence.confidence);
        let band = match evidence.risk_band {
            RiskBand::VeryLow  => 0.0,
            RiskBand::Low      => 0.25,
            RiskBand::Medium   => 0.5,
            RiskBand::High     => 0.75,
            RiskBand::VeryHigh => 1.0,
        };
        put(&mut map, "result:risk_band", band);

        map
    }
}

impl Default for FeatureExtractor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::{Category, Contribution};

    fn browser_ctx() -> RequestContext {
        RequestContext::builder("GET", "/index.html")
            .header("User-Agent", "Mozilla/5.0 (Windows NT 10.0) Chrome/120 Safari/537.36")
            .header("Accept", "text/html,application/xhtml+xml")
            .header("Accept-Language", "en-US,en;q=0.9")
            .header("Cookie", "session=x")
            .build()
    }

    #[test]
    fn name_normalization() {
        assert_eq!(normalize_name("hdr:Accept-Language"), "hdr:accept_language");
        assert_eq!(normalize_name("sig:ip.is_local"), "sig:ip_is_local");
        assert_eq!(normalize_name("Some Name"), "some_name");
        assert_eq!(normalize_name("ua:contains_bot"), "ua:contains_bot");
    }

    #[test]
    fn early_features_for_a_browser() {
        let fx = FeatureExtractor::new();
        let map = fx.early(&browser_ctx());
        assert_eq!(map.get("ua:chrome"), Some(&1.0));
        assert_eq!(map.get("ua:safari"), Some(&1.0));
        assert_eq!(map.get("hdr:accept_language"), Some(&1.0));
        assert_eq!(map.get("accept:html"), Some(&1.0));
        assert!(map.get("ua:empty").is_none());
        assert!(map.get("combo:browser_no_accept_lang").is_none());
        assert!(map.get("path:vcs_probe").is_none());
    }

    #[test]
    fn early_features_for_a_tool() {
        let fx = FeatureExtractor::new();
        let ctx = RequestContext::builder("GET", "/.git/config")
            .header("User-Agent", "curl/8.4.0")
            .build();
        let map = fx.early(&ctx);
        assert_eq!(map.get("ua:curl"), Some(&1.0));
        assert_eq!(map.get("path:vcs_probe"), Some(&1.0));
        assert_eq!(map.get("accept:missing"), Some(&1.0));
        assert!(map.get("hdr:accept_language").is_none());
    }

    #[test]
    fn browser_claim_without_language_sets_combo() {
        let fx = FeatureExtractor::new();
        let ctx = RequestContext::builder("GET", "/")
            .header("User-Agent", "Mozilla/5.0 Chrome/120")
            .build();
        let map = fx.early(&ctx);
        assert_eq!(map.get("combo:browser_no_accept_lang"), Some(&1.0));
    }

    #[test]
    fn bot_token_uses_contains_bot_name() {
        let fx = FeatureExtractor::new();
        let ctx = RequestContext::builder("GET", "/")
            .header("User-Agent", "SomethingBot/1.0")
            .build();
        let map = fx.early(&ctx);
        assert_eq!(map.get("ua:contains_bot"), Some(&1.0));
        assert!(map.get("ua:bot").is_none());
    }

    #[test]
    fn values_are_clamped() {
        let fx = FeatureExtractor::new();
        let long_path = format!("/{}", "a".repeat(600));
        let ctx = RequestContext::builder("GET", long_path).build();
        let map = fx.early(&ctx);
        assert_eq!(map.get("req:path_length"), Some(&1.0));
    }

    #[test]
    fn full_mode_folds_in_evidence() {
        let fx = FeatureExtractor::new();
        let ctx = browser_ctx();
        let mut ev = AggregatedEvidence::unknown();
        ev.bot_probability = 0.8;
        ev.risk_band = RiskBand::High;
        ev.contributions = vec![
            Contribution::new("user_agent", Category::UserAgent, 0.4, "r1"),
            Contribution::new("user_agent", Category::UserAgent, 0.7, "r2"),
            Contribution::new("headers", Category::Headers, -0.2, "r3"),
        ];
        ev.failed_detectors = vec!["client_side".into()];
        let map = fx.full(&ctx, &ev);

        // Max per detector, not last.
        assert_eq!(map.get("det:user_agent"), Some(&0.7));
        // Negative maxima clamp to zero.
        assert_eq!(map.get("det:headers"), Some(&0.0));
        assert_eq!(map.get("fail:client_side"), Some(&1.0));
        assert_eq!(map.get("result:bot_probability"), Some(&0.8));
        assert_eq!(map.get("result:risk_band"), Some(&0.75));
        assert_eq!(map.get("fp:missing"), Some(&1.0));
    }

    #[test]
    fn extraction_is_pure() {
        let fx = FeatureExtractor::new();
        let ctx = browser_ctx();
        let ev = AggregatedEvidence::unknown();
        assert_eq!(fx.full(&ctx, &ev), fx.full(&ctx, &ev));
    }
}
