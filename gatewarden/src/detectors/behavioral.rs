// gatewarden/src/detectors/behavioral.rs
//
// Sliding-window behavior checks — stage 1.
//
// Content-aware rate limiting: page navigations and total requests are
// counted separately per identity. A browser loading one page over
// HTTP/2 fires dozens of asset requests in a burst, so when total counts
// run far ahead of page counts the limit applies to pages only.
//
// The first two minutes of an identity's life are a warmup: the rate
// limit doubles and the referrer/cookie checks stay silent, so a fresh
// human session is not punished for having no history yet.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;

use crate::behavior::BehaviorAnalyzer;
use crate::config::BehavioralOptions;
use crate::error::EngineError;
use crate::evidence::{AggregatedEvidence, BotType, Category, Contribution};
use crate::request::RequestContext;
use crate::state::profile::MAX_TRACKED_PATHS;
use crate::state::window::{COUNTER_TTL_SECS, PATHS_TTL_SECS, TIMING_TTL_SECS};
use crate::state::WindowStore;

use super::{Detector, DetectorDeps, Stage};

const NAME: &str = "behavioral";

const OVER_LIMIT_BASE: f64 = 0.3;
const OVER_LIMIT_STEP: f64 = 0.05;
const OVER_LIMIT_CAP: f64 = 0.9;
const RAPID_PAGE_IMPACT: f64 = 0.25;
const VERY_RAPID_PAGE_IMPACT: f64 = 0.4;
const RAPID_PAGE_MS: i64 = 100;
const VERY_RAPID_PAGE_MS: i64 = 50;
const MISSING_REFERER_IMPACT: f64 = 0.15;
const NO_COOKIES_IMPACT: f64 = 0.25;
const FETCH_SUBREQUEST_RELIEF: f64 = -0.15;
const NEW_PATH_IMPACT: f64 = 0.1;
const NEW_PATH_MIN_HISTORY: u64 = 20;
const MULTIPLEX_FACTOR: u64 = 3;
const SCRAPER_TOTAL: f64 = 0.6;

const ASSET_EXTENSIONS: &[&str] = &[
    ".js", ".mjs", ".css", ".map", ".png", ".jpg", ".jpeg", ".gif", ".webp", ".avif", ".svg",
    ".ico", ".woff", ".woff2", ".ttf", ".otf", ".eot", ".mp3", ".mp4", ".webm", ".ogg", ".json",
    ".xml", ".txt",
];

const PAGE_EXTENSIONS: &[&str] = &[".html", ".htm", ".php", ".asp", ".aspx", ".jsp"];

/// Does this request load a page, as opposed to an asset or API call?
pub fn is_page_navigation(ctx: &RequestContext) -> bool {
    let path = ctx.path.split(['?', '#']).next().unwrap_or("").to_lowercase();
    if path.contains("/api/") || ASSET_EXTENSIONS.iter().any(|ext| path.ends_with(ext)) {
        return false;
    }
    if let Some(dest) = ctx.header("sec-fetch-dest") {
        if dest.eq_ignore_ascii_case("document") || dest.eq_ignore_ascii_case("iframe") {
            return true;
        }
    }
    if ctx.accept().is_some_and(|a| a.trim_start().starts_with("text/html")) {
        return true;
    }
    let last_segment = path.rsplit('/').next().unwrap_or("");
    !last_segment.contains('.') || PAGE_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
}

struct RateChannel<'a> {
    label: &'a str,
    key:   Option<&'a str>,
    limit: u64,
}

pub struct BehavioralDetector {
    window:     Arc<WindowStore>,
    analyzer:   BehaviorAnalyzer,
    opts:       BehavioralOptions,
    base_limit: u32,
    weight:     f64,
}

impl BehavioralDetector {
    pub fn new(deps: &DetectorDeps) -> Self {
        Self {
            window:     Arc::clone(&deps.window),
            analyzer:   deps.analyzer.clone(),
            opts:       deps.options.behavioral.clone(),
            base_limit: deps.options.max_requests_per_minute,
            weight:     deps.options.detectors.behavioral.weight,
        }
    }

    fn contribution(&self, delta: f64, reason: impl Into<String>) -> Contribution {
        Contribution::new(NAME, Category::Behavioral, delta, reason).with_weight(self.weight)
    }

    fn over_limit(&self, excess: u64, label: &str, count: u64, limit: u64) -> Contribution {
        let impact = (OVER_LIMIT_BASE + excess as f64 * OVER_LIMIT_STEP).min(OVER_LIMIT_CAP);
        self.contribution(
            impact,
            format!("{label} rate limit exceeded: {count} over {limit}/min"),
        )
    }
}

#[async_trait]
impl Detector for BehavioralDetector {
    fn name(&self) -> &'static str {
        NAME
    }

    fn stage(&self) -> Stage {
        Stage::Behavioral
    }

    async fn detect(
        &self,
        ctx: &RequestContext,
        _prior: &AggregatedEvidence,
    ) -> Result<Vec<Contribution>, EngineError> {
        let Some(identity) = ctx.identity.strongest().map(str::to_string) else {
            return Ok(Vec::new());
        };
        let now = ctx.received_at;
        let counter_ttl = Duration::seconds(COUNTER_TTL_SECS);
        let is_page = is_page_navigation(ctx);
        let is_fetch = ctx.is_fetch_subrequest();
        let has_cookies = ctx.cookie_count() > 0;
        let has_referer = ctx.has_header("referer");
        let warmup = Duration::seconds(self.opts.warmup_secs as i64);

        let mut out = Vec::new();

        // ── Profile update (single write critical section) ────────────────────
        let profile_arc = self.window.get_or_create_profile(&identity, now);
        let (warming_up, prior_requests, never_sent_cookies, was_new_path, transition) = {
            let mut profile = profile_arc.write();
            let warming_up = profile.is_warming_up(now, warmup);
            let prior_requests = profile.request_count;
            let never_sent_cookies = profile.with_cookies == 0;
            let was_new_path = is_page && !profile.has_seen_path(&ctx.path);
            let transition = profile.record(now, &ctx.path, is_page, has_cookies, has_referer);
            (warming_up, prior_requests, never_sent_cookies, was_new_path, transition)
        };

        // ── Content-aware rate limiting per identity channel ──────────────────
        let warmup_factor = if warming_up { 2 } else { 1 };
        let total = self.window.incr_and_get(&format!("{identity}:r1m"), now, counter_ttl);
        let pages = if is_page {
            self.window.incr_and_get(&format!("{identity}:p1m"), now, counter_ttl)
        } else {
            self.window.peek_count(&format!("{identity}:p1m"), now, counter_ttl)
        };

        // HTTP/2 multiplexing: many assets per page means the page count
        // is the honest measure of activity.
        let effective = if pages > 0 && total > MULTIPLEX_FACTOR * pages { pages } else { total };
        let ip_limit = self.base_limit as u64 * warmup_factor;
        if effective > ip_limit {
            out.push(self.over_limit(effective - ip_limit, "request", effective, ip_limit));
        }

        let api_limit = self
            .opts
            .api_key_rate_limit
            .map(u64::from)
            .unwrap_or(self.base_limit as u64 * 2);
        let user_limit = self
            .opts
            .user_rate_limit
            .map(u64::from)
            .unwrap_or(self.base_limit as u64 * 3);
        let fp_limit = (self.base_limit as f64 * self.opts.fingerprint_multiplier) as u64;

        // The fingerprint identity is published by the client-side stage;
        // fall back to whatever the resolver put on the context.
        let fingerprint_identity = ctx
            .signals
            .get(crate::signal_bus::keys::CLIENT_FINGERPRINT_HASH)
            .and_then(|v| v.as_text().map(str::to_string))
            .or_else(|| ctx.identity.client_side.clone());

        let channels = [
            RateChannel {
                label: "fingerprint",
                key:   fingerprint_identity.as_deref(),
                limit: fp_limit,
            },
            RateChannel {
                label: "api key",
                key:   ctx.identity.api_key.as_deref(),
                limit: api_limit,
            },
            RateChannel {
                label: "user",
                key:   ctx.identity.user.as_deref(),
                limit: user_limit,
            },
        ];
        for channel in channels {
            let Some(key) = channel.key else { continue };
            let count = self.window.incr_and_get(&format!("{key}:r1m"), now, counter_ttl);
            let limit = channel.limit * warmup_factor;
            if count > limit {
                out.push(self.over_limit(count - limit, channel.label, count, limit));
            }
        }

        // ── Rapid sequential pages (assets do not count) ──────────────────────
        if is_page {
            let ring = self.window.push_timestamp(
                &format!("{identity}:pt"),
                now,
                Duration::seconds(TIMING_TTL_SECS),
            );
            if !warming_up && ring.len() >= 2 {
                let gap_ms = ring[ring.len() - 1] - ring[ring.len() - 2];
                if gap_ms < VERY_RAPID_PAGE_MS {
                    out.push(self.contribution(
                        VERY_RAPID_PAGE_IMPACT,
                        format!("pages {gap_ms}ms apart"),
                    ));
                } else if gap_ms < RAPID_PAGE_MS {
                    out.push(self.contribution(
                        RAPID_PAGE_IMPACT,
                        format!("rapid sequential pages ({gap_ms}ms)"),
                    ));
                }
            }
        }

        // ── Session hygiene (suppressed during warmup and for JS calls) ───────
        if is_fetch {
            out.push(self.contribution(FETCH_SUBREQUEST_RELIEF, "in-page fetch sub-request"));
        } else if !warming_up {
            if is_page && !has_referer && ctx.path != "/" && prior_requests > 1 {
                out.push(self.contribution(
                    MISSING_REFERER_IMPACT,
                    "no Referer on a non-initial page request",
                ));
            }
            if !has_cookies && never_sent_cookies && prior_requests > 2 {
                out.push(self.contribution(
                    NO_COOKIES_IMPACT,
                    format!("no cookies across {} requests", prior_requests + 1),
                ));
            }
        }

        // ── Profile anomalies ─────────────────────────────────────────────────
        // Short-horizon path set lives in the window store; the 24h view
        // lives in the profile. Both must call the path new for the flag.
        let new_to_recent_window = is_page
            && self.window.add_path(
                &format!("{identity}:paths"),
                &crate::behavior::navigation::simplify_path(&ctx.path),
                now,
                Duration::seconds(PATHS_TTL_SECS),
                MAX_TRACKED_PATHS,
            );
        {
            let profile = profile_arc.read();
            for anomaly in self.analyzer.analyze(&profile, now) {
                out.push(self.contribution(anomaly.delta, anomaly.reason));
            }
            if was_new_path && new_to_recent_window && prior_requests >= NEW_PATH_MIN_HISTORY {
                out.push(self.contribution(NEW_PATH_IMPACT, "first visit to a new path"));
            }
        }
        if let Some(transition) = transition {
            if let Some(anomaly) = self.analyzer.navigation_anomaly(&transition) {
                out.push(self.contribution(anomaly.delta, anomaly.reason));
            }
        }

        // Strong behavioral totals classify as scraping.
        let total_delta: f64 = out.iter().map(|c| c.confidence_delta).sum::<f64>().clamp(0.0, 1.0);
        if total_delta > SCRAPER_TOTAL && out.iter().all(|c| c.bot_type.is_none()) {
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
