// gatewarden/src/detectors/user_agent.rs
//
// User-Agent classification — stage 0.
//
// Check order matters: a verified-bot prefix short-circuits everything
// else with a single human-leaning contribution, so allowlisted crawlers
// are never penalized by the later rules.

use std::sync::Arc;

use aho_corasick::AhoCorasick;
use async_trait::async_trait;
use regex::RegexSet;

use crate::config::VerifiedBotPattern;
use crate::error::EngineError;
use crate::evidence::{AggregatedEvidence, BotType, Category, Contribution};
use crate::request::RequestContext;
use crate::signal_bus::keys;
use crate::stores::PatternCache;

use super::{Detector, DetectorDeps, Stage};

const NAME: &str = "user_agent";

const MISSING_UA_IMPACT: f64 = 0.8;
const MALICIOUS_IMPACT: f64 = 0.3;
const AUTOMATION_IMPACT: f64 = 0.5;
const STATIC_PATTERN_IMPACT: f64 = 0.2;
const DOWNLOADED_PATTERN_IMPACT: f64 = 0.25;
const SHORT_UA_IMPACT: f64 = 0.4;
const URL_IN_UA_IMPACT: f64 = 0.3;
const WELL_FORMED_RELIEF: f64 = -0.15;
const SHORT_UA_LIMIT: usize = 20;

/// Substrings that only appear in hostile or spoofed agents.
const MALICIOUS_SUBSTRINGS: &[&str] = &[
    "masscan", "zgrab", "attack", "exploit", "harvest", "grabber", "siteripper", "webcopier",
    "offline explorer",
];

/// Browser-automation frameworks.
const AUTOMATION_SUBSTRINGS: &[&str] = &[
    "selenium", "webdriver", "phantomjs", "puppeteer", "playwright", "headlesschrome",
    "headless chrome", "cypress", "splash", "nightmare",
];

/// HTTP libraries and CLI clients, matched as anchored patterns.
const STATIC_PATTERNS: &[&str] = &[
    r"(?i)^curl/",
    r"(?i)^wget/",
    r"(?i)^python-requests/",
    r"(?i)^python-urllib/",
    r"(?i)^go-http-client/",
    r"(?i)^java/",
    r"(?i)^okhttp/",
    r"(?i)^libwww-perl/",
    r"(?i)^scrapy/",
    r"(?i)^httpx/",
    r"(?i)^aiohttp/",
    r"(?i)^php/",
    r"(?i)^ruby\b",
    r"(?i)^node-fetch/",
    r"(?i)^axios/",
];

pub struct UserAgentDetector {
    whitelist:  Vec<VerifiedBotPattern>,
    malicious:  AhoCorasick,
    automation: AhoCorasick,
    static_set: RegexSet,
    patterns:   Arc<dyn PatternCache>,
    weight:     f64,
}

impl UserAgentDetector {
    pub fn new(deps: &DetectorDeps) -> Self {
        let build = |set: &[&str]| {
            AhoCorasick::builder()
                .ascii_case_insensitive(true)
                .build(set)
                .expect("substring set builds")
        };
        Self {
            whitelist:  deps.options.whitelisted_bots.clone(),
            malicious:  build(MALICIOUS_SUBSTRINGS),
            automation: build(AUTOMATION_SUBSTRINGS),
            static_set: RegexSet::new(STATIC_PATTERNS).expect("static patterns are valid"),
            patterns:   Arc::clone(&deps.patterns),
            weight:     deps.options.detectors.user_agent.weight,
        }
    }

    fn contribution(&self, delta: f64, reason: impl Into<String>) -> Contribution {
        Contribution::new(NAME, Category::UserAgent, delta, reason).with_weight(self.weight)
    }
}

#[async_trait]
impl Detector for UserAgentDetector {
    fn name(&self) -> &'static str {
        NAME
    }

    fn stage(&self) -> Stage {
        Stage::RawSignals
    }

    async fn detect(
        &self,
        ctx: &RequestContext,
        _prior: &AggregatedEvidence,
    ) -> Result<Vec<Contribution>, EngineError> {
        let Some(ua) = ctx.user_agent() else {
            ctx.signals.put(keys::UA_EMPTY, true);
            ctx.signals.put(keys::UA_LENGTH, 0i64);
            return Ok(vec![self.contribution(MISSING_UA_IMPACT, "missing User-Agent header")]);
        };

        ctx.signals.put(keys::UA_EMPTY, false);
        ctx.signals.put(keys::UA_LENGTH, ua.len() as i64);

        // Verified bots pass, whatever else the string contains.
        if let Some(verified) = self.whitelist.iter().find(|p| ua.starts_with(&p.prefix)) {
            return Ok(vec![self
                .contribution(-1.0, format!("verified bot: {}", verified.name))
                .with_bot_type(BotType::VerifiedBot)
                .with_bot_name(verified.name.clone())]);
        }

        let mut out = Vec::new();

        let mut seen = std::collections::HashSet::new();
        for m in self.malicious.find_iter(ua) {
            if seen.insert(m.pattern()) {
                let needle = MALICIOUS_SUBSTRINGS[m.pattern().as_usize()];
                out.push(self.contribution(
                    MALICIOUS_IMPACT,
                    format!("malicious agent marker '{needle}'"),
                ));
            }
        }

        seen.clear();
        for m in self.automation.find_iter(ua) {
            if seen.insert(m.pattern()) {
                let needle = AUTOMATION_SUBSTRINGS[m.pattern().as_usize()];
                out.push(
                    self.contribution(
                        AUTOMATION_IMPACT,
                        format!("automation framework '{needle}'"),
                    )
                    .with_bot_type(BotType::Scraper),
                );
            }
        }

        for idx in self.static_set.matches(ua) {
            out.push(
                self.contribution(
                    STATIC_PATTERN_IMPACT,
                    format!("known client library (pattern {idx})"),
                )
                .with_bot_type(BotType::Tool),
            );
        }

        // Downloaded list: first hit counts, then stop scanning.
        for pattern in self.patterns.ua_patterns().iter() {
            if pattern.matches(ua) {
                out.push(self.contribution(
                    DOWNLOADED_PATTERN_IMPACT,
                    format!("community bot list: {}", pattern.name),
                ));
                break;
            }
        }

        if ua.len() < SHORT_UA_LIMIT {
            out.push(self.contribution(
                SHORT_UA_IMPACT,
                format!("unusually short User-Agent ({} chars)", ua.len()),
            ));
        }

        if ua.contains("http://") || ua.contains("https://") {
            out.push(self.contribution(URL_IN_UA_IMPACT, "URL embedded in User-Agent"));
        }

        // A strong total without an explicit classification defaults to
        // Scraper on the strongest finding.
        let total: f64 = out.iter().map(|c| c.confidence_delta).sum::<f64>().clamp(0.0, 1.0);
        if total > 0.5 && out.iter().all(|c| c.bot_type.is_none()) {
            if let Some(strongest) = out
                .iter_mut()
                .max_by(|a, b| a.confidence_delta.partial_cmp(&b.confidence_delta).unwrap())
            {
                strongest.bot_type = Some(BotType::Scraper);
            }
        }

        // A long, well-formed browser string with nothing to flag leans
        // human.
        if out.is_empty() && ua.starts_with("Mozilla/5.0 (") && ua.len() >= 60 {
            out.push(self.contribution(WELL_FORMED_RELIEF, "well-formed browser User-Agent"));
        }

        Ok(out)
    }
}
