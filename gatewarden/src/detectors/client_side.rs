// gatewarden/src/detectors/client_side.rs
//
// Client-side fingerprint evaluation — stage 0.
//
// The beacon endpoint (outside this crate) collects canvas/WebGL/audio
// fingerprints and stores the analyzed record keyed by HMAC(ip ∥ salt).
// Here we only look the record up: a browser-looking page load with no
// record is mildly suspicious; a present record contributes according to
// its headless likelihood, integrity, and consistency analysis.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::ClientSideOptions;
use crate::error::EngineError;
use crate::evidence::{AggregatedEvidence, BotType, Category, Contribution};
use crate::identity::IdentityResolver;
use crate::request::RequestContext;
use crate::signal_bus::keys;
use crate::stores::FingerprintStore;

use super::{Detector, DetectorDeps, Stage};

const NAME: &str = "client_side";

const NO_FINGERPRINT_IMPACT: f64 = 0.15;
const HEADLESS_FACTOR: f64 = 0.8;
const INTEGRITY_FACTOR: f64 = 0.5;
const CONSISTENCY_FACTOR: f64 = 0.3;
const CONSISTENCY_FLOOR: f64 = 80.0;
const REASON_IMPACT: f64 = 0.1;
const MAX_REASONS: usize = 3;

const BROWSER_HINTS: &[&str] = &["mozilla", "chrome", "safari", "firefox", "edge", "opera"];

pub struct ClientSideDetector {
    fingerprints: Arc<dyn FingerprintStore>,
    identity:     IdentityResolver,
    opts:         ClientSideOptions,
    weight:       f64,
}

impl ClientSideDetector {
    pub fn new(deps: &DetectorDeps) -> Self {
        Self {
            fingerprints: Arc::clone(&deps.fingerprints),
            identity:     deps.identity.clone(),
            opts:         deps.options.client_side.clone(),
            weight:       deps.options.detectors.client_side.weight,
        }
    }

    fn contribution(&self, delta: f64, reason: impl Into<String>) -> Contribution {
        Contribution::new(NAME, Category::ClientSide, delta, reason).with_weight(self.weight)
    }

    fn looks_like_browser_page_load(ctx: &RequestContext) -> bool {
        let browser_ua = ctx
            .user_agent()
            .map(|ua| {
                let lower = ua.to_lowercase();
                BROWSER_HINTS.iter().any(|h| lower.contains(h))
            })
            .unwrap_or(false);
        let html_accept = ctx.accept().is_some_and(|a| a.contains("text/html"));
        browser_ua && html_accept
    }
}

#[async_trait]
impl Detector for ClientSideDetector {
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
        let Some(ip) = ctx.client_ip() else {
            return Ok(Vec::new());
        };

        let lookup =
            self.identity
                .fingerprint_lookup_key(ctx.received_at, ip, &self.opts.lookup_salt);

        let Some(fp) = self.fingerprints.get(&lookup) else {
            if Self::looks_like_browser_page_load(ctx) {
                return Ok(vec![
                    self.contribution(NO_FINGERPRINT_IMPACT, "browser request with no fingerprint")
                ]);
            }
            return Ok(Vec::new());
        };

        // Later stages key their per-fingerprint windows off these.
        ctx.signals.put(
            keys::CLIENT_FINGERPRINT_HASH,
            self.identity.fingerprint_identity(ctx.received_at, &fp),
        );
        ctx.signals.put(
            format!("{}plugin", keys::IDENTITY_PREFIX),
            self.identity.plugin_identity(ctx.received_at, &fp, ctx),
        );
        ctx.signals.put(keys::CLIENT_INTEGRITY_SCORE, fp.integrity_score);
        ctx.signals.put(keys::CLIENT_HEADLESS_LIKELIHOOD, fp.headless_likelihood);

        let mut out = Vec::new();

        if fp.headless_likelihood >= self.opts.headless_threshold {
            out.push(
                self.contribution(
                    HEADLESS_FACTOR * fp.headless_likelihood,
                    format!("headless browser likelihood {:.2}", fp.headless_likelihood),
                )
                .with_bot_type(BotType::Scraper),
            );
        }

        if fp.integrity_score < self.opts.min_integrity_score {
            let delta =
                (self.opts.min_integrity_score - fp.integrity_score) / 100.0 * INTEGRITY_FACTOR;
            out.push(self.contribution(
                delta,
                format!("low fingerprint integrity {:.0}", fp.integrity_score),
            ));
        }

        if fp.consistency < CONSISTENCY_FLOOR {
            let delta = (CONSISTENCY_FLOOR - fp.consistency) / 100.0 * CONSISTENCY_FACTOR;
            out.push(self.contribution(
                delta,
                format!("inconsistent fingerprint components {:.0}", fp.consistency),
            ));
        }

        for reason in fp.analysis_reasons.iter().take(MAX_REASONS) {
            out.push(self.contribution(REASON_IMPACT, format!("fingerprint analysis: {reason}")));
        }

        Ok(out)
    }
}
