// gatewarden/src/detectors/headers.rs
//
// Header anomaly checks — stage 0.
//
// Real browsers ship a predictable header set in a predictable order.
// Absence, wildcard Accept values, automation markers, and a User-Agent
// buried deep in the header list each add a bounded penalty.

use async_trait::async_trait;

use crate::error::EngineError;
use crate::evidence::{AggregatedEvidence, Category, Contribution};
use crate::request::RequestContext;
use crate::signal_bus::keys;

use super::{Detector, DetectorDeps, Stage};

const NAME: &str = "headers";

/// Headers every mainstream browser sends on navigation.
const EXPECTED_BROWSER_HEADERS: &[&str] = &[
    "accept",
    "accept-encoding",
    "accept-language",
    "cache-control",
    "connection",
    "upgrade-insecure-requests",
];

const AUTOMATION_HEADERS: &[&str] = &["x-requested-with", "x-automation", "x-bot"];

const MISSING_HEADER_STEP: f64 = 0.1;
const MISSING_HEADERS_CAP: f64 = 0.6;
const MISSING_ACCEPT_LANGUAGE_IMPACT: f64 = 0.2;
const SUSPICIOUS_ACCEPT_LANGUAGE_IMPACT: f64 = 0.15;
const GENERIC_ACCEPT_IMPACT: f64 = 0.2;
const CONNECTION_CLOSE_IMPACT: f64 = 0.15;
const AUTOMATION_HEADER_IMPACT: f64 = 0.4;
const UA_POSITION_IMPACT: f64 = 0.1;
const TOO_FEW_HEADERS_IMPACT: f64 = 0.3;
const COMPLETE_PROFILE_RELIEF: f64 = -0.35;
const UA_EXPECTED_WITHIN: usize = 6;
const MIN_HEADER_COUNT: usize = 4;

pub struct HeaderDetector {
    weight: f64,
}

impl HeaderDetector {
    pub fn new(deps: &DetectorDeps) -> Self {
        Self { weight: deps.options.detectors.headers.weight }
    }

    fn contribution(&self, delta: f64, reason: impl Into<String>) -> Contribution {
        Contribution::new(NAME, Category::Headers, delta, reason).with_weight(self.weight)
    }
}

#[async_trait]
impl Detector for HeaderDetector {
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
        let mut out = Vec::new();
        ctx.signals.put(keys::HEADERS_COUNT, ctx.header_count() as i64);

        let missing: Vec<&str> = EXPECTED_BROWSER_HEADERS
            .iter()
            .copied()
            .filter(|h| !ctx.has_header(h))
            .collect();
        if !missing.is_empty() {
            let penalty = (missing.len() as f64 * MISSING_HEADER_STEP).min(MISSING_HEADERS_CAP);
            out.push(self.contribution(
                penalty,
                format!("missing browser headers: {}", missing.join(", ")),
            ));
        }

        let accept_language = ctx.header("accept-language");
        match accept_language {
            None => {
                out.push(self.contribution(
                    MISSING_ACCEPT_LANGUAGE_IMPACT,
                    "no Accept-Language header",
                ));
            }
            Some(al) => {
                let al = al.trim();
                if al == "*" || al.len() < 5 {
                    out.push(self.contribution(
                        SUSPICIOUS_ACCEPT_LANGUAGE_IMPACT,
                        format!("suspicious Accept-Language '{al}'"),
                    ));
                }
            }
        }

        if accept_language.is_none() {
            if ctx.accept().map(str::trim) == Some("*/*") {
                out.push(self.contribution(
                    GENERIC_ACCEPT_IMPACT,
                    "generic */* Accept without Accept-Language",
                ));
            }
            if ctx
                .header("connection")
                .is_some_and(|c| c.eq_ignore_ascii_case("close"))
            {
                out.push(self.contribution(
                    CONNECTION_CLOSE_IMPACT,
                    "Connection: close without Accept-Language",
                ));
            }
        }

        for automation in AUTOMATION_HEADERS {
            if ctx.has_header(automation) {
                out.push(self.contribution(
                    AUTOMATION_HEADER_IMPACT,
                    format!("automation header '{automation}'"),
                ));
            }
        }

        if let Some(position) = ctx.header_position("user-agent") {
            if position >= UA_EXPECTED_WITHIN {
                out.push(self.contribution(
                    UA_POSITION_IMPACT,
                    format!("User-Agent at position {position}, expected in the first {UA_EXPECTED_WITHIN}"),
                ));
            }
        }

        if ctx.header_count() < MIN_HEADER_COUNT {
            out.push(self.contribution(
                TOO_FEW_HEADERS_IMPACT,
                format!("only {} headers", ctx.header_count()),
            ));
        }

        // The full browser profile with a sane language, a referrer and a
        // session cookie is strong human evidence.
        if out.is_empty()
            && missing.is_empty()
            && ctx.has_header("referer")
            && ctx.has_header("cookie")
        {
            out.push(self.contribution(
                COMPLETE_PROFILE_RELIEF,
                "complete browser header profile",
            ));
        }

        Ok(out)
    }
}
