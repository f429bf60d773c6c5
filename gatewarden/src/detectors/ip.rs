// gatewarden/src/detectors/ip.rs
//
// Source address classification — stage 0.
//
// Priority order: downloaded provider ranges beat the static datacenter
// set, which beats the first-octet heuristic; only the strongest match
// contributes. Tor exits are checked last and classify as malicious.
// RFC1918 / loopback sources publish ip.is_local and skip the
// datacenter checks entirely.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::EngineError;
use crate::evidence::{AggregatedEvidence, BotType, Category, Contribution};
use crate::request::RequestContext;
use crate::signal_bus::keys;
use crate::stores::{CidrRange, PatternCache};

use super::{Detector, DetectorDeps, Stage};

const NAME: &str = "ip";

const DOWNLOADED_RANGE_IMPACT: f64 = 0.5;
const STATIC_RANGE_IMPACT: f64 = 0.4;
const OCTET_HEURISTIC_IMPACT: f64 = 0.3;
const TOR_EXIT_IMPACT: f64 = 0.5;

/// First-octet blocks commonly announced by the big clouds. Coarse by
/// design; the CIDR sets above it take precedence.
const PROVIDER_OCTETS: &[(u8, &str)] = &[
    (3, "aws"),
    (13, "aws"),
    (18, "aws"),
    (52, "aws"),
    (54, "aws"),
    (20, "azure"),
    (40, "azure"),
    (104, "azure"),
    (34, "gcp"),
    (35, "gcp"),
    (130, "gcp"),
    (129, "oracle"),
    (132, "oracle"),
    (134, "oracle"),
    (138, "oracle"),
    (140, "oracle"),
];

pub struct IpDetector {
    static_ranges: Vec<(CidrRange, String)>,
    patterns:      Arc<dyn PatternCache>,
    tor_enabled:   bool,
    weight:        f64,
}

impl IpDetector {
    /// Static CIDRs are parsed once here; malformed entries are dropped
    /// with a warning rather than failing startup.
    pub fn new(deps: &DetectorDeps) -> Self {
        let static_ranges = deps
            .options
            .datacenter_ip_prefixes
            .iter()
            .filter_map(|text| match CidrRange::parse(text) {
                Some(range) => Some((range, text.clone())),
                None => {
                    tracing::warn!(prefix = %text, "ignoring malformed datacenter CIDR");
                    None
                }
            })
            .collect();
        Self {
            static_ranges,
            patterns:    Arc::clone(&deps.patterns),
            tor_enabled: deps.options.ip.tor_check_enabled,
            weight:      deps.options.detectors.ip.weight,
        }
    }

    fn contribution(&self, delta: f64, reason: impl Into<String>) -> Contribution {
        Contribution::new(NAME, Category::Ip, delta, reason).with_weight(self.weight)
    }
}

fn is_local(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private() || v4.is_loopback() || v4.is_link_local()
        }
        IpAddr::V6(v6) => v6.is_loopback() || (v6.segments()[0] & 0xfe00) == 0xfc00,
    }
}

#[async_trait]
impl Detector for IpDetector {
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

        if is_local(ip) {
            ctx.signals.put(keys::IP_IS_LOCAL, true);
            return Ok(Vec::new());
        }
        ctx.signals.put(keys::IP_IS_LOCAL, false);

        let mut out = Vec::new();

        // 1. Downloaded provider ranges
        if let Some(hit) = self.patterns.match_cidr(ip) {
            let provider = hit.provider.as_deref().unwrap_or("unknown provider");
            out.push(self.contribution(
                DOWNLOADED_RANGE_IMPACT,
                format!("cloud provider range {} ({provider})", hit.text),
            ));
        }
        // 2. Static datacenter set
        else if let Some((_, text)) =
            self.static_ranges.iter().find(|(range, _)| range.contains(ip))
        {
            out.push(self.contribution(STATIC_RANGE_IMPACT, format!("datacenter range {text}")));
        }
        // 3. First-octet heuristic
        else if let IpAddr::V4(v4) = ip {
            if let Some((_, provider)) =
                PROVIDER_OCTETS.iter().find(|(octet, _)| *octet == v4.octets()[0])
            {
                out.push(self.contribution(
                    OCTET_HEURISTIC_IMPACT,
                    format!("address block commonly announced by {provider}"),
                ));
            }
        }

        // 4. Tor exit nodes
        if self.tor_enabled && self.patterns.is_tor_exit(ip) {
            out.push(
                self.contribution(TOR_EXIT_IMPACT, "Tor exit node")
                    .with_bot_type(BotType::MaliciousBot),
            );
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::ProviderRange;
    use crate::test_support::{deps_with, plain_deps, tor_enabled_deps};

    fn ctx_from(ip: &str) -> RequestContext {
        RequestContext::builder("GET", "/")
            .remote_addr(ip.parse().unwrap())
            .build()
    }

    async fn run(det: &IpDetector, ctx: &RequestContext) -> Vec<Contribution> {
        det.detect(ctx, &AggregatedEvidence::unknown()).await.unwrap()
    }

    #[tokio::test]
    async fn local_addresses_publish_signal_and_contribute_nothing() {
        let det = IpDetector::new(&plain_deps());
        for ip in ["10.1.2.3", "192.168.1.1", "172.16.0.9", "127.0.0.1"] {
            let ctx = ctx_from(ip);
            let out = run(&det, &ctx).await;
            assert!(out.is_empty());
            assert_eq!(ctx.signals.get_bool(keys::IP_IS_LOCAL), Some(true), "{ip}");
        }
    }

    #[tokio::test]
    async fn downloaded_range_beats_static_and_heuristic() {
        let deps = deps_with(|cache| {
            cache.replace_cidr_ranges(vec![
                ProviderRange::parse("52.94.0.0/16", Some("aws")).unwrap()
            ]);
        });
        let det = IpDetector::new(&deps);
        let out = run(&det, &ctx_from("52.94.12.4")).await;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].confidence_delta, DOWNLOADED_RANGE_IMPACT);
        assert!(out[0].reason.contains("aws"));
    }

    #[tokio::test]
    async fn static_range_matches_when_no_download() {
        let det = IpDetector::new(&plain_deps());
        // 13.64.0.0/11 ships in the default datacenter set.
        let out = run(&det, &ctx_from("13.65.1.2")).await;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].confidence_delta, STATIC_RANGE_IMPACT);
    }

    #[tokio::test]
    async fn octet_heuristic_is_the_last_resort() {
        let det = IpDetector::new(&plain_deps());
        // 54.254/16 is not in the default static set; first octet 54 is AWS-ish.
        let out = run(&det, &ctx_from("54.254.1.2")).await;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].confidence_delta, OCTET_HEURISTIC_IMPACT);
        assert!(out[0].reason.contains("aws"));
    }

    #[tokio::test]
    async fn residential_address_is_quiet() {
        let det = IpDetector::new(&plain_deps());
        let out = run(&det, &ctx_from("81.2.69.142")).await;
        assert!(out.is_empty(), "unexpected: {out:?}");
    }

    #[tokio::test]
    async fn tor_exit_classifies_malicious() {
        let deps = tor_enabled_deps(|cache| {
            cache.replace_tor_exits(vec!["185.220.101.5".parse().unwrap()]);
        });
        let det = IpDetector::new(&deps);
        let out = run(&det, &ctx_from("185.220.101.5")).await;
        assert!(out
            .iter()
            .any(|c| c.bot_type == Some(BotType::MaliciousBot)
                && c.confidence_delta == TOR_EXIT_IMPACT));
    }

    #[tokio::test]
    async fn forwarded_for_first_token_wins() {
        let det = IpDetector::new(&plain_deps());
        let ctx = RequestContext::builder("GET", "/")
            .header("X-Forwarded-For", "13.65.1.2, 10.0.0.1")
            .remote_addr("10.0.0.1".parse().unwrap())
            .build();
        let out = run(&det, &ctx).await;
        assert_eq!(out.len(), 1);
        assert!(out[0].reason.contains("datacenter range"));
    }
}
