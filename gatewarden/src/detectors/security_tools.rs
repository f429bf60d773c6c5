// gatewarden/src/detectors/security_tools.rs
//
// Security tooling recognition — stage 0.
//
// One hit is enough: scanners identify themselves loudly, so the first
// matching pattern contributes 0.95 as MaliciousBot and scanning stops.
// The built-in set covers the common tools; the pattern cache layers
// downloaded feed entries on top (refreshed hourly by the fetcher, stale
// set kept on failure). Patterns compile with a bounded size limit and
// degrade to substring match when compilation fails.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::EngineError;
use crate::evidence::{AggregatedEvidence, BotType, Category, Contribution};
use crate::request::RequestContext;
use crate::stores::{PatternCache, ToolCategory, ToolPattern};

use super::{Detector, DetectorDeps, Stage};

const NAME: &str = "security_tools";

const MATCH_IMPACT: f64 = 0.95;

fn builtin_patterns() -> Vec<ToolPattern> {
    use ToolCategory::*;
    [
        ("sqlmap", SqlInjection, r"(?i)\bsqlmap\b"),
        ("havij", SqlInjection, r"(?i)\bhavij\b"),
        ("nikto", VulnerabilityScanner, r"(?i)\bnikto\b"),
        ("nessus", VulnerabilityScanner, r"(?i)\bnessus\b"),
        ("openvas", VulnerabilityScanner, r"(?i)\bopenvas\b"),
        ("acunetix", VulnerabilityScanner, r"(?i)acunetix"),
        ("nuclei", VulnerabilityScanner, r"(?i)\bnuclei\b"),
        ("qualys", VulnerabilityScanner, r"(?i)\bqualys\b"),
        ("nmap", PortScanner, r"(?i)nmap scripting engine|\bnmap\b"),
        ("masscan", PortScanner, r"(?i)\bmasscan\b"),
        ("zgrab", PortScanner, r"(?i)\bzgrab\b"),
        ("gobuster", DirectoryBruteForce, r"(?i)\bgobuster\b"),
        ("dirbuster", DirectoryBruteForce, r"(?i)\bdirbuster\b"),
        ("dirb", DirectoryBruteForce, r"(?i)\bdirb\b"),
        ("feroxbuster", DirectoryBruteForce, r"(?i)\bferoxbuster\b"),
        ("ffuf", DirectoryBruteForce, r"(?i)\bffuf\b"),
        ("wfuzz", DirectoryBruteForce, r"(?i)\bwfuzz\b"),
        ("wpscan", CmsScanner, r"(?i)\bwpscan\b"),
        ("joomscan", CmsScanner, r"(?i)\bjoomscan\b"),
        ("droopescan", CmsScanner, r"(?i)\bdroopescan\b"),
        ("metasploit", ExploitFramework, r"(?i)metasploit"),
        ("sqlninja", ExploitFramework, r"(?i)\bsqlninja\b"),
        ("hydra", CredentialAttack, r"(?i)\bhydra\b"),
        ("medusa", CredentialAttack, r"(?i)\bmedusa\b"),
        ("brutus", CredentialAttack, r"(?i)\bbrutus\b"),
        ("burpsuite", WebProxy, r"(?i)burp\s?(suite|collaborator)"),
        ("owasp-zap", WebProxy, r"(?i)owasp\s?zap|zaproxy"),
        ("mitmproxy", WebProxy, r"(?i)\bmitmproxy\b"),
        ("whatweb", Reconnaissance, r"(?i)\bwhatweb\b"),
        ("shodan", Reconnaissance, r"(?i)\bshodan\b"),
        ("censys", Reconnaissance, r"(?i)\bcensys\b"),
    ]
    .into_iter()
    .map(|(name, category, pattern)| ToolPattern::new(name, category, pattern))
    .collect()
}

pub struct SecurityToolDetector {
    builtin:  Vec<ToolPattern>,
    patterns: Arc<dyn PatternCache>,
    weight:   f64,
}

impl SecurityToolDetector {
    pub fn new(deps: &DetectorDeps) -> Self {
        Self {
            builtin:  builtin_patterns(),
            patterns: Arc::clone(&deps.patterns),
            weight:   deps.options.detectors.security_tools.weight,
        }
    }

    fn hit(&self, pattern: &ToolPattern) -> Contribution {
        Contribution::new(
            NAME,
            Category::SecurityTool,
            MATCH_IMPACT,
            format!("security tool {} ({})", pattern.matcher.name, pattern.category),
        )
        .with_weight(self.weight)
        .with_bot_type(BotType::MaliciousBot)
        .with_bot_name(pattern.matcher.name.clone())
    }
}

#[async_trait]
impl Detector for SecurityToolDetector {
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
            return Ok(Vec::new());
        };

        for pattern in &self.builtin {
            if pattern.matcher.matches(ua) {
                return Ok(vec![self.hit(pattern)]);
            }
        }
        for pattern in self.patterns.tool_patterns().iter() {
            if pattern.matcher.matches(ua) {
                return Ok(vec![self.hit(pattern)]);
            }
        }

        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{deps_with, plain_deps};

    async fn run(det: &SecurityToolDetector, ua: &str) -> Vec<Contribution> {
        let ctx = RequestContext::builder("GET", "/").header("User-Agent", ua).build();
        det.detect(&ctx, &AggregatedEvidence::unknown()).await.unwrap()
    }

    #[tokio::test]
    async fn sqlmap_is_a_first_match_malicious_hit() {
        let det = SecurityToolDetector::new(&plain_deps());
        let out = run(&det, "sqlmap/1.7.2#stable (https://sqlmap.org)").await;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].confidence_delta, MATCH_IMPACT);
        assert_eq!(out[0].bot_type, Some(BotType::MaliciousBot));
        assert_eq!(out[0].bot_name.as_deref(), Some("sqlmap"));
        assert!(out[0].reason.contains("sql-injection"));
    }

    #[tokio::test]
    async fn scanner_zoo() {
        let det = SecurityToolDetector::new(&plain_deps());
        for ua in [
            "Mozilla/5.0 Nikto/2.5.0",
            "masscan/1.3 (https://github.com/robertdavidgraham/masscan)",
            "gobuster/3.6",
            "WPScan v3.8.25 (https://wpscan.com/wordpress-security-scanner)",
            "Mozilla/5.0 (compatible; Nuclei - Open-source project)",
        ] {
            let out = run(&det, ua).await;
            assert_eq!(out.len(), 1, "no hit for {ua}");
            assert_eq!(out[0].bot_type, Some(BotType::MaliciousBot));
        }
    }

    #[tokio::test]
    async fn browsers_and_plain_tools_pass() {
        let det = SecurityToolDetector::new(&plain_deps());
        for ua in [
            "Mozilla/5.0 (Windows NT 10.0) Chrome/138 Safari/537.36",
            "curl/8.4.0",
        ] {
            assert!(run(&det, ua).await.is_empty(), "false hit for {ua}");
        }
    }

    #[tokio::test]
    async fn downloaded_feed_extends_the_set() {
        let deps = deps_with(|cache| {
            cache.replace_tool_patterns(vec![ToolPattern::new(
                "custom-scanner",
                ToolCategory::Suspicious,
                r"(?i)evilscan",
            )]);
        });
        let det = SecurityToolDetector::new(&deps);
        let out = run(&det, "EvilScan/0.1").await;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].bot_name.as_deref(), Some("custom-scanner"));
    }
}
