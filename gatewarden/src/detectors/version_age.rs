// gatewarden/src/detectors/version_age.rs
//
// Browser / OS version age — stage 0.
//
// Scrapers pin whatever UA string their library shipped with; real
// browsers auto-update. The claimed browser major is compared against the
// release tracker, the OS token against a configured age classification,
// and the pair against a table of the highest browser version each OS can
// actually run (Chrome 130 on Windows XP never happened).

use std::sync::Arc;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;

use crate::config::VersionAgeOptions;
use crate::error::EngineError;
use crate::evidence::{AggregatedEvidence, BotType, Category, Contribution};
use crate::request::RequestContext;
use crate::stores::BrowserVersionService;

use super::{Detector, DetectorDeps, Stage};

const NAME: &str = "version_age";

const IMPOSSIBLE_COMBO_IMPACT: f64 = 0.9;
const SEVERE_AGE: u32 = 20;
const SLIGHT_AGE: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowserClaim {
    pub name:    &'static str,
    pub version: u32,
}

static BROWSER_PATTERNS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    // Order matters: Edge/Opera/Brave UAs all carry a Chrome token.
    vec![
        ("edge", Regex::new(r"Edg(?:e|A|iOS)?/(\d+)").unwrap()),
        ("opera", Regex::new(r"OPR/(\d+)").unwrap()),
        ("brave", Regex::new(r"Brave/(\d+)").unwrap()),
        ("chrome", Regex::new(r"Chrome/(\d+)").unwrap()),
        ("firefox", Regex::new(r"Firefox/(\d+)").unwrap()),
        ("safari", Regex::new(r"Version/(\d+)[\d.]* .*Safari/").unwrap()),
    ]
});

static OS_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"(?i)(windows nt \d+\.\d+)").unwrap(),
        Regex::new(r"(?i)(mac os x \d+[_.]\d+)").unwrap(),
        Regex::new(r"(?i)(android \d+)").unwrap(),
        Regex::new(r"(?i)(iphone os \d+)").unwrap(),
        Regex::new(r"(?i)(linux)").unwrap(),
    ]
});

pub fn parse_browser(ua: &str) -> Option<BrowserClaim> {
    for (name, pattern) in BROWSER_PATTERNS.iter() {
        if let Some(caps) = pattern.captures(ua) {
            if let Ok(version) = caps[1].parse::<u32>() {
                return Some(BrowserClaim { name, version });
            }
        }
    }
    None
}

/// Lowercased OS token with Mac versions normalized to underscores, e.g.
/// "windows nt 6.1", "mac os x 10_11", "android 5".
pub fn parse_os(ua: &str) -> Option<String> {
    for pattern in OS_PATTERNS.iter() {
        if let Some(caps) = pattern.captures(ua) {
            let token = caps[1].to_lowercase();
            return Some(if token.starts_with("mac os x") {
                token.replace('.', "_")
            } else {
                token
            });
        }
    }
    None
}

pub struct VersionAgeDetector {
    versions: Arc<dyn BrowserVersionService>,
    opts:     VersionAgeOptions,
    weight:   f64,
}

impl VersionAgeDetector {
    pub fn new(deps: &DetectorDeps) -> Self {
        Self {
            versions: Arc::clone(&deps.versions),
            opts:     deps.options.version_age.clone(),
            weight:   deps.options.detectors.version_age.weight,
        }
    }

    fn contribution(&self, delta: f64, reason: impl Into<String>) -> Contribution {
        Contribution::new(NAME, Category::VersionAge, delta, reason).with_weight(self.weight)
    }
}

#[async_trait]
impl Detector for VersionAgeDetector {
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

        let browser = parse_browser(ua);
        let os = parse_os(ua);
        let mut out = Vec::new();

        // Impossible pairings dominate every other finding.
        if let (Some(claim), Some(os_token)) = (&browser, &os) {
            if let Some(&max_supported) = self.opts.max_browser_version_by_os.get(os_token) {
                if claim.version > max_supported {
                    return Ok(vec![self
                        .contribution(
                            IMPOSSIBLE_COMBO_IMPACT,
                            format!(
                                "impossible combination: {} {} on {os_token} (max supported {max_supported})",
                                claim.name, claim.version
                            ),
                        )
                        .with_bot_type(BotType::Scraper)]);
                }
            }
        }

        let mut browser_outdated = false;
        if let Some(claim) = &browser {
            if let Some(latest) = self.versions.latest_version(claim.name) {
                let age = latest.saturating_sub(claim.version);
                let finding = if age > SEVERE_AGE {
                    Some((self.opts.severe_impact, "severely outdated"))
                } else if age > self.opts.max_age {
                    Some((self.opts.moderate_impact, "moderately outdated"))
                } else if age > SLIGHT_AGE {
                    Some((self.opts.slight_impact, "slightly outdated"))
                } else {
                    None
                };
                if let Some((impact, label)) = finding {
                    browser_outdated = true;
                    out.push(self.contribution(
                        impact,
                        format!(
                            "{label} {}: claimed {} vs latest {latest}",
                            claim.name, claim.version
                        ),
                    ));
                }
            }
        }

        let mut os_outdated = false;
        if let Some(os_token) = &os {
            if let Some(class) = self.opts.os_classes.get(os_token) {
                os_outdated = true;
                out.push(self.contribution(
                    class.impact(),
                    format!("outdated operating system: {os_token}"),
                ));
            }
        }

        if browser_outdated && os_outdated {
            out.push(self.contribution(
                self.opts.combined_bonus,
                "browser and operating system both outdated",
            ));
        }

        Ok(out)
    }
}
