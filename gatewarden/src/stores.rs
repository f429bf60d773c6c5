// gatewarden/src/stores.rs
//
// Narrow interfaces to the external collaborators: the weight store the
// heuristic model learns into, the pattern cache fed by downloaded bot
// lists and cloud IP ranges, the browser release tracker, the client-side
// fingerprint store, and the optional LLM transport.
//
// Failures behind these interfaces never fail the pipeline; detectors fall
// back to their built-in defaults. The in-memory implementations here are
// what the tests and the demo binary wire in.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

// ── Weight store ──────────────────────────────────────────────────────────────

/// Persistence for learned feature weights. Reads are on the inference
/// path and must be cheap; writes are batched by the learning worker.
#[async_trait]
pub trait WeightStore: Send + Sync {
    async fn weight(&self, sig_type: &str, signature: &str) -> Option<f64>;
    async fn all_weights(&self, sig_type: &str) -> Vec<(String, f64)>;
    async fn record_observation(&self, sig_type: &str, signature: &str, was_bot: bool, impact: f64);
}

/// EMA-updating in-memory weight store.
pub struct MemoryWeightStore {
    weights:       DashMap<(String, String), f64>,
    learning_rate: f64,
}

impl MemoryWeightStore {
    pub fn new(learning_rate: f64) -> Self {
        Self { weights: DashMap::new(), learning_rate }
    }
}

impl Default for MemoryWeightStore {
    fn default() -> Self {
        Self::new(0.1)
    }
}

#[async_trait]
impl WeightStore for MemoryWeightStore {
    async fn weight(&self, sig_type: &str, signature: &str) -> Option<f64> {
        self.weights
            .get(&(sig_type.to_string(), signature.to_string()))
            .map(|w| *w)
    }

    async fn all_weights(&self, sig_type: &str) -> Vec<(String, f64)> {
        self.weights
            .iter()
            .filter(|e| e.key().0 == sig_type)
            .map(|e| (e.key().1.clone(), *e.value()))
            .collect()
    }

    async fn record_observation(&self, sig_type: &str, signature: &str, was_bot: bool, impact: f64) {
        let target = if was_bot { impact } else { -impact };
        let alpha = self.learning_rate;
        let mut entry = self
            .weights
            .entry((sig_type.to_string(), signature.to_string()))
            .or_insert(0.0);
        *entry = *entry * (1.0 - alpha) + target * alpha;
    }
}

// ── Pattern cache ─────────────────────────────────────────────────────────────

/// One downloaded User-Agent pattern. Compiled once on fetch; patterns
/// that fail to compile degrade to case-insensitive substring match.
#[derive(Debug, Clone)]
pub struct UaPattern {
    pub name:    String,
    pub pattern: String,
    regex:       Option<Arc<Regex>>,
}

impl UaPattern {
    pub fn compile(name: impl Into<String>, pattern: impl Into<String>) -> Self {
        let pattern = pattern.into();
        let regex = regex::RegexBuilder::new(&pattern)
            .case_insensitive(true)
            .size_limit(1 << 20)
            .build()
            .ok()
            .map(Arc::new);
        Self { name: name.into(), pattern, regex }
    }

    pub fn matches(&self, ua: &str) -> bool {
        match &self.regex {
            Some(re) => re.is_match(ua),
            None => ua.to_lowercase().contains(&self.pattern.to_lowercase()),
        }
    }
}

/// Category of a security-tool pattern, as tagged by the upstream feed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ToolCategory {
    SqlInjection,
    VulnerabilityScanner,
    PortScanner,
    DirectoryBruteForce,
    CmsScanner,
    ExploitFramework,
    CredentialAttack,
    WebProxy,
    Reconnaissance,
    Suspicious,
    Other,
}

impl std::fmt::Display for ToolCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::SqlInjection         => "sql-injection",
            Self::VulnerabilityScanner => "vulnerability-scanner",
            Self::PortScanner          => "port-scanner",
            Self::DirectoryBruteForce  => "directory-brute-force",
            Self::CmsScanner           => "cms-scanner",
            Self::ExploitFramework     => "exploit-framework",
            Self::CredentialAttack     => "credential-attack",
            Self::WebProxy             => "web-proxy",
            Self::Reconnaissance       => "reconnaissance",
            Self::Suspicious           => "suspicious",
            Self::Other                => "other",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone)]
pub struct ToolPattern {
    pub category: ToolCategory,
    pub matcher:  UaPattern,
}

impl ToolPattern {
    pub fn new(name: &str, category: ToolCategory, pattern: &str) -> Self {
        Self { category, matcher: UaPattern::compile(name, pattern) }
    }
}

/// A CIDR block, v4 or v6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CidrRange {
    network: u128,
    prefix:  u8,
    is_v6:   bool,
}

impl CidrRange {
    pub fn parse(text: &str) -> Option<Self> {
        let (addr, prefix) = match text.split_once('/') {
            Some((a, p)) => (a, p.parse::<u8>().ok()?),
            None => (text, if text.contains(':') { 128 } else { 32 }),
        };
        let ip: IpAddr = addr.trim().parse().ok()?;
        let (bits, max, is_v6) = match ip {
            IpAddr::V4(v4) => (u32::from(v4) as u128, 32, false),
            IpAddr::V6(v6) => (u128::from(v6), 128, true),
        };
        if prefix > max {
            return None;
        }
        let mask = Self::mask(prefix, is_v6);
        Some(Self { network: bits & mask, prefix, is_v6 })
    }

    fn mask(prefix: u8, is_v6: bool) -> u128 {
        let width: u32 = if is_v6 { 128 } else { 32 };
        if prefix == 0 {
            0
        } else {
            (!0u128) << (width - prefix as u32) & if is_v6 { !0u128 } else { 0xffff_ffff }
        }
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        let (bits, is_v6) = match ip {
            IpAddr::V4(v4) => (u32::from(v4) as u128, false),
            IpAddr::V6(v6) => (u128::from(v6), true),
        };
        if is_v6 != self.is_v6 {
            return false;
        }
        bits & Self::mask(self.prefix, self.is_v6) == self.network
    }
}

/// A downloaded CIDR block attributed to a hosting provider.
#[derive(Debug, Clone)]
pub struct ProviderRange {
    pub range:    CidrRange,
    pub text:     String,
    pub provider: Option<String>,
}

impl ProviderRange {
    pub fn parse(text: &str, provider: Option<&str>) -> Option<Self> {
        Some(Self {
            range:    CidrRange::parse(text)?,
            text:     text.to_string(),
            provider: provider.map(str::to_string),
        })
    }
}

/// Read side of the external feed downloader. Implementations refresh in
/// the background (hourly for tool patterns) and keep serving the stale
/// set when a fetch fails.
pub trait PatternCache: Send + Sync {
    fn ua_patterns(&self) -> Arc<Vec<UaPattern>>;
    fn tool_patterns(&self) -> Arc<Vec<ToolPattern>>;
    fn cidr_ranges(&self) -> Arc<Vec<ProviderRange>>;

    fn match_cidr(&self, ip: IpAddr) -> Option<ProviderRange> {
        self.cidr_ranges().iter().find(|r| r.range.contains(ip)).cloned()
    }

    fn is_tor_exit(&self, _ip: IpAddr) -> bool {
        false
    }
}

/// Atomically swappable pattern cache. `replace_*` is called by whatever
/// fetches the feeds; readers always see a complete set.
#[derive(Default)]
pub struct StaticPatternCache {
    ua:    ArcSwap<Vec<UaPattern>>,
    tools: ArcSwap<Vec<ToolPattern>>,
    cidrs: ArcSwap<Vec<ProviderRange>>,
    tor:   ArcSwap<Vec<IpAddr>>,
}

impl StaticPatternCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace_ua_patterns(&self, patterns: Vec<UaPattern>) {
        self.ua.store(Arc::new(patterns));
    }

    pub fn replace_tool_patterns(&self, patterns: Vec<ToolPattern>) {
        self.tools.store(Arc::new(patterns));
    }

    pub fn replace_cidr_ranges(&self, ranges: Vec<ProviderRange>) {
        self.cidrs.store(Arc::new(ranges));
    }

    pub fn replace_tor_exits(&self, ips: Vec<IpAddr>) {
        self.tor.store(Arc::new(ips));
    }
}

impl PatternCache for StaticPatternCache {
    fn ua_patterns(&self) -> Arc<Vec<UaPattern>> {
        self.ua.load_full()
    }

    fn tool_patterns(&self) -> Arc<Vec<ToolPattern>> {
        self.tools.load_full()
    }

    fn cidr_ranges(&self) -> Arc<Vec<ProviderRange>> {
        self.cidrs.load_full()
    }

    fn is_tor_exit(&self, ip: IpAddr) -> bool {
        self.tor.load().contains(&ip)
    }
}

// ── Browser version service ───────────────────────────────────────────────────

/// Latest-major-version lookup for the version-age detector.
pub trait BrowserVersionService: Send + Sync {
    fn latest_version(&self, browser: &str) -> Option<u32>;
}

/// Pinned release table. Ships with the crate as the fallback when no
/// live tracker is wired in.
pub struct StaticBrowserVersions {
    latest: HashMap<String, u32>,
}

impl StaticBrowserVersions {
    pub fn new(latest: HashMap<String, u32>) -> Self {
        Self { latest }
    }
}

impl Default for StaticBrowserVersions {
    fn default() -> Self {
        let latest = [
            ("chrome", 138),
            ("firefox", 141),
            ("safari", 18),
            ("edge", 138),
            ("opera", 120),
            ("brave", 138),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
        Self { latest }
    }
}

impl BrowserVersionService for StaticBrowserVersions {
    fn latest_version(&self, browser: &str) -> Option<u32> {
        self.latest.get(&browser.to_lowercase()).copied()
    }
}

// ── Fingerprint store ─────────────────────────────────────────────────────────

/// Pre-computed client-side fingerprint, produced by the beacon endpoint
/// outside this crate and analyzed ahead of time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserFingerprint {
    pub canvas:              String,
    pub webgl:               String,
    pub audio:               String,
    pub screen:              String,
    pub timezone:            String,
    #[serde(default)]
    pub plugins:             Vec<String>,
    #[serde(default)]
    pub fonts:               Vec<String>,
    /// 0–1. Above the configured threshold the client is headless.
    pub headless_likelihood: f64,
    /// 0–100. Measures tamper evidence in the collected payload.
    pub integrity_score:     f64,
    /// 0–100. Cross-check agreement between fingerprint components.
    pub consistency:         f64,
    #[serde(default)]
    pub analysis_reasons:    Vec<String>,
    pub collected_at:        DateTime<Utc>,
}

pub trait FingerprintStore: Send + Sync {
    /// Lookup by the keyed hash of the client IP. Absence is normal for
    /// first-visit or non-browser clients.
    fn get(&self, ip_hash: &str) -> Option<BrowserFingerprint>;
}

#[derive(Default)]
pub struct MemoryFingerprintStore {
    records: DashMap<String, BrowserFingerprint>,
}

impl MemoryFingerprintStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, ip_hash: impl Into<String>, fp: BrowserFingerprint) {
        self.records.insert(ip_hash.into(), fp);
    }
}

impl FingerprintStore for MemoryFingerprintStore {
    fn get(&self, ip_hash: &str) -> Option<BrowserFingerprint> {
        self.records.get(ip_hash).map(|r| r.clone())
    }
}

// ── LLM transport ─────────────────────────────────────────────────────────────

/// Abstract RPC to the optional re-classification model. The detector
/// imposes the deadline; implementations must honor it.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn analyze(&self, prompt: &str, budget: Duration) -> Result<String, EngineError>;
}

/// Sink for patterns the LLM detector chooses to persist.
#[async_trait]
pub trait PatternWriter: Send + Sync {
    async fn record_pattern(&self, name: &str, pattern: &str, confidence: f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cidr_v4_membership() {
        let r = CidrRange::parse("13.64.0.0/11").unwrap();
        assert!(r.contains("13.64.0.1".parse().unwrap()));
        assert!(r.contains("13.95.255.254".parse().unwrap()));
        assert!(!r.contains("13.96.0.1".parse().unwrap()));
        assert!(!r.contains("2001:db8::1".parse().unwrap()));
    }

    #[test]
    fn cidr_v6_membership() {
        let r = CidrRange::parse("2600:1f00::/24").unwrap();
        assert!(r.contains("2600:1f18::20".parse().unwrap()));
        assert!(!r.contains("2601::1".parse().unwrap()));
    }

    #[test]
    fn cidr_rejects_garbage() {
        assert!(CidrRange::parse("not-an-ip/8").is_none());
        assert!(CidrRange::parse("10.0.0.0/33").is_none());
    }

    #[test]
    fn ua_pattern_regex_and_substring_fallback() {
        let re = UaPattern::compile("curl", r"^curl/\d");
        assert!(re.matches("curl/8.4.0"));
        assert!(!re.matches("not-curl/8"));

        // Unbalanced paren fails to compile and degrades to substring.
        let fallback = UaPattern::compile("broken", "sqlmap(");
        assert!(fallback.matches("something sqlmap( here"));
        assert!(!fallback.matches("innocent"));
    }

    #[tokio::test]
    async fn memory_weight_store_ema_moves_toward_target() {
        let store = MemoryWeightStore::new(0.5);
        store.record_observation("feat", "ua:contains_bot", true, 0.8).await;
        let w1 = store.weight("feat", "ua:contains_bot").await.unwrap();
        assert!((w1 - 0.4).abs() < 1e-9);
        store.record_observation("feat", "ua:contains_bot", true, 0.8).await;
        let w2 = store.weight("feat", "ua:contains_bot").await.unwrap();
        assert!(w2 > w1);

        store.record_observation("feat", "hdr:referer", false, 0.6).await;
        assert!(store.weight("feat", "hdr:referer").await.unwrap() < 0.0);
    }

    #[test]
    fn pattern_cache_swaps_atomically() {
        let cache = StaticPatternCache::new();
        assert!(cache.ua_patterns().is_empty());
        cache.replace_ua_patterns(vec![UaPattern::compile("scan", "scanbot")]);
        assert_eq!(cache.ua_patterns().len(), 1);
        assert!(cache
            .match_cidr("52.0.0.1".parse().unwrap())
            .is_none());
        cache.replace_cidr_ranges(vec![ProviderRange::parse("52.0.0.0/8", Some("aws")).unwrap()]);
        let hit = cache.match_cidr("52.0.0.1".parse().unwrap()).unwrap();
        assert_eq!(hit.provider.as_deref(), Some("aws"));
    }
}
