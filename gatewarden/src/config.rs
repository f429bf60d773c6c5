// gatewarden/src/config.rs
//
// Typed options consumed at engine construction. Every knob has a
// default; a JSON options file can override any subset. Validation runs
// once at startup and is the only fail-fast path in the crate.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::evidence::ChallengeKind;

// ── Top level ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Probability at or above which a request is considered a bot.
    pub bot_threshold:             f64,
    pub max_requests_per_minute:   u32,
    /// Skip remaining stages once the running probability reaches this.
    pub early_exit_threshold:      f64,
    /// As above, but the verdict is recorded as forced-block.
    pub immediate_block_threshold: f64,
    /// Concurrent detectors per stage.
    pub stage_parallelism:         usize,
    /// Whole-request budget; the pipeline short-circuits past it.
    pub request_deadline_ms:       u64,

    pub identity:   IdentityOptions,
    pub detectors:  DetectorMatrix,
    pub ip:         IpOptions,
    pub learning:   LearningOptions,
    pub client_side: ClientSideOptions,
    pub version_age: VersionAgeOptions,
    pub behavioral: BehavioralOptions,
    pub llm:        LlmOptions,
    pub actions:    ActionOptions,

    /// Verified-bot allowlist: UA prefix → bot name.
    pub whitelisted_bots:      Vec<VerifiedBotPattern>,
    /// Static datacenter CIDRs compiled at construction.
    pub datacenter_ip_prefixes: Vec<String>,
    /// Proxies whose X-Forwarded-For is trusted.
    pub trusted_proxies:       Vec<String>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            bot_threshold:             0.7,
            max_requests_per_minute:   60,
            early_exit_threshold:      0.85,
            immediate_block_threshold: 0.95,
            stage_parallelism:         8,
            request_deadline_ms:       2_000,
            identity:    IdentityOptions::default(),
            detectors:   DetectorMatrix::default(),
            ip:          IpOptions::default(),
            learning:    LearningOptions::default(),
            client_side: ClientSideOptions::default(),
            version_age: VersionAgeOptions::default(),
            behavioral:  BehavioralOptions::default(),
            llm:         LlmOptions::default(),
            actions:     ActionOptions::default(),
            whitelisted_bots:       default_whitelisted_bots(),
            datacenter_ip_prefixes: default_datacenter_prefixes(),
            trusted_proxies:        Vec::new(),
        }
    }
}

impl Options {
    pub fn from_json(text: &str) -> Result<Self, EngineError> {
        let opts: Options = serde_json::from_str(text)
            .map_err(|e| EngineError::configuration(format!("options parse: {e}")))?;
        opts.validate()?;
        Ok(opts)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        for (name, v) in [
            ("bot_threshold", self.bot_threshold),
            ("early_exit_threshold", self.early_exit_threshold),
            ("immediate_block_threshold", self.immediate_block_threshold),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(EngineError::configuration(format!("{name} must be in [0,1], got {v}")));
            }
        }
        if self.early_exit_threshold > self.immediate_block_threshold {
            return Err(EngineError::configuration(
                "early_exit_threshold must not exceed immediate_block_threshold",
            ));
        }
        if self.stage_parallelism == 0 {
            return Err(EngineError::configuration("stage_parallelism must be at least 1"));
        }
        if self.max_requests_per_minute == 0 {
            return Err(EngineError::configuration("max_requests_per_minute must be positive"));
        }
        if !(0.0..=1.0).contains(&self.learning.min_confidence) {
            return Err(EngineError::configuration("learning.min_confidence must be in [0,1]"));
        }
        self.actions.validate()?;
        Ok(())
    }
}

// ── Identity ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityOptions {
    /// 256-bit key, hex-encoded. When absent a random process-local key
    /// is generated (identities then do not survive a restart).
    pub key_hex:          Option<String>,
    pub daily_derivation: bool,
}

// ── Per-detector settings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorSettings {
    pub enabled:    bool,
    /// Importance multiplier applied to every contribution, [0, 5].
    pub weight:     f64,
    pub timeout_ms: u64,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self { enabled: true, weight: 1.0, timeout_ms: 500 }
    }
}

impl DetectorSettings {
    pub fn disabled() -> Self {
        Self { enabled: false, ..Self::default() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorMatrix {
    pub user_agent:     DetectorSettings,
    pub headers:        DetectorSettings,
    pub ip:             DetectorSettings,
    pub behavioral:     DetectorSettings,
    pub inconsistency:  DetectorSettings,
    pub version_age:    DetectorSettings,
    pub security_tools: DetectorSettings,
    pub client_side:    DetectorSettings,
    pub heuristic:      DetectorSettings,
    pub llm:            DetectorSettings,
}

impl Default for DetectorMatrix {
    fn default() -> Self {
        Self {
            user_agent:     DetectorSettings::default(),
            headers:        DetectorSettings::default(),
            ip:             DetectorSettings::default(),
            behavioral:     DetectorSettings::default(),
            inconsistency:  DetectorSettings::default(),
            version_age:    DetectorSettings::default(),
            security_tools: DetectorSettings::default(),
            client_side:    DetectorSettings::default(),
            heuristic:      DetectorSettings::default(),
            // Off until an LlmClient is wired in.
            llm:            DetectorSettings::disabled(),
        }
    }
}

// ── IP ────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IpOptions {
    pub tor_check_enabled: bool,
}

impl Default for IpOptions {
    fn default() -> Self {
        Self { tor_check_enabled: false }
    }
}

// ── Learning ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LearningOptions {
    pub enabled:                        bool,
    /// Verdict confidence required before observations are recorded.
    pub min_confidence:                 f64,
    pub learning_rate:                  f64,
    pub weight_reload_interval_minutes: u64,
    /// Bounded observation queue; overflow drops (learning is opportunistic).
    pub queue_capacity:                 usize,
}

impl Default for LearningOptions {
    fn default() -> Self {
        Self {
            enabled:                        true,
            min_confidence:                 0.8,
            learning_rate:                  0.1,
            weight_reload_interval_minutes: 15,
            queue_capacity:                 1_024,
        }
    }
}

// ── Client-side fingerprinting ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSideOptions {
    pub enabled:             bool,
    pub headless_threshold:  f64,
    pub min_integrity_score: f64,
    /// Salt mixed into the fingerprint lookup hash.
    pub lookup_salt:         String,
}

impl Default for ClientSideOptions {
    fn default() -> Self {
        Self {
            enabled:             true,
            headless_threshold:  0.7,
            min_integrity_score: 50.0,
            lookup_salt:         "fp-lookup".to_string(),
        }
    }
}

// ── Version age ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OsAgeClass {
    Ancient,
    VeryOld,
    Old,
}

impl OsAgeClass {
    pub fn impact(self) -> f64 {
        match self {
            Self::Ancient => 0.4,
            Self::VeryOld => 0.25,
            Self::Old     => 0.1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VersionAgeOptions {
    /// Major versions behind latest before "moderately outdated" applies.
    pub max_age:         u32,
    pub severe_impact:   f64,
    pub moderate_impact: f64,
    pub slight_impact:   f64,
    /// Added when both the browser and the OS are outdated.
    pub combined_bonus:  f64,
    /// Lowercased OS token → age class.
    pub os_classes:      HashMap<String, OsAgeClass>,
    /// Lowercased OS token → highest browser major version the OS can
    /// actually run. A claim above it is an impossible combination.
    pub max_browser_version_by_os: HashMap<String, u32>,
}

impl Default for VersionAgeOptions {
    fn default() -> Self {
        let os_classes = [
            ("windows nt 5.1", OsAgeClass::Ancient),  // XP
            ("windows nt 6.0", OsAgeClass::Ancient),  // Vista
            ("windows nt 6.1", OsAgeClass::VeryOld),  // 7
            ("windows nt 6.2", OsAgeClass::VeryOld),  // 8
            ("windows nt 6.3", OsAgeClass::Old),      // 8.1
            ("mac os x 10_11", OsAgeClass::VeryOld),
            ("mac os x 10_12", OsAgeClass::Old),
            ("android 5", OsAgeClass::VeryOld),
            ("android 6", OsAgeClass::Old),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        let max_browser_version_by_os = [
            ("windows nt 5.1", 49),   // last Chrome for XP
            ("windows nt 6.0", 49),
            ("windows nt 6.1", 109),  // last Chrome for Win7/8
            ("windows nt 6.2", 109),
            ("mac os x 10_11", 103),
            ("android 4", 81),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        Self {
            max_age:         10,
            severe_impact:   0.5,
            moderate_impact: 0.3,
            slight_impact:   0.15,
            combined_bonus:  0.1,
            os_classes,
            max_browser_version_by_os,
        }
    }
}

// ── Behavioral ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BehavioralOptions {
    /// First minutes of an identity get a doubled rate limit and no
    /// referrer/cookie checks.
    pub warmup_secs:            u64,
    pub api_key_header:         String,
    /// Absolute per-key limit; falls back to 2× the base limit.
    pub api_key_rate_limit:     Option<u32>,
    pub user_id_header:         String,
    /// Absolute per-user limit; falls back to 3× the base limit.
    pub user_rate_limit:        Option<u32>,
    pub fingerprint_multiplier: f64,
    /// Burst comparison window.
    pub burst_window_secs:      u64,
}

impl Default for BehavioralOptions {
    fn default() -> Self {
        Self {
            warmup_secs:            120,
            api_key_header:         "x-api-key".to_string(),
            api_key_rate_limit:     None,
            user_id_header:         "x-user-id".to_string(),
            user_rate_limit:        None,
            fingerprint_multiplier: 1.5,
            burst_window_secs:      10,
        }
    }
}

// ── LLM ───────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmOptions {
    /// Upper bound on the serialized feature block.
    pub max_prompt_chars:    usize,
    /// Model context size in characters; the prompt budget self-adjusts
    /// to a quarter of it when smaller than max_prompt_chars.
    pub model_context_chars: usize,
    pub pattern_learning:    bool,
}

impl Default for LlmOptions {
    fn default() -> Self {
        Self {
            max_prompt_chars:    4_000,
            model_context_chars: 16_000,
            pattern_learning:    false,
        }
    }
}

impl LlmOptions {
    pub fn effective_prompt_budget(&self) -> usize {
        self.max_prompt_chars.min(self.model_context_chars / 4)
    }
}

// ── Verified bots ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifiedBotPattern {
    /// Matched against the start of the User-Agent value.
    pub prefix: String,
    pub name:   String,
}

impl VerifiedBotPattern {
    pub fn new(prefix: &str, name: &str) -> Self {
        Self { prefix: prefix.to_string(), name: name.to_string() }
    }
}

fn default_whitelisted_bots() -> Vec<VerifiedBotPattern> {
    [
        ("Mozilla/5.0 (compatible; Googlebot", "Googlebot"),
        ("Googlebot", "Googlebot"),
        ("Mozilla/5.0 (compatible; bingbot", "Bingbot"),
        ("Mozilla/5.0 (compatible; YandexBot", "YandexBot"),
        ("Mozilla/5.0 (compatible; Baiduspider", "Baiduspider"),
        ("Mozilla/5.0 (compatible; DuckDuckBot", "DuckDuckBot"),
        ("DuckDuckBot", "DuckDuckBot"),
        ("Mozilla/5.0 (compatible; Applebot", "Applebot"),
        ("facebookexternalhit", "FacebookBot"),
        ("Twitterbot", "Twitterbot"),
        ("Slackbot", "Slackbot"),
        ("LinkedInBot", "LinkedInBot"),
    ]
    .into_iter()
    .map(|(p, n)| VerifiedBotPattern::new(p, n))
    .collect()
}

fn default_datacenter_prefixes() -> Vec<String> {
    [
        // AWS
        "3.0.0.0/8", "13.32.0.0/12", "18.128.0.0/9", "52.0.0.0/10", "54.64.0.0/11",
        // Azure
        "13.64.0.0/11", "20.33.0.0/16", "40.64.0.0/10", "104.40.0.0/13",
        // GCP
        "34.64.0.0/10", "35.184.0.0/13", "130.211.0.0/16",
        // Oracle
        "129.146.0.0/16", "132.145.0.0/16", "140.238.0.0/16",
        // DigitalOcean
        "104.131.0.0/16", "159.89.0.0/16", "167.99.0.0/16",
        // Hetzner
        "65.108.0.0/15", "95.216.0.0/15", "135.181.0.0/16",
        // OVH
        "51.38.0.0/16", "51.68.0.0/16", "145.239.0.0/16",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

// ── Action policies ───────────────────────────────────────────────────────────

/// Typed action record a policy resolves to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ActionSpec {
    Allow,
    Tag {
        header: String,
        value:  String,
    },
    Throttle {
        base_ms:       u64,
        /// Random extra delay in [0, base · jitter].
        jitter:        f64,
        scale_by_risk: bool,
        max_ms:        u64,
    },
    Challenge {
        kind: ChallengeKind,
    },
    Block {
        status:  u16,
        message: String,
    },
}

/// One step of a policy ladder; conditions are ANDed, first match wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transition {
    #[serde(default)]
    pub when_risk_exceeds: Option<f64>,
    /// Fires when the named signal is present and truthy.
    #[serde(default)]
    pub when_signal:       Option<String>,
    pub policy:            String,
}

/// Path pattern → transition ladder. Patterns are glob-ish: `*` matches
/// any run of characters, everything else is literal; a pattern without
/// wildcards matches as a prefix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteRule {
    pub pattern:     String,
    pub transitions: Vec<Transition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionOptions {
    pub policies: HashMap<String, ActionSpec>,
    pub routes:   Vec<RouteRule>,
    /// Ladder applied when no route matches.
    pub default_transitions: Vec<Transition>,
}

impl Default for ActionOptions {
    fn default() -> Self {
        let policies = [
            ("allow".to_string(), ActionSpec::Allow),
            (
                "tag".to_string(),
                ActionSpec::Tag {
                    header: "x-gatewarden-risk".to_string(),
                    value:  "elevated".to_string(),
                },
            ),
            (
                "throttle".to_string(),
                ActionSpec::Throttle {
                    base_ms:       500,
                    jitter:        0.5,
                    scale_by_risk: true,
                    max_ms:        5_000,
                },
            ),
            ("challenge".to_string(), ActionSpec::Challenge { kind: ChallengeKind::Captcha }),
            (
                "block".to_string(),
                ActionSpec::Block { status: 403, message: "request blocked".to_string() },
            ),
        ]
        .into_iter()
        .collect();

        let default_transitions = vec![
            Transition { when_risk_exceeds: Some(0.85), when_signal: None, policy: "block".into() },
            Transition { when_risk_exceeds: Some(0.6), when_signal: None, policy: "throttle".into() },
            Transition { when_risk_exceeds: Some(0.45), when_signal: None, policy: "tag".into() },
        ];

        Self { policies, routes: Vec::new(), default_transitions }
    }
}

impl ActionOptions {
    fn validate(&self) -> Result<(), EngineError> {
        let check = |t: &Transition| -> Result<(), EngineError> {
            if !self.policies.contains_key(&t.policy) {
                return Err(EngineError::configuration(format!(
                    "transition references unknown policy '{}'",
                    t.policy
                )));
            }
            Ok(())
        };
        for rule in &self.routes {
            for t in &rule.transitions {
                check(t)?;
            }
        }
        for t in &self.default_transitions {
            check(t)?;
        }
        Ok(())
    }
}
