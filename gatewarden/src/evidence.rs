// gatewarden/src/evidence.rs
//
// Domain types flowing through the detection pipeline: detector
// contributions, the aggregated verdict, and the decision handed back to
// the middleware.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::signal_bus::SignalSnapshot;

// ── Detector taxonomy ─────────────────────────────────────────────────────────

/// Evidence category a contribution belongs to. The category breakdown in
/// the aggregate keeps one score per category, so unrelated detectors do
/// not double-count the same kind of evidence.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Category {
    UserAgent,
    Headers,
    Ip,
    Behavioral,
    ClientSide,
    Inconsistency,
    VersionAge,
    SecurityTool,
    Heuristic,
    LlmAnalysis,
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UserAgent     => write!(f, "user-agent"),
            Self::Headers       => write!(f, "headers"),
            Self::Ip            => write!(f, "ip"),
            Self::Behavioral    => write!(f, "behavioral"),
            Self::ClientSide    => write!(f, "client-side"),
            Self::Inconsistency => write!(f, "inconsistency"),
            Self::VersionAge    => write!(f, "version-age"),
            Self::SecurityTool  => write!(f, "security-tool"),
            Self::Heuristic     => write!(f, "heuristic"),
            Self::LlmAnalysis   => write!(f, "llm-analysis"),
        }
    }
}

/// Classified kind of automated client.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum BotType {
    /// Allowlisted crawler (Googlebot, Bingbot, ...). Always passed through.
    VerifiedBot,
    /// Content scraper or browser-automation framework.
    Scraper,
    /// Command-line HTTP tool (curl, wget, python-requests, ...).
    Tool,
    /// Security scanner or attack tooling.
    MaliciousBot,
}

impl std::fmt::Display for BotType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::VerifiedBot  => write!(f, "verified-bot"),
            Self::Scraper      => write!(f, "scraper"),
            Self::Tool         => write!(f, "tool"),
            Self::MaliciousBot => write!(f, "malicious-bot"),
        }
    }
}

// ── Contribution ──────────────────────────────────────────────────────────────

/// One detector's signed, weighted vote into the aggregate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contribution {
    /// Stable detector identifier.
    pub detector:         String,
    pub category:         Category,
    /// Signed evidence strength in [-1, 1]; negative leans human.
    pub confidence_delta: f64,
    /// Detector-importance multiplier in [0, 5].
    pub weight:           f64,
    /// Short human-readable explanation.
    pub reason:           String,
    pub bot_type:         Option<BotType>,
    pub bot_name:         Option<String>,
}

impl Contribution {
    pub fn new(
        detector: impl Into<String>,
        category: Category,
        confidence_delta: f64,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            detector:         detector.into(),
            category,
            confidence_delta: confidence_delta.clamp(-1.0, 1.0),
            weight:           1.0,
            reason:           reason.into(),
            bot_type:         None,
            bot_name:         None,
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight.clamp(0.0, 5.0);
        self
    }

    pub fn with_bot_type(mut self, bot_type: BotType) -> Self {
        self.bot_type = Some(bot_type);
        self
    }

    pub fn with_bot_name(mut self, name: impl Into<String>) -> Self {
        self.bot_name = Some(name.into());
        self
    }

    /// The value that enters the aggregation sums.
    pub fn weighted(&self) -> f64 {
        self.confidence_delta * self.weight
    }
}

// ── Aggregate ─────────────────────────────────────────────────────────────────

/// Five-level discretization of bot probability.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum RiskBand {
    VeryLow,
    Low,
    Medium,
    High,
    VeryHigh,
}

impl RiskBand {
    /// Deterministic banding of probability. Band edges are inclusive on
    /// the upper side: 0.2 is Low, 0.85 is VeryHigh.
    pub fn from_probability(p: f64) -> Self {
        if p < 0.2 {
            Self::VeryLow
        } else if p < 0.4 {
            Self::Low
        } else if p < 0.6 {
            Self::Medium
        } else if p < 0.85 {
            Self::High
        } else {
            Self::VeryHigh
        }
    }
}

impl std::fmt::Display for RiskBand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::VeryLow  => write!(f, "very-low"),
            Self::Low      => write!(f, "low"),
            Self::Medium   => write!(f, "medium"),
            Self::High     => write!(f, "high"),
            Self::VeryHigh => write!(f, "very-high"),
        }
    }
}

/// Per-category rollup: the strongest absolute delta and how many
/// contributions the category produced.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CategoryScore {
    pub score: f64,
    pub count: usize,
}

/// The orchestrator's verdict for one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedEvidence {
    pub bot_probability:    f64,
    /// How much independent evidence backs the probability; distinct from
    /// the probability itself.
    pub confidence:         f64,
    pub risk_band:          RiskBand,
    /// All contributions in completion order.
    pub contributions:      Vec<Contribution>,
    pub signals:            SignalSnapshot,
    pub category_breakdown: HashMap<Category, CategoryScore>,
    pub primary_bot_type:   Option<BotType>,
    pub primary_bot_name:   Option<String>,
    pub early_exit:         bool,
    /// Set when the immediate-block threshold (or a stage-0 malicious hit)
    /// forced the verdict; the action selector must block.
    pub forced_block:       bool,
    pub processing_time_ms: f64,
    pub failed_detectors:   Vec<String>,
    pub evaluated_at:       DateTime<Utc>,
}

impl AggregatedEvidence {
    /// Verdict with no evidence at all: probability sits at the 0.5
    /// midpoint and the action defaults to Allow.
    pub fn unknown() -> Self {
        Self {
            bot_probability:    0.5,
            confidence:         0.0,
            risk_band:          RiskBand::from_probability(0.5),
            contributions:      Vec::new(),
            signals:            SignalSnapshot::default(),
            category_breakdown: HashMap::new(),
            primary_bot_type:   None,
            primary_bot_name:   None,
            early_exit:         false,
            forced_block:       false,
            processing_time_ms: 0.0,
            failed_detectors:   Vec::new(),
            evaluated_at:       Utc::now(),
        }
    }

    pub fn is_verified_bot(&self) -> bool {
        self.primary_bot_type == Some(BotType::VerifiedBot)
    }

    /// Top reasons for operator display, strongest first.
    pub fn top_reasons(&self, n: usize) -> Vec<&str> {
        let mut ranked: Vec<&Contribution> = self.contributions.iter().collect();
        ranked.sort_by(|a, b| {
            b.confidence_delta
                .abs()
                .partial_cmp(&a.confidence_delta.abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        ranked.into_iter().take(n).map(|c| c.reason.as_str()).collect()
    }
}

// ── Decision ──────────────────────────────────────────────────────────────────

/// Challenge styles a policy may request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeKind {
    Captcha,
    Interactive,
}

/// Typed action the middleware applies before the request reaches the app.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Allow,
    Tag {
        header: String,
        value:  String,
    },
    Throttle {
        #[serde(with = "duration_ms")]
        delay: Duration,
    },
    Challenge {
        kind: ChallengeKind,
    },
    Block {
        status:  u16,
        message: String,
    },
}

impl Action {
    pub fn terminates_request(&self) -> bool {
        matches!(self, Self::Block { .. } | Self::Challenge { .. })
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Allow             => write!(f, "ALLOW"),
            Self::Tag { .. }        => write!(f, "TAG"),
            Self::Throttle { .. }   => write!(f, "THROTTLE"),
            Self::Challenge { .. }  => write!(f, "CHALLENGE"),
            Self::Block { status, .. } => write!(f, "BLOCK({status})"),
        }
    }
}

/// What the middleware should do, plus why.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub action: Action,
    pub reason: String,
}

impl Decision {
    pub fn allow(reason: impl Into<String>) -> Self {
        Self { action: Action::Allow, reason: reason.into() }
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
