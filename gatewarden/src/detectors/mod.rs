// gatewarden/src/detectors/mod.rs
//
// Detector contract and the default registry.
//
// Detectors declare a stage; the orchestrator runs stages in ascending
// order and everything inside a stage concurrently. A detector reads the
// request and the signal bus, may publish signals, and returns zero or
// more contributions. Detectors disabled by configuration are not
// registered at all — they never run with a zero weight, so the failure
// bookkeeping stays accurate.

pub mod behavioral;
pub mod client_side;
pub mod headers;
pub mod heuristic;
pub mod inconsistency;
pub mod ip;
pub mod llm;
pub mod security_tools;
pub mod user_agent;
pub mod version_age;

use std::sync::Arc;

use async_trait::async_trait;

use crate::behavior::BehaviorAnalyzer;
use crate::config::Options;
use crate::error::EngineError;
use crate::evidence::{AggregatedEvidence, Contribution};
use crate::identity::IdentityResolver;
use crate::learning::{FeatureExtractor, HeuristicModel};
use crate::request::RequestContext;
use crate::stores::{
    BrowserVersionService, FingerprintStore, LlmClient, PatternCache, PatternWriter,
};

/// Execution tier. Stages run strictly in order; detectors within one
/// stage run concurrently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    RawSignals  = 0,
    Behavioral  = 1,
    MetaAnalysis = 2,
    Intelligence = 3,
}

impl Stage {
    pub const ALL: [Stage; 4] =
        [Stage::RawSignals, Stage::Behavioral, Stage::MetaAnalysis, Stage::Intelligence];

    pub fn index(self) -> usize {
        self as usize
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RawSignals   => write!(f, "raw-signals"),
            Self::Behavioral   => write!(f, "behavioral"),
            Self::MetaAnalysis => write!(f, "meta-analysis"),
            Self::Intelligence => write!(f, "intelligence"),
        }
    }
}

/// The shared detector contract. `prior` is the running aggregate from
/// the stages that already completed; stage-0 detectors see an empty one.
#[async_trait]
pub trait Detector: Send + Sync {
    fn name(&self) -> &'static str;
    fn stage(&self) -> Stage;

    async fn detect(
        &self,
        ctx: &RequestContext,
        prior: &AggregatedEvidence,
    ) -> Result<Vec<Contribution>, EngineError>;
}

/// Everything detectors may need, wired once at engine construction.
pub struct DetectorDeps {
    pub options:        Arc<Options>,
    pub window:         Arc<crate::state::WindowStore>,
    pub analyzer:       BehaviorAnalyzer,
    pub identity:       IdentityResolver,
    pub patterns:       Arc<dyn PatternCache>,
    pub versions:       Arc<dyn BrowserVersionService>,
    pub fingerprints:   Arc<dyn FingerprintStore>,
    pub model:          Arc<HeuristicModel>,
    pub extractor:      Arc<FeatureExtractor>,
    pub llm:            Option<Arc<dyn LlmClient>>,
    pub pattern_writer: Option<Arc<dyn PatternWriter>>,
}

/// Build the enabled detector set in stage order.
pub fn build_registry(deps: &DetectorDeps) -> Vec<Arc<dyn Detector>> {
    let d = &deps.options.detectors;
    let mut registry: Vec<Arc<dyn Detector>> = Vec::new();

    if d.user_agent.enabled {
        registry.push(Arc::new(user_agent::UserAgentDetector::new(deps)));
    }
    if d.headers.enabled {
        registry.push(Arc::new(headers::HeaderDetector::new(deps)));
    }
    if d.ip.enabled {
        registry.push(Arc::new(ip::IpDetector::new(deps)));
    }
    if d.version_age.enabled {
        registry.push(Arc::new(version_age::VersionAgeDetector::new(deps)));
    }
    if d.security_tools.enabled {
        registry.push(Arc::new(security_tools::SecurityToolDetector::new(deps)));
    }
    if d.client_side.enabled && deps.options.client_side.enabled {
        registry.push(Arc::new(client_side::ClientSideDetector::new(deps)));
    }
    if d.behavioral.enabled {
        registry.push(Arc::new(behavioral::BehavioralDetector::new(deps)));
    }
    if d.inconsistency.enabled {
        registry.push(Arc::new(inconsistency::InconsistencyDetector::new(deps)));
    }
    if d.heuristic.enabled {
        registry.push(Arc::new(heuristic::HeuristicDetector::new(deps)));
    }
    if d.llm.enabled {
        if let Some(llm) = &deps.llm {
            registry.push(Arc::new(llm::LlmDetector::new(deps, Arc::clone(llm))));
        }
    }

    registry.sort_by_key(|det| det.stage().index());
    registry
}
