// gatewarden/src/detectors/heuristic.rs
//
// Learned linear model — stage 3.
//
// Runs last so the feature extractor can see the whole pipeline: prior
// contributions, category scores, signals, failures, and the running
// verdict all become features. With no prior evidence it falls back to
// request-only features (early mode).

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::EngineError;
use crate::evidence::{AggregatedEvidence, BotType, Category, Contribution};
use crate::learning::{FeatureExtractor, HeuristicModel};
use crate::request::RequestContext;

use super::{Detector, DetectorDeps, Stage};

const NAME: &str = "heuristic";

const TOOL_FEATURES: &[&str] =
    &["ua:curl", "ua:wget", "ua:httpx", "ua:aiohttp", "ua:requests", "ua:python"];
const SCRAPER_FEATURES: &[&str] = &["ua:scrapy", "ua:selenium", "ua:headless", "ua:phantomjs"];

pub struct HeuristicDetector {
    model:     Arc<HeuristicModel>,
    extractor: Arc<FeatureExtractor>,
    weight:    f64,
}

impl HeuristicDetector {
    pub fn new(deps: &DetectorDeps) -> Self {
        Self {
            model:     Arc::clone(&deps.model),
            extractor: Arc::clone(&deps.extractor),
            weight:    deps.options.detectors.heuristic.weight,
        }
    }
}

#[async_trait]
impl Detector for HeuristicDetector {
    fn name(&self) -> &'static str {
        NAME
    }

    fn stage(&self) -> Stage {
        Stage::Intelligence
    }

    async fn detect(
        &self,
        ctx: &RequestContext,
        prior: &AggregatedEvidence,
    ) -> Result<Vec<Contribution>, EngineError> {
        let early_mode = prior.contributions.is_empty();
        let features = if early_mode {
            self.extractor.early(ctx)
        } else {
            self.extractor.full(ctx, prior)
        };

        let inference = self.model.infer(&features);
        let p = inference.probability;
        // Symmetric mapping: 0.5 is silence, either certainty is ±1.
        let delta = 2.0 * (p - 0.5);

        let mut contribution = Contribution::new(
            NAME,
            Category::Heuristic,
            delta,
            format!(
                "Heuristic model: {:.0}% bot likelihood ({} features)",
                p * 100.0,
                inference.active_features
            ),
        )
        .with_weight(self.weight);

        if delta > 0.0 {
            let active = |names: &[&str]| {
                names.iter().any(|n| features.get(*n).is_some_and(|v| *v > 0.0))
            };
            let bot_type = if active(TOOL_FEATURES) {
                Some(BotType::Tool)
            } else if active(SCRAPER_FEATURES) {
                Some(BotType::Scraper)
            } else {
                prior.primary_bot_type
            };
            contribution.bot_type = bot_type;
        }

        Ok(vec![contribution])
    }
}
