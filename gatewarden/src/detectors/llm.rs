// gatewarden/src/detectors/llm.rs
//
// Optional LLM re-classification — stage 3.
//
// A compact feature block goes out through the abstract LlmClient; the
// reply must be strict JSON. Anything else — timeout, transport error,
// malformed JSON — contributes nothing at all. The action selector
// additionally refuses to block on LLM evidence alone below 0.9
// confidence, so a hallucinated verdict cannot take a client down.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::config::LlmOptions;
use crate::error::EngineError;
use crate::evidence::{AggregatedEvidence, BotType, Category, Contribution};
use crate::learning::FeatureExtractor;
use crate::request::RequestContext;
use crate::signal_bus::keys;
use crate::stores::{LlmClient, PatternWriter};

use super::{Detector, DetectorDeps, Stage};

const NAME: &str = "llm";

const DEFAULT_BUDGET: Duration = Duration::from_millis(400);

#[derive(Debug, Deserialize)]
struct LlmVerdict {
    is_bot:     bool,
    confidence: f64,
    reasoning:  String,
    #[serde(default)]
    bot_type:   Option<String>,
    #[serde(default)]
    pattern:    Option<String>,
}

fn parse_bot_type(raw: &str) -> Option<BotType> {
    match raw.to_lowercase().as_str() {
        "scraper" => Some(BotType::Scraper),
        "tool" => Some(BotType::Tool),
        "malicious" | "malicious_bot" | "malicious-bot" => Some(BotType::MaliciousBot),
        "verified" | "verified_bot" | "verified-bot" => Some(BotType::VerifiedBot),
        _ => None,
    }
}

pub struct LlmDetector {
    client:         Arc<dyn LlmClient>,
    extractor:      Arc<FeatureExtractor>,
    pattern_writer: Option<Arc<dyn PatternWriter>>,
    opts:           LlmOptions,
    weight:         f64,
}

impl LlmDetector {
    pub fn new(deps: &DetectorDeps, client: Arc<dyn LlmClient>) -> Self {
        Self {
            client,
            extractor:      Arc::clone(&deps.extractor),
            pattern_writer: deps.pattern_writer.clone(),
            opts:           deps.options.llm.clone(),
            weight:         deps.options.detectors.llm.weight,
        }
    }

    /// Serialize the evidence into a bounded, line-oriented block.
    fn build_prompt(&self, ctx: &RequestContext, prior: &AggregatedEvidence) -> String {
        let budget = self.opts.effective_prompt_budget();
        let mut lines = vec![
            "Classify this HTTP request as bot or human. Reply with strict JSON:".to_string(),
            r#"{"is_bot":bool,"confidence":0..1,"reasoning":str,"bot_type":str?,"pattern":str?}"#
                .to_string(),
            format!("method={} path={}", ctx.method, ctx.path),
            format!("ua={}", ctx.user_agent().unwrap_or("<none>")),
            format!(
                "headers={} cookies={} https={}",
                ctx.header_count(),
                ctx.cookie_count(),
                ctx.is_https
            ),
            format!(
                "running_probability={:.3} confidence={:.3}",
                prior.bot_probability, prior.confidence
            ),
        ];
        for c in &prior.contributions {
            lines.push(format!("evidence[{}] {:+.2}: {}", c.detector, c.confidence_delta, c.reason));
        }
        let features = self.extractor.full(ctx, prior);
        for (name, value) in &features {
            if *value > 0.0 {
                lines.push(format!("feature {name}={value:.2}"));
            }
        }

        let mut prompt = String::new();
        for line in lines {
            if prompt.len() + line.len() + 1 > budget {
                break;
            }
            prompt.push_str(&line);
            prompt.push('\n');
        }
        prompt
    }
}

#[async_trait]
impl Detector for LlmDetector {
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
        let prompt = self.build_prompt(ctx, prior);
        let budget = ctx.remaining().unwrap_or(DEFAULT_BUDGET).min(DEFAULT_BUDGET);

        let raw = match self.client.analyze(&prompt, budget).await {
            Ok(raw) => raw,
            Err(e) => {
                debug!(error = %e, "llm analysis unavailable");
                return Ok(Vec::new());
            }
        };

        let verdict: LlmVerdict = match serde_json::from_str(raw.trim()) {
            Ok(v) => v,
            Err(e) => {
                debug!(error = %e, "llm reply was not strict JSON");
                return Ok(Vec::new());
            }
        };

        let confidence = verdict.confidence.clamp(0.0, 1.0);
        ctx.signals
            .put(keys::AI_PREDICTION, if verdict.is_bot { "bot" } else { "human" });
        ctx.signals.put(keys::AI_CONFIDENCE, confidence);

        if self.opts.pattern_learning {
            if let (Some(writer), Some(pattern)) = (&self.pattern_writer, &verdict.pattern) {
                writer.record_pattern(NAME, pattern, confidence).await;
            }
        }

        let delta = if verdict.is_bot { confidence } else { -confidence };
        let mut contribution = Contribution::new(
            NAME,
            Category::LlmAnalysis,
            delta,
            format!("LLM Analysis: {}", verdict.reasoning),
        )
        .with_weight(self.weight);
        if verdict.is_bot {
            contribution.bot_type = verdict.bot_type.as_deref().and_then(parse_bot_type);
        }

        Ok(vec![contribution])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::plain_deps;
    use parking_lot::Mutex;

    struct CannedLlm {
        reply: Result<String, ()>,
    }

    #[async_trait]
    impl LlmClient for CannedLlm {
        async fn analyze(&self, _prompt: &str, _budget: Duration) -> Result<String, EngineError> {
            self.reply
                .clone()
                .map_err(|_| EngineError::external("llm", "transport down"))
        }
    }

    #[derive(Default)]
    struct RecordingWriter {
        seen: Mutex<Vec<(String, f64)>>,
    }

    #[async_trait]
    impl PatternWriter for RecordingWriter {
        async fn record_pattern(&self, _name: &str, pattern: &str, confidence: f64) {
            self.seen.lock().push((pattern.to_string(), confidence));
        }
    }

    fn detector_with(reply: Result<String, ()>) -> LlmDetector {
        let deps = plain_deps();
        LlmDetector::new(&deps, Arc::new(CannedLlm { reply }))
    }

    fn ctx() -> RequestContext {
        RequestContext::builder("GET", "/")
            .header("User-Agent", "curl/8.4.0")
            .build()
    }

    #[tokio::test]
    async fn bot_verdict_contributes_its_confidence() {
        let det = detector_with(Ok(
            r#"{"is_bot":true,"confidence":0.83,"reasoning":"tool UA plus probing path","bot_type":"tool"}"#
                .into(),
        ));
        let ctx = ctx();
        let out = det.detect(&ctx, &AggregatedEvidence::unknown()).await.unwrap();
        assert_eq!(out.len(), 1);
        assert!((out[0].confidence_delta - 0.83).abs() < 1e-9);
        assert_eq!(out[0].bot_type, Some(BotType::Tool));
        assert_eq!(
            ctx.signals.get(keys::AI_PREDICTION).and_then(|v| v.as_text().map(String::from)),
            Some("bot".to_string())
        );
    }

    #[tokio::test]
    async fn human_verdict_contributes_negatively() {
        let det = detector_with(Ok(
            r#"{"is_bot":false,"confidence":0.6,"reasoning":"coherent session"}"#.into(),
        ));
        let out = det.detect(&ctx(), &AggregatedEvidence::unknown()).await.unwrap();
        assert!((out[0].confidence_delta + 0.6).abs() < 1e-9);
        assert!(out[0].bot_type.is_none());
    }

    #[tokio::test]
    async fn malformed_json_contributes_nothing() {
        let det = detector_with(Ok("I think it's probably a bot?".into()));
        let out = det.detect(&ctx(), &AggregatedEvidence::unknown()).await.unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn transport_error_contributes_nothing() {
        let det = detector_with(Err(()));
        let out = det.detect(&ctx(), &AggregatedEvidence::unknown()).await.unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn pattern_learning_records_when_enabled() {
        let mut deps = plain_deps();
        let writer = Arc::new(RecordingWriter::default());
        deps.pattern_writer = Some(writer.clone());
        let mut opts = (*deps.options).clone();
        opts.llm.pattern_learning = true;
        deps.options = Arc::new(opts);

        let det = LlmDetector::new(
            &deps,
            Arc::new(CannedLlm {
                reply: Ok(
                    r#"{"is_bot":true,"confidence":0.9,"reasoning":"r","pattern":"^BadBot/"}"#.into(),
                ),
            }),
        );
        det.detect(&ctx(), &AggregatedEvidence::unknown()).await.unwrap();
        let seen = writer.seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "^BadBot/");
    }

    #[test]
    fn prompt_respects_the_character_budget() {
        let deps = plain_deps();
        let mut opts = (*deps.options).clone();
        opts.llm.max_prompt_chars = 200;
        let mut deps = deps;
        deps.options = Arc::new(opts);
        let det = LlmDetector::new(&deps, Arc::new(CannedLlm { reply: Err(()) }));

        let mut prior = AggregatedEvidence::unknown();
        for i in 0..100 {
            prior.contributions.push(Contribution::new(
                "x",
                Category::Headers,
                0.1,
                format!("a very long repeated reason number {i} to overflow the budget"),
            ));
        }
        let prompt = det.build_prompt(&ctx(), &prior);
        assert!(prompt.len() <= 200, "prompt length {}", prompt.len());
    }
}
