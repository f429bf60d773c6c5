// gatewarden/src/engine/orchestrator.rs
//
// The blackboard orchestrator: wave scheduler, aggregation, early exit,
// and the engine facade the middleware calls.
//
// Stages run strictly in order; detectors inside a stage run concurrently
// with bounded parallelism and a per-detector timeout. Contributions are
// appended in completion order. Aggregation after every stage drives the
// early-exit and immediate-block thresholds; a stage-0 MaliciousBot hit
// at confidence ≥ 0.9 forces the block path directly.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::{self, StreamExt};
use rand::RngCore;
use tracing::{debug, error, warn};

use crate::behavior::BehaviorAnalyzer;
use crate::config::Options;
use crate::detectors::{build_registry, Detector, DetectorDeps, Stage};
use crate::error::EngineError;
use crate::evidence::{
    AggregatedEvidence, BotType, Category, CategoryScore, Contribution, Decision, RiskBand,
};
use crate::identity::IdentityResolver;
use crate::learning::{
    FeatureExtractor, HeuristicModel, LearningQueue, Observation, Trainer,
};
use crate::metrics::{Metric, MetricsSink, NoopMetrics};
use crate::request::RequestContext;
use crate::state::WindowStore;
use crate::stores::{
    BrowserVersionService, FingerprintStore, LlmClient, MemoryWeightStore, PatternCache,
    PatternWriter, StaticBrowserVersions, StaticPatternCache, WeightStore,
};

use super::actions::ActionSelector;

const MALICIOUS_FORCE_CONFIDENCE: f64 = 0.9;

/// Outcome of one detector invocation, in completion order.
struct DetectorRun {
    name:          &'static str,
    contributions: Option<Vec<Contribution>>,
}

pub struct Engine {
    options:   Arc<Options>,
    identity:  IdentityResolver,
    /// Proxies whose X-Forwarded-For is honored. Empty = trust all.
    trusted_proxies: Vec<crate::stores::CidrRange>,
    window:    Arc<WindowStore>,
    stages:    [Vec<Arc<dyn Detector>>; 4],
    timeouts:  HashMap<&'static str, Duration>,
    extractor: Arc<FeatureExtractor>,
    learning:  Option<LearningQueue>,
    selector:  ActionSelector,
    metrics:   Arc<dyn MetricsSink>,
    // Background workers live exactly as long as the engine.
    _trainer:  Option<Trainer>,
}

impl Engine {
    pub fn builder(options: Options) -> EngineBuilder {
        EngineBuilder::new(options)
    }

    pub fn window(&self) -> &Arc<WindowStore> {
        &self.window
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Evaluate one request. Always returns a decision; every failure
    /// mode short of misconfiguration degrades instead of erroring.
    pub async fn evaluate(&self, ctx: &mut RequestContext) -> (Decision, AggregatedEvidence) {
        let started = Instant::now();
        if ctx.deadline.is_none() {
            ctx.deadline =
                Some(started + Duration::from_millis(self.options.request_deadline_ms));
        }

        // Forwarding headers only count when the direct peer is a
        // configured proxy.
        if ctx.forwarded_for.is_some() && !self.trusted_proxies.is_empty() {
            let trusted = ctx
                .remote_addr
                .map(|ip| self.trusted_proxies.iter().any(|range| range.contains(ip)))
                .unwrap_or(false);
            if !trusted {
                ctx.forwarded_for = None;
            }
        }

        // Configured identity headers, unless the host already set them.
        if ctx.api_key.is_none() {
            let from_header = ctx
                .header(&self.options.behavioral.api_key_header)
                .map(str::to_string);
            ctx.api_key = from_header;
        }
        if ctx.user_id.is_none() {
            let from_header = ctx
                .header(&self.options.behavioral.user_id_header)
                .map(str::to_string);
            ctx.user_id = from_header;
        }

        ctx.identity = self.identity.resolve(ctx);

        let mut contributions: Vec<Contribution> = Vec::new();
        let mut failed: Vec<String> = Vec::new();
        let mut early_exit = false;
        let mut forced_block = false;
        let mut timed_out = false;
        let mut interim = self.aggregate(ctx, &[], &[], started, false, false);

        for stage in Stage::ALL {
            let detectors = &self.stages[stage.index()];
            if detectors.is_empty() {
                continue;
            }
            if ctx.past_deadline() {
                timed_out = true;
                early_exit = true;
                warn!(stage = %stage, "request deadline reached, short-circuiting pipeline");
                break;
            }

            let prior = interim.clone();
            let shared_ctx: &RequestContext = ctx;
            let mut pending: Vec<
                std::pin::Pin<Box<dyn std::future::Future<Output = DetectorRun> + Send + '_>>,
            > = Vec::with_capacity(detectors.len());
            for detector in detectors.iter().cloned() {
                pending.push(Box::pin(self.run_detector(detector, shared_ctx, &prior)));
            }
            let runs: Vec<DetectorRun> = stream::iter(pending)
                .buffer_unordered(self.options.stage_parallelism)
                .collect()
                .await;

            for run in runs {
                match run.contributions {
                    Some(mut list) => contributions.append(&mut list),
                    None => failed.push(run.name.to_string()),
                }
            }

            interim = self.aggregate(ctx, &contributions, &failed, started, early_exit, forced_block);

            // Stage-0 malicious hit forces the block path immediately.
            if stage == Stage::RawSignals
                && contributions.iter().any(|c| {
                    c.bot_type == Some(BotType::MaliciousBot)
                        && c.confidence_delta >= MALICIOUS_FORCE_CONFIDENCE
                })
            {
                forced_block = true;
                early_exit = true;
                break;
            }
            if interim.bot_probability >= self.options.immediate_block_threshold {
                forced_block = true;
                early_exit = true;
                break;
            }
            if interim.bot_probability >= self.options.early_exit_threshold {
                early_exit = true;
                break;
            }
        }

        let evidence =
            self.aggregate(ctx, &contributions, &failed, started, early_exit, forced_block);
        self.feed_learning(ctx, &evidence);

        let mut decision = self.selector.select(&evidence, &ctx.path);
        if timed_out {
            decision.reason = format!("timeout; {}", decision.reason);
        }

        self.metrics.record(
            Metric::new("gatewarden.requests", 1.0)
                .label("action", decision.action.to_string())
                .label("risk_band", evidence.risk_band.to_string()),
        );
        self.metrics
            .record(Metric::new("gatewarden.processing_ms", evidence.processing_time_ms));

        (decision, evidence)
    }

    async fn run_detector(
        &self,
        detector: Arc<dyn Detector>,
        shared_ctx: &RequestContext,
        prior: &AggregatedEvidence,
    ) -> DetectorRun {
        let name = detector.name();
        let budget = self.detector_budget(name, shared_ctx);
        match tokio::time::timeout(budget, detector.detect(shared_ctx, prior)).await {
            Ok(Ok(contributions)) => DetectorRun { name, contributions: Some(contributions) },
            Ok(Err(e)) => {
                debug!(detector = name, error = %e, "detector fault");
                DetectorRun { name, contributions: None }
            }
            Err(_) => {
                debug!(detector = name, "detector timed out");
                DetectorRun { name, contributions: None }
            }
        }
    }

    fn detector_budget(&self, name: &str, ctx: &RequestContext) -> Duration {
        let configured = self
            .timeouts
            .get(name)
            .copied()
            .unwrap_or(Duration::from_millis(500));
        match ctx.remaining() {
            Some(remaining) => configured.min(remaining.max(Duration::from_millis(1))),
            None => configured,
        }
    }

    /// Reference aggregation: weighted deltas summed through tanh into a
    /// bounded probability, plus category rollups and the confidence
    /// meta-measure.
    fn aggregate(
        &self,
        ctx: &RequestContext,
        contributions: &[Contribution],
        failed: &[String],
        started: Instant,
        early_exit: bool,
        forced_block: bool,
    ) -> AggregatedEvidence {
        let mut positive = 0.0f64;
        let mut negative = 0.0f64;
        let mut categories: HashMap<Category, CategoryScore> = HashMap::new();

        for c in contributions {
            let weighted = c.weighted();
            if weighted >= 0.0 {
                positive += weighted;
            } else {
                negative += weighted;
            }
            let slot = categories.entry(c.category).or_default();
            slot.score = slot.score.max(c.confidence_delta.abs());
            slot.count += 1;
        }

        let raw = (positive + negative).tanh();
        let bot_probability = ((raw + 1.0) / 2.0).clamp(0.0, 1.0);

        let confidence = if contributions.is_empty() {
            0.0
        } else {
            (0.4 + 0.1 * categories.len() as f64 + 0.05 * contributions.len() as f64).min(1.0)
        };

        // Most recent classification wins, except a verified bot beats
        // everything.
        let mut primary_bot_type = None;
        let mut primary_bot_name = None;
        for c in contributions {
            if let Some(bot_type) = c.bot_type {
                primary_bot_type = Some(bot_type);
                primary_bot_name = c.bot_name.clone();
            }
        }
        if let Some(verified) = contributions
            .iter()
            .find(|c| c.bot_type == Some(BotType::VerifiedBot))
        {
            primary_bot_type = Some(BotType::VerifiedBot);
            primary_bot_name = verified.bot_name.clone();
        }

        AggregatedEvidence {
            bot_probability,
            confidence,
            risk_band: RiskBand::from_probability(bot_probability),
            contributions: contributions.to_vec(),
            signals: ctx.signals.snapshot(),
            category_breakdown: categories,
            primary_bot_type,
            primary_bot_name,
            early_exit,
            forced_block,
            processing_time_ms: started.elapsed().as_secs_f64() * 1_000.0,
            failed_detectors: failed.to_vec(),
            evaluated_at: ctx.received_at,
        }
    }

    /// Confident verdicts feed the weight store through the bounded queue.
    fn feed_learning(&self, ctx: &RequestContext, evidence: &AggregatedEvidence) {
        let Some(queue) = &self.learning else { return };
        if !self.options.learning.enabled
            || evidence.confidence < self.options.learning.min_confidence
        {
            return;
        }
        let was_bot = evidence.bot_probability >= self.options.bot_threshold;
        let features = self.extractor.full(ctx, evidence);
        queue.offer_all(features.into_iter().filter(|(_, v)| *v > 0.0).map(
            |(feature, value)| Observation {
                feature,
                was_bot,
                impact: evidence.confidence * value,
            },
        ));
    }
}

// ── Builder ───────────────────────────────────────────────────────────────────

pub struct EngineBuilder {
    options:        Options,
    weights:        Option<Arc<dyn WeightStore>>,
    patterns:       Option<Arc<dyn PatternCache>>,
    versions:       Option<Arc<dyn BrowserVersionService>>,
    fingerprints:   Option<Arc<dyn FingerprintStore>>,
    llm:            Option<Arc<dyn LlmClient>>,
    pattern_writer: Option<Arc<dyn PatternWriter>>,
    metrics:        Option<Arc<dyn MetricsSink>>,
}

impl EngineBuilder {
    fn new(options: Options) -> Self {
        Self {
            options,
            weights:        None,
            patterns:       None,
            versions:       None,
            fingerprints:   None,
            llm:            None,
            pattern_writer: None,
            metrics:        None,
        }
    }

    pub fn weight_store(mut self, store: Arc<dyn WeightStore>) -> Self {
        self.weights = Some(store);
        self
    }

    pub fn pattern_cache(mut self, cache: Arc<dyn PatternCache>) -> Self {
        self.patterns = Some(cache);
        self
    }

    pub fn browser_versions(mut self, versions: Arc<dyn BrowserVersionService>) -> Self {
        self.versions = Some(versions);
        self
    }

    pub fn fingerprint_store(mut self, store: Arc<dyn FingerprintStore>) -> Self {
        self.fingerprints = Some(store);
        self
    }

    pub fn llm_client(mut self, client: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(client);
        self
    }

    pub fn pattern_writer(mut self, writer: Arc<dyn PatternWriter>) -> Self {
        self.pattern_writer = Some(writer);
        self
    }

    pub fn metrics(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(sink);
        self
    }

    /// Validate options, wire collaborators (in-memory defaults where
    /// none were provided), compile detectors, and start the background
    /// workers when a runtime is available.
    pub fn build(self) -> Result<Engine, EngineError> {
        self.options.validate()?;
        let options = Arc::new(self.options);

        let master_key = match &options.identity.key_hex {
            Some(hex_key) => hex::decode(hex_key)
                .map_err(|e| EngineError::configuration(format!("identity.key_hex: {e}")))?,
            None => {
                warn!("no identity key configured; generating a process-local one");
                let mut key = vec![0u8; 32];
                rand::thread_rng().fill_bytes(&mut key);
                key
            }
        };
        let identity = IdentityResolver::new(master_key)?
            .with_daily_derivation(options.identity.daily_derivation);

        let trusted_proxies = options
            .trusted_proxies
            .iter()
            .filter_map(|text| match crate::stores::CidrRange::parse(text) {
                Some(range) => Some(range),
                None => {
                    warn!(proxy = %text, "ignoring malformed trusted proxy entry");
                    None
                }
            })
            .collect();

        let weights = self
            .weights
            .unwrap_or_else(|| Arc::new(MemoryWeightStore::new(options.learning.learning_rate)));
        let patterns = self.patterns.unwrap_or_else(|| Arc::new(StaticPatternCache::new()));
        let versions = self
            .versions
            .unwrap_or_else(|| Arc::new(StaticBrowserVersions::default()));
        let fingerprints = self
            .fingerprints
            .unwrap_or_else(|| Arc::new(crate::stores::MemoryFingerprintStore::new()));
        let metrics = self.metrics.unwrap_or_else(|| Arc::new(NoopMetrics));

        let window = Arc::new(WindowStore::new());
        let model = Arc::new(HeuristicModel::new());
        let extractor = Arc::new(FeatureExtractor::new());
        let analyzer = BehaviorAnalyzer::new(chrono::Duration::seconds(
            options.behavioral.burst_window_secs as i64,
        ));

        let deps = DetectorDeps {
            options:        Arc::clone(&options),
            window:         Arc::clone(&window),
            analyzer,
            identity:       identity.clone(),
            patterns:       Arc::clone(&patterns),
            versions:       Arc::clone(&versions),
            fingerprints:   Arc::clone(&fingerprints),
            model:          Arc::clone(&model),
            extractor:      Arc::clone(&extractor),
            llm:            self.llm,
            pattern_writer: self.pattern_writer,
        };

        let mut stages: [Vec<Arc<dyn Detector>>; 4] = Default::default();
        let mut timeouts = HashMap::new();
        let registry = build_registry(&deps);
        if registry.is_empty() {
            warn!("no detectors enabled; every request will aggregate to 0.5");
        }
        let matrix = &options.detectors;
        for detector in registry {
            let timeout_ms = match detector.name() {
                "user_agent" => matrix.user_agent.timeout_ms,
                "headers" => matrix.headers.timeout_ms,
                "ip" => matrix.ip.timeout_ms,
                "behavioral" => matrix.behavioral.timeout_ms,
                "inconsistency" => matrix.inconsistency.timeout_ms,
                "version_age" => matrix.version_age.timeout_ms,
                "security_tools" => matrix.security_tools.timeout_ms,
                "client_side" => matrix.client_side.timeout_ms,
                "heuristic" => matrix.heuristic.timeout_ms,
                "llm" => matrix.llm.timeout_ms,
                _ => 500,
            };
            timeouts.insert(detector.name(), Duration::from_millis(timeout_ms));
            stages[detector.stage().index()].push(detector);
        }

        // Background workers need a runtime; without one (plain sync
        // context) the engine still works, minus learning and eviction.
        let in_runtime = tokio::runtime::Handle::try_current().is_ok();
        let trainer = if options.learning.enabled && in_runtime {
            Some(Trainer::spawn(
                Arc::clone(&weights),
                Arc::clone(&model),
                &options.learning,
            ))
        } else {
            None
        };
        let learning = trainer.as_ref().map(|t| t.queue.clone());
        if in_runtime {
            tokio::spawn(Arc::clone(&window).housekeeping_loop());
        }

        let selector =
            ActionSelector::new(options.actions.clone(), options.bot_threshold);

        if options.detectors.llm.enabled && stages[Stage::Intelligence.index()].iter().all(|d| d.name() != "llm")
        {
            error!("llm detector enabled but no LlmClient was provided; skipping it");
        }

        Ok(Engine {
            options,
            identity,
            trusted_proxies,
            window,
            stages,
            timeouts,
            extractor,
            learning,
            selector,
            metrics,
            _trainer: trainer,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::Action;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn browser_ctx() -> RequestContext {
        RequestContext::builder("GET", "/index.html")
            .remote_addr("81.2.69.142".parse().unwrap())
            .header("Host", "example.net")
            .header("User-Agent", "Mozilla/5.0 (Windows NT 10.0) Chrome/138.0.0.0 Safari/537.36")
            .header("Accept", "text/html,application/xhtml+xml")
            .header("Accept-Language", "en-US,en;q=0.9")
            .header("Accept-Encoding", "gzip, deflate, br")
            .header("Cache-Control", "max-age=0")
            .header("Connection", "keep-alive")
            .header("Upgrade-Insecure-Requests", "1")
            .header("Sec-Fetch-Dest", "document")
            .header("Sec-Fetch-Mode", "navigate")
            .header("Sec-Ch-Ua", "\"Chromium\";v=\"138\"")
            .header("Referer", "https://example.net/")
            .header("Cookie", "session=abc")
            .build()
    }

    fn engine() -> Engine {
        Engine::builder(Options::default()).build().unwrap()
    }

    #[tokio::test]
    async fn probability_always_stays_in_bounds() {
        let engine = engine();
        let mut ctx = browser_ctx();
        let (_, evidence) = engine.evaluate(&mut ctx).await;
        assert!((0.0..=1.0).contains(&evidence.bot_probability));
        assert!((0.0..=1.0).contains(&evidence.confidence));
        assert_eq!(evidence.risk_band, RiskBand::from_probability(evidence.bot_probability));
    }

    #[tokio::test]
    async fn zero_detectors_yield_the_midpoint_and_allow() {
        let mut options = Options::default();
        options.detectors.user_agent.enabled = false;
        options.detectors.headers.enabled = false;
        options.detectors.ip.enabled = false;
        options.detectors.behavioral.enabled = false;
        options.detectors.inconsistency.enabled = false;
        options.detectors.version_age.enabled = false;
        options.detectors.security_tools.enabled = false;
        options.detectors.client_side.enabled = false;
        options.detectors.heuristic.enabled = false;
        let engine = Engine::builder(options).build().unwrap();

        let mut ctx = RequestContext::builder("GET", "/").build();
        let (decision, evidence) = engine.evaluate(&mut ctx).await;
        assert_eq!(evidence.bot_probability, 0.5);
        assert_eq!(decision.action, Action::Allow);
        assert!(evidence.contributions.is_empty());
        assert!(evidence.failed_detectors.is_empty());
    }

    #[tokio::test]
    async fn security_scanner_forces_an_early_stage_zero_block() {
        let engine = engine();
        let mut ctx = RequestContext::builder("GET", "/admin")
            .remote_addr("81.2.69.142".parse().unwrap())
            .header("User-Agent", "sqlmap/1.7.2#stable (https://sqlmap.org)")
            .build();
        let (decision, evidence) = engine.evaluate(&mut ctx).await;

        assert!(evidence.forced_block);
        assert!(evidence.early_exit);
        assert_eq!(evidence.primary_bot_type, Some(BotType::MaliciousBot));
        assert!(matches!(decision.action, Action::Block { .. }));
        // Stages 1-3 never ran: no behavioral or heuristic contributions.
        assert!(evidence
            .contributions
            .iter()
            .all(|c| c.detector != "behavioral" && c.detector != "heuristic"));
    }

    #[tokio::test]
    async fn failed_detectors_are_recorded_and_skipped() {
        struct Exploder;
        #[async_trait]
        impl Detector for Exploder {
            fn name(&self) -> &'static str {
                "exploder"
            }
            fn stage(&self) -> Stage {
                Stage::RawSignals
            }
            async fn detect(
                &self,
                _ctx: &RequestContext,
                _prior: &AggregatedEvidence,
            ) -> Result<Vec<Contribution>, EngineError> {
                Err(EngineError::detector("exploder", "boom"))
            }
        }

        let mut engine = engine();
        engine.stages[Stage::RawSignals.index()].push(Arc::new(Exploder));
        let mut ctx = browser_ctx();
        let (decision, evidence) = engine.evaluate(&mut ctx).await;
        assert!(evidence.failed_detectors.contains(&"exploder".to_string()));
        // The pipeline carried on.
        assert_eq!(decision.action, Action::Allow);
        assert!(!evidence.contributions.is_empty());
    }

    #[tokio::test]
    async fn slow_detectors_time_out_without_stalling_the_request() {
        struct Sleeper;
        #[async_trait]
        impl Detector for Sleeper {
            fn name(&self) -> &'static str {
                "sleeper"
            }
            fn stage(&self) -> Stage {
                Stage::RawSignals
            }
            async fn detect(
                &self,
                _ctx: &RequestContext,
                _prior: &AggregatedEvidence,
            ) -> Result<Vec<Contribution>, EngineError> {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(Vec::new())
            }
        }

        let mut engine = engine();
        engine.timeouts.insert("sleeper", Duration::from_millis(20));
        engine.stages[Stage::RawSignals.index()].push(Arc::new(Sleeper));

        let mut ctx = browser_ctx();
        let started = Instant::now();
        let (_, evidence) = engine.evaluate(&mut ctx).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(evidence.failed_detectors.contains(&"sleeper".to_string()));
    }

    #[tokio::test]
    async fn forwarded_for_is_ignored_from_untrusted_peers() {
        let mut options = Options::default();
        options.trusted_proxies = vec!["10.0.0.0/8".to_string()];
        let engine = Engine::builder(options).build().unwrap();

        // Direct peer outside the trusted set: the XFF chain is dropped
        // and identity hashes key off the peer address.
        let mut spoofed = RequestContext::builder("GET", "/")
            .remote_addr("203.0.113.7".parse().unwrap())
            .header("User-Agent", "curl/8.4.0")
            .header("X-Forwarded-For", "13.65.1.2")
            .build();
        engine.evaluate(&mut spoofed).await;
        assert!(spoofed.forwarded_for.is_none());
        assert_eq!(spoofed.client_ip(), Some("203.0.113.7".parse().unwrap()));

        // Trusted peer: the chain is honored.
        let mut proxied = RequestContext::builder("GET", "/")
            .remote_addr("10.0.0.1".parse().unwrap())
            .header("User-Agent", "curl/8.4.0")
            .header("X-Forwarded-For", "13.65.1.2")
            .build();
        engine.evaluate(&mut proxied).await;
        assert_eq!(proxied.client_ip(), Some("13.65.1.2".parse().unwrap()));
    }

    #[tokio::test]
    async fn configured_api_key_header_feeds_identity() {
        let engine = engine();
        let mut ctx = RequestContext::builder("GET", "/api/v1/data")
            .remote_addr("203.0.113.8".parse().unwrap())
            .header("User-Agent", "svc-client/2.0 (internal batch)")
            .header("X-Api-Key", "k-123456")
            .build();
        engine.evaluate(&mut ctx).await;
        assert_eq!(ctx.api_key.as_deref(), Some("k-123456"));
        assert!(ctx.identity.api_key.is_some());
    }

    #[tokio::test]
    async fn stages_execute_in_ascending_order() {
        static ORDER: AtomicUsize = AtomicUsize::new(0);

        struct StageProbe {
            name:  &'static str,
            stage: Stage,
        }
        #[async_trait]
        impl Detector for StageProbe {
            fn name(&self) -> &'static str {
                self.name
            }
            fn stage(&self) -> Stage {
                self.stage
            }
            async fn detect(
                &self,
                _ctx: &RequestContext,
                _prior: &AggregatedEvidence,
            ) -> Result<Vec<Contribution>, EngineError> {
                let seen = ORDER.fetch_add(1, Ordering::SeqCst);
                // Later stages must observe earlier ones done.
                match self.stage {
                    Stage::RawSignals => assert_eq!(seen, 0),
                    Stage::Behavioral => assert_eq!(seen, 1),
                    Stage::MetaAnalysis => assert_eq!(seen, 2),
                    Stage::Intelligence => assert_eq!(seen, 3),
                }
                Ok(Vec::new())
            }
        }

        let mut options = Options::default();
        options.detectors = crate::config::DetectorMatrix {
            user_agent:     crate::config::DetectorSettings::disabled(),
            headers:        crate::config::DetectorSettings::disabled(),
            ip:             crate::config::DetectorSettings::disabled(),
            behavioral:     crate::config::DetectorSettings::disabled(),
            inconsistency:  crate::config::DetectorSettings::disabled(),
            version_age:    crate::config::DetectorSettings::disabled(),
            security_tools: crate::config::DetectorSettings::disabled(),
            client_side:    crate::config::DetectorSettings::disabled(),
            heuristic:      crate::config::DetectorSettings::disabled(),
            llm:            crate::config::DetectorSettings::disabled(),
        };
        let mut engine = Engine::builder(options).build().unwrap();
        for (name, stage) in [
            ("probe0", Stage::RawSignals),
            ("probe1", Stage::Behavioral),
            ("probe2", Stage::MetaAnalysis),
            ("probe3", Stage::Intelligence),
        ] {
            engine.stages[stage.index()].push(Arc::new(StageProbe { name, stage }));
        }

        let mut ctx = browser_ctx();
        engine.evaluate(&mut ctx).await;
        assert_eq!(ORDER.load(Ordering::SeqCst), 4);
    }
}
