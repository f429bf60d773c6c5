// gatewarden/src/lib.rs
//
// Inline HTTP bot detection.
//
// A staged detector pipeline inspects each inbound request and produces
// a probabilistic classification, a risk band, a recommended action, and
// an explainable list of contributing reasons. Embed it as middleware so
// routing, throttling and blocking happen before application code runs.
//
// Flow for one request:
//   RequestContext → identity keys onto the signal bus → detectors run
//   wave by wave (raw signals → behavioral → meta-analysis →
//   intelligence) → weighted contributions aggregate into
//   AggregatedEvidence → the action selector returns a Decision.
//
// ```no_run
// use gatewarden::config::Options;
// use gatewarden::engine::Engine;
// use gatewarden::request::RequestContext;
//
// # async fn demo() -> Result<(), gatewarden::error::EngineError> {
// let engine = Engine::builder(Options::default()).build()?;
// let mut ctx = RequestContext::builder("GET", "/index.html")
//     .header("User-Agent", "curl/8.4.0")
//     .build();
// let (decision, evidence) = engine.evaluate(&mut ctx).await;
// println!("{} p={:.2}", decision.action, evidence.bot_probability);
// # Ok(())
// # }
// ```

pub mod behavior;
pub mod config;
pub mod detectors;
pub mod engine;
pub mod error;
pub mod eval;
pub mod evidence;
pub mod identity;
pub mod learning;
pub mod metrics;
pub mod middleware;
pub mod replay;
pub mod request;
pub mod signal_bus;
pub mod state;
pub mod stores;
pub mod synthetic;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::Options;
pub use engine::{Engine, EngineBuilder};
pub use evidence::{
    Action, AggregatedEvidence, BotType, Category, Contribution, Decision, RiskBand,
};
pub use request::RequestContext;
