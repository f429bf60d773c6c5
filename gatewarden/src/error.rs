// gatewarden/src/error.rs
//
// Error taxonomy for the detection pipeline.
//
// Propagation policy: everything except Configuration is recovered locally.
// External collaborator failures degrade to built-in defaults, detector
// faults are recorded in FailedDetectors and skipped, a pipeline deadline
// short-circuits aggregation with whatever was collected. Callers of
// Engine::evaluate always receive a Decision; an unrecoverable internal
// fault yields Allow with reason "internal_error" (fail-open).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Invalid options at startup. The only fail-fast variant.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A collaborator (WeightStore, PatternCache, FingerprintStore, LlmClient)
    /// failed or timed out. Never fails the request.
    #[error("transient external failure in {source_name}: {message}")]
    TransientExternal { source_name: String, message: String },

    /// A detector errored or panicked. Recorded in FailedDetectors.
    #[error("detector fault in {detector}: {message}")]
    DetectorFault { detector: String, message: String },

    /// The whole request exceeded the orchestrator deadline.
    #[error("pipeline deadline exceeded after stage {completed_stages}")]
    PipelineTimeout { completed_stages: usize },

    /// Signal bus corruption or an impossible invariant. Logged at error,
    /// request is released with a fail-open Allow.
    #[error("unrecoverable internal fault: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn external(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TransientExternal { source_name: source_name.into(), message: message.into() }
    }

    pub fn detector(detector: impl Into<String>, message: impl Into<String>) -> Self {
        Self::DetectorFault { detector: detector.into(), message: message.into() }
    }

    /// True when the request should still produce a best-effort verdict.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Configuration(_))
    }
}
