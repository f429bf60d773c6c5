// gatewarden/src/engine/actions.rs
//
// Maps the aggregated verdict plus the request path to a concrete action
// through the configured policy ladders. The selector never mutates the
// evidence; it only reads it.

use std::time::Duration;

use rand::Rng;
use tracing::debug;

use crate::config::{ActionOptions, ActionSpec, Transition};
use crate::evidence::{Action, AggregatedEvidence, Category, Decision};

/// `*` matches any run of characters; a wildcard-free pattern matches as
/// a prefix.
pub fn path_matches(pattern: &str, path: &str) -> bool {
    if !pattern.contains('*') {
        return path.starts_with(pattern);
    }
    glob_match(pattern.as_bytes(), path.as_bytes())
}

fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0usize, 0usize);
    let (mut star, mut mark) = (None::<usize>, 0usize);
    while t < text.len() {
        if p < pattern.len() && (pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == b'*' {
            star = Some(p);
            mark = t;
            p += 1;
        } else if let Some(s) = star {
            p = s + 1;
            mark += 1;
            t = mark;
        } else {
            return false;
        }
    }
    while p < pattern.len() && pattern[p] == b'*' {
        p += 1;
    }
    p == pattern.len()
}

pub struct ActionSelector {
    options:       ActionOptions,
    bot_threshold: f64,
}

impl ActionSelector {
    pub fn new(options: ActionOptions, bot_threshold: f64) -> Self {
        Self { options, bot_threshold }
    }

    /// Resolve the decision for one request. Pure with respect to the
    /// evidence; only the throttle jitter draws randomness.
    pub fn select(&self, evidence: &AggregatedEvidence, path: &str) -> Decision {
        // Verified crawlers pass unconditionally.
        if evidence.is_verified_bot() {
            let name = evidence.primary_bot_name.as_deref().unwrap_or("verified bot");
            return Decision::allow(format!("verified bot: {name}"));
        }

        // No evidence at all (no detectors ran): never act on the 0.5
        // midpoint prior.
        if evidence.contributions.is_empty() && !evidence.forced_block {
            return Decision::allow("no detector evidence");
        }

        if evidence.forced_block {
            let action = self.block_action();
            return Decision {
                action: self.guard_llm_only_block(action, evidence),
                reason: format!(
                    "forced block at probability {:.2}",
                    evidence.bot_probability
                ),
            };
        }

        let transitions = self
            .options
            .routes
            .iter()
            .find(|rule| path_matches(&rule.pattern, path))
            .map(|rule| rule.transitions.as_slice())
            .unwrap_or(&self.options.default_transitions);

        for transition in transitions {
            if !self.transition_fires(transition, evidence) {
                continue;
            }
            let Some(spec) = self.options.policies.get(&transition.policy) else {
                // Validation rejects this at startup; stay safe anyway.
                debug!(policy = %transition.policy, "transition references missing policy");
                continue;
            };
            let action = self.guard_llm_only_block(self.realize(spec, evidence), evidence);
            return Decision {
                action,
                reason: format!(
                    "policy '{}' at probability {:.2} ({})",
                    transition.policy, evidence.bot_probability, evidence.risk_band
                ),
            };
        }

        Decision::allow(format!(
            "probability {:.2} below action thresholds",
            evidence.bot_probability
        ))
    }

    fn transition_fires(&self, transition: &Transition, evidence: &AggregatedEvidence) -> bool {
        if let Some(threshold) = transition.when_risk_exceeds {
            if evidence.bot_probability <= threshold {
                return false;
            }
        }
        if let Some(signal) = &transition.when_signal {
            let truthy = evidence
                .signals
                .get(signal)
                .map(|v| match v {
                    crate::signal_bus::SignalValue::Bool(b) => *b,
                    crate::signal_bus::SignalValue::Int(i) => *i != 0,
                    crate::signal_bus::SignalValue::Float(f) => *f != 0.0,
                    crate::signal_bus::SignalValue::Text(s) => !s.is_empty(),
                })
                .unwrap_or(false);
            if !truthy {
                return false;
            }
        }
        // A transition with no conditions is a catch-all.
        true
    }

    fn realize(&self, spec: &ActionSpec, evidence: &AggregatedEvidence) -> Action {
        match spec {
            ActionSpec::Allow => Action::Allow,
            ActionSpec::Tag { header, value } => {
                Action::Tag { header: header.clone(), value: value.clone() }
            }
            ActionSpec::Throttle { base_ms, jitter, scale_by_risk, max_ms } => {
                let jitter_ms = if *jitter > 0.0 {
                    rand::thread_rng().gen_range(0.0..=(*base_ms as f64 * jitter))
                } else {
                    0.0
                };
                let mut delay = *base_ms as f64 + jitter_ms;
                if *scale_by_risk {
                    delay *= 1.0 + evidence.bot_probability;
                }
                Action::Throttle {
                    delay: Duration::from_millis((delay as u64).min(*max_ms)),
                }
            }
            ActionSpec::Challenge { kind } => Action::Challenge { kind: *kind },
            ActionSpec::Block { status, message } => {
                Action::Block { status: *status, message: message.clone() }
            }
        }
    }

    fn block_action(&self) -> Action {
        match self.options.policies.get("block") {
            Some(spec @ ActionSpec::Block { .. }) => {
                self.realize(spec, &AggregatedEvidence::unknown())
            }
            _ => Action::Block { status: 403, message: "request blocked".to_string() },
        }
    }

    /// An LLM verdict alone must not take a client down below 0.9
    /// confidence; degrade to a challenge instead.
    fn guard_llm_only_block(&self, action: Action, evidence: &AggregatedEvidence) -> Action {
        if !matches!(action, Action::Block { .. }) || evidence.confidence >= 0.9 {
            return action;
        }
        let positives: Vec<_> = evidence
            .contributions
            .iter()
            .filter(|c| c.confidence_delta > 0.0)
            .collect();
        let llm_only = !positives.is_empty()
            && positives.iter().all(|c| c.category == Category::LlmAnalysis);
        if llm_only {
            debug!("downgrading LLM-only block to challenge");
            return Action::Challenge { kind: crate::evidence::ChallengeKind::Interactive };
        }
        action
    }

    pub fn bot_threshold(&self) -> f64 {
        self.bot_threshold
    }
}
