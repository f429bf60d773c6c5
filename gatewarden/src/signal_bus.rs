// gatewarden/src/signal_bus.rs
//
// Per-request typed signal bus.
//
// Detectors publish intermediate findings under well-known string keys;
// later stages read them. The bus lives and dies with one request — it is
// never shared across requests, so a plain RwLock is enough for the
// intra-stage concurrency of the wave scheduler.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Canonical signal keys. Every key has a documented value kind; detectors
/// must use these constants rather than ad-hoc strings.
pub mod keys {
    /// Bool — client address is RFC1918 / loopback.
    pub const IP_IS_LOCAL: &str = "ip.is_local";
    /// Bool — request carried no User-Agent header.
    pub const UA_EMPTY: &str = "ua.empty";
    /// Int — byte length of the User-Agent value.
    pub const UA_LENGTH: &str = "ua.length";
    /// Int — total number of request headers.
    pub const HEADERS_COUNT: &str = "headers.count";

    /// Text — hex identity hash of the stored browser fingerprint.
    pub const CLIENT_FINGERPRINT_HASH: &str = "client.fingerprint_hash";
    /// Float — fingerprint integrity score, 0–100.
    pub const CLIENT_INTEGRITY_SCORE: &str = "client.integrity_score";
    /// Float — headless-browser likelihood, 0–1.
    pub const CLIENT_HEADLESS_LIKELIHOOD: &str = "client.headless_likelihood";

    /// Text — "bot" or "human", published by the LLM detector.
    pub const AI_PREDICTION: &str = "ai.prediction";
    /// Float — LLM self-reported confidence, 0–1.
    pub const AI_CONFIDENCE: &str = "ai.confidence";

    /// Prefix for response-side signals populated by external collaborators.
    /// Read-only from this crate's point of view.
    pub const RESPONSE_PREFIX: &str = "response.";

    /// Prefix for the hex identity keys written by the identity resolver.
    pub const IDENTITY_PREFIX: &str = "id.";
}

/// Closed set of value kinds a signal may carry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SignalValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl SignalValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Float(v) => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<bool> for SignalValue {
    fn from(v: bool) -> Self { Self::Bool(v) }
}
impl From<i64> for SignalValue {
    fn from(v: i64) -> Self { Self::Int(v) }
}
impl From<usize> for SignalValue {
    fn from(v: usize) -> Self { Self::Int(v as i64) }
}
impl From<f64> for SignalValue {
    fn from(v: f64) -> Self { Self::Float(v) }
}
impl From<&str> for SignalValue {
    fn from(v: &str) -> Self { Self::Text(v.to_string()) }
}
impl From<String> for SignalValue {
    fn from(v: String) -> Self { Self::Text(v) }
}

/// Request-scoped signal store. Put overwrites, Get clones, Snapshot freezes.
#[derive(Debug, Default)]
pub struct SignalBus {
    inner: RwLock<BTreeMap<String, SignalValue>>,
}

impl SignalBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, key: impl Into<String>, value: impl Into<SignalValue>) {
        self.inner.write().insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<SignalValue> {
        self.inner.read().get(key).cloned()
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(|v| v.as_bool())
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(|v| v.as_f64())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.read().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Immutable view for the aggregator. Key order is stable, which keeps
    /// feature extraction deterministic for identical inputs.
    pub fn snapshot(&self) -> SignalSnapshot {
        SignalSnapshot { values: self.inner.read().clone() }
    }
}

/// Frozen copy of the bus, attached to AggregatedEvidence.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignalSnapshot {
    values: BTreeMap<String, SignalValue>,
}

impl SignalSnapshot {
    pub fn get(&self, key: &str) -> Option<&SignalValue> {
        self.values.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &SignalValue)> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
