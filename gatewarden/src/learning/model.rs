// gatewarden/src/learning/model.rs
//
// Logistic model over the sparse feature map:
//
//   score = bias + Σ feature · weight
//   probability = 1 / (1 + exp(-score))
//
// Weights start from the shipped seed table, merged with whatever the
// WeightStore has learned. Reloads swap the whole map atomically so the
// inference path never sees a partial merge.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::debug;

use crate::learning::features::normalize_name;
use crate::stores::WeightStore;

/// Signature type under which feature weights are persisted.
pub const FEATURE_SIG_TYPE: &str = "feature";

const DEFAULT_BIAS: f64 = 0.10;
const DEFAULT_WEIGHT: f64 = 0.10;

/// Shipped defaults. Store-learned weights override these on reload.
fn seed_weights() -> HashMap<String, f64> {
    [
        ("ua:contains_bot", 0.9),
        ("ua:phantomjs", 0.9),
        ("ua:headless", 0.8),
        ("ua:scrapy", 0.8),
        ("ua:selenium", 0.7),
        ("ua:empty", 0.7),
        ("combo:browser_no_accept_lang", 0.6),
        ("path:vcs_probe", 0.6),
        ("sig:response_honeypot_hits", 0.9),
        ("hdr:accept-language", -0.6),
        ("fp:legitimate", -0.8),
        ("fp:received", -0.7),
        ("req:cookie_count", -0.5),
        ("hdr:referer", -0.4),
        ("ua:chrome", -0.2),
        ("ua:firefox", -0.2),
        ("ua:edge", -0.1),
        // Every WebKit UA carries a Safari token; on its own it says
        // nothing either way. Same for asking for HTML.
        ("ua:safari", 0.0),
        ("accept:html", 0.0),
        ("sig:response_has_history", -0.1),
        ("result:bot_probability", 1.0),
    ]
    .into_iter()
    .map(|(name, w)| (normalize_name(name), w))
    .collect()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Inference {
    pub probability: f64,
    pub active_features: usize,
}

/// Default weight for a feature absent from the table. Request-evidence
/// namespaces lean mildly bot-ward; pipeline-introspection namespaces
/// (signal presence, per-detector maxima, failures, rollups) stay
/// neutral until learning assigns them a real weight, otherwise a
/// pristine browser activating dozens of bookkeeping features would
/// score bot-leaning on volume alone.
fn default_weight_for(name: &str) -> f64 {
    match name.split(':').next() {
        Some("sig") | Some("det") | Some("fail") | Some("cat") | Some("hdr") | Some("req")
        | Some("result") => 0.0,
        _ => DEFAULT_WEIGHT,
    }
}

pub struct HeuristicModel {
    weights: ArcSwap<HashMap<String, f64>>,
    bias:    f64,
}

impl HeuristicModel {
    pub fn new() -> Self {
        Self { weights: ArcSwap::from_pointee(seed_weights()), bias: DEFAULT_BIAS }
    }

    /// Pure inference: identical features and weights give an identical
    /// probability.
    pub fn infer(&self, features: &BTreeMap<String, f64>) -> Inference {
        let weights = self.weights.load();
        let mut score = self.bias;
        let mut active = 0usize;
        for (name, value) in features {
            if *value == 0.0 {
                continue;
            }
            active += 1;
            let weight = weights
                .get(name)
                .copied()
                .unwrap_or_else(|| default_weight_for(name));
            score += value * weight;
        }
        Inference { probability: sigmoid(score), active_features: active }
    }

    pub fn weight_of(&self, name: &str) -> f64 {
        let name = normalize_name(name);
        self.weights
            .load()
            .get(&name)
            .copied()
            .unwrap_or_else(|| default_weight_for(&name))
    }

    /// Merge learned weights over the seeds and swap the map in one shot.
    pub async fn reload(&self, store: &dyn WeightStore) {
        let mut merged = seed_weights();
        for (signature, weight) in store.all_weights(FEATURE_SIG_TYPE).await {
            merged.insert(normalize_name(&signature), weight);
        }
        debug!(weights = merged.len(), "heuristic model reloaded");
        self.weights.store(Arc::new(merged));
    }
}

impl Default for HeuristicModel {
    fn default() -> Self {
        Self::new()
    }
}

fn sigmoid(score: f64) -> f64 {
    1.0 / (1.0 + (-score).exp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::MemoryWeightStore;

    fn features(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs.iter().map(|(k, v)| (normalize_name(k), *v)).collect()
    }

    #[test]
    fn empty_features_sit_near_the_bias() {
        let model = HeuristicModel::new();
        let out = model.infer(&BTreeMap::new());
        assert_eq!(out.active_features, 0);
        assert!((out.probability - sigmoid(DEFAULT_BIAS)).abs() < 1e-12);
    }

    #[test]
    fn bot_markers_push_probability_up() {
        let model = HeuristicModel::new();
        let bot = model.infer(&features(&[
            ("ua:contains_bot", 1.0),
            ("ua:empty", 1.0),
            ("path:vcs_probe", 1.0),
        ]));
        assert!(bot.probability > 0.85, "p = {}", bot.probability);
        assert_eq!(bot.active_features, 3);
    }

    #[test]
    fn human_markers_push_probability_down() {
        let model = HeuristicModel::new();
        let human = model.infer(&features(&[
            ("hdr:accept-language", 1.0),
            ("hdr:referer", 1.0),
            ("fp:legitimate", 1.0),
            ("req:cookie_count", 0.6),
            ("ua:chrome", 1.0),
        ]));
        assert!(human.probability < 0.25, "p = {}", human.probability);
    }

    #[test]
    fn zero_valued_features_are_inactive() {
        let model = HeuristicModel::new();
        let out = model.infer(&features(&[("ua:contains_bot", 0.0)]));
        assert_eq!(out.active_features, 0);
    }

    #[test]
    fn unknown_features_get_the_default_weight() {
        let model = HeuristicModel::new();
        assert_eq!(model.weight_of("totally:new"), DEFAULT_WEIGHT);
        // Pipeline-introspection namespaces stay neutral.
        assert_eq!(model.weight_of("det:user_agent"), 0.0);
        assert_eq!(model.weight_of("sig:id_primary"), 0.0);
        // Unless explicitly seeded.
        assert!((model.weight_of("sig:response_honeypot_hits") - 0.9).abs() < 1e-9);
    }

    #[test]
    fn inference_is_pure() {
        let model = HeuristicModel::new();
        let f = features(&[("ua:curl", 1.0), ("hdr:count", 0.15)]);
        let a = model.infer(&f).probability;
        let b = model.infer(&f).probability;
        assert!((a - b).abs() < 1e-9);
    }

    #[tokio::test]
    async fn reload_overrides_seeds_and_keeps_the_rest() {
        let model = HeuristicModel::new();
        let store = MemoryWeightStore::new(1.0);
        store
            .record_observation(FEATURE_SIG_TYPE, "ua:contains_bot", false, 0.3)
            .await;
        model.reload(&store).await;
        assert!((model.weight_of("ua:contains_bot") - (-0.3)).abs() < 1e-9);
        // Untouched seed survives the merge.
        assert!((model.weight_of("ua:empty") - 0.7).abs() < 1e-9);
    }
}
