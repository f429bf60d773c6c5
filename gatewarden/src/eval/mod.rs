// gatewarden/src/eval/mod.rs
//
// Labeled dataset + evaluation framework.
//
// Provides a benchmarking harness that:
//   1. Loads a labeled JSONL dataset of requests (label = bot campaign,
//      null = legitimate traffic)
//   2. Runs the full pipeline on every record in order, sharing one
//      engine so sliding-window state accumulates realistically
//   3. Computes per-category and aggregate precision / recall / F1 / FPR
//   4. Prints a markdown-formatted report with a score histogram
//
// Run:
//   gatewarden eval --path labeled_dataset.jsonl
//   gatewarden eval --path labeled_dataset.jsonl --threshold 0.6

pub mod report;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::engine::Engine;
use crate::evidence::Category;
use crate::request::RequestContext;

/// One request in a dataset or replay stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficRecord {
    pub timestamp: DateTime<Utc>,
    pub method:    String,
    pub path:      String,
    pub ip:        String,
    #[serde(default)]
    pub headers:   Vec<(String, String)>,
    /// Bot campaign label; None marks legitimate traffic.
    #[serde(default)]
    pub label:     Option<String>,
}

impl TrafficRecord {
    pub fn to_context(&self) -> RequestContext {
        let mut builder = RequestContext::builder(self.method.clone(), self.path.clone())
            .received_at(self.timestamp);
        if let Ok(ip) = self.ip.parse() {
            builder = builder.remote_addr(ip);
        }
        for (name, value) in &self.headers {
            builder = builder.header(name.clone(), value.clone());
        }
        builder.build()
    }

    pub fn is_bot(&self) -> bool {
        self.label.is_some()
    }

    pub fn to_jsonl(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Parse a JSONL blob into records, skipping malformed lines.
pub fn parse_records(content: &str) -> Vec<TrafficRecord> {
    content
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() {
                return None;
            }
            match serde_json::from_str::<TrafficRecord>(line) {
                Ok(record) => Some(record),
                Err(e) => {
                    tracing::warn!("dataset parse error: {e}");
                    None
                }
            }
        })
        .collect()
}

// ── Per-category performance counters ─────────────────────────────────────────

#[derive(Debug, Default, Clone)]
pub struct DetectorMetrics {
    pub tp:  u64,
    pub fp:  u64,
    pub tn:  u64,
    pub fn_: u64,
}

impl DetectorMetrics {
    pub fn precision(&self) -> f64 {
        let denom = self.tp + self.fp;
        if denom == 0 { 1.0 } else { self.tp as f64 / denom as f64 }
    }

    pub fn recall(&self) -> f64 {
        let denom = self.tp + self.fn_;
        if denom == 0 { 0.0 } else { self.tp as f64 / denom as f64 }
    }

    pub fn f1(&self) -> f64 {
        let p = self.precision();
        let r = self.recall();
        if p + r == 0.0 { 0.0 } else { 2.0 * p * r / (p + r) }
    }

    pub fn fpr(&self) -> f64 {
        let denom = self.fp + self.tn;
        if denom == 0 { 0.0 } else { self.fp as f64 / denom as f64 }
    }

    fn observe(&mut self, fired: bool, is_positive: bool) {
        match (fired, is_positive) {
            (true, true) => self.tp += 1,
            (true, false) => self.fp += 1,
            (false, true) => self.fn_ += 1,
            (false, false) => self.tn += 1,
        }
    }
}

// ── Aggregate evaluation result ───────────────────────────────────────────────

#[derive(Debug)]
pub struct EvalResult {
    pub n_records:       usize,
    pub n_positive:      usize,
    pub n_negative:      usize,
    pub threshold:       f64,
    pub global:          DetectorMetrics,
    pub per_category:    HashMap<Category, DetectorMetrics>,
    pub action_counts:   HashMap<String, u64>,
    /// (score_bin_lower, count), 0.05-wide bins.
    pub score_histogram: Vec<(f64, usize)>,
}

impl EvalResult {
    pub fn print_report(&self) {
        println!("\n## Gatewarden Evaluation Report\n");
        println!("| Metric    | Value   |");
        println!("|-----------|---------|");
        println!("| Records   | {}      |", self.n_records);
        println!("| Positive  | {}      |", self.n_positive);
        println!("| Negative  | {}      |", self.n_negative);
        println!("| Threshold | {:.3}   |", self.threshold);
        println!("| Precision | {:.4}   |", self.global.precision());
        println!("| Recall    | {:.4}   |", self.global.recall());
        println!("| F1        | {:.4}   |", self.global.f1());
        println!("| FPR       | {:.4}   |", self.global.fpr());
        println!();

        println!("### Per-Category Performance\n");
        println!("| Category | P | R | F1 | FPR |");
        println!("|----------|---|---|----|-----|");
        let mut categories: Vec<_> = self.per_category.iter().collect();
        categories.sort_by(|a, b| b.1.f1().partial_cmp(&a.1.f1()).unwrap());
        for (category, m) in categories {
            println!(
                "| {:15} | {:.3} | {:.3} | {:.3} | {:.4} |",
                category.to_string(),
                m.precision(),
                m.recall(),
                m.f1(),
                m.fpr()
            );
        }

        println!("\n### Actions\n");
        let mut actions: Vec<_> = self.action_counts.iter().collect();
        actions.sort();
        for (action, count) in actions {
            println!("{action:12} {count}");
        }

        println!("\n### Score Distribution\n");
        for (lower, count) in &self.score_histogram {
            let bar: String =
                "#".repeat((*count as f64 / self.n_records.max(1) as f64 * 80.0) as usize);
            println!("{:.2}-{:.2} | {:5} | {}", lower, lower + 0.05, count, bar);
        }
    }
}

// ── Evaluator ─────────────────────────────────────────────────────────────────

/// A category counts as "fired" when one of its contributions reaches
/// this delta.
const CATEGORY_FIRE_DELTA: f64 = 0.3;

pub struct Evaluator {
    threshold: f64,
}

impl Evaluator {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    pub async fn run_dataset(&self, engine: Arc<Engine>, path: &Path) -> Result<EvalResult> {
        let content = tokio::fs::read_to_string(path).await?;
        let records = parse_records(&content);
        info!("loaded {} records from {}", records.len(), path.display());
        self.evaluate(engine, records).await
    }

    pub async fn evaluate(
        &self,
        engine: Arc<Engine>,
        records: Vec<TrafficRecord>,
    ) -> Result<EvalResult> {
        let n_records = records.len();
        let n_positive = records.iter().filter(|r| r.is_bot()).count();
        let n_negative = n_records - n_positive;

        let mut global = DetectorMetrics::default();
        let mut per_category: HashMap<Category, DetectorMetrics> = HashMap::new();
        let mut action_counts: HashMap<String, u64> = HashMap::new();
        let mut score_bins = vec![0usize; 20];

        for record in &records {
            let mut ctx = record.to_context();
            let (decision, evidence) = engine.evaluate(&mut ctx).await;

            let is_positive = record.is_bot();
            global.observe(evidence.bot_probability >= self.threshold, is_positive);

            for (category, score) in &evidence.category_breakdown {
                per_category
                    .entry(*category)
                    .or_default()
                    .observe(score.score >= CATEGORY_FIRE_DELTA, is_positive);
            }

            *action_counts.entry(decision.action.to_string()).or_default() += 1;
            let bin = ((evidence.bot_probability / 0.05) as usize).min(19);
            score_bins[bin] += 1;
        }

        let score_histogram =
            score_bins.iter().enumerate().map(|(i, &c)| (i as f64 * 0.05, c)).collect();

        Ok(EvalResult {
            n_records,
            n_positive,
            n_negative,
            threshold: self.threshold,
            global,
            per_category,
            action_counts,
            score_histogram,
        })
    }
}
