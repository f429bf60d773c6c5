// gatewarden/src/replay.rs
//
// JSONL event sources for the CLI: tail a live request log, or replay a
// captured one at scaled speed.

use std::path::PathBuf;

use anyhow::Result;
use chrono::Utc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::eval::TrafficRecord;
use crate::evidence::{AggregatedEvidence, Decision, RiskBand};

/// Tail a JSONL request log, sending parsed records downstream.
/// `seek_end` skips whatever is already in the file.
pub async fn tail_jsonl(
    path: PathBuf,
    tx: mpsc::Sender<TrafficRecord>,
    seek_end: bool,
) -> Result<()> {
    let file = tokio::fs::File::open(&path).await?;
    let mut lines = BufReader::new(file).lines();

    if seek_end {
        while lines.next_line().await?.is_some() {}
    }

    info!("tailing {}", path.display());
    loop {
        match lines.next_line().await? {
            Some(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<TrafficRecord>(line) {
                    Ok(record) => {
                        if tx.send(record).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("parse error: {e}"),
                }
            }
            None => tokio::time::sleep(std::time::Duration::from_millis(50)).await,
        }
    }
    Ok(())
}

/// Replay a captured JSONL file, preserving relative timing scaled by
/// `speed`. Timestamps are rewritten to "now" so the sliding windows see
/// live-looking traffic.
pub async fn replay_jsonl(
    path: PathBuf,
    tx: mpsc::Sender<TrafficRecord>,
    speed: f64,
) -> Result<()> {
    let content = tokio::fs::read_to_string(&path).await?;
    let mut records = crate::eval::parse_records(&content);
    if records.is_empty() {
        return Ok(());
    }
    records.sort_by_key(|r| r.timestamp);

    let base_ts = records[0].timestamp.timestamp_millis() as f64;
    let base_wall = std::time::Instant::now();

    for mut record in records {
        let offset =
            (record.timestamp.timestamp_millis() as f64 - base_ts) / speed.max(0.01) / 1000.0;
        let target = base_wall + std::time::Duration::from_secs_f64(offset);
        let now = std::time::Instant::now();
        if target > now {
            tokio::time::sleep(target - now).await;
        }
        record.timestamp = Utc::now();
        if tx.send(record).await.is_err() {
            break;
        }
    }
    Ok(())
}

/// Colorized one-line verdict for the replay/serve console.
pub fn print_verdict(record: &TrafficRecord, decision: &Decision, evidence: &AggregatedEvidence) {
    let (color, icon) = match evidence.risk_band {
        RiskBand::VeryHigh => ("\x1b[91;1m", "■"),
        RiskBand::High     => ("\x1b[93;1m", "▲"),
        RiskBand::Medium   => ("\x1b[96m", "●"),
        RiskBand::Low | RiskBand::VeryLow => ("\x1b[92m", "·"),
    };
    let reset = "\x1b[0m";
    let reasons = evidence.top_reasons(3).join(" | ");
    let label = record
        .label
        .as_deref()
        .map(|l| format!(" \x1b[90m[{l}]\x1b[0m"))
        .unwrap_or_default();

    println!(
        "{color}{icon} {:<9}{reset} p={color}{:.2}{reset} {:<4} {:<28} {}{label}",
        decision.action.to_string(),
        evidence.bot_probability,
        record.method,
        truncate(&record.path, 28),
        reasons,
    );
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        format!("{}…", &s[..s.char_indices().take(max - 1).last().map(|(i, c)| i + c.len_utf8()).unwrap_or(0)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("/short", 28), "/short");
        let long = "/a-very-long-path-segment-that-keeps-going";
        let cut = truncate(long, 10);
        assert!(cut.ends_with('…'));
        assert!(cut.chars().count() <= 10);
    }
}
