// gatewarden/tests/pipeline.rs
//
// End-to-end pipeline scenarios against the default registry with
// in-memory collaborators.

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};

use gatewarden::config::Options;
use gatewarden::engine::Engine;
use gatewarden::evidence::{Action, BotType, RiskBand};
use gatewarden::request::{RequestContext, RequestContextBuilder};

const CHROME_UA: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/138.0.0.0 Safari/537.36";

fn t(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(1_760_000_000_000 + ms).unwrap()
}

fn engine() -> Engine {
    let mut options = Options::default();
    // Deterministic identities across engines in these tests.
    options.identity.key_hex = Some("11".repeat(32));
    Engine::builder(options).build().unwrap()
}

fn browser_page(path: &str, ip: &str, at: DateTime<Utc>) -> RequestContextBuilder {
    RequestContext::builder("GET", path)
        .remote_addr(ip.parse().unwrap())
        .received_at(at)
        .header("Host", "shop.example")
        .header("User-Agent", CHROME_UA)
        .header("Accept", "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8")
        .header("Accept-Language", "en-US,en;q=0.9")
        .header("Accept-Encoding", "gzip, deflate, br")
        .header("Cache-Control", "max-age=0")
        .header("Connection", "keep-alive")
        .header("Upgrade-Insecure-Requests", "1")
        .header("Sec-Fetch-Dest", "document")
        .header("Sec-Fetch-Mode", "navigate")
        .header("Sec-Ch-Ua", "\"Chromium\";v=\"138\"")
        .header("Cookie", "session=9f8e7d6c")
}

// ── Scenario 1: plain browser, fresh session ──────────────────────────────────

#[tokio::test]
async fn plain_browser_fresh_session_is_allowed() {
    let engine = engine();
    let mut ctx = browser_page("/index.html", "81.2.69.142", t(0))
        .header("Referer", "https://www.example.net/")
        .build();
    let (decision, evidence) = engine.evaluate(&mut ctx).await;

    assert!(
        evidence.bot_probability <= 0.25,
        "p = {} ({:?})",
        evidence.bot_probability,
        evidence.contributions
    );
    assert!(
        matches!(evidence.risk_band, RiskBand::VeryLow | RiskBand::Low),
        "band = {}",
        evidence.risk_band
    );
    assert_eq!(decision.action, Action::Allow);
    assert!(!evidence.early_exit);
}

// ── Scenario 2: curl scan ─────────────────────────────────────────────────────

#[tokio::test]
async fn curl_scan_is_blocked_as_a_tool() {
    let engine = engine();
    let mut ctx = RequestContext::builder("GET", "/admin/config.php")
        .remote_addr("198.51.100.23".parse().unwrap())
        .received_at(t(0))
        .header("Host", "shop.example")
        .header("User-Agent", "curl/8.4.0")
        .header("Accept", "*/*")
        .build();
    let (decision, evidence) = engine.evaluate(&mut ctx).await;

    assert!(evidence.bot_probability >= 0.70, "p = {}", evidence.bot_probability);
    assert_eq!(evidence.primary_bot_type, Some(BotType::Tool));
    assert!(
        matches!(decision.action, Action::Block { .. } | Action::Throttle { .. }),
        "action = {}",
        decision.action
    );
}

// ── Scenario 3: verified Googlebot ────────────────────────────────────────────

#[tokio::test]
async fn verified_googlebot_is_always_allowed() {
    let engine = engine();
    let mut ctx = RequestContext::builder("GET", "/products")
        .remote_addr("66.249.66.1".parse().unwrap())
        .received_at(t(0))
        .header("Host", "shop.example")
        .header(
            "User-Agent",
            "Mozilla/5.0 (compatible; Googlebot/2.1; +http://www.google.com/bot.html)",
        )
        .header("Accept", "text/html,*/*")
        .build();
    let (decision, evidence) = engine.evaluate(&mut ctx).await;

    assert_eq!(evidence.primary_bot_type, Some(BotType::VerifiedBot));
    assert_eq!(evidence.primary_bot_name.as_deref(), Some("Googlebot"));
    assert!(evidence
        .contributions
        .iter()
        .any(|c| c.confidence_delta == -1.0 && c.bot_type == Some(BotType::VerifiedBot)));
    assert_eq!(decision.action, Action::Allow);
}

// ── Scenario 4: security scanner ──────────────────────────────────────────────

#[tokio::test]
async fn sqlmap_forces_a_stage_zero_block() {
    let engine = engine();
    let mut ctx = RequestContext::builder("GET", "/login.php?user=1")
        .remote_addr("198.51.100.40".parse().unwrap())
        .received_at(t(0))
        .header("Host", "shop.example")
        .header("User-Agent", "sqlmap/1.7.2#stable (https://sqlmap.org)")
        .build();
    let (decision, evidence) = engine.evaluate(&mut ctx).await;

    assert!(evidence.bot_probability >= 0.95, "p = {}", evidence.bot_probability);
    assert_eq!(evidence.primary_bot_type, Some(BotType::MaliciousBot));
    assert!(evidence.forced_block);
    assert!(evidence.early_exit);
    assert!(matches!(decision.action, Action::Block { .. }));
    // Stages 1-3 never ran.
    assert!(evidence
        .contributions
        .iter()
        .all(|c| !["behavioral", "inconsistency", "heuristic"].contains(&c.detector.as_str())));
}

// ── Scenario 5: perfectly periodic client ─────────────────────────────────────

#[tokio::test]
async fn periodic_client_is_flagged_and_throttled() {
    let engine = engine();
    let mut last = None;
    for i in 0..10 {
        let mut ctx = browser_page("/feed", "93.184.216.34", t(i * 1_000)).build();
        last = Some(engine.evaluate(&mut ctx).await);
    }
    let (decision, evidence) = last.unwrap();

    assert!(
        evidence
            .contributions
            .iter()
            .any(|c| c.reason.contains("too regular interval")),
        "missing regularity flag: {:?}",
        evidence.contributions
    );
    assert!(evidence.bot_probability >= 0.5, "p = {}", evidence.bot_probability);
    assert!(
        matches!(decision.action, Action::Throttle { .. }),
        "action = {} at p = {}",
        decision.action,
        evidence.bot_probability
    );
}

// ── Scenario 6: HTTP/2 page load with many assets ─────────────────────────────

#[tokio::test]
async fn http2_asset_storm_rates_against_pages() {
    let engine = engine();
    let ip = "93.184.216.50";

    let mut page = browser_page("/shop", ip, t(0))
        .header("Referer", "https://shop.example/")
        .build();
    let (page_decision, _) = engine.evaluate(&mut page).await;
    assert_eq!(page_decision.action, Action::Allow);

    // 30 asset requests inside two seconds, uneven gaps.
    let mut at = 40i64;
    let mut last = None;
    for i in 0..30 {
        at += 30 + (i * 37) % 120;
        let mut asset = RequestContext::builder("GET", &format!("/static/chunk-{i}.js"))
            .remote_addr(ip.parse().unwrap())
            .received_at(t(at))
            .header("Host", "shop.example")
            .header("User-Agent", CHROME_UA)
            .header("Accept", "*/*")
            .header("Accept-Language", "en-US,en;q=0.9")
            .header("Accept-Encoding", "gzip, deflate, br")
            .header("Cache-Control", "no-cache")
            .header("Connection", "keep-alive")
            .header("Upgrade-Insecure-Requests", "1")
            .header("Sec-Fetch-Dest", "script")
            .header("Sec-Fetch-Mode", "no-cors")
            .header("Referer", "https://shop.example/shop")
            .header("Cookie", "session=9f8e7d6c")
            .build();
        last = Some(engine.evaluate(&mut asset).await);
    }
    let (decision, evidence) = last.unwrap();

    assert!(
        !evidence.contributions.iter().any(|c| c.reason.contains("rate limit")),
        "multiplexed assets tripped the limit: {:?}",
        evidence.contributions
    );
    assert_eq!(decision.action, Action::Allow, "p = {}", evidence.bot_probability);
}

// ── Cross-cutting invariants ──────────────────────────────────────────────────

#[tokio::test]
async fn identity_hashing_is_deterministic_across_engines() {
    // Same key, two engine instances: same rate-limit identity, so the
    // second engine sees the first one's... nothing, but the signal bus
    // carries identical identity hashes for identical input.
    let a = engine();
    let b = engine();

    let mut ctx_a = browser_page("/x", "203.0.113.9", t(0)).build();
    let mut ctx_b = browser_page("/x", "203.0.113.9", t(0)).build();
    a.evaluate(&mut ctx_a).await;
    b.evaluate(&mut ctx_b).await;

    let id_a = ctx_a.signals.get("id.primary");
    let id_b = ctx_b.signals.get("id.primary");
    assert!(id_a.is_some());
    assert_eq!(
        id_a.map(|v| v.as_text().unwrap().to_string()),
        id_b.map(|v| v.as_text().unwrap().to_string())
    );
}

#[tokio::test]
async fn evaluation_is_stable_for_identical_fresh_state() {
    // Two fresh engines with the same key and the same request agree on
    // the verdict (modulo processing time).
    let mut ctx_a = browser_page("/same", "203.0.113.77", t(0)).build();
    let mut ctx_b = browser_page("/same", "203.0.113.77", t(0)).build();
    let (_, ev_a) = engine().evaluate(&mut ctx_a).await;
    let (_, ev_b) = engine().evaluate(&mut ctx_b).await;
    assert!((ev_a.bot_probability - ev_b.bot_probability).abs() < 1e-9);
    assert_eq!(ev_a.risk_band, ev_b.risk_band);
    assert_eq!(ev_a.contributions.len(), ev_b.contributions.len());
}

#[tokio::test]
async fn counters_reset_after_the_window_expires() {
    let engine = engine();
    let window = Arc::clone(engine.window());
    let ttl = Duration::seconds(60);

    assert_eq!(window.incr_and_get("probe", t(0), ttl), 1);
    assert_eq!(window.incr_and_get("probe", t(30_000), ttl), 2);
    // Monotone within the window.
    assert!(window.peek_count("probe", t(59_000), ttl) >= 2);
    // Reset after expiry.
    assert_eq!(window.peek_count("probe", t(61_000), ttl), 0);
}

#[tokio::test]
async fn whitelisted_bot_beats_hostile_signals() {
    // A verified-bot prefix with scanner garbage appended: the allowlist
    // must still win the classification and the decision.
    let engine = engine();
    let mut ctx = RequestContext::builder("GET", "/.env")
        .remote_addr("198.51.100.77".parse().unwrap())
        .received_at(t(0))
        .header("Host", "shop.example")
        .header(
            "User-Agent",
            "Mozilla/5.0 (compatible; Googlebot/2.1; +http://www.google.com/bot.html) sqlmap",
        )
        .build();
    let (decision, evidence) = engine.evaluate(&mut ctx).await;
    assert_eq!(evidence.primary_bot_type, Some(BotType::VerifiedBot));
    assert_eq!(decision.action, Action::Allow);
}
