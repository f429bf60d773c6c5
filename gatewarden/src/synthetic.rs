// gatewarden/src/synthetic.rs
//
// Labeled synthetic traffic generation for the eval harness and demos.
//
// Six session archetypes: clean browser sessions form the negative
// class; curl probes, scripted scrapers, clockwork pollers, security
// scanners and a verified crawler form the labeled positives (the
// crawler is labeled but expected to pass — it measures the allowlist).

use chrono::{DateTime, Duration, Utc};
use rand::seq::SliceRandom;
use rand::Rng;

use crate::eval::TrafficRecord;

const BROWSER_UAS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/138.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64; rv:141.0) Gecko/20100101 Firefox/141.0",
];

const SCANNER_UAS: &[&str] = &[
    "sqlmap/1.7.2#stable (https://sqlmap.org)",
    "Mozilla/5.0 Nikto/2.5.0",
    "gobuster/3.6",
];

const PAGES: &[&str] = &["/", "/products", "/products/42", "/about", "/blog", "/contact", "/pricing"];
const ASSETS: &[&str] = &["/static/app.js", "/static/site.css", "/images/hero.webp", "/fonts/inter.woff2"];
const PROBE_PATHS: &[&str] = &[
    "/.env", "/.git/config", "/wp-admin/setup-config.php", "/admin/config.php",
    "/phpmyadmin/index.php", "/.aws/credentials", "/backup.sql",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrafficProfile {
    Browser,
    CurlScan,
    Scraper,
    PeriodicBot,
    SecurityScanner,
    VerifiedCrawler,
}

impl TrafficProfile {
    pub fn label(self) -> Option<&'static str> {
        match self {
            Self::Browser => None,
            Self::CurlScan => Some("curl_scan"),
            Self::Scraper => Some("scraper"),
            Self::PeriodicBot => Some("periodic_bot"),
            Self::SecurityScanner => Some("security_scanner"),
            Self::VerifiedCrawler => Some("verified_crawler"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyntheticConfig {
    pub sessions:     usize,
    /// Fraction of sessions drawn from the bot archetypes.
    pub bot_fraction: f64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self { sessions: 50, bot_fraction: 0.4 }
    }
}

/// Generate a shuffled, time-ordered labeled dataset.
pub fn generate(config: &SyntheticConfig) -> Vec<TrafficRecord> {
    let mut rng = rand::thread_rng();
    let mut records = Vec::new();
    let base = Utc::now() - Duration::minutes(30);

    for session in 0..config.sessions {
        let profile = if (session as f64 + 0.5) / config.sessions as f64 >= config.bot_fraction {
            TrafficProfile::Browser
        } else {
            *[
                TrafficProfile::CurlScan,
                TrafficProfile::Scraper,
                TrafficProfile::PeriodicBot,
                TrafficProfile::SecurityScanner,
                TrafficProfile::VerifiedCrawler,
            ]
            .choose(&mut rng)
            .unwrap()
        };
        let ip = format!(
            "{}.{}.{}.{}",
            rng.gen_range(60..200u8),
            rng.gen_range(1..254u8),
            rng.gen_range(1..254u8),
            rng.gen_range(1..254u8)
        );
        let start = base + Duration::seconds(rng.gen_range(0..1_200));
        records.extend(session_records(&mut rng, profile, &ip, start));
    }

    records.sort_by_key(|r| r.timestamp);
    records
}

pub fn to_ndjson(records: &[TrafficRecord]) -> String {
    records.iter().map(|r| r.to_jsonl() + "\n").collect()
}

fn session_records(
    rng: &mut impl Rng,
    profile: TrafficProfile,
    ip: &str,
    start: DateTime<Utc>,
) -> Vec<TrafficRecord> {
    let mut out = Vec::new();
    let label = profile.label();
    let mut at = start;

    let mut push = |at: DateTime<Utc>, path: &str, headers: Vec<(String, String)>| {
        out.push(TrafficRecord {
            timestamp: at,
            method: "GET".into(),
            path: path.to_string(),
            ip: ip.to_string(),
            headers,
            label: label.map(str::to_string),
        });
    };

    match profile {
        TrafficProfile::Browser => {
            let ua = *BROWSER_UAS.choose(rng).unwrap();
            let mut referer: Option<String> = None;
            for _ in 0..rng.gen_range(4..10) {
                let page = *PAGES.choose(rng).unwrap();
                let mut headers = browser_headers(ua, true);
                if let Some(r) = &referer {
                    headers.push(("Referer".into(), r.clone()));
                }
                push(at, page, headers);
                // A page pulls a couple of assets right behind it.
                for _ in 0..rng.gen_range(1..4) {
                    at = at + Duration::milliseconds(rng.gen_range(30..250));
                    let mut asset_headers = browser_headers(ua, false);
                    asset_headers.push(("Referer".into(), format!("https://shop.example{page}")));
                    push(at, *ASSETS.choose(rng).unwrap(), asset_headers);
                }
                referer = Some(format!("https://shop.example{page}"));
                at = at + Duration::milliseconds(rng.gen_range(1_500..12_000));
            }
        }

        TrafficProfile::CurlScan => {
            for path in PROBE_PATHS.iter().copied().take(rng.gen_range(3..PROBE_PATHS.len())) {
                push(at, path, vec![
                    ("Host".into(), "shop.example".into()),
                    ("User-Agent".into(), "curl/8.4.0".into()),
                    ("Accept".into(), "*/*".into()),
                ]);
                at = at + Duration::milliseconds(rng.gen_range(80..400));
            }
        }

        TrafficProfile::Scraper => {
            for i in 0..rng.gen_range(20..40) {
                push(at, &format!("/products/{i}"), vec![
                    ("Host".into(), "shop.example".into()),
                    ("User-Agent".into(), "python-requests/2.31.0".into()),
                    ("Accept".into(), "*/*".into()),
                    ("Accept-Encoding".into(), "gzip, deflate".into()),
                ]);
                at = at + Duration::milliseconds(rng.gen_range(150..600));
            }
        }

        TrafficProfile::PeriodicBot => {
            let ua = BROWSER_UAS[0];
            for _ in 0..rng.gen_range(12..20) {
                push(at, "/feed", browser_headers(ua, true));
                at = at + Duration::seconds(1);
            }
        }

        TrafficProfile::SecurityScanner => {
            let ua = *SCANNER_UAS.choose(rng).unwrap();
            for path in PROBE_PATHS.iter().copied() {
                push(at, path, vec![
                    ("Host".into(), "shop.example".into()),
                    ("User-Agent".into(), ua.to_string()),
                ]);
                at = at + Duration::milliseconds(rng.gen_range(40..200));
            }
        }

        TrafficProfile::VerifiedCrawler => {
            for page in PAGES.iter().copied() {
                push(at, page, vec![
                    ("Host".into(), "shop.example".into()),
                    (
                        "User-Agent".into(),
                        "Mozilla/5.0 (compatible; Googlebot/2.1; +http://www.google.com/bot.html)"
                            .into(),
                    ),
                    ("Accept".into(), "text/html,*/*".into()),
                ]);
                at = at + Duration::seconds(rng.gen_range(2..20));
            }
        }
    }

    out
}

fn browser_headers(ua: &str, page: bool) -> Vec<(String, String)> {
    let mut headers = vec![
        ("Host".to_string(), "shop.example".to_string()),
        ("User-Agent".to_string(), ua.to_string()),
        (
            "Accept".to_string(),
            if page {
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8".to_string()
            } else {
                "*/*".to_string()
            },
        ),
        ("Accept-Language".to_string(), "en-US,en;q=0.9".to_string()),
        ("Accept-Encoding".to_string(), "gzip, deflate, br".to_string()),
        ("Cache-Control".to_string(), "max-age=0".to_string()),
        ("Connection".to_string(), "keep-alive".to_string()),
        ("Upgrade-Insecure-Requests".to_string(), "1".to_string()),
        ("Cookie".to_string(), "session=9f8e7d6c".to_string()),
    ];
    if page {
        headers.push(("Sec-Fetch-Dest".to_string(), "document".to_string()));
        headers.push(("Sec-Fetch-Mode".to_string(), "navigate".to_string()));
        headers.push(("Sec-Ch-Ua".to_string(), "\"Chromium\";v=\"138\"".to_string()));
    } else {
        headers.push(("Sec-Fetch-Dest".to_string(), "script".to_string()));
        headers.push(("Sec-Fetch-Mode".to_string(), "no-cors".to_string()));
    }
    headers
}
