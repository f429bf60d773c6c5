// gatewarden/src/state/profile.rs
//
// Per-identity behavior profile. Keyed by identity hash, shared across
// requests behind an RwLock, expired on a 24-hour sliding window. Holds
// only derived data — never the plaintext IP or User-Agent.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};

use crate::behavior::navigation::{NavigationModel, TransitionStats};

pub const PROFILE_TTL_HOURS: i64 = 24;
pub const MAX_TRACKED_PATHS: usize = 100;
const MAX_TRACKED_INTERVALS: usize = 50;

#[derive(Debug)]
pub struct BehaviorProfile {
    /// Identity hash this profile belongs to.
    pub identity:       String,
    pub first_seen:     DateTime<Utc>,
    pub last_seen:      DateTime<Utc>,
    pub request_count:  u64,
    pub page_count:     u64,
    pub last_page_at:   Option<DateTime<Utc>>,
    /// Simplified paths with their arrival times, oldest first.
    paths:              VecDeque<(DateTime<Utc>, String)>,
    /// Inter-arrival gaps in seconds, oldest first.
    intervals:          VecDeque<f64>,
    pub nav:            NavigationModel,
    pub with_cookies:   u64,
    pub with_referer:   u64,
}

impl BehaviorProfile {
    pub fn new(identity: &str, now: DateTime<Utc>) -> Self {
        Self {
            identity:      identity.to_string(),
            first_seen:    now,
            last_seen:     now,
            request_count: 0,
            page_count:    0,
            last_page_at:  None,
            paths:         VecDeque::new(),
            intervals:     VecDeque::new(),
            nav:           NavigationModel::new(),
            with_cookies:  0,
            with_referer:  0,
        }
    }

    /// Record one request. Returns the navigation transition stats for
    /// page navigations that had a predecessor.
    pub fn record(
        &mut self,
        now: DateTime<Utc>,
        path: &str,
        is_page: bool,
        has_cookies: bool,
        has_referer: bool,
    ) -> Option<TransitionStats> {
        if self.request_count > 0 {
            let gap = (now - self.last_seen).num_milliseconds() as f64 / 1000.0;
            if gap >= 0.0 {
                self.intervals.push_back(gap);
                if self.intervals.len() > MAX_TRACKED_INTERVALS {
                    self.intervals.pop_front();
                }
            }
        }

        self.request_count += 1;
        self.last_seen = now;
        if has_cookies {
            self.with_cookies += 1;
        }
        if has_referer {
            self.with_referer += 1;
        }

        if !is_page {
            return None;
        }

        self.page_count += 1;
        let transition = self.nav.record(path);
        self.last_page_at = Some(now);

        let simplified = crate::behavior::navigation::simplify_path(path);
        self.paths.push_back((now, simplified));
        while self.paths.len() > MAX_TRACKED_PATHS {
            self.paths.pop_front();
        }

        transition
    }

    /// Warmup covers the first interval of an identity's activity.
    pub fn is_warming_up(&self, now: DateTime<Utc>, warmup: Duration) -> bool {
        now - self.first_seen < warmup
    }

    /// Simplified paths seen within the window, most recent last.
    pub fn paths_in(&self, now: DateTime<Utc>, window: Duration) -> Vec<&str> {
        let cutoff = now - window;
        self.paths
            .iter()
            .filter(|(at, _)| *at >= cutoff)
            .map(|(_, p)| p.as_str())
            .collect()
    }

    pub fn all_paths(&self) -> Vec<&str> {
        self.paths.iter().map(|(_, p)| p.as_str()).collect()
    }

    pub fn has_seen_path(&self, path: &str) -> bool {
        let simplified = crate::behavior::navigation::simplify_path(path);
        self.paths.iter().any(|(_, p)| *p == simplified)
    }

    pub fn intervals(&self) -> &VecDeque<f64> {
        &self.intervals
    }

    /// Average requests per second outside the given trailing window.
    /// Used as the baseline for burst comparison.
    pub fn historical_rate(&self, now: DateTime<Utc>, excluding_last: Duration) -> f64 {
        let span = (now - self.first_seen) - excluding_last;
        let span_secs = span.num_milliseconds() as f64 / 1000.0;
        if span_secs <= 0.0 {
            return 0.0;
        }
        let recent = self.requests_in(now, excluding_last);
        let older = self.request_count.saturating_sub(recent as u64);
        older as f64 / span_secs
    }

    /// Requests recorded within the trailing window, approximated from
    /// the interval history when it covers the window.
    pub fn requests_in(&self, now: DateTime<Utc>, window: Duration) -> usize {
        let window_secs = window.num_milliseconds() as f64 / 1000.0;
        let mut elapsed = (now - self.last_seen).num_milliseconds() as f64 / 1000.0;
        let mut count = if elapsed <= window_secs { 1 } else { 0 };
        for gap in self.intervals.iter().rev() {
            elapsed += gap;
            if elapsed > window_secs {
                break;
            }
            count += 1;
        }
        count
    }

    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        now - self.last_seen > Duration::hours(PROFILE_TTL_HOURS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_760_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn records_counts_and_intervals() {
        let mut p = BehaviorProfile::new("id", t(0));
        p.record(t(0), "/a", true, false, false);
        p.record(t(2), "/b", true, true, true);
        p.record(t(3), "/c.css", false, true, true);
        assert_eq!(p.request_count, 3);
        assert_eq!(p.page_count, 2);
        assert_eq!(p.with_cookies, 2);
        assert_eq!(p.intervals().iter().copied().collect::<Vec<_>>(), vec![2.0, 1.0]);
    }

    #[test]
    fn warmup_window() {
        let p = BehaviorProfile::new("id", t(0));
        assert!(p.is_warming_up(t(60), Duration::seconds(120)));
        assert!(!p.is_warming_up(t(120), Duration::seconds(120)));
    }

    #[test]
    fn paths_are_bounded() {
        let mut p = BehaviorProfile::new("id", t(0));
        for i in 0..(MAX_TRACKED_PATHS + 20) {
            p.record(t(i as i64), &format!("/page-{i}"), true, false, false);
        }
        assert_eq!(p.all_paths().len(), MAX_TRACKED_PATHS);
        // Oldest entries were evicted.
        assert!(!p.has_seen_path("/page-0"));
        assert!(p.has_seen_path("/page-119"));
    }

    #[test]
    fn requests_in_window_counts_trailing_activity() {
        let mut p = BehaviorProfile::new("id", t(0));
        for i in 0..10 {
            p.record(t(i * 30), "/a", true, false, false);
        }
        // Last request at t=270; window of 65s reaches t=205, covering
        // the requests at 240 and 270.
        assert_eq!(p.requests_in(t(270), Duration::seconds(65)), 3);
        assert_eq!(p.requests_in(t(270), Duration::seconds(5)), 1);
    }

    #[test]
    fn expiry_follows_last_seen() {
        let mut p = BehaviorProfile::new("id", t(0));
        p.record(t(0), "/", true, false, false);
        assert!(!p.expired(t(3600)));
        assert!(p.expired(t(25 * 3600)));
    }
}
