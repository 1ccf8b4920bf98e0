// Rate limiting module - per-provider sliding windows over ring buffers
//
// Each provider tracks requests/minute (60 one-second slots), requests/hour
// (60 one-minute slots), bytes/minute (60 one-second slots), and optionally
// tokens/minute. A window only ever moves forward: `advance` zeroes the slots
// that fell out of the ring since the last observation, so `total` is always
// the sum over the live window.
//
// The limiter is fail-open. It sits on the critical path of every agent API
// call, so an internal failure (a poisoned lock) yields `Allowed` and the
// request proceeds; forwarding must keep working even if accounting breaks.

use crate::providers::ProviderId;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

const SLOT_COUNT: usize = 60;

/// Time source abstraction so tests can steer the windows deterministically.
pub trait Clock: Send + Sync {
    /// Seconds since the Unix epoch.
    fn now_secs(&self) -> u64;
}

/// Wall-clock time, the production source.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_secs(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }
}

/// Limits applied independently to every provider.
#[derive(Debug, Clone)]
pub struct RateLimitSettings {
    pub enabled: bool,
    /// Requests per minute.
    pub rpm: u64,
    /// Requests per hour.
    pub rph: u64,
    /// Request-body bytes per minute.
    pub bytes_pm: u64,
    /// Response tokens per minute; `None` leaves the window off.
    pub tokens_pm: Option<u64>,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            rpm: 600,
            rph: 1000,
            bytes_pm: 50 * 1024 * 1024,
            tokens_pm: None,
        }
    }
}

/// Which window rejected a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitKind {
    Rpm,
    Rph,
    BytesPerMinute,
    TokensPerMinute,
}

impl LimitKind {
    /// Short tag used in metrics labels and log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitKind::Rpm => "rpm",
            LimitKind::Rph => "rph",
            LimitKind::BytesPerMinute => "bytes_pm",
            LimitKind::TokensPerMinute => "tokens_pm",
        }
    }

    /// Window name surfaced in the 429 response body.
    pub fn window_label(&self) -> &'static str {
        match self {
            LimitKind::Rpm => "per_minute",
            LimitKind::Rph => "per_hour",
            LimitKind::BytesPerMinute => "per_minute_bytes",
            LimitKind::TokensPerMinute => "per_minute_tokens",
        }
    }
}

/// Outcome of a limiter check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    Rejected(Rejection),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub kind: LimitKind,
    pub limit: u64,
    /// Seconds until the window admits another request. Always >= 1.
    pub retry_after_secs: u64,
}

/// Ring buffer of `SLOT_COUNT` slot totals. Time is measured in the window's
/// own unit (seconds for the per-minute windows, minutes for the hourly one);
/// the slot for instant `t` is `t % SLOT_COUNT`.
#[derive(Debug, Clone)]
struct SlidingWindow {
    counts: [u64; SLOT_COUNT],
    total: u64,
    /// Unit-timestamp of the most recent observation; `None` until the first
    /// record establishes the time origin.
    last_time: Option<u64>,
}

impl SlidingWindow {
    fn new() -> Self {
        Self {
            counts: [0; SLOT_COUNT],
            total: 0,
            last_time: None,
        }
    }

    /// Move the window forward to `now`, expiring slots that left the ring.
    /// A full wrap clears everything at once, which also prevents drift after
    /// long idle periods. Time never moves backwards.
    fn advance(&mut self, now: u64) {
        let Some(last) = self.last_time else {
            return;
        };
        if now <= last {
            return;
        }
        let elapsed = now - last;
        if elapsed >= SLOT_COUNT as u64 {
            self.counts = [0; SLOT_COUNT];
            self.total = 0;
        } else {
            for t in (last + 1)..=now {
                let idx = (t % SLOT_COUNT as u64) as usize;
                self.total -= self.counts[idx];
                self.counts[idx] = 0;
            }
        }
        self.last_time = Some(now);
    }

    fn record(&mut self, now: u64, value: u64) {
        self.advance(now);
        let idx = (now % SLOT_COUNT as u64) as usize;
        self.counts[idx] += value;
        self.total += value;
        self.last_time = Some(now);
    }

    fn count(&mut self, now: u64) -> u64 {
        self.advance(now);
        self.total
    }

    /// Walk slots oldest to newest and report how many units must pass before
    /// the running total drops strictly below `limit`. Exact for the ring
    /// model; floor 1.
    fn estimate_retry_after(&mut self, now: u64, limit: u64) -> u64 {
        self.advance(now);
        let mut expired = 0u64;
        for age in 1..=SLOT_COUNT as u64 {
            let idx = ((now + age) % SLOT_COUNT as u64) as usize;
            expired += self.counts[idx];
            if self.total - expired < limit {
                return age.max(1);
            }
        }
        SLOT_COUNT as u64
    }

    /// Units until the oldest occupied slot leaves the window (0 when empty).
    /// Drives the `reset` field of the health document.
    fn units_until_decrease(&mut self, now: u64) -> u64 {
        self.advance(now);
        if self.total == 0 {
            return 0;
        }
        for age in 1..=SLOT_COUNT as u64 {
            let idx = ((now + age) % SLOT_COUNT as u64) as usize;
            if self.counts[idx] > 0 {
                return age;
            }
        }
        0
    }
}

/// The four windows tracked for one provider, created on first observation.
struct ProviderWindows {
    rpm: SlidingWindow,
    rph: SlidingWindow,
    bytes: SlidingWindow,
    tokens: SlidingWindow,
}

impl ProviderWindows {
    fn new() -> Self {
        Self {
            rpm: SlidingWindow::new(),
            rph: SlidingWindow::new(),
            bytes: SlidingWindow::new(),
            tokens: SlidingWindow::new(),
        }
    }
}

/// Per-provider sliding-window limiter shared by all listeners.
pub struct RateLimiter {
    settings: RateLimitSettings,
    clock: Box<dyn Clock>,
    states: Mutex<HashMap<ProviderId, ProviderWindows>>,
}

impl RateLimiter {
    pub fn new(settings: RateLimitSettings, clock: Box<dyn Clock>) -> Self {
        Self {
            settings,
            clock,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Decide whether a request may be forwarded. `request_bytes` is the
    /// client-declared body size. Allowed requests are recorded into the
    /// request and byte windows; rejections record nothing.
    pub fn check(&self, provider: ProviderId, request_bytes: u64) -> Decision {
        if !self.settings.enabled {
            return Decision::Allowed;
        }
        // Fail-open: a poisoned lock means some check panicked mid-update.
        // Let traffic through rather than wedge the agent.
        let Ok(mut states) = self.states.lock() else {
            return Decision::Allowed;
        };
        let now = self.clock.now_secs();
        let now_min = now / 60;
        let windows = states.entry(provider).or_insert_with(ProviderWindows::new);

        if windows.rpm.count(now) >= self.settings.rpm {
            return Decision::Rejected(Rejection {
                kind: LimitKind::Rpm,
                limit: self.settings.rpm,
                retry_after_secs: windows.rpm.estimate_retry_after(now, self.settings.rpm),
            });
        }
        if windows.rph.count(now_min) >= self.settings.rph {
            return Decision::Rejected(Rejection {
                kind: LimitKind::Rph,
                limit: self.settings.rph,
                retry_after_secs: windows.rph.estimate_retry_after(now_min, self.settings.rph) * 60,
            });
        }
        if windows.bytes.count(now) + request_bytes > self.settings.bytes_pm {
            return Decision::Rejected(Rejection {
                kind: LimitKind::BytesPerMinute,
                limit: self.settings.bytes_pm,
                retry_after_secs: windows.bytes.estimate_retry_after(now, self.settings.bytes_pm),
            });
        }
        if let Some(tokens_pm) = self.settings.tokens_pm {
            if windows.tokens.count(now) >= tokens_pm {
                return Decision::Rejected(Rejection {
                    kind: LimitKind::TokensPerMinute,
                    limit: tokens_pm,
                    retry_after_secs: windows.tokens.estimate_retry_after(now, tokens_pm),
                });
            }
        }

        windows.rpm.record(now, 1);
        windows.rph.record(now_min, 1);
        if request_bytes > 0 {
            windows.bytes.record(now, request_bytes);
        }
        Decision::Allowed
    }

    /// Feed response token usage into the optional tokens/minute window.
    pub fn record_tokens(&self, provider: ProviderId, tokens: u64) {
        if !self.settings.enabled || self.settings.tokens_pm.is_none() || tokens == 0 {
            return;
        }
        let Ok(mut states) = self.states.lock() else {
            return;
        };
        let now = self.clock.now_secs();
        states
            .entry(provider)
            .or_insert_with(ProviderWindows::new)
            .tokens
            .record(now, tokens);
    }

    /// Per-provider limit status for the health document.
    pub fn health(&self, provider: ProviderId) -> Value {
        let (rpm_used, rpm_reset, rph_used, rph_reset) = match self.states.lock() {
            Ok(mut states) => {
                let now = self.clock.now_secs();
                let windows = states.entry(provider).or_insert_with(ProviderWindows::new);
                (
                    windows.rpm.count(now),
                    windows.rpm.units_until_decrease(now),
                    windows.rph.count(now / 60),
                    windows.rph.units_until_decrease(now / 60) * 60,
                )
            }
            Err(_) => (0, 0, 0, 0),
        };
        json!({
            "enabled": self.settings.enabled,
            "rpm": {
                "limit": self.settings.rpm,
                "remaining": self.settings.rpm.saturating_sub(rpm_used),
                "reset": rpm_reset,
            },
            "rph": {
                "limit": self.settings.rph,
                "remaining": self.settings.rph.saturating_sub(rph_used),
                "reset": rph_reset,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    /// Clock the tests wind by hand.
    #[derive(Default)]
    struct ManualClock(AtomicU64);

    impl ManualClock {
        fn set(&self, secs: u64) {
            self.0.store(secs, Ordering::SeqCst);
        }
    }

    impl Clock for Arc<ManualClock> {
        fn now_secs(&self) -> u64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn limiter_with(settings: RateLimitSettings) -> (RateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        clock.set(1_000_000);
        let limiter = RateLimiter::new(settings, Box::new(clock.clone()));
        (limiter, clock)
    }

    fn enabled(rpm: u64) -> RateLimitSettings {
        RateLimitSettings {
            enabled: true,
            rpm,
            ..Default::default()
        }
    }

    #[test]
    fn test_disabled_limiter_always_allows() {
        let (limiter, _) = limiter_with(RateLimitSettings::default());
        for _ in 0..10_000 {
            assert_eq!(limiter.check(ProviderId::Anthropic, 0), Decision::Allowed);
        }
    }

    #[test]
    fn test_rpm_limit_rejects_after_cap() {
        let (limiter, _) = limiter_with(enabled(2));
        assert_eq!(limiter.check(ProviderId::Anthropic, 0), Decision::Allowed);
        assert_eq!(limiter.check(ProviderId::Anthropic, 0), Decision::Allowed);
        match limiter.check(ProviderId::Anthropic, 0) {
            Decision::Rejected(r) => {
                assert_eq!(r.kind, LimitKind::Rpm);
                assert_eq!(r.limit, 2);
                assert!(r.retry_after_secs >= 1);
            }
            Decision::Allowed => panic!("third request should be rejected"),
        }
        // Rejections never record, so the count stays at the limit.
        match limiter.check(ProviderId::Anthropic, 0) {
            Decision::Rejected(r) => assert_eq!(r.kind, LimitKind::Rpm),
            Decision::Allowed => panic!("fourth request should be rejected"),
        }
    }

    #[test]
    fn test_providers_are_independent() {
        let (limiter, _) = limiter_with(enabled(1));
        assert_eq!(limiter.check(ProviderId::OpenAi, 0), Decision::Allowed);
        assert_eq!(limiter.check(ProviderId::Copilot, 0), Decision::Allowed);
        assert!(matches!(
            limiter.check(ProviderId::OpenAi, 0),
            Decision::Rejected(_)
        ));
    }

    #[test]
    fn test_window_rollover_restores_capacity() {
        let (limiter, clock) = limiter_with(enabled(2));
        limiter.check(ProviderId::Anthropic, 0);
        limiter.check(ProviderId::Anthropic, 0);
        assert!(matches!(
            limiter.check(ProviderId::Anthropic, 0),
            Decision::Rejected(_)
        ));

        // A full window later, the limit is available again.
        clock.set(1_000_000 + 60);
        assert_eq!(limiter.check(ProviderId::Anthropic, 0), Decision::Allowed);
        assert_eq!(limiter.check(ProviderId::Anthropic, 0), Decision::Allowed);
        assert!(matches!(
            limiter.check(ProviderId::Anthropic, 0),
            Decision::Rejected(_)
        ));
    }

    #[test]
    fn test_partial_expiry_admits_gradually() {
        let (limiter, clock) = limiter_with(enabled(2));
        // One request at t, one at t+10.
        limiter.check(ProviderId::Anthropic, 0);
        clock.set(1_000_010);
        limiter.check(ProviderId::Anthropic, 0);
        assert!(matches!(
            limiter.check(ProviderId::Anthropic, 0),
            Decision::Rejected(_)
        ));

        // t+60: the first slot has expired, so exactly one more fits.
        clock.set(1_000_060);
        assert_eq!(limiter.check(ProviderId::Anthropic, 0), Decision::Allowed);
        assert!(matches!(
            limiter.check(ProviderId::Anthropic, 0),
            Decision::Rejected(_)
        ));
    }

    #[test]
    fn test_retry_after_reflects_oldest_slot() {
        let (limiter, clock) = limiter_with(enabled(2));
        limiter.check(ProviderId::Anthropic, 0);
        clock.set(1_000_030);
        limiter.check(ProviderId::Anthropic, 0);
        clock.set(1_000_040);
        match limiter.check(ProviderId::Anthropic, 0) {
            Decision::Rejected(r) => {
                // The slot recorded at t expires at t+60, i.e. 20s from t+40.
                assert_eq!(r.retry_after_secs, 20);
            }
            Decision::Allowed => panic!("should be rejected"),
        }
    }

    #[test]
    fn test_retry_after_full_window_when_burst_is_fresh() {
        let (limiter, _) = limiter_with(enabled(2));
        limiter.check(ProviderId::Anthropic, 0);
        limiter.check(ProviderId::Anthropic, 0);
        match limiter.check(ProviderId::Anthropic, 0) {
            Decision::Rejected(r) => {
                // Both hits landed in the current slot; capacity only returns
                // when that slot leaves the ring, a full window away.
                assert_eq!(r.retry_after_secs, 60);
            }
            Decision::Allowed => panic!("should be rejected"),
        }
    }

    #[test]
    fn test_rph_limit_with_seconds_conversion() {
        let settings = RateLimitSettings {
            enabled: true,
            rpm: 1_000_000,
            rph: 1,
            ..Default::default()
        };
        let (limiter, _) = limiter_with(settings);
        assert_eq!(limiter.check(ProviderId::OpenAi, 0), Decision::Allowed);
        match limiter.check(ProviderId::OpenAi, 0) {
            Decision::Rejected(r) => {
                assert_eq!(r.kind, LimitKind::Rph);
                // Retry-after is expressed in seconds (whole minutes).
                assert!(r.retry_after_secs >= 60);
                assert_eq!(r.retry_after_secs % 60, 0);
            }
            Decision::Allowed => panic!("second request should be rejected"),
        }
    }

    #[test]
    fn test_bytes_limit_counts_declared_size() {
        let settings = RateLimitSettings {
            enabled: true,
            bytes_pm: 1000,
            ..Default::default()
        };
        let (limiter, _) = limiter_with(settings);
        assert_eq!(limiter.check(ProviderId::Anthropic, 600), Decision::Allowed);
        match limiter.check(ProviderId::Anthropic, 600) {
            Decision::Rejected(r) => assert_eq!(r.kind, LimitKind::BytesPerMinute),
            Decision::Allowed => panic!("byte budget exceeded"),
        }
        // A smaller request still fits under the cap.
        assert_eq!(limiter.check(ProviderId::Anthropic, 300), Decision::Allowed);
    }

    #[test]
    fn test_tokens_window_off_by_default() {
        let (limiter, _) = limiter_with(enabled(1_000_000));
        limiter.record_tokens(ProviderId::Anthropic, 1_000_000_000);
        assert_eq!(limiter.check(ProviderId::Anthropic, 0), Decision::Allowed);
    }

    #[test]
    fn test_tokens_window_rejects_when_enabled() {
        let settings = RateLimitSettings {
            enabled: true,
            tokens_pm: Some(100),
            ..Default::default()
        };
        let (limiter, _) = limiter_with(settings);
        assert_eq!(limiter.check(ProviderId::Anthropic, 0), Decision::Allowed);
        limiter.record_tokens(ProviderId::Anthropic, 150);
        match limiter.check(ProviderId::Anthropic, 0) {
            Decision::Rejected(r) => {
                assert_eq!(r.kind, LimitKind::TokensPerMinute);
                assert_eq!(r.limit, 100);
            }
            Decision::Allowed => panic!("token budget exceeded"),
        }
    }

    #[test]
    fn test_fail_open_on_poisoned_state() {
        let (limiter, _) = limiter_with(enabled(0));
        let limiter = Arc::new(limiter);
        // rpm = 0 would reject everything if the limiter were healthy.
        assert!(matches!(
            limiter.check(ProviderId::OpenAi, 0),
            Decision::Rejected(_)
        ));

        let poisoner = limiter.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.states.lock().unwrap();
            panic!("poison the limiter state");
        })
        .join();

        assert_eq!(limiter.check(ProviderId::OpenAi, 0), Decision::Allowed);
    }

    #[test]
    fn test_health_reports_remaining_and_reset() {
        let (limiter, _) = limiter_with(enabled(10));
        limiter.check(ProviderId::Anthropic, 0);
        limiter.check(ProviderId::Anthropic, 0);

        let health = limiter.health(ProviderId::Anthropic);
        assert_eq!(health["enabled"], true);
        assert_eq!(health["rpm"]["limit"], 10);
        assert_eq!(health["rpm"]["remaining"], 8);
        assert_eq!(health["rpm"]["reset"], 60);
        assert_eq!(health["rph"]["limit"], 1000);
        assert_eq!(health["rph"]["remaining"], 998);
    }

    #[test]
    fn test_health_idle_provider() {
        let (limiter, _) = limiter_with(enabled(10));
        let health = limiter.health(ProviderId::Copilot);
        assert_eq!(health["rpm"]["remaining"], 10);
        assert_eq!(health["rpm"]["reset"], 0);
    }

    #[test]
    fn test_window_total_matches_slot_sum() {
        let mut w = SlidingWindow::new();
        for t in 0..200u64 {
            w.record(t, t % 3);
            assert_eq!(w.total, w.counts.iter().sum::<u64>());
        }
    }

    #[test]
    fn test_window_full_wrap_clears() {
        let mut w = SlidingWindow::new();
        w.record(100, 5);
        w.record(110, 5);
        assert_eq!(w.count(120), 10);
        assert_eq!(w.count(100 + 60), 5);
        assert_eq!(w.count(500), 0);
    }

    #[test]
    fn test_window_time_never_decreases() {
        let mut w = SlidingWindow::new();
        w.record(100, 1);
        // An earlier timestamp does not rewind the window.
        assert_eq!(w.count(50), 1);
        assert_eq!(w.last_time, Some(100));
    }
}
