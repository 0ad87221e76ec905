//! Rate-limit accountant for the CDN speed-test endpoint
//!
//! The speed host tolerates roughly 600 download requests per 10-minute
//! window per client IP; the budget here stays a little under that. Two
//! mechanisms cooperate: prospective gating on a ring of admission
//! timestamps, and reactive pausing when a 429 arrives. While paused (or
//! after back-to-back 429s) downloads fail over to the mirror CDN, which
//! has no budget of its own.

use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};

use crate::types::{CancelFlag, ScanEvent, Via, MIRROR_HOST};

/// Conservative request budget per window (the CDN allows ~600)
pub const BUDGET_CAPACITY: usize = 550;
/// Rolling window length
pub const BUDGET_WINDOW: Duration = Duration::from_secs(600);
/// Pause applied when a 429 carries no Retry-After
const DEFAULT_RETRY_AFTER: u64 = 60;
/// Retry-After is clamped to this range; the CDN sends punitive
/// hour-long values after repeated violations
const RETRY_CLAMP: (u64, u64) = (30, 600);
/// Consecutive mirror successes required before failing back
const FAILBACK_STREAK: u32 = 3;

/// Outcome of an admission attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Go ahead; the request was counted
    Granted,
    /// A 429 pause is active for this long
    Paused(Duration),
    /// The window is full; a slot frees up in this long
    WindowFull(Duration),
}

/// Fixed-window budget state. Only the accountant mutates this; the
/// methods take `now` explicitly so the window math is testable.
#[derive(Debug)]
pub struct RateBudget {
    capacity: usize,
    window: Duration,
    stamps: VecDeque<Instant>,
    paused_until: Option<Instant>,
    mirror_active: bool,
    mirror_streak: u32,
}

impl RateBudget {
    pub fn new(capacity: usize, window: Duration) -> Self {
        Self {
            capacity,
            window,
            stamps: VecDeque::new(),
            paused_until: None,
            mirror_active: false,
            mirror_streak: 0,
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.stamps.front() {
            if now.duration_since(*front) >= self.window {
                self.stamps.pop_front();
            } else {
                break;
            }
        }
    }

    /// Admit a direct request iff strictly fewer than `capacity` stamps
    /// are newer than `now − window` and no pause is active.
    pub fn try_admit(&mut self, now: Instant) -> Admission {
        if let Some(left) = self.pause_left(now) {
            return Admission::Paused(left);
        }
        self.prune(now);
        if self.stamps.len() < self.capacity {
            self.stamps.push_back(now);
            Admission::Granted
        } else {
            let oldest = *self.stamps.front().expect("window full implies stamps");
            Admission::WindowFull(oldest + self.window - now)
        }
    }

    /// The CDN said to back off. Starts (or extends) the pause and latches
    /// the mirror; every 429 pauses, so this also covers the
    /// consecutive-429 failover rule.
    pub fn report_429(&mut self, now: Instant, retry_after: Option<u64>) {
        let secs = retry_after
            .unwrap_or(DEFAULT_RETRY_AFTER)
            .clamp(RETRY_CLAMP.0, RETRY_CLAMP.1);
        let until = now + Duration::from_secs(secs);
        if self.paused_until.map_or(true, |p| until > p) {
            self.paused_until = Some(until);
        }
        self.mirror_active = true;
        self.mirror_streak = 0;
    }

    /// Track mirror health for the failback rule.
    pub fn report_mirror(&mut self, ok: bool) {
        if ok {
            self.mirror_streak = self.mirror_streak.saturating_add(1);
        } else {
            self.mirror_streak = 0;
        }
    }

    /// Whether the next request should go through the mirror. Fails back
    /// once the pause elapsed and the last few mirror requests succeeded.
    pub fn prefer_mirror(&mut self, now: Instant) -> bool {
        if !self.mirror_active {
            return false;
        }
        if self.pause_left(now).is_none() && self.mirror_streak >= FAILBACK_STREAK {
            self.mirror_active = false;
            self.mirror_streak = 0;
            return false;
        }
        true
    }

    /// Remaining pause, if one is active
    pub fn pause_left(&self, now: Instant) -> Option<Duration> {
        match self.paused_until {
            Some(until) if until > now => Some(until - now),
            _ => None,
        }
    }

    /// Direct requests admitted in the current window
    pub fn used(&mut self, now: Instant) -> usize {
        self.prune(now);
        self.stamps.len()
    }
}

impl Default for RateBudget {
    fn default() -> Self {
        Self::new(BUDGET_CAPACITY, BUDGET_WINDOW)
    }
}

/// Routing decision handed to a speed worker
enum Decision {
    Direct,
    Mirror,
    Wait(Duration),
}

/// Single writer of the budget; speed workers ask before every request
/// and block until admitted or re-routed.
pub struct Accountant {
    inner: Mutex<RateBudget>,
    events: broadcast::Sender<ScanEvent>,
}

impl Accountant {
    pub fn new(budget: RateBudget, events: broadcast::Sender<ScanEvent>) -> Self {
        Self { inner: Mutex::new(budget), events }
    }

    /// Decide where the next request goes. Blocks (in 1 s steps, so a 429
    /// from another worker can redirect the wait) while the window is
    /// full. Returns `None` when cancelled.
    pub async fn route(&self, cancel: &CancelFlag) -> Option<Via> {
        loop {
            if cancel.is_cancelled() {
                return None;
            }
            let decision = {
                let mut budget = self.inner.lock().await;
                let now = Instant::now();
                if budget.prefer_mirror(now) {
                    Decision::Mirror
                } else {
                    match budget.try_admit(now) {
                        Admission::Granted => Decision::Direct,
                        Admission::Paused(_) => Decision::Mirror,
                        Admission::WindowFull(left) => Decision::Wait(left),
                    }
                }
            };
            match decision {
                Decision::Direct => return Some(Via::Direct),
                Decision::Mirror => return Some(Via::Mirror),
                Decision::Wait(left) => {
                    let _ = self.events.send(ScanEvent::RateLimitPause {
                        seconds_left: left.as_secs().max(1),
                    });
                    tokio::time::sleep(left.min(Duration::from_secs(1))).await;
                }
            }
        }
    }

    /// Report a direct 429.
    pub async fn report_429(&self, retry_after: Option<u64>) {
        let mut budget = self.inner.lock().await;
        budget.report_429(Instant::now(), retry_after);
        let left = budget.pause_left(Instant::now()).unwrap_or_default();
        warn!(
            "🚦 rate limited — pausing direct downloads {}s, mirror {} takes over",
            left.as_secs(),
            MIRROR_HOST
        );
        let _ = self.events.send(ScanEvent::RateLimitPause { seconds_left: left.as_secs() });
        let _ = self.events.send(ScanEvent::MirrorActive { host: MIRROR_HOST.to_string() });
    }

    /// Report a mirror request outcome; emits the failback event when the
    /// direct path reopens.
    pub async fn report_mirror(&self, ok: bool) {
        let mut budget = self.inner.lock().await;
        budget.report_mirror(ok);
        if ok && !budget.prefer_mirror(Instant::now()) {
            info!("✅ direct downloads resumed");
            let _ = self.events.send(ScanEvent::MirrorReleased);
        }
    }

    /// Remaining pause seconds for UI rendering
    pub async fn pause_seconds_left(&self) -> Option<u64> {
        let budget = self.inner.lock().await;
        budget.pause_left(Instant::now()).map(|d| d.as_secs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn admits_up_to_capacity_then_blocks() {
        let mut b = RateBudget::new(550, secs(600));
        let t0 = Instant::now();
        for _ in 0..550 {
            assert_eq!(b.try_admit(t0), Admission::Granted);
        }
        match b.try_admit(t0) {
            Admission::WindowFull(left) => assert_eq!(left, secs(600)),
            other => panic!("expected WindowFull, got {other:?}"),
        }
        // a slot opens exactly when the oldest stamp leaves the window
        assert_eq!(b.try_admit(t0 + secs(600)), Admission::Granted);
    }

    #[test]
    fn no_window_ever_exceeds_capacity() {
        let mut b = RateBudget::new(50, secs(60));
        let t0 = Instant::now();
        let mut granted: Vec<Instant> = Vec::new();
        // hammer one attempt per second for 5 windows
        for s in 0..300u64 {
            let now = t0 + secs(s);
            if b.try_admit(now) == Admission::Granted {
                granted.push(now);
            }
            let in_window = granted
                .iter()
                .filter(|g| now.duration_since(**g) < secs(60))
                .count();
            assert!(in_window <= 50, "window overflow at t+{s}s: {in_window}");
        }
        assert!(!granted.is_empty());
    }

    #[test]
    fn retry_after_is_clamped() {
        let t0 = Instant::now();
        let mut b = RateBudget::default();
        b.report_429(t0, Some(5));
        assert_eq!(b.pause_left(t0), Some(secs(30)));

        let mut b = RateBudget::default();
        b.report_429(t0, Some(3600));
        assert_eq!(b.pause_left(t0), Some(secs(600)));

        let mut b = RateBudget::default();
        b.report_429(t0, None);
        assert_eq!(b.pause_left(t0), Some(secs(60)));
    }

    #[test]
    fn paused_budget_rejects_direct_and_prefers_mirror() {
        let t0 = Instant::now();
        let mut b = RateBudget::default();
        b.report_429(t0, Some(60));
        assert!(matches!(b.try_admit(t0 + secs(1)), Admission::Paused(_)));
        assert!(b.prefer_mirror(t0 + secs(1)));
        // no direct request was issued before the pause elapsed
        assert_eq!(b.used(t0 + secs(30)), 0);
    }

    #[test]
    fn failback_needs_elapsed_pause_and_three_mirror_successes() {
        let t0 = Instant::now();
        let mut b = RateBudget::default();
        b.report_429(t0, Some(60));

        b.report_mirror(true);
        b.report_mirror(true);
        b.report_mirror(true);
        // pause still running: stay on the mirror
        assert!(b.prefer_mirror(t0 + secs(30)));
        // pause over but streak was reset by a failure
        b.report_mirror(false);
        b.report_mirror(true);
        assert!(b.prefer_mirror(t0 + secs(120)));
        // streak rebuilt after the pause: direct reopens
        b.report_mirror(true);
        b.report_mirror(true);
        assert!(!b.prefer_mirror(t0 + secs(120)));
        // and the decision sticks
        assert!(!b.prefer_mirror(t0 + secs(121)));
    }

    #[test]
    fn mirror_requests_do_not_consume_budget() {
        let t0 = Instant::now();
        let mut b = RateBudget::new(2, secs(60));
        assert_eq!(b.try_admit(t0), Admission::Granted);
        for _ in 0..10 {
            b.report_mirror(true);
        }
        assert_eq!(b.try_admit(t0 + secs(1)), Admission::Granted);
        assert_eq!(b.used(t0 + secs(1)), 2);
    }

    #[test]
    fn double_429_within_thirty_seconds_forces_mirror() {
        let t0 = Instant::now();
        let mut b = RateBudget::default();
        b.report_429(t0, Some(30));
        b.report_429(t0 + secs(10), Some(30));
        assert!(b.prefer_mirror(t0 + secs(11)));
    }
}
