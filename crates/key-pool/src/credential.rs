//! Per-key quota state and admission
//!
//! Each credential tracks two horizons independently of every other key in
//! the pool:
//! - a sliding 60-second window of granted-use timestamps (rpm ceiling)
//! - a counter of uses granted on the current calendar day (rpd ceiling)
//!
//! The first touch on a new calendar day resets both: the daily counter and
//! the minute window. Nothing runs in the background; rollover and window
//! eviction happen lazily whenever the credential is inspected.
//!
//! All state sits behind one mutex per credential. `try_acquire` evaluates
//! the classification and records the use inside the same critical section,
//! so concurrent callers can never both observe the last free slot.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, FixedOffset, NaiveDate, TimeDelta};
use common::Secret;
use tracing::info;

use crate::clock::Clock;

/// Length of the sliding rate window, in seconds.
pub const WINDOW_SECS: i64 = 60;

/// Admission classification of a single credential.
///
/// Transitions:
/// - Available → RateThrottled (window full)
/// - Available → DailyExhausted (daily ceiling reached)
/// - RateThrottled → Available (oldest window entry ages out)
/// - RateThrottled → DailyExhausted (last daily slot used)
/// - DailyExhausted → Available (calendar day rolls over)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialStatus {
    Available,
    RateThrottled,
    DailyExhausted,
}

impl CredentialStatus {
    /// Status label for health/logging.
    pub fn label(&self) -> &'static str {
        match self {
            CredentialStatus::Available => "available",
            CredentialStatus::RateThrottled => "rate_throttled",
            CredentialStatus::DailyExhausted => "daily_exhausted",
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, CredentialStatus::Available)
    }
}

/// Static description of one upstream key, as supplied at startup.
#[derive(Debug, Clone)]
pub struct CredentialConfig {
    pub identity: Secret<String>,
    pub label: String,
    pub rpm_limit: u32,
    pub rpd_limit: u32,
}

impl CredentialConfig {
    pub fn new(
        identity: impl Into<String>,
        label: impl Into<String>,
        rpm_limit: u32,
        rpd_limit: u32,
    ) -> Self {
        Self {
            identity: Secret::new(identity.into()),
            label: label.into(),
            rpm_limit,
            rpd_limit,
        }
    }
}

/// Point-in-time view of a credential's usage. Carries no secret material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialSnapshot {
    pub label: String,
    pub fingerprint: String,
    pub status: CredentialStatus,
    pub used_this_minute: u32,
    pub used_today: u32,
    pub rpm_limit: u32,
    pub rpd_limit: u32,
}

#[derive(Debug)]
struct Usage {
    /// Granted-use timestamps, oldest first.
    window: VecDeque<DateTime<FixedOffset>>,
    daily_count: u32,
    day_anchor: NaiveDate,
}

impl Usage {
    /// Apply day rollover and evict aged window entries. Returns true when
    /// the day rolled over.
    fn refresh(&mut self, now: DateTime<FixedOffset>) -> bool {
        let window = TimeDelta::seconds(WINDOW_SECS);
        let today = now.date_naive();
        let rolled = today != self.day_anchor;
        if rolled {
            self.daily_count = 0;
            self.window.clear();
            self.day_anchor = today;
        }

        while let Some(&oldest) = self.window.front() {
            if now - oldest >= window {
                self.window.pop_front();
            } else {
                break;
            }
        }
        rolled
    }

    fn classify(&self, rpm_limit: u32, rpd_limit: u32) -> CredentialStatus {
        if self.daily_count >= rpd_limit {
            CredentialStatus::DailyExhausted
        } else if self.window.len() >= rpm_limit as usize {
            CredentialStatus::RateThrottled
        } else {
            CredentialStatus::Available
        }
    }

    fn record(&mut self, now: DateTime<FixedOffset>) {
        // Keep the window sorted even if the wall clock steps backwards.
        let stamp = match self.window.back() {
            Some(&last) if last > now => last,
            _ => now,
        };
        self.window.push_back(stamp);
        self.daily_count += 1;
    }
}

/// One upstream key plus its quota-tracking state.
#[derive(Debug)]
pub struct Credential {
    identity: Secret<String>,
    label: String,
    fingerprint: String,
    rpm_limit: u32,
    rpd_limit: u32,
    usage: Mutex<Usage>,
}

impl Credential {
    /// Build a credential whose daily counter is anchored to `today`.
    ///
    /// Limits are taken as given; `Pool::new` is responsible for rejecting
    /// zero limits.
    pub fn new(config: CredentialConfig, today: NaiveDate) -> Self {
        let fingerprint = config.identity.fingerprint();
        Self {
            identity: config.identity,
            label: config.label,
            fingerprint,
            rpm_limit: config.rpm_limit,
            rpd_limit: config.rpd_limit,
            usage: Mutex::new(Usage {
                window: VecDeque::with_capacity(config.rpm_limit as usize),
                daily_count: 0,
                day_anchor: today,
            }),
        }
    }

    pub fn identity(&self) -> &Secret<String> {
        &self.identity
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn rpm_limit(&self) -> u32 {
        self.rpm_limit
    }

    pub fn rpd_limit(&self) -> u32 {
        self.rpd_limit
    }

    /// Classify the credential as of now, without recording a use.
    pub fn status(&self, clock: &dyn Clock) -> CredentialStatus {
        let mut usage = self.lock();
        self.refresh(&mut usage, clock.now());
        usage.classify(self.rpm_limit, self.rpd_limit)
    }

    /// Admit one use if both ceilings allow it.
    ///
    /// Returns `Available` when the use was recorded, otherwise the blocking
    /// classification with the usage state untouched.
    pub fn try_acquire(&self, clock: &dyn Clock) -> CredentialStatus {
        let mut usage = self.lock();
        let now = clock.now();
        self.refresh(&mut usage, now);
        let status = usage.classify(self.rpm_limit, self.rpd_limit);
        if status.is_available() {
            usage.record(now);
        }
        status
    }

    pub fn snapshot(&self, clock: &dyn Clock) -> CredentialSnapshot {
        let mut usage = self.lock();
        self.refresh(&mut usage, clock.now());
        CredentialSnapshot {
            label: self.label.clone(),
            fingerprint: self.fingerprint.clone(),
            status: usage.classify(self.rpm_limit, self.rpd_limit),
            used_this_minute: usage.window.len() as u32,
            used_today: usage.daily_count,
            rpm_limit: self.rpm_limit,
            rpd_limit: self.rpd_limit,
        }
    }

    fn refresh(&self, usage: &mut Usage, now: DateTime<FixedOffset>) {
        let previous_day = usage.day_anchor;
        if usage.refresh(now) {
            info!(
                label = %self.label,
                fingerprint = %self.fingerprint,
                previous_day = %previous_day,
                "new calendar day, daily count and rate window reset"
            );
        }
    }

    /// Usage is consistent between statements, so a panic elsewhere while
    /// holding the lock leaves nothing to repair.
    fn lock(&self) -> MutexGuard<'_, Usage> {
        self.usage.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn clock_at(ts: &str) -> ManualClock {
        ManualClock::new(DateTime::parse_from_rfc3339(ts).unwrap())
    }

    fn credential(clock: &ManualClock, rpm: u32, rpd: u32) -> Credential {
        Credential::new(
            CredentialConfig::new("AIza-test", "gemini-2.0-flash-lite", rpm, rpd),
            clock.now().date_naive(),
        )
    }

    #[test]
    fn fresh_credential_is_available() {
        let clock = clock_at("2026-03-10T12:00:00+00:00");
        let cred = credential(&clock, 2, 10);
        assert_eq!(cred.status(&clock), CredentialStatus::Available);
        assert_eq!(cred.snapshot(&clock).used_today, 0);
    }

    #[test]
    fn status_does_not_record_use() {
        let clock = clock_at("2026-03-10T12:00:00+00:00");
        let cred = credential(&clock, 1, 10);
        for _ in 0..5 {
            assert_eq!(cred.status(&clock), CredentialStatus::Available);
        }
        assert_eq!(cred.try_acquire(&clock), CredentialStatus::Available);
    }

    #[test]
    fn full_window_throttles() {
        let clock = clock_at("2026-03-10T12:00:00+00:00");
        let cred = credential(&clock, 2, 100);

        assert_eq!(cred.try_acquire(&clock), CredentialStatus::Available);
        assert_eq!(cred.try_acquire(&clock), CredentialStatus::Available);
        assert_eq!(cred.try_acquire(&clock), CredentialStatus::RateThrottled);
        assert_eq!(cred.status(&clock), CredentialStatus::RateThrottled);

        let snap = cred.snapshot(&clock);
        assert_eq!(snap.used_this_minute, 2);
        assert_eq!(snap.used_today, 2, "blocked attempt must not count");
    }

    #[test]
    fn window_entry_ages_out_at_sixty_seconds() {
        let clock = clock_at("2026-03-10T12:00:00+00:00");
        let cred = credential(&clock, 1, 100);
        assert_eq!(cred.try_acquire(&clock), CredentialStatus::Available);

        clock.advance(TimeDelta::seconds(59));
        assert_eq!(cred.status(&clock), CredentialStatus::RateThrottled);

        clock.advance(TimeDelta::seconds(1));
        assert_eq!(cred.status(&clock), CredentialStatus::Available);
        assert_eq!(cred.snapshot(&clock).used_this_minute, 0);
    }

    #[test]
    fn eviction_trims_only_aged_prefix() {
        let clock = clock_at("2026-03-10T12:00:00+00:00");
        let cred = credential(&clock, 3, 100);
        cred.try_acquire(&clock);
        clock.advance(TimeDelta::seconds(20));
        cred.try_acquire(&clock);
        clock.advance(TimeDelta::seconds(20));
        cred.try_acquire(&clock);
        assert_eq!(cred.status(&clock), CredentialStatus::RateThrottled);

        // first entry is now 60s old, the others 40s and 20s
        clock.advance(TimeDelta::seconds(20));
        let snap = cred.snapshot(&clock);
        assert_eq!(snap.used_this_minute, 2);
        assert_eq!(snap.status, CredentialStatus::Available);
    }

    #[test]
    fn daily_ceiling_exhausts() {
        let clock = clock_at("2026-03-10T08:00:00+00:00");
        let cred = credential(&clock, 100, 3);
        for _ in 0..3 {
            assert_eq!(cred.try_acquire(&clock), CredentialStatus::Available);
        }
        assert_eq!(cred.try_acquire(&clock), CredentialStatus::DailyExhausted);

        // window aging does not help a daily-exhausted key
        clock.advance(TimeDelta::hours(2));
        assert_eq!(cred.status(&clock), CredentialStatus::DailyExhausted);
        assert_eq!(cred.snapshot(&clock).used_today, 3);
    }

    #[test]
    fn daily_exhaustion_takes_precedence_over_throttle() {
        let clock = clock_at("2026-03-10T08:00:00+00:00");
        let cred = credential(&clock, 2, 2);
        cred.try_acquire(&clock);
        cred.try_acquire(&clock);
        assert_eq!(cred.status(&clock), CredentialStatus::DailyExhausted);
    }

    #[test]
    fn day_rollover_restores_exhausted_credential() {
        let clock = clock_at("2026-03-10T22:00:00+00:00");
        let cred = credential(&clock, 10, 2);
        cred.try_acquire(&clock);
        cred.try_acquire(&clock);
        assert_eq!(cred.status(&clock), CredentialStatus::DailyExhausted);

        clock.set(DateTime::parse_from_rfc3339("2026-03-11T00:00:01+00:00").unwrap());
        assert_eq!(cred.try_acquire(&clock), CredentialStatus::Available);
        assert_eq!(cred.snapshot(&clock).used_today, 1);
    }

    #[test]
    fn day_rollover_also_clears_rate_window() {
        let clock = clock_at("2026-03-10T23:59:50+00:00");
        let cred = credential(&clock, 1, 10);
        assert_eq!(cred.try_acquire(&clock), CredentialStatus::Available);

        clock.advance(TimeDelta::seconds(5));
        assert_eq!(cred.status(&clock), CredentialStatus::RateThrottled);

        // 11 seconds after the last use, but on a new day
        clock.advance(TimeDelta::seconds(6));
        assert_eq!(cred.status(&clock), CredentialStatus::Available);
        assert_eq!(cred.snapshot(&clock).used_this_minute, 0);
    }

    #[test]
    fn backwards_clock_step_keeps_window_sorted() {
        let clock = clock_at("2026-03-10T12:00:00+00:00");
        let cred = credential(&clock, 2, 10);
        cred.try_acquire(&clock);
        clock.advance(TimeDelta::seconds(-30));
        cred.try_acquire(&clock);

        // both entries are stamped 12:00:00 and age out together
        clock.set(DateTime::parse_from_rfc3339("2026-03-10T12:01:00+00:00").unwrap());
        assert_eq!(cred.snapshot(&clock).used_this_minute, 0);
    }

    #[test]
    fn window_and_daily_bounds_hold_over_long_sequence() {
        let clock = clock_at("2026-03-10T06:00:00+00:00");
        let cred = credential(&clock, 4, 50);
        for i in 0..400u32 {
            cred.try_acquire(&clock);
            let snap = cred.snapshot(&clock);
            assert!(snap.used_this_minute <= 4, "step {i}: {snap:?}");
            assert!(snap.used_today <= 50, "step {i}: {snap:?}");
            clock.advance(TimeDelta::seconds(((i * 7) % 13) as i64));
        }
    }

    #[test]
    fn snapshot_never_exposes_identity() {
        let clock = clock_at("2026-03-10T12:00:00+00:00");
        let cred = credential(&clock, 1, 1);
        let rendered = format!("{:?} {:?}", cred, cred.snapshot(&clock));
        assert!(!rendered.contains("AIza-test"), "leaked: {rendered}");
        assert_eq!(cred.fingerprint().len(), 8);
    }

    #[test]
    fn status_labels() {
        assert_eq!(CredentialStatus::Available.label(), "available");
        assert_eq!(CredentialStatus::RateThrottled.label(), "rate_throttled");
        assert_eq!(CredentialStatus::DailyExhausted.label(), "daily_exhausted");
    }
}
