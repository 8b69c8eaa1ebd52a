use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, FixedOffset, Local};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::config::QuotaLimits;

const MINUTE_MS: i64 = 60_000;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<FixedOffset>;
}

/// Wall clock in the local timezone, so day windows roll at local midnight.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<FixedOffset> {
        Local::now().fixed_offset()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowScope {
    Minute,
    Day,
}

/// Fixed counting window. Counters only ever reset to zero at a boundary;
/// `window_start` only moves forward.
#[derive(Debug, Clone, Copy)]
pub struct UsageWindow {
    pub scope: WindowScope,
    pub request_count: u64,
    pub token_count: u64,
    pub window_start: DateTime<FixedOffset>,
}

impl UsageWindow {
    fn new(scope: WindowScope, now: DateTime<FixedOffset>) -> Self {
        let window_start = match scope {
            WindowScope::Minute => now,
            WindowScope::Day => start_of_day(now),
        };
        Self {
            scope,
            request_count: 0,
            token_count: 0,
            window_start,
        }
    }

    fn expired(&self, now: DateTime<FixedOffset>) -> bool {
        match self.scope {
            WindowScope::Minute => (now - self.window_start).num_milliseconds() >= MINUTE_MS,
            WindowScope::Day => now.date_naive() > self.window_start.date_naive(),
        }
    }

    fn roll(&mut self, now: DateTime<FixedOffset>) {
        if !self.expired(now) {
            return;
        }
        debug!(scope = ?self.scope, requests = self.request_count, tokens = self.token_count, "usage window rolled over");
        *self = Self::new(self.scope, now);
    }

    fn add(&mut self, tokens: u64) {
        self.request_count = self.request_count.saturating_add(1);
        self.token_count = self.token_count.saturating_add(tokens);
    }

    fn usage(&self, limit_requests: u64, limit_tokens: u64) -> ScopeUsage {
        ScopeUsage::new(
            self.request_count,
            limit_requests,
            self.token_count,
            limit_tokens,
        )
    }
}

fn start_of_day(now: DateTime<FixedOffset>) -> DateTime<FixedOffset> {
    now.date_naive()
        .and_hms_opt(0, 0, 0)
        .and_then(|midnight| midnight.and_local_timezone(*now.offset()).single())
        .unwrap_or(now)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScopeUsage {
    pub used_requests: u64,
    pub limit_requests: u64,
    pub remaining_requests: u64,
    pub used_tokens: u64,
    pub limit_tokens: u64,
    pub remaining_tokens: u64,
}

impl ScopeUsage {
    fn new(used_requests: u64, limit_requests: u64, used_tokens: u64, limit_tokens: u64) -> Self {
        Self {
            used_requests,
            limit_requests,
            remaining_requests: limit_requests.saturating_sub(used_requests),
            used_tokens,
            limit_tokens,
            remaining_tokens: limit_tokens.saturating_sub(used_tokens),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UsageReport {
    pub minute: ScopeUsage,
    pub day: ScopeUsage,
}

impl fmt::Display for UsageReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rows = [
            ("Requests this minute", self.minute.used_requests, self.minute.limit_requests, self.minute.remaining_requests),
            ("Tokens this minute", self.minute.used_tokens, self.minute.limit_tokens, self.minute.remaining_tokens),
            ("Requests today", self.day.used_requests, self.day.limit_requests, self.day.remaining_requests),
            ("Tokens today", self.day.used_tokens, self.day.limit_tokens, self.day.remaining_tokens),
        ];
        for (idx, (label, used, limit, remaining)) in rows.iter().enumerate() {
            if idx > 0 {
                writeln!(f)?;
            }
            write!(f, "{label}: {used}/{limit} ({remaining} remaining)")?;
        }
        Ok(())
    }
}

struct Windows {
    minute: UsageWindow,
    day: UsageWindow,
}

/// Process-wide request/token accounting over a minute window and a
/// calendar-day window. Purely observational: recording never refuses a
/// call, it only reports what is left.
pub struct UsageTracker {
    limits: QuotaLimits,
    clock: Arc<dyn Clock>,
    windows: Mutex<Windows>,
}

impl UsageTracker {
    pub fn new(limits: QuotaLimits) -> Self {
        Self::with_clock(limits, Arc::new(SystemClock))
    }

    pub fn with_clock(limits: QuotaLimits, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            limits,
            clock,
            windows: Mutex::new(Windows {
                minute: UsageWindow::new(WindowScope::Minute, now),
                day: UsageWindow::new(WindowScope::Day, now),
            }),
        }
    }

    pub fn limits(&self) -> QuotaLimits {
        self.limits
    }

    /// Counts one request of `estimated_tokens` and returns the updated
    /// report. Rollover happens first so a call that crosses a boundary
    /// lands in the new window.
    pub fn record(&self, estimated_tokens: u64) -> UsageReport {
        let mut windows = self.windows.lock();
        let now = self.clock.now();
        windows.minute.roll(now);
        windows.day.roll(now);
        windows.minute.add(estimated_tokens);
        windows.day.add(estimated_tokens);
        self.report(windows.minute, windows.day)
    }

    /// Current report without counting anything. Expired windows read as
    /// empty but are left for the next `record` to reset.
    pub fn snapshot(&self) -> UsageReport {
        let windows = self.windows.lock();
        let now = self.clock.now();
        let mut minute = windows.minute;
        let mut day = windows.day;
        minute.roll(now);
        day.roll(now);
        self.report(minute, day)
    }

    pub fn windows(&self) -> (UsageWindow, UsageWindow) {
        let windows = self.windows.lock();
        (windows.minute, windows.day)
    }

    fn report(&self, minute: UsageWindow, day: UsageWindow) -> UsageReport {
        UsageReport {
            minute: minute.usage(self.limits.requests_per_minute, self.limits.tokens_per_minute),
            day: day.usage(self.limits.requests_per_day, self.limits.tokens_per_day),
        }
    }
}
