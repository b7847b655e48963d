//! Daily time-of-day windows during which jobs may be requested.
//!
//! A window is `HH:MM-HH:MM`; an end earlier than the start wraps past
//! midnight. Several windows are separated by commas.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{NaiveTime, Timelike};

const SECS_PER_DAY: i64 = 24 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl ScheduleWindow {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    /// Start inclusive, end exclusive. Equal bounds cover the whole day.
    pub fn contains(&self, now: NaiveTime) -> bool {
        if self.start == self.end {
            true
        } else if self.start < self.end {
            self.start <= now && now < self.end
        } else {
            now >= self.start || now < self.end
        }
    }

    /// Time from `now` until the next opening of this window.
    pub fn until_start(&self, now: NaiveTime) -> Duration {
        let now = now.with_nanosecond(0).unwrap_or(now);
        let mut secs = self.start.signed_duration_since(now).num_seconds();
        if secs < 0 {
            secs += SECS_PER_DAY;
        }
        Duration::from_secs(secs as u64)
    }
}

impl FromStr for ScheduleWindow {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (start, end) = s
            .trim()
            .split_once('-')
            .ok_or_else(|| format!("window '{}' is not HH:MM-HH:MM", s.trim()))?;
        let parse = |t: &str| {
            NaiveTime::parse_from_str(t.trim(), "%H:%M")
                .map_err(|e| format!("invalid time '{}' in window '{}': {}", t.trim(), s.trim(), e))
        };
        Ok(Self::new(parse(start)?, parse(end)?))
    }
}

impl fmt::Display for ScheduleWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start.format("%H:%M"), self.end.format("%H:%M"))
    }
}

/// Parse a comma separated list of windows. Blank input means no schedule.
pub fn parse_schedule(s: &str) -> Result<Vec<ScheduleWindow>, String> {
    s.split(',')
        .filter(|part| !part.trim().is_empty())
        .map(str::parse)
        .collect()
}

/// How long to wait before the next job request.
///
/// `None` when no windows are configured or `now` falls inside one of them,
/// otherwise the time until the nearest window opens.
pub fn next_request_delay(windows: &[ScheduleWindow], now: NaiveTime) -> Option<Duration> {
    if windows.is_empty() || windows.iter().any(|w| w.contains(now)) {
        return None;
    }
    windows.iter().map(|w| w.until_start(now)).min()
}
