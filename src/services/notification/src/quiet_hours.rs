//! Quiet-hours gate
//!
//! Windows are wall-clock `HH:MM` pairs evaluated in the user's timezone.
//! When `start > end` the window wraps past midnight.

use crate::error::{NotificationError, Result};
use chrono::{DateTime, Duration, LocalResult, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use notification_shared::{NotificationPreferences, QuietHours};

const TIME_FORMAT: &str = "%H:%M";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuietWindow {
    start: NaiveTime,
    end: NaiveTime,
}

impl QuietWindow {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    pub fn parse(hours: &QuietHours) -> Result<Self> {
        let start = parse_time("quiet_hours.start", &hours.start)?;
        let end = parse_time("quiet_hours.end", &hours.end)?;
        Ok(Self { start, end })
    }

    pub fn start(&self) -> NaiveTime {
        self.start
    }

    pub fn end(&self) -> NaiveTime {
        self.end
    }

    /// Whether a local time-of-day falls inside the window.
    pub fn contains(&self, time: NaiveTime) -> bool {
        if self.start <= self.end {
            self.start <= time && time < self.end
        } else {
            time >= self.start || time < self.end
        }
    }

    pub fn is_quiet(&self, now: DateTime<Utc>, tz: Tz) -> bool {
        self.contains(now.with_timezone(&tz).time())
    }

    /// The first occurrence of the window's end strictly after `now`.
    pub fn next_eligible(&self, now: DateTime<Utc>, tz: Tz) -> DateTime<Utc> {
        let today = now.with_timezone(&tz).date_naive();

        for offset in 0..=2 {
            let Some(date) = today.checked_add_signed(Duration::days(offset)) else {
                break;
            };
            if let Some(candidate) = local_instant(tz, date, self.end) {
                if candidate > now {
                    return candidate;
                }
            }
        }

        now + Duration::days(1)
    }
}

fn parse_time(field: &str, value: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(value.trim(), TIME_FORMAT).map_err(|_| {
        NotificationError::validation(field, format!("expected HH:MM, got '{}'", value))
    })
}

/// Resolve a wall-clock time on `date` to an instant. Ambiguous times take
/// the earlier instant; times skipped by a DST jump move forward an hour.
fn local_instant(tz: Tz, date: NaiveDate, time: NaiveTime) -> Option<DateTime<Utc>> {
    let naive = date.and_time(time);
    let resolved = match tz.from_local_datetime(&naive) {
        LocalResult::Single(t) => Some(t),
        LocalResult::Ambiguous(earliest, _) => Some(earliest),
        LocalResult::None => tz
            .from_local_datetime(&(naive + Duration::hours(1)))
            .earliest(),
    };
    resolved.map(|t| t.with_timezone(&Utc))
}

/// Outcome of a quiet-hours check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuietDecision {
    Open,
    Deferred { until: DateTime<Utc> },
}

/// Resolves a user's window and zone, falling back to the engine default zone.
#[derive(Debug, Clone, Copy)]
pub struct QuietHoursGate {
    default_tz: Tz,
}

impl QuietHoursGate {
    pub fn new(default_tz: Tz) -> Self {
        Self { default_tz }
    }

    pub fn timezone_for(&self, prefs: &NotificationPreferences) -> Result<Tz> {
        match prefs.timezone.as_deref() {
            Some(name) => name.parse::<Tz>().map_err(|_| {
                NotificationError::validation("timezone", format!("unknown timezone '{}'", name))
            }),
            None => Ok(self.default_tz),
        }
    }

    pub fn check(&self, prefs: &NotificationPreferences, now: DateTime<Utc>) -> Result<QuietDecision> {
        let Some(ref hours) = prefs.quiet_hours else {
            return Ok(QuietDecision::Open);
        };

        let window = QuietWindow::parse(hours)?;
        let tz = self.timezone_for(prefs)?;

        if window.is_quiet(now, tz) {
            Ok(QuietDecision::Deferred {
                until: window.next_eligible(now, tz),
            })
        } else {
            Ok(QuietDecision::Open)
        }
    }
}

impl Default for QuietHoursGate {
    fn default() -> Self {
        Self::new(chrono_tz::UTC)
    }
}
