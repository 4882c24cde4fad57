use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;

use crate::domain::errors::ConfigError;

/// Exchange session calendar: time zone plus regular open/close times.
///
/// All session math happens in the configured exchange zone; the broker
/// clock remains authoritative for "is the market open right now".
#[derive(Debug, Clone)]
pub struct TradingSession {
    tz: Tz,
    open: NaiveTime,
    close: NaiveTime,
}

impl TradingSession {
    pub fn new(time_zone: &str, open: &str, close: &str) -> Result<Self, ConfigError> {
        let tz: Tz = time_zone.parse().map_err(|_| ConfigError::Invalid {
            field: "session.time_zone".to_string(),
            reason: format!("unknown time zone {}", time_zone),
        })?;
        let open = parse_time(open, "session.market_open_time")?;
        let close = parse_time(close, "session.market_close_time")?;
        if open >= close {
            return Err(ConfigError::Invalid {
                field: "session.market_open_time".to_string(),
                reason: "open must precede close".to_string(),
            });
        }
        Ok(Self { tz, open, close })
    }

    pub fn local(&self, now: DateTime<Utc>) -> DateTime<Tz> {
        now.with_timezone(&self.tz)
    }

    pub fn local_date(&self, now: DateTime<Utc>) -> NaiveDate {
        self.local(now).date_naive()
    }

    pub fn is_weekday(&self, now: DateTime<Utc>) -> bool {
        !matches!(self.local(now).weekday(), Weekday::Sat | Weekday::Sun)
    }

    /// Minutes since today's open; negative before the open.
    pub fn minutes_after_open(&self, now: DateTime<Utc>) -> i64 {
        let local = self.local(now);
        let open = self.anchor(local.date_naive(), self.open);
        (local.with_timezone(&Utc) - open).num_minutes()
    }

    /// Minutes until today's close; negative after the close.
    pub fn minutes_before_close(&self, now: DateTime<Utc>) -> i64 {
        let local = self.local(now);
        let close = self.anchor(local.date_naive(), self.close);
        (close - local.with_timezone(&Utc)).num_minutes()
    }

    /// True once the local clock has passed the daily-reset anchor (the
    /// session open) on a weekday.
    pub fn past_open_today(&self, now: DateTime<Utc>) -> bool {
        self.is_weekday(now) && self.minutes_after_open(now) >= 0
    }

    fn anchor(&self, date: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
        // DST gaps resolve to the earliest valid instant.
        match self.tz.from_local_datetime(&date.and_time(time)) {
            chrono::LocalResult::Single(dt) => dt.with_timezone(&Utc),
            chrono::LocalResult::Ambiguous(dt, _) => dt.with_timezone(&Utc),
            chrono::LocalResult::None => {
                let shifted = date.and_time(time) + chrono::Duration::hours(1);
                self.tz
                    .from_local_datetime(&shifted)
                    .earliest()
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or_else(|| date.and_time(time).and_utc())
            }
        }
    }
}

fn parse_time(s: &str, field: &str) -> Result<NaiveTime, ConfigError> {
    NaiveTime::parse_from_str(s, "%H:%M").map_err(|_| ConfigError::Invalid {
        field: field.to_string(),
        reason: format!("expected HH:MM, got {}", s),
    })
}
