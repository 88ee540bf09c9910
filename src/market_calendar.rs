use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, NaiveTime, Utc, Weekday};
use once_cell::sync::Lazy;
use std::collections::BTreeSet;

use crate::config::MarketHoursConfig;

/// All outward-facing timestamps use Indian Standard Time.
pub const IST_OFFSET_SECS: i32 = 5 * 3600 + 30 * 60;

static IST: Lazy<FixedOffset> =
    Lazy::new(|| FixedOffset::east_opt(IST_OFFSET_SECS).expect("IST offset is valid"));

pub fn ist_offset() -> FixedOffset {
    *IST
}

pub fn ist_now() -> DateTime<FixedOffset> {
    Utc::now().with_timezone(&ist_offset())
}

pub fn to_ist(ts: DateTime<Utc>) -> DateTime<FixedOffset> {
    ts.with_timezone(&ist_offset())
}

/// RFC3339 IST timestamp used in panel envelopes and events.
pub fn ist_rfc3339(ts: DateTime<Utc>) -> String {
    to_ist(ts).to_rfc3339()
}

/// Trading-session gate: weekends and configured holidays are closed,
/// otherwise open within the configured IST session window.
#[derive(Debug, Clone)]
pub struct MarketCalendar {
    open: NaiveTime,
    close: NaiveTime,
    holidays: BTreeSet<NaiveDate>,
    force_open: bool,
}

impl MarketCalendar {
    pub fn new(cfg: &MarketHoursConfig) -> Self {
        Self {
            open: cfg.open_time(),
            close: cfg.close_time(),
            holidays: cfg.holidays.iter().copied().collect(),
            force_open: cfg.force_open,
        }
    }

    pub fn is_holiday(&self, date: NaiveDate) -> bool {
        self.holidays.contains(&date)
    }

    pub fn is_trading_day(&self, date: NaiveDate) -> bool {
        !matches!(date.weekday(), Weekday::Sat | Weekday::Sun) && !self.is_holiday(date)
    }

    /// Nearest trading day at or before `date`.
    pub fn roll_back(&self, mut date: NaiveDate) -> NaiveDate {
        while !self.is_trading_day(date) {
            date = date.pred_opt().unwrap_or(date);
        }
        date
    }

    pub fn is_open_at(&self, ts: DateTime<Utc>) -> bool {
        if self.force_open {
            return true;
        }
        let ist = to_ist(ts);
        let date = ist.date_naive();
        if !self.is_trading_day(date) {
            return false;
        }
        let t = ist.time();
        t >= self.open && t <= self.close
    }

    pub fn is_open_now(&self) -> bool {
        self.is_open_at(Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn calendar_with(holidays: Vec<NaiveDate>, force_open: bool) -> MarketCalendar {
        MarketCalendar::new(&MarketHoursConfig {
            open: "09:15".to_string(),
            close: "15:30".to_string(),
            force_open,
            holidays,
        })
    }

    fn utc_for_ist(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        ist_offset()
            .with_ymd_and_hms(y, m, d, h, min, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn open_during_session() {
        let cal = calendar_with(vec![], false);
        // 2025-07-01 is a Tuesday.
        assert!(cal.is_open_at(utc_for_ist(2025, 7, 1, 10, 0)));
        assert!(!cal.is_open_at(utc_for_ist(2025, 7, 1, 8, 0)));
        assert!(!cal.is_open_at(utc_for_ist(2025, 7, 1, 16, 0)));
    }

    #[test]
    fn weekend_closed() {
        let cal = calendar_with(vec![], false);
        // 2025-07-05 is a Saturday.
        assert!(!cal.is_open_at(utc_for_ist(2025, 7, 5, 10, 0)));
    }

    #[test]
    fn holiday_closed_unless_forced() {
        let holiday = NaiveDate::from_ymd_opt(2025, 7, 1).unwrap();
        let cal = calendar_with(vec![holiday], false);
        assert!(!cal.is_open_at(utc_for_ist(2025, 7, 1, 10, 0)));
        let forced = calendar_with(vec![holiday], true);
        assert!(forced.is_open_at(utc_for_ist(2025, 7, 1, 10, 0)));
    }

    #[test]
    fn roll_back_skips_weekend_and_holiday() {
        let holiday = NaiveDate::from_ymd_opt(2025, 7, 4).unwrap(); // Friday
        let cal = calendar_with(vec![holiday], false);
        // Sunday 2025-07-06 rolls back over Sat and the Friday holiday.
        let sunday = NaiveDate::from_ymd_opt(2025, 7, 6).unwrap();
        assert_eq!(
            cal.roll_back(sunday),
            NaiveDate::from_ymd_opt(2025, 7, 3).unwrap()
        );
    }
}
