use chrono::{Datelike, Days, NaiveDate, Weekday};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::{ExpiryTag, IndexConfig};
use crate::market_calendar::MarketCalendar;

/// Resolves logical expiry tags to concrete calendar dates using the
/// index's weekday anchor and the holiday calendar. When an index carries
/// an `allowed_expiry_dates` whitelist, resolution falls back forward then
/// backward to the nearest allowed date.
pub struct ExpiryResolver {
    calendar: Arc<MarketCalendar>,
    /// Search radius (days) for the allowed-date fallback.
    fallback_days: u64,
}

#[derive(Debug, Clone)]
pub struct ExpiryResolution {
    pub resolved: BTreeMap<ExpiryTag, NaiveDate>,
    pub unresolved: Vec<ExpiryTag>,
}

impl ExpiryResolver {
    pub fn new(calendar: Arc<MarketCalendar>) -> Self {
        Self {
            calendar,
            fallback_days: 10,
        }
    }

    pub fn resolve_all(&self, index: &IndexConfig, today: NaiveDate) -> ExpiryResolution {
        let mut resolved = BTreeMap::new();
        let mut unresolved = Vec::new();
        for tag in &index.expiry_tags {
            match self.resolve(index, *tag, today) {
                Some(date) => {
                    resolved.insert(*tag, date);
                }
                None => {
                    warn!("unresolved expiry tag {} for {}", tag.as_str(), index.symbol);
                    unresolved.push(*tag);
                }
            }
        }
        ExpiryResolution { resolved, unresolved }
    }

    pub fn resolve(&self, index: &IndexConfig, tag: ExpiryTag, today: NaiveDate) -> Option<NaiveDate> {
        let anchor = index.anchor_weekday();
        let candidate = match tag {
            ExpiryTag::ThisWeek => self.weekly(anchor, today, 0),
            ExpiryTag::NextWeek => self.weekly(anchor, today, 1),
            ExpiryTag::ThisMonth => self.monthly(anchor, today, 0),
            ExpiryTag::NextMonth => self.monthly(anchor, today, 1),
        }?;
        self.apply_allowed_filter(index, candidate)
    }

    /// Next anchor-weekday expiry, `weeks_ahead` weeks out, rolled back
    /// over holidays. A roll-back landing before `today` pushes to the
    /// following week.
    fn weekly(&self, anchor: Weekday, today: NaiveDate, weeks_ahead: u64) -> Option<NaiveDate> {
        let days_until =
            (anchor.num_days_from_monday() + 7 - today.weekday().num_days_from_monday()) % 7;
        let mut candidate = today.checked_add_days(Days::new(days_until as u64 + weeks_ahead * 7))?;
        let mut expiry = self.calendar.roll_back(candidate);
        if expiry < today {
            candidate = candidate.checked_add_days(Days::new(7))?;
            expiry = self.calendar.roll_back(candidate);
        }
        Some(expiry)
    }

    /// Last anchor-weekday of the target month, rolled back over holidays.
    /// A this-month expiry already in the past rolls to the next month.
    fn monthly(&self, anchor: Weekday, today: NaiveDate, months_ahead: u32) -> Option<NaiveDate> {
        let mut month_offset = months_ahead;
        loop {
            let candidate = last_weekday_of_month(
                today.year(),
                today.month(),
                month_offset,
                anchor,
            )?;
            let expiry = self.calendar.roll_back(candidate);
            if expiry >= today {
                return Some(expiry);
            }
            // this_month already expired; slide one month forward once.
            if month_offset > months_ahead {
                return None;
            }
            month_offset += 1;
        }
    }

    fn apply_allowed_filter(&self, index: &IndexConfig, candidate: NaiveDate) -> Option<NaiveDate> {
        let Some(allowed) = &index.allowed_expiry_dates else {
            return Some(candidate);
        };
        if allowed.contains(&candidate) {
            return Some(candidate);
        }
        // Forward fallback first, then backward, nearest wins.
        for offset in 1..=self.fallback_days {
            let fwd = candidate.checked_add_days(Days::new(offset));
            if let Some(d) = fwd {
                if allowed.contains(&d) {
                    debug!("expiry {} adjusted forward to allowed {}", candidate, d);
                    return Some(d);
                }
            }
            let back = candidate.checked_sub_days(Days::new(offset));
            if let Some(d) = back {
                if allowed.contains(&d) {
                    debug!("expiry {} adjusted backward to allowed {}", candidate, d);
                    return Some(d);
                }
            }
        }
        None
    }
}

fn last_weekday_of_month(
    year: i32,
    month: u32,
    months_ahead: u32,
    anchor: Weekday,
) -> Option<NaiveDate> {
    let total = year as i64 * 12 + (month as i64 - 1) + months_ahead as i64;
    let (ty, tm) = ((total / 12) as i32, (total % 12 + 1) as u32);
    let first_next = if tm == 12 {
        NaiveDate::from_ymd_opt(ty + 1, 1, 1)?
    } else {
        NaiveDate::from_ymd_opt(ty, tm + 1, 1)?
    };
    let mut d = first_next.pred_opt()?;
    while d.weekday() != anchor {
        d = d.pred_opt()?;
    }
    Some(d)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MarketHoursConfig;

    fn resolver(holidays: Vec<NaiveDate>) -> ExpiryResolver {
        let calendar = Arc::new(MarketCalendar::new(&MarketHoursConfig {
            holidays,
            ..MarketHoursConfig::default()
        }));
        ExpiryResolver::new(calendar)
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn this_week_lands_on_anchor() {
        let r = resolver(vec![]);
        let idx = IndexConfig::new("NIFTY", 50.0, 2, 2); // Thursday anchor
        // Monday 2025-07-07 -> Thursday 2025-07-10.
        assert_eq!(
            r.resolve(&idx, ExpiryTag::ThisWeek, date(2025, 7, 7)),
            Some(date(2025, 7, 10))
        );
        // On the anchor itself, expiry is today.
        assert_eq!(
            r.resolve(&idx, ExpiryTag::ThisWeek, date(2025, 7, 10)),
            Some(date(2025, 7, 10))
        );
    }

    #[test]
    fn holiday_rolls_expiry_back_a_day() {
        let r = resolver(vec![date(2025, 7, 10)]); // Thursday holiday
        let idx = IndexConfig::new("NIFTY", 50.0, 2, 2);
        assert_eq!(
            r.resolve(&idx, ExpiryTag::ThisWeek, date(2025, 7, 7)),
            Some(date(2025, 7, 9))
        );
    }

    #[test]
    fn next_week_is_seven_days_out() {
        let r = resolver(vec![]);
        let idx = IndexConfig::new("BANKNIFTY", 100.0, 2, 2); // Wednesday anchor
        assert_eq!(
            r.resolve(&idx, ExpiryTag::NextWeek, date(2025, 7, 7)),
            Some(date(2025, 7, 16))
        );
    }

    #[test]
    fn this_month_is_last_anchor_weekday() {
        let r = resolver(vec![]);
        let idx = IndexConfig::new("NIFTY", 50.0, 2, 2);
        // Last Thursday of July 2025 is the 31st.
        assert_eq!(
            r.resolve(&idx, ExpiryTag::ThisMonth, date(2025, 7, 7)),
            Some(date(2025, 7, 31))
        );
        // Last Thursday of August 2025 is the 28th.
        assert_eq!(
            r.resolve(&idx, ExpiryTag::NextMonth, date(2025, 7, 7)),
            Some(date(2025, 8, 28))
        );
    }

    #[test]
    fn allowed_dates_force_fallback() {
        let r = resolver(vec![]);
        let mut idx = IndexConfig::new("NIFTY", 50.0, 2, 2);
        idx.allowed_expiry_dates = Some(vec![date(2025, 7, 11)]); // Friday only
        assert_eq!(
            r.resolve(&idx, ExpiryTag::ThisWeek, date(2025, 7, 7)),
            Some(date(2025, 7, 11))
        );
    }

    #[test]
    fn unresolvable_tag_reported() {
        let r = resolver(vec![]);
        let mut idx = IndexConfig::new("NIFTY", 50.0, 2, 2);
        idx.allowed_expiry_dates = Some(vec![date(2026, 1, 1)]);
        idx.expiry_tags = vec![ExpiryTag::ThisWeek];
        let res = r.resolve_all(&idx, date(2025, 7, 7));
        assert!(res.resolved.is_empty());
        assert_eq!(res.unresolved, vec![ExpiryTag::ThisWeek]);
    }
}
