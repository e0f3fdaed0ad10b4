//! Trading clock and calendar.
//!
//! A trading day is a weekday not in the holiday set. Trading hours are the
//! half-open interval [09:30, 16:00) in the trading time zone.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use lazy_static::lazy_static;
use std::collections::HashSet;

lazy_static! {
    /// NYSE full-close days, 2025-2026. Overridable via `with_holidays`.
    static ref DEFAULT_HOLIDAYS: HashSet<NaiveDate> = {
        let days = [
            (2025, 1, 1),
            (2025, 1, 20),
            (2025, 2, 17),
            (2025, 4, 18),
            (2025, 5, 26),
            (2025, 6, 19),
            (2025, 7, 4),
            (2025, 9, 1),
            (2025, 11, 27),
            (2025, 12, 25),
            (2026, 1, 1),
            (2026, 1, 19),
            (2026, 2, 16),
            (2026, 4, 3),
            (2026, 5, 25),
            (2026, 6, 19),
            (2026, 7, 3),
            (2026, 9, 7),
            (2026, 11, 26),
            (2026, 12, 25),
        ];
        days.iter()
            .filter_map(|&(y, m, d)| NaiveDate::from_ymd_opt(y, m, d))
            .collect()
    };
}

#[derive(Clone)]
pub struct TradingCalendar {
    tz: Tz,
    holidays: HashSet<NaiveDate>,
}

impl Default for TradingCalendar {
    fn default() -> Self {
        Self::new()
    }
}

impl TradingCalendar {
    pub fn new() -> Self {
        Self {
            tz: chrono_tz::America::New_York,
            holidays: DEFAULT_HOLIDAYS.clone(),
        }
    }

    pub fn with_holidays(tz: Tz, holidays: HashSet<NaiveDate>) -> Self {
        Self { tz, holidays }
    }

    pub fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    pub fn tz(&self) -> Tz {
        self.tz
    }

    pub fn market_open(&self) -> NaiveTime {
        NaiveTime::from_hms_opt(9, 30, 0).unwrap()
    }

    pub fn market_close(&self) -> NaiveTime {
        NaiveTime::from_hms_opt(16, 0, 0).unwrap()
    }

    /// Calendar date of `t` in the trading time zone.
    pub fn local_date(&self, t: DateTime<Utc>) -> NaiveDate {
        t.with_timezone(&self.tz).date_naive()
    }

    /// `YYYY-MM-DD` in the trading time zone. Counter-rollover key.
    pub fn local_date_str(&self, t: DateTime<Utc>) -> String {
        self.local_date(t).format("%Y-%m-%d").to_string()
    }

    /// `YYYYMMDDThhmm` in the trading time zone. Artifact filename stamp.
    pub fn timestamp_label(&self, t: DateTime<Utc>) -> String {
        t.with_timezone(&self.tz).format("%Y%m%dT%H%M").to_string()
    }

    pub fn is_trading_day(&self, d: NaiveDate) -> bool {
        !matches!(d.weekday(), Weekday::Sat | Weekday::Sun) && !self.holidays.contains(&d)
    }

    pub fn is_market_hours(&self, t: DateTime<Utc>) -> bool {
        let local = t.with_timezone(&self.tz);
        if !self.is_trading_day(local.date_naive()) {
            return false;
        }
        let time = local.time();
        time >= self.market_open() && time < self.market_close()
    }

    pub fn next_trading_day(&self, mut d: NaiveDate) -> NaiveDate {
        loop {
            d += Duration::days(1);
            if self.is_trading_day(d) {
                return d;
            }
        }
    }

    /// Interpret `(date, time)` as trading-zone local wall clock. DST gaps
    /// resolve to the earliest valid instant.
    pub fn at_local(&self, d: NaiveDate, t: NaiveTime) -> DateTime<Utc> {
        match self.tz.from_local_datetime(&d.and_time(t)) {
            chrono::LocalResult::Single(dt) => dt.with_timezone(&Utc),
            chrono::LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
            chrono::LocalResult::None => {
                // Spring-forward gap: shift an hour later.
                let shifted = d.and_time(t) + Duration::hours(1);
                self.tz
                    .from_local_datetime(&shifted)
                    .earliest()
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or_else(|| Utc.from_utc_datetime(&d.and_time(t)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cal() -> TradingCalendar {
        TradingCalendar::new()
    }

    #[test]
    fn weekends_are_not_trading_days() {
        // 2026-08-01 is a Saturday.
        assert!(!cal().is_trading_day(NaiveDate::from_ymd_opt(2026, 8, 1).unwrap()));
        assert!(cal().is_trading_day(NaiveDate::from_ymd_opt(2026, 8, 3).unwrap()));
    }

    #[test]
    fn holidays_are_not_trading_days() {
        assert!(!cal().is_trading_day(NaiveDate::from_ymd_opt(2026, 12, 25).unwrap()));
    }

    #[test]
    fn market_hours_half_open_interval() {
        let c = cal();
        // 2026-08-03 is a Monday.
        let d = NaiveDate::from_ymd_opt(2026, 8, 3).unwrap();
        let at = |h, m| c.at_local(d, NaiveTime::from_hms_opt(h, m, 0).unwrap());
        assert!(!c.is_market_hours(at(9, 29)));
        assert!(c.is_market_hours(at(9, 30)));
        assert!(c.is_market_hours(at(15, 59)));
        assert!(!c.is_market_hours(at(16, 0)));
    }

    #[test]
    fn next_trading_day_skips_weekend() {
        let c = cal();
        // Friday 2026-07-31 -> Monday 2026-08-03.
        let friday = NaiveDate::from_ymd_opt(2026, 7, 31).unwrap();
        assert_eq!(
            c.next_trading_day(friday),
            NaiveDate::from_ymd_opt(2026, 8, 3).unwrap()
        );
    }

    #[test]
    fn timestamp_label_shape() {
        let c = cal();
        let t = c.at_local(
            NaiveDate::from_ymd_opt(2026, 8, 3).unwrap(),
            NaiveTime::from_hms_opt(10, 5, 0).unwrap(),
        );
        assert_eq!(c.timestamp_label(t), "20260803T1005");
    }
}
