//! NY trading-hours boundary math shared by the channel-name grammar (§3),
//! the ingest pipeline's `getChannelNameType` (§4.9), and the replay
//! scheduler's `jump_to_next_market_open` (§4.5).

use chrono::{Datelike, NaiveTime, TimeZone, Weekday};
use chrono_tz::America::New_York;

const REGULAR_OPEN: NaiveTime = NaiveTime::from_hms_opt(9, 30, 0).unwrap();
const REGULAR_CLOSE: NaiveTime = NaiveTime::from_hms_opt(16, 0, 0).unwrap();
const EXTENDED_OPEN: NaiveTime = NaiveTime::from_hms_opt(4, 0, 0).unwrap();
const EXTENDED_CLOSE: NaiveTime = NaiveTime::from_hms_opt(20, 0, 0).unwrap();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelHoursType {
    Regular,
    Extended,
}

impl ChannelHoursType {
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelHoursType::Regular => "regular",
            ChannelHoursType::Extended => "extended",
        }
    }
}

/// `getChannelNameType(timestamp_ms)` — regular hours is [09:30:00.000,
/// 16:00:00.000) NY time; everything else (including extended-hours
/// windows and weekends) is "extended" for channel-naming purposes.
pub fn channel_name_type(timestamp_ms: i64) -> ChannelHoursType {
    if is_regular_hours(timestamp_ms) {
        ChannelHoursType::Regular
    } else {
        ChannelHoursType::Extended
    }
}

/// `IsTimestampRegularHours` — same boundary as `channel_name_type`, exposed
/// as a plain predicate since several call sites only need the bool.
pub fn is_regular_hours(timestamp_ms: i64) -> bool {
    let Some(ny) = to_ny(timestamp_ms) else {
        return false;
    };
    let t = ny.time();
    t >= REGULAR_OPEN && t < REGULAR_CLOSE
}

/// True if `timestamp_ms` falls in the NY extended-hours window
/// (04:00–09:30 or 16:00–20:00), regardless of weekday. Used by the replay
/// scheduler when `extended_hours` is enabled for a session.
pub fn is_extended_hours(timestamp_ms: i64) -> bool {
    let Some(ny) = to_ny(timestamp_ms) else {
        return false;
    };
    let t = ny.time();
    (t >= EXTENDED_OPEN && t < REGULAR_OPEN) || (t >= REGULAR_CLOSE && t < EXTENDED_CLOSE)
}

/// True if `timestamp_ms` is inside the trading session the caller cares
/// about: regular hours always count; extended hours count only if
/// `extended_hours` is set. Weekends never count.
pub fn is_in_session(timestamp_ms: i64, extended_hours: bool) -> bool {
    let Some(ny) = to_ny(timestamp_ms) else {
        return false;
    };
    if matches!(ny.weekday(), Weekday::Sat | Weekday::Sun) {
        return false;
    }
    is_regular_hours(timestamp_ms) || (extended_hours && is_extended_hours(timestamp_ms))
}

/// Advances `timestamp_ms` to the next session open (regular open if
/// `extended_hours` is false, else extended open), skipping Saturday and
/// Sunday. Used by the replay scheduler's `jump_to_next_market_open`.
pub fn next_market_open(timestamp_ms: i64, extended_hours: bool) -> i64 {
    let Some(mut ny) = to_ny(timestamp_ms) else {
        return timestamp_ms;
    };
    let open_time = if extended_hours {
        EXTENDED_OPEN
    } else {
        REGULAR_OPEN
    };

    // If we're before today's open and today isn't a weekend, jump there.
    if !matches!(ny.weekday(), Weekday::Sat | Weekday::Sun) && ny.time() < open_time {
        let candidate = ny.date_naive().and_time(open_time);
        return New_York
            .from_local_datetime(&candidate)
            .single()
            .map(|dt| dt.timestamp_millis())
            .unwrap_or(timestamp_ms);
    }

    // Otherwise walk forward a day at a time until we land on a weekday,
    // then use that day's open.
    loop {
        ny = ny + chrono::Duration::days(1);
        if !matches!(ny.weekday(), Weekday::Sat | Weekday::Sun) {
            let candidate = ny.date_naive().and_time(open_time);
            return New_York
                .from_local_datetime(&candidate)
                .single()
                .map(|dt| dt.timestamp_millis())
                .unwrap_or(timestamp_ms);
        }
    }
}

fn to_ny(timestamp_ms: i64) -> Option<chrono::DateTime<chrono_tz::Tz>> {
    chrono::Utc
        .timestamp_millis_opt(timestamp_ms)
        .single()
        .map(|utc| utc.with_timezone(&New_York))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn ny_ms(y: i32, m: u32, d: u32, h: u32, mi: u32, s: u32, milli: u32) -> i64 {
        let naive = NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_milli_opt(h, mi, s, milli)
            .unwrap();
        New_York
            .from_local_datetime(&naive)
            .single()
            .unwrap()
            .timestamp_millis()
    }

    #[test]
    fn boundary_at_open() {
        // Monday, not a DST transition day.
        let ts = ny_ms(2024, 6, 10, 9, 30, 0, 0);
        assert_eq!(channel_name_type(ts), ChannelHoursType::Regular);
        assert!(is_regular_hours(ts));
    }

    #[test]
    fn boundary_just_before_open() {
        let ts = ny_ms(2024, 6, 10, 9, 29, 59, 999);
        assert_eq!(channel_name_type(ts), ChannelHoursType::Extended);
        assert!(!is_regular_hours(ts));
    }

    #[test]
    fn boundary_at_close() {
        let ts = ny_ms(2024, 6, 10, 16, 0, 0, 0);
        assert_eq!(channel_name_type(ts), ChannelHoursType::Extended);
        assert!(!is_regular_hours(ts));
    }

    #[test]
    fn next_open_skips_weekend() {
        // Saturday afternoon -> Monday regular open.
        let saturday = ny_ms(2024, 6, 8, 13, 0, 0, 0);
        let opened = next_market_open(saturday, false);
        let expected = ny_ms(2024, 6, 10, 9, 30, 0, 0);
        assert_eq!(opened, expected);
    }

    #[test]
    fn next_open_extended_same_day() {
        let early = ny_ms(2024, 6, 10, 2, 0, 0, 0);
        let opened = next_market_open(early, true);
        let expected = ny_ms(2024, 6, 10, 4, 0, 0, 0);
        assert_eq!(opened, expected);
    }
}
