//! UTC clock and UT-date helpers.
//!
//! All persisted timestamps are Unix epoch milliseconds (UTC). UT dates are
//! rendered and parsed as `YYYY-MM-DD`.

use hifitime::Epoch;
use once_cell::sync::Lazy;
use regex::Regex;

static UT_DATE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d{4})-(\d{1,2})-(\d{1,2})(?:[T ].*)?$").expect("valid ut date regex")
});

const MS_PER_DAY: i64 = 86_400_000;

/// Returns the current UTC time in epoch milliseconds.
///
/// Falls back to `0` only if the system clock cannot be read at all.
pub fn now_epoch_ms() -> i64 {
    match Epoch::now() {
        Ok(epoch) => epoch.to_unix_milliseconds().round() as i64,
        Err(err) => {
            log::error!("event=clock_read module=clock status=error error={err}");
            0
        }
    }
}

/// Formats epoch milliseconds as a UT date (`YYYY-MM-DD`).
pub fn format_ut_date(epoch_ms: i64) -> String {
    let (year, month, day, ..) = Epoch::from_unix_milliseconds(epoch_ms as f64).to_gregorian_utc();
    format!("{year:04}-{month:02}-{day:02}")
}

/// Formats epoch milliseconds as a UT timestamp (`YYYY-MM-DDTHH:MM:SS`).
pub fn format_ut_datetime(epoch_ms: i64) -> String {
    let (year, month, day, hour, minute, second, _) =
        Epoch::from_unix_milliseconds(epoch_ms as f64).to_gregorian_utc();
    format!("{year:04}-{month:02}-{day:02}T{hour:02}:{minute:02}:{second:02}")
}

/// Returns `[start, end)` epoch-millisecond bounds of the UT day named by
/// `date`. A trailing time component (`2002-03-10T12:00`) is ignored.
///
/// Returns `None` when the value is not a valid calendar date.
pub fn ut_day_bounds(date: &str) -> Option<(i64, i64)> {
    let caps = UT_DATE_RE.captures(date.trim())?;
    let year: i32 = caps.get(1)?.as_str().parse().ok()?;
    let month: u8 = caps.get(2)?.as_str().parse().ok()?;
    let day: u8 = caps.get(3)?.as_str().parse().ok()?;

    let start = Epoch::maybe_from_gregorian_utc(year, month, day, 0, 0, 0, 0).ok()?;
    let start_ms = start.to_unix_milliseconds().round() as i64;
    Some((start_ms, start_ms + MS_PER_DAY))
}

/// Returns `[start, end)` bounds of the current UT day.
pub fn ut_today_bounds() -> (i64, i64) {
    let now = now_epoch_ms();
    ut_day_bounds(&format_ut_date(now)).unwrap_or_else(|| {
        let start = now - now.rem_euclid(MS_PER_DAY);
        (start, start + MS_PER_DAY)
    })
}

#[cfg(test)]
mod tests {
    use super::{
        format_ut_date, format_ut_datetime, now_epoch_ms, ut_day_bounds, ut_today_bounds,
        MS_PER_DAY,
    };

    #[test]
    fn day_bounds_cover_one_ut_day() {
        let (start, end) = ut_day_bounds("2002-03-10").expect("valid date");
        assert_eq!(end - start, MS_PER_DAY);
        assert_eq!(format_ut_date(start), "2002-03-10");
        assert_eq!(format_ut_date(end - 1), "2002-03-10");
        assert_eq!(format_ut_date(end), "2002-03-11");
    }

    #[test]
    fn datetime_includes_time_of_day() {
        let (start, _) = ut_day_bounds("2002-03-10").expect("valid date");
        assert_eq!(format_ut_datetime(start + 3_723_000), "2002-03-10T01:02:03");
    }

    #[test]
    fn day_bounds_ignore_time_component() {
        assert_eq!(
            ut_day_bounds("2002-03-10T12:30:00"),
            ut_day_bounds("2002-03-10")
        );
    }

    #[test]
    fn day_bounds_reject_garbage() {
        assert!(ut_day_bounds("yesterday").is_none());
        assert!(ut_day_bounds("2002-13-40").is_none());
    }

    #[test]
    fn today_bounds_contain_now() {
        let (start, end) = ut_today_bounds();
        let now = now_epoch_ms();
        assert!(start <= now && now < end);
        assert_eq!(end - start, MS_PER_DAY);
    }
}
