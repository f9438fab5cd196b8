//! Departure time arithmetic shared by both wire-format parsers.

use chrono::{NaiveDateTime, Timelike};

/// Local wall-clock source. Returns `None` until the host clock has
/// synchronised; derived minutes are unreliable before that point.
pub trait Clock: Send + Sync {
    fn now(&self) -> Option<NaiveDateTime>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Option<NaiveDateTime> {
        Some(chrono::Local::now().naive_local())
    }
}

/// A departure time reduced to the display string and the minute countdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTime {
    pub display: String,
    pub minutes_until: i32,
}

/// Compute minutes until a departure from either an ISO-8601 timestamp
/// (any trailing zone suffix is stripped; API times are already local) or
/// a bare `HH:MM` string.
///
/// A time more than 12 hours in the past is rolled over to the next
/// calendar day; a second pass re-applies the rollover if the result is
/// still more than an hour in the past.
pub fn minutes_until(time_str: &str, now: NaiveDateTime) -> Option<ParsedTime> {
    let (hour, minute) = clock_part(time_str)?;

    let now_minutes = (now.hour() * 60 + now.minute()) as i32;
    let mut dep_minutes = (hour * 60 + minute) as i32;

    if dep_minutes < now_minutes - 720 {
        dep_minutes += 24 * 60;
    }
    if dep_minutes < now_minutes - 60 {
        dep_minutes += 24 * 60;
    }

    Some(ParsedTime {
        display: format!("{:02}:{:02}", hour, minute),
        minutes_until: dep_minutes - now_minutes,
    })
}

/// Human status line for a departure: delay relative to the timetable when
/// both times are known, otherwise whether the prediction is live at all.
pub fn status_text(minutes_until: i32, aimed_minutes: Option<i32>, is_live: bool) -> String {
    if let (true, Some(aimed)) = (is_live, aimed_minutes) {
        let delay = minutes_until - aimed;
        if delay >= 2 {
            format!("Delayed {} min", delay)
        } else if delay <= -2 {
            format!("Early {} min", -delay)
        } else {
            "On time".to_string()
        }
    } else if is_live {
        "Live".to_string()
    } else {
        "Scheduled".to_string()
    }
}

fn clock_part(s: &str) -> Option<(u32, u32)> {
    let s = s.trim();
    let time = match s.find('T') {
        Some(t) => strip_zone(&s[t + 1..]),
        None => s,
    };
    let (h, rest) = time.split_once(':')?;
    let hour: u32 = h.parse().ok()?;
    let minute: u32 = rest.get(0..2)?.parse().ok()?;
    if hour > 23 || minute > 59 {
        return None;
    }
    Some((hour, minute))
}

// Zone suffix can be "Z", "+01:00" or "-05:00"; a leading '-' would be part
// of the time itself, so only cut on '-' past the first character.
fn strip_zone(t: &str) -> &str {
    for (i, c) in t.char_indices() {
        if c == 'Z' || c == '+' || (c == '-' && i > 0) {
            return &t[..i];
        }
    }
    t
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(hour: u32, minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 7, 15)
            .unwrap()
            .and_hms_opt(hour, minute, 0)
            .unwrap()
    }

    #[test]
    fn plain_time_in_the_near_future() {
        let parsed = minutes_until("15:09", at(15, 0)).unwrap();
        assert_eq!(parsed.display, "15:09");
        assert_eq!(parsed.minutes_until, 9);
    }

    #[test]
    fn iso_timestamp_with_zone_offset_is_taken_as_local() {
        let parsed = minutes_until("2024-07-15T15:09:00.000+01:00", at(15, 0)).unwrap();
        assert_eq!(parsed.display, "15:09");
        assert_eq!(parsed.minutes_until, 9);

        let parsed = minutes_until("2024-07-15T15:09:00Z", at(15, 0)).unwrap();
        assert_eq!(parsed.minutes_until, 9);
    }

    #[test]
    fn departure_just_after_midnight_seen_before_midnight() {
        // 23:58 now, bus at 00:05: six hundred-odd minutes "in the past"
        // rolls over to seven minutes from now.
        let parsed = minutes_until("00:05", at(23, 58)).unwrap();
        assert_eq!(parsed.minutes_until, 7);
    }

    #[test]
    fn departure_before_midnight_seen_just_after_is_treated_as_tomorrow() {
        // 00:05 now, timestamp 23:58: naively 13 minutes departed, so it is
        // read as tomorrow night's bus.
        let parsed = minutes_until("23:58", at(0, 5)).unwrap();
        assert!(
            (1420..=1435).contains(&parsed.minutes_until),
            "got {}",
            parsed.minutes_until
        );
    }

    #[test]
    fn sanity_pass_pushes_stale_times_to_next_day() {
        // Three hours in the past is outside the 12-hour window but still
        // rolled forward by the secondary pass.
        let parsed = minutes_until("11:00", at(14, 0)).unwrap();
        assert_eq!(parsed.minutes_until, 21 * 60);
    }

    #[test]
    fn slightly_past_times_stay_negative() {
        let parsed = minutes_until("13:45", at(14, 0)).unwrap();
        assert_eq!(parsed.minutes_until, -15);
    }

    #[test]
    fn unparseable_strings_are_rejected() {
        assert!(minutes_until("", at(12, 0)).is_none());
        assert!(minutes_until("soon", at(12, 0)).is_none());
        assert!(minutes_until("25:99", at(12, 0)).is_none());
    }

    #[test]
    fn status_text_reports_delay_in_either_direction() {
        assert_eq!(status_text(12, Some(9), true), "Delayed 3 min");
        assert_eq!(status_text(6, Some(9), true), "Early 3 min");
        assert_eq!(status_text(10, Some(9), true), "On time");
        assert_eq!(status_text(10, None, true), "Live");
        assert_eq!(status_text(10, None, false), "Scheduled");
    }
}
