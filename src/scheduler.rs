//! Computes the delay until the next housekeeping cycle.
//!
//! The four wall-clock modes are spec'd directly; the optional `Cron`
//! mode reuses the teacher's own scheduling dependency (`cron` +
//! `chrono`) so a coexisting cron expression needs no new crate.

use chrono::{DateTime, Datelike, Duration as ChronoDuration, Local, TimeZone, Timelike};
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleMode {
    Interval(Duration),
    Daily { hour: u32, minute: u32 },
    Weekly { day_of_week: chrono::Weekday, hour: u32, minute: u32 },
    Monthly { day: u32, hour: u32, minute: u32 },
    Cron(String),
}

/// Parses durations like `30s`, `10m`, `2h`, `1d` (case-insensitive
/// suffix). Malformed input falls back to 10 minutes per spec.md §4.F.
pub fn parse_interval(input: &str) -> Duration {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Duration::from_secs(600);
    }
    let lower = trimmed.to_lowercase();
    let (num_part, unit) = lower.split_at(lower.len() - 1);
    let multiplier = match unit {
        "s" => 1u64,
        "m" => 60,
        "h" => 3600,
        "d" => 86400,
        _ => return Duration::from_secs(600),
    };
    match num_part.parse::<u64>() {
        Ok(n) => Duration::from_secs((n * multiplier).max(1)),
        Err(_) => Duration::from_secs(600),
    }
}

/// Computes the delay until the next matching instant in local time.
/// Always returns a strictly positive duration.
pub fn next_delay(mode: &ScheduleMode, now: DateTime<Local>) -> Duration {
    match mode {
        ScheduleMode::Interval(d) => {
            if d.is_zero() {
                Duration::from_secs(1)
            } else {
                *d
            }
        }
        ScheduleMode::Daily { hour, minute } => {
            let next = next_daily(now, *hour, *minute);
            to_std(next - now)
        }
        ScheduleMode::Weekly { day_of_week, hour, minute } => {
            let next = next_weekly(now, *day_of_week, *hour, *minute);
            to_std(next - now)
        }
        ScheduleMode::Monthly { day, hour, minute } => {
            let next = next_monthly(now, (*day).clamp(1, 28), *hour, *minute);
            to_std(next - now)
        }
        ScheduleMode::Cron(expr) => match cron::Schedule::from_str(expr) {
            Ok(schedule) => match schedule.after(&now).next() {
                Some(next) => to_std(next - now),
                None => Duration::from_secs(600),
            },
            Err(_) => Duration::from_secs(600),
        },
    }
}

fn to_std(d: ChronoDuration) -> Duration {
    d.to_std().unwrap_or(Duration::from_secs(1)).max(Duration::from_secs(1))
}

fn at_time(base: DateTime<Local>, hour: u32, minute: u32) -> DateTime<Local> {
    base.with_hour(hour)
        .and_then(|d| d.with_minute(minute))
        .and_then(|d| d.with_second(0))
        .and_then(|d| d.with_nanosecond(0))
        .unwrap_or(base)
}

fn next_daily(now: DateTime<Local>, hour: u32, minute: u32) -> DateTime<Local> {
    let candidate = at_time(now, hour, minute);
    if candidate <= now {
        candidate + ChronoDuration::days(1)
    } else {
        candidate
    }
}

fn next_weekly(now: DateTime<Local>, dow: chrono::Weekday, hour: u32, minute: u32) -> DateTime<Local> {
    let mut candidate = at_time(now, hour, minute);
    let mut days_ahead = (dow.num_days_from_monday() as i64 - now.weekday().num_days_from_monday() as i64 + 7) % 7;
    candidate += ChronoDuration::days(days_ahead);
    if candidate <= now {
        days_ahead += 7;
        candidate = at_time(now, hour, minute) + ChronoDuration::days(days_ahead);
    }
    candidate
}

fn next_monthly(now: DateTime<Local>, day: u32, hour: u32, minute: u32) -> DateTime<Local> {
    let mut candidate = Local
        .with_ymd_and_hms(now.year(), now.month(), day, hour, minute, 0)
        .single()
        .unwrap_or(now);
    if candidate <= now {
        let (year, month) = if now.month() == 12 { (now.year() + 1, 1) } else { (now.year(), now.month() + 1) };
        candidate = Local.with_ymd_and_hms(year, month, day, hour, minute, 0).single().unwrap_or(candidate);
    }
    candidate
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn interval_is_positive() {
        let d = next_delay(&ScheduleMode::Interval(Duration::from_secs(0)), Local::now());
        assert!(d.as_secs() > 0);
    }

    #[test]
    fn parse_interval_suffixes() {
        assert_eq!(parse_interval("30s"), Duration::from_secs(30));
        assert_eq!(parse_interval("10m"), Duration::from_secs(600));
        assert_eq!(parse_interval("2h"), Duration::from_secs(7200));
        assert_eq!(parse_interval("1d"), Duration::from_secs(86400));
        assert_eq!(parse_interval("garbage"), Duration::from_secs(600));
        assert_eq!(parse_interval("0s"), Duration::from_secs(1));
    }

    #[test]
    fn daily_past_rolls_to_tomorrow() {
        let now = Local.with_ymd_and_hms(2026, 1, 1, 10, 0, 0).unwrap();
        let delay = next_delay(&ScheduleMode::Daily { hour: 3, minute: 0 }, now);
        let next = now + ChronoDuration::from_std(delay).unwrap();
        assert_eq!(next.day(), 2);
        assert_eq!(next.hour(), 3);
    }

    #[test]
    fn daily_future_is_same_day() {
        let now = Local.with_ymd_and_hms(2026, 1, 1, 1, 0, 0).unwrap();
        let delay = next_delay(&ScheduleMode::Daily { hour: 3, minute: 0 }, now);
        let next = now + ChronoDuration::from_std(delay).unwrap();
        assert_eq!(next.day(), 1);
        assert_eq!(next.hour(), 3);
    }

    #[test]
    fn weekly_same_day_past_adds_a_week() {
        // 2026-01-01 is a Thursday
        let now = Local.with_ymd_and_hms(2026, 1, 1, 10, 0, 0).unwrap();
        let delay = next_delay(&ScheduleMode::Weekly { day_of_week: chrono::Weekday::Thu, hour: 3, minute: 0 }, now);
        let next = now + ChronoDuration::from_std(delay).unwrap();
        assert_eq!(next.day(), 8);
    }

    #[test]
    fn monthly_past_rolls_to_next_month() {
        let now = Local.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap();
        let delay = next_delay(&ScheduleMode::Monthly { day: 1, hour: 3, minute: 0 }, now);
        let next = now + ChronoDuration::from_std(delay).unwrap();
        assert_eq!(next.month(), 2);
        assert_eq!(next.day(), 1);
    }

    #[test]
    fn monthly_day_clamped_in_caller() {
        assert_eq!(31u32.clamp(1, 28), 28);
    }
}
