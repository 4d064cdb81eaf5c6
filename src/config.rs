//! Environment-driven configuration, following the teacher's
//! `XxxMode::from_env()` convention (see `enums.rs`) generalized into a
//! single aggregate loaded once at startup.

use crate::errors::{MaidError, Result};
use crate::scheduler::ScheduleMode;
use chrono::Weekday;
use log::warn;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct PortainerConfig {
    pub url: String,
    pub api_key: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub insecure_tls: bool,
}

#[derive(Debug, Clone)]
pub struct MaidConfig {
    pub schedule: ScheduleMode,
    pub exclude_patterns: Vec<String>,
    pub backup_retention: chrono::Duration,
    pub container_check: Duration,
    pub portainer: Option<PortainerConfig>,
    pub registry_direct_mode: bool,
}

impl MaidConfig {
    pub fn from_env() -> Result<Self> {
        let schedule = schedule_from_env()?;

        let exclude_patterns = env::var("EXCLUDE_IMAGES")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        let backup_retention_days: i64 = env::var("BACKUP_RETENTION_DAYS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(5);
        if backup_retention_days <= 0 {
            return Err(MaidError::ConfigInvalid(format!(
                "BACKUP_RETENTION_DAYS must be a positive integer, got `{backup_retention_days}`"
            )));
        }

        let container_check_seconds: i64 = env::var("CONTAINER_CHECK_SECONDS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10);
        if container_check_seconds <= 0 {
            return Err(MaidError::ConfigInvalid(format!(
                "CONTAINER_CHECK_SECONDS must be a positive integer, got `{container_check_seconds}`"
            )));
        }

        let portainer = portainer_from_env()?;
        let registry_direct_mode = env::var("REGISTRY_DIRECT_MODE")
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        Ok(Self {
            schedule,
            exclude_patterns,
            backup_retention: chrono::Duration::days(backup_retention_days),
            container_check: Duration::from_secs(container_check_seconds as u64),
            portainer,
            registry_direct_mode,
        })
    }
}

fn schedule_from_env() -> Result<ScheduleMode> {
    if let Ok(expr) = env::var("UPDATE_CRON") {
        return Ok(ScheduleMode::Cron(expr));
    }

    let mode = env::var("UPDATE_MODE").unwrap_or_else(|_| "INTERVAL".to_string()).to_uppercase();
    match mode.as_str() {
        "INTERVAL" => {
            let interval = env::var("UPDATE_INTERVAL").unwrap_or_else(|_| "10m".to_string());
            Ok(ScheduleMode::Interval(crate::scheduler::parse_interval(&interval)))
        }
        "DAILY" => {
            let (hour, minute) = parse_hhmm(&env::var("UPDATE_TIME").unwrap_or_else(|_| "03:00".to_string()));
            Ok(ScheduleMode::Daily { hour, minute })
        }
        "WEEKLY" => {
            let (hour, minute) = parse_hhmm(&env::var("UPDATE_TIME").unwrap_or_else(|_| "03:00".to_string()));
            let day_of_week = parse_weekday(&env::var("UPDATE_DAY").unwrap_or_else(|_| "monday".to_string()));
            Ok(ScheduleMode::Weekly { day_of_week, hour, minute })
        }
        "MONTHLY" => {
            let (hour, minute) = parse_hhmm(&env::var("UPDATE_TIME").unwrap_or_else(|_| "03:00".to_string()));
            let day: u32 = env::var("UPDATE_DAY").ok().and_then(|v| v.parse().ok()).unwrap_or(1);
            Ok(ScheduleMode::Monthly { day: day.clamp(1, 28), hour, minute })
        }
        other => Err(MaidError::ConfigInvalid(format!(
            "UPDATE_MODE `{other}` is not one of INTERVAL, DAILY, WEEKLY, MONTHLY"
        ))),
    }
}

fn parse_hhmm(input: &str) -> (u32, u32) {
    match input.split_once(':').and_then(|(h, m)| Some((h.parse::<u32>().ok()?, m.parse::<u32>().ok()?))) {
        Some((h, m)) if h < 24 && m < 60 => (h, m),
        _ => {
            warn!("UPDATE_TIME `{input}` is not a valid HH:MM, falling back to 03:00");
            (3, 0)
        }
    }
}

fn parse_weekday(input: &str) -> Weekday {
    match input.trim().to_lowercase().as_str() {
        "mon" | "monday" | "1" => Weekday::Mon,
        "tue" | "tuesday" | "2" => Weekday::Tue,
        "wed" | "wednesday" | "3" => Weekday::Wed,
        "thu" | "thursday" | "4" => Weekday::Thu,
        "fri" | "friday" | "5" => Weekday::Fri,
        "sat" | "saturday" | "6" => Weekday::Sat,
        "sun" | "sunday" | "7" | "0" => Weekday::Sun,
        other => {
            warn!("UPDATE_DAY `{other}` is not a recognized weekday, falling back to Monday");
            Weekday::Mon
        }
    }
}

fn portainer_from_env() -> Result<Option<PortainerConfig>> {
    let url = env::var("PORTAINER_URL").ok();
    let api_key = env::var("PORTAINER_API_KEY").ok().filter(|s| !s.is_empty());
    let username = env::var("PORTAINER_USERNAME").ok().filter(|s| !s.is_empty());
    let password = env::var("PORTAINER_PASSWORD").ok().filter(|s| !s.is_empty());
    let insecure_tls = env::var("PORTAINER_INSECURE_TLS").map(|v| v.eq_ignore_ascii_case("true")).unwrap_or(false);

    let Some(url) = url else { return Ok(None) };

    if api_key.is_none() && (username.is_none() || password.is_none()) {
        return Err(MaidError::ConfigInvalid(
            "PORTAINER_URL is set but neither PORTAINER_API_KEY nor PORTAINER_USERNAME/PORTAINER_PASSWORD are configured".to_string(),
        ));
    }

    Ok(Some(PortainerConfig { url, api_key, username, password, insecure_tls }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hhmm_parses_valid() {
        assert_eq!(parse_hhmm("03:00"), (3, 0));
        assert_eq!(parse_hhmm("23:59"), (23, 59));
    }

    #[test]
    fn hhmm_falls_back_on_malformed() {
        assert_eq!(parse_hhmm("not-a-time"), (3, 0));
        assert_eq!(parse_hhmm("25:00"), (3, 0));
    }

    #[test]
    fn weekday_parses_names_and_numbers() {
        assert_eq!(parse_weekday("Thursday"), Weekday::Thu);
        assert_eq!(parse_weekday("4"), Weekday::Thu);
        assert_eq!(parse_weekday("bogus"), Weekday::Mon);
    }
}
