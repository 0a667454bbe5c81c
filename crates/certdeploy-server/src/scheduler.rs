//! Renewal scheduler (C5): fires the renewal executable on a cron-like
//! schedule, then yields to the caller so it can drain whatever the
//! renewal's own deploy hook enqueued.

use std::path::Path;
use std::time::Duration;

use certdeploy_config::{RenewUnit, ServerConfig};
use certdeploy_types::CertDeployError;
use chrono::{Datelike, Local, Weekday};
use tracing::{error, info};

/// `idle -> running -> (success|failure) -> idle` (§4.5). Fires `renew_exec
/// renew_args...` in `cwd`; a non-zero exit is only fatal under
/// `fail_fast`.
pub async fn run_once(config: &ServerConfig, cwd: &Path) -> Result<(), CertDeployError> {
    let exec = config.renew_exec.clone().unwrap_or_else(|| "certbot".to_string());
    let args: Vec<String> = config.renew_args.clone();
    let cwd = cwd.to_path_buf();

    info!(exec = %exec, "renewal starting");
    let output = tokio::task::spawn_blocking(move || {
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        certdeploy_process::run_with_timeout(&exec, &arg_refs, &cwd, None)
    })
    .await
    .map_err(|e| CertDeployError::Renew(format!("renewal task panicked: {e}")))?
    .map_err(|e| CertDeployError::Renew(e.to_string()))?;

    if !output.success() {
        error!(exit_code = output.exit_code, stderr = %output.stderr, "renewal exited non-zero");
        if config.fail_fast {
            return Err(CertDeployError::Renew(format!(
                "renewal exited {} (fail_fast is set)",
                output.exit_code
            )));
        }
    } else {
        info!("renewal finished successfully");
    }
    Ok(())
}

/// How long to sleep before the next scheduled fire, computed from `now`.
pub fn next_fire_delay(unit: RenewUnit, every: u32, at: Option<certdeploy_duration::WallClockTime>) -> Duration {
    let now = Local::now();
    match unit {
        RenewUnit::Minute => Duration::from_secs(60 * every.max(1) as u64),
        RenewUnit::Day => delay_for_daily(now, every, at),
        RenewUnit::Week => delay_for_weekly(now, every, at, now.weekday()),
        RenewUnit::Monday => delay_for_weekly(now, every, at, Weekday::Mon),
        RenewUnit::Tuesday => delay_for_weekly(now, every, at, Weekday::Tue),
        RenewUnit::Wednesday => delay_for_weekly(now, every, at, Weekday::Wed),
        RenewUnit::Thursday => delay_for_weekly(now, every, at, Weekday::Thu),
        RenewUnit::Friday => delay_for_weekly(now, every, at, Weekday::Fri),
        RenewUnit::Saturday => delay_for_weekly(now, every, at, Weekday::Sat),
        RenewUnit::Sunday => delay_for_weekly(now, every, at, Weekday::Sun),
    }
}

fn delay_for_daily(now: chrono::DateTime<Local>, every: u32, at: Option<certdeploy_duration::WallClockTime>) -> Duration {
    let (hour, minute) = at.map(|t| (t.hour as u32, t.minute as u32)).unwrap_or((0, 0));
    let mut target = now
        .date_naive()
        .and_hms_opt(hour, minute, 0)
        .unwrap_or_else(|| now.naive_local());
    if target <= now.naive_local() {
        target += chrono::Duration::days(every.max(1) as i64);
    }
    seconds_until(now.naive_local(), target)
}

fn delay_for_weekly(
    now: chrono::DateTime<Local>,
    every: u32,
    at: Option<certdeploy_duration::WallClockTime>,
    target_weekday: Weekday,
) -> Duration {
    let (hour, minute) = at.map(|t| (t.hour as u32, t.minute as u32)).unwrap_or((0, 0));
    let days_ahead = (7 + target_weekday.num_days_from_monday() as i64 - now.weekday().num_days_from_monday() as i64) % 7;
    let mut target = now.date_naive() + chrono::Duration::days(days_ahead);
    let mut target_dt = target
        .and_hms_opt(hour, minute, 0)
        .unwrap_or_else(|| now.naive_local());
    if target_dt <= now.naive_local() {
        target += chrono::Duration::days(7 * every.max(1) as i64);
        target_dt = target.and_hms_opt(hour, minute, 0).unwrap_or(target_dt);
    }
    seconds_until(now.naive_local(), target_dt)
}

fn seconds_until(now: chrono::NaiveDateTime, target: chrono::NaiveDateTime) -> Duration {
    let secs = (target - now).num_seconds().max(0);
    Duration::from_secs(secs as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minute_unit_uses_multiplier_directly() {
        let delay = next_fire_delay(RenewUnit::Minute, 5, None);
        assert_eq!(delay, Duration::from_secs(300));
    }

    #[test]
    fn zero_multiplier_is_treated_as_one() {
        let delay = next_fire_delay(RenewUnit::Minute, 0, None);
        assert_eq!(delay, Duration::from_secs(60));
    }

    #[test]
    fn daily_delay_is_at_most_one_day() {
        let delay = next_fire_delay(RenewUnit::Day, 1, None);
        assert!(delay <= Duration::from_secs(86400));
    }

    #[test]
    fn weekly_delay_is_at_most_one_week() {
        let delay = next_fire_delay(RenewUnit::Monday, 1, None);
        assert!(delay <= Duration::from_secs(7 * 86400));
    }
}
