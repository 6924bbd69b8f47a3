use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::str::FromStr;

use crate::core::error::{HubError, HubResult};

/// Accept 5-field (minute-first) or 6-field (seconds-first) expressions and
/// return the seconds-first form the scheduler runs.
pub fn normalize_cron(expression: &str) -> HubResult<String> {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    let normalized = match fields.len() {
        5 => format!("0 {}", fields.join(" ")),
        6 => fields.join(" "),
        0 => return Err(HubError::validation("cron expression is required")),
        n => {
            return Err(HubError::validation(format!(
                "cron expression must have 5 or 6 fields, got {}",
                n
            )));
        }
    };
    cron::Schedule::from_str(&normalized).map_err(|e| {
        HubError::validation(format!("invalid cron expression '{}': {}", expression, e))
    })?;
    Ok(normalized)
}

/// Known IANA zone name, `UTC` when absent.
pub fn parse_timezone(timezone: Option<&str>) -> HubResult<Tz> {
    match timezone.map(str::trim).filter(|tz| !tz.is_empty()) {
        None => Ok(Tz::UTC),
        Some(name) => name
            .parse::<Tz>()
            .map_err(|_| HubError::validation(format!("unknown timezone '{}'", name))),
    }
}

/// Next time a normalized expression fires in `timezone`.
pub fn next_fire(expression: &str, timezone: &str) -> Option<DateTime<Utc>> {
    let schedule = cron::Schedule::from_str(expression).ok()?;
    let tz = timezone.parse::<Tz>().ok()?;
    schedule
        .upcoming(tz)
        .next()
        .map(|dt| dt.with_timezone(&Utc))
}
