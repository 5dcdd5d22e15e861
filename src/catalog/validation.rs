use chrono::NaiveTime;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::{AppError, AppResult};

static TIME_OF_DAY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\d{2}:\d{2}(:\d{2})?$").expect("valid time-of-day regex")
});

pub const TIME_FORMAT: &str = "%H:%M:%S";

/// Parses `HH:MM` or `HH:MM:SS`.
pub fn parse_time_of_day(field: &str, raw: &str) -> AppResult<NaiveTime> {
    if !TIME_OF_DAY.is_match(raw) {
        return Err(AppError::validation(
            field,
            format!("{field} must be in HH:MM or HH:MM:SS format"),
        ));
    }
    let normalized = if raw.len() == 5 {
        format!("{raw}:00")
    } else {
        raw.to_string()
    };
    NaiveTime::parse_from_str(&normalized, TIME_FORMAT)
        .map_err(|_| AppError::validation(field, format!("{field} is not a valid time of day")))
}

pub fn format_time(time: NaiveTime) -> String {
    time.format(TIME_FORMAT).to_string()
}

pub fn parse_opt_time(field: &str, raw: Option<&str>) -> AppResult<Option<NaiveTime>> {
    raw.map(|value| parse_time_of_day(field, value)).transpose()
}

pub fn ensure_window(start: Option<NaiveTime>, end: Option<NaiveTime>) -> AppResult<()> {
    match (start, end) {
        (Some(start), Some(end)) if start >= end => Err(AppError::validation(
            "startTime",
            "startTime must be before endTime",
        )),
        _ => Ok(()),
    }
}

pub fn ensure_non_empty(field: &str, value: &str) -> AppResult<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(AppError::validation(
            field,
            format!("{field} must be a non-empty string"),
        ));
    }
    Ok(trimmed.to_string())
}

pub fn ensure_positive(field: &str, value: i64) -> AppResult<i64> {
    if value <= 0 {
        return Err(AppError::validation(
            field,
            format!("{field} must be a positive integer"),
        ));
    }
    Ok(value)
}

/// A session may run for at most a week before it is auto-closed.
pub const MAX_AUTO_CLOSE_MINUTES: i64 = 7 * 24 * 60;

pub fn ensure_auto_close_minutes(value: i64) -> AppResult<i64> {
    let value = ensure_positive("autoCloseAfterMinutes", value)?;
    if value > MAX_AUTO_CLOSE_MINUTES {
        return Err(AppError::validation(
            "autoCloseAfterMinutes",
            format!("autoCloseAfterMinutes must be at most {MAX_AUTO_CLOSE_MINUTES}"),
        ));
    }
    Ok(value)
}

pub fn ensure_non_negative(field: &str, value: i64) -> AppResult<i64> {
    if value < 0 {
        return Err(AppError::validation(
            field,
            format!("{field} must be a non-negative integer"),
        ));
    }
    Ok(value)
}

pub const BONUS_MULTIPLIER_KEY: &str = "bonusMultiplier";

/// Routine settings must be an object; a `bonusMultiplier`, when present, is a number >= 1.
pub fn validate_settings(settings: &Value) -> AppResult<()> {
    let Some(map) = settings.as_object() else {
        return Err(AppError::validation("settings", "settings must be an object"));
    };
    if let Some(raw) = map.get(BONUS_MULTIPLIER_KEY) {
        match raw.as_f64() {
            Some(value) if value.is_finite() && value >= 1.0 => {}
            _ => {
                return Err(AppError::validation(
                    "settings.bonusMultiplier",
                    "bonusMultiplier must be a number of at least 1",
                ))
            }
        }
    }
    Ok(())
}

/// Multiplier a best-time finish earns; 1.0 means no bonus.
pub fn bonus_multiplier(settings: &Value) -> f64 {
    settings
        .get(BONUS_MULTIPLIER_KEY)
        .and_then(Value::as_f64)
        .filter(|value| value.is_finite() && *value >= 1.0)
        .unwrap_or(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use serde_json::json;

    #[test]
    fn short_times_are_normalized() {
        let t = parse_time_of_day("startTime", "07:30").unwrap();
        assert_eq!(format_time(t), "07:30:00");
        let t = parse_time_of_day("startTime", "07:30:15").unwrap();
        assert_eq!(format_time(t), "07:30:15");
    }

    #[test]
    fn malformed_times_name_the_field() {
        for raw in ["7:30", "07:30:0", "25:00", "07-30", ""] {
            let err = parse_time_of_day("endTime", raw).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Validation, "{raw}");
            assert_eq!(err.context().get("field").map(String::as_str), Some("endTime"));
        }
    }

    #[test]
    fn window_must_be_ordered() {
        let a = parse_time_of_day("startTime", "07:00").unwrap();
        let b = parse_time_of_day("endTime", "08:00").unwrap();
        assert!(ensure_window(Some(a), Some(b)).is_ok());
        assert!(ensure_window(Some(b), Some(a)).is_err());
        assert!(ensure_window(Some(a), Some(a)).is_err());
        assert!(ensure_window(Some(a), None).is_ok());
    }

    #[test]
    fn bonus_multiplier_defaults_to_one() {
        assert_eq!(bonus_multiplier(&json!({})), 1.0);
        assert_eq!(bonus_multiplier(&json!({ "bonusMultiplier": 1.5 })), 1.5);
        assert_eq!(bonus_multiplier(&json!({ "bonusMultiplier": 0.5 })), 1.0);
        assert_eq!(bonus_multiplier(&json!({ "bonusMultiplier": "2" })), 1.0);
    }

    #[test]
    fn settings_validation() {
        assert!(validate_settings(&json!({ "bonusMultiplier": 2 })).is_ok());
        assert!(validate_settings(&json!({ "bonusMultiplier": 0.9 })).is_err());
        assert!(validate_settings(&json!([1, 2])).is_err());
    }

    #[test]
    fn numbers_are_range_checked() {
        assert!(ensure_positive("position", 0).is_err());
        assert_eq!(ensure_positive("position", 3).unwrap(), 3);
        assert_eq!(ensure_auto_close_minutes(30).unwrap(), 30);
        assert!(ensure_auto_close_minutes(0).is_err());
        assert!(ensure_auto_close_minutes(MAX_AUTO_CLOSE_MINUTES + 1).is_err());
        assert!(ensure_non_negative("points", -1).is_err());
        assert_eq!(ensure_non_negative("points", 0).unwrap(), 0);
        assert_eq!(ensure_non_empty("name", "  Brush  ").unwrap(), "Brush");
        assert!(ensure_non_empty("name", "   ").is_err());
    }
}
