use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};

use crate::db::models::{RatingPhase, MAX_RATING};

pub fn to_u32(value: i64, field: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| anyhow!("{field} out of range: {value}"))
}

pub fn to_rating(value: Option<i64>, field: &str) -> Result<Option<u8>> {
    match value {
        Some(raw) => {
            let rating =
                u8::try_from(raw).map_err(|_| anyhow!("{field} out of range: {raw}"))?;
            if rating > MAX_RATING {
                return Err(anyhow!("{field} exceeds {MAX_RATING}: {rating}"));
            }
            Ok(Some(rating))
        }
        None => Ok(None),
    }
}

/// Fixed-width RFC 3339 so timestamps sort correctly as text.
pub fn format_datetime(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_datetime(value: &str, field: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("failed to parse {field}"))
}

pub fn parse_optional_datetime(
    value: Option<String>,
    field: &str,
) -> Result<Option<DateTime<Utc>>> {
    match value {
        Some(raw) => parse_datetime(&raw, field).map(Some),
        None => Ok(None),
    }
}

pub fn parse_phase(value: &str) -> Result<RatingPhase> {
    match value {
        "idle" => Ok(RatingPhase::Idle),
        "rating" => Ok(RatingPhase::Rating),
        "waiting" => Ok(RatingPhase::Waiting),
        "revealed" => Ok(RatingPhase::Revealed),
        other => Err(anyhow!("unknown rating phase {other}")),
    }
}
