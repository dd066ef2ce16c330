//! Time specifications for the modification-time lower bound.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, Utc};

const ONE_SEC_MS: i64 = 1000;
const ONE_MINUTE_MS: i64 = 60 * ONE_SEC_MS;
const ONE_HOUR_MS: i64 = 60 * ONE_MINUTE_MS;
const ONE_DAY_MS: i64 = 24 * ONE_HOUR_MS;
const ONE_YEAR_MS: i64 = 365 * ONE_DAY_MS;

/// Converts a time specification into a point in time.
///
/// Accepted forms: the literal `now`, `now-<dur>` or `now+<dur>` (for
/// example `now-2h`), a bare decimal Unix timestamp in seconds, or an
/// RFC 3339 date such as `2018-09-26T14:10:20Z`. An empty string means no
/// bound and maps to `None`.
pub fn parse_time(spec: &str) -> Result<Option<DateTime<Utc>>> {
    if spec.is_empty() {
        return Ok(None);
    }

    if let Some(rest) = spec.strip_prefix("now") {
        if rest.is_empty() {
            return Ok(Some(Utc::now()));
        }
        let sign = rest.chars().next().unwrap_or_default();
        if sign != '-' && sign != '+' {
            return Err(anyhow!("unsupported time format: {}", spec));
        }
        let duration = parse_duration(&rest[sign.len_utf8()..])
            .with_context(|| format!("could not parse the pattern following 'now' in {:?}", spec))?;
        return match sign {
            '-' => Ok(Some(Utc::now() - duration)),
            _ => Ok(Some(Utc::now() + duration)),
        };
    }

    if let Ok(seconds) = spec.parse::<i64>() {
        return DateTime::from_timestamp(seconds, 0)
            .map(Some)
            .ok_or_else(|| anyhow!("Unix timestamp {} is out of range", spec));
    }

    let time = DateTime::parse_from_rfc3339(spec)
        .with_context(|| format!("invalid time string {:?} - not an RFC 3339 time format", spec))?;
    Ok(Some(time.with_timezone(&Utc)))
}

/// Converts a `<N>[s|m|h|d|y]` duration string (for example `24h` or `30d`).
/// The unit defaults to hours when omitted.
pub fn parse_duration(duration: &str) -> Result<Duration> {
    let mut duration = duration;
    let mut multiply = ONE_HOUR_MS;
    if let Some(last) = duration.chars().last() {
        if matches!(last, 's' | 'm' | 'h' | 'd' | 'y') {
            duration = &duration[..duration.len() - 1];
            multiply = match last {
                's' => ONE_SEC_MS,
                'm' => ONE_MINUTE_MS,
                'h' => ONE_HOUR_MS,
                'd' => ONE_DAY_MS,
                'y' => ONE_YEAR_MS,
                _ => unreachable!(),
            };
        }
    }

    if duration.is_empty() {
        return Ok(Duration::zero());
    }

    let count: i64 = duration.parse().with_context(|| {
        format!(
            "invalid duration {:?}, accepted pattern: [0-9]+[smhdy], e.g. \"30d\" or \"5m\"",
            duration
        )
    })?;
    if count < 0 {
        return Err(anyhow!("the specified duration ({}) is negative", duration));
    }

    Ok(Duration::milliseconds(multiply * count))
}
