use httpdate::parse_http_date;
use reqwest::header::{HeaderMap, HeaderValue, RETRY_AFTER};
use std::time::{Duration, SystemTime};

/// Server hints above this window are clamped.
pub const MAX_SERVER_HINT_WINDOW: Duration = Duration::from_secs(120);

pub fn parse_retry_after_header(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?;
    parse_retry_after_value(value, SystemTime::now())
}

fn parse_retry_after_value(value: &HeaderValue, now: SystemTime) -> Option<Duration> {
    parse_retry_after(value.to_str().ok()?, now)
}

/// Parses a `Retry-After` value given either in seconds or as an HTTP date.
pub fn parse_retry_after(value: &str, now: SystemTime) -> Option<Duration> {
    let raw = value.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(seconds) = raw.parse::<u64>() {
        return Some(Duration::from_secs(seconds).min(MAX_SERVER_HINT_WINDOW));
    }

    if let Ok(when) = parse_http_date(raw) {
        let delay = when.duration_since(now).unwrap_or(Duration::ZERO);
        return Some(delay.min(MAX_SERVER_HINT_WINDOW));
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_seconds_header() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("7"));
        assert_eq!(parse_retry_after_header(&headers), Some(Duration::from_secs(7)));
    }

    #[test]
    fn parses_http_date() {
        let now = SystemTime::now();
        let header = httpdate::fmt_http_date(now + Duration::from_secs(30));
        let parsed = parse_retry_after(&header, now).unwrap();
        assert!(parsed.as_secs() >= 29 && parsed.as_secs() <= 30);
    }

    #[test]
    fn clamps_long_hints_and_rejects_garbage() {
        assert_eq!(parse_retry_after("3600", SystemTime::now()), Some(MAX_SERVER_HINT_WINDOW));
        assert_eq!(parse_retry_after("soon", SystemTime::now()), None);
        assert_eq!(parse_retry_after("  ", SystemTime::now()), None);
    }
}
