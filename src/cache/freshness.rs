use std::time::{Duration, SystemTime};

use http::HeaderMap;

use crate::headers::cache_control::CacheControl;

/// Freshness state of one cached response at a given instant. The instant
/// is passed in so tests can use synthetic clocks.
#[derive(Debug, Clone)]
pub(crate) struct Freshness {
    pub age: Duration,
    pub expires_at: Option<SystemTime>,
    pub is_expired: bool,
    pub is_stale_while_revalidate: bool,
    pub is_stale_if_error: bool,
    pub needs_revalidation: bool,
}

impl Freshness {
    pub fn evaluate(headers: &HeaderMap, created: SystemTime, now: SystemTime) -> Self {
        let cc = CacheControl::parse(headers);
        let response_time = parse_date_header(headers, http::header::DATE).unwrap_or(created);
        let age = now.duration_since(response_time).unwrap_or_default();

        let expires_at = cc
            .max_age
            .map(|max_age| response_time + max_age)
            .or_else(|| parse_date_header(headers, http::header::EXPIRES));

        let is_expired = expires_at.is_some_and(|expiry| now > expiry);
        let is_stale_while_revalidate = within_window(expires_at, cc.stale_while_revalidate, now);
        let is_stale_if_error = within_window(expires_at, cc.stale_if_error, now);

        let mut needs_revalidation = cc.no_store
            || cc.no_cache
            || expires_at.is_none()
            || cc.must_revalidate
            || is_expired;
        if cc.immutable && expires_at.is_some() && !is_expired {
            needs_revalidation = false;
        }

        Self {
            age,
            expires_at,
            is_expired,
            is_stale_while_revalidate,
            is_stale_if_error,
            needs_revalidation,
        }
    }

    /// Seconds until expiration, negative once past it. `None` when the
    /// response carries no freshness lifetime.
    pub fn ttl_seconds(&self, now: SystemTime) -> Option<i64> {
        let expires_at = self.expires_at?;
        match expires_at.duration_since(now) {
            Ok(remaining) => Some(remaining.as_secs() as i64),
            Err(behind) => Some(-(behind.duration().as_secs() as i64)),
        }
    }
}

fn within_window(expires_at: Option<SystemTime>, window: Option<Duration>, now: SystemTime) -> bool {
    match (expires_at, window) {
        (Some(expiry), Some(window)) => now < expiry + window,
        _ => false,
    }
}

fn parse_date_header(headers: &HeaderMap, name: http::header::HeaderName) -> Option<SystemTime> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| httpdate::parse_http_date(value).ok())
}
