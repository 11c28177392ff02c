use std::time::Duration;

use http::{HeaderMap, HeaderValue};

/// The Cache-Control directives this cache understands. Unknown directives
/// are ignored; numeric directives with negative or unparsable values are
/// treated as absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheControl {
    pub public: bool,
    pub private: bool,
    pub no_cache: bool,
    pub no_store: bool,
    pub must_revalidate: bool,
    pub immutable: bool,
    pub max_age: Option<Duration>,
    pub stale_while_revalidate: Option<Duration>,
    pub stale_if_error: Option<Duration>,
}

impl CacheControl {
    pub fn parse(headers: &HeaderMap) -> Self {
        let mut cc = Self::default();
        for value in headers.get_all(http::header::CACHE_CONTROL) {
            if let Ok(s) = value.to_str() {
                cc.merge_value(s);
            }
        }
        cc
    }

    pub fn parse_value(value: &str) -> Self {
        let mut cc = Self::default();
        cc.merge_value(value);
        cc
    }

    fn merge_value(&mut self, value: &str) {
        for part in value.split(',') {
            let part = part.trim();
            if part.eq_ignore_ascii_case("public") {
                self.public = true;
            } else if part.eq_ignore_ascii_case("private") {
                self.private = true;
            } else if part.eq_ignore_ascii_case("no-cache") {
                self.no_cache = true;
            } else if part.eq_ignore_ascii_case("no-store") {
                self.no_store = true;
            } else if part.eq_ignore_ascii_case("must-revalidate") {
                self.must_revalidate = true;
            } else if part.eq_ignore_ascii_case("immutable") {
                self.immutable = true;
            } else if let Some(seconds) = parse_seconds(part, "max-age=") {
                self.max_age = Some(seconds);
            } else if let Some(seconds) = parse_seconds(part, "stale-while-revalidate=") {
                self.stale_while_revalidate = Some(seconds);
            } else if let Some(seconds) = parse_seconds(part, "stale-if-error=") {
                self.stale_if_error = Some(seconds);
            }
        }
    }

    /// Renders the directives back into a header value. `None` when no
    /// directive is set.
    pub fn to_header_value(&self) -> Option<HeaderValue> {
        let mut parts: Vec<String> = Vec::new();
        if self.public {
            parts.push("public".to_string());
        }
        if self.private {
            parts.push("private".to_string());
        }
        if self.no_cache {
            parts.push("no-cache".to_string());
        }
        if self.no_store {
            parts.push("no-store".to_string());
        }
        if self.must_revalidate {
            parts.push("must-revalidate".to_string());
        }
        if self.immutable {
            parts.push("immutable".to_string());
        }
        if let Some(max_age) = self.max_age {
            parts.push(format!("max-age={}", max_age.as_secs()));
        }
        if let Some(swr) = self.stale_while_revalidate {
            parts.push(format!("stale-while-revalidate={}", swr.as_secs()));
        }
        if let Some(sie) = self.stale_if_error {
            parts.push(format!("stale-if-error={}", sie.as_secs()));
        }
        if parts.is_empty() {
            return None;
        }
        HeaderValue::from_str(&parts.join(", ")).ok()
    }
}

fn parse_seconds(part: &str, prefix: &str) -> Option<Duration> {
    let lowered = part.to_ascii_lowercase();
    let raw = lowered.strip_prefix(prefix)?;
    let raw = raw.trim_matches('"');
    raw.parse::<u64>().ok().map(Duration::from_secs)
}
