use std::fmt;

use http::{HeaderName, HeaderValue};

/// Header carrying the cache's handling of a response, RFC 9211.
pub const CACHE_STATUS: HeaderName = HeaderName::from_static("cache-status");

/// Why a request was forwarded to the origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardReason {
    Bypass,
    Method,
    UriMiss,
    VaryMiss,
    Miss,
    Request,
    Stale,
    Partial,
}

impl ForwardReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bypass => "bypass",
            Self::Method => "method",
            Self::UriMiss => "uri-miss",
            Self::VaryMiss => "vary-miss",
            Self::Miss => "miss",
            Self::Request => "request",
            Self::Stale => "stale",
            Self::Partial => "partial",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "bypass" => Some(Self::Bypass),
            "method" => Some(Self::Method),
            "uri-miss" => Some(Self::UriMiss),
            "vary-miss" => Some(Self::VaryMiss),
            "miss" => Some(Self::Miss),
            "request" => Some(Self::Request),
            "stale" => Some(Self::Stale),
            "partial" => Some(Self::Partial),
            _ => None,
        }
    }
}

/// One Cache-Status member: the cache's name followed by its parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStatus {
    pub cache_name: String,
    pub hit: bool,
    pub fwd: Option<ForwardReason>,
    pub fwd_status: Option<u16>,
    pub ttl: Option<i64>,
    pub stored: bool,
    pub collapsed: bool,
    pub key: Option<String>,
    pub detail: Option<String>,
}

impl CacheStatus {
    pub fn hit(cache_name: impl Into<String>) -> Self {
        Self {
            cache_name: cache_name.into(),
            hit: true,
            ..Default::default()
        }
    }

    pub fn forward(cache_name: impl Into<String>, reason: ForwardReason) -> Self {
        Self {
            cache_name: cache_name.into(),
            fwd: Some(reason),
            ..Default::default()
        }
    }

    pub fn with_fwd_status(mut self, status: u16) -> Self {
        self.fwd_status = Some(status);
        self
    }

    pub fn with_ttl(mut self, ttl: i64) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn stored(mut self) -> Self {
        self.stored = true;
        self
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Parses a single member. Unknown parameters are skipped; a member
    /// without a cache name is rejected.
    pub fn parse(value: &str) -> Option<Self> {
        let mut parts = value.split(';');
        let cache_name = unquote(parts.next()?.trim());
        if cache_name.is_empty() {
            return None;
        }
        let mut status = Self {
            cache_name,
            ..Default::default()
        };
        for part in parts {
            let part = part.trim();
            let (name, raw) = match part.split_once('=') {
                Some((name, raw)) => (name.trim(), Some(raw.trim())),
                None => (part, None),
            };
            match (name, raw) {
                ("hit", None) => status.hit = true,
                ("stored", None) => status.stored = true,
                ("collapsed", None) => status.collapsed = true,
                ("fwd", Some(raw)) => status.fwd = ForwardReason::parse(&unquote(raw)),
                ("fwd-status", Some(raw)) => status.fwd_status = raw.parse().ok(),
                ("ttl", Some(raw)) => status.ttl = raw.parse().ok(),
                ("key", Some(raw)) => status.key = Some(unquote(raw)),
                ("detail", Some(raw)) => status.detail = Some(unquote(raw)),
                _ => {}
            }
        }
        Some(status)
    }

    pub fn to_header_value(&self) -> HeaderValue {
        HeaderValue::from_str(&self.to_string())
            .unwrap_or_else(|_| HeaderValue::from_static("invalid"))
    }
}

impl fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.cache_name)?;
        if self.hit {
            write!(f, "; hit")?;
        }
        if let Some(fwd) = self.fwd {
            write!(f, "; fwd={}", fwd.as_str())?;
        }
        if let Some(fwd_status) = self.fwd_status {
            write!(f, "; fwd-status={fwd_status}")?;
        }
        if let Some(ttl) = self.ttl {
            write!(f, "; ttl={ttl}")?;
        }
        if self.stored {
            write!(f, "; stored")?;
        }
        if self.collapsed {
            write!(f, "; collapsed")?;
        }
        if let Some(key) = &self.key {
            write!(f, "; key={key}")?;
        }
        if let Some(detail) = &self.detail {
            write!(f, "; detail=\"{detail}\"")?;
        }
        Ok(())
    }
}

fn unquote(value: &str) -> String {
    value.trim_matches('"').to_string()
}
