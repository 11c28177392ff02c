use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bincode::{Decode, Encode};
use http::HeaderMap;

use super::key::VarySnapshot;

/// Metadata for one cached variant. Owned exclusively by the journal;
/// removal goes through journal APIs so the body blob is removed with it.
#[derive(Debug, Clone)]
pub(crate) struct CacheEntry {
    pub secondary_key: String,
    pub created: SystemTime,
    pub reason: String,
    pub declared_length: Option<u64>,
    pub headers: HeaderMap,
    pub vary: VarySnapshot,
    pub hit_count: u64,
    pub last_access: SystemTime,
    /// Actual blob length, zero until the body has been fully written.
    pub body_size: u64,
}

/// On-disk encoding of a [`CacheEntry`]. Timestamps are (seconds, nanos)
/// pairs since the epoch.
#[derive(Debug, Encode, Decode)]
pub(crate) struct PersistedEntry {
    pub secondary_key: String,
    pub created: (u64, u32),
    pub reason: String,
    pub declared_length: Option<u64>,
    pub headers: Vec<(String, String)>,
    pub vary_headers: Vec<(String, String)>,
    pub hit_count: u64,
    pub last_access: (u64, u32),
    pub body_size: u64,
}

impl CacheEntry {
    pub fn to_persisted(&self) -> PersistedEntry {
        PersistedEntry {
            secondary_key: self.secondary_key.clone(),
            created: encode_time(self.created),
            reason: self.reason.clone(),
            declared_length: self.declared_length,
            headers: headermap_to_vec(&self.headers),
            vary_headers: self.vary.pairs().to_vec(),
            hit_count: self.hit_count,
            last_access: encode_time(self.last_access),
            body_size: self.body_size,
        }
    }

    pub fn from_persisted(persisted: PersistedEntry) -> Self {
        Self {
            secondary_key: persisted.secondary_key,
            created: decode_time(persisted.created),
            reason: persisted.reason,
            declared_length: persisted.declared_length,
            headers: to_headermap(&persisted.headers),
            vary: VarySnapshot::from_pairs(persisted.vary_headers),
            hit_count: persisted.hit_count,
            last_access: decode_time(persisted.last_access),
            body_size: persisted.body_size,
        }
    }
}

fn encode_time(time: SystemTime) -> (u64, u32) {
    let since_epoch = time.duration_since(UNIX_EPOCH).unwrap_or_default();
    (since_epoch.as_secs(), since_epoch.subsec_nanos())
}

fn decode_time((secs, nanos): (u64, u32)) -> SystemTime {
    UNIX_EPOCH + Duration::new(secs, nanos)
}

pub(crate) fn to_headermap(items: &[(String, String)]) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in items {
        if let (Ok(name), Ok(value)) = (
            http::header::HeaderName::try_from(name.as_str()),
            http::HeaderValue::from_str(value),
        ) {
            map.append(name, value);
        }
    }
    map
}

pub(crate) fn headermap_to_vec(map: &HeaderMap) -> Vec<(String, String)> {
    let mut items = Vec::new();
    for (name, value) in map.iter() {
        if let Ok(value_str) = value.to_str() {
            items.push((name.as_str().to_string(), value_str.to_string()));
        }
    }
    items
}
