use http::{HeaderMap, Uri};
use uuid::Uuid;

/// Hash of the request URL, grouping every cached variant of that URL.
/// UUIDv5 in the URL namespace, so the value is byte-identical across
/// platforms and runs.
pub(crate) fn primary_key(url: &Uri) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, url.to_string().as_bytes())
        .simple()
        .to_string()
}

/// Hash naming one cached variant: the URL joined with the sorted vary
/// snapshot. Doubles as the blob file name.
pub(crate) fn secondary_key(url: &Uri, vary: &VarySnapshot) -> String {
    let seed = format!("{}|{}", url, vary.join());
    Uuid::new_v5(&Uuid::NAMESPACE_URL, seed.as_bytes())
        .simple()
        .to_string()
}

/// The request-side header values a variant was stored under, sorted by
/// lowercased name. A header the request did not send is recorded as the
/// empty string, so "absent" must match like any other value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct VarySnapshot {
    pairs: Vec<(String, String)>,
}

impl VarySnapshot {
    pub fn from_pairs(mut pairs: Vec<(String, String)>) -> Self {
        for (name, _) in pairs.iter_mut() {
            name.make_ascii_lowercase();
        }
        pairs.sort();
        pairs.dedup_by(|a, b| a.0 == b.0);
        Self { pairs }
    }

    /// Snapshot for the variant a response declares via `Vary`. `None`
    /// when the response carries `Vary: *`, which is never cacheable.
    pub fn from_response(resp_headers: &HeaderMap, req_headers: &HeaderMap) -> Option<Self> {
        let mut pairs = Vec::new();
        for value in resp_headers.get_all(http::header::VARY) {
            let Ok(list) = value.to_str() else { continue };
            for name in list.split(',') {
                let name = name.trim();
                if name == "*" {
                    return None;
                }
                if name.is_empty() {
                    continue;
                }
                let lowered = name.to_ascii_lowercase();
                let request_value = req_headers
                    .get(&lowered)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                pairs.push((lowered, request_value));
            }
        }
        Some(Self::from_pairs(pairs))
    }

    /// True when every recorded pair equals the request's value for that
    /// header, case-insensitive on names and exact on values. Extra
    /// request headers are fine.
    pub fn matches(&self, req_headers: &HeaderMap) -> bool {
        self.pairs.iter().all(|(name, value)| {
            let request_value = req_headers
                .get(name.as_str())
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default();
            request_value == value
        })
    }

    pub fn pairs(&self) -> &[(String, String)] {
        &self.pairs
    }

    fn join(&self) -> String {
        let rendered: Vec<String> = self
            .pairs
            .iter()
            .map(|(name, value)| format!("{name}:{value}"))
            .collect();
        rendered.join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn url(s: &str) -> Uri {
        s.parse().expect("test uri")
    }

    #[test]
    fn primary_key_is_deterministic_and_url_sensitive() {
        let a = primary_key(&url("https://example.com/a?x=1"));
        let b = primary_key(&url("https://example.com/a?x=1"));
        let c = primary_key(&url("https://example.com/a?x=2"));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 32);
        assert!(a.bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[test]
    fn hosts_do_not_share_primary_keys() {
        let a = primary_key(&url("https://alpha.example.com/shared"));
        let b = primary_key(&url("https://beta.example.com/shared"));
        assert_ne!(a, b);
    }

    #[test]
    fn secondary_key_without_vary_differs_from_varied_key() {
        let target = url("https://example.com/a");
        let bare = secondary_key(&target, &VarySnapshot::default());
        let varied = secondary_key(
            &target,
            &VarySnapshot::from_pairs(vec![("user-agent".into(), "mobile".into())]),
        );
        assert_ne!(bare, varied);
        assert_ne!(bare, primary_key(&target));
    }

    #[test]
    fn secondary_key_is_order_insensitive() {
        let target = url("https://example.com/a");
        let one = VarySnapshot::from_pairs(vec![
            ("accept".into(), "text/html".into()),
            ("user-agent".into(), "mobile".into()),
        ]);
        let two = VarySnapshot::from_pairs(vec![
            ("User-Agent".into(), "mobile".into()),
            ("Accept".into(), "text/html".into()),
        ]);
        assert_eq!(secondary_key(&target, &one), secondary_key(&target, &two));
    }

    #[test]
    fn snapshot_from_response_records_request_values() {
        let mut resp = HeaderMap::new();
        resp.insert(http::header::VARY, HeaderValue::from_static("User-Agent"));
        let mut req = HeaderMap::new();
        req.insert("user-agent", HeaderValue::from_static("mobile"));

        let snapshot = VarySnapshot::from_response(&resp, &req).unwrap();
        assert_eq!(snapshot.pairs(), [("user-agent".to_string(), "mobile".to_string())]);
    }

    #[test]
    fn snapshot_rejects_vary_star() {
        let mut resp = HeaderMap::new();
        resp.insert(http::header::VARY, HeaderValue::from_static("*"));
        assert!(VarySnapshot::from_response(&resp, &HeaderMap::new()).is_none());
    }

    #[test]
    fn absent_request_header_is_recorded_as_empty() {
        let mut resp = HeaderMap::new();
        resp.insert(
            http::header::VARY,
            HeaderValue::from_static("Accept-Language"),
        );
        let snapshot = VarySnapshot::from_response(&resp, &HeaderMap::new()).unwrap();
        assert_eq!(
            snapshot.pairs(),
            [("accept-language".to_string(), String::new())]
        );

        // A request that still lacks the header matches; one that sends a
        // value does not.
        assert!(snapshot.matches(&HeaderMap::new()));
        let mut with_value = HeaderMap::new();
        with_value.insert("accept-language", HeaderValue::from_static("de"));
        assert!(!snapshot.matches(&with_value));
    }

    #[test]
    fn matches_is_exact_on_values() {
        let snapshot = VarySnapshot::from_pairs(vec![("user-agent".into(), "mobile".into())]);
        let mut matching = HeaderMap::new();
        matching.insert("user-agent", HeaderValue::from_static("mobile"));
        matching.insert("accept", HeaderValue::from_static("text/html"));
        assert!(snapshot.matches(&matching), "extra headers are allowed");

        let mut differing = HeaderMap::new();
        differing.insert("user-agent", HeaderValue::from_static("desktop"));
        assert!(!snapshot.matches(&differing));
        assert!(!snapshot.matches(&HeaderMap::new()), "missing header mismatches");
    }
}
