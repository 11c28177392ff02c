mod blob;
mod entry;
mod freshness;
mod journal;
mod key;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{Context, Error, Result, anyhow, ensure};
use async_trait::async_trait;
use futures::StreamExt;
use http::{HeaderMap, Method, StatusCode};
use tokio::fs as async_fs;
use tracing::{debug, error, warn};

use crate::body::BodyStream;
use crate::headers::cache_control::CacheControl;
use crate::headers::cache_status::{CACHE_STATUS, CacheStatus, ForwardReason};
use crate::pipeline::{ErrorAction, Interceptor, RequestAction, ResponseAction};
use crate::request::HttpRequest;
use crate::response::StreamedResponse;

use blob::{BlobStore, BlobWriter, DiskStore, MemoryStore};
use entry::CacheEntry;
use freshness::Freshness;
use journal::Journal;
use key::VarySnapshot;

const DEFAULT_MAX_CACHE_SIZE: u64 = 100 * 1024 * 1024;
const DEFAULT_CACHE_NAME: &str = "fetchpipe";

#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// Upper bound on the summed size of stored bodies. Exceeding it
    /// triggers frecency eviction.
    pub max_cache_size: u64,
    /// A private cache may store responses marked `Cache-Control: private`;
    /// a shared one skips them.
    pub private: bool,
    /// Name emitted in the Cache-Status header.
    pub cache_name: String,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            max_cache_size: DEFAULT_MAX_CACHE_SIZE,
            private: true,
            cache_name: DEFAULT_CACHE_NAME.to_string(),
        }
    }
}

impl CacheOptions {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.max_cache_size > 0,
            "max_cache_size must be greater than 0 (got {})",
            self.max_cache_size
        );
        ensure!(!self.cache_name.is_empty(), "cache_name must not be empty");
        ensure!(
            self.cache_name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'),
            "cache_name must be a header-safe token (got {:?})",
            self.cache_name
        );
        Ok(())
    }
}

/// Caching interceptor: serves fresh GET responses without contacting the
/// origin, revalidates stale ones, and falls back to stale content inside
/// the stale-while-revalidate and stale-if-error windows.
///
/// Cloning shares the underlying journal and blob store, so one handle can
/// sit in the pipeline while another drives `clear` or inspection.
#[derive(Clone)]
pub struct HttpCache {
    state: Arc<CacheState>,
}

struct CacheState {
    journal: Journal,
    blobs: Arc<dyn BlobStore>,
    options: CacheOptions,
}

impl HttpCache {
    /// Cache rooted at a directory: `journal` plus one file per stored
    /// body. Unknown files under the directory are pruned, and journal and
    /// blobs are reconciled against each other.
    pub async fn local(dir: impl Into<PathBuf>, options: CacheOptions) -> Result<Self> {
        options.validate()?;
        let dir = dir.into();
        async_fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create cache dir {}", dir.display()))?;
        let store = DiskStore::open(&dir).await?;
        store.prune_unknown_files().await?;
        let journal = Journal::open(&dir).await?;
        let cache = Self {
            state: Arc::new(CacheState {
                journal,
                blobs: Arc::new(store),
                options,
            }),
        };
        cache.reconcile().await?;
        Ok(cache)
    }

    /// Process-scoped cache with no persistence.
    pub fn in_memory(options: CacheOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            state: Arc::new(CacheState {
                journal: Journal::in_memory(),
                blobs: Arc::new(MemoryStore::new()),
                options,
            }),
        })
    }

    /// Drops orphan blobs and entries whose blob is gone, whichever side
    /// is stale after an unclean shutdown.
    async fn reconcile(&self) -> Result<()> {
        let known = self.state.journal.secondary_keys();
        let on_disk = self.state.blobs.keys().await?;
        for key in &on_disk {
            if !known.contains(key) {
                debug!(key, "removing orphan cache blob");
                self.state.blobs.remove(key).await;
            }
        }
        let on_disk: std::collections::HashSet<String> = on_disk.into_iter().collect();
        for (primary, entry) in self.state.journal.entries() {
            if !on_disk.contains(&entry.secondary_key) {
                debug!(key = %entry.secondary_key, "dropping cache entry without body");
                self.state.journal.remove(&primary, &entry.secondary_key);
            }
        }
        Ok(())
    }

    /// Removes every entry and blob, then persists the empty journal.
    pub async fn clear(&self) -> Result<()> {
        for entry in self.state.journal.clear() {
            self.state.blobs.remove(&entry.secondary_key).await;
        }
        self.state.journal.flush_now().await
    }

    /// Removes entries whose stored response is marked private.
    pub async fn delete_private_content(&self) -> Result<()> {
        for (primary, entry) in self.state.journal.entries() {
            if CacheControl::parse(&entry.headers).private {
                self.state.journal.remove(&primary, &entry.secondary_key);
                self.state.blobs.remove(&entry.secondary_key).await;
            }
        }
        self.state.journal.flush_now().await
    }

    fn own_hit(&self, response: &StreamedResponse) -> bool {
        for value in response.headers.get_all(&CACHE_STATUS) {
            if let Ok(raw) = value.to_str()
                && let Some(status) = CacheStatus::parse(raw)
                && status.cache_name == self.state.options.cache_name
                && status.hit
            {
                return true;
            }
        }
        false
    }

    async fn invalidate_url(&self, url: &http::Uri) {
        let primary = key::primary_key(url);
        let removed = self.state.journal.remove_primary(&primary);
        if removed.is_empty() {
            return;
        }
        debug!(url = %url, count = removed.len(), "invalidating cache entries");
        for entry in removed {
            self.state.blobs.remove(&entry.secondary_key).await;
        }
    }

    /// Removes whatever this cache holds for the variant a `no-store`
    /// response addresses, so nothing stale survives the directive.
    async fn purge_variant(&self, primary: &str, request_headers: &HeaderMap) {
        for entry in self.state.journal.lookup(primary) {
            if entry.vary.matches(request_headers) {
                self.state.journal.remove(primary, &entry.secondary_key);
                self.state.blobs.remove(&entry.secondary_key).await;
            }
        }
    }

    /// Rebuilds a response from a stored entry, replaying the blob and
    /// marking the result as a hit.
    async fn cached_response(
        &self,
        primary: &str,
        entry: &CacheEntry,
        freshness: &Freshness,
        request: HttpRequest,
        now: SystemTime,
    ) -> Result<StreamedResponse> {
        let body = self
            .state
            .blobs
            .reader(&entry.secondary_key)
            .await?
            .ok_or_else(|| anyhow!("cache body missing for {}", entry.secondary_key))?;
        let mut status = CacheStatus::hit(self.state.options.cache_name.as_str()).with_key(primary);
        if let Some(ttl) = freshness.ttl_seconds(now) {
            status = status.with_ttl(ttl);
        }
        let mut headers = entry.headers.clone();
        headers.insert(CACHE_STATUS, status.to_header_value());
        let content_length = if entry.body_size > 0 {
            Some(entry.body_size)
        } else {
            entry.declared_length
        };
        Ok(StreamedResponse {
            status: StatusCode::OK,
            reason: entry.reason.clone(),
            content_length,
            headers,
            body,
            request,
        })
    }

    /// A 304 from the origin: overlay the validator metadata onto the
    /// stored entry and replay the stored body.
    async fn revalidated(&self, primary: &str, response: StreamedResponse) -> ResponseAction {
        use http::header::{CACHE_CONTROL, DATE, ETAG, EXPIRES, LAST_MODIFIED, VARY, WARNING};

        let matched = self
            .state
            .journal
            .lookup(primary)
            .into_iter()
            .find(|entry| entry.vary.matches(&response.request.headers));
        let Some(matched) = matched else {
            return ResponseAction::Next(response);
        };

        let now = SystemTime::now();
        let updated = self
            .state
            .journal
            .update(primary, &matched.secondary_key, |stored| {
                for name in [CACHE_CONTROL, DATE, ETAG, EXPIRES, LAST_MODIFIED, VARY, WARNING] {
                    if let Some(value) = response.headers.get(&name) {
                        stored.headers.insert(name, value.clone());
                    }
                }
                stored.last_access = now;
            });
        let Some(updated) = updated else {
            return ResponseAction::Next(response);
        };

        let freshness = Freshness::evaluate(&updated.headers, updated.created, now);
        match self
            .cached_response(primary, &updated, &freshness, response.request.clone(), now)
            .await
        {
            Ok(replay) => {
                debug!(url = %response.request.url, "revalidated cache entry");
                ResponseAction::Resolve(replay)
            }
            Err(err) => {
                error!(error = %err, "failed to replay revalidated entry");
                ResponseAction::Next(response)
            }
        }
    }
}

#[async_trait]
impl Interceptor for HttpCache {
    async fn on_request(&self, mut request: HttpRequest) -> RequestAction {
        if matches!(
            request.method,
            Method::PUT | Method::POST | Method::DELETE | Method::PATCH
        ) {
            self.invalidate_url(&request.url).await;
            return RequestAction::Next(request);
        }
        if request.method != Method::GET {
            return RequestAction::Next(request);
        }
        if CacheControl::parse(&request.headers).no_store {
            debug!(url = %request.url, "request opted out of caching");
            return RequestAction::Next(request);
        }

        let primary = key::primary_key(&request.url);
        let matched = self
            .state
            .journal
            .lookup(&primary)
            .into_iter()
            .find(|entry| entry.vary.matches(&request.headers));
        let Some(entry) = matched else {
            debug!(url = %request.url, "cache miss");
            return RequestAction::Next(request);
        };
        // The blob may legitimately be absent while the first write is
        // still in flight; treat it as a miss either way.
        if !self.state.blobs.contains(&entry.secondary_key).await {
            debug!(key = %entry.secondary_key, "cache body not present, treating as miss");
            return RequestAction::Next(request);
        }

        if let Some(etag) = entry.headers.get(http::header::ETAG) {
            request
                .headers
                .insert(http::header::IF_NONE_MATCH, etag.clone());
        }
        if let Some(modified) = entry.headers.get(http::header::LAST_MODIFIED) {
            request
                .headers
                .insert(http::header::IF_MODIFIED_SINCE, modified.clone());
        }

        let now = SystemTime::now();
        let freshness = Freshness::evaluate(&entry.headers, entry.created, now);

        if !freshness.needs_revalidation {
            self.state
                .journal
                .record_hit(&primary, &entry.secondary_key, now);
            return match self
                .cached_response(&primary, &entry, &freshness, request.clone(), now)
                .await
            {
                Ok(response) => {
                    debug!(url = %request.url, "cache hit");
                    RequestAction::Resolve {
                        response,
                        skip_response_stages: false,
                    }
                }
                Err(err) => {
                    error!(error = %err, "failed to read cached body");
                    RequestAction::Next(request)
                }
            };
        }

        if freshness.is_stale_while_revalidate {
            self.state
                .journal
                .record_hit(&primary, &entry.secondary_key, now);
            return match self
                .cached_response(&primary, &entry, &freshness, request.clone(), now)
                .await
            {
                Ok(response) => {
                    debug!(url = %request.url, "serving stale, revalidating in background");
                    RequestAction::ResolveAndNext {
                        response,
                        skip_response_stages: false,
                    }
                }
                Err(err) => {
                    error!(error = %err, "failed to read cached body");
                    RequestAction::Next(request)
                }
            };
        }

        RequestAction::Next(request)
    }

    async fn on_response(&self, mut response: StreamedResponse) -> ResponseAction {
        if response.request.method != Method::GET {
            return ResponseAction::Next(response);
        }
        // A hit this cache produced is already final; reprocessing it here
        // would loop the stored body back into the store.
        if self.own_hit(&response) {
            return ResponseAction::Next(response);
        }
        if CacheControl::parse(&response.request.headers).no_store {
            let status =
                CacheStatus::forward(self.state.options.cache_name.as_str(), ForwardReason::Bypass);
            response.headers.insert(CACHE_STATUS, status.to_header_value());
            return ResponseAction::Next(response);
        }

        let primary = key::primary_key(&response.request.url);
        let cc = CacheControl::parse(&response.headers);
        if cc.private && !self.state.options.private {
            debug!(url = %response.request.url, "skipping private response in shared cache");
            return ResponseAction::Next(response);
        }
        if cc.no_store {
            debug!(url = %response.request.url, "response forbids storage");
            self.purge_variant(&primary, &response.request.headers).await;
            return ResponseAction::Next(response);
        }
        let vary_star = response
            .headers
            .get_all(http::header::VARY)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .any(|value| value.split(',').any(|name| name.trim() == "*"));
        if vary_star {
            debug!(url = %response.request.url, "Vary: * response is not cacheable");
            return ResponseAction::Next(response);
        }
        if response.status == StatusCode::NOT_MODIFIED {
            return self.revalidated(&primary, response).await;
        }
        if response.status != StatusCode::OK {
            return ResponseAction::Next(response);
        }

        let Some(vary) = VarySnapshot::from_response(&response.headers, &response.request.headers)
        else {
            return ResponseAction::Next(response);
        };
        let secondary = key::secondary_key(&response.request.url, &vary);
        let now = SystemTime::now();
        let prior = self.state.journal.get(&primary, &secondary);

        let writer = match self.state.blobs.writer(&secondary).await {
            Ok(writer) => writer,
            Err(err) => {
                error!(error = %err, "failed to open cache body writer");
                return ResponseAction::Next(response);
            }
        };

        let entry = CacheEntry {
            secondary_key: secondary.clone(),
            created: now,
            reason: response.reason.clone(),
            declared_length: response.content_length,
            headers: response.headers.clone(),
            vary,
            hit_count: prior.as_ref().map_or(0, |p| p.hit_count),
            last_access: now,
            body_size: 0,
        };
        self.state.journal.insert(&primary, entry);

        let (client_side, store_side) = response.take_body().tee();
        response.body = client_side;

        let state = self.state.clone();
        let task_primary = primary.clone();
        tokio::spawn(async move {
            state
                .write_blob(task_primary, secondary, prior, store_side, writer)
                .await;
        });

        let status = CacheStatus::forward(self.state.options.cache_name.as_str(), ForwardReason::UriMiss)
            .with_fwd_status(response.status.as_u16())
            .stored()
            .with_key(primary.as_str());
        response.headers.insert(CACHE_STATUS, status.to_header_value());
        ResponseAction::Next(response)
    }

    async fn on_error(&self, request: HttpRequest, error: Error) -> ErrorAction {
        if request.method != Method::GET {
            return ErrorAction::Next { request, error };
        }
        let primary = key::primary_key(&request.url);
        let matched = self
            .state
            .journal
            .lookup(&primary)
            .into_iter()
            .find(|entry| entry.vary.matches(&request.headers));
        if let Some(entry) = matched {
            let now = SystemTime::now();
            let freshness = Freshness::evaluate(&entry.headers, entry.created, now);
            if freshness.is_stale_if_error && self.state.blobs.contains(&entry.secondary_key).await
            {
                self.state
                    .journal
                    .record_hit(&primary, &entry.secondary_key, now);
                match self
                    .cached_response(&primary, &entry, &freshness, request.clone(), now)
                    .await
                {
                    Ok(response) => {
                        warn!(
                            url = %request.url,
                            error = %error,
                            "serving stale response after failure"
                        );
                        return ErrorAction::Resolve(response);
                    }
                    Err(err) => error!(error = %err, "failed to read cached body"),
                }
            }
        }
        ErrorAction::Next { request, error }
    }

    async fn dispose(&self) {
        if let Err(err) = self.state.journal.dispose().await {
            error!(error = %err, "failed to flush journal on dispose");
        }
    }
}

impl CacheState {
    /// Consumes the tee'd store side, then either finalizes the entry or
    /// rolls the journal back to its previous state. Failures stay here;
    /// the caller's copy of the body is unaffected.
    async fn write_blob(
        &self,
        primary: String,
        secondary: String,
        prior: Option<CacheEntry>,
        mut source: BodyStream,
        mut writer: Box<dyn BlobWriter>,
    ) {
        let mut failure: Option<Error> = None;
        while let Some(chunk) = source.next().await {
            match chunk {
                Ok(bytes) => {
                    if let Err(err) = writer.write(&bytes).await {
                        failure = Some(err);
                        break;
                    }
                }
                Err(err) => {
                    failure = Some(err.into());
                    break;
                }
            }
        }

        match failure {
            None => match writer.finish().await {
                Ok(written) => {
                    let updated = self
                        .journal
                        .update(&primary, &secondary, |entry| entry.body_size = written);
                    if updated.is_none() {
                        // The entry vanished mid-write (invalidation or
                        // clear); don't leave an unreferenced blob behind.
                        self.blobs.remove(&secondary).await;
                        return;
                    }
                    self.enforce_size_limit().await;
                }
                Err(err) => {
                    error!(error = %err, "failed to finalize cache body");
                    self.restore(&primary, &secondary, prior);
                }
            },
            Some(err) => {
                error!(error = %err, "cache body write failed; discarding entry");
                writer.discard().await;
                self.restore(&primary, &secondary, prior);
            }
        }
    }

    fn restore(&self, primary: &str, secondary: &str, prior: Option<CacheEntry>) {
        match prior {
            // The previous blob is still in place, so the previous entry
            // is valid again.
            Some(entry) => {
                self.journal.insert(primary, entry);
            }
            None => {
                self.journal.remove(primary, secondary);
            }
        }
    }

    /// Frecency eviction: drop the lowest scoring entries until the total
    /// fits the configured maximum.
    async fn enforce_size_limit(&self) {
        let max = self.options.max_cache_size;
        loop {
            let now = SystemTime::now();
            let victim = {
                let entries = self.journal.entries();
                let total: u64 = entries.iter().map(|(_, entry)| entry.body_size).sum();
                if total <= max {
                    break;
                }
                entries.into_iter().min_by(|(_, a), (_, b)| {
                    frecency_score(a, now)
                        .partial_cmp(&frecency_score(b, now))
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| a.last_access.cmp(&b.last_access))
                })
            };
            let Some((primary, entry)) = victim else {
                break;
            };
            debug!(key = %entry.secondary_key, "evicting cache entry");
            self.journal.remove(&primary, &entry.secondary_key);
            self.blobs.remove(&entry.secondary_key).await;
        }
    }
}

fn frecency_score(entry: &CacheEntry, now: SystemTime) -> f64 {
    let idle = now
        .duration_since(entry.last_access)
        .unwrap_or_default()
        .as_secs();
    entry.hit_count as f64 / (idle + 1) as f64
}
