use std::collections::{HashMap, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result, bail};
use bincode::{Decode, Encode};
use parking_lot::Mutex;
use tokio::fs as async_fs;
use tokio::io::AsyncWriteExt;
use tracing::{error, warn};
use uuid::Uuid;

use super::entry::{CacheEntry, PersistedEntry};

pub(crate) const JOURNAL_FILE: &str = "journal";

const SNAPSHOT_VERSION: u32 = 1;
const FLUSH_DEBOUNCE: Duration = Duration::from_secs(1);

#[derive(Encode, Decode)]
struct JournalSnapshot {
    version: u32,
    entries: HashMap<String, HashMap<String, PersistedEntry>>,
}

/// Index of every cache entry, keyed by primary then secondary key.
///
/// All mutation goes through these methods; each one is a discrete map
/// operation under the lock, so concurrent readers always observe a
/// consistent view. Mutations schedule a debounced snapshot write when the
/// journal is file-backed.
#[derive(Clone)]
pub(crate) struct Journal {
    inner: Arc<JournalInner>,
}

struct JournalInner {
    path: Option<PathBuf>,
    state: Mutex<JournalState>,
}

struct JournalState {
    entries: HashMap<String, HashMap<String, CacheEntry>>,
    /// Bumped on every mutation; the debounce task flushes once it stops
    /// moving for a full window.
    generation: u64,
    flush_scheduled: bool,
}

impl Journal {
    pub fn in_memory() -> Self {
        Self::with_entries(None, HashMap::new())
    }

    /// Reads the snapshot under `dir`. A missing or unreadable snapshot
    /// yields an empty journal that is persisted immediately.
    pub async fn open(dir: &Path) -> Result<Self> {
        let path = dir.join(JOURNAL_FILE);
        let entries = match async_fs::read(&path).await {
            Ok(bytes) => match decode_snapshot(&bytes) {
                Ok(entries) => Some(entries),
                Err(err) => {
                    warn!(
                        error = %err,
                        path = %path.display(),
                        "journal snapshot unreadable; starting empty"
                    );
                    None
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => None,
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read journal {}", path.display()));
            }
        };

        match entries {
            Some(entries) => Ok(Self::with_entries(Some(path), entries)),
            None => {
                let journal = Self::with_entries(Some(path), HashMap::new());
                journal.flush_now().await?;
                Ok(journal)
            }
        }
    }

    fn with_entries(
        path: Option<PathBuf>,
        entries: HashMap<String, HashMap<String, CacheEntry>>,
    ) -> Self {
        Self {
            inner: Arc::new(JournalInner {
                path,
                state: Mutex::new(JournalState {
                    entries,
                    generation: 0,
                    flush_scheduled: false,
                }),
            }),
        }
    }

    /// Every variant stored under a primary key.
    pub fn lookup(&self, primary: &str) -> Vec<CacheEntry> {
        let state = self.inner.state.lock();
        state
            .entries
            .get(primary)
            .map(|variants| variants.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get(&self, primary: &str, secondary: &str) -> Option<CacheEntry> {
        let state = self.inner.state.lock();
        state
            .entries
            .get(primary)
            .and_then(|variants| variants.get(secondary))
            .cloned()
    }

    /// Inserts an entry, returning the one it displaced.
    pub fn insert(&self, primary: &str, entry: CacheEntry) -> Option<CacheEntry> {
        self.mutate(|entries| {
            entries
                .entry(primary.to_string())
                .or_default()
                .insert(entry.secondary_key.clone(), entry)
        })
    }

    /// Removes one variant; an emptied primary mapping is removed with it.
    pub fn remove(&self, primary: &str, secondary: &str) -> Option<CacheEntry> {
        self.mutate(|entries| {
            let variants = entries.get_mut(primary)?;
            let removed = variants.remove(secondary);
            if variants.is_empty() {
                entries.remove(primary);
            }
            removed
        })
    }

    /// Removes every variant under a primary key.
    pub fn remove_primary(&self, primary: &str) -> Vec<CacheEntry> {
        self.mutate(|entries| {
            entries
                .remove(primary)
                .map(|variants| variants.into_values().collect())
                .unwrap_or_default()
        })
    }

    /// Applies `apply` to one entry, returning the updated copy.
    pub fn update<F>(&self, primary: &str, secondary: &str, apply: F) -> Option<CacheEntry>
    where
        F: FnOnce(&mut CacheEntry),
    {
        self.mutate(|entries| {
            let entry = entries.get_mut(primary)?.get_mut(secondary)?;
            apply(entry);
            Some(entry.clone())
        })
    }

    pub fn record_hit(&self, primary: &str, secondary: &str, now: SystemTime) {
        self.update(primary, secondary, |entry| {
            entry.hit_count += 1;
            entry.last_access = now;
        });
    }

    pub fn total_size(&self) -> u64 {
        let state = self.inner.state.lock();
        state
            .entries
            .values()
            .flat_map(|variants| variants.values())
            .map(|entry| entry.body_size)
            .sum()
    }

    /// Flat view of every entry as (primary key, entry) pairs.
    pub fn entries(&self) -> Vec<(String, CacheEntry)> {
        let state = self.inner.state.lock();
        state
            .entries
            .iter()
            .flat_map(|(primary, variants)| {
                variants
                    .values()
                    .map(|entry| (primary.clone(), entry.clone()))
            })
            .collect()
    }

    pub fn secondary_keys(&self) -> HashSet<String> {
        let state = self.inner.state.lock();
        state
            .entries
            .values()
            .flat_map(|variants| variants.keys().cloned())
            .collect()
    }

    pub fn clear(&self) -> Vec<CacheEntry> {
        self.mutate(|entries| {
            entries
                .drain()
                .flat_map(|(_, variants)| variants.into_values())
                .collect()
        })
    }

    fn mutate<R>(&self, apply: impl FnOnce(&mut HashMap<String, HashMap<String, CacheEntry>>) -> R) -> R {
        let (result, spawn_flush) = {
            let mut state = self.inner.state.lock();
            let result = apply(&mut state.entries);
            state.generation += 1;
            let spawn = self.inner.path.is_some() && !state.flush_scheduled;
            if spawn {
                state.flush_scheduled = true;
            }
            (result, spawn)
        };
        if spawn_flush {
            let journal = self.clone();
            tokio::spawn(async move {
                journal.debounced_flush().await;
            });
        }
        result
    }

    async fn debounced_flush(&self) {
        loop {
            let generation = self.inner.state.lock().generation;
            tokio::time::sleep(FLUSH_DEBOUNCE).await;
            if self.inner.state.lock().generation == generation {
                break;
            }
        }
        self.inner.state.lock().flush_scheduled = false;
        if let Err(err) = self.flush_now().await {
            error!(error = %err, "journal flush failed");
        }
    }

    /// Writes the snapshot via a temp file and rename, so the on-disk copy
    /// is always either the previous good snapshot or a complete new one.
    pub async fn flush_now(&self) -> Result<()> {
        let Some(path) = &self.inner.path else {
            return Ok(());
        };
        let payload = {
            let state = self.inner.state.lock();
            encode_snapshot(&state.entries)?
        };

        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let temp_path = dir.join(format!("tmp_{}", Uuid::new_v4().simple()));
        let mut options = async_fs::OpenOptions::new();
        options.create(true).truncate(true).write(true);
        #[cfg(unix)]
        {
            options.mode(0o600);
        }
        let mut file = options
            .open(&temp_path)
            .await
            .with_context(|| format!("failed to create journal temp {}", temp_path.display()))?;
        file.write_all(&payload).await?;
        file.flush().await?;
        drop(file);
        async_fs::rename(&temp_path, path)
            .await
            .with_context(|| format!("failed to publish journal {}", path.display()))?;
        Ok(())
    }

    /// Flushes any pending state. Called on pipeline close.
    pub async fn dispose(&self) -> Result<()> {
        self.flush_now().await
    }
}

fn encode_snapshot(entries: &HashMap<String, HashMap<String, CacheEntry>>) -> Result<Vec<u8>> {
    let snapshot = JournalSnapshot {
        version: SNAPSHOT_VERSION,
        entries: entries
            .iter()
            .map(|(primary, variants)| {
                let persisted = variants
                    .iter()
                    .map(|(secondary, entry)| (secondary.clone(), entry.to_persisted()))
                    .collect();
                (primary.clone(), persisted)
            })
            .collect(),
    };
    let body = bincode::encode_to_vec(&snapshot, bincode::config::standard())
        .context("failed to encode journal snapshot")?;
    let mut payload = Vec::with_capacity(body.len() + 4);
    payload.extend_from_slice(&(body.len() as u32).to_le_bytes());
    payload.extend_from_slice(&body);
    Ok(payload)
}

fn decode_snapshot(bytes: &[u8]) -> Result<HashMap<String, HashMap<String, CacheEntry>>> {
    if bytes.len() < 4 {
        bail!("journal snapshot truncated");
    }
    let declared = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    let body = &bytes[4..];
    if body.len() != declared {
        bail!(
            "journal snapshot length mismatch: declared {declared}, found {}",
            body.len()
        );
    }
    let (snapshot, _): (JournalSnapshot, usize) =
        bincode::decode_from_slice(body, bincode::config::standard())
            .context("failed to decode journal snapshot")?;
    if snapshot.version != SNAPSHOT_VERSION {
        bail!("unsupported journal version {}", snapshot.version);
    }
    Ok(snapshot
        .entries
        .into_iter()
        .map(|(primary, variants)| {
            let restored = variants
                .into_iter()
                .map(|(secondary, persisted)| (secondary, CacheEntry::from_persisted(persisted)))
                .collect();
            (primary, restored)
        })
        .collect())
}
