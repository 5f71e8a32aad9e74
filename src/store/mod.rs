//! Persistent state store
//!
//! One directory shared by every vmgate process on the host. Per key:
//!
//! | File | Content |
//! |------|---------|
//! | `<key>.addr` | resolved IPv4 address |
//! | `<key>.active` | last-active watermark, unix seconds |
//! | `<key>.lock` | flock held while the records above are mutated |
//! | `<key>.lease` | flock held by whoever drives the backend resource |
//!
//! Records are replaced by write-to-temp + rename, so readers never see a
//! partial record and need no lock. The address and watermark records are
//! independent: either may exist without the other.

pub mod lock;
pub mod marker;

pub use lock::{FileLock, LockHolder};
pub use marker::{MarkerState, ReaperMarker};

use crate::error::{VmgateError, VmgateResult};
use crate::identity::ResourceKey;
use chrono::{DateTime, SubsecRound, TimeZone, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::io::{ErrorKind, Write};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::debug;

const ADDR_EXT: &str = "addr";
const ACTIVE_EXT: &str = "active";
const LOCK_EXT: &str = "lock";
const LEASE_EXT: &str = "lease";
const MARKER_FILE: &str = "reaper.pid";

/// Record locks are held for a read-modify-write only
const KEY_LOCK_INTERVAL: Duration = Duration::from_millis(10);
const KEY_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// Leases can be held for a full boot or shutdown
const LEASE_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Persisted state for one resource key
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateEntry {
    pub key: String,
    pub address: Option<Ipv4Addr>,
    pub last_active: Option<DateTime<Utc>>,
}

impl StateEntry {
    /// Whole minutes since the watermark, if one is recorded
    pub fn idle_minutes(&self, now: DateTime<Utc>) -> Option<i64> {
        self.last_active
            .map(|at| (now - at).num_seconds().max(0) / 60)
    }
}

/// Directory-backed key-value store of state entries
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    /// Open a store rooted at `dir`, creating the directory if needed
    pub async fn open(dir: impl Into<PathBuf>) -> VmgateResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| VmgateError::io(format!("creating state dir {}", dir.display()), e))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, key: &str, ext: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", key, ext))
    }

    /// Read the entry for a key; `None` when neither record exists
    pub async fn get(&self, key: &ResourceKey) -> VmgateResult<Option<StateEntry>> {
        let address = self.read_address(key.as_str()).await?;
        let last_active = self.read_watermark(key.as_str()).await?;

        if address.is_none() && last_active.is_none() {
            return Ok(None);
        }

        Ok(Some(StateEntry {
            key: key.as_str().to_string(),
            address,
            last_active,
        }))
    }

    /// Record a resolved address and stamp the watermark
    pub async fn put(&self, key: &ResourceKey, address: Ipv4Addr) -> VmgateResult<()> {
        let _guard = self.key_lock(key.as_str()).await?;

        if let Some(existing) = self.read_address(key.as_str()).await? {
            if existing != address {
                debug!(%key, %existing, %address, "Replacing stored address");
            }
        }

        self.write_record(key.as_str(), ADDR_EXT, address.to_string())
            .await?;
        self.raise_watermark(key.as_str(), Utc::now()).await?;

        debug!(%key, %address, "Stored address");
        Ok(())
    }

    /// Stamp the watermark with the current time
    pub async fn touch(&self, key: &ResourceKey) -> VmgateResult<DateTime<Utc>> {
        self.touch_at(key, Utc::now()).await
    }

    /// Raise the watermark to `at`; never moves it backwards.
    ///
    /// Returns the watermark after the update.
    pub async fn touch_at(
        &self,
        key: &ResourceKey,
        at: DateTime<Utc>,
    ) -> VmgateResult<DateTime<Utc>> {
        let _guard = self.key_lock(key.as_str()).await?;
        self.raise_watermark(key.as_str(), at).await
    }

    /// Delete both records of a key
    pub async fn delete(&self, key: &str) -> VmgateResult<()> {
        let _guard = self.key_lock(key).await?;

        for ext in [ADDR_EXT, ACTIVE_EXT] {
            let path = self.record_path(key, ext);
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(VmgateError::io(format!("removing {}", path.display()), e))
                }
            }
        }

        debug!(key, "Deleted state entry");
        Ok(())
    }

    /// Names of all keys with at least one record, sorted
    pub async fn list_keys(&self) -> VmgateResult<Vec<String>> {
        let mut keys = BTreeSet::new();
        let mut entries = fs::read_dir(&self.dir)
            .await
            .map_err(|e| VmgateError::io("reading state directory", e))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| VmgateError::io("reading state entry", e))?
        {
            let path = entry.path();
            let is_record = path
                .extension()
                .is_some_and(|ext| ext == ADDR_EXT || ext == ACTIVE_EXT);
            if !is_record {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                keys.insert(stem.to_string());
            }
        }

        Ok(keys.into_iter().collect())
    }

    /// Read an entry by record name, for keys that may no longer parse
    pub async fn get_by_name(&self, name: &str) -> VmgateResult<Option<StateEntry>> {
        let address = self.read_address(name).await?;
        let last_active = self.read_watermark(name).await?;
        if address.is_none() && last_active.is_none() {
            return Ok(None);
        }
        Ok(Some(StateEntry {
            key: name.to_string(),
            address,
            last_active,
        }))
    }

    /// Wait for the lifecycle lease of a key
    pub async fn lease(
        &self,
        key: &ResourceKey,
        purpose: &str,
        timeout: Duration,
    ) -> VmgateResult<FileLock> {
        let path = self.record_path(key.as_str(), LEASE_EXT);
        let mut lock = FileLock::acquire(&path, key.as_str(), LEASE_POLL_INTERVAL, timeout).await?;
        lock.record_holder(purpose)?;
        Ok(lock)
    }

    /// Take the lifecycle lease if nobody holds it
    pub fn try_lease(&self, key: &ResourceKey, purpose: &str) -> VmgateResult<Option<FileLock>> {
        let path = self.record_path(key.as_str(), LEASE_EXT);
        match FileLock::try_acquire(&path)? {
            Some(mut lock) => {
                lock.record_holder(purpose)?;
                Ok(Some(lock))
            }
            None => Ok(None),
        }
    }

    /// Who holds the lease of a key right now, if anyone.
    ///
    /// Reads the recorded holder instead of testing the lock, so it never
    /// makes a concurrent `try_lease` fail.
    pub fn lease_holder(&self, key: &str) -> Option<LockHolder> {
        LockHolder::read(&self.record_path(key, LEASE_EXT)).filter(LockHolder::is_alive)
    }

    /// Path of the reaper single-instance marker
    pub fn marker_path(&self) -> PathBuf {
        self.dir.join(MARKER_FILE)
    }

    async fn key_lock(&self, key: &str) -> VmgateResult<FileLock> {
        let path = self.record_path(key, LOCK_EXT);
        FileLock::acquire(&path, key, KEY_LOCK_INTERVAL, KEY_LOCK_TIMEOUT).await
    }

    async fn raise_watermark(&self, key: &str, at: DateTime<Utc>) -> VmgateResult<DateTime<Utc>> {
        // Records hold whole seconds
        let at = at.trunc_subsecs(0);
        let current = self.read_watermark(key).await?;
        let stamped = match current {
            Some(existing) if existing >= at => return Ok(existing),
            _ => at,
        };
        self.write_record(key, ACTIVE_EXT, stamped.timestamp().to_string())
            .await?;
        Ok(stamped)
    }

    async fn read_address(&self, key: &str) -> VmgateResult<Option<Ipv4Addr>> {
        let path = self.record_path(key, ADDR_EXT);
        let Some(content) = read_optional(&path).await? else {
            return Ok(None);
        };
        content
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: std::net::AddrParseError| VmgateError::CorruptRecord {
                path,
                reason: e.to_string(),
            })
    }

    async fn read_watermark(&self, key: &str) -> VmgateResult<Option<DateTime<Utc>>> {
        let path = self.record_path(key, ACTIVE_EXT);
        let Some(content) = read_optional(&path).await? else {
            return Ok(None);
        };
        let secs: i64 = content
            .trim()
            .parse()
            .map_err(|e: std::num::ParseIntError| VmgateError::CorruptRecord {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        Utc.timestamp_opt(secs, 0)
            .single()
            .map(Some)
            .ok_or_else(|| VmgateError::CorruptRecord {
                path,
                reason: format!("timestamp {} out of range", secs),
            })
    }

    /// Atomically replace a record via temp file + rename
    async fn write_record(&self, key: &str, ext: &str, content: String) -> VmgateResult<()> {
        let dir = self.dir.clone();
        let path = self.record_path(key, ext);

        tokio::task::spawn_blocking(move || -> VmgateResult<()> {
            let mut tmp = tempfile::NamedTempFile::new_in(&dir)
                .map_err(|e| VmgateError::io("creating temp record", e))?;
            tmp.write_all(content.as_bytes())
                .and_then(|()| tmp.as_file().sync_all())
                .map_err(|e| VmgateError::io("writing temp record", e))?;
            tmp.persist(&path)
                .map_err(|e| VmgateError::io(format!("replacing {}", path.display()), e.error))?;
            Ok(())
        })
        .await
        .map_err(|e| VmgateError::Internal(format!("record writer panicked: {}", e)))?
    }
}

async fn read_optional(path: &Path) -> VmgateResult<Option<String>> {
    match fs::read_to_string(path).await {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(VmgateError::io(format!("reading {}", path.display()), e)),
    }
}
