//! Reaper single-instance marker
//!
//! `reaper.pid` is held under an exclusive flock and records the owning pid.
//! A clean exit truncates it; content found on acquisition therefore belongs
//! to a reaper that died mid-sweep, and is replaced.

use crate::error::VmgateResult;
use crate::store::lock::{FileLock, LockHolder};
use std::path::Path;
use tracing::{debug, warn};

/// Outcome of trying to become the active reaper
#[derive(Debug)]
pub enum MarkerState {
    /// This process is the active reaper until the marker drops
    Acquired(ReaperMarker),
    /// Another live reaper holds the marker
    Held { holder: Option<LockHolder> },
}

/// Guard proving single-instance ownership of the reaper.
///
/// Dropping it clears the recorded pid and releases the lock.
#[derive(Debug)]
pub struct ReaperMarker {
    _lock: FileLock,
}

impl ReaperMarker {
    /// Try to take the marker at `path` without waiting
    pub fn try_acquire(path: &Path) -> VmgateResult<MarkerState> {
        let Some(mut lock) = FileLock::try_acquire(path)? else {
            let holder = LockHolder::read(path);
            debug!(?holder, "Reaper marker held by another process");
            return Ok(MarkerState::Held { holder });
        };

        if let Some(stale) = LockHolder::read(path) {
            warn!(
                pid = stale.pid,
                alive = stale.is_alive(),
                "Replacing reaper marker left by an interrupted sweep"
            );
        }

        lock.record_holder("reaper")?;
        Ok(MarkerState::Acquired(Self { _lock: lock }))
    }

    /// Recorded owner of the marker, read without taking the lock.
    ///
    /// A holder whose pid is gone was interrupted mid-sweep.
    pub fn inspect(path: &Path) -> Option<LockHolder> {
        LockHolder::read(path)
    }
}
