//! Activity tracking
//!
//! The last-active watermark of a key moves forward on every handoff and
//! whenever a sweep finds a live login session for the identity.

use crate::error::{VmgateError, VmgateResult};
use crate::identity::ResourceKey;
use crate::store::StateStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tracing::debug;

/// Answers whether an identity currently has a live session
#[async_trait]
pub trait SessionObserver: Send + Sync {
    async fn has_live_session(&self, identity: &str) -> VmgateResult<bool>;
}

/// Looks for session processes owned by the identity's local account
pub struct ProcessSessionObserver {
    process: String,
}

impl ProcessSessionObserver {
    pub fn new(process: impl Into<String>) -> Self {
        Self {
            process: process.into(),
        }
    }
}

#[async_trait]
impl SessionObserver for ProcessSessionObserver {
    async fn has_live_session(&self, identity: &str) -> VmgateResult<bool> {
        let output = Command::new("pgrep")
            .args(["-u", identity, "-x", &self.process])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| VmgateError::command_failed("pgrep", e))?;

        // pgrep: 0 match, 1 no match, anything else (unknown user too) is an error
        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(VmgateError::command_exec(
                format!("pgrep -u {} -x {}", identity, self.process),
                String::from_utf8_lossy(&output.stderr).trim(),
            )),
        }
    }
}

/// Moves last-active watermarks forward
#[derive(Clone)]
pub struct ActivityTracker {
    store: StateStore,
    sessions: Arc<dyn SessionObserver>,
}

impl ActivityTracker {
    pub fn new(store: StateStore, sessions: Arc<dyn SessionObserver>) -> Self {
        Self { store, sessions }
    }

    /// Stamp a handoff unconditionally
    pub async fn stamp_handoff(&self, key: &ResourceKey) -> VmgateResult<DateTime<Utc>> {
        let at = self.store.touch(key).await?;
        debug!(%key, %at, "Stamped handoff");
        Ok(at)
    }

    /// Stamp `now` if the identity has a live session.
    ///
    /// Returns whether a session was found.
    pub async fn refresh_if_live(&self, key: &ResourceKey, now: DateTime<Utc>) -> VmgateResult<bool> {
        if !self.sessions.has_live_session(key.identity()).await? {
            return Ok(false);
        }
        self.store.touch_at(key, now).await?;
        debug!(%key, "Live session refreshed watermark");
        Ok(true)
    }
}
