//! Identity to resource key mapping
//!
//! Accounts are named `<prefix><n>`; the backend VM id is `id_offset + n`.
//! The mapping is pure, so no lookup table is persisted.

use crate::config::schema::IdentityConfig;
use crate::error::{VmgateError, VmgateResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Deterministic key naming exactly one backend resource slot
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    identity: String,
    vmid: u32,
}

impl ResourceKey {
    /// Derive the key for an identity
    pub fn from_identity(identity: &str, config: &IdentityConfig) -> VmgateResult<Self> {
        let invalid = |reason: &str| VmgateError::InvalidIdentity {
            identity: identity.to_string(),
            reason: reason.to_string(),
        };

        let suffix = identity
            .strip_prefix(config.prefix.as_str())
            .ok_or_else(|| invalid(&format!("expected prefix '{}'", config.prefix)))?;

        if suffix.is_empty() || !suffix.chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid("expected a numeric suffix"));
        }
        // Leading zeros would let vm7 and vm007 share a VM id
        if suffix.len() > 1 && suffix.starts_with('0') {
            return Err(invalid("numeric suffix must not have leading zeros"));
        }

        let n: u32 = suffix
            .parse()
            .map_err(|_| invalid("numeric suffix out of range"))?;
        let vmid = config
            .id_offset
            .checked_add(n)
            .ok_or_else(|| invalid("VM id overflows"))?;

        Ok(Self {
            identity: identity.to_string(),
            vmid,
        })
    }

    /// Rebuild a key from a persisted record name
    pub fn from_record_name(name: &str, config: &IdentityConfig) -> VmgateResult<Self> {
        Self::from_identity(name, config)
    }

    /// Account name the key was derived from
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Backend VM id
    pub fn vmid(&self) -> u32 {
        self.vmid
    }

    /// Name used for persisted records and the VM hostname
    pub fn as_str(&self) -> &str {
        &self.identity
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.identity)
    }
}
