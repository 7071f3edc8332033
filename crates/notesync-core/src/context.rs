//! Session context: who we are, which key we sync under, and our clock.
//!
//! Every component receives the context explicitly at construction; there is
//! no global "current user" state.

use crate::clock::HybridClock;
use crate::DeviceId;
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;

/// Environment variable consulted for the sync key by front ends.
pub const SYNC_KEY_ENV: &str = "NOTESYNC_SYNC_KEY";

const MIN_KEY_LEN: usize = 8;
const MAX_KEY_LEN: usize = 256;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SyncKeyError {
    #[error("sync key must be at least {MIN_KEY_LEN} characters")]
    TooShort,
    #[error("sync key must be at most {MAX_KEY_LEN} characters")]
    TooLong,
    #[error("sync key must not contain control characters")]
    ControlCharacter,
}

/// User-chosen shared secret selecting the remote collection.
///
/// The secret itself never leaves the device: the remote collection name is a
/// SHA-256 digest of it.
#[derive(Clone, PartialEq, Eq)]
pub struct SyncKey(String);

impl SyncKey {
    pub fn new(key: impl Into<String>) -> Result<Self, SyncKeyError> {
        let key = key.into().trim().to_string();
        if key.chars().count() < MIN_KEY_LEN {
            return Err(SyncKeyError::TooShort);
        }
        if key.chars().count() > MAX_KEY_LEN {
            return Err(SyncKeyError::TooLong);
        }
        if key.chars().any(char::is_control) {
            return Err(SyncKeyError::ControlCharacter);
        }
        Ok(Self(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Remote collection name for this key. Pure function of the key.
    pub fn collection(&self) -> String {
        let digest = Sha256::digest(self.0.as_bytes());
        format!("notes-{}", hex::encode(&digest[..16]))
    }
}

// Keep the secret out of logs
impl fmt::Debug for SyncKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SyncKey({})", self.collection())
    }
}

/// Explicit per-session context shared by the engine's components.
#[derive(Debug, Clone)]
pub struct SyncContext {
    pub device_id: DeviceId,
    pub sync_key: SyncKey,
    pub clock: HybridClock,
}

impl SyncContext {
    pub fn new(device_id: DeviceId, sync_key: SyncKey, clock: HybridClock) -> Self {
        Self {
            device_id,
            sync_key,
            clock,
        }
    }
}
