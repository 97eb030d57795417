//! Transaction identifiers
//!
//! Fresh identifiers are UUIDv7, giving time-ordered uniqueness. One value
//! is reserved: the read-only sentinel, used for read traffic that
//! participates in no locking and no session caching.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Reserved id for the read-only pass-through transaction
const READ_ONLY_ID: &str = "read-only";

/// Identifier for a transaction
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(String);

impl TransactionId {
    /// Mint a fresh transaction id using UUIDv7
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// The reserved read-only sentinel id
    pub fn read_only() -> Self {
        Self(READ_ONLY_ID.to_string())
    }

    /// True for the read-only sentinel
    pub fn is_read_only(&self) -> bool {
        self.0 == READ_ONLY_ID
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TransactionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}
