//! Resource header records and their persistence codec
//!
//! Headers are the durable metadata describing a resource: identity,
//! content properties, audit dates, and the state token callers use to
//! detect conflicting concurrent edits. They are stored as JSON documents;
//! the codec is pure and maps malformed input into the storage error family
//! rather than panicking.

use crate::error::{StorageError, StorageResult};
use crate::resource_id::ResourceId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Durable metadata record for a repository resource
///
/// Writers must hold the resource's exclusive lock before persisting a
/// mutated record; that discipline is not checked here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceHeaders {
    pub id: ResourceId,

    /// Parent resource, None for the repository root
    pub parent: Option<ResourceId>,

    /// Nearest containing archival group, if any
    pub archival_group_id: Option<ResourceId>,

    /// Opaque version marker; changes on every persisted mutation
    pub state_token: Option<String>,

    pub interaction_model: Option<String>,

    pub mime_type: Option<String>,

    pub filename: Option<String>,

    pub content_size: Option<u64>,

    /// Checksum URIs for the resource content; a set, so repeated
    /// registration of the same digest is harmless
    pub digests: BTreeSet<String>,

    pub external_url: Option<String>,

    pub external_handling: Option<String>,

    pub created_date: Option<DateTime<Utc>>,

    pub created_by: Option<String>,

    pub last_modified_date: Option<DateTime<Utc>>,

    pub last_modified_by: Option<String>,

    pub archival_group: bool,

    pub object_root: bool,

    /// True when the resource is a tombstone
    pub deleted: bool,

    /// Relative path of the content file paired with this header record
    pub content_path: Option<String>,
}

impl ResourceHeaders {
    pub fn new(id: ResourceId) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    /// Archival group roots are always object roots
    pub fn is_object_root(&self) -> bool {
        self.archival_group || self.object_root
    }

    /// Record a mutation: updates the audit fields and mints a fresh
    /// state token so concurrent editors can detect the change.
    pub fn touch(&mut self, user: &str, when: DateTime<Utc>) {
        if self.created_date.is_none() {
            self.created_date = Some(when);
            self.created_by = Some(user.to_string());
        }
        self.last_modified_date = Some(when);
        self.last_modified_by = Some(user.to_string());
        self.state_token = Some(Uuid::new_v4().simple().to_string());
    }
}

/// Encode a header record for persistence
pub fn serialize_headers(headers: &ResourceHeaders) -> StorageResult<Vec<u8>> {
    serde_json::to_vec(headers).map_err(|e| StorageError::Deserialization(e.to_string()))
}

/// Decode a header record from persisted bytes
pub fn deserialize_headers(bytes: &[u8]) -> StorageResult<ResourceHeaders> {
    serde_json::from_slice(bytes).map_err(|e| StorageError::Deserialization(e.to_string()))
}
