//! Persistence session contracts
//!
//! The durable versioned store is an external collaborator; the kernel only
//! sees it through these traits. Implementations own versioning, content
//! addressing, and on-disk layout.

use crate::error::StorageResult;
use crate::headers::ResourceHeaders;
use crate::resource_id::ResourceId;
use crate::transaction_id::TransactionId;
use std::sync::Arc;

/// A storage session scoped to one transaction
///
/// Writes are staged in the session and become durable on `commit`. Callers
/// must hold at least a non-exclusive lock on a resource before reading its
/// headers with consistency, and an exclusive lock before writing them;
/// that discipline is not enforced here.
pub trait PersistenceSession: Send + Sync {
    /// Read the header record for a resource
    ///
    /// Fails with `StorageError::ItemNotFound` when the resource does not
    /// exist, or `StorageError::SessionClosed` after the owning transaction
    /// has ended.
    fn read_headers(&self, resource_id: &ResourceId) -> StorageResult<ResourceHeaders>;

    /// Stage a header record write
    ///
    /// Fails with `StorageError::ItemConflict` when the store detects a
    /// concurrent modification beneath the lock layer, or
    /// `StorageError::ObjectExistsInIndex` when a create collides with an
    /// existing index entry.
    fn write_headers(
        &self,
        resource_id: &ResourceId,
        headers: &ResourceHeaders,
    ) -> StorageResult<()>;

    /// Flush all staged writes to durable storage
    fn commit(&self) -> StorageResult<()>;

    /// Discard all staged writes
    fn rollback(&self) -> StorageResult<()>;
}

/// Supplies persistence sessions to the transaction layer
pub trait PersistenceSessionManager: Send + Sync {
    /// Get (creating if needed) the session for a transaction
    fn session(&self, tx_id: &TransactionId) -> Arc<dyn PersistenceSession>;

    /// Get the shared session used by read-only traffic
    fn read_only_session(&self) -> Arc<dyn PersistenceSession>;

    /// Discard a transaction's session after it has closed
    fn remove_session(&self, tx_id: &TransactionId);
}
