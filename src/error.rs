//! Error types for the repository kernel

use crate::resource_id::ResourceId;
use crate::transaction_id::TransactionId;
use thiserror::Error;

/// Result type for kernel operations
pub type Result<T> = std::result::Result<T, Error>;

/// Result type for operations at the persistent storage boundary
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Kernel error types
#[derive(Error, Debug)]
pub enum Error {
    /// Another transaction holds an incompatible lock on the resource.
    /// Never retried internally; the caller decides whether to retry or abort.
    #[error("Cannot update {resource_id}: it is locked by transaction {held_by}")]
    ConcurrentUpdate {
        resource_id: ResourceId,
        held_by: TransactionId,
        requested_by: TransactionId,
    },

    #[error("Transaction {0} has already been closed")]
    TransactionClosed(TransactionId),

    #[error("No transaction found with id {0}")]
    TransactionNotFound(TransactionId),

    /// Storage errors propagate unchanged through the kernel
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Persistent storage error family
///
/// Raised at the persistence boundary and propagated unchanged; none of
/// these are retried inside the kernel.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("No persistent item found for {0}")]
    ItemNotFound(ResourceId),

    /// The store detected a concurrent modification beneath the lock layer
    #[error("Persistent item conflict for {0}: modified by another session")]
    ItemConflict(ResourceId),

    #[error("The persistence session for transaction {0} has been closed")]
    SessionClosed(TransactionId),

    #[error("Object {0} already exists in the storage index")]
    ObjectExistsInIndex(ResourceId),

    #[error("Failed to deserialize resource headers: {0}")]
    Deserialization(String),
}
