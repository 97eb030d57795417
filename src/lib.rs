//! Transactional concurrency-control and caching core for a versioned
//! resource repository
//!
//! This crate sits between a request-handling surface and a durable
//! versioned object store. It provides:
//! - A fail-fast resource lock table with no wait queue, so deadlock is
//!   impossible and retry policy stays with the caller
//! - A transaction lifecycle whose commit/rollback hooks keep the lock
//!   table and the user-types cache consistent
//! - A two-tier (session + global) cache of derived type URIs, merged on
//!   commit and discarded on rollback
//! - The persistence session contract and header record codec for the
//!   external store
//!
//! Uncommitted work is never visible to other transactions; a reserved
//! read-only transaction id bypasses locking and session caching entirely.

pub mod cache;
pub mod config;
pub mod error;
pub mod headers;
pub mod lock;
pub mod resource_id;
pub mod session;
pub mod transaction;
pub mod transaction_id;

pub use cache::{TypeSource, UserTypesCache};
pub use config::{CacheConfig, TransactionConfig};
pub use error::{Error, Result, StorageError, StorageResult};
pub use headers::{deserialize_headers, serialize_headers, ResourceHeaders};
pub use lock::{ResourceLock, ResourceLockManager, ResourceLockType};
pub use resource_id::ResourceId;
pub use session::{PersistenceSession, PersistenceSessionManager};
pub use transaction::{Transaction, TransactionManager, TransactionState};
pub use transaction_id::TransactionId;
