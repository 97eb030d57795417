//! Resource lock manager that tracks lock ownership and reports conflicts
//!
//! The lock table is fail-fast: an acquire either succeeds synchronously or
//! fails synchronously with a concurrent-update error. No transaction ever
//! waits on a lock, so deadlock is impossible; retry policy belongs to the
//! caller.

use crate::error::{Error, Result};
use crate::resource_id::ResourceId;
use crate::transaction_id::TransactionId;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

/// Lock types ordered by strength
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceLockType {
    /// Coexists with other non-exclusive locks from distinct transactions
    NonExclusive,
    /// Forbids any other transaction's lock on the same resource
    Exclusive,
}

impl ResourceLockType {
    /// Check whether locks of these types may coexist on one resource
    /// when held by distinct transactions
    pub fn is_compatible_with(&self, other: ResourceLockType) -> bool {
        matches!(
            (*self, other),
            (ResourceLockType::NonExclusive, ResourceLockType::NonExclusive)
        )
    }
}

/// A transaction's claim on a resource
///
/// Identity is `(transaction_id, resource_id)` only. A transaction holds at
/// most one logical lock per resource; the lock type is mutable state of
/// that claim, which is what makes upgrade-in-place and idempotent
/// re-acquire well-defined.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceLock {
    pub resource_id: ResourceId,
    pub lock_type: ResourceLockType,
    pub transaction_id: TransactionId,
}

impl PartialEq for ResourceLock {
    fn eq(&self, other: &Self) -> bool {
        self.transaction_id == other.transaction_id && self.resource_id == other.resource_id
    }
}

impl Eq for ResourceLock {}

impl Hash for ResourceLock {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.transaction_id.hash(state);
        self.resource_id.hash(state);
    }
}

/// In-memory resource lock table
///
/// The one piece of shared mutable state in the kernel. All check-and-set
/// logic for an acquire runs under a single write guard, so each call is
/// atomic with respect to concurrent acquires on any resource.
pub struct ResourceLockManager {
    locks: RwLock<HashMap<ResourceId, Vec<ResourceLock>>>,
}

impl ResourceLockManager {
    pub fn new() -> Self {
        Self {
            locks: RwLock::new(HashMap::new()),
        }
    }

    /// Acquire an exclusive lock on a resource
    ///
    /// Succeeds if no lock exists, or if the only lock is held by `tx_id`
    /// (upgrading it in place if necessary). Fails immediately with a
    /// concurrent-update error if any other transaction holds a lock of
    /// either type.
    pub fn acquire_exclusive(&self, tx_id: &TransactionId, resource_id: &ResourceId) -> Result<()> {
        self.acquire(tx_id, resource_id, ResourceLockType::Exclusive)
    }

    /// Acquire a non-exclusive lock on a resource
    ///
    /// Succeeds if no exclusive lock is held by another transaction.
    /// A lock already held by `tx_id` is left unchanged; a non-exclusive
    /// request never downgrades an existing exclusive lock.
    pub fn acquire_non_exclusive(
        &self,
        tx_id: &TransactionId,
        resource_id: &ResourceId,
    ) -> Result<()> {
        self.acquire(tx_id, resource_id, ResourceLockType::NonExclusive)
    }

    fn acquire(
        &self,
        tx_id: &TransactionId,
        resource_id: &ResourceId,
        requested: ResourceLockType,
    ) -> Result<()> {
        let mut locks = self.locks.write();
        let holders = locks.entry(resource_id.clone()).or_default();

        // Any holder from another transaction that is incompatible with the
        // request fails the call; there is no wait queue.
        for holder in holders.iter() {
            if holder.transaction_id != *tx_id && !holder.lock_type.is_compatible_with(requested) {
                tracing::warn!(
                    "Lock conflict on {}: requested {:?} by {}, held {:?} by {}",
                    resource_id,
                    requested,
                    tx_id,
                    holder.lock_type,
                    holder.transaction_id
                );
                return Err(Error::ConcurrentUpdate {
                    resource_id: resource_id.clone(),
                    held_by: holder.transaction_id.clone(),
                    requested_by: tx_id.clone(),
                });
            }
        }

        if let Some(own) = holders
            .iter_mut()
            .find(|lock| lock.transaction_id == *tx_id)
        {
            // Upgrade in place; never downgrade
            if requested > own.lock_type {
                tracing::debug!(
                    "Transaction {} upgrading lock on {} to {:?}",
                    tx_id,
                    resource_id,
                    requested
                );
                own.lock_type = requested;
            }
            return Ok(());
        }

        tracing::debug!(
            "Transaction {} acquired {:?} lock on {}",
            tx_id,
            requested,
            resource_id
        );
        holders.push(ResourceLock {
            resource_id: resource_id.clone(),
            lock_type: requested,
            transaction_id: tx_id.clone(),
        });

        Ok(())
    }

    /// Release every lock held by a transaction
    ///
    /// Locks owned by other transactions are untouched. A no-op when the
    /// transaction holds no locks.
    pub fn release_all(&self, tx_id: &TransactionId) {
        let mut locks = self.locks.write();

        locks.retain(|_, holders| {
            holders.retain(|lock| lock.transaction_id != *tx_id);
            !holders.is_empty()
        });

        tracing::debug!("Released all locks held by transaction {}", tx_id);
    }

    /// Check whether a transaction holds a lock of at least the given
    /// strength on a resource (an exclusive lock satisfies a non-exclusive
    /// requirement)
    pub fn holds_lock(
        &self,
        tx_id: &TransactionId,
        resource_id: &ResourceId,
        lock_type: ResourceLockType,
    ) -> bool {
        let locks = self.locks.read();

        locks.get(resource_id).is_some_and(|holders| {
            holders
                .iter()
                .any(|lock| lock.transaction_id == *tx_id && lock.lock_type >= lock_type)
        })
    }

    /// Get all locks held by a transaction
    pub fn locks_held(&self, tx_id: &TransactionId) -> Vec<ResourceLock> {
        let locks = self.locks.read();

        locks
            .values()
            .flatten()
            .filter(|lock| lock.transaction_id == *tx_id)
            .cloned()
            .collect()
    }
}

impl Default for ResourceLockManager {
    fn default() -> Self {
        Self::new()
    }
}
