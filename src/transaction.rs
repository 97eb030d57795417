//! Transaction lifecycle with pessimistic concurrency control
//!
//! A transaction ties together the locks it holds, its session cache
//! segment, and its persistence session. Commit and rollback are the only
//! points where those three are reconciled: locks and the session cache are
//! always released together, so no future transaction can read stale cached
//! data after the protecting lock has disappeared.

use crate::cache::UserTypesCache;
use crate::config::TransactionConfig;
use crate::error::{Error, Result};
use crate::lock::ResourceLockManager;
use crate::resource_id::ResourceId;
use crate::session::{PersistenceSession, PersistenceSessionManager};
use crate::transaction_id::TransactionId;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Transaction lifecycle states
///
/// `Open → Committing → Committed` on the normal path, `Open → RolledBack`
/// on the abort path (or on a failed commit flush). No transition leaves
/// `Committed` or `RolledBack`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Open,
    Committing,
    Committed,
    RolledBack,
}

/// A client-visible unit of work
///
/// The read-only sentinel transaction is a pass-through: it never
/// transitions, holds no locks, and owns no session cache segment.
pub struct Transaction {
    id: TransactionId,

    state: RwLock<TransactionState>,

    expires: RwLock<Instant>,

    session_timeout: Duration,

    lock_manager: Arc<ResourceLockManager>,

    user_types_cache: Arc<UserTypesCache>,

    session: Arc<dyn PersistenceSession>,
}

impl Transaction {
    fn new(
        id: TransactionId,
        session_timeout: Duration,
        lock_manager: Arc<ResourceLockManager>,
        user_types_cache: Arc<UserTypesCache>,
        session: Arc<dyn PersistenceSession>,
    ) -> Self {
        Self {
            id,
            state: RwLock::new(TransactionState::Open),
            expires: RwLock::new(Instant::now() + session_timeout),
            session_timeout,
            lock_manager,
            user_types_cache,
            session,
        }
    }

    pub fn id(&self) -> &TransactionId {
        &self.id
    }

    pub fn state(&self) -> TransactionState {
        *self.state.read()
    }

    pub fn is_read_only(&self) -> bool {
        self.id.is_read_only()
    }

    pub fn is_open(&self) -> bool {
        self.state() == TransactionState::Open
    }

    pub fn is_committed(&self) -> bool {
        self.state() == TransactionState::Committed
    }

    pub fn is_rolled_back(&self) -> bool {
        self.state() == TransactionState::RolledBack
    }

    /// The persistence session scoped to this transaction
    pub fn session(&self) -> &Arc<dyn PersistenceSession> {
        &self.session
    }

    /// The cache used for this transaction's derived type reads
    pub fn user_types_cache(&self) -> &Arc<UserTypesCache> {
        &self.user_types_cache
    }

    /// When the transaction expires if it stays idle
    pub fn expires(&self) -> Instant {
        *self.expires.read()
    }

    pub fn has_expired(&self) -> bool {
        !self.is_read_only() && Instant::now() > *self.expires.read()
    }

    /// Push the expiry window forward; called on each request bound to the
    /// transaction
    pub fn update_expiry(&self) {
        *self.expires.write() = Instant::now() + self.session_timeout;
    }

    /// Acquire a lock on a resource on behalf of this transaction
    ///
    /// A conflict does not invalidate the transaction; the caller decides
    /// whether to retry or abort. A no-op for the read-only sentinel.
    pub fn lock_resource(&self, resource_id: &ResourceId, exclusive: bool) -> Result<()> {
        if self.is_read_only() {
            return Ok(());
        }
        if !self.is_open() {
            return Err(Error::TransactionClosed(self.id.clone()));
        }

        if exclusive {
            self.lock_manager.acquire_exclusive(&self.id, resource_id)
        } else {
            self.lock_manager
                .acquire_non_exclusive(&self.id, resource_id)
        }
    }

    /// Commit the transaction
    ///
    /// Flushes staged persistence writes, then merges the session cache into
    /// the global tier and releases all locks. If the flush fails, the
    /// transaction rolls back instead: the session cache is dropped, locks
    /// are released, and the storage error is returned.
    ///
    /// The flush and the cache merge are not atomic with each other; a crash
    /// between them leaves the global cache stale until its entries expire.
    pub fn commit(&self) -> Result<()> {
        if self.is_read_only() {
            return Ok(());
        }

        {
            let mut state = self.state.write();
            match *state {
                TransactionState::Open => *state = TransactionState::Committing,
                TransactionState::Committed => return Ok(()),
                _ => return Err(Error::TransactionClosed(self.id.clone())),
            }
        }

        if let Err(storage_err) = self.session.commit() {
            tracing::warn!(
                "Commit flush failed for transaction {}; rolling back: {}",
                self.id,
                storage_err
            );
            let mut state = self.state.write();
            if *state == TransactionState::Committing {
                *state = TransactionState::RolledBack;
                drop(state);
                self.release(false);
            }
            return Err(storage_err.into());
        }

        // Finalize under the state guard: only Committing may become
        // Committed, and the merge/release happens inside that window so a
        // concurrent rollback can neither steal the state mid-flush nor
        // observe locks released before the transition lands.
        {
            let mut state = self.state.write();
            if *state != TransactionState::Committing {
                return Err(Error::TransactionClosed(self.id.clone()));
            }
            self.release(true);
            *state = TransactionState::Committed;
        }
        tracing::debug!("Transaction {} committed", self.id);
        Ok(())
    }

    /// Roll back the transaction, discarding its session cache and
    /// releasing its locks. Idempotent when already rolled back; an error
    /// when already committed or while a commit flush is in flight — the
    /// Committing state belongs to the committing thread and cannot be
    /// stolen out from under a live flush.
    pub fn rollback(&self) -> Result<()> {
        if self.is_read_only() {
            return Ok(());
        }

        {
            let mut state = self.state.write();
            match *state {
                TransactionState::RolledBack => return Ok(()),
                TransactionState::Committed | TransactionState::Committing => {
                    return Err(Error::TransactionClosed(self.id.clone()))
                }
                TransactionState::Open => *state = TransactionState::RolledBack,
            }
        }

        if let Err(e) = self.session.rollback() {
            // Locks and cache must still be released; the storage layer owns
            // any further recovery of its staged writes
            tracing::warn!(
                "Storage rollback failed for transaction {}: {}",
                self.id,
                e
            );
        }
        self.release(false);
        tracing::debug!("Transaction {} rolled back", self.id);
        Ok(())
    }

    /// Locks and the session cache are released together, never one
    /// without the other
    fn release(&self, merge: bool) {
        if merge {
            self.user_types_cache.merge_session_cache(&self.id);
        } else {
            self.user_types_cache.drop_session_cache(&self.id);
        }
        self.lock_manager.release_all(&self.id);
    }
}

/// Creates, tracks, and expires transactions
pub struct TransactionManager {
    transactions: DashMap<TransactionId, Arc<Transaction>>,

    config: TransactionConfig,

    lock_manager: Arc<ResourceLockManager>,

    user_types_cache: Arc<UserTypesCache>,

    session_manager: Arc<dyn PersistenceSessionManager>,
}

impl TransactionManager {
    pub fn new(
        config: TransactionConfig,
        lock_manager: Arc<ResourceLockManager>,
        user_types_cache: Arc<UserTypesCache>,
        session_manager: Arc<dyn PersistenceSessionManager>,
    ) -> Self {
        Self {
            transactions: DashMap::new(),
            config,
            lock_manager,
            user_types_cache,
            session_manager,
        }
    }

    /// Begin a new transaction with a fresh id and an open storage session
    pub fn begin(&self) -> Arc<Transaction> {
        let id = TransactionId::new();
        let session = self.session_manager.session(&id);
        let tx = Arc::new(Transaction::new(
            id.clone(),
            self.config.session_timeout,
            self.lock_manager.clone(),
            self.user_types_cache.clone(),
            session,
        ));
        self.transactions.insert(id.clone(), tx.clone());
        tracing::debug!("Began transaction {}", id);
        tx
    }

    /// The pass-through transaction for read-only traffic
    pub fn read_only(&self) -> Arc<Transaction> {
        Arc::new(Transaction::new(
            TransactionId::read_only(),
            self.config.session_timeout,
            self.lock_manager.clone(),
            self.user_types_cache.clone(),
            self.session_manager.read_only_session(),
        ))
    }

    /// Look up an open transaction by id
    ///
    /// An expired transaction is rolled back here and reported closed;
    /// committed and rolled-back transactions are reported closed; unknown
    /// ids are not found.
    pub fn get(&self, tx_id: &TransactionId) -> Result<Arc<Transaction>> {
        let tx = self
            .transactions
            .get(tx_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::TransactionNotFound(tx_id.clone()))?;

        if tx.has_expired() {
            tx.rollback()?;
            return Err(Error::TransactionClosed(tx_id.clone()));
        }
        if !tx.is_open() {
            return Err(Error::TransactionClosed(tx_id.clone()));
        }
        Ok(tx)
    }

    /// Roll back expired open transactions and drop closed expired ones
    ///
    /// Expired-but-open transactions are rolled back in place and kept
    /// registered so callers can still observe the rolled-back status; they
    /// are removed on a later pass, once closed and expired.
    pub fn cleanup_expired(&self) {
        tracing::trace!("Cleaning up expired transactions");

        let mut removed = Vec::new();
        self.transactions.retain(|id, tx| {
            if !tx.has_expired() {
                return true;
            }
            if tx.is_open() {
                tracing::debug!("Rolling back expired transaction {}", id);
                if let Err(e) = tx.rollback() {
                    tracing::warn!("Failed to roll back expired transaction {}: {}", id, e);
                }
                return true;
            }
            if tx.state() == TransactionState::Committing {
                // A commit flush is in flight; it finishes or rolls back on
                // its own, and a later pass retires the transaction
                return true;
            }
            removed.push(id.clone());
            false
        });

        for id in removed {
            self.session_manager.remove_session(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::UserTypesCache;
    use crate::config::CacheConfig;
    use crate::error::{StorageError, StorageResult};
    use crate::headers::ResourceHeaders;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Barrier;

    /// Pauses a commit flush mid-flight so tests can interleave against it
    struct CommitGate {
        entered: Barrier,
        release: Barrier,
    }

    impl CommitGate {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                entered: Barrier::new(2),
                release: Barrier::new(2),
            })
        }
    }

    /// In-memory persistence double: staged writes become visible on commit
    struct InMemorySession {
        store: Arc<Mutex<HashMap<ResourceId, ResourceHeaders>>>,
        staged: Mutex<HashMap<ResourceId, ResourceHeaders>>,
        fail_commit: AtomicBool,
        closed: AtomicBool,
        commit_gate: Mutex<Option<Arc<CommitGate>>>,
        tx_id: TransactionId,
    }

    impl InMemorySession {
        fn new(store: Arc<Mutex<HashMap<ResourceId, ResourceHeaders>>>, tx_id: TransactionId) -> Self {
            Self {
                store,
                staged: Mutex::new(HashMap::new()),
                fail_commit: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                commit_gate: Mutex::new(None),
                tx_id,
            }
        }

        fn ensure_open(&self) -> StorageResult<()> {
            if self.closed.load(Ordering::SeqCst) {
                return Err(StorageError::SessionClosed(self.tx_id.clone()));
            }
            Ok(())
        }
    }

    impl PersistenceSession for InMemorySession {
        fn read_headers(&self, resource_id: &ResourceId) -> StorageResult<ResourceHeaders> {
            self.ensure_open()?;
            if let Some(headers) = self.staged.lock().get(resource_id) {
                return Ok(headers.clone());
            }
            self.store
                .lock()
                .get(resource_id)
                .cloned()
                .ok_or_else(|| StorageError::ItemNotFound(resource_id.clone()))
        }

        fn write_headers(
            &self,
            resource_id: &ResourceId,
            headers: &ResourceHeaders,
        ) -> StorageResult<()> {
            self.ensure_open()?;
            self.staged
                .lock()
                .insert(resource_id.clone(), headers.clone());
            Ok(())
        }

        fn commit(&self) -> StorageResult<()> {
            self.ensure_open()?;
            let gate = self.commit_gate.lock().clone();
            if let Some(gate) = gate {
                gate.entered.wait();
                gate.release.wait();
            }
            if self.fail_commit.load(Ordering::SeqCst) {
                return Err(StorageError::ItemConflict(ResourceId::from("conflicted")));
            }
            let mut store = self.store.lock();
            for (id, headers) in self.staged.lock().drain() {
                store.insert(id, headers);
            }
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn rollback(&self) -> StorageResult<()> {
            self.staged.lock().clear();
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct InMemorySessionManager {
        store: Arc<Mutex<HashMap<ResourceId, ResourceHeaders>>>,
        sessions: DashMap<TransactionId, Arc<InMemorySession>>,
    }

    impl InMemorySessionManager {
        fn new() -> Self {
            Self {
                store: Arc::new(Mutex::new(HashMap::new())),
                sessions: DashMap::new(),
            }
        }

        fn session_for(&self, tx_id: &TransactionId) -> Arc<InMemorySession> {
            self.sessions
                .entry(tx_id.clone())
                .or_insert_with(|| {
                    Arc::new(InMemorySession::new(self.store.clone(), tx_id.clone()))
                })
                .clone()
        }
    }

    impl PersistenceSessionManager for InMemorySessionManager {
        fn session(&self, tx_id: &TransactionId) -> Arc<dyn PersistenceSession> {
            self.session_for(tx_id)
        }

        fn read_only_session(&self) -> Arc<dyn PersistenceSession> {
            self.session_for(&TransactionId::read_only())
        }

        fn remove_session(&self, tx_id: &TransactionId) {
            self.sessions.remove(tx_id);
        }
    }

    struct Fixture {
        lock_manager: Arc<ResourceLockManager>,
        cache: Arc<UserTypesCache>,
        sessions: Arc<InMemorySessionManager>,
        manager: TransactionManager,
    }

    fn fixture() -> Fixture {
        fixture_with(TransactionConfig::default())
    }

    fn fixture_with(config: TransactionConfig) -> Fixture {
        let lock_manager = Arc::new(ResourceLockManager::new());
        let cache = Arc::new(UserTypesCache::new(CacheConfig::default()));
        let sessions = Arc::new(InMemorySessionManager::new());
        let manager = TransactionManager::new(
            config,
            lock_manager.clone(),
            cache.clone(),
            sessions.clone(),
        );
        Fixture {
            lock_manager,
            cache,
            sessions,
            manager,
        }
    }

    fn rid(s: &str) -> ResourceId {
        ResourceId::from(s)
    }

    #[test]
    fn test_commit_lifecycle() {
        let f = fixture();
        let tx = f.manager.begin();
        assert_eq!(tx.state(), TransactionState::Open);

        tx.lock_resource(&rid("r1"), true).unwrap();
        let headers = ResourceHeaders::new(rid("r1"));
        tx.session().write_headers(&rid("r1"), &headers).unwrap();

        tx.commit().unwrap();
        assert_eq!(tx.state(), TransactionState::Committed);

        // The write is durable and the lock is gone
        assert_eq!(
            f.sessions.store.lock().get(&rid("r1")).unwrap().id,
            rid("r1")
        );
        assert!(f.lock_manager.locks_held(tx.id()).is_empty());
    }

    #[test]
    fn test_commit_merges_session_cache() {
        let f = fixture();
        let tx = f.manager.begin();

        f.cache
            .cache_user_types(&rid("r1"), vec!["T1".into()], tx.id());
        tx.commit().unwrap();

        // Visible to a different transaction without invoking the loader
        let other = f.manager.begin();
        let seen = f
            .cache
            .get_user_types(&rid("r1"), other.id(), || panic!("loader must not be called"))
            .unwrap();
        assert_eq!(*seen, vec!["T1".to_string()]);
    }

    #[test]
    fn test_failed_flush_rolls_back_without_merging() {
        let f = fixture();
        let tx = f.manager.begin();

        f.sessions
            .session_for(tx.id())
            .fail_commit
            .store(true, Ordering::SeqCst);

        tx.lock_resource(&rid("r1"), true).unwrap();
        f.cache
            .cache_user_types(&rid("r1"), vec!["T1".into()], tx.id());

        let result = tx.commit();
        assert!(matches!(
            result,
            Err(Error::Storage(StorageError::ItemConflict(_)))
        ));
        assert_eq!(tx.state(), TransactionState::RolledBack);

        // Locks released, session cache dropped, nothing merged
        assert!(f.lock_manager.locks_held(tx.id()).is_empty());
        let other = f.manager.begin();
        let seen = f
            .cache
            .get_user_types(&rid("r1"), other.id(), || Ok(vec!["fresh".into()]))
            .unwrap();
        assert_eq!(*seen, vec!["fresh".to_string()]);
    }

    #[test]
    fn test_rollback_releases_locks_and_cache_together() {
        let f = fixture();
        let tx = f.manager.begin();

        tx.lock_resource(&rid("r1"), true).unwrap();
        f.cache
            .cache_user_types(&rid("r1"), vec!["T1".into()], tx.id());

        tx.rollback().unwrap();
        assert_eq!(tx.state(), TransactionState::RolledBack);
        assert!(f.lock_manager.locks_held(tx.id()).is_empty());

        // The seeded value is gone even for the same transaction id
        let seen = f
            .cache
            .get_user_types(&rid("r1"), tx.id(), || Ok(vec!["fresh".into()]))
            .unwrap();
        assert_eq!(*seen, vec!["fresh".to_string()]);
    }

    #[test]
    fn test_rollback_is_idempotent() {
        let f = fixture();
        let tx = f.manager.begin();

        tx.rollback().unwrap();
        tx.rollback().unwrap();
        assert_eq!(tx.state(), TransactionState::RolledBack);
    }

    #[test]
    fn test_commit_after_rollback_fails() {
        let f = fixture();
        let tx = f.manager.begin();

        tx.rollback().unwrap();
        assert!(matches!(tx.commit(), Err(Error::TransactionClosed(_))));
    }

    #[test]
    fn test_rollback_after_commit_fails() {
        let f = fixture();
        let tx = f.manager.begin();

        tx.commit().unwrap();
        assert!(matches!(tx.rollback(), Err(Error::TransactionClosed(_))));
    }

    #[test]
    fn test_commit_is_idempotent_once_committed() {
        let f = fixture();
        let tx = f.manager.begin();

        tx.commit().unwrap();
        tx.commit().unwrap();
        assert_eq!(tx.state(), TransactionState::Committed);
    }

    #[test]
    fn test_lock_conflict_does_not_invalidate_transaction() {
        let f = fixture();
        let tx_a = f.manager.begin();
        let tx_b = f.manager.begin();

        tx_a.lock_resource(&rid("r1"), true).unwrap();
        assert!(matches!(
            tx_b.lock_resource(&rid("r1"), true),
            Err(Error::ConcurrentUpdate { .. })
        ));

        // tx_b stays open and can work elsewhere
        assert!(tx_b.is_open());
        tx_b.lock_resource(&rid("r2"), true).unwrap();
        tx_b.commit().unwrap();
    }

    #[test]
    fn test_read_only_transaction_is_a_pass_through() {
        let f = fixture();
        let ro = f.manager.read_only();

        assert!(ro.is_read_only());
        ro.lock_resource(&rid("r1"), true).unwrap();
        assert!(f.lock_manager.locks_held(ro.id()).is_empty());

        // Never transitions
        ro.commit().unwrap();
        assert_eq!(ro.state(), TransactionState::Open);
        ro.rollback().unwrap();
        assert_eq!(ro.state(), TransactionState::Open);
    }

    #[test]
    fn test_locking_on_closed_transaction_fails() {
        let f = fixture();
        let tx = f.manager.begin();

        tx.commit().unwrap();
        assert!(matches!(
            tx.lock_resource(&rid("r1"), true),
            Err(Error::TransactionClosed(_))
        ));
    }

    #[test]
    fn test_get_unknown_transaction() {
        let f = fixture();
        assert!(matches!(
            f.manager.get(&TransactionId::new()),
            Err(Error::TransactionNotFound(_))
        ));
    }

    #[test]
    fn test_get_closed_transaction() {
        let f = fixture();
        let tx = f.manager.begin();
        tx.commit().unwrap();

        assert!(matches!(
            f.manager.get(tx.id()),
            Err(Error::TransactionClosed(_))
        ));
    }

    #[test]
    fn test_expired_transaction_is_rolled_back_on_access() {
        let f = fixture_with(TransactionConfig::default().with_session_timeout(Duration::ZERO));
        let tx = f.manager.begin();
        tx.lock_resource(&rid("r1"), true).unwrap();
        std::thread::sleep(Duration::from_millis(5));

        assert!(matches!(
            f.manager.get(tx.id()),
            Err(Error::TransactionClosed(_))
        ));
        assert_eq!(tx.state(), TransactionState::RolledBack);
        assert!(f.lock_manager.locks_held(tx.id()).is_empty());
    }

    #[test]
    fn test_cleanup_rolls_back_then_removes_expired() {
        let f = fixture_with(TransactionConfig::default().with_session_timeout(Duration::ZERO));
        let tx = f.manager.begin();
        std::thread::sleep(Duration::from_millis(5));

        // First pass rolls back but keeps the transaction observable
        f.manager.cleanup_expired();
        assert_eq!(tx.state(), TransactionState::RolledBack);
        assert!(matches!(
            f.manager.get(tx.id()),
            Err(Error::TransactionClosed(_))
        ));

        // Second pass removes it and its session
        f.manager.cleanup_expired();
        assert!(matches!(
            f.manager.get(tx.id()),
            Err(Error::TransactionNotFound(_))
        ));
        assert!(!f.sessions.sessions.contains_key(tx.id()));
    }

    #[test]
    fn test_rollback_refuses_in_flight_commit() {
        let f = fixture_with(TransactionConfig::default().with_session_timeout(Duration::ZERO));
        let tx = f.manager.begin();
        tx.lock_resource(&rid("r1"), true).unwrap();

        let gate = CommitGate::new();
        *f.sessions.session_for(tx.id()).commit_gate.lock() = Some(gate.clone());

        let committer = {
            let tx = tx.clone();
            std::thread::spawn(move || tx.commit())
        };
        gate.entered.wait();
        assert_eq!(tx.state(), TransactionState::Committing);

        // Neither a direct rollback nor expiry cleanup may steal the state
        // or release the locks while the flush is live
        assert!(matches!(tx.rollback(), Err(Error::TransactionClosed(_))));
        f.manager.cleanup_expired();
        assert_eq!(tx.state(), TransactionState::Committing);

        let intruder = f.manager.begin();
        assert!(matches!(
            intruder.lock_resource(&rid("r1"), true),
            Err(Error::ConcurrentUpdate { .. })
        ));

        gate.release.wait();
        committer.join().unwrap().unwrap();
        assert_eq!(tx.state(), TransactionState::Committed);

        // Only now are the locks gone
        intruder.lock_resource(&rid("r1"), true).unwrap();
    }

    #[test]
    fn test_cleanup_retains_committing_transaction() {
        let f = fixture_with(TransactionConfig::default().with_session_timeout(Duration::ZERO));
        let tx = f.manager.begin();

        let gate = CommitGate::new();
        *f.sessions.session_for(tx.id()).commit_gate.lock() = Some(gate.clone());

        let committer = {
            let tx = tx.clone();
            std::thread::spawn(move || tx.commit())
        };
        gate.entered.wait();

        // An expired transaction whose flush is in flight stays registered
        f.manager.cleanup_expired();
        assert!(f.manager.transactions.contains_key(tx.id()));

        gate.release.wait();
        committer.join().unwrap().unwrap();
    }

    #[test]
    fn test_update_expiry_keeps_transaction_alive() {
        let f =
            fixture_with(TransactionConfig::default().with_session_timeout(Duration::from_secs(60)));
        let tx = f.manager.begin();

        let before = tx.expires();
        std::thread::sleep(Duration::from_millis(5));
        tx.update_expiry();
        assert!(tx.expires() > before);
        assert!(!tx.has_expired());
    }
}
