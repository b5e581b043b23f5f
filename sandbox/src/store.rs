use crate::connection::DataAccess;
use crate::context;
use crate::lock::{Criteria, FindOne, FindOneOptions, LockingRepository};
use crate::savepoint::SAVEPOINT_PREFIX;
use async_trait::async_trait;
use parking_lot::Mutex;
use sea_orm::{
    ConnectionTrait, DatabaseTransaction, DbBackend, DbErr, EntityTrait, ExecResult, QueryResult,
    Statement,
};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, info};

static NEXT_STORE_ID: AtomicU64 = AtomicU64::new(1);

type RepositoryCache = HashMap<TypeId, Arc<dyn Any + Send + Sync>>;

/// State of one sandbox: the open transaction plus its bookkeeping.
///
/// The transaction is owned exclusively by the store. Statements go through a
/// read lock, closing takes the write lock, so a rollback waits for in-flight
/// statements and nothing runs on the connection after it is released.
pub struct TransactionStore {
    id: u64,
    context_id: u64,
    backend: DbBackend,
    mock: bool,
    locking: bool,
    transaction: RwLock<Option<DatabaseTransaction>>,
    active: AtomicBool,
    closed: AtomicBool,
    savepoint_counter: AtomicU64,
    repositories: Mutex<RepositoryCache>,
}

impl TransactionStore {
    pub(crate) fn new(context_id: u64, transaction: DatabaseTransaction, locking: bool) -> Arc<Self> {
        let backend = transaction.get_database_backend();
        let mock = transaction.is_mock_connection();
        Arc::new(Self {
            id: NEXT_STORE_ID.fetch_add(1, Ordering::SeqCst),
            context_id,
            backend,
            mock,
            locking,
            transaction: RwLock::new(Some(transaction)),
            active: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            savepoint_counter: AtomicU64::new(0),
            repositories: Mutex::new(HashMap::new()),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn context_id(&self) -> u64 {
        self.context_id
    }

    pub fn backend(&self) -> DbBackend {
        self.backend
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub(crate) fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }

    /// Whether lookups through this sandbox take pessimistic row locks.
    pub fn locking(&self) -> bool {
        self.locking
    }

    /// Number of savepoint names handed out so far.
    pub fn savepoint_count(&self) -> u64 {
        self.savepoint_counter.load(Ordering::SeqCst)
    }

    pub(crate) fn next_savepoint_name(&self) -> String {
        let counter = self.savepoint_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{SAVEPOINT_PREFIX}{counter}")
    }

    /// True until the transaction has been rolled back and released.
    pub async fn is_transaction_open(&self) -> bool {
        self.transaction.read().await.is_some()
    }

    pub fn scoped_handle(self: &Arc<Self>) -> ScopedHandle {
        ScopedHandle {
            store: Arc::clone(self),
        }
    }

    pub(crate) async fn execute(&self, statement: Statement) -> Result<ExecResult, DbErr> {
        let guard = self.transaction.read().await;
        match guard.as_ref() {
            Some(transaction) => transaction.execute(statement).await,
            None => Err(closed_error(self.id)),
        }
    }

    pub(crate) async fn execute_unprepared(&self, sql: &str) -> Result<ExecResult, DbErr> {
        let guard = self.transaction.read().await;
        match guard.as_ref() {
            Some(transaction) => transaction.execute_unprepared(sql).await,
            None => Err(closed_error(self.id)),
        }
    }

    pub(crate) async fn query_one(&self, statement: Statement) -> Result<Option<QueryResult>, DbErr> {
        let guard = self.transaction.read().await;
        match guard.as_ref() {
            Some(transaction) => transaction.query_one(statement).await,
            None => Err(closed_error(self.id)),
        }
    }

    pub(crate) async fn query_all(&self, statement: Statement) -> Result<Vec<QueryResult>, DbErr> {
        let guard = self.transaction.read().await;
        match guard.as_ref() {
            Some(transaction) => transaction.query_all(statement).await,
            None => Err(closed_error(self.id)),
        }
    }

    /// Roll back the transaction if it is still open and release its
    /// connection. Safe to call more than once.
    ///
    /// The connection goes back to the pool even when the rollback fails,
    /// because the transaction is consumed either way.
    pub(crate) async fn close(&self) -> Result<(), DbErr> {
        self.closed.store(true, Ordering::SeqCst);
        let transaction = self.transaction.write().await.take();
        self.repositories.lock().clear();

        match transaction {
            Some(transaction) => {
                info!(store = self.id, "rolling back sandbox transaction");
                transaction.rollback().await
            }
            None => {
                debug!(store = self.id, "sandbox transaction already closed");
                Ok(())
            }
        }
    }

    /// Only an active, open store caches; otherwise every call gets a fresh
    /// repository whose lookups fail against the closed transaction.
    fn cached_repository<E>(self: &Arc<Self>) -> Arc<LockingRepository<E>>
    where
        E: EntityTrait,
    {
        let key = TypeId::of::<E>();
        let mut cache = self.repositories.lock();
        if !self.is_active() || self.closed.load(Ordering::SeqCst) {
            return Arc::new(LockingRepository::new(self.scoped_handle()));
        }

        if let Some(existing) = cache.get(&key) {
            if let Ok(repository) = Arc::clone(existing).downcast::<LockingRepository<E>>() {
                return repository;
            }
        }

        let repository = Arc::new(LockingRepository::new(self.scoped_handle()));
        cache.insert(key, repository.clone());
        repository
    }

    pub(crate) fn cached_repository_count(&self) -> usize {
        self.repositories.lock().len()
    }
}

impl fmt::Debug for TransactionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionStore")
            .field("id", &self.id)
            .field("backend", &self.backend)
            .field("active", &self.is_active())
            .field("locking", &self.locking)
            .field("savepoints", &self.savepoint_count())
            .finish()
    }
}

fn closed_error(store: u64) -> DbErr {
    DbErr::Custom(format!("Sandbox transaction {store} is no longer open"))
}

/// Data-access handle bound to one sandbox's transaction.
///
/// Cloning is cheap; every clone talks to the same transaction.
#[derive(Clone)]
pub struct ScopedHandle {
    store: Arc<TransactionStore>,
}

impl ScopedHandle {
    pub fn store(&self) -> &Arc<TransactionStore> {
        &self.store
    }

    /// Locking-aware repository for `E`. Repeated calls return the same
    /// instance for the lifetime of the sandbox.
    pub fn repository<E>(&self) -> Arc<LockingRepository<E>>
    where
        E: EntityTrait,
    {
        self.store.cached_repository::<E>()
    }

    pub async fn find_one<E>(&self, options: FindOneOptions) -> Result<Option<E::Model>, DbErr>
    where
        E: EntityTrait,
    {
        self.repository::<E>().find_one(options).await
    }

    pub async fn find_one_or_fail<E>(&self, options: FindOneOptions) -> Result<E::Model, DbErr>
    where
        E: EntityTrait,
    {
        self.repository::<E>().find_one_or_fail(options).await
    }

    pub async fn find_one_by<E>(&self, criteria: Criteria) -> Result<Option<E::Model>, DbErr>
    where
        E: EntityTrait,
    {
        self.repository::<E>().find_one_by(criteria).await
    }

    pub async fn find_one_by_or_fail<E>(&self, criteria: Criteria) -> Result<E::Model, DbErr>
    where
        E: EntityTrait,
    {
        self.repository::<E>().find_one_by_or_fail(criteria).await
    }

    /// Run `future` with this sandbox explicitly bound, so connection lookups
    /// made inside it resolve here even from a freshly spawned task.
    pub fn scope<F>(self, future: F) -> impl Future<Output = F::Output>
    where
        F: Future,
    {
        context::scope_store(self.store, future)
    }

    pub fn into_data_access(self) -> DataAccess {
        DataAccess::Sandbox(self)
    }
}

impl fmt::Debug for ScopedHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ScopedHandle").field(&self.store.id).finish()
    }
}

#[async_trait]
impl ConnectionTrait for ScopedHandle {
    fn get_database_backend(&self) -> DbBackend {
        self.store.backend
    }

    async fn execute(&self, stmt: Statement) -> Result<ExecResult, DbErr> {
        self.store.execute(stmt).await
    }

    async fn execute_unprepared(&self, sql: &str) -> Result<ExecResult, DbErr> {
        self.store.execute_unprepared(sql).await
    }

    async fn query_one(&self, stmt: Statement) -> Result<Option<QueryResult>, DbErr> {
        self.store.query_one(stmt).await
    }

    async fn query_all(&self, stmt: Statement) -> Result<Vec<QueryResult>, DbErr> {
        self.store.query_all(stmt).await
    }

    fn is_mock_connection(&self) -> bool {
        self.store.mock
    }
}
