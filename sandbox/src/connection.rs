use crate::context::IsolationContext;
use crate::error::{SandboxError, TransactionError};
use crate::identity::TestIdentitySource;
use crate::lock::{Criteria, FindOne, FindOneOptions, Repository};
use crate::savepoint;
use crate::store::{ScopedHandle, TransactionStore};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use sea_orm::{
    ConnectionTrait, DatabaseConnection, DatabaseTransaction, DbBackend, DbErr, EntityTrait,
    ExecResult, IsolationLevel, QueryResult, Statement, TransactionTrait,
};
use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// A transaction callback, with or without an explicit isolation level.
pub enum TransactionRequest<F> {
    Simple(F),
    WithIsolation(IsolationLevel, F),
}

impl<F> TransactionRequest<F> {
    /// Build a request from loosely supplied parts.
    pub fn from_parts(
        isolation_level: Option<IsolationLevel>,
        callback: Option<F>,
    ) -> Result<Self, SandboxError> {
        let callback = callback.ok_or(SandboxError::MissingCallback)?;
        Ok(match isolation_level {
            Some(level) => Self::WithIsolation(level, callback),
            None => Self::Simple(callback),
        })
    }

    pub fn isolation_level(&self) -> Option<&IsolationLevel> {
        match self {
            Self::Simple(_) => None,
            Self::WithIsolation(level, _) => Some(level),
        }
    }

    pub fn into_parts(self) -> (Option<IsolationLevel>, F) {
        match self {
            Self::Simple(callback) => (None, callback),
            Self::WithIsolation(level, callback) => (Some(level), callback),
        }
    }
}

/// Data-access handle given to application code and transaction callbacks.
///
/// Implements [`ConnectionTrait`], so it goes anywhere sea-orm expects a
/// connection.
#[derive(Clone)]
pub enum DataAccess {
    /// Inside a sandbox.
    Sandbox(ScopedHandle),
    /// No sandbox applied when the handle was taken.
    Connection {
        connection: Arc<DatabaseConnection>,
        context: Arc<IsolationContext>,
    },
    /// Inside a real transaction started outside any sandbox.
    Transaction {
        transaction: Arc<DatabaseTransaction>,
        context: Arc<IsolationContext>,
    },
}

impl DataAccess {
    pub fn is_sandboxed(&self) -> bool {
        matches!(self, Self::Sandbox(_))
    }

    pub fn as_sandbox(&self) -> Option<&ScopedHandle> {
        match self {
            Self::Sandbox(handle) => Some(handle),
            _ => None,
        }
    }

    /// Run `request` as a transaction on this handle: a savepoint inside a
    /// sandbox, a real transaction otherwise.
    pub async fn transaction<F, Fut, T, E>(
        &self,
        request: TransactionRequest<F>,
    ) -> Result<T, TransactionError<E>>
    where
        F: Fn(DataAccess) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, E>> + Send,
        T: Send,
        E: StdError + Send + Sync + 'static,
    {
        match self {
            Self::Sandbox(handle) => {
                let (level, callback) = request.into_parts();
                nested_in_sandbox(handle, level, &callback).await
            }
            Self::Connection {
                connection,
                context,
            } => {
                route_transaction(context, RealTarget::Connection(connection.as_ref()), request)
                    .await
            }
            Self::Transaction {
                transaction,
                context,
            } => route_transaction(context, RealTarget::Transaction(transaction), request).await,
        }
    }

    /// Repository for `E`: the sandbox's cached locking repository inside a
    /// sandbox, a plain one otherwise.
    pub fn repository<E>(&self) -> Arc<dyn FindOne<E>>
    where
        E: EntityTrait,
    {
        match self {
            Self::Sandbox(handle) => handle.repository::<E>(),
            _ => Arc::new(Repository::<E>::new(self.clone())),
        }
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
}

impl fmt::Debug for DataAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sandbox(handle) => f.debug_tuple("Sandbox").field(handle).finish(),
            Self::Connection { context, .. } => f
                .debug_struct("Connection")
                .field("context", &context.id())
                .finish(),
            Self::Transaction { context, .. } => f
                .debug_struct("Transaction")
                .field("context", &context.id())
                .finish(),
        }
    }
}

#[async_trait]
impl ConnectionTrait for DataAccess {
    fn get_database_backend(&self) -> DbBackend {
        match self {
            Self::Sandbox(handle) => handle.get_database_backend(),
            Self::Connection { connection, .. } => connection.get_database_backend(),
            Self::Transaction { transaction, .. } => transaction.get_database_backend(),
        }
    }

    async fn execute(&self, stmt: Statement) -> Result<ExecResult, DbErr> {
        match self {
            Self::Sandbox(handle) => handle.execute(stmt).await,
            Self::Connection { connection, .. } => connection.execute(stmt).await,
            Self::Transaction { transaction, .. } => transaction.execute(stmt).await,
        }
    }

    async fn execute_unprepared(&self, sql: &str) -> Result<ExecResult, DbErr> {
        match self {
            Self::Sandbox(handle) => handle.execute_unprepared(sql).await,
            Self::Connection { connection, .. } => connection.execute_unprepared(sql).await,
            Self::Transaction { transaction, .. } => transaction.execute_unprepared(sql).await,
        }
    }

    async fn query_one(&self, stmt: Statement) -> Result<Option<QueryResult>, DbErr> {
        match self {
            Self::Sandbox(handle) => handle.query_one(stmt).await,
            Self::Connection { connection, .. } => connection.query_one(stmt).await,
            Self::Transaction { transaction, .. } => transaction.query_one(stmt).await,
        }
    }

    async fn query_all(&self, stmt: Statement) -> Result<Vec<QueryResult>, DbErr> {
        match self {
            Self::Sandbox(handle) => handle.query_all(stmt).await,
            Self::Connection { connection, .. } => connection.query_all(stmt).await,
            Self::Transaction { transaction, .. } => transaction.query_all(stmt).await,
        }
    }

    fn is_mock_connection(&self) -> bool {
        match self {
            Self::Sandbox(handle) => handle.is_mock_connection(),
            Self::Connection { connection, .. } => connection.is_mock_connection(),
            Self::Transaction { transaction, .. } => transaction.is_mock_connection(),
        }
    }
}

enum RealTarget<'a> {
    Connection(&'a DatabaseConnection),
    Transaction(&'a DatabaseTransaction),
}

async fn route_transaction<F, Fut, T, E>(
    context: &Arc<IsolationContext>,
    target: RealTarget<'_>,
    request: TransactionRequest<F>,
) -> Result<T, TransactionError<E>>
where
    F: Fn(DataAccess) -> Fut + Send + Sync,
    Fut: Future<Output = Result<T, E>> + Send,
    T: Send,
    E: StdError + Send + Sync + 'static,
{
    let (level, callback) = request.into_parts();
    match context.active_store() {
        Some(store) => nested_in_sandbox(&store.scoped_handle(), level, &callback).await,
        None => run_real_transaction(context, target, level, &callback).await,
    }
}

async fn nested_in_sandbox<F, Fut, T, E>(
    handle: &ScopedHandle,
    level: Option<IsolationLevel>,
    callback: &F,
) -> Result<T, TransactionError<E>>
where
    F: Fn(DataAccess) -> Fut + Send + Sync,
    Fut: Future<Output = Result<T, E>> + Send,
    T: Send,
    E: StdError + Send + Sync + 'static,
{
    if let Some(level) = level {
        debug!(?level, "isolation level ignored for a transaction nested in a sandbox");
    }
    savepoint::run_in_savepoint(handle, callback).await
}

async fn run_real_transaction<F, Fut, T, E>(
    context: &Arc<IsolationContext>,
    target: RealTarget<'_>,
    level: Option<IsolationLevel>,
    callback: &F,
) -> Result<T, TransactionError<E>>
where
    F: Fn(DataAccess) -> Fut + Send + Sync,
    Fut: Future<Output = Result<T, E>> + Send,
    T: Send,
    E: StdError + Send + Sync + 'static,
{
    let transaction = match target {
        RealTarget::Connection(connection) => connection.begin_with_config(level, None).await?,
        RealTarget::Transaction(transaction) => transaction.begin().await?,
    };
    let transaction = Arc::new(transaction);

    let outcome = callback(DataAccess::Transaction {
        transaction: Arc::clone(&transaction),
        context: Arc::clone(context),
    })
    .await;

    let transaction =
        Arc::try_unwrap(transaction).map_err(|_| SandboxError::TransactionInUse)?;
    match outcome {
        Ok(value) => {
            transaction.commit().await?;
            Ok(value)
        }
        Err(error) => {
            if let Err(rollback_error) = transaction.rollback().await {
                warn!(%rollback_error, "failed to roll back transaction after callback error");
            }
            Err(TransactionError::Callback(error))
        }
    }
}

/// A database connection whose default handle is replaced by the running
/// test's sandbox, when there is one.
///
/// Clones share one [`IsolationContext`].
#[derive(Clone)]
pub struct SandboxedConnection {
    context: Arc<IsolationContext>,
}

impl SandboxedConnection {
    /// Wrap `connection`, which may be shared already as an
    /// `Arc<DatabaseConnection>`.
    pub fn new(connection: impl Into<Arc<DatabaseConnection>>) -> Self {
        Self::from_context(Arc::new(IsolationContext::new(connection.into())))
    }

    pub fn with_identity_source(
        connection: impl Into<Arc<DatabaseConnection>>,
        identity: Arc<dyn TestIdentitySource>,
    ) -> Self {
        Self::from_context(Arc::new(IsolationContext::with_identity_source(
            connection.into(),
            identity,
        )))
    }

    pub fn from_context(context: Arc<IsolationContext>) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &Arc<IsolationContext> {
        &self.context
    }

    pub fn original(&self) -> &DatabaseConnection {
        self.context.original()
    }

    pub fn is_initialized(&self) -> bool {
        !matches!(self.context.original(), DatabaseConnection::Disconnected)
    }

    pub fn active_store(&self) -> Option<Arc<TransactionStore>> {
        self.context.active_store()
    }

    /// The handle application code should use right now.
    pub fn handle(&self) -> DataAccess {
        match self.context.active_store() {
            Some(store) => DataAccess::Sandbox(store.scoped_handle()),
            None => DataAccess::Connection {
                connection: self.context.default_connection(),
                context: Arc::clone(&self.context),
            },
        }
    }

    /// Replace the handle returned outside of any sandbox.
    pub fn set_default_handle(&self, connection: impl Into<Arc<DatabaseConnection>>) {
        self.context.set_default_connection(connection.into());
    }

    pub fn reset_default_handle(&self) {
        self.context.reset_default_connection();
    }

    pub async fn transaction<F, Fut, T, E>(
        &self,
        request: TransactionRequest<F>,
    ) -> Result<T, TransactionError<E>>
    where
        F: Fn(DataAccess) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, E>> + Send,
        T: Send,
        E: StdError + Send + Sync + 'static,
    {
        route_transaction(
            &self.context,
            RealTarget::Connection(self.context.original()),
            request,
        )
        .await
    }
}

impl fmt::Debug for SandboxedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxedConnection")
            .field("context", &self.context.id())
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

#[async_trait]
impl ConnectionTrait for SandboxedConnection {
    fn get_database_backend(&self) -> DbBackend {
        self.handle().get_database_backend()
    }

    async fn execute(&self, stmt: Statement) -> Result<ExecResult, DbErr> {
        self.handle().execute(stmt).await
    }

    async fn execute_unprepared(&self, sql: &str) -> Result<ExecResult, DbErr> {
        self.handle().execute_unprepared(sql).await
    }

    async fn query_one(&self, stmt: Statement) -> Result<Option<QueryResult>, DbErr> {
        self.handle().query_one(stmt).await
    }

    async fn query_all(&self, stmt: Statement) -> Result<Vec<QueryResult>, DbErr> {
        self.handle().query_all(stmt).await
    }

    fn is_mock_connection(&self) -> bool {
        self.handle().is_mock_connection()
    }
}

static GLOBAL_REGISTRY: Lazy<Mutex<HashMap<String, Weak<IsolationContext>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Process-wide lookup of sandboxed connections by connection key, so every
/// part of a test suite that wraps "the same" connection shares one context.
///
/// Entries do not keep a context alive.
pub struct ConnectionRegistry;

impl ConnectionRegistry {
    /// The sandboxed connection registered under `key`, wrapping
    /// `connection` on first use.
    pub fn sandboxed(
        key: impl Into<String>,
        connection: impl Into<Arc<DatabaseConnection>>,
    ) -> SandboxedConnection {
        let key = key.into();
        let mut registry = GLOBAL_REGISTRY.lock();
        registry.retain(|_, context| context.strong_count() > 0);

        if let Some(context) = registry.get(&key).and_then(Weak::upgrade) {
            return SandboxedConnection::from_context(context);
        }

        debug!(%key, "registering sandboxed connection");
        let sandboxed = SandboxedConnection::new(connection);
        registry.insert(key, Arc::downgrade(sandboxed.context()));
        sandboxed
    }

    pub fn get(key: &str) -> Option<SandboxedConnection> {
        GLOBAL_REGISTRY
            .lock()
            .get(key)
            .and_then(Weak::upgrade)
            .map(SandboxedConnection::from_context)
    }

    pub fn remove(key: &str) -> Option<SandboxedConnection> {
        GLOBAL_REGISTRY
            .lock()
            .remove(key)
            .and_then(|context| context.upgrade())
            .map(SandboxedConnection::from_context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sea_orm::MockDatabase;

    fn noop(_: DataAccess) -> futures::future::Ready<Result<(), DbErr>> {
        futures::future::ready(Ok(()))
    }

    #[test]
    fn test_request_from_parts() {
        let request = TransactionRequest::from_parts(Some(IsolationLevel::Serializable), Some(noop))
            .unwrap();
        assert_eq!(request.isolation_level(), Some(&IsolationLevel::Serializable));

        let request = TransactionRequest::from_parts(None, Some(noop)).unwrap();
        assert!(request.isolation_level().is_none());

        let missing = TransactionRequest::<fn(DataAccess) -> futures::future::Ready<Result<(), DbErr>>>::from_parts(None, None);
        assert!(matches!(missing, Err(SandboxError::MissingCallback)));
    }

    #[test]
    #[serial_test::serial]
    fn test_registry_shares_one_context_per_key() {
        let first = ConnectionRegistry::sandboxed(
            "connection-registry-test",
            MockDatabase::new(DbBackend::Postgres).into_connection(),
        );
        let second = ConnectionRegistry::sandboxed(
            "connection-registry-test",
            MockDatabase::new(DbBackend::Postgres).into_connection(),
        );
        assert!(Arc::ptr_eq(first.context(), second.context()));

        let removed = ConnectionRegistry::remove("connection-registry-test").unwrap();
        assert!(Arc::ptr_eq(removed.context(), first.context()));
        assert!(ConnectionRegistry::get("connection-registry-test").is_none());
    }

    #[tokio::test]
    async fn test_shared_mock_connection_backs_the_default_handle() {
        let db = Arc::new(
            MockDatabase::new(DbBackend::Postgres)
                .append_exec_results([sea_orm::MockExecResult {
                    last_insert_id: 0,
                    rows_affected: 3,
                }])
                .into_connection(),
        );
        let sandboxed = SandboxedConnection::new(Arc::clone(&db));
        assert!(sandboxed.is_initialized());
        assert!(sandboxed.is_mock_connection());

        let handle = sandboxed.handle();
        let DataAccess::Connection { connection, .. } = &handle else {
            panic!("expected the unsandboxed handle, got {handle:?}");
        };
        assert!(Arc::ptr_eq(connection, &db));

        let result = handle.execute_unprepared("UPDATE widget SET name = 'x'").await.unwrap();
        assert_eq!(result.rows_affected(), 3);

        drop(handle);
        drop(sandboxed);
        let db = Arc::try_unwrap(db).unwrap();
        let log = db.into_transaction_log();
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_default_handle_can_be_replaced() {
        let sandboxed = SandboxedConnection::new(MockDatabase::new(DbBackend::Sqlite).into_connection());
        let replacement = Arc::new(DatabaseConnection::Disconnected);
        sandboxed.set_default_handle(Arc::clone(&replacement));

        let DataAccess::Connection { connection, .. } = sandboxed.handle() else {
            panic!("expected the unsandboxed handle");
        };
        assert!(Arc::ptr_eq(&connection, &replacement));

        sandboxed.reset_default_handle();
        let DataAccess::Connection { connection, .. } = sandboxed.handle() else {
            panic!("expected the unsandboxed handle");
        };
        assert!(Arc::ptr_eq(&connection, &sandboxed.context().shared_original()));
    }

    #[test]
    fn test_disconnected_connection_is_not_initialized() {
        let sandboxed = SandboxedConnection::new(DatabaseConnection::Disconnected);
        assert!(!sandboxed.is_initialized());
        assert!(!sandboxed.handle().is_sandboxed());
    }
}
