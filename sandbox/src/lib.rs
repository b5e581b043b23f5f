pub mod config;
pub mod connection;
pub mod context;
pub mod error;
pub mod identity;
pub mod lifecycle;
pub mod lock;
pub mod savepoint;
pub mod store;

pub use config::SandboxOptions;
pub use connection::{ConnectionRegistry, DataAccess, SandboxedConnection, TransactionRequest};
pub use context::{IsolationContext, ResolverSnapshot};
pub use error::{SandboxError, SandboxResult, TransactionError};
pub use identity::{
    DefaultIdentitySource, NoIdentity, TestIdentity, TestIdentitySource, with_test_identity,
};
pub use lifecycle::{
    Hook, HookError, HookFuture, HookRegistry, TestHooks, TestSandbox,
    register_transactional_hooks,
};
pub use lock::{
    Criteria, Criterion, FindOne, FindOneOptions, LockingRepository, Repository,
    supports_row_locks,
};
pub use savepoint::{ConflictKind, MAX_TRANSACTION_ATTEMPTS, classify_conflict, is_retryable};
pub use store::{ScopedHandle, TransactionStore};
