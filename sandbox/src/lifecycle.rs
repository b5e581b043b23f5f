use crate::config::SandboxOptions;
use crate::connection::{DataAccess, SandboxedConnection};
use crate::error::SandboxError;
use crate::identity::{TestIdentity, with_test_identity};
use crate::lock::supports_row_locks;
use crate::store::TransactionStore;
use futures::FutureExt;
use futures::future::BoxFuture;
use sea_orm::{ConnectionTrait, TransactionTrait};
use std::any::Any;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Starts and ends the sandbox for one test at a time on a connection.
pub struct TestSandbox {
    connection: SandboxedConnection,
    options: SandboxOptions,
}

impl TestSandbox {
    pub fn new(connection: &SandboxedConnection) -> Self {
        Self::with_options(connection, SandboxOptions::default())
    }

    pub fn with_options(connection: &SandboxedConnection, options: SandboxOptions) -> Self {
        Self {
            connection: connection.clone(),
            options,
        }
    }

    pub fn connection(&self) -> &SandboxedConnection {
        &self.connection
    }

    pub fn options(&self) -> &SandboxOptions {
        &self.options
    }

    /// Open the sandbox transaction and make it the connection's default
    /// handle for the calling test.
    pub async fn init(&self) -> Result<(), SandboxError> {
        if !self.connection.is_initialized() {
            return Err(SandboxError::NotInitialized);
        }

        let context = self.connection.context();
        if context.active_store().is_some() {
            return Err(SandboxError::AlreadyActive);
        }

        let transaction = self
            .connection
            .original()
            .begin_with_config(self.options.isolation_level.clone(), None)
            .await?;
        let locking =
            self.options.pessimistic_locks && supports_row_locks(transaction.get_database_backend());

        let store = TransactionStore::new(context.id(), transaction, locking);
        context.bind(&store);
        info!(
            store = store.id(),
            isolation_level = ?self.options.isolation_level,
            locking,
            "sandbox transaction started"
        );
        Ok(())
    }

    /// Roll back and release the calling test's sandbox. Does nothing when
    /// none was started.
    pub async fn finish(&self) -> Result<(), SandboxError> {
        let context = self.connection.context();
        let Some(store) = context.resolve() else {
            return Ok(());
        };

        let rolled_back = store.close().await;
        context.unbind(&store);

        match rolled_back {
            Ok(()) => {
                info!(store = store.id(), "sandbox finished");
                Ok(())
            }
            Err(error) => {
                warn!(store = store.id(), %error, "sandbox rollback failed");
                Err(error.into())
            }
        }
    }

    pub async fn before_each(&self) -> Result<(), SandboxError> {
        self.init().await
    }

    pub async fn after_each(&self) -> Result<(), SandboxError> {
        self.finish().await
    }

    /// Run `body` inside a fresh sandbox that is always finished afterwards,
    /// even if `body` panics.
    pub async fn run<F, Fut, T, E>(&self, body: F) -> Result<T, E>
    where
        F: FnOnce(DataAccess) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<SandboxError>,
    {
        self.init().await?;
        let outcome = AssertUnwindSafe(body(self.connection.handle()))
            .catch_unwind()
            .await;
        let finished = self.finish().await;

        match outcome {
            Err(payload) => panic::resume_unwind(payload),
            Ok(Err(error)) => {
                if let Err(finish_error) = finished {
                    warn!(%finish_error, "sandbox cleanup failed after test error");
                }
                Err(error)
            }
            Ok(Ok(value)) => {
                finished?;
                Ok(value)
            }
        }
    }
}

pub type HookFuture = BoxFuture<'static, Result<(), SandboxError>>;
pub type Hook = Arc<dyn Fn() -> HookFuture + Send + Sync>;

/// A test runner's per-test hook registration.
pub trait TestHooks {
    fn before_each(&mut self, hook: Hook);

    fn after_each(&mut self, hook: Hook);
}

/// Register sandbox init/finish as before/after hooks of `hooks`.
pub fn register_transactional_hooks<H>(
    connection: &SandboxedConnection,
    hooks: &mut H,
    options: SandboxOptions,
) -> Arc<TestSandbox>
where
    H: TestHooks + ?Sized,
{
    let sandbox = Arc::new(TestSandbox::with_options(connection, options));

    let before = Arc::clone(&sandbox);
    hooks.before_each(Arc::new(move || {
        let sandbox = Arc::clone(&before);
        async move { sandbox.init().await }.boxed()
    }));

    let after = Arc::clone(&sandbox);
    hooks.after_each(Arc::new(move || {
        let sandbox = Arc::clone(&after);
        async move { sandbox.finish().await }.boxed()
    }));

    sandbox
}

#[derive(Debug, Error)]
pub enum HookError {
    #[error("before-each hook failed for {test}: {source}")]
    Before {
        test: String,
        #[source]
        source: SandboxError,
    },

    #[error("after-each hook failed for {test}: {source}")]
    After {
        test: String,
        #[source]
        source: SandboxError,
    },

    #[error("test {test} panicked: {message}")]
    Panicked { test: String, message: String },

    #[error("test task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Minimal in-process test runner: each test runs in its own tokio task with
/// its identity bound, wrapped in the registered hooks.
#[derive(Default, Clone)]
pub struct HookRegistry {
    before: Vec<Hook>,
    after: Vec<Hook>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn before_count(&self) -> usize {
        self.before.len()
    }

    pub fn after_count(&self) -> usize {
        self.after.len()
    }

    /// Run `body` as the test `identity`. After hooks run even when a
    /// before hook or the body fails; the first failure is reported.
    pub async fn run_test<F, Fut, T>(&self, identity: TestIdentity, body: F) -> Result<T, HookError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let before = self.before.clone();
        let after = self.after.clone();
        let test = identity.to_string();

        let task = tokio::spawn(with_test_identity(identity, async move {
            let mut before_error = None;
            for hook in &before {
                if let Err(source) = hook().await {
                    before_error = Some(source);
                    break;
                }
            }

            let outcome = match before_error {
                Some(source) => Err(HookError::Before {
                    test: test.clone(),
                    source,
                }),
                None => AssertUnwindSafe(body())
                    .catch_unwind()
                    .await
                    .map_err(|payload| HookError::Panicked {
                        test: test.clone(),
                        message: panic_message(payload.as_ref()),
                    }),
            };

            let mut after_error = None;
            for hook in &after {
                if let Err(source) = hook().await {
                    after_error.get_or_insert(source);
                }
            }

            match (outcome, after_error) {
                (Err(error), _) => Err(error),
                (Ok(_), Some(source)) => Err(HookError::After { test, source }),
                (Ok(value), None) => Ok(value),
            }
        }));

        task.await?
    }
}

impl TestHooks for HookRegistry {
    fn before_each(&mut self, hook: Hook) {
        self.before.push(hook);
    }

    fn after_each(&mut self, hook: Hook) {
        self.after.push(hook);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
