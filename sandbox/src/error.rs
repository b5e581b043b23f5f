use sea_orm::DbErr;
use std::error::Error as StdError;
use thiserror::Error;

pub const NOT_INITIALIZED_MESSAGE: &str =
    "Transactional tests require an initialized database connection.";
pub const ALREADY_ACTIVE_MESSAGE: &str =
    "A transactional test context is already active for the provided database connection.";
pub const MISSING_CALLBACK_MESSAGE: &str = "Transaction callback is required.";
pub const RETRY_EXHAUSTED_MESSAGE: &str = "Exceeded maximum transaction retry attempts.";

/// Failures raised by the sandbox itself, independent of any callback.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Transactional tests require an initialized database connection.")]
    NotInitialized,

    #[error("A transactional test context is already active for the provided database connection.")]
    AlreadyActive,

    #[error("Transaction callback is required.")]
    MissingCallback,

    /// A handle to a real transaction was still held by someone else when the
    /// transaction had to be committed or rolled back.
    #[error("Transaction handle is still in use after its callback returned.")]
    TransactionInUse,

    #[error("Database error: {0}")]
    Database(#[from] DbErr),
}

/// Outcome of a `transaction` request that failed.
///
/// `E` is the callback's own error type; it is returned untouched unless the
/// retry budget ran out on a transient conflict.
#[derive(Debug, Error)]
pub enum TransactionError<E>
where
    E: StdError + 'static,
{
    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error(transparent)]
    Callback(E),

    #[error("Exceeded maximum transaction retry attempts.")]
    RetryExhausted {
        attempts: u32,
        #[source]
        source: E,
    },
}

impl<E> TransactionError<E>
where
    E: StdError + 'static,
{
    pub fn is_retry_exhausted(&self) -> bool {
        matches!(self, Self::RetryExhausted { .. })
    }

    /// The callback's error, whether it surfaced directly or after retries.
    pub fn callback_error(&self) -> Option<&E> {
        match self {
            Self::Callback(error) => Some(error),
            Self::RetryExhausted { source, .. } => Some(source),
            Self::Sandbox(_) => None,
        }
    }

    pub fn into_callback_error(self) -> Option<E> {
        match self {
            Self::Callback(error) => Some(error),
            Self::RetryExhausted { source, .. } => Some(source),
            Self::Sandbox(_) => None,
        }
    }
}

impl<E> From<DbErr> for TransactionError<E>
where
    E: StdError + 'static,
{
    fn from(error: DbErr) -> Self {
        Self::Sandbox(SandboxError::Database(error))
    }
}

pub type SandboxResult<T> = Result<T, SandboxError>;
