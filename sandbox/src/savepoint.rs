use crate::connection::DataAccess;
use crate::error::TransactionError;
use crate::store::{ScopedHandle, TransactionStore};
use sea_orm::{DbErr, RuntimeErr};
use std::error::Error as StdError;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

pub const SAVEPOINT_PREFIX: &str = "sandbox_savepoint_";
pub const MAX_TRANSACTION_ATTEMPTS: u32 = 5;
pub const RETRY_DELAY_BASE: Duration = Duration::from_millis(5);

const DEADLOCK_MESSAGES: [&str; 2] = ["deadlock found when trying to get lock", "deadlock detected"];
const LOCK_TIMEOUT_MESSAGE: &str = "lock wait timeout exceeded";
const RECORD_CHANGED_MESSAGE: &str = "record has changed since last read";
const DATABASE_LOCKED_MESSAGE: &str = "database is locked";
const BUSY_MESSAGE: &str = "busy";

/// MySQL symbolic and numeric codes, plus PostgreSQL SQLSTATEs for
/// serialization failure, deadlock and lock-not-available.
const RETRYABLE_ERROR_CODES: [&str; 7] = [
    "ER_LOCK_DEADLOCK",
    "ER_LOCK_WAIT_TIMEOUT",
    "1213",
    "1205",
    "40001",
    "40P01",
    "55P03",
];

/// Class of transient conflict that makes a failed attempt worth retrying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictKind {
    Deadlock,
    LockWaitTimeout,
    RecordChanged,
    DatabaseLocked,
    Busy,
    ErrorCode(String),
}

/// Classify `error`, looking at every error in its source chain.
pub fn classify_conflict(error: &(dyn StdError + 'static)) -> Option<ConflictKind> {
    let mut current = Some(error);
    while let Some(error) = current {
        if let Some(kind) = classify_message(&error.to_string()) {
            return Some(kind);
        }
        if let Some(code) = driver_error_codes(error)
            .into_iter()
            .find(|code| RETRYABLE_ERROR_CODES.contains(&code.as_str()))
        {
            return Some(ConflictKind::ErrorCode(code));
        }
        current = error.source();
    }
    None
}

pub fn is_retryable(error: &(dyn StdError + 'static)) -> bool {
    classify_conflict(error).is_some()
}

fn classify_message(message: &str) -> Option<ConflictKind> {
    let message = message.to_lowercase();
    if DEADLOCK_MESSAGES.iter().any(|m| message.contains(m)) {
        Some(ConflictKind::Deadlock)
    } else if message.contains(LOCK_TIMEOUT_MESSAGE) {
        Some(ConflictKind::LockWaitTimeout)
    } else if message.contains(RECORD_CHANGED_MESSAGE) {
        Some(ConflictKind::RecordChanged)
    } else if message.contains(DATABASE_LOCKED_MESSAGE) {
        Some(ConflictKind::DatabaseLocked)
    } else if message.contains(BUSY_MESSAGE) {
        Some(ConflictKind::Busy)
    } else {
        None
    }
}

fn driver_error_codes(error: &(dyn StdError + 'static)) -> Vec<String> {
    if let Some(error) = error.downcast_ref::<DbErr>() {
        return match error {
            DbErr::Conn(RuntimeErr::SqlxError(error))
            | DbErr::Exec(RuntimeErr::SqlxError(error))
            | DbErr::Query(RuntimeErr::SqlxError(error)) => sqlx_error_codes(error),
            _ => Vec::new(),
        };
    }
    if let Some(error) = error.downcast_ref::<sqlx::Error>() {
        return sqlx_error_codes(error);
    }
    Vec::new()
}

fn sqlx_error_codes(error: &sqlx::Error) -> Vec<String> {
    let Some(database_error) = error.as_database_error() else {
        return Vec::new();
    };

    let mut codes = Vec::new();
    if let Some(code) = database_error.code() {
        codes.push(code.into_owned());
    }
    if let Some(mysql) = database_error.try_downcast_ref::<sqlx::mysql::MySqlDatabaseError>() {
        codes.push(mysql.number().to_string());
    }
    codes
}

/// Back-off before the retry that follows failed attempt number `attempt`.
pub fn retry_delay(attempt: u32) -> Duration {
    RETRY_DELAY_BASE * attempt * attempt
}

/// Run `callback` as a nested transaction of the sandbox behind `handle`,
/// inside `SAVEPOINT <prefix><n>`. Transient lock conflicts are retried up
/// to [`MAX_TRANSACTION_ATTEMPTS`] times with a quadratic back-off.
///
/// Savepoint creation failures surface as database errors. Releasing and
/// rolling back savepoints is best effort and never masks the callback's
/// own result.
pub(crate) async fn run_in_savepoint<F, Fut, T, E>(
    handle: &ScopedHandle,
    callback: &F,
) -> Result<T, TransactionError<E>>
where
    F: Fn(DataAccess) -> Fut + Send + Sync,
    Fut: Future<Output = Result<T, E>> + Send,
    T: Send,
    E: StdError + Send + Sync + 'static,
{
    let store = handle.store();

    if !store.is_transaction_open().await {
        debug!(
            store = store.id(),
            "sandbox transaction is closed; running callback without a savepoint"
        );
        return callback(DataAccess::Sandbox(handle.clone()))
            .await
            .map_err(TransactionError::Callback);
    }

    let mut attempt: u32 = 0;
    loop {
        let savepoint = store.next_savepoint_name();
        store
            .execute_unprepared(&format!("SAVEPOINT {savepoint}"))
            .await?;
        debug!(store = store.id(), %savepoint, attempt = attempt + 1, "savepoint opened");

        match callback(DataAccess::Sandbox(handle.clone())).await {
            Ok(value) => {
                release_savepoint(store, &savepoint).await;
                return Ok(value);
            }
            Err(error) => {
                rollback_to_savepoint(store, &savepoint).await;
                release_savepoint(store, &savepoint).await;
                attempt += 1;

                let Some(conflict) = classify_conflict(&error) else {
                    return Err(TransactionError::Callback(error));
                };
                if attempt >= MAX_TRANSACTION_ATTEMPTS {
                    warn!(
                        store = store.id(),
                        attempts = attempt,
                        ?conflict,
                        "giving up on nested transaction after repeated conflicts"
                    );
                    return Err(TransactionError::RetryExhausted {
                        attempts: attempt,
                        source: error,
                    });
                }

                let delay = retry_delay(attempt);
                debug!(store = store.id(), attempt, ?conflict, ?delay, "retrying nested transaction");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

async fn rollback_to_savepoint(store: &TransactionStore, savepoint: &str) {
    if let Err(error) = store
        .execute_unprepared(&format!("ROLLBACK TO SAVEPOINT {savepoint}"))
        .await
    {
        warn!(store = store.id(), %savepoint, %error, "failed to roll back to savepoint");
    }
}

async fn release_savepoint(store: &TransactionStore, savepoint: &str) {
    if let Err(error) = store
        .execute_unprepared(&format!("RELEASE SAVEPOINT {savepoint}"))
        .await
    {
        warn!(store = store.id(), %savepoint, %error, "failed to release savepoint");
    }
}
