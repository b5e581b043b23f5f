use sandbox::{SandboxError, TransactionError};
use sea_orm::DbErr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ShopError {
    #[error("Product not found for sku: {0}")]
    ProductNotFound(String),

    #[error("User not found for email: {0}")]
    UserNotFound(String),

    #[error("Quantity must be greater than zero for sku: {0}")]
    NonPositiveQuantity(String),

    #[error("Insufficient inventory for sku: {0}")]
    InsufficientInventory(String),

    #[error("Database error: {0}")]
    Database(#[from] DbErr),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error("Gave up after {attempts} attempts: {source}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        source: Box<ShopError>,
    },
}

impl From<TransactionError<ShopError>> for ShopError {
    fn from(error: TransactionError<ShopError>) -> Self {
        match error {
            TransactionError::Sandbox(error) => ShopError::Sandbox(error),
            TransactionError::Callback(error) => error,
            TransactionError::RetryExhausted { attempts, source } => ShopError::RetryExhausted {
                attempts,
                source: Box::new(source),
            },
        }
    }
}

pub type ShopResult<T> = Result<T, ShopError>;
