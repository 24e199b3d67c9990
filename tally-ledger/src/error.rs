use tally_core::{OrderNumber, OrderNumberError, OrderStatus, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("invalid order number: {0}")]
    Validation(#[from] OrderNumberError),

    #[error("order {0} is already claimed by another user")]
    OwnershipConflict(OrderNumber),

    #[error("insufficient funds")]
    InsufficientFunds,

    #[error("amount must be positive")]
    InvalidAmount,

    #[error("invalid state transition from {from} to {to}")]
    InvalidTransition {
        from: OrderStatus,
        to: OrderStatus,
    },

    #[error("invalid login or password")]
    Authentication,

    #[error("login is already taken")]
    LoginTaken,

    #[error("login and password are required")]
    MissingCredentials,

    #[error("order {0} not found")]
    OrderNotFound(OrderNumber),

    #[error("storage failure: {0}")]
    Storage(#[source] StoreError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for LedgerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::LoginTaken => LedgerError::LoginTaken,
            StoreError::InsufficientFunds => LedgerError::InsufficientFunds,
            StoreError::InvalidAmount => LedgerError::InvalidAmount,
            StoreError::OrderNotFound(number) => LedgerError::OrderNotFound(number),
            other => LedgerError::Storage(other),
        }
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;
