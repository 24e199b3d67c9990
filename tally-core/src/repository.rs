use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::models::{
    is_storable_points, BalanceSnapshot, ClaimRow, NewWithdrawal, Order, OrderNumber,
    OrderTransition, TransitionWrite, User, UserId, Withdrawal,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("login is already taken")]
    LoginTaken,
    #[error("insufficient funds")]
    InsufficientFunds,
    #[error("amount is not a storable points value")]
    InvalidAmount,
    #[error("order {0} not found")]
    OrderNotFound(OrderNumber),
    #[error("storage backend failure: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl StoreError {
    pub fn backend<E>(err: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        StoreError::Backend(err.into())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Balance writes only take positive amounts the points columns hold exactly.
pub fn ensure_storable_amount(amount: Decimal) -> StoreResult<()> {
    if amount <= Decimal::ZERO || !is_storable_points(amount) {
        return Err(StoreError::InvalidAmount);
    }
    Ok(())
}

/// Repository trait for user accounts
#[async_trait]
pub trait UserRepository: Send + Sync {
    /// Fails with `LoginTaken` when the unique login key is already used.
    async fn create_user(&self, login: &str, password_hash: &str) -> StoreResult<UserId>;

    async fn find_by_login(&self, login: &str) -> StoreResult<Option<User>>;
}

/// Repository trait for claimed orders
#[async_trait]
pub trait OrderRepository: Send + Sync {
    /// Single atomic insert guarded by the order number key.
    async fn insert_if_absent(
        &self,
        number: OrderNumber,
        owner: UserId,
        uploaded_at: DateTime<Utc>,
    ) -> StoreResult<ClaimRow>;

    async fn get_order(&self, number: OrderNumber) -> StoreResult<Option<Order>>;

    /// Compare-and-set the status; applies `transition.credit` in the same unit.
    async fn transition(
        &self,
        number: OrderNumber,
        transition: &OrderTransition,
    ) -> StoreResult<TransitionWrite>;

    /// Newest first.
    async fn list_for_user(&self, user_id: UserId) -> StoreResult<Vec<Order>>;

    /// Non-terminal orders that are not flagged stalled, oldest first.
    async fn list_pending(&self, limit: usize) -> StoreResult<Vec<Order>>;

    async fn flag_stalled(&self, number: OrderNumber) -> StoreResult<()>;
}

/// Repository trait for points balances and withdrawal records
#[async_trait]
pub trait BalanceRepository: Send + Sync {
    /// Upsert-add; never overwrites an existing balance.
    async fn credit(&self, user_id: UserId, amount: Decimal) -> StoreResult<()>;

    /// Conditional decrement; inserts `record` in the same unit when given.
    /// Fails with `InsufficientFunds` and leaves everything unchanged when `amount > current`.
    async fn debit(
        &self,
        user_id: UserId,
        amount: Decimal,
        record: Option<&NewWithdrawal>,
    ) -> StoreResult<()>;

    async fn snapshot(&self, user_id: UserId) -> StoreResult<BalanceSnapshot>;

    /// Newest first.
    async fn list_withdrawals(&self, user_id: UserId) -> StoreResult<Vec<Withdrawal>>;
}
