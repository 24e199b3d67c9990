use rust_decimal::Decimal;
use std::sync::Arc;

use tally_core::{
    is_storable_points, BalanceRepository, BalanceSnapshot, Credit, NewWithdrawal, UserId,
};

use crate::error::{LedgerError, LedgerResult};

/// Credit and debit operations on users' points balances.
#[derive(Clone)]
pub struct BalanceAccount {
    repo: Arc<dyn BalanceRepository>,
}

impl BalanceAccount {
    pub fn new(repo: Arc<dyn BalanceRepository>) -> Self {
        Self { repo }
    }

    /// Upsert-add `amount` to the user's balance.
    pub async fn credit(&self, user_id: UserId, amount: Decimal) -> LedgerResult<()> {
        let entry = Self::credit_entry(user_id, amount)?;
        self.repo.credit(entry.user_id(), entry.amount()).await?;
        Ok(())
    }

    /// A validated credit for a caller that writes it inside its own unit,
    /// such as an order transition into `PROCESSED`.
    pub fn credit_entry(user_id: UserId, amount: Decimal) -> LedgerResult<Credit> {
        Credit::new(user_id, amount).ok_or(LedgerError::InvalidAmount)
    }

    /// Fails with `InsufficientFunds`, balance unchanged, when `amount` exceeds the current balance.
    pub async fn debit(&self, user_id: UserId, amount: Decimal) -> LedgerResult<()> {
        ensure_positive(amount)?;
        self.repo.debit(user_id, amount, None).await?;
        Ok(())
    }

    /// Debit `record.amount` and persist `record` as one unit.
    pub(crate) async fn debit_with_record(&self, record: &NewWithdrawal) -> LedgerResult<()> {
        ensure_positive(record.amount)?;
        self.repo.debit(record.user_id, record.amount, Some(record)).await?;
        Ok(())
    }

    pub async fn current_balance(&self, user_id: UserId) -> LedgerResult<Decimal> {
        Ok(self.snapshot(user_id).await?.current)
    }

    pub async fn total_withdrawn(&self, user_id: UserId) -> LedgerResult<Decimal> {
        Ok(self.snapshot(user_id).await?.withdrawn)
    }

    /// Current balance and total withdrawn as of one point in time.
    pub async fn snapshot(&self, user_id: UserId) -> LedgerResult<BalanceSnapshot> {
        Ok(self.repo.snapshot(user_id).await?)
    }
}

/// Positive and at most two fractional digits; anything else would be rounded by the store.
fn ensure_positive(amount: Decimal) -> LedgerResult<()> {
    if amount <= Decimal::ZERO || !is_storable_points(amount) {
        return Err(LedgerError::InvalidAmount);
    }
    Ok(())
}
