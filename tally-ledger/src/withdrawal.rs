use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::info;

use tally_core::{validate, BalanceRepository, NewWithdrawal, UserId, Withdrawal};

use crate::balance::BalanceAccount;
use crate::error::LedgerResult;

/// Spends points: the debit and its withdrawal record land together or not at all.
#[derive(Clone)]
pub struct WithdrawalProcessor {
    balance: BalanceAccount,
    records: Arc<dyn BalanceRepository>,
}

impl WithdrawalProcessor {
    pub fn new(records: Arc<dyn BalanceRepository>) -> Self {
        Self {
            balance: BalanceAccount::new(records.clone()),
            records,
        }
    }

    /// `raw_label` only has to be a well-formed order number; it need not be claimed.
    pub async fn withdraw(
        &self,
        user_id: UserId,
        raw_label: &str,
        amount: Decimal,
    ) -> LedgerResult<Withdrawal> {
        let label = validate(raw_label)?;
        let record = NewWithdrawal::new(user_id, label, amount);

        self.balance.debit_with_record(&record).await?;

        info!(user_id = %user_id, order = %label, %amount, "points withdrawn");
        Ok(Withdrawal::from(record))
    }

    /// Newest first.
    pub async fn list(&self, user_id: UserId) -> LedgerResult<Vec<Withdrawal>> {
        Ok(self.records.list_withdrawals(user_id).await?)
    }
}
