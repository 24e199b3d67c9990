use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::instrument;

use tally_core::{validate, BalanceRepository, BalanceSnapshot, Order, UserId, Withdrawal};
use tally_shared::Masked;

use crate::accounts::AccountService;
use crate::balance::BalanceAccount;
use crate::error::LedgerResult;
use crate::ledger::{ClaimOutcome, OrderLedger};
use crate::poller::PollQueue;
use crate::withdrawal::WithdrawalProcessor;

/// Inbound operations of the loyalty service, independent of transport.
#[derive(Clone)]
pub struct LoyaltyService {
    accounts: AccountService,
    ledger: OrderLedger,
    balance: BalanceAccount,
    withdrawals: WithdrawalProcessor,
    polls: PollQueue,
}

impl LoyaltyService {
    pub fn new(
        accounts: AccountService,
        ledger: OrderLedger,
        balances: Arc<dyn BalanceRepository>,
        polls: PollQueue,
    ) -> Self {
        Self {
            accounts,
            ledger,
            balance: BalanceAccount::new(balances.clone()),
            withdrawals: WithdrawalProcessor::new(balances),
            polls,
        }
    }

    #[instrument(skip(self, password))]
    pub async fn create_user(&self, login: &str, password: &Masked<String>) -> LedgerResult<UserId> {
        self.accounts.create_user(login, password).await
    }

    #[instrument(skip(self, password))]
    pub async fn authenticate(&self, login: &str, password: &Masked<String>) -> LedgerResult<UserId> {
        self.accounts.authenticate(login, password).await
    }

    /// Validate and claim an order; newly created orders are handed to the poller.
    #[instrument(skip(self))]
    pub async fn submit_order(&self, user_id: UserId, raw_number: &str) -> LedgerResult<ClaimOutcome> {
        let number = validate(raw_number)?;
        let outcome = self.ledger.claim(number, user_id).await?;

        if outcome == ClaimOutcome::Created {
            // A dropped enqueue is recovered by the next resync sweep
            self.polls.enqueue(number);
        }
        Ok(outcome)
    }

    #[instrument(skip(self))]
    pub async fn list_orders(&self, user_id: UserId) -> LedgerResult<Vec<Order>> {
        self.ledger.list_for_user(user_id).await
    }

    #[instrument(skip(self))]
    pub async fn get_balance(&self, user_id: UserId) -> LedgerResult<BalanceSnapshot> {
        self.balance.snapshot(user_id).await
    }

    #[instrument(skip(self))]
    pub async fn withdraw(
        &self,
        user_id: UserId,
        raw_label: &str,
        amount: Decimal,
    ) -> LedgerResult<Withdrawal> {
        self.withdrawals.withdraw(user_id, raw_label, amount).await
    }

    #[instrument(skip(self))]
    pub async fn list_withdrawals(&self, user_id: UserId) -> LedgerResult<Vec<Withdrawal>> {
        self.withdrawals.list(user_id).await
    }
}
