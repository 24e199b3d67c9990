use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rust_decimal::Decimal;

use tally_core::repository::{BalanceRepository, OrderRepository, UserRepository};
use tally_core::{
    ensure_storable_amount, BalanceSnapshot, ClaimRow, NewWithdrawal, Order, OrderNumber,
    OrderTransition, StoreError, StoreResult, TransitionWrite, User, UserId, Withdrawal,
};

/// In-memory storage collaborator.
///
/// Each map is sharded, so only requests touching the same order or the same
/// user account contend. Locks are always taken orders first, then accounts.
#[derive(Default)]
pub struct MemoryStore {
    users: DashMap<String, User>,
    orders: DashMap<OrderNumber, Order>,
    accounts: DashMap<UserId, Account>,
}

#[derive(Default)]
struct Account {
    current: Decimal,
    withdrawals: Vec<Withdrawal>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UserRepository for MemoryStore {
    async fn create_user(&self, login: &str, password_hash: &str) -> StoreResult<UserId> {
        match self.users.entry(login.to_string()) {
            Entry::Occupied(_) => Err(StoreError::LoginTaken),
            Entry::Vacant(slot) => {
                let id = UserId::new();
                slot.insert(User {
                    id,
                    login: login.to_string(),
                    password_hash: password_hash.to_string(),
                });
                Ok(id)
            }
        }
    }

    async fn find_by_login(&self, login: &str) -> StoreResult<Option<User>> {
        Ok(self.users.get(login).map(|u| u.clone()))
    }
}

#[async_trait]
impl OrderRepository for MemoryStore {
    async fn insert_if_absent(
        &self,
        number: OrderNumber,
        owner: UserId,
        uploaded_at: DateTime<Utc>,
    ) -> StoreResult<ClaimRow> {
        match self.orders.entry(number) {
            Entry::Occupied(existing) => Ok(ClaimRow::Existing {
                owner: existing.get().user_id,
            }),
            Entry::Vacant(slot) => {
                slot.insert(Order::new(number, owner, uploaded_at));
                Ok(ClaimRow::Inserted)
            }
        }
    }

    async fn get_order(&self, number: OrderNumber) -> StoreResult<Option<Order>> {
        Ok(self.orders.get(&number).map(|o| o.clone()))
    }

    async fn transition(
        &self,
        number: OrderNumber,
        transition: &OrderTransition,
    ) -> StoreResult<TransitionWrite> {
        let mut order = self
            .orders
            .get_mut(&number)
            .ok_or(StoreError::OrderNotFound(number))?;

        if order.status != transition.expected {
            return Ok(TransitionWrite::Stale {
                current: order.status,
            });
        }

        if let Some(credit) = transition.credit {
            if credit.user_id() != order.user_id {
                return Err(StoreError::backend(format!(
                    "credit for order {number} addressed to {} but owner is {}",
                    credit.user_id(),
                    order.user_id
                )));
            }
            // Still holding the order entry: status and credit become visible together
            self.accounts.entry(credit.user_id()).or_default().current += credit.amount();
        }

        order.status = transition.next;
        if transition.accrual.is_some() {
            order.accrual = transition.accrual;
        }

        Ok(TransitionWrite::Applied)
    }

    async fn list_for_user(&self, user_id: UserId) -> StoreResult<Vec<Order>> {
        let mut orders: Vec<Order> = self
            .orders
            .iter()
            .filter(|o| o.user_id == user_id)
            .map(|o| o.clone())
            .collect();
        orders.sort_by(|a, b| b.uploaded_at.cmp(&a.uploaded_at));
        Ok(orders)
    }

    async fn list_pending(&self, limit: usize) -> StoreResult<Vec<Order>> {
        let mut pending: Vec<Order> = self
            .orders
            .iter()
            .filter(|o| !o.status.is_terminal() && o.stalled_at.is_none())
            .map(|o| o.clone())
            .collect();
        pending.sort_by(|a, b| a.uploaded_at.cmp(&b.uploaded_at));
        pending.truncate(limit);
        Ok(pending)
    }

    async fn flag_stalled(&self, number: OrderNumber) -> StoreResult<()> {
        let mut order = self
            .orders
            .get_mut(&number)
            .ok_or(StoreError::OrderNotFound(number))?;
        if order.stalled_at.is_none() {
            order.stalled_at = Some(Utc::now());
        }
        Ok(())
    }
}

#[async_trait]
impl BalanceRepository for MemoryStore {
    async fn credit(&self, user_id: UserId, amount: Decimal) -> StoreResult<()> {
        ensure_storable_amount(amount)?;
        self.accounts.entry(user_id).or_default().current += amount;
        Ok(())
    }

    async fn debit(
        &self,
        user_id: UserId,
        amount: Decimal,
        record: Option<&NewWithdrawal>,
    ) -> StoreResult<()> {
        ensure_storable_amount(amount)?;
        if let Some(w) = record {
            ensure_storable_amount(w.amount)?;
        }
        let mut account = self
            .accounts
            .get_mut(&user_id)
            .ok_or(StoreError::InsufficientFunds)?;

        if account.current < amount {
            return Err(StoreError::InsufficientFunds);
        }

        account.current -= amount;
        if let Some(w) = record {
            account.withdrawals.push(Withdrawal::from(w.clone()));
        }
        Ok(())
    }

    async fn snapshot(&self, user_id: UserId) -> StoreResult<BalanceSnapshot> {
        Ok(self
            .accounts
            .get(&user_id)
            .map(|a| BalanceSnapshot {
                current: a.current,
                withdrawn: a.withdrawals.iter().map(|w| w.amount).sum(),
            })
            .unwrap_or_default())
    }

    async fn list_withdrawals(&self, user_id: UserId) -> StoreResult<Vec<Withdrawal>> {
        let mut withdrawals = self
            .accounts
            .get(&user_id)
            .map(|a| a.withdrawals.clone())
            .unwrap_or_default();
        withdrawals.sort_by(|a, b| b.processed_at.cmp(&a.processed_at));
        Ok(withdrawals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tally_core::{Credit, OrderStatus};

    fn number(n: i64) -> OrderNumber {
        OrderNumber::new_unchecked(n)
    }

    #[tokio::test]
    async fn test_concurrent_inserts_have_one_winner() {
        let store = Arc::new(MemoryStore::new());
        let mut handles = Vec::new();
        for _ in 0..32 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .insert_if_absent(number(12345678903), UserId::new(), Utc::now())
                    .await
                    .unwrap()
            }));
        }

        let mut inserted = 0;
        for handle in handles {
            if handle.await.unwrap() == ClaimRow::Inserted {
                inserted += 1;
            }
        }
        assert_eq!(inserted, 1);
    }

    #[tokio::test]
    async fn test_transition_is_compare_and_set() {
        let store = MemoryStore::new();
        let owner = UserId::new();
        store.insert_if_absent(number(79927398713), owner, Utc::now()).await.unwrap();

        let to_processed = OrderTransition {
            expected: OrderStatus::Registered,
            next: OrderStatus::Processed,
            accrual: Some(Decimal::from(500)),
            credit: Credit::new(owner, Decimal::from(500)),
        };
        assert_eq!(
            store.transition(number(79927398713), &to_processed).await.unwrap(),
            TransitionWrite::Applied
        );
        assert_eq!(
            store.transition(number(79927398713), &to_processed).await.unwrap(),
            TransitionWrite::Stale { current: OrderStatus::Processed }
        );
        assert_eq!(store.snapshot(owner).await.unwrap().current, Decimal::from(500));
    }

    #[tokio::test]
    async fn test_debit_beyond_balance_changes_nothing() {
        let store = MemoryStore::new();
        let user = UserId::new();
        store.credit(user, Decimal::from(100)).await.unwrap();

        let record = NewWithdrawal::new(user, number(12345678903), Decimal::from(150));
        let err = store.debit(user, Decimal::from(150), Some(&record)).await.unwrap_err();
        assert!(matches!(err, StoreError::InsufficientFunds));

        let snapshot = store.snapshot(user).await.unwrap();
        assert_eq!(snapshot.current, Decimal::from(100));
        assert_eq!(snapshot.withdrawn, Decimal::ZERO);
        assert!(store.list_withdrawals(user).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_credit_leaves_order_unprocessed() {
        let store = MemoryStore::new();
        let (owner, stranger) = (UserId::new(), UserId::new());
        store.insert_if_absent(number(12345678903), owner, Utc::now()).await.unwrap();

        let misaddressed = OrderTransition {
            expected: OrderStatus::Registered,
            next: OrderStatus::Processed,
            accrual: Some(Decimal::from(500)),
            credit: Credit::new(stranger, Decimal::from(500)),
        };
        let err = store.transition(number(12345678903), &misaddressed).await.unwrap_err();
        assert!(matches!(err, StoreError::Backend(_)));

        let order = store.get_order(number(12345678903)).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Registered);
        assert_eq!(order.accrual, None);
        assert_eq!(store.snapshot(owner).await.unwrap().current, Decimal::ZERO);
        assert_eq!(store.snapshot(stranger).await.unwrap().current, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_sub_cent_amounts_are_refused() {
        let store = MemoryStore::new();
        let user = UserId::new();
        store.credit(user, Decimal::from(100)).await.unwrap();

        let err = store.credit(user, Decimal::new(4, 3)).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidAmount));
        let record = NewWithdrawal::new(user, number(12345678903), Decimal::new(10005, 3));
        let err = store.debit(user, record.amount, Some(&record)).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidAmount));

        let snapshot = store.snapshot(user).await.unwrap();
        assert_eq!(snapshot.current, Decimal::from(100));
        assert_eq!(snapshot.withdrawn, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_pending_excludes_terminal_and_stalled() {
        let store = MemoryStore::new();
        let owner = UserId::new();
        for n in [1, 2, 3] {
            store.insert_if_absent(number(n), owner, Utc::now()).await.unwrap();
        }
        store
            .transition(
                number(2),
                &OrderTransition {
                    expected: OrderStatus::Registered,
                    next: OrderStatus::Invalid,
                    accrual: None,
                    credit: None,
                },
            )
            .await
            .unwrap();
        store.flag_stalled(number(3)).await.unwrap();

        let pending = store.list_pending(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].number, number(1));
    }
}
