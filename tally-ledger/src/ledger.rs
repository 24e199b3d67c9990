use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, error, info};

use tally_core::{
    is_storable_points, ClaimRow, Credit, Order, OrderNumber, OrderRepository, OrderStatus,
    OrderTransition, TransitionWrite, UserId,
};

use crate::balance::BalanceAccount;
use crate::error::{LedgerError, LedgerResult};

/// Concurrent writers can move an order at most this many times before `apply` gives up.
const MAX_STALE_RETRIES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    Created,
    AlreadyOwnedBySelf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Status (and accrual) written; `credited` is set on the edge into `PROCESSED`.
    Applied { credited: Option<Decimal> },
    /// Repeat observation of a terminal order.
    NoOp,
}

#[derive(Debug, PartialEq, Eq)]
enum Plan {
    NoOp,
    Write(OrderTransition),
}

/// Decide what observing `next` means for an order currently in `current`.
fn plan(
    current: OrderStatus,
    owner: UserId,
    next: OrderStatus,
    points: Option<Decimal>,
) -> LedgerResult<Plan> {
    if current.is_terminal() {
        if next == current {
            return Ok(Plan::NoOp);
        }
        return Err(LedgerError::InvalidTransition { from: current, to: next });
    }

    if next.rank() < current.rank() {
        return Err(LedgerError::InvalidTransition { from: current, to: next });
    }

    if points.is_some_and(|p| p < Decimal::ZERO || !is_storable_points(p)) {
        return Err(LedgerError::InvalidAmount);
    }

    // current is non-terminal here, so this is the first time the order reaches PROCESSED
    let credit: Option<Credit> = match (next, points) {
        (OrderStatus::Processed, Some(p)) if p > Decimal::ZERO => {
            Some(BalanceAccount::credit_entry(owner, p)?)
        }
        _ => None,
    };

    Ok(Plan::Write(OrderTransition {
        expected: current,
        next,
        accrual: points,
        credit,
    }))
}

/// Owns order claims and the status state machine.
#[derive(Clone)]
pub struct OrderLedger {
    orders: Arc<dyn OrderRepository>,
}

impl OrderLedger {
    pub fn new(orders: Arc<dyn OrderRepository>) -> Self {
        Self { orders }
    }

    /// Bind `number` to `user_id`. The first claim wins; later claims by others conflict.
    pub async fn claim(&self, number: OrderNumber, user_id: UserId) -> LedgerResult<ClaimOutcome> {
        match self.orders.insert_if_absent(number, user_id, Utc::now()).await? {
            ClaimRow::Inserted => {
                info!(order = %number, user_id = %user_id, "order claimed");
                Ok(ClaimOutcome::Created)
            }
            ClaimRow::Existing { owner } if owner == user_id => Ok(ClaimOutcome::AlreadyOwnedBySelf),
            ClaimRow::Existing { .. } => Err(LedgerError::OwnershipConflict(number)),
        }
    }

    /// Apply an upstream observation. Safe to call repeatedly with the same observation.
    pub async fn apply(
        &self,
        number: OrderNumber,
        new_status: OrderStatus,
        points: Option<Decimal>,
    ) -> LedgerResult<ApplyOutcome> {
        let order = self
            .orders
            .get_order(number)
            .await?
            .ok_or(LedgerError::OrderNotFound(number))?;

        let mut current = order.status;
        for _ in 0..MAX_STALE_RETRIES {
            let transition = match plan(current, order.user_id, new_status, points) {
                Ok(Plan::NoOp) => {
                    debug!(order = %number, status = %current, "repeat observation ignored");
                    return Ok(ApplyOutcome::NoOp);
                }
                Ok(Plan::Write(transition)) => transition,
                Err(e) => {
                    error!(order = %number, error = %e, "rejected accrual observation");
                    return Err(e);
                }
            };

            match self.orders.transition(number, &transition).await? {
                TransitionWrite::Applied => {
                    let credited = transition.credit.map(|c| c.amount());
                    info!(
                        order = %number,
                        from = %current,
                        to = %new_status,
                        credited = ?credited,
                        "order status updated"
                    );
                    return Ok(ApplyOutcome::Applied { credited });
                }
                TransitionWrite::Stale { current: latest } => {
                    debug!(
                        order = %number,
                        expected = %current,
                        actual = %latest,
                        "order moved, re-planning"
                    );
                    current = latest;
                }
            }
        }

        Err(LedgerError::Internal(format!(
            "order {number} kept changing while applying {new_status}"
        )))
    }

    pub async fn get(&self, number: OrderNumber) -> LedgerResult<Option<Order>> {
        Ok(self.orders.get_order(number).await?)
    }

    pub async fn list_for_user(&self, user_id: UserId) -> LedgerResult<Vec<Order>> {
        Ok(self.orders.list_for_user(user_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::BalanceRepository;
    use tally_store::MemoryStore;

    const ORDER: i64 = 12345678903;

    fn setup() -> (Arc<MemoryStore>, OrderLedger) {
        let store = Arc::new(MemoryStore::new());
        (store.clone(), OrderLedger::new(store))
    }

    #[test]
    fn test_plan_rejects_leaving_terminal_state() {
        let owner = UserId::new();
        for terminal in [OrderStatus::Processed, OrderStatus::Invalid] {
            for next in [OrderStatus::Registered, OrderStatus::Processing] {
                assert!(matches!(
                    plan(terminal, owner, next, None),
                    Err(LedgerError::InvalidTransition { .. })
                ));
            }
        }
        assert!(matches!(
            plan(OrderStatus::Invalid, owner, OrderStatus::Processed, Some(Decimal::TEN)),
            Err(LedgerError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_plan_rejects_moving_backward() {
        assert!(matches!(
            plan(OrderStatus::Processing, UserId::new(), OrderStatus::Registered, None),
            Err(LedgerError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_plan_credits_only_positive_processed() {
        let owner = UserId::new();

        let five_hundred = Some(Decimal::from(500));
        let Plan::Write(t) =
            plan(OrderStatus::Registered, owner, OrderStatus::Processed, five_hundred).unwrap()
        else {
            panic!("expected a write");
        };
        assert_eq!(t.credit, Credit::new(owner, Decimal::from(500)));

        let zero = Some(Decimal::ZERO);
        let Plan::Write(t) =
            plan(OrderStatus::Processing, owner, OrderStatus::Processed, zero).unwrap()
        else {
            panic!("expected a write");
        };
        assert_eq!(t.credit, None);

        let Plan::Write(t) =
            plan(OrderStatus::Registered, owner, OrderStatus::Invalid, None).unwrap()
        else {
            panic!("expected a write");
        };
        assert_eq!(t.credit, None);
        assert_eq!(t.expected, OrderStatus::Registered);
    }

    #[test]
    fn test_plan_rejects_sub_cent_accrual() {
        let owner = UserId::new();
        for points in [Decimal::new(4, 3), Decimal::new(10005, 3)] {
            assert!(matches!(
                plan(OrderStatus::Registered, owner, OrderStatus::Processed, Some(points)),
                Err(LedgerError::InvalidAmount)
            ));
            assert!(matches!(
                plan(OrderStatus::Registered, owner, OrderStatus::Processing, Some(points)),
                Err(LedgerError::InvalidAmount)
            ));
        }
    }

    #[tokio::test]
    async fn test_sub_cent_accrual_leaves_order_untouched() {
        let (store, ledger) = setup();
        let owner = UserId::new();
        let number = OrderNumber::new_unchecked(ORDER);
        ledger.claim(number, owner).await.unwrap();

        let err = ledger
            .apply(number, OrderStatus::Processed, Some(Decimal::new(4, 3)))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidAmount));

        let order = ledger.get(number).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Registered);
        assert_eq!(order.accrual, None);
        assert_eq!(store.snapshot(owner).await.unwrap().current, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_claim_outcomes() {
        let (_, ledger) = setup();
        let (alice, bob) = (UserId::new(), UserId::new());
        let number = OrderNumber::new_unchecked(ORDER);

        assert_eq!(ledger.claim(number, alice).await.unwrap(), ClaimOutcome::Created);
        assert_eq!(ledger.claim(number, alice).await.unwrap(), ClaimOutcome::AlreadyOwnedBySelf);
        assert!(matches!(
            ledger.claim(number, bob).await,
            Err(LedgerError::OwnershipConflict(n)) if n == number
        ));
    }

    #[tokio::test]
    async fn test_repeat_processed_observation_credits_once() {
        let (store, ledger) = setup();
        let owner = UserId::new();
        let number = OrderNumber::new_unchecked(ORDER);
        ledger.claim(number, owner).await.unwrap();

        let points = Some(Decimal::from(500));
        let first = ledger.apply(number, OrderStatus::Processed, points).await.unwrap();
        assert_eq!(first, ApplyOutcome::Applied { credited: Some(Decimal::from(500)) });

        let second = ledger.apply(number, OrderStatus::Processed, points).await.unwrap();
        assert_eq!(second, ApplyOutcome::NoOp);

        assert_eq!(store.snapshot(owner).await.unwrap().current, Decimal::from(500));
        let order = ledger.get(number).await.unwrap().unwrap();
        assert_eq!(order.accrual, Some(Decimal::from(500)));
    }

    #[tokio::test]
    async fn test_lifecycle_through_processing() {
        let (store, ledger) = setup();
        let owner = UserId::new();
        let number = OrderNumber::new_unchecked(ORDER);
        ledger.claim(number, owner).await.unwrap();

        ledger.apply(number, OrderStatus::Registered, None).await.unwrap();
        ledger.apply(number, OrderStatus::Processing, None).await.unwrap();
        assert_eq!(ledger.get(number).await.unwrap().unwrap().status, OrderStatus::Processing);
        assert_eq!(store.snapshot(owner).await.unwrap().current, Decimal::ZERO);

        let points = Some(Decimal::new(72998, 2));
        ledger.apply(number, OrderStatus::Processed, points).await.unwrap();
        assert_eq!(store.snapshot(owner).await.unwrap().current, Decimal::new(72998, 2));

        let err = ledger.apply(number, OrderStatus::Processing, None).await.unwrap_err();
        assert!(matches!(err, LedgerError::InvalidTransition { .. }));
        assert_eq!(ledger.get(number).await.unwrap().unwrap().status, OrderStatus::Processed);
    }

    #[tokio::test]
    async fn test_concurrent_processed_observations_credit_once() {
        let (store, ledger) = setup();
        let owner = UserId::new();
        let number = OrderNumber::new_unchecked(ORDER);
        ledger.claim(number, owner).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                ledger.apply(number, OrderStatus::Processed, Some(Decimal::from(500))).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(store.snapshot(owner).await.unwrap().current, Decimal::from(500));
    }

    #[tokio::test]
    async fn test_apply_unknown_order() {
        let (_, ledger) = setup();
        let err = ledger
            .apply(OrderNumber::new_unchecked(ORDER), OrderStatus::Processing, None)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::OrderNotFound(_)));
    }
}
