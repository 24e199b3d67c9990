use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{PgConnection, PgPool};
use tracing::debug;
use uuid::Uuid;

use tally_core::repository::{BalanceRepository, OrderRepository, UserRepository};
use tally_core::{
    ensure_storable_amount, BalanceSnapshot, ClaimRow, NewWithdrawal, Order, OrderNumber,
    OrderStatus, OrderTransition, StoreError, StoreResult, TransitionWrite, User, UserId,
    Withdrawal,
};

/// Postgres-backed storage collaborator. Every ledger mutation runs in its own transaction.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn backend(err: sqlx::Error) -> StoreError {
    StoreError::backend(err)
}

// Internal structs for type-safe querying
#[derive(sqlx::FromRow)]
struct UserRow {
    id: Uuid,
    login: String,
    password_hash: String,
}

#[derive(sqlx::FromRow)]
struct OrderRow {
    number: i64,
    user_id: Uuid,
    status: String,
    accrual: Option<Decimal>,
    uploaded_at: DateTime<Utc>,
    stalled_at: Option<DateTime<Utc>>,
}

impl TryFrom<OrderRow> for Order {
    type Error = StoreError;

    fn try_from(row: OrderRow) -> Result<Self, Self::Error> {
        Ok(Order {
            number: OrderNumber::new_unchecked(row.number),
            user_id: UserId(row.user_id),
            status: row.status.parse().map_err(StoreError::backend)?,
            accrual: row.accrual,
            uploaded_at: row.uploaded_at,
            stalled_at: row.stalled_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct WithdrawalRow {
    id: Uuid,
    user_id: Uuid,
    order_label: i64,
    amount: Decimal,
    processed_at: DateTime<Utc>,
}

impl From<WithdrawalRow> for Withdrawal {
    fn from(row: WithdrawalRow) -> Self {
        Withdrawal {
            id: row.id,
            user_id: UserId(row.user_id),
            order_label: OrderNumber::new_unchecked(row.order_label),
            amount: row.amount,
            processed_at: row.processed_at,
        }
    }
}

const ORDER_COLUMNS: &str = "number, user_id, status, accrual, uploaded_at, stalled_at";

async fn credit_in_tx(conn: &mut PgConnection, user_id: UserId, amount: Decimal) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO balances (user_id, current)
        VALUES ($1, $2)
        ON CONFLICT (user_id)
        DO UPDATE SET current = balances.current + EXCLUDED.current
        "#,
    )
    .bind(user_id.0)
    .bind(amount)
    .execute(conn)
    .await
    .map_err(backend)?;
    Ok(())
}

#[async_trait]
impl UserRepository for PgStore {
    async fn create_user(&self, login: &str, password_hash: &str) -> StoreResult<UserId> {
        let id = UserId::new();
        sqlx::query("INSERT INTO users (id, login, password_hash) VALUES ($1, $2, $3)")
            .bind(id.0)
            .bind(login)
            .bind(password_hash)
            .execute(&self.pool)
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(ref db) if db.is_unique_violation() => StoreError::LoginTaken,
                other => backend(other),
            })?;
        Ok(id)
    }

    async fn find_by_login(&self, login: &str) -> StoreResult<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(
            "SELECT id, login, password_hash FROM users WHERE login = $1",
        )
        .bind(login)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        Ok(row.map(|r| User {
            id: UserId(r.id),
            login: r.login,
            password_hash: r.password_hash,
        }))
    }
}

#[async_trait]
impl OrderRepository for PgStore {
    async fn insert_if_absent(
        &self,
        number: OrderNumber,
        owner: UserId,
        uploaded_at: DateTime<Utc>,
    ) -> StoreResult<ClaimRow> {
        let inserted: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO orders (number, user_id, status, uploaded_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (number) DO NOTHING
            RETURNING user_id
            "#,
        )
        .bind(number.get())
        .bind(owner.0)
        .bind(OrderStatus::Registered.as_str())
        .bind(uploaded_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        if inserted.is_some() {
            return Ok(ClaimRow::Inserted);
        }

        // Owner of an existing order never changes, so this read cannot race the insert above
        let (existing,): (Uuid,) = sqlx::query_as("SELECT user_id FROM orders WHERE number = $1")
            .bind(number.get())
            .fetch_one(&self.pool)
            .await
            .map_err(backend)?;

        Ok(ClaimRow::Existing { owner: UserId(existing) })
    }

    async fn get_order(&self, number: OrderNumber) -> StoreResult<Option<Order>> {
        let row = sqlx::query_as::<_, OrderRow>(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE number = $1"
        ))
        .bind(number.get())
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        row.map(Order::try_from).transpose()
    }

    async fn transition(
        &self,
        number: OrderNumber,
        transition: &OrderTransition,
    ) -> StoreResult<TransitionWrite> {
        let mut tx = self.pool.begin().await.map_err(backend)?;

        let locked: Option<(String, Uuid)> =
            sqlx::query_as("SELECT status, user_id FROM orders WHERE number = $1 FOR UPDATE")
                .bind(number.get())
                .fetch_optional(&mut *tx)
                .await
                .map_err(backend)?;

        let Some((status, owner)) = locked else {
            return Err(StoreError::OrderNotFound(number));
        };
        let current: OrderStatus = status.parse().map_err(StoreError::backend)?;

        if current != transition.expected {
            debug!(order = %number, %current, expected = %transition.expected, "stale transition");
            return Ok(TransitionWrite::Stale { current });
        }

        sqlx::query("UPDATE orders SET status = $2, accrual = COALESCE($3, accrual) WHERE number = $1")
            .bind(number.get())
            .bind(transition.next.as_str())
            .bind(transition.accrual)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;

        if let Some(credit) = transition.credit {
            if credit.user_id().0 != owner {
                return Err(StoreError::backend(format!(
                    "credit for order {number} addressed to {} but owner is {owner}",
                    credit.user_id()
                )));
            }
            credit_in_tx(&mut *tx, credit.user_id(), credit.amount()).await?;
        }

        tx.commit().await.map_err(backend)?;
        Ok(TransitionWrite::Applied)
    }

    async fn list_for_user(&self, user_id: UserId) -> StoreResult<Vec<Order>> {
        let rows = sqlx::query_as::<_, OrderRow>(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE user_id = $1 ORDER BY uploaded_at DESC"
        ))
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.into_iter().map(Order::try_from).collect()
    }

    async fn list_pending(&self, limit: usize) -> StoreResult<Vec<Order>> {
        let rows = sqlx::query_as::<_, OrderRow>(&format!(
            r#"
            SELECT {ORDER_COLUMNS} FROM orders
            WHERE status IN ('REGISTERED', 'PROCESSING') AND stalled_at IS NULL
            ORDER BY uploaded_at ASC
            LIMIT $1
            "#
        ))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.into_iter().map(Order::try_from).collect()
    }

    async fn flag_stalled(&self, number: OrderNumber) -> StoreResult<()> {
        sqlx::query("UPDATE orders SET stalled_at = NOW() WHERE number = $1 AND stalled_at IS NULL")
            .bind(number.get())
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }
}

#[async_trait]
impl BalanceRepository for PgStore {
    async fn credit(&self, user_id: UserId, amount: Decimal) -> StoreResult<()> {
        ensure_storable_amount(amount)?;
        let mut conn = self.pool.acquire().await.map_err(backend)?;
        credit_in_tx(&mut *conn, user_id, amount).await
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
        let mut tx = self.pool.begin().await.map_err(backend)?;

        // The row lock taken by UPDATE serializes concurrent debits; the guard is re-checked after the wait
        let remaining: Option<(Decimal,)> = sqlx::query_as(
            r#"
            UPDATE balances SET current = current - $2
            WHERE user_id = $1 AND current >= $2
            RETURNING current
            "#,
        )
        .bind(user_id.0)
        .bind(amount)
        .fetch_optional(&mut *tx)
        .await
        .map_err(backend)?;

        if remaining.is_none() {
            return Err(StoreError::InsufficientFunds);
        }

        if let Some(w) = record {
            sqlx::query(
                r#"
                INSERT INTO withdrawals (id, user_id, order_label, amount, processed_at)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(w.id)
            .bind(w.user_id.0)
            .bind(w.order_label.get())
            .bind(w.amount)
            .bind(w.processed_at)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;
        }

        tx.commit().await.map_err(backend)?;
        Ok(())
    }

    async fn snapshot(&self, user_id: UserId) -> StoreResult<BalanceSnapshot> {
        // One statement, one snapshot
        let (current, withdrawn): (Decimal, Decimal) = sqlx::query_as(
            r#"
            SELECT
                COALESCE((SELECT current FROM balances WHERE user_id = $1), 0) AS current,
                COALESCE((SELECT SUM(amount) FROM withdrawals WHERE user_id = $1), 0) AS withdrawn
            "#,
        )
        .bind(user_id.0)
        .fetch_one(&self.pool)
        .await
        .map_err(backend)?;

        Ok(BalanceSnapshot { current, withdrawn })
    }

    async fn list_withdrawals(&self, user_id: UserId) -> StoreResult<Vec<Withdrawal>> {
        let rows = sqlx::query_as::<_, WithdrawalRow>(
            r#"
            SELECT id, user_id, order_label, amount, processed_at
            FROM withdrawals
            WHERE user_id = $1
            ORDER BY processed_at DESC
            "#,
        )
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        Ok(rows.into_iter().map(Withdrawal::from).collect())
    }
}
