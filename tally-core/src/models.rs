use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Identity of a registered user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub Uuid);

impl UserId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A Luhn-valid purchase order number.
///
/// Obtain one through [`crate::order_number::validate`]; serializes as a decimal string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OrderNumber(i64);

impl OrderNumber {
    /// Wrap a number that was already validated, e.g. one read back from storage.
    pub fn new_unchecked(value: i64) -> Self {
        Self(value)
    }

    pub fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for OrderNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Serialize for OrderNumber {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(&self.0)
    }
}

/// Order status in the accrual lifecycle
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Registered,
    Processing,
    Processed,
    Invalid,
}

impl OrderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Registered => "REGISTERED",
            OrderStatus::Processing => "PROCESSING",
            OrderStatus::Processed => "PROCESSED",
            OrderStatus::Invalid => "INVALID",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, OrderStatus::Processed | OrderStatus::Invalid)
    }

    /// Position along `REGISTERED -> PROCESSING -> {PROCESSED | INVALID}`.
    pub fn rank(self) -> u8 {
        match self {
            OrderStatus::Registered => 0,
            OrderStatus::Processing => 1,
            OrderStatus::Processed | OrderStatus::Invalid => 2,
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown order status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for OrderStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "REGISTERED" => Ok(OrderStatus::Registered),
            "PROCESSING" => Ok(OrderStatus::Processing),
            "PROCESSED" => Ok(OrderStatus::Processed),
            "INVALID" => Ok(OrderStatus::Invalid),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct User {
    pub id: UserId,
    pub login: String,
    pub password_hash: String,
}

/// A claimed purchase order. Never deleted.
#[derive(Debug, Clone, Serialize)]
pub struct Order {
    pub number: OrderNumber,
    pub user_id: UserId,
    pub status: OrderStatus,
    #[serde(with = "rust_decimal::serde::float_option")]
    pub accrual: Option<Decimal>,
    pub uploaded_at: DateTime<Utc>,
    /// Set when polling gave up on the order and an operator should look at it.
    pub stalled_at: Option<DateTime<Utc>>,
}

impl Order {
    pub fn new(number: OrderNumber, user_id: UserId, uploaded_at: DateTime<Utc>) -> Self {
        Self {
            number,
            user_id,
            status: OrderStatus::Registered,
            accrual: None,
            uploaded_at,
            stalled_at: None,
        }
    }
}

/// Result of the atomic insert-if-absent on the order number key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimRow {
    Inserted,
    Existing { owner: UserId },
}

/// Fractional digits kept for a points amount.
pub const POINTS_SCALE: u32 = 2;

/// Whether `amount` is storable without rounding: at most two fractional
/// digits and within the range of a `NUMERIC(20, 2)` column.
pub fn is_storable_points(amount: Decimal) -> bool {
    amount.normalize().scale() <= POINTS_SCALE && amount.abs() < Decimal::from(10i64.pow(18))
}

/// A positive amount to add to a user's balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credit {
    user_id: UserId,
    amount: Decimal,
}

impl Credit {
    /// Returns `None` unless `amount > 0` and storable as-is.
    pub fn new(user_id: UserId, amount: Decimal) -> Option<Self> {
        (amount > Decimal::ZERO && is_storable_points(amount)).then_some(Self { user_id, amount })
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn amount(&self) -> Decimal {
        self.amount
    }
}

/// Compare-and-set request for an order status write.
///
/// The store applies it only if the persisted status still equals `expected`,
/// and applies `credit` in the same transaction as the status write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderTransition {
    pub expected: OrderStatus,
    pub next: OrderStatus,
    pub accrual: Option<Decimal>,
    pub credit: Option<Credit>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionWrite {
    Applied,
    /// The persisted status moved on since it was read.
    Stale { current: OrderStatus },
}

/// A withdrawal record to insert together with its debit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewWithdrawal {
    pub id: Uuid,
    pub user_id: UserId,
    pub order_label: OrderNumber,
    pub amount: Decimal,
    pub processed_at: DateTime<Utc>,
}

impl NewWithdrawal {
    pub fn new(user_id: UserId, order_label: OrderNumber, amount: Decimal) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            order_label,
            amount,
            processed_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Withdrawal {
    pub id: Uuid,
    pub user_id: UserId,
    pub order_label: OrderNumber,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    pub processed_at: DateTime<Utc>,
}

impl From<NewWithdrawal> for Withdrawal {
    fn from(w: NewWithdrawal) -> Self {
        Self {
            id: w.id,
            user_id: w.user_id,
            order_label: w.order_label,
            amount: w.amount,
            processed_at: w.processed_at,
        }
    }
}

/// Current balance and total withdrawn, read together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct BalanceSnapshot {
    #[serde(with = "rust_decimal::serde::float")]
    pub current: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub withdrawn: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            OrderStatus::Registered,
            OrderStatus::Processing,
            OrderStatus::Processed,
            OrderStatus::Invalid,
        ] {
            assert_eq!(status.as_str().parse::<OrderStatus>().unwrap(), status);
        }
        assert!("NEW".parse::<OrderStatus>().is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(!OrderStatus::Registered.is_terminal());
        assert!(!OrderStatus::Processing.is_terminal());
        assert!(OrderStatus::Processed.is_terminal());
        assert!(OrderStatus::Invalid.is_terminal());
    }

    #[test]
    fn test_credit_requires_positive_amount() {
        let user = UserId::new();
        assert!(Credit::new(user, Decimal::ZERO).is_none());
        assert!(Credit::new(user, Decimal::from(-5)).is_none());
        assert_eq!(Credit::new(user, Decimal::from(5)).unwrap().amount(), Decimal::from(5));
    }

    #[test]
    fn test_points_keep_at_most_two_decimals() {
        assert!(is_storable_points(Decimal::new(1005, 2)));
        // trailing zeros do not count against the scale
        assert!(is_storable_points(Decimal::new(105000, 4)));
        assert!(!is_storable_points(Decimal::new(10005, 3)));
        assert!(!is_storable_points(Decimal::new(1, 3)));
        assert!(!is_storable_points(Decimal::from(10i64.pow(18))));

        let user = UserId::new();
        assert!(Credit::new(user, Decimal::new(4, 3)).is_none());
        assert!(Credit::new(user, Decimal::new(4, 2)).is_some());
    }

    #[test]
    fn test_order_number_serializes_as_string() {
        let json = serde_json::to_string(&OrderNumber::new_unchecked(12345678903)).unwrap();
        assert_eq!(json, "\"12345678903\"");
    }
}
