pub mod accrual;
pub mod models;
pub mod order_number;
pub mod repository;

pub use accrual::{AccrualError, AccrualObservation, AccrualSource};
pub use models::{
    is_storable_points, BalanceSnapshot, ClaimRow, Credit, NewWithdrawal, Order, OrderNumber,
    OrderStatus, OrderTransition, TransitionWrite, User, UserId, Withdrawal,
};
pub use order_number::{validate, OrderNumberError};
pub use repository::{
    ensure_storable_amount, BalanceRepository, OrderRepository, StoreError, StoreResult,
    UserRepository,
};

pub use rust_decimal::Decimal;
