pub mod accounts;
pub mod balance;
pub mod error;
pub mod ledger;
pub mod poller;
pub mod retry;
pub mod service;
pub mod withdrawal;

pub use accounts::AccountService;
pub use balance::BalanceAccount;
pub use error::{LedgerError, LedgerResult};
pub use ledger::{ApplyOutcome, ClaimOutcome, OrderLedger};
pub use poller::{AccrualPoller, PollQueue, PollerHandle, PollerOptions};
pub use retry::RetryPolicy;
pub use service::LoyaltyService;
pub use withdrawal::WithdrawalProcessor;
