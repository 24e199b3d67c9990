use async_trait::async_trait;
use rust_decimal::Decimal;
use std::time::Duration;

use crate::models::{OrderNumber, OrderStatus};

/// What one poll of the accrual service told us about an order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccrualObservation {
    /// Upstream knows the order and reported its calculation status.
    Known {
        status: OrderStatus,
        accrual: Option<Decimal>,
    },
    /// Upstream has not registered the order yet; poll again later.
    NotYetRegisteredUpstream,
    /// Upstream asked us to slow down; `retry_after` comes from the `Retry-After` header.
    RateLimited { retry_after: Option<Duration> },
}

impl AccrualObservation {
    /// True when the observation needs no further polling.
    pub fn is_final(&self) -> bool {
        matches!(self, AccrualObservation::Known { status, .. } if status.is_terminal())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AccrualError {
    #[error("accrual service unavailable (status {0})")]
    UpstreamUnavailable(u16),
    #[error("unexpected accrual service response (status {0})")]
    UnknownUpstreamResponse(u16),
    #[error("malformed accrual response: {0}")]
    Decode(String),
    #[error("accrual request failed: {0}")]
    Transport(String),
    #[error("accrual request timed out")]
    Timeout,
}

impl AccrualError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, AccrualError::UnknownUpstreamResponse(_))
    }
}

/// Network boundary to the external accrual-calculation service.
#[async_trait]
pub trait AccrualSource: Send + Sync {
    /// Issue exactly one request for `number`. Retry cadence belongs to the caller.
    async fn poll(&self, number: OrderNumber) -> Result<AccrualObservation, AccrualError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_unknown_response_is_fatal() {
        assert!(AccrualError::UpstreamUnavailable(500).is_retryable());
        assert!(AccrualError::Decode("eof".into()).is_retryable());
        assert!(AccrualError::Transport("reset".into()).is_retryable());
        assert!(AccrualError::Timeout.is_retryable());
        assert!(!AccrualError::UnknownUpstreamResponse(404).is_retryable());
    }

    #[test]
    fn test_final_observations() {
        let processed = AccrualObservation::Known {
            status: OrderStatus::Processed,
            accrual: Some(Decimal::from(500)),
        };
        let processing = AccrualObservation::Known {
            status: OrderStatus::Processing,
            accrual: None,
        };
        assert!(processed.is_final());
        assert!(!processing.is_final());
        assert!(!AccrualObservation::NotYetRegisteredUpstream.is_final());
        assert!(!AccrualObservation::RateLimited { retry_after: None }.is_final());
    }
}
