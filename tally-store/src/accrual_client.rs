use async_trait::async_trait;
use reqwest::header::{HeaderValue, RETRY_AFTER};
use reqwest::StatusCode;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use tally_core::{AccrualError, AccrualObservation, AccrualSource, OrderNumber, OrderStatus};

/// Body of a successful accrual lookup.
#[derive(Debug, Deserialize)]
struct AccrualResponse {
    order: String,
    status: OrderStatus,
    #[serde(default, with = "rust_decimal::serde::float_option")]
    accrual: Option<Decimal>,
}

/// HTTP client for `GET {address}/api/orders/{number}` on the accrual service.
#[derive(Clone)]
pub struct HttpAccrualClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpAccrualClient {
    /// `address` may omit the scheme, in which case plain http is assumed.
    pub fn new(address: &str, request_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;

        let trimmed = address.trim_end_matches('/');
        let base_url = if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            trimmed.to_string()
        } else {
            format!("http://{}", trimmed)
        };

        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl AccrualSource for HttpAccrualClient {
    async fn poll(&self, number: OrderNumber) -> Result<AccrualObservation, AccrualError> {
        let url = format!("{}/api/orders/{}", self.base_url, number);

        let response = self.client.get(&url).send().await.map_err(transport_error)?;
        let status = response.status();
        let retry_after = response.headers().get(RETRY_AFTER).cloned();
        let body = response.bytes().await.map_err(transport_error)?;

        debug!(order = %number, status = status.as_u16(), "accrual service responded");
        map_response(number, status, retry_after.as_ref(), &body)
    }
}

fn transport_error(err: reqwest::Error) -> AccrualError {
    if err.is_timeout() {
        AccrualError::Timeout
    } else {
        AccrualError::Transport(err.to_string())
    }
}

/// Translate one upstream response into a domain observation.
pub fn map_response(
    number: OrderNumber,
    status: StatusCode,
    retry_after: Option<&HeaderValue>,
    body: &[u8],
) -> Result<AccrualObservation, AccrualError> {
    match status {
        StatusCode::OK => {
            let decoded: AccrualResponse = serde_json::from_slice(body)
                .map_err(|e| AccrualError::Decode(e.to_string()))?;

            if decoded.order != number.to_string() {
                return Err(AccrualError::Decode(format!(
                    "response is for order {} but {} was requested",
                    decoded.order, number
                )));
            }
            if decoded.accrual.is_some_and(|a| a < Decimal::ZERO) {
                return Err(AccrualError::Decode("negative accrual".to_string()));
            }

            Ok(AccrualObservation::Known {
                status: decoded.status,
                accrual: decoded.accrual,
            })
        }
        StatusCode::NO_CONTENT => Ok(AccrualObservation::NotYetRegisteredUpstream),
        StatusCode::TOO_MANY_REQUESTS => Ok(AccrualObservation::RateLimited {
            retry_after: retry_after
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs),
        }),
        s if s.is_server_error() => Err(AccrualError::UpstreamUnavailable(s.as_u16())),
        s => Err(AccrualError::UnknownUpstreamResponse(s.as_u16())),
    }
}
