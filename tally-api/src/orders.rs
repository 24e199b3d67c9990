use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Extension, Json, Router,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use tally_core::{Order, OrderNumber, OrderStatus};
use tally_ledger::ClaimOutcome;

use crate::{error::AppError, middleware::UserClaims, state::AppState};

#[derive(Debug, Serialize)]
pub struct OrderResponse {
    pub number: OrderNumber,
    pub status: OrderStatus,
    #[serde(
        skip_serializing_if = "Option::is_none",
        with = "rust_decimal::serde::float_option"
    )]
    pub accrual: Option<Decimal>,
    pub uploaded_at: DateTime<Utc>,
}

impl From<Order> for OrderResponse {
    fn from(order: Order) -> Self {
        Self {
            number: order.number,
            status: order.status,
            accrual: order.accrual,
            uploaded_at: order.uploaded_at,
        }
    }
}

pub fn routes() -> Router<AppState> {
    Router::new().route("/api/user/orders", post(submit_order).get(list_orders))
}

/// Body is the bare order number as text.
async fn submit_order(
    State(state): State<AppState>,
    Extension(claims): Extension<UserClaims>,
    body: String,
) -> Result<StatusCode, AppError> {
    let outcome = state
        .service
        .submit_order(claims.user_id(), body.trim())
        .await?;

    Ok(match outcome {
        ClaimOutcome::Created => StatusCode::ACCEPTED,
        ClaimOutcome::AlreadyOwnedBySelf => StatusCode::OK,
    })
}

async fn list_orders(
    State(state): State<AppState>,
    Extension(claims): Extension<UserClaims>,
) -> Result<Response, AppError> {
    let orders = state.service.list_orders(claims.user_id()).await?;
    if orders.is_empty() {
        return Ok(StatusCode::NO_CONTENT.into_response());
    }

    let body: Vec<OrderResponse> = orders.into_iter().map(OrderResponse::from).collect();
    Ok(Json(body).into_response())
}
