use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use tally_core::{BalanceSnapshot, OrderNumber, Withdrawal};

use crate::{error::AppError, middleware::UserClaims, state::AppState};

#[derive(Debug, Deserialize)]
pub struct WithdrawRequest {
    pub order: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub sum: Decimal,
}

#[derive(Debug, Serialize)]
pub struct WithdrawalResponse {
    pub order: OrderNumber,
    #[serde(with = "rust_decimal::serde::float")]
    pub sum: Decimal,
    pub processed_at: DateTime<Utc>,
}

impl From<Withdrawal> for WithdrawalResponse {
    fn from(w: Withdrawal) -> Self {
        Self {
            order: w.order_label,
            sum: w.amount,
            processed_at: w.processed_at,
        }
    }
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/user/balance", get(get_balance))
        .route("/api/user/balance/withdraw", post(withdraw))
        .route("/api/user/withdrawals", get(list_withdrawals))
}

async fn get_balance(
    State(state): State<AppState>,
    Extension(claims): Extension<UserClaims>,
) -> Result<Json<BalanceSnapshot>, AppError> {
    Ok(Json(state.service.get_balance(claims.user_id()).await?))
}

async fn withdraw(
    State(state): State<AppState>,
    Extension(claims): Extension<UserClaims>,
    payload: Result<Json<WithdrawRequest>, JsonRejection>,
) -> Result<StatusCode, AppError> {
    let Json(request) = payload?;
    state
        .service
        .withdraw(claims.user_id(), &request.order, request.sum)
        .await?;
    Ok(StatusCode::OK)
}

async fn list_withdrawals(
    State(state): State<AppState>,
    Extension(claims): Extension<UserClaims>,
) -> Result<Response, AppError> {
    let withdrawals = state.service.list_withdrawals(claims.user_id()).await?;
    if withdrawals.is_empty() {
        return Ok(StatusCode::NO_CONTENT.into_response());
    }

    let body: Vec<WithdrawalResponse> = withdrawals.into_iter().map(WithdrawalResponse::from).collect();
    Ok(Json(body).into_response())
}
