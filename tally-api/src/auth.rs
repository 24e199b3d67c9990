use axum::{
    extract::{rejection::JsonRejection, State},
    routing::post,
    Json, Router,
};
use axum_extra::headers::{authorization::Bearer, Authorization};
use axum_extra::TypedHeader;
use serde::{Deserialize, Serialize};

use tally_core::UserId;
use tally_shared::Masked;

use crate::{error::AppError, middleware::auth::UserClaims, state::AppState};

#[derive(Debug, Deserialize)]
struct Credentials {
    login: String,
    password: Masked<String>,
}

#[derive(Debug, Serialize)]
struct AuthResponse {
    token: String,
}

type TokenReply = (TypedHeader<Authorization<Bearer>>, Json<AuthResponse>);

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/user/register", post(register))
        .route("/api/user/login", post(login))
}

async fn register(
    State(state): State<AppState>,
    payload: Result<Json<Credentials>, JsonRejection>,
) -> Result<TokenReply, AppError> {
    let Json(credentials) = payload?;
    let user_id = state
        .service
        .create_user(&credentials.login, &credentials.password)
        .await?;
    issue_token(&state, user_id)
}

async fn login(
    State(state): State<AppState>,
    payload: Result<Json<Credentials>, JsonRejection>,
) -> Result<TokenReply, AppError> {
    let Json(credentials) = payload?;
    let user_id = state
        .service
        .authenticate(&credentials.login, &credentials.password)
        .await?;
    issue_token(&state, user_id)
}

fn issue_token(state: &AppState, user_id: UserId) -> Result<TokenReply, AppError> {
    let token = UserClaims::new(user_id, &state.auth)
        .encode(&state.auth)
        .map_err(|e| AppError::InternalServerError(format!("Token encoding failed: {}", e)))?;

    let header = Authorization::bearer(&token)
        .map_err(|e| AppError::InternalServerError(format!("Token is not a valid header: {}", e)))?;

    Ok((TypedHeader(header), Json(AuthResponse { token })))
}
