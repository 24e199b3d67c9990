use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tally_ledger::LedgerError;

#[derive(Debug)]
pub enum AppError {
    AuthenticationError(String),
    BadRequest(String),
    ValidationError(String),
    ConflictError(String),
    PaymentRequired(String),
    InternalServerError(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::AuthenticationError(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::ValidationError(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg),
            AppError::ConflictError(msg) => (StatusCode::CONFLICT, msg),
            AppError::PaymentRequired(msg) => (StatusCode::PAYMENT_REQUIRED, msg),
            AppError::InternalServerError(msg) => {
                tracing::error!("Internal Server Error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error".to_string())
            }
        };

        let body = Json(json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

impl From<LedgerError> for AppError {
    fn from(err: LedgerError) -> Self {
        let msg = err.to_string();
        match err {
            LedgerError::Validation(_) | LedgerError::InvalidAmount => AppError::ValidationError(msg),
            LedgerError::OwnershipConflict(_) | LedgerError::LoginTaken => AppError::ConflictError(msg),
            LedgerError::InsufficientFunds => AppError::PaymentRequired(msg),
            LedgerError::Authentication => AppError::AuthenticationError(msg),
            LedgerError::MissingCredentials => AppError::BadRequest(msg),
            LedgerError::InvalidTransition { .. }
            | LedgerError::OrderNotFound(_)
            | LedgerError::Storage(_)
            | LedgerError::Internal(_) => AppError::InternalServerError(msg),
        }
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::BadRequest(rejection.body_text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::{OrderNumber, OrderNumberError};

    fn status_of(err: LedgerError) -> StatusCode {
        AppError::from(err).into_response().status()
    }

    #[test]
    fn test_ledger_errors_map_to_statuses() {
        assert_eq!(status_of(LedgerError::Validation(OrderNumberError::ChecksumFailed)), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(status_of(LedgerError::InvalidAmount), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(status_of(LedgerError::OwnershipConflict(OrderNumber::new_unchecked(18))), StatusCode::CONFLICT);
        assert_eq!(status_of(LedgerError::LoginTaken), StatusCode::CONFLICT);
        assert_eq!(status_of(LedgerError::InsufficientFunds), StatusCode::PAYMENT_REQUIRED);
        assert_eq!(status_of(LedgerError::Authentication), StatusCode::UNAUTHORIZED);
        assert_eq!(status_of(LedgerError::MissingCredentials), StatusCode::BAD_REQUEST);
        assert_eq!(status_of(LedgerError::Internal("boom".into())), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
