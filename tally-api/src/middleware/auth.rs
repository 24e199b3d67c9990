use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use axum_extra::headers::{authorization::Bearer, Authorization, HeaderMapExt};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use tally_core::UserId;

use crate::state::{AppState, AuthConfig};

// ============================================================================
// JWT Claims
// ============================================================================

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct UserClaims {
    pub sub: Uuid,
    pub exp: usize,
}

impl UserClaims {
    pub fn new(user_id: UserId, auth: &AuthConfig) -> Self {
        Self {
            sub: user_id.0,
            exp: (Utc::now() + Duration::seconds(auth.expiration as i64)).timestamp() as usize,
        }
    }

    pub fn user_id(&self) -> UserId {
        UserId(self.sub)
    }

    pub fn encode(&self, auth: &AuthConfig) -> Result<String, jsonwebtoken::errors::Error> {
        encode(&Header::default(), self, &EncodingKey::from_secret(auth.secret.as_bytes()))
    }

    pub fn decode(token: &str, auth: &AuthConfig) -> Result<Self, jsonwebtoken::errors::Error> {
        decode::<UserClaims>(
            token,
            &DecodingKey::from_secret(auth.secret.as_bytes()),
            &Validation::default(),
        )
        .map(|data| data.claims)
    }
}

// ============================================================================
// User Authentication Middleware
// ============================================================================

pub async fn user_auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let bearer = req
        .headers()
        .typed_get::<Authorization<Bearer>>()
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let claims = UserClaims::decode(bearer.token(), &state.auth).map_err(|_| StatusCode::UNAUTHORIZED)?;

    req.extensions_mut().insert(claims);

    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth() -> AuthConfig {
        AuthConfig {
            secret: "test-secret".to_string(),
            expiration: 60,
        }
    }

    #[test]
    fn test_token_round_trip() {
        let user = UserId::new();
        let token = UserClaims::new(user, &auth()).encode(&auth()).unwrap();
        assert_eq!(UserClaims::decode(&token, &auth()).unwrap().user_id(), user);
    }

    #[test]
    fn test_rejects_foreign_signature() {
        let token = UserClaims::new(UserId::new(), &auth()).encode(&auth()).unwrap();
        let other = AuthConfig {
            secret: "other".to_string(),
            expiration: 60,
        };
        assert!(UserClaims::decode(&token, &other).is_err());
    }

    #[test]
    fn test_rejects_expired_token() {
        let claims = UserClaims {
            sub: Uuid::new_v4(),
            exp: (Utc::now() - Duration::hours(1)).timestamp() as usize,
        };
        let token = claims.encode(&auth()).unwrap();
        assert!(UserClaims::decode(&token, &auth()).is_err());
    }
}
