use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use tally_core::{UserId, UserRepository};
use tally_shared::Masked;

use crate::error::{LedgerError, LedgerResult};

/// Registration and credential checks. Hashing runs on the blocking pool.
#[derive(Clone)]
pub struct AccountService {
    users: Arc<dyn UserRepository>,
    hash_cost: u32,
    /// Checked against on unknown logins so they cost as much as a wrong password.
    decoy_hash: Arc<OnceCell<String>>,
}

impl AccountService {
    pub fn new(users: Arc<dyn UserRepository>) -> Self {
        Self::with_cost(users, bcrypt::DEFAULT_COST)
    }

    pub fn with_cost(users: Arc<dyn UserRepository>, hash_cost: u32) -> Self {
        Self {
            users,
            hash_cost,
            decoy_hash: Arc::new(OnceCell::new()),
        }
    }

    pub async fn create_user(
        &self,
        login: &str,
        password: &Masked<String>,
    ) -> LedgerResult<UserId> {
        if login.is_empty() || password.expose().is_empty() {
            return Err(LedgerError::MissingCredentials);
        }

        let hash = hash_password(password.expose().clone(), self.hash_cost).await?;
        let id = self.users.create_user(login, &hash).await?;

        info!(user_id = %id, "user registered");
        Ok(id)
    }

    /// Unknown login and wrong password fail the same way.
    pub async fn authenticate(
        &self,
        login: &str,
        password: &Masked<String>,
    ) -> LedgerResult<UserId> {
        if login.is_empty() || password.expose().is_empty() {
            return Err(LedgerError::MissingCredentials);
        }

        let Some(user) = self.users.find_by_login(login).await? else {
            let decoy = self.decoy_hash().await?;
            verify_password(password.expose().clone(), decoy).await?;
            return Err(LedgerError::Authentication);
        };

        if !verify_password(password.expose().clone(), user.password_hash).await? {
            warn!(user_id = %user.id, "password mismatch");
            return Err(LedgerError::Authentication);
        }

        Ok(user.id)
    }

    async fn decoy_hash(&self) -> LedgerResult<String> {
        let cost = self.hash_cost;
        self.decoy_hash
            .get_or_try_init(|| hash_password("not-a-real-password".to_string(), cost))
            .await
            .cloned()
    }
}

async fn hash_password(password: String, cost: u32) -> LedgerResult<String> {
    tokio::task::spawn_blocking(move || bcrypt::hash(password, cost))
        .await
        .map_err(|e| LedgerError::Internal(format!("password hashing task failed: {}", e)))?
        .map_err(|e| LedgerError::Internal(format!("password hashing failed: {}", e)))
}

async fn verify_password(password: String, hash: String) -> LedgerResult<bool> {
    tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash))
        .await
        .map_err(|e| LedgerError::Internal(format!("password check task failed: {}", e)))?
        .map_err(|e| LedgerError::Internal(format!("password check failed: {}", e)))
}
