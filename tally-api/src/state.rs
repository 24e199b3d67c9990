use tally_ledger::LoyaltyService;

#[derive(Clone)]
pub struct AuthConfig {
    pub secret: String,
    pub expiration: u64,
}

#[derive(Clone)]
pub struct AppState {
    pub service: LoyaltyService,
    pub auth: AuthConfig,
}
