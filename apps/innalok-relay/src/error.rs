use thiserror::Error;

use crate::auth::AuthError;
use crate::config::ConfigError;
use crate::gateway::GatewayError;
use crate::receipts::ReceiptsError;
use crate::registry::RegistryError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
    #[error("{0}")]
    Registry(#[from] RegistryError),
    #[error("{0}")]
    Gateway(#[from] GatewayError),
    #[error("receipts error: {0}")]
    Receipts(#[from] ReceiptsError),
    #[error("auth error: {0}")]
    Auth(#[from] AuthError),
    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("not signed in; run `innalok-relay auth verify` first")]
    NotSignedIn,
}
