//! The restaurant owner's backend session, obtained through the Poster
//! OAuth callback and kept in the local store.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use url::Url;

use crate::config::api_endpoint;
use crate::store::{self, KeyValueStore, StoreError};

pub const AUTH_KEY: &str = "invoys_auth";
const VERIFY_FAILED: &str = "Failed to verify account";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub company_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthData {
    pub account_number: String,
    pub access_token: String,
    #[serde(rename = "ownerInfo", default)]
    pub owner_info: OwnerInfo,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid auth endpoint: {0}")]
    InvalidConfig(String),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("{0}")]
    Rejected(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Clone)]
pub struct AuthStore {
    store: Arc<dyn KeyValueStore>,
}

impl AuthStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// The stored session, or `None` when signed out or the record is
    /// unreadable.
    pub fn load(&self) -> Option<AuthData> {
        match store::load_json::<AuthData>(self.store.as_ref(), AUTH_KEY) {
            Ok(auth) => auth,
            Err(err) => {
                tracing::warn!(
                    target: "innalok::store",
                    error = %err,
                    "stored auth record is unreadable; treating as signed out"
                );
                None
            }
        }
    }

    pub fn save(&self, auth: &AuthData) -> Result<(), StoreError> {
        store::save_json(self.store.as_ref(), AUTH_KEY, auth)
    }

    pub fn clear(&self) -> Result<(), StoreError> {
        self.store.remove(AUTH_KEY)
    }
}

pub struct PosterAuthClient {
    client: reqwest::Client,
    base_url: Url,
}

impl PosterAuthClient {
    pub fn new(client: reqwest::Client, base_url: Url) -> Self {
        Self { client, base_url }
    }

    /// Exchanges the Poster OAuth `code` for a backend session.
    pub async fn verify(&self, code: &str, account: &str) -> Result<AuthData, AuthError> {
        let endpoint = api_endpoint(&self.base_url, "api/Auth/callback")
            .map_err(|err| AuthError::InvalidConfig(err.to_string()))?;
        let response = self
            .client
            .get(endpoint)
            .query(&[("code", code), ("account", account)])
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await?;
        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = if body.trim().is_empty() {
                VERIFY_FAILED.to_string()
            } else {
                body
            };
            return Err(AuthError::Rejected(message));
        }
        Ok(response.json::<AuthData>().await?)
    }

    /// Verifies and persists the session.
    pub async fn sign_in(
        &self,
        auth_store: &AuthStore,
        code: &str,
        account: &str,
    ) -> Result<AuthData, AuthError> {
        let auth = self.verify(code, account).await?;
        auth_store.save(&auth)?;
        tracing::info!(
            target: "innalok::store",
            account = %auth.account_number,
            "signed in"
        );
        Ok(auth)
    }
}
