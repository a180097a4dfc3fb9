//! Callback endpoints on the remote tax backend.

use async_trait::async_trait;
use url::Url;

use super::GatewayError;
use crate::config::api_endpoint;

#[async_trait]
pub trait TaxBackend: Send + Sync {
    async fn sale_response(
        &self,
        token: &str,
        receipt_id: &str,
        fiscal_id: &str,
    ) -> Result<(), GatewayError>;

    async fn rollback_response(&self, token: &str, receipt_id: &str) -> Result<(), GatewayError>;

    async fn refresh_sale(&self, token: &str, receipt_id: &str) -> Result<(), GatewayError>;
}

pub struct ReqwestTaxBackend {
    client: reqwest::Client,
    base_url: Url,
}

impl ReqwestTaxBackend {
    pub fn new(client: reqwest::Client, base_url: Url) -> Self {
        Self { client, base_url }
    }

    async fn post(&self, path: &str, query: &[(&str, &str)]) -> Result<(), GatewayError> {
        let endpoint = api_endpoint(&self.base_url, path).map_err(|err| {
            GatewayError::InvalidConfig(format!("invalid tax endpoint {path}: {err}"))
        })?;
        let response = self.client.post(endpoint).query(query).send().await?;
        if !response.status().is_success() {
            return Err(GatewayError::HttpStatus(response.status()));
        }
        Ok(())
    }
}

#[async_trait]
impl TaxBackend for ReqwestTaxBackend {
    async fn sale_response(
        &self,
        token: &str,
        receipt_id: &str,
        fiscal_id: &str,
    ) -> Result<(), GatewayError> {
        self.post(
            "api/Tax/SaleResponse",
            &[
                ("Token", token),
                ("ReceiptId", receipt_id),
                ("FiscalId", fiscal_id),
            ],
        )
        .await
    }

    async fn rollback_response(&self, token: &str, receipt_id: &str) -> Result<(), GatewayError> {
        self.post(
            "api/Tax/RollBackResponse",
            &[("Token", token), ("ReceiptId", receipt_id)],
        )
        .await
    }

    async fn refresh_sale(&self, token: &str, receipt_id: &str) -> Result<(), GatewayError> {
        self.post(
            "api/Tax/RefreshSale",
            &[("Token", token), ("ReceiptId", receipt_id)],
        )
        .await
    }
}
