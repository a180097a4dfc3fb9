//! Client for the local fiscal terminal and the tax backend callbacks.
//!
//! The terminal speaks plain HTTP on the shop network. Nothing here retries;
//! the relay and the health monitor decide what a failure means for them.

#[cfg(test)]
pub(crate) mod mock;
pub mod tax;

use async_trait::async_trait;
use omnisoft_proto::sanitize::sanitize_sale_quantities;
use omnisoft_proto::{DocType, TerminalRequest, TerminalResponse, API_VERSION};
use reqwest::StatusCode;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::registry::{Device, DeviceRegistry, RegistryError};
use tax::{ReqwestTaxBackend, TaxBackend};

const LOGIN_FAILED: &str = "Login failed: No token received";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub name: String,
    pub password: String,
}

impl Default for Credentials {
    fn default() -> Self {
        Self {
            name: "SuperApi".into(),
            password: "123".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalEndpoint {
    pub ip: String,
    pub port: u16,
}

impl TerminalEndpoint {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
        }
    }

    pub fn url(&self) -> Result<Url, GatewayError> {
        let raw = format!("http://{}:{}/{API_VERSION}", self.ip.trim(), self.port);
        Url::parse(&raw).map_err(|err| GatewayError::InvalidEndpoint(format!("{raw}: {err}")))
    }
}

impl From<&Device> for TerminalEndpoint {
    fn from(device: &Device) -> Self {
        Self::new(device.ip.clone(), device.port)
    }
}

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("invalid terminal endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("invalid gateway configuration: {0}")]
    InvalidConfig(String),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("unexpected http status {0}")]
    HttpStatus(StatusCode),
    #[error("invalid terminal response: {0}")]
    InvalidResponse(#[from] serde_json::Error),
    #[error("{0}")]
    Rejected(String),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

pub fn http_client(timeout: Duration) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(3).min(timeout))
        .timeout(timeout)
        .no_proxy()
        .build()
}

#[async_trait]
pub trait TerminalTransport: Send + Sync {
    async fn send(
        &self,
        endpoint: &TerminalEndpoint,
        request: &TerminalRequest,
    ) -> Result<TerminalResponse, GatewayError>;
}

pub struct ReqwestTerminalTransport {
    client: reqwest::Client,
}

impl ReqwestTerminalTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TerminalTransport for ReqwestTerminalTransport {
    async fn send(
        &self,
        endpoint: &TerminalEndpoint,
        request: &TerminalRequest,
    ) -> Result<TerminalResponse, GatewayError> {
        let response = self
            .client
            .post(endpoint.url()?)
            .json(request)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(GatewayError::HttpStatus(response.status()));
        }
        Ok(response.json::<TerminalResponse>().await?)
    }
}

#[derive(Clone)]
pub struct TerminalGateway {
    transport: Arc<dyn TerminalTransport>,
    tax: Arc<dyn TaxBackend>,
    registry: DeviceRegistry,
}

impl TerminalGateway {
    pub fn new(registry: DeviceRegistry, client: reqwest::Client, api_base_url: Url) -> Self {
        Self::with_backends(
            registry,
            Arc::new(ReqwestTerminalTransport::new(client.clone())),
            Arc::new(ReqwestTaxBackend::new(client, api_base_url)),
        )
    }

    pub fn with_backends(
        registry: DeviceRegistry,
        transport: Arc<dyn TerminalTransport>,
        tax: Arc<dyn TaxBackend>,
    ) -> Self {
        Self {
            transport,
            tax,
            registry,
        }
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Logs in with check type 40. Only a non-empty `access_token` counts as
    /// success.
    pub async fn login(
        &self,
        endpoint: &TerminalEndpoint,
        credentials: &Credentials,
    ) -> Result<String, GatewayError> {
        let request = TerminalRequest::login(&credentials.name, &credentials.password);
        let response = self.transport.send(endpoint, &request).await?;
        if let Some(token) = response.token() {
            return Ok(token.to_string());
        }
        let message = response
            .message
            .filter(|message| !message.trim().is_empty())
            .unwrap_or_else(|| LOGIN_FAILED.to_string());
        Err(GatewayError::Rejected(message))
    }

    pub async fn get_info(
        &self,
        endpoint: &TerminalEndpoint,
        token: &str,
    ) -> Result<TerminalResponse, GatewayError> {
        self.transport
            .send(endpoint, &TerminalRequest::info(token))
            .await
    }

    /// Logs in to a registered device, stores the token and makes the device
    /// active.
    pub async fn connect_device(
        &self,
        id: &str,
        credentials: &Credentials,
    ) -> Result<Device, GatewayError> {
        let device = self
            .registry
            .device(id)
            .ok_or_else(|| RegistryError::UnknownDevice(id.to_string()))?;
        let token = self
            .login(&TerminalEndpoint::from(&device), credentials)
            .await?;
        let device = self.registry.update_device_token(id, &token)?;
        self.registry.set_active_device(Some(id))?;
        tracing::info!(
            target: "innalok::gateway",
            device_id = %id,
            "terminal login succeeded"
        );
        Ok(device)
    }

    /// Sends `envelope` to the active terminal.
    ///
    /// Returns `Ok(None)` without touching the network when there is no
    /// active device or it has no token. The terminal's answer alone decides
    /// the result; callback failures are only logged.
    pub async fn forward(
        &self,
        envelope: &TerminalRequest,
        backend_token: Option<&str>,
    ) -> Result<Option<TerminalResponse>, GatewayError> {
        let Some(device) = self.registry.active_device() else {
            tracing::warn!(
                target: "innalok::gateway",
                "no active terminal; request not forwarded"
            );
            return Ok(None);
        };
        let Some(device_token) = device.token().map(str::to_string) else {
            tracing::warn!(
                target: "innalok::gateway",
                device_id = %device.id,
                "active terminal has no session token; request not forwarded"
            );
            return Ok(None);
        };

        let mut request = envelope.clone();
        request.set_access_token(device_token.clone());
        for correction in sanitize_sale_quantities(&mut request) {
            tracing::info!(
                target: "innalok::gateway",
                item = correction.index,
                previous = ?correction.previous,
                corrected = correction.corrected,
                "corrected sale item quantity"
            );
        }

        let endpoint = TerminalEndpoint::from(&device);
        let response = self.transport.send(&endpoint, &request).await?;
        tracing::debug!(
            target: "innalok::gateway",
            device_id = %device.id,
            code = ?response.code,
            doc_type = ?request.doc_type(),
            "terminal responded"
        );

        if response.is_success() {
            let token = backend_token
                .filter(|token| !token.is_empty())
                .unwrap_or(device_token.as_str());
            self.report(&request, &response, token).await;
        }
        Ok(Some(response))
    }

    /// Manually asks the backend to resend a sale for fiscalization.
    pub async fn refresh_sale(
        &self,
        receipt_id: &str,
        backend_token: &str,
    ) -> Result<(), GatewayError> {
        self.tax.refresh_sale(backend_token, receipt_id).await
    }

    async fn report(&self, request: &TerminalRequest, response: &TerminalResponse, token: &str) {
        let doc_type = match request.doc_type() {
            Some(doc_type @ (DocType::Sale | DocType::Rollback)) => doc_type,
            _ => return,
        };
        // The backend's own reference wins over whatever the terminal echoes.
        let receipt_id = request
            .receipt_ref()
            .or_else(|| response.echoed_receipt_id());

        let result = match (doc_type, receipt_id) {
            (DocType::Sale, Some(receipt_id)) => {
                let Some(fiscal_id) = response.fiscal_id() else {
                    tracing::warn!(
                        target: "innalok::gateway",
                        receipt_id = %receipt_id,
                        "sale succeeded without a fiscal id; skipping sale callback"
                    );
                    return;
                };
                self.tax
                    .sale_response(token, &receipt_id, &fiscal_id)
                    .await
                    .map(|()| receipt_id)
            }
            (DocType::Rollback, Some(receipt_id)) => self
                .tax
                .rollback_response(token, &receipt_id)
                .await
                .map(|()| receipt_id),
            (_, None) => {
                tracing::warn!(
                    target: "innalok::gateway",
                    doc_type = ?doc_type,
                    "no receipt id on request or response; skipping callback"
                );
                return;
            }
            _ => return,
        };

        match result {
            Ok(receipt_id) => tracing::info!(
                target: "innalok::gateway",
                receipt_id = %receipt_id,
                doc_type = ?doc_type,
                "tax backend notified"
            ),
            Err(err) => tracing::warn!(
                target: "innalok::gateway",
                error = %err,
                doc_type = ?doc_type,
                "tax backend callback failed"
            ),
        }
    }
}
