use async_trait::async_trait;
use omnisoft_proto::{TerminalRequest, TerminalResponse};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;

use super::tax::TaxBackend;
use super::{GatewayError, TerminalEndpoint, TerminalTransport};

type Responder = dyn Fn(&TerminalRequest) -> Result<TerminalResponse, GatewayError> + Send + Sync;

/// Records every request and answers with a caller supplied function.
#[derive(Clone)]
pub(crate) struct MockTerminal {
    responder: Arc<Responder>,
    requests: Arc<Mutex<Vec<(TerminalEndpoint, TerminalRequest)>>>,
}

impl MockTerminal {
    pub(crate) fn new(
        responder: impl Fn(&TerminalRequest) -> Result<TerminalResponse, GatewayError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            responder: Arc::new(responder),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub(crate) fn replying(response: serde_json::Value) -> Self {
        Self::new(move |_| Ok(serde_json::from_value(response.clone())?))
    }

    pub(crate) fn success() -> Self {
        Self::replying(json!({ "code": 0 }))
    }

    pub(crate) fn calls(&self) -> usize {
        self.requests.lock().len()
    }

    pub(crate) fn requests(&self) -> Vec<(TerminalEndpoint, TerminalRequest)> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl TerminalTransport for MockTerminal {
    async fn send(
        &self,
        endpoint: &TerminalEndpoint,
        request: &TerminalRequest,
    ) -> Result<TerminalResponse, GatewayError> {
        self.requests
            .lock()
            .push((endpoint.clone(), request.clone()));
        (self.responder)(request)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TaxCall {
    Sale {
        token: String,
        receipt_id: String,
        fiscal_id: String,
    },
    Rollback {
        token: String,
        receipt_id: String,
    },
    Refresh {
        token: String,
        receipt_id: String,
    },
}

#[derive(Clone, Default)]
pub(crate) struct MockTax {
    calls: Arc<Mutex<Vec<TaxCall>>>,
    failing: bool,
}

impl MockTax {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    pub(crate) fn calls(&self) -> Vec<TaxCall> {
        self.calls.lock().clone()
    }

    fn record(&self, call: TaxCall) -> Result<(), GatewayError> {
        self.calls.lock().push(call);
        if self.failing {
            return Err(GatewayError::HttpStatus(
                reqwest::StatusCode::SERVICE_UNAVAILABLE,
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl TaxBackend for MockTax {
    async fn sale_response(
        &self,
        token: &str,
        receipt_id: &str,
        fiscal_id: &str,
    ) -> Result<(), GatewayError> {
        self.record(TaxCall::Sale {
            token: token.into(),
            receipt_id: receipt_id.into(),
            fiscal_id: fiscal_id.into(),
        })
    }

    async fn rollback_response(&self, token: &str, receipt_id: &str) -> Result<(), GatewayError> {
        self.record(TaxCall::Rollback {
            token: token.into(),
            receipt_id: receipt_id.into(),
        })
    }

    async fn refresh_sale(&self, token: &str, receipt_id: &str) -> Result<(), GatewayError> {
        self.record(TaxCall::Refresh {
            token: token.into(),
            receipt_id: receipt_id.into(),
        })
    }
}
