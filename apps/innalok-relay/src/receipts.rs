//! Receipt listing from the backend plus a small cache that follows the
//! `receipts` invalidation topic.

use async_trait::async_trait;
use parking_lot::Mutex;
use query_bus::QueryBus;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::auth::AuthData;
use crate::config::api_endpoint;

pub const RECEIPTS_TOPIC: &str = "receipts";
pub const DEFAULT_PAGE_SIZE: u32 = 10;

#[derive(Debug, Error)]
pub enum ReceiptsError {
    #[error("invalid receipts endpoint: {0}")]
    InvalidConfig(String),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("unexpected http status {0}")]
    HttpStatus(StatusCode),
    #[error("invalid receipts response: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    pub id: i64,
    #[serde(default)]
    pub transaction_id: Option<String>,
    #[serde(default)]
    pub date_close: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub sum: Option<String>,
    #[serde(default)]
    pub payed_sum: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "fiscalId")]
    pub fiscal_id: Option<String>,
    #[serde(default, rename = "innalokTaxStatus")]
    pub tax_status: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiptProduct {
    pub id: i64,
    #[serde(default)]
    pub product_name: Option<String>,
    #[serde(default)]
    pub modificator_name: Option<String>,
    #[serde(default)]
    pub num: Option<String>,
    #[serde(default)]
    pub product_sum: Option<String>,
    #[serde(default)]
    pub payed_sum: Option<String>,
    #[serde(default, rename = "receiptDataId")]
    pub receipt_data_id: Option<i64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptsPage {
    #[serde(default)]
    pub receipts: Vec<Receipt>,
    #[serde(default)]
    pub page: u32,
    #[serde(default)]
    pub page_size: u32,
    #[serde(default)]
    pub total_count: u64,
}

impl ReceiptsPage {
    pub fn total_pages(&self) -> u64 {
        if self.page_size == 0 {
            return 0;
        }
        self.total_count.div_ceil(u64::from(self.page_size))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReceiptQuery {
    pub page: u32,
    pub page_size: u32,
    /// `Some(true)` for receipts already reported to the tax service,
    /// `Some(false)` for pending ones.
    pub tax_status: Option<bool>,
}

impl Default for ReceiptQuery {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
            tax_status: None,
        }
    }
}

#[async_trait]
pub trait ReceiptSource: Send + Sync {
    async fn receipts(
        &self,
        auth: &AuthData,
        query: &ReceiptQuery,
    ) -> Result<ReceiptsPage, ReceiptsError>;

    async fn receipt_products(&self, receipt_id: i64) -> Result<Vec<ReceiptProduct>, ReceiptsError>;
}

pub struct ReceiptsClient {
    client: reqwest::Client,
    base_url: Url,
}

impl ReceiptsClient {
    pub fn new(client: reqwest::Client, base_url: Url) -> Self {
        Self { client, base_url }
    }

    /// GETs `path` and decodes the body; an empty body decodes as `T::default()`.
    async fn get<T: DeserializeOwned + Default>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ReceiptsError> {
        let endpoint = api_endpoint(&self.base_url, path)
            .map_err(|err| ReceiptsError::InvalidConfig(format!("{path}: {err}")))?;
        let response = self
            .client
            .get(endpoint)
            .query(query)
            .header(reqwest::header::ACCEPT, "application/json, text/plain, */*")
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ReceiptsError::HttpStatus(response.status()));
        }
        let body = response.text().await?;
        if body.trim().is_empty() {
            return Ok(T::default());
        }
        Ok(serde_json::from_str(&body)?)
    }
}

#[async_trait]
impl ReceiptSource for ReceiptsClient {
    async fn receipts(
        &self,
        auth: &AuthData,
        query: &ReceiptQuery,
    ) -> Result<ReceiptsPage, ReceiptsError> {
        let mut params = vec![
            ("token", auth.access_token.clone()),
            ("accountNumber", auth.account_number.clone()),
            ("page", query.page.to_string()),
            ("pageSize", query.page_size.to_string()),
        ];
        if let Some(status) = query.tax_status {
            params.push(("innalokTaxStatus", status.to_string()));
        }
        self.get("api/UI/GetAllReceipts", &params).await
    }

    async fn receipt_products(&self, receipt_id: i64) -> Result<Vec<ReceiptProduct>, ReceiptsError> {
        self.get(
            "api/UI/GetAllReceiptProducts",
            &[("ReceiptId", receipt_id.to_string())],
        )
        .await
    }
}

/// Pages cached per query and tagged with the topic generation they were
/// fetched under. Any invalidation of [`RECEIPTS_TOPIC`] makes every cached
/// page stale.
pub struct ReceiptCache {
    source: Arc<dyn ReceiptSource>,
    bus: Arc<dyn QueryBus>,
    pages: Mutex<HashMap<ReceiptQuery, (u64, ReceiptsPage)>>,
}

impl ReceiptCache {
    pub fn new(source: Arc<dyn ReceiptSource>, bus: Arc<dyn QueryBus>) -> Self {
        Self {
            source,
            bus,
            pages: Mutex::new(HashMap::new()),
        }
    }

    pub async fn page(
        &self,
        auth: &AuthData,
        query: &ReceiptQuery,
    ) -> Result<ReceiptsPage, ReceiptsError> {
        let generation = self.bus.generation(RECEIPTS_TOPIC);
        let cached = self
            .pages
            .lock()
            .get(query)
            .filter(|(cached_at, _)| *cached_at == generation)
            .map(|(_, page)| page.clone());
        if let Some(page) = cached {
            return Ok(page);
        }
        let page = self.source.receipts(auth, query).await?;
        // Tagged with the generation read before the fetch, so an
        // invalidation that lands mid-request still forces a refetch.
        self.pages.lock().insert(*query, (generation, page.clone()));
        Ok(page)
    }

    pub async fn products(&self, receipt_id: i64) -> Result<Vec<ReceiptProduct>, ReceiptsError> {
        self.source.receipt_products(receipt_id).await
    }

    /// Keeps one query fresh: fetches it now and again after every
    /// invalidation, publishing each result. Fetch errors are logged and the
    /// last good page stays published.
    pub fn watch(
        self: Arc<Self>,
        auth: AuthData,
        query: ReceiptQuery,
        shutdown: CancellationToken,
    ) -> watch::Receiver<Option<ReceiptsPage>> {
        let (tx, rx) = watch::channel(None);
        let mut invalidations = self.bus.subscribe(RECEIPTS_TOPIC);
        tokio::spawn(async move {
            loop {
                match self.page(&auth, &query).await {
                    Ok(page) => {
                        tracing::debug!(
                            target: "innalok::receipts",
                            page = page.page,
                            total_count = page.total_count,
                            "receipts refreshed"
                        );
                        if tx.send(Some(page)).is_err() {
                            break;
                        }
                    }
                    Err(err) => tracing::warn!(
                        target: "innalok::receipts",
                        error = %err,
                        "failed to refresh receipts"
                    ),
                }
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    received = invalidations.recv() => match received {
                        Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::OwnerInfo;
    use query_bus::LocalQueryBus;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSource {
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl ReceiptSource for CountingSource {
        async fn receipts(
            &self,
            _auth: &AuthData,
            query: &ReceiptQuery,
        ) -> Result<ReceiptsPage, ReceiptsError> {
            let fetch = self.fetches.fetch_add(1, Ordering::SeqCst) as u64 + 1;
            Ok(ReceiptsPage {
                receipts: Vec::new(),
                page: query.page,
                page_size: query.page_size,
                total_count: fetch,
            })
        }

        async fn receipt_products(
            &self,
            _receipt_id: i64,
        ) -> Result<Vec<ReceiptProduct>, ReceiptsError> {
            Ok(Vec::new())
        }
    }

    fn auth() -> AuthData {
        AuthData {
            account_number: "333".into(),
            access_token: "backend".into(),
            owner_info: OwnerInfo::default(),
        }
    }

    fn cache() -> (Arc<ReceiptCache>, Arc<CountingSource>, Arc<LocalQueryBus>) {
        let source = Arc::new(CountingSource {
            fetches: AtomicUsize::new(0),
        });
        let bus = Arc::new(LocalQueryBus::new());
        let cache = Arc::new(ReceiptCache::new(source.clone(), bus.clone()));
        (cache, source, bus)
    }

    #[tokio::test]
    async fn cached_pages_are_reused_until_invalidated() {
        let (cache, source, bus) = cache();
        let query = ReceiptQuery::default();

        assert_eq!(cache.page(&auth(), &query).await.unwrap().total_count, 1);
        assert_eq!(cache.page(&auth(), &query).await.unwrap().total_count, 1);
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);

        let other = ReceiptQuery {
            tax_status: Some(false),
            ..query
        };
        cache.page(&auth(), &other).await.unwrap();
        assert_eq!(source.fetches.load(Ordering::SeqCst), 2);

        bus.invalidate(RECEIPTS_TOPIC);
        assert_eq!(cache.page(&auth(), &query).await.unwrap().total_count, 3);
    }

    #[tokio::test]
    async fn watch_refetches_after_invalidation() {
        let (cache, _source, bus) = cache();
        let shutdown = CancellationToken::new();
        let mut rx = cache.watch(auth(), ReceiptQuery::default(), shutdown.clone());

        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().as_ref().map(|p| p.total_count), Some(1));

        bus.invalidate(RECEIPTS_TOPIC);
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().as_ref().map(|p| p.total_count), Some(2));
        shutdown.cancel();
    }

    #[test]
    fn page_decodes_backend_shape() {
        let page: ReceiptsPage = serde_json::from_value(json!({
            "receipts": [{
                "id": 12,
                "createDate": "2025-01-10T10:00:00",
                "transaction_id": "9001",
                "sum": "1500",
                "fiscalId": "F1",
                "innalokTaxStatus": true,
                "spot_id": "1"
            }],
            "page": 1,
            "pageSize": 10,
            "totalCount": 21
        }))
        .unwrap();
        assert_eq!(page.total_pages(), 3);
        let receipt = &page.receipts[0];
        assert_eq!(receipt.transaction_id.as_deref(), Some("9001"));
        assert_eq!(receipt.tax_status, Some(true));
        assert_eq!(receipt.extra["spot_id"], "1");
    }
}
