//! In-process stand-in for the terminal, the tax backend and the webhook hub,
//! all served from one `127.0.0.1:0` listener.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use url::Url;

pub const RS: char = '\u{1e}';
pub const TERMINAL_TOKEN: &str = "abc";

pub type Params = HashMap<String, String>;

pub struct BackendState {
    pub terminal_requests: Mutex<Vec<Value>>,
    pub document_reply: Mutex<(StatusCode, Value)>,
    pub tax_calls: Mutex<Vec<(String, Params)>>,
    pub tax_status: AtomicU16,
    pub receipt_queries: Mutex<Vec<Params>>,
    pub receipts_body: Mutex<String>,
    pub hub_tokens: Mutex<Vec<String>>,
    pub hub_scripts: Mutex<VecDeque<Vec<String>>>,
    pub hub_handshake_reply: Mutex<String>,
    pub hub_connections: AtomicUsize,
}

impl Default for BackendState {
    fn default() -> Self {
        Self {
            terminal_requests: Mutex::new(Vec::new()),
            document_reply: Mutex::new((StatusCode::OK, json!({ "code": 0, "long_id": "F1" }))),
            tax_calls: Mutex::new(Vec::new()),
            tax_status: AtomicU16::new(200),
            receipt_queries: Mutex::new(Vec::new()),
            receipts_body: Mutex::new(
                json!({
                    "receipts": [{ "id": 7, "transaction_id": "T7", "sum": "12.50", "innalokTaxStatus": false }],
                    "page": 1,
                    "pageSize": 10,
                    "totalCount": 1
                })
                .to_string(),
            ),
            hub_tokens: Mutex::new(Vec::new()),
            hub_scripts: Mutex::new(VecDeque::new()),
            hub_handshake_reply: Mutex::new("{}".into()),
            hub_connections: AtomicUsize::new(0),
        }
    }
}

impl BackendState {
    pub fn tax_calls_to(&self, action: &str) -> Vec<Params> {
        self.tax_calls
            .lock()
            .iter()
            .filter(|(called, _)| called == action)
            .map(|(_, query)| query.clone())
            .collect()
    }

    pub fn terminal_requests_of(&self, check_type: u64) -> Vec<Value> {
        self.terminal_requests
            .lock()
            .iter()
            .filter(|request| {
                request["requestData"]["checkData"]["check_type"].as_u64() == Some(check_type)
            })
            .cloned()
            .collect()
    }

    /// Queues the frames the hub sends on its next accepted connection.
    pub fn script_next_connection(&self, frames: Vec<String>) {
        self.hub_scripts.lock().push_back(frames);
    }
}

pub struct MockBackend {
    pub addr: SocketAddr,
    pub state: Arc<BackendState>,
}

impl MockBackend {
    pub async fn start() -> Self {
        let state = Arc::new(BackendState::default());
        let router = Router::new()
            .route("/v2", post(terminal))
            .route("/api/Tax/:action", post(tax))
            .route("/api/UI/GetAllReceipts", get(receipts))
            .route("/api/UI/GetAllReceiptProducts", get(receipt_products))
            .route("/api/api/Auth/callback", get(auth_callback))
            .route("/api/WebhookHub", get(hub))
            .with_state(state.clone());
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock backend");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            axum::serve(listener, router).await.ok();
        });
        Self { addr, state }
    }

    pub fn base_url(&self) -> Url {
        Url::parse(&format!("http://{}", self.addr)).expect("base url")
    }

    pub fn auth_url(&self) -> Url {
        Url::parse(&format!("http://{}/api", self.addr)).expect("auth url")
    }

    pub fn terminal_ip(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn terminal_port(&self) -> u16 {
        self.addr.port()
    }
}

async fn terminal(
    State(state): State<Arc<BackendState>>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    state.terminal_requests.lock().push(body.clone());
    let data = &body["requestData"];
    match data["checkData"]["check_type"].as_u64() {
        Some(40) => {
            if data["name"] == "SuperApi" && data["password"] == "123" {
                (StatusCode::OK, Json(json!({ "access_token": TERMINAL_TOKEN })))
            } else {
                (StatusCode::OK, Json(json!({ "message": "Wrong credentials" })))
            }
        }
        Some(41) => {
            let code = if data["access_token"] == TERMINAL_TOKEN { 0 } else { 1 };
            (StatusCode::OK, Json(json!({ "code": code })))
        }
        _ => {
            let (status, reply) = state.document_reply.lock().clone();
            (status, Json(reply))
        }
    }
}

async fn tax(
    State(state): State<Arc<BackendState>>,
    Path(action): Path<String>,
    Query(query): Query<Params>,
) -> StatusCode {
    state.tax_calls.lock().push((action, query));
    StatusCode::from_u16(state.tax_status.load(Ordering::SeqCst))
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

async fn receipts(State(state): State<Arc<BackendState>>, Query(query): Query<Params>) -> String {
    state.receipt_queries.lock().push(query);
    state.receipts_body.lock().clone()
}

async fn receipt_products(Query(query): Query<Params>) -> Json<Value> {
    let receipt_id = query.get("ReceiptId").cloned().unwrap_or_default();
    Json(json!([
        { "id": 1, "product_name": format!("Tea for {receipt_id}"), "num": "2", "product_sum": "4.00" }
    ]))
}

async fn auth_callback(Query(query): Query<Params>) -> impl IntoResponse {
    if query.get("code").map(String::as_str) == Some("good") {
        let account = query.get("account").cloned().unwrap_or_default();
        (
            StatusCode::OK,
            Json(json!({
                "account_number": account,
                "access_token": "backend",
                "ownerInfo": { "name": "Aysel", "company_name": "Cafe" }
            })),
        )
            .into_response()
    } else {
        (StatusCode::BAD_REQUEST, "Account not found").into_response()
    }
}

async fn hub(
    State(state): State<Arc<BackendState>>,
    Query(query): Query<Params>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    state
        .hub_tokens
        .lock()
        .push(query.get("token").cloned().unwrap_or_default());
    state.hub_connections.fetch_add(1, Ordering::SeqCst);
    let script = state.hub_scripts.lock().pop_front().unwrap_or_default();
    let handshake_reply = state.hub_handshake_reply.lock().clone();
    ws.on_upgrade(move |socket| serve_hub(socket, handshake_reply, script))
}

async fn serve_hub(mut socket: WebSocket, handshake_reply: String, script: Vec<String>) {
    match socket.recv().await {
        Some(Ok(WsMessage::Text(text))) if text.contains("\"protocol\":\"json\"") => {}
        _ => return,
    }
    if socket
        .send(WsMessage::Text(format!("{handshake_reply}{RS}")))
        .await
        .is_err()
    {
        return;
    }
    for frame in script {
        if socket.send(WsMessage::Text(frame)).await.is_err() {
            return;
        }
    }
    while let Some(Ok(message)) = socket.recv().await {
        if matches!(message, WsMessage::Close(_)) {
            break;
        }
    }
}

/// A `posterEvent` invocation record carrying `all_data` as the envelope.
pub fn poster_event(transaction_type: &str, all_data: Value) -> String {
    let record = json!({
        "type": 1,
        "target": "posterEvent",
        "arguments": [{ "transactionType": transaction_type, "allData": all_data }]
    });
    format!("{record}{RS}")
}

pub fn close_record(allow_reconnect: bool) -> String {
    format!("{}{RS}", json!({ "type": 7, "allowReconnect": allow_reconnect }))
}

pub fn rollback_envelope(receipt_id: &str) -> Value {
    json!({
        "requestData": {
            "access_token": null,
            "checkData": { "check_type": 10 },
            "tokenData": {
                "parameters": { "doc_type": "rollback", "int_ref": receipt_id }
            }
        }
    })
}

/// A sale whose only line carries an underflowed quantity (price 10, sum 50).
pub fn sale_envelope(receipt_id: &str) -> Value {
    json!({
        "requestData": {
            "checkData": { "check_type": 1 },
            "tokenData": {
                "operationId": "createDocument",
                "version": 1,
                "parameters": {
                    "doc_type": "sale",
                    "int_ref": receipt_id,
                    "data": {
                        "cashier": "Aysel",
                        "currency": "AZN",
                        "items": [
                            { "itemName": "Tea", "itemPrice": 10.0, "itemSum": 50.0, "itemQuantity": 4e-7 }
                        ],
                        "sum": 50.0
                    }
                }
            }
        }
    })
}

/// Polls `condition` every 20ms for up to five seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..250 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}
