mod support;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use innalok_relay::app::App;
use innalok_relay::auth::{AuthData, OwnerInfo};
use innalok_relay::config::Config;
use innalok_relay::gateway::{http_client, Credentials, TerminalGateway};
use innalok_relay::registry::{Device, DeviceKind, DeviceRegistry};
use innalok_relay::relay::retry::DelaySchedule;
use innalok_relay::relay::{ConnectionStatus, NotificationRelay, RelayConfig, RelayError};
use innalok_relay::settings::Settings;
use innalok_relay::status::StatusHub;
use innalok_relay::store::MemoryStore;
use query_bus::{LocalQueryBus, QueryBus};
use support::{close_record, eventually, poster_event, rollback_envelope, MockBackend};

fn config_for(backend: &MockBackend) -> Config {
    let api = backend.base_url().to_string();
    let auth = backend.auth_url().to_string();
    Config::from_lookup(move |key| match key {
        "INNALOK_API_BASE_URL" => Some(api.clone()),
        "INNALOK_AUTH_BASE_URL" => Some(auth.clone()),
        "INNALOK_STATE_DIR" => Some("/nonexistent/innalok".into()),
        "INNALOK_RECONNECT_DELAYS_MS" => Some("0,50".into()),
        "INNALOK_HTTP_TIMEOUT_SECS" => Some("2".into()),
        _ => None,
    })
    .unwrap()
}

async fn connected_gateway(backend: &MockBackend) -> TerminalGateway {
    let registry = DeviceRegistry::load(Arc::new(MemoryStore::new()), StatusHub::new());
    let device = registry
        .add_device(Device::new(
            None,
            &backend.terminal_ip(),
            backend.terminal_port(),
            DeviceKind::Terminal,
        ))
        .unwrap()
        .unwrap();
    let gateway = TerminalGateway::new(
        registry,
        http_client(Duration::from_secs(2)).unwrap(),
        backend.base_url(),
    );
    gateway
        .connect_device(&device.id, &Credentials::default())
        .await
        .unwrap();
    gateway
}

#[tokio::test]
async fn hub_rollback_reaches_terminal_and_backend_once() {
    let backend = MockBackend::start().await;
    backend
        .state
        .script_next_connection(vec![poster_event("rollback", rollback_envelope("R100"))]);

    let store = Arc::new(MemoryStore::new());
    let app = Arc::new(App::with_store(config_for(&backend), store).unwrap());
    let device = app
        .registry()
        .add_device(Device::new(
            None,
            &backend.terminal_ip(),
            backend.terminal_port(),
            DeviceKind::Terminal,
        ))
        .unwrap()
        .unwrap();
    app.gateway()
        .connect_device(&device.id, &Credentials::default())
        .await
        .unwrap();
    app.auth_store()
        .save(&AuthData {
            account_number: "333".into(),
            access_token: "backend".into(),
            owner_info: OwnerInfo::default(),
        })
        .unwrap();

    let shutdown = CancellationToken::new();
    let serving = tokio::spawn({
        let app = app.clone();
        let shutdown = shutdown.clone();
        async move { app.serve(shutdown).await }
    });

    let state = backend.state.clone();
    assert!(eventually(|| !state.tax_calls_to("RollBackResponse").is_empty()).await);
    // Receipts are fetched on start and again after the notification invalidates them.
    assert!(eventually(|| state.receipt_queries.lock().len() >= 2).await);
    assert!(eventually(|| app.registry().status().snapshot().label() == "online").await);

    shutdown.cancel();
    serving.await.unwrap().unwrap();

    let rollbacks = state.tax_calls_to("RollBackResponse");
    assert_eq!(rollbacks.len(), 1);
    assert_eq!(rollbacks[0]["ReceiptId"], "R100");
    assert_eq!(rollbacks[0]["Token"], "backend");
    assert!(state.tax_calls_to("SaleResponse").is_empty());

    let forwarded = state.terminal_requests_of(10);
    assert_eq!(forwarded.len(), 1);
    assert_eq!(forwarded[0]["requestData"]["access_token"], "abc");
    assert_eq!(*state.hub_tokens.lock(), vec!["backend".to_string()]);
}

#[tokio::test]
async fn relay_reconnects_after_server_close() {
    let backend = MockBackend::start().await;
    backend.state.script_next_connection(vec![close_record(true)]);
    backend
        .state
        .script_next_connection(vec![poster_event("rollback", rollback_envelope("R200"))]);

    let gateway = connected_gateway(&backend).await;
    let bus = Arc::new(LocalQueryBus::new());
    let relay = Arc::new(
        NotificationRelay::new(
            RelayConfig::new(backend.base_url(), Some("backend".into())),
            gateway,
            Settings::new(Arc::new(MemoryStore::new())),
            bus.clone(),
        )
        .with_retry_policy(Arc::new(DelaySchedule::new(vec![Duration::ZERO]))),
    );
    let mut status = relay.subscribe_status();
    status.borrow_and_update();

    let shutdown = CancellationToken::new();
    let running = tokio::spawn(relay.clone().run(shutdown.clone()));

    let state = backend.state.clone();
    assert!(eventually(|| !state.tax_calls_to("RollBackResponse").is_empty()).await);
    assert_eq!(state.hub_connections.load(Ordering::SeqCst), 2);
    assert_eq!(state.tax_calls_to("RollBackResponse")[0]["ReceiptId"], "R200");
    assert_eq!(relay.status(), ConnectionStatus::Connected);
    assert!(bus.generation(innalok_relay::receipts::RECEIPTS_TOPIC) >= 1);
    assert!(status.has_changed().unwrap());

    shutdown.cancel();
    running.await.unwrap().unwrap();
    assert_eq!(relay.status(), ConnectionStatus::Disconnected);
}

#[tokio::test]
async fn close_without_reconnect_ends_relay() {
    let backend = MockBackend::start().await;
    backend.state.script_next_connection(vec![close_record(false)]);

    let gateway = connected_gateway(&backend).await;
    let relay = Arc::new(NotificationRelay::new(
        RelayConfig::new(backend.base_url(), Some("backend".into())),
        gateway,
        Settings::new(Arc::new(MemoryStore::new())),
        Arc::new(LocalQueryBus::new()),
    ));

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        relay.clone().run(CancellationToken::new()),
    )
    .await
    .unwrap();
    assert!(result.is_ok());
    assert_eq!(relay.status(), ConnectionStatus::Disconnected);
    assert_eq!(backend.state.hub_connections.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn rejected_handshake_fails_first_connect() {
    let backend = MockBackend::start().await;
    *backend.state.hub_handshake_reply.lock() = r#"{"error":"Unauthorized"}"#.into();

    let gateway = connected_gateway(&backend).await;
    let relay = Arc::new(NotificationRelay::new(
        RelayConfig::new(backend.base_url(), Some("expired".into())),
        gateway,
        Settings::new(Arc::new(MemoryStore::new())),
        Arc::new(LocalQueryBus::new()),
    ));

    match relay.clone().run(CancellationToken::new()).await {
        Err(RelayError::Handshake(message)) => assert_eq!(message, "Unauthorized"),
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(relay.status(), ConnectionStatus::Disconnected);
    assert_eq!(backend.state.hub_connections.load(Ordering::SeqCst), 1);
}
