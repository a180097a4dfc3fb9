//! Minimal client side of the SignalR JSON hub protocol over a raw
//! WebSocket (negotiation skipped).
//!
//! Every record is a JSON object terminated by `0x1e`. A connection opens
//! with a handshake record each way; afterwards only invocations, pings and
//! close records matter to the relay.

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

use super::RelayError;
use crate::config::api_endpoint;

pub const RECORD_SEPARATOR: char = '\u{1e}';
pub const HUB_PATH: &str = "api/WebhookHub";

pub type HubStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const INVOCATION: u8 = 1;
const PING: u8 = 6;
const CLOSE: u8 = 7;

#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    Invocation { target: String, arguments: Vec<Value> },
    Ping,
    Close { error: Option<String>, allow_reconnect: bool },
    Other(u8),
}

#[derive(Deserialize)]
struct RawMessage {
    #[serde(rename = "type")]
    kind: u8,
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    arguments: Vec<Value>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default, rename = "allowReconnect")]
    allow_reconnect: bool,
}

pub fn handshake_request() -> String {
    format!(r#"{{"protocol":"json","version":1}}{RECORD_SEPARATOR}"#)
}

pub fn ping_record() -> String {
    format!(r#"{{"type":{PING}}}{RECORD_SEPARATOR}"#)
}

/// Splits a frame into its records, dropping empty ones.
pub fn split_records(frame: &str) -> impl Iterator<Item = &str> {
    frame
        .split(RECORD_SEPARATOR)
        .map(str::trim)
        .filter(|record| !record.is_empty())
}

pub fn parse_message(record: &str) -> Result<HubMessage, serde_json::Error> {
    let raw: RawMessage = serde_json::from_str(record)?;
    Ok(match raw.kind {
        INVOCATION => HubMessage::Invocation {
            target: raw.target.unwrap_or_default(),
            arguments: raw.arguments,
        },
        PING => HubMessage::Ping,
        CLOSE => HubMessage::Close {
            error: raw.error,
            allow_reconnect: raw.allow_reconnect,
        },
        other => HubMessage::Other(other),
    })
}

/// Checks the server's handshake reply: `{}` on success, `{"error": ...}`
/// otherwise.
pub fn parse_handshake_response(record: &str) -> Result<(), RelayError> {
    let value: Value = serde_json::from_str(record)
        .map_err(|err| RelayError::Handshake(format!("malformed handshake response: {err}")))?;
    match value.get("error").and_then(Value::as_str) {
        Some(error) => Err(RelayError::Handshake(error.to_string())),
        None => Ok(()),
    }
}

/// `{base}/api/WebhookHub?token=...` with the scheme switched to ws/wss.
pub fn hub_url(api_base_url: &Url, token: &str) -> Result<Url, RelayError> {
    let mut url = api_endpoint(api_base_url, HUB_PATH)
        .map_err(|err| RelayError::InvalidUrl(err.to_string()))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(RelayError::InvalidUrl(format!(
                "unsupported scheme {other}"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|()| RelayError::InvalidUrl(format!("cannot use scheme {scheme}")))?;
    url.query_pairs_mut().append_pair("token", token);
    Ok(url)
}

/// Opens the socket and completes the handshake. Messages that arrived in
/// the same frame as the handshake reply are returned alongside the stream.
pub async fn connect(
    url: &Url,
    handshake_timeout: Duration,
) -> Result<(HubStream, Vec<HubMessage>), RelayError> {
    let (mut stream, _) = tokio::time::timeout(handshake_timeout, connect_async(url.as_str()))
        .await
        .map_err(|_| RelayError::Timeout)??;
    stream.send(Message::Text(handshake_request().into())).await?;

    let buffered = tokio::time::timeout(handshake_timeout, async {
        let mut buffer = String::new();
        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    buffer.push_str(text.as_str());
                    if buffer.contains(RECORD_SEPARATOR) {
                        return Ok(buffer);
                    }
                }
                Some(Ok(Message::Close(_))) | None => return Err(RelayError::Closed),
                Some(Ok(_)) => {}
                Some(Err(err)) => return Err(err.into()),
            }
        }
    })
    .await
    .map_err(|_| RelayError::Timeout)??;

    let (reply, rest) = buffered
        .split_once(RECORD_SEPARATOR)
        .unwrap_or((buffered.as_str(), ""));
    parse_handshake_response(reply)?;

    let mut pending = Vec::new();
    for record in split_records(rest) {
        match parse_message(record) {
            Ok(message) => pending.push(message),
            Err(err) => tracing::warn!(
                target: "innalok::relay",
                error = %err,
                "dropping malformed hub record"
            ),
        }
    }
    Ok((stream, pending))
}
