//! Minimal charging-station client.

use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use ocpp_gateway::BasicCredentials;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION, SEC_WEBSOCKET_PROTOCOL};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use super::TEST_TIMEOUT;

/// Connection options.
#[derive(Debug, Clone)]
pub struct StationOptions {
    /// Offered subprotocols.
    pub subprotocols: Vec<String>,
    /// Basic credentials to send.
    pub credentials: Option<BasicCredentials>,
}

impl Default for StationOptions {
    fn default() -> Self {
        Self {
            subprotocols: vec!["ocpp2.0.1".to_string()],
            credentials: None,
        }
    }
}

/// A connected station.
pub struct Station {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    /// Subprotocol the gateway picked.
    pub subprotocol: Option<String>,
}

impl Station {
    /// Connect to `/ocpp/<node>` with default options.
    pub async fn connect(addr: SocketAddr, node: &str) -> Self {
        Self::try_connect(addr, &format!("/ocpp/{node}"), StationOptions::default())
            .await
            .expect("connect")
    }

    /// Connect to `path` with `options`.
    pub async fn try_connect(
        addr: SocketAddr,
        path: &str,
        options: StationOptions,
    ) -> Result<Self, WsError> {
        let mut request = format!("ws://{addr}{path}").into_client_request()?;
        if !options.subprotocols.is_empty() {
            let offered = HeaderValue::from_str(&options.subprotocols.join(", ")).expect("header");
            request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, offered);
        }
        if let Some(credentials) = &options.credentials {
            let value = HeaderValue::from_str(&credentials.to_header_value()).expect("header");
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (ws, response) = connect_async(request).await?;
        let subprotocol = response
            .headers()
            .get(SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        Ok(Self { ws, subprotocol })
    }

    /// Send a text frame.
    pub async fn send_text(&mut self, text: impl Into<String>) {
        self.ws
            .send(Message::Text(text.into()))
            .await
            .expect("send text");
    }

    /// Send a JSON array as a text frame.
    pub async fn send_json(&mut self, value: Value) {
        self.send_text(value.to_string()).await;
    }

    /// Send a binary frame.
    pub async fn send_binary(&mut self, bytes: Vec<u8>) {
        self.ws
            .send(Message::Binary(bytes))
            .await
            .expect("send binary");
    }

    /// Next data or close message, skipping control frames.
    pub async fn next_message(&mut self) -> Option<Message> {
        tokio::time::timeout(TEST_TIMEOUT, async {
            loop {
                match self.ws.next().await {
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                    Some(Ok(message)) => return Some(message),
                    Some(Err(_)) | None => return None,
                }
            }
        })
        .await
        .expect("no message in time")
    }

    /// Next text frame, parsed as JSON.
    pub async fn recv_json(&mut self) -> Value {
        match self.next_message().await {
            Some(Message::Text(text)) => serde_json::from_str(&text).expect("valid JSON"),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    /// Next binary frame.
    pub async fn recv_binary(&mut self) -> Vec<u8> {
        match self.next_message().await {
            Some(Message::Binary(bytes)) => bytes,
            other => panic!("expected binary frame, got {other:?}"),
        }
    }

    /// Wait until the gateway closes the connection.
    pub async fn expect_closed(&mut self) {
        loop {
            match self.next_message().await {
                None | Some(Message::Close(_)) => return,
                Some(_) => continue,
            }
        }
    }

    /// Close from the station side.
    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}
