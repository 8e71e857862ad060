//! Per-socket session.
//!
//! One task per accepted TCP socket runs the WebSocket handshake, then the
//! read loop. Inbound requests are queued to a per-connection worker so
//! replies keep being matched while a handler is busy; requests of one
//! connection are still handled one at a time, in arrival order.

use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::{FutureExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::{
    HeaderValue, CONTENT_TYPE, SEC_WEBSOCKET_PROTOCOL, WWW_AUTHENTICATE,
};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;

use crate::connection::{CloseReason, Connection, WsFrameSink};
use crate::envelope::{
    decode_binary, decode_text, Envelope, ErrorCode, ErrorEnvelope, Frame, RequestEnvelope,
    ResponseEnvelope, WireFormat,
};
use crate::gateway::Gateway;
use crate::handlers::{HandlerError, RequestContext};
use crate::lifecycle::{RejectStatus, UpgradeDecision, UpgradeRejection, UpgradeRequest};
use crate::observer::GatewayEvent;
use crate::types::NetworkingMode;

/// Drive one accepted socket until it closes.
pub(crate) async fn run_session(gateway: Gateway, stream: TcpStream, remote_addr: SocketAddr) {
    let inner = gateway.inner();
    let mut decision = None;
    let callback = |request: &Request, response: Response| {
        let verdict = inner
            .lifecycle
            .validate_upgrade(&UpgradeRequest::from_http(request));
        let result = match &verdict {
            UpgradeDecision::Accept { subprotocol, .. } => accept_response(response, subprotocol),
            UpgradeDecision::Reject(rejection) => Err(reject_response(rejection)),
        };
        decision = Some(verdict);
        result
    };

    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = Some(inner.config.max_frame_size);
    ws_config.max_frame_size = Some(inner.config.max_frame_size);

    let handshake =
        tokio_tungstenite::accept_hdr_async_with_config(stream, callback, Some(ws_config));
    let handshake = tokio::time::timeout(inner.config.handshake_timeout, handshake).await;
    let ws = match handshake {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => {
            match decision {
                Some(UpgradeDecision::Reject(rejection)) => tracing::info!(
                    %remote_addr,
                    status = rejection.status.code(),
                    reason = %rejection.reason,
                    "upgrade rejected"
                ),
                _ => tracing::debug!(%remote_addr, error = %e, "handshake failed"),
            }
            return;
        }
        Err(_) => {
            tracing::debug!(%remote_addr, "handshake timed out");
            return;
        }
    };
    let Some(UpgradeDecision::Accept {
        node_id,
        subprotocol,
    }) = decision
    else {
        return;
    };

    let (write, mut read) = ws.split();
    let sink = Arc::new(WsFrameSink::new(write, inner.config.write_timeout));
    let conn = Arc::new(Connection::new(
        node_id,
        Some(remote_addr),
        subprotocol,
        sink,
        inner.time.now(),
    ));
    inner.lifecycle.on_accepted(&conn);

    let (request_tx, request_rx) = mpsc::channel(inner.config.request_queue_capacity.max(1));
    let worker = tokio::spawn(request_worker(gateway.clone(), Arc::clone(&conn), request_rx));

    let ping_interval = inner.config.ping_interval;
    let mut pings = (!ping_interval.is_zero()).then(|| {
        let mut interval = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });

    let reason = loop {
        tokio::select! {
            _ = conn.closed() => break CloseReason::PeerClosed,
            _ = inner.shutdown.cancelled() => break CloseReason::Shutdown,
            _ = tick(&mut pings) => {
                let idle = inner.time.now().saturating_sub(conn.last_seen());
                if idle > ping_interval * 2 {
                    break CloseReason::Unresponsive;
                }
                if let Err(e) = conn.send_ping(Vec::new()).await {
                    tracing::warn!(node_id = %conn.node_id(), error = %e, "ping failed");
                    break CloseReason::WriteFailed;
                }
            }
            message = read.next() => match message {
                None => break CloseReason::PeerClosed,
                Some(Err(e)) => {
                    tracing::debug!(node_id = %conn.node_id(), error = %e, "read failed");
                    break CloseReason::ReadFailed;
                }
                Some(Ok(message)) => {
                    conn.touch(inner.time.now());
                    let frame = match message {
                        Message::Text(text) => Frame::Text(text),
                        Message::Binary(bytes) => Frame::Binary(bytes),
                        Message::Close(_) => break CloseReason::PeerClosed,
                        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
                    };
                    handle_frame(&gateway, &conn, &request_tx, frame).await;
                }
            },
        }
    };

    // The first recorded reason wins, e.g. Superseded over PeerClosed.
    inner.lifecycle.on_closed(&conn, reason);
    conn.shutdown_socket().await;
    drop(request_tx);
    let _ = worker.await;
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn accept_response(mut response: Response, subprotocol: &str) -> Result<Response, ErrorResponse> {
    match HeaderValue::from_str(subprotocol) {
        Ok(value) => {
            response.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
            Ok(response)
        }
        Err(_) => Err(reject_response(&UpgradeRejection {
            status: RejectStatus::BadRequest,
            reason: format!("invalid subprotocol {subprotocol}"),
        })),
    }
}

fn reject_response(rejection: &UpgradeRejection) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(rejection.body()));
    *response.status_mut() = match rejection.status {
        RejectStatus::BadRequest => StatusCode::BAD_REQUEST,
        RejectStatus::Unauthorized => StatusCode::UNAUTHORIZED,
    };
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if rejection.status == RejectStatus::Unauthorized {
        headers.insert(WWW_AUTHENTICATE, HeaderValue::from_static("Basic realm=\"OCPP\""));
    }
    response
}

async fn handle_frame(
    gateway: &Gateway,
    conn: &Arc<Connection>,
    request_tx: &mpsc::Sender<RequestEnvelope>,
    frame: Frame,
) {
    let inner = gateway.inner();
    let max = inner.config.max_frame_size;
    let (decoded, format) = match &frame {
        Frame::Text(text) => (decode_text(text, max), WireFormat::Json),
        Frame::Binary(bytes) => (decode_binary(bytes, max), WireFormat::Binary),
    };

    match decoded {
        Ok(Envelope::Request(request)) => {
            conn.observe_mode(request.networking_mode);
            inner.observers.notify(&GatewayEvent::RequestReceived {
                node_id: conn.node_id().clone(),
                request_id: request.request_id.clone(),
                action: request.action.clone(),
            });
            if let Err(mpsc::error::TrySendError::Full(request)) = request_tx.try_send(request) {
                tracing::warn!(
                    node_id = %conn.node_id(),
                    request_id = %request.request_id,
                    "request queue full"
                );
                let reply = ErrorEnvelope::new(
                    request.request_id,
                    ErrorCode::GenericError,
                    "too many requests in flight",
                    request.payload.format(),
                );
                send_reply(gateway, conn, Envelope::Error(reply)).await;
            }
        }
        Ok(reply) => {
            inner.correlation.on_inbound_reply(conn.node_id(), reply);
        }
        Err(failure) => {
            tracing::warn!(
                node_id = %conn.node_id(),
                request_id = ?failure.request_id,
                error = %failure,
                "failed to decode frame"
            );
            inner.observers.notify(&GatewayEvent::DecodeFailed {
                node_id: conn.node_id().clone(),
                request_id: failure.request_id.clone(),
                error: failure.to_string(),
            });
            let reply = ErrorEnvelope::from_decode_failure(&failure, format);
            send_reply(gateway, conn, Envelope::Error(reply)).await;
        }
    }
}

async fn request_worker(
    gateway: Gateway,
    conn: Arc<Connection>,
    mut requests: mpsc::Receiver<RequestEnvelope>,
) {
    while let Some(request) = requests.recv().await {
        let format = request.payload.format();
        let request_id = request.request_id.clone();
        let ctx = RequestContext {
            node_id: conn.node_id().clone(),
            connection_id: conn.id(),
            request_id: request.request_id,
            action: request.action,
            networking_mode: request.networking_mode,
            destination: request.destination,
            network_path: request.network_path,
            gateway: gateway.clone(),
        };
        let action = ctx.action.clone();

        let handled = AssertUnwindSafe(gateway.inner().handlers.dispatch(ctx, request.payload))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(HandlerError::internal("handler panicked")));

        let reply = match handled {
            Ok(payload) => Envelope::Response(ResponseEnvelope {
                request_id,
                payload,
            }),
            Err(error) => {
                tracing::debug!(
                    node_id = %conn.node_id(),
                    request_id = %request_id,
                    %action,
                    error = %error,
                    "handler returned an error"
                );
                Envelope::Error(ErrorEnvelope {
                    request_id,
                    code: error.code,
                    description: error.description,
                    details: error.details,
                    format,
                })
            }
        };
        send_reply(&gateway, &conn, reply).await;
    }
}

/// Write a reply on the connection the request arrived on.
async fn send_reply(gateway: &Gateway, conn: &Connection, reply: Envelope) {
    let max = gateway.inner().config.max_frame_size;
    let frame = match reply.encode(NetworkingMode::Standard, max) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!(
                node_id = %conn.node_id(),
                request_id = %reply.request_id(),
                error = %e,
                "failed to encode reply"
            );
            let fallback = Envelope::Error(ErrorEnvelope::new(
                reply.request_id().clone(),
                ErrorCode::InternalError,
                e.to_string(),
                reply.format(),
            ));
            match fallback.encode(NetworkingMode::Standard, max) {
                Ok(frame) => frame,
                Err(_) => return,
            }
        }
    };
    if let Err(e) = conn.send_frame(frame).await {
        tracing::warn!(node_id = %conn.node_id(), error = %e, "failed to send reply");
        conn.close(CloseReason::WriteFailed);
    }
}
