//! End-to-end scenarios.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use ocpp_gateway::envelope::{decode_binary, Envelope, Payload, ResponseEnvelope};
use ocpp_gateway::{
    BasicCredentials, CloseReason, ErrorCode, GatewayBuilder, GatewayConfig, GatewayEvent,
    HandlerError, NetworkingMode, NodeId, ObserverError, RequestContext, RequestId,
    RequestOutcome, SendResult,
};
use serde_json::json;
use tokio::sync::{Notify, Semaphore};
use tokio_tungstenite::tungstenite::Error as WsError;

use super::station::{Station, StationOptions};
use super::{start_gateway, wait_until};

fn node(id: &str) -> NodeId {
    NodeId::parse(id).expect("valid node id")
}

fn rejection_status(result: Result<Station, WsError>) -> (u16, serde_json::Value) {
    match result {
        Err(WsError::Http(response)) => {
            let body = response.body().clone().unwrap_or_default();
            let body = serde_json::from_slice(&body).expect("JSON body");
            (response.status().as_u16(), body)
        }
        Err(other) => panic!("unexpected error {other}"),
        Ok(_) => panic!("upgrade should have been rejected"),
    }
}

#[tokio::test]
async fn test_unsupported_subprotocol_is_rejected() {
    let (_gateway, addr) = start_gateway(GatewayBuilder::new(), GatewayConfig::local_network()).await;

    let options = StationOptions {
        subprotocols: vec!["ocpp1.2".to_string()],
        credentials: None,
    };
    let (status, body) = rejection_status(Station::try_connect(addr, "/ocpp/CS1", options).await);
    assert_eq!(status, 400);
    assert!(body["description"]["en"]
        .as_str()
        .expect("description")
        .contains("ocpp1.2"));
}

#[tokio::test]
async fn test_subprotocol_negotiation_prefers_server_order() {
    let (_gateway, addr) = start_gateway(GatewayBuilder::new(), GatewayConfig::local_network()).await;
    let options = StationOptions {
        subprotocols: vec!["ocpp1.6".to_string(), "ocpp2.0.1".to_string()],
        credentials: None,
    };
    let station = Station::try_connect(addr, "/ocpp/CS1", options)
        .await
        .expect("connect");
    assert_eq!(station.subprotocol.as_deref(), Some("ocpp2.0.1"));
}

#[tokio::test]
async fn test_basic_authentication() {
    let builder = GatewayBuilder::new().credential(node("CS1"), "secret");
    let config = GatewayConfig::local_network().with_authentication(true);
    let (gateway, addr) = start_gateway(builder, config).await;

    let wrong = StationOptions {
        credentials: Some(BasicCredentials::new("CS1", "guess")),
        ..StationOptions::default()
    };
    let (status, _) = rejection_status(Station::try_connect(addr, "/ocpp/CS1", wrong).await);
    assert_eq!(status, 401);

    let (status, _) =
        rejection_status(Station::try_connect(addr, "/ocpp/CS1", StationOptions::default()).await);
    assert_eq!(status, 401);

    let right = StationOptions {
        credentials: Some(BasicCredentials::new("CS1", "secret")),
        ..StationOptions::default()
    };
    let _station = Station::try_connect(addr, "/ocpp/CS1", right)
        .await
        .expect("authenticated");
    wait_until(|| gateway.connected_nodes().contains(&node("CS1"))).await;

    // Revoked credentials no longer authenticate.
    gateway.remove_credential(&node("CS1"));
    let again = StationOptions {
        credentials: Some(BasicCredentials::new("CS1", "secret")),
        ..StationOptions::default()
    };
    let (status, _) = rejection_status(Station::try_connect(addr, "/ocpp/CS1", again).await);
    assert_eq!(status, 401);
}

#[tokio::test]
async fn test_send_json_and_wait_roundtrip() {
    let (gateway, addr) = start_gateway(GatewayBuilder::new(), GatewayConfig::local_network()).await;
    let mut station = Station::connect(addr, "CS1").await;
    wait_until(|| gateway.connected_nodes().contains(&node("CS1"))).await;

    let caller = gateway.clone();
    let waiter = tokio::spawn(async move {
        caller
            .send_json_and_wait(&node("CS1"), "Reset", json!({"type": "Immediate"}), None)
            .await
    });

    let request = station.recv_json().await;
    assert_eq!(request[0], 2);
    assert_eq!(request[2], "Reset");
    assert_eq!(request[3], json!({"type": "Immediate"}));
    assert_eq!(request.as_array().map(Vec::len), Some(4));
    let id = request[1].clone();
    station.send_json(json!([3, id, {"status": "Accepted"}])).await;

    let reply = waiter.await.expect("task");
    assert_eq!(
        reply.outcome,
        RequestOutcome::Response(Payload::Json(json!({"status": "Accepted"})))
    );
    assert_eq!(gateway.pending_count(), 0);
}

#[tokio::test]
async fn test_send_binary_and_wait_roundtrip() {
    let (gateway, addr) = start_gateway(GatewayBuilder::new(), GatewayConfig::local_network()).await;
    let mut station = Station::connect(addr, "CS1").await;
    wait_until(|| gateway.connected_nodes().contains(&node("CS1"))).await;

    let caller = gateway.clone();
    let waiter = tokio::spawn(async move {
        caller
            .send_binary_and_wait(&node("CS1"), "DataTransfer", vec![1, 2, 3], None)
            .await
    });

    let frame = station.recv_binary().await;
    let Envelope::Request(request) = decode_binary(&frame, usize::MAX).expect("decode") else {
        panic!("expected request");
    };
    assert_eq!(request.action, "DataTransfer");
    assert_eq!(request.payload, Payload::Binary(vec![1, 2, 3]));

    let reply = Envelope::Response(ResponseEnvelope {
        request_id: request.request_id,
        payload: Payload::Binary(vec![9]),
    });
    let ocpp_gateway::Frame::Binary(bytes) = reply
        .encode(NetworkingMode::Standard, usize::MAX)
        .expect("encode")
    else {
        panic!("expected binary frame");
    };
    station.send_binary(bytes).await;

    let reply = waiter.await.expect("task");
    assert_eq!(reply.outcome, RequestOutcome::Response(Payload::Binary(vec![9])));
}

#[tokio::test]
async fn test_timeout_then_late_reply_is_dropped() {
    let (gateway, addr) = start_gateway(GatewayBuilder::new(), GatewayConfig::local_network()).await;
    let mut station = Station::connect(addr, "CS1").await;
    wait_until(|| gateway.connected_nodes().contains(&node("CS1"))).await;

    let timeout = Duration::from_millis(200);
    let started = tokio::time::Instant::now();
    let reply = gateway
        .send_json_and_wait(&node("CS1"), "Reset", json!({}), Some(timeout))
        .await;
    assert_eq!(reply.outcome, RequestOutcome::Timeout);
    assert!(started.elapsed() >= timeout);
    assert_eq!(gateway.pending_count(), 0);

    let request = station.recv_json().await;
    station.send_json(json!([3, request[1], {}])).await;

    // The connection stays usable after the late reply.
    let caller = gateway.clone();
    let waiter = tokio::spawn(async move {
        caller
            .send_json_and_wait(&node("CS1"), "Reset", json!({}), None)
            .await
    });
    let request = station.recv_json().await;
    station.send_json(json!([3, request[1], {"status": "Accepted"}])).await;
    assert!(waiter.await.expect("task").outcome.is_response());
}

#[tokio::test]
async fn test_unknown_client_does_not_wait() {
    let (gateway, _addr) = start_gateway(GatewayBuilder::new(), GatewayConfig::local_network()).await;
    let started = tokio::time::Instant::now();
    let reply = gateway
        .send_json_and_wait(&node("NOBODY"), "Reset", json!({}), Some(Duration::from_secs(30)))
        .await;
    assert_eq!(reply.outcome, RequestOutcome::UnknownClient);
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn test_duplicate_identity_evicts_first_connection() {
    let (gateway, addr) = start_gateway(GatewayBuilder::new(), GatewayConfig::local_network()).await;
    let mut first = Station::connect(addr, "CS1").await;
    wait_until(|| gateway.connection_info(&node("CS1")).is_some()).await;
    let first_id = gateway
        .connection_info(&node("CS1"))
        .expect("registered")
        .connection_id;

    let mut second = Station::connect(addr, "CS1").await;
    wait_until(|| {
        gateway
            .connection_info(&node("CS1"))
            .is_some_and(|info| info.connection_id != first_id)
    })
    .await;
    first.expect_closed().await;

    // Requests now go to the second connection, and the first one's close
    // did not remove the new registration.
    assert_eq!(
        gateway
            .send_json_request(&node("CS1"), "TriggerMessage", json!({}))
            .await,
        SendResult::Success
    );
    let request = second.recv_json().await;
    assert_eq!(request[2], "TriggerMessage");
    assert!(gateway.connected_nodes().contains(&node("CS1")));
}

#[tokio::test]
async fn test_inbound_requests_dispatch_to_handlers() {
    let builder = GatewayBuilder::new().handler(
        "Heartbeat",
        |ctx: RequestContext, _payload: Payload| async move {
            assert_eq!(ctx.node_id.as_str(), "CS1");
            Ok::<_, HandlerError>(Payload::Json(json!({"currentTime": "2024-01-01T00:00:00Z"})))
        },
    );
    let builder = builder.handler("Authorize", |_ctx: RequestContext, _payload: Payload| async move {
        Err::<Payload, _>(HandlerError::new(ErrorCode::SecurityError, "unknown token"))
    });
    let (gateway, addr) = start_gateway(builder, GatewayConfig::local_network()).await;
    let mut station = Station::connect(addr, "CS1").await;
    wait_until(|| gateway.connected_nodes().contains(&node("CS1"))).await;

    station.send_json(json!([2, "h1", "Heartbeat", {}])).await;
    let reply = station.recv_json().await;
    assert_eq!(reply, json!([3, "h1", {"currentTime": "2024-01-01T00:00:00Z"}]));

    station.send_json(json!([2, "a1", "Authorize", {"idToken": "x"}])).await;
    let reply = station.recv_json().await;
    assert_eq!(reply[0], 4);
    assert_eq!(reply[1], "a1");
    assert_eq!(reply[2], "SecurityError");
    assert_eq!(reply[3], "unknown token");

    station.send_json(json!([2, "u1", "MeterValues", {}])).await;
    let reply = station.recv_json().await;
    assert_eq!(reply[1], "u1");
    assert_eq!(reply[2], ErrorCode::NotImplemented.as_str());
}

#[tokio::test]
async fn test_malformed_frames_get_error_replies() {
    let (gateway, addr) = start_gateway(GatewayBuilder::new(), GatewayConfig::local_network()).await;
    let mut station = Station::connect(addr, "CS1").await;
    wait_until(|| gateway.connected_nodes().contains(&node("CS1"))).await;

    station.send_text("this is not json").await;
    let reply = station.recv_json().await;
    assert_eq!(reply[0], 4);
    assert_eq!(reply[1], RequestId::unknown().as_str());
    assert_eq!(reply[2], "InternalError");

    station.send_json(json!([2, "abc", 17, {}])).await;
    let reply = station.recv_json().await;
    assert_eq!(reply[1], "abc");
    assert_eq!(reply[2], "InternalError");

    // Still connected and registered.
    assert!(gateway.connected_nodes().contains(&node("CS1")));
    station.send_json(json!([2, "x1", "Heartbeat", {}])).await;
    let reply = station.recv_json().await;
    assert_eq!(reply[1], "x1");
}

#[tokio::test]
async fn test_hub_relays_for_routed_destination() {
    let (gateway, addr) = start_gateway(GatewayBuilder::new(), GatewayConfig::local_network()).await;
    let mut hub = Station::connect(addr, "HUB1").await;
    wait_until(|| gateway.connected_nodes().contains(&node("HUB1"))).await;

    gateway.add_static_route(node("CS9"), node("HUB1"));
    let sent = gateway
        .send_json_request(&node("CS9"), "GetVariables", json!({"getVariableData": []}))
        .await;
    assert_eq!(sent, SendResult::Success);

    let request = hub.recv_json().await;
    assert_eq!(request.as_array().map(Vec::len), Some(6));
    assert_eq!(request[2], "GetVariables");
    assert_eq!(request[4], "CS9");

    assert!(gateway.remove_static_route(&node("CS9"), &node("HUB1")));
    let sent = gateway
        .send_json_request(&node("CS9"), "GetVariables", json!({}))
        .await;
    assert_eq!(sent, SendResult::UnknownClient);
}

#[tokio::test]
async fn test_station_close_unregisters() {
    let (gateway, addr) = start_gateway(GatewayBuilder::new(), GatewayConfig::local_network()).await;
    let station = Station::connect(addr, "CS1").await;
    wait_until(|| gateway.connected_nodes().contains(&node("CS1"))).await;

    station.close().await;
    wait_until(|| gateway.connected_nodes().is_empty()).await;
    assert_eq!(
        gateway.send_json_request(&node("CS1"), "Reset", json!({})).await,
        SendResult::UnknownClient
    );
}

#[tokio::test]
async fn test_shutdown_closes_stations() {
    let (gateway, addr) = start_gateway(GatewayBuilder::new(), GatewayConfig::local_network()).await;
    let mut station = Station::connect(addr, "CS1").await;
    wait_until(|| gateway.connected_nodes().contains(&node("CS1"))).await;

    gateway.shutdown();
    station.expect_closed().await;
    wait_until(|| gateway.connected_nodes().is_empty()).await;
}

#[tokio::test]
async fn test_full_request_queue_gets_generic_error() {
    let started = Arc::new(Notify::new());
    let gate = Arc::new(Semaphore::new(0));
    let builder = {
        let started = Arc::clone(&started);
        let gate = Arc::clone(&gate);
        GatewayBuilder::new().handler("DataTransfer", move |ctx: RequestContext, _payload: Payload| {
            let started = Arc::clone(&started);
            let gate = Arc::clone(&gate);
            async move {
                started.notify_one();
                let _permit = gate.acquire().await;
                Ok::<_, HandlerError>(Payload::Json(json!({"handled": ctx.request_id.as_str()})))
            }
        })
    };
    let config = GatewayConfig::local_network().with_request_queue_capacity(1);
    let (gateway, addr) = start_gateway(builder, config).await;
    let mut station = Station::connect(addr, "CS1").await;
    wait_until(|| gateway.connected_nodes().contains(&node("CS1"))).await;

    // s1 occupies the worker, s2 fills the queue, s3 overflows it.
    station.send_json(json!([2, "s1", "DataTransfer", {}])).await;
    tokio::time::timeout(super::TEST_TIMEOUT, started.notified())
        .await
        .expect("handler started");
    station.send_json(json!([2, "s2", "DataTransfer", {}])).await;
    station.send_json(json!([2, "s3", "DataTransfer", {}])).await;

    let rejected = station.recv_json().await;
    assert_eq!(rejected[0], 4);
    assert_eq!(rejected[1], "s3");
    assert_eq!(rejected[2], "GenericError");

    gate.add_permits(2);
    let first = station.recv_json().await;
    let second = station.recv_json().await;
    assert_eq!(first, json!([3, "s1", {"handled": "s1"}]));
    assert_eq!(second, json!([3, "s2", {"handled": "s2"}]));
    assert!(gateway.connected_nodes().contains(&node("CS1")));
}

#[tokio::test]
async fn test_panicking_handler_gets_internal_error() {
    let builder = GatewayBuilder::new().handler(
        "Authorize",
        |_ctx: RequestContext, payload: Payload| async move {
            if payload.as_json().is_some() {
                panic!("handler failure");
            }
            Ok::<_, HandlerError>(payload)
        },
    );
    let (gateway, addr) = start_gateway(builder, GatewayConfig::local_network()).await;
    let mut station = Station::connect(addr, "CS1").await;
    wait_until(|| gateway.connected_nodes().contains(&node("CS1"))).await;

    station.send_json(json!([2, "p1", "Authorize", {}])).await;
    let reply = station.recv_json().await;
    assert_eq!(reply[0], 4);
    assert_eq!(reply[1], "p1");
    assert_eq!(reply[2], "InternalError");

    // The worker survives the panic.
    station.send_json(json!([2, "p2", "Heartbeat", {}])).await;
    let reply = station.recv_json().await;
    assert_eq!(reply[1], "p2");
    assert_eq!(reply[2], "NotImplemented");
    assert!(gateway.connected_nodes().contains(&node("CS1")));
}

#[tokio::test]
async fn test_silent_station_is_closed_as_unresponsive() {
    let reasons = Arc::new(Mutex::new(Vec::new()));
    let builder = {
        let reasons = Arc::clone(&reasons);
        GatewayBuilder::new().observer(move |event: &GatewayEvent| -> Result<(), ObserverError> {
            if let GatewayEvent::Disconnected { reason, .. } = event {
                reasons.lock().expect("lock").push(*reason);
            }
            Ok(())
        })
    };
    let config = GatewayConfig::local_network().with_ping_interval(Duration::from_millis(100));
    let (gateway, addr) = start_gateway(builder, config).await;

    // Never read, so pings go unanswered.
    let mut station = Station::connect(addr, "CS1").await;
    wait_until(|| {
        reasons
            .lock()
            .expect("lock")
            .contains(&CloseReason::Unresponsive)
    })
    .await;
    assert!(gateway.connected_nodes().is_empty());
    station.expect_closed().await;
}
