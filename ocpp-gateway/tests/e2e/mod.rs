//! Shared infrastructure for end-to-end tests.
//!
//! Provides a gateway bound to an ephemeral loopback port and a minimal
//! charging-station client speaking raw frames.

pub mod station;
pub mod tests;

use std::net::SocketAddr;
use std::time::Duration;

use ocpp_gateway::{Gateway, GatewayBuilder, GatewayConfig};
use tokio::net::TcpListener;

/// Upper bound for any single wait in these tests.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Build a gateway from `builder` with `config` and serve it on loopback.
pub async fn start_gateway(builder: GatewayBuilder, config: GatewayConfig) -> (Gateway, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind loopback listener");
    let addr = listener.local_addr().expect("local addr");
    let gateway = builder.config(config.with_listen_addr(addr)).build();
    let server = gateway.clone();
    tokio::spawn(async move {
        server.serve(listener).await.expect("serve");
    });
    (gateway, addr)
}

/// Poll `condition` until it holds or [`TEST_TIMEOUT`] elapses.
pub async fn wait_until<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(TEST_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
