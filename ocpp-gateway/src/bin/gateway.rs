//! Standalone OCPP gateway.
//!
//! Runs the transport core with no action handlers registered; every
//! inbound request is answered with `NotImplemented`. Useful for connection
//! and routing tests against real stations.

use std::net::SocketAddr;
use std::process;
use std::time::Duration;

use clap::Parser;
use ocpp_gateway::{GatewayBuilder, GatewayConfig, GatewayEvent, NodeId, ObserverError};
use tracing_subscriber::EnvFilter;

/// OCPP central-system gateway.
#[derive(Debug, Parser)]
#[command(name = "ocpp-gateway", version, about)]
struct Args {
    /// Address to listen on.
    #[arg(long, env = "OCPP_GATEWAY_LISTEN", default_value = "0.0.0.0:9920")]
    listen: SocketAddr,

    /// Supported subprotocols, in preference order.
    #[arg(
        long = "subprotocol",
        env = "OCPP_GATEWAY_SUBPROTOCOLS",
        value_delimiter = ',',
        default_values_t = ["ocpp2.1".to_string(), "ocpp2.0.1".to_string(), "ocpp1.6".to_string()]
    )]
    subprotocols: Vec<String>,

    /// Require HTTP Basic authentication.
    #[arg(long, env = "OCPP_GATEWAY_REQUIRE_AUTH")]
    require_auth: bool,

    /// Node credential as ID:PASSWORD. Repeatable.
    #[arg(long = "credential", value_parser = parse_credential)]
    credentials: Vec<(NodeId, String)>,

    /// Static route as DESTINATION=HUB. Repeatable.
    #[arg(long = "route", value_parser = parse_route)]
    routes: Vec<(NodeId, NodeId)>,

    /// Default timeout for correlated requests, in seconds.
    #[arg(long, env = "OCPP_GATEWAY_REQUEST_TIMEOUT", default_value_t = 30)]
    request_timeout_secs: u64,

    /// WebSocket ping interval in seconds; 0 disables pings.
    #[arg(long, env = "OCPP_GATEWAY_PING_INTERVAL", default_value_t = 30)]
    ping_interval_secs: u64,

    /// Maximum frame size in bytes.
    #[arg(long, env = "OCPP_GATEWAY_MAX_FRAME_SIZE", default_value_t = ocpp_gateway::config::DEFAULT_MAX_FRAME_SIZE)]
    max_frame_size: usize,
}

fn parse_credential(s: &str) -> Result<(NodeId, String), String> {
    let (id, password) = s
        .split_once(':')
        .ok_or_else(|| "expected ID:PASSWORD".to_string())?;
    let id = NodeId::parse(id).map_err(|e| e.to_string())?;
    Ok((id, password.to_string()))
}

fn parse_route(s: &str) -> Result<(NodeId, NodeId), String> {
    let (destination, hub) = s
        .split_once('=')
        .ok_or_else(|| "expected DESTINATION=HUB".to_string())?;
    let destination = NodeId::parse(destination).map_err(|e| e.to_string())?;
    let hub = NodeId::parse(hub).map_err(|e| e.to_string())?;
    Ok((destination, hub))
}

impl Args {
    fn config(&self) -> GatewayConfig {
        GatewayConfig::default()
            .with_listen_addr(self.listen)
            .with_subprotocols(self.subprotocols.iter().cloned())
            .with_authentication(self.require_auth)
            .with_request_timeout(Duration::from_secs(self.request_timeout_secs))
            .with_ping_interval(Duration::from_secs(self.ping_interval_secs))
            .with_max_frame_size(self.max_frame_size)
    }
}

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    let mut builder = GatewayBuilder::new()
        .config(args.config())
        .observer(|event: &GatewayEvent| -> Result<(), ObserverError> {
            tracing::debug!(?event, "gateway event");
            Ok(())
        });
    for (id, password) in args.credentials {
        builder = builder.credential(id, password);
    }
    for (destination, hub) in args.routes {
        builder = builder.route(destination, hub);
    }
    let gateway = builder.build();

    let mut server = tokio::spawn(gateway.clone().run());
    let result = tokio::select! {
        result = &mut server => result,
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
            }
            tracing::info!("shutting down");
            gateway.shutdown();
            server.await
        }
    };

    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::error!(error = %e, "gateway failed");
            process::exit(1);
        }
        Err(e) => {
            tracing::error!(error = %e, "gateway task panicked");
            process::exit(1);
        }
    }
}
