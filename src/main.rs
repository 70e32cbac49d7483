//! rpcwire - schema-driven binary RPC server
//!
//! Serves an echo handler over the configured protocol. Every message the
//! protocol defines is answered with its own request payload.

use async_trait::async_trait;
use rpcwire_protocol::{JsonProtocol, Protocol, Request};
use rpcwire_server::{Config, Handler, ResponseWriter, Server};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Protocol served when no protocol file is configured.
const ECHO_PROTOCOL: &str = r#"{
    "protocol": "Echo",
    "namespace": "rpcwire",
    "messages": {
        "echo": {
            "request": [{"name": "message", "type": "string"}],
            "response": "string"
        }
    }
}"#;

struct EchoHandler;

#[async_trait]
impl Handler for EchoHandler {
    async fn serve(&self, w: &mut ResponseWriter, mut req: Request) {
        for (key, value) in req.metadata.iter() {
            w.set_metadata(key, value.clone());
        }
        if let Some(body) = req.body.take() {
            w.write(&body);
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if RPCWIRE_CONFIG is set, then env overrides)
    let config = match Config::load() {
        Ok(c) => {
            if let Ok(path) = std::env::var("RPCWIRE_CONFIG") {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            // If a config file was explicitly specified, fail on error
            if std::env::var("RPCWIRE_CONFIG").is_ok() {
                tracing::error!("Failed to load config: {}", e);
                return Err(e.into());
            }
            tracing::info!("Using default configuration");
            Config::default()
        }
    };

    let protocol_text = match config.protocol.read()? {
        Some(text) => text,
        None => ECHO_PROTOCOL.to_string(),
    };
    let protocol = Arc::new(JsonProtocol::parse(&protocol_text)?);

    tracing::info!("Starting rpcwire server");
    tracing::info!("  Bind address: {}", config.network.bind_addr);
    tracing::info!("  Protocol: {} ({})", protocol.name(), protocol.hash());
    tracing::info!(
        "  Messages: {}",
        protocol.message_names().collect::<Vec<_>>().join(", ")
    );

    let server = Arc::new(Server::new(
        config.server_config(),
        protocol,
        Arc::new(EchoHandler),
    ));

    // Spawn shutdown signal handler
    let shutdown_server = server.clone();
    let shutdown_timeout = config.shutdown.timeout();
    let shutdown = tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping server...");
        if let Err(e) = shutdown_server.shutdown(shutdown_timeout).await {
            tracing::warn!("Graceful shutdown incomplete: {}", e);
            shutdown_server.close();
        }
    });

    // Run server (returns once shutdown has begun)
    match server.listen_and_serve().await {
        Ok(()) | Err(rpcwire_server::ServerError::ShuttingDown) => {}
        Err(e) => {
            tracing::error!("Server error: {}", e);
            return Err(e.into());
        }
    }

    // Wait for connections to drain
    let _ = shutdown.await;

    tracing::info!("Server stopped");
    Ok(())
}
