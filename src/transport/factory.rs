//! Transport factory
//!
//! Module projects the opaque per-kind configuration maps carried by a
//! [`BridgeConfig`](crate::bridge::BridgeConfig) into strongly-typed option
//! records and dispatches on the transport kind to build ready transport
//! instances, one flavor per side of the bridge.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::bridge::config::TransportKind;
use crate::core::error::{BridgeError, BridgeResult};
use crate::transport::http::{SseClientTransport, SseServerTransport};
use crate::transport::stdio::{StdioClientTransport, StdioServerTransport};
use crate::transport::traits::Transport;

/// Options for the `sse` server transport
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SseServerOptions {
    /// TCP port to bind
    pub port: u16,
    /// Path serving the SSE event stream
    pub endpoint: String,
    /// Path accepting posted client messages
    pub messages_endpoint: String,
    /// Ports tried in order when `port` cannot be bound
    pub fallback_ports: Vec<u16>,
    /// When set, incoming connections must carry a matching bearer token
    pub auth_token: Option<String>,
}

impl Default for SseServerOptions {
    fn default() -> Self {
        Self {
            port: 8080,
            endpoint: "/sse".to_string(),
            messages_endpoint: "/messages".to_string(),
            fallback_ports: Vec::new(),
            auth_token: None,
        }
    }
}

/// Options for the `stdio` client transport (spawned child process)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StdioClientOptions {
    /// Executable to spawn
    pub command: String,
    /// Arguments passed to the executable
    #[serde(default)]
    pub arguments: Vec<String>,
    /// Working directory for the child
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
    /// Extra environment variables for the child
    #[serde(default)]
    pub environment: HashMap<String, String>,
}

/// Options for the `sse` client transport (outbound HTTP stream)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SseClientOptions {
    /// URL of the SSE event stream to connect to
    pub server_url: String,
    /// Extra request headers, typically `Authorization: Bearer <token>`
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

fn project_options<T: serde::de::DeserializeOwned>(
    kind: TransportKind,
    config: &Map<String, Value>,
) -> BridgeResult<T> {
    serde_json::from_value(Value::Object(config.clone()))
        .map_err(|e| BridgeError::invalid_config(format!("{kind} transport config: {e}")))
}

/// Build a ready server-side transport for `kind`
///
/// `stdio` binds the current process's standard streams and takes no
/// options; `sse` starts an HTTP server per [`SseServerOptions`].
pub async fn create_server_transport(
    kind: TransportKind,
    config: &Map<String, Value>,
) -> BridgeResult<Arc<dyn Transport>> {
    match kind {
        TransportKind::Stdio => {
            let transport = StdioServerTransport::new();
            Ok(Arc::new(transport))
        }
        TransportKind::Sse => {
            let options: SseServerOptions = project_options(kind, config)?;
            let transport = SseServerTransport::bind(options).await?;
            Ok(Arc::new(transport))
        }
    }
}

/// Build a ready client-side transport for `kind`
///
/// `stdio` spawns a child process per [`StdioClientOptions`]; `sse` opens
/// an outbound HTTP stream per [`SseClientOptions`].
pub async fn create_client_transport(
    kind: TransportKind,
    config: &Map<String, Value>,
) -> BridgeResult<Arc<dyn Transport>> {
    match kind {
        TransportKind::Stdio => {
            let options: StdioClientOptions = project_options(kind, config)?;
            let transport = StdioClientTransport::spawn(options)?;
            Ok(Arc::new(transport))
        }
        TransportKind::Sse => {
            let options: SseClientOptions = project_options(kind, config)?;
            let transport = SseClientTransport::connect(options).await?;
            Ok(Arc::new(transport))
        }
    }
}

/// Factory seam the bridge creates its transports through
///
/// The default implementation dispatches to the concrete kinds. Embedders
/// and tests can install their own factory to supply in-memory or custom
/// transports without touching the lifecycle engine.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Build a server-side transport
    async fn create_server(
        &self,
        kind: TransportKind,
        config: &Map<String, Value>,
    ) -> BridgeResult<Arc<dyn Transport>>;

    /// Build a client-side transport
    async fn create_client(
        &self,
        kind: TransportKind,
        config: &Map<String, Value>,
    ) -> BridgeResult<Arc<dyn Transport>>;
}

/// The concrete factory covering the recognized kinds
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultTransportFactory;

#[async_trait]
impl TransportFactory for DefaultTransportFactory {
    async fn create_server(
        &self,
        kind: TransportKind,
        config: &Map<String, Value>,
    ) -> BridgeResult<Arc<dyn Transport>> {
        create_server_transport(kind, config).await
    }

    async fn create_client(
        &self,
        kind: TransportKind,
        config: &Map<String, Value>,
    ) -> BridgeResult<Arc<dyn Transport>> {
        create_client_transport(kind, config).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_sse_server_options_defaults() {
        let options: SseServerOptions = project_options(TransportKind::Sse, &Map::new()).unwrap();
        assert_eq!(options.port, 8080);
        assert_eq!(options.endpoint, "/sse");
        assert_eq!(options.messages_endpoint, "/messages");
        assert!(options.fallback_ports.is_empty());
        assert!(options.auth_token.is_none());
    }

    #[test]
    fn test_sse_server_options_projection() {
        let config = map(json!({
            "port": 9090,
            "endpoint": "/events",
            "messagesEndpoint": "/inbox",
            "fallbackPorts": [9091, 9092],
            "authToken": "s3cret"
        }));
        let options: SseServerOptions = project_options(TransportKind::Sse, &config).unwrap();
        assert_eq!(options.port, 9090);
        assert_eq!(options.endpoint, "/events");
        assert_eq!(options.messages_endpoint, "/inbox");
        assert_eq!(options.fallback_ports, vec![9091, 9092]);
        assert_eq!(options.auth_token.as_deref(), Some("s3cret"));
    }

    #[test]
    fn test_stdio_client_requires_command() {
        let err =
            project_options::<StdioClientOptions>(TransportKind::Stdio, &Map::new()).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidConfig(_)));
        assert!(err.to_string().contains("command"));
    }

    #[test]
    fn test_stdio_client_options_projection() {
        let config = map(json!({
            "command": "mcp-server",
            "arguments": ["--port", "0"],
            "workingDirectory": "/tmp",
            "environment": { "RUST_LOG": "debug" }
        }));
        let options: StdioClientOptions = project_options(TransportKind::Stdio, &config).unwrap();
        assert_eq!(options.command, "mcp-server");
        assert_eq!(options.arguments, vec!["--port", "0"]);
        assert_eq!(options.working_directory.as_deref(), Some(std::path::Path::new("/tmp")));
        assert_eq!(options.environment.get("RUST_LOG").map(String::as_str), Some("debug"));
    }

    #[test]
    fn test_sse_client_requires_server_url() {
        let err =
            project_options::<SseClientOptions>(TransportKind::Sse, &Map::new()).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidConfig(_)));
        assert!(err.to_string().contains("serverUrl"));
    }

    #[tokio::test]
    async fn test_create_client_invalid_config_surfaces() {
        let result = create_client_transport(TransportKind::Stdio, &Map::new()).await;
        assert!(matches!(result.unwrap_err(), BridgeError::InvalidConfig(_)));
    }
}
