//! Bridge configuration
//!
//! Module defines the immutable [`BridgeConfig`] value, the transport kind
//! tags and the server-shutdown policy, together with their JSON mapping:
//!
//! ```json
//! {
//!   "serverTransportType": "stdio",
//!   "clientTransportType": "sse",
//!   "serverShutdownBehavior": "shutdownBridge",
//!   "serverConfig": {},
//!   "clientConfig": { "serverUrl": "http://localhost:8080/sse" }
//! }
//! ```
//!
//! Unknown top-level fields are ignored, missing config maps default to
//! empty, and both enums match case-insensitively on load.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::str::FromStr;

use crate::core::error::{BridgeError, BridgeResult};

/// Recognized transport kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Line-delimited standard I/O (current process or child process)
    Stdio,
    /// HTTP Server-Sent Events plus message POST
    Sse,
}

impl TransportKind {
    /// The canonical lowercase tag used on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Stdio => "stdio",
            TransportKind::Sse => "sse",
        }
    }
}

impl FromStr for TransportKind {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stdio" => Ok(TransportKind::Stdio),
            "sse" => Ok(TransportKind::Sse),
            other => Err(BridgeError::unsupported_transport(other)),
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rule deciding what happens when the server-side transport closes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShutdownPolicy {
    /// Tear the whole bridge down
    #[default]
    ShutdownBridge,
    /// Close the client side and wait for a new server transport
    WaitForReconnection,
}

impl ShutdownPolicy {
    /// The textual name used in the JSON shape
    pub fn as_str(&self) -> &'static str {
        match self {
            ShutdownPolicy::ShutdownBridge => "shutdownBridge",
            ShutdownPolicy::WaitForReconnection => "waitForReconnection",
        }
    }
}

impl FromStr for ShutdownPolicy {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "shutdownbridge" => Ok(ShutdownPolicy::ShutdownBridge),
            "waitforreconnection" => Ok(ShutdownPolicy::WaitForReconnection),
            other => Err(BridgeError::invalid_config(format!(
                "unknown server shutdown behavior: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for ShutdownPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for TransportKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for TransportKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let tag = String::deserialize(deserializer)?;
        tag.parse().map_err(D::Error::custom)
    }
}

impl Serialize for ShutdownPolicy {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ShutdownPolicy {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let tag = String::deserialize(deserializer)?;
        tag.parse().map_err(D::Error::custom)
    }
}

/// Immutable bridge configuration
///
/// Holds the transport kind for each side, the opaque per-kind config maps
/// handed to the transport factory, and the *effective* server-shutdown
/// policy. A `stdio` server is a child of the connected client whose exit
/// cannot be waited through, so for that kind the policy is forced to
/// [`ShutdownPolicy::ShutdownBridge`] at construction time; the requested
/// value is not retained.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeConfig {
    #[serde(rename = "serverTransportType")]
    server_kind: TransportKind,
    #[serde(rename = "clientTransportType")]
    client_kind: TransportKind,
    #[serde(rename = "serverShutdownBehavior")]
    server_shutdown_policy: ShutdownPolicy,
    server_config: Map<String, Value>,
    client_config: Map<String, Value>,
}

/// Raw deserialization shadow of [`BridgeConfig`], before the policy
/// invariant is applied.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawBridgeConfig {
    server_transport_type: TransportKind,
    client_transport_type: TransportKind,
    #[serde(default)]
    server_shutdown_behavior: ShutdownPolicy,
    #[serde(default)]
    server_config: Map<String, Value>,
    #[serde(default)]
    client_config: Map<String, Value>,
}

impl<'de> Deserialize<'de> for BridgeConfig {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = RawBridgeConfig::deserialize(deserializer)?;
        Ok(BridgeConfig::with_kinds(
            raw.server_transport_type,
            raw.client_transport_type,
            raw.server_config,
            raw.client_config,
            raw.server_shutdown_behavior,
        ))
    }
}

impl BridgeConfig {
    /// Create a config from kind tags
    ///
    /// Tags are matched case-insensitively; an unrecognized tag fails with
    /// [`BridgeError::UnsupportedTransport`].
    pub fn new(
        server_kind: &str,
        client_kind: &str,
        server_config: Map<String, Value>,
        client_config: Map<String, Value>,
        server_shutdown_policy: ShutdownPolicy,
    ) -> BridgeResult<Self> {
        Ok(Self::with_kinds(
            server_kind.parse()?,
            client_kind.parse()?,
            server_config,
            client_config,
            server_shutdown_policy,
        ))
    }

    /// Create a config from already-parsed kinds
    pub fn with_kinds(
        server_kind: TransportKind,
        client_kind: TransportKind,
        server_config: Map<String, Value>,
        client_config: Map<String, Value>,
        server_shutdown_policy: ShutdownPolicy,
    ) -> Self {
        let effective_policy = if server_kind == TransportKind::Stdio {
            if server_shutdown_policy == ShutdownPolicy::WaitForReconnection {
                tracing::warn!(
                    "stdio server transport cannot wait for reconnection, \
                     forcing shutdownBridge behavior"
                );
            }
            ShutdownPolicy::ShutdownBridge
        } else {
            server_shutdown_policy
        };

        Self {
            server_kind,
            client_kind,
            server_shutdown_policy: effective_policy,
            server_config,
            client_config,
        }
    }

    /// Load a config from its JSON mapping
    pub fn from_json(value: Value) -> BridgeResult<Self> {
        serde_json::from_value(value)
            .map_err(|e| BridgeError::invalid_config(format!("bridge config: {e}")))
    }

    /// Serialize the config back to its JSON mapping
    pub fn to_json(&self) -> Value {
        // Serialization of a plain struct over JSON values cannot fail.
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Server-side transport kind
    pub fn server_kind(&self) -> TransportKind {
        self.server_kind
    }

    /// Client-side transport kind
    pub fn client_kind(&self) -> TransportKind {
        self.client_kind
    }

    /// The effective server-shutdown policy
    pub fn server_shutdown_policy(&self) -> ShutdownPolicy {
        self.server_shutdown_policy
    }

    /// Opaque server transport options, passed through to the factory
    pub fn server_config(&self) -> &Map<String, Value> {
        &self.server_config
    }

    /// Opaque client transport options, passed through to the factory
    pub fn client_config(&self) -> &Map<String, Value> {
        &self.client_config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_kind_parsing_case_insensitive() {
        assert_eq!("stdio".parse::<TransportKind>().unwrap(), TransportKind::Stdio);
        assert_eq!("STDIO".parse::<TransportKind>().unwrap(), TransportKind::Stdio);
        assert_eq!("Sse".parse::<TransportKind>().unwrap(), TransportKind::Sse);

        let err = "grpc".parse::<TransportKind>().unwrap_err();
        assert!(matches!(err, BridgeError::UnsupportedTransport(_)));
    }

    #[test]
    fn test_policy_parsing_case_insensitive() {
        assert_eq!(
            "shutdownBridge".parse::<ShutdownPolicy>().unwrap(),
            ShutdownPolicy::ShutdownBridge
        );
        assert_eq!(
            "WAITFORRECONNECTION".parse::<ShutdownPolicy>().unwrap(),
            ShutdownPolicy::WaitForReconnection
        );
        assert!("sometimes".parse::<ShutdownPolicy>().is_err());
    }

    #[test]
    fn test_stdio_server_forces_shutdown_policy() {
        let config = BridgeConfig::new(
            "stdio",
            "sse",
            Map::new(),
            Map::new(),
            ShutdownPolicy::WaitForReconnection,
        )
        .unwrap();
        assert_eq!(config.server_shutdown_policy(), ShutdownPolicy::ShutdownBridge);
    }

    #[test]
    fn test_sse_server_keeps_requested_policy() {
        let config = BridgeConfig::new(
            "sse",
            "stdio",
            Map::new(),
            Map::new(),
            ShutdownPolicy::WaitForReconnection,
        )
        .unwrap();
        assert_eq!(
            config.server_shutdown_policy(),
            ShutdownPolicy::WaitForReconnection
        );
    }

    #[test]
    fn test_json_round_trip() {
        let original = BridgeConfig::new(
            "sse",
            "stdio",
            json!({ "port": 9000, "authToken": "s3cret" })
                .as_object()
                .unwrap()
                .clone(),
            json!({ "command": "mcp-server", "arguments": ["--verbose"] })
                .as_object()
                .unwrap()
                .clone(),
            ShutdownPolicy::WaitForReconnection,
        )
        .unwrap();

        let reloaded = BridgeConfig::from_json(original.to_json()).unwrap();
        assert_eq!(reloaded.server_kind(), TransportKind::Sse);
        assert_eq!(reloaded.client_kind(), TransportKind::Stdio);
        assert_eq!(
            reloaded.server_shutdown_policy(),
            ShutdownPolicy::WaitForReconnection
        );
        assert_eq!(reloaded.server_config(), original.server_config());
        assert_eq!(reloaded.client_config(), original.client_config());
    }

    #[test]
    fn test_json_defaults_and_unknown_fields() {
        let config = BridgeConfig::from_json(json!({
            "serverTransportType": "SSE",
            "clientTransportType": "stdio",
            "futureKnob": true
        }))
        .unwrap();

        assert_eq!(config.server_kind(), TransportKind::Sse);
        assert_eq!(config.server_shutdown_policy(), ShutdownPolicy::ShutdownBridge);
        assert!(config.server_config().is_empty());
        assert!(config.client_config().is_empty());
    }

    #[test]
    fn test_json_policy_case_insensitive() {
        let config = BridgeConfig::from_json(json!({
            "serverTransportType": "sse",
            "clientTransportType": "stdio",
            "serverShutdownBehavior": "waitforreconnection"
        }))
        .unwrap();
        assert_eq!(
            config.server_shutdown_policy(),
            ShutdownPolicy::WaitForReconnection
        );
    }

    #[test]
    fn test_json_stdio_server_forces_policy() {
        let config = BridgeConfig::from_json(json!({
            "serverTransportType": "stdio",
            "clientTransportType": "sse",
            "serverShutdownBehavior": "waitForReconnection"
        }))
        .unwrap();
        assert_eq!(config.server_shutdown_policy(), ShutdownPolicy::ShutdownBridge);
    }

    #[test]
    fn test_json_unknown_kind_rejected() {
        let err = BridgeConfig::from_json(json!({
            "serverTransportType": "carrier-pigeon",
            "clientTransportType": "stdio"
        }))
        .unwrap_err();
        assert!(matches!(err, BridgeError::InvalidConfig(_)));
        assert!(err.to_string().contains("carrier-pigeon"));
    }
}
