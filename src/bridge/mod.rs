//! The bridge engine: configuration, message pump, and lifecycle control

pub mod config;
pub mod mcp_bridge;
mod pump;

pub use config::{BridgeConfig, ShutdownPolicy, TransportKind};
pub use mcp_bridge::{
    McpBridge, ServerReconnectHook, TransportClosedCallback, TransportErrorCallback,
    TransportReconnectedCallback,
};
