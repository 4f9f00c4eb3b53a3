// Copyright (c) 2025 MCP Bridge Contributors
// SPDX-License-Identifier: MIT

//! # MCP Transport Bridge
//!
//! A transport bridge for the [Model Context Protocol (MCP)](https://modelcontextprotocol.io/):
//! connects an MCP client and an MCP server that speak different underlying
//! transports (line-delimited STDIO, HTTP Server-Sent Events), forwarding
//! JSON-RPC frames between them full-duplex while coordinating connection
//! lifecycle, reconnection, and shutdown.
//!
//! The bridge is payload-opaque: frames pass through verbatim and are never
//! parsed or validated.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mcp_bridge_rs::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> BridgeResult<()> {
//!     // Expose a local MCP server process over HTTP/SSE.
//!     let bridge = McpBridge::sse_server_to_stdio_client(
//!         SseServerOptions { port: 8080, ..Default::default() },
//!         StdioClientOptions {
//!             command: "my-mcp-server".to_string(),
//!             arguments: vec!["--verbose".to_string()],
//!             working_directory: None,
//!             environment: Default::default(),
//!         },
//!         ShutdownPolicy::WaitForReconnection,
//!     )?;
//!
//!     bridge.on_transport_closed(|source| {
//!         eprintln!("{source} transport closed");
//!     });
//!
//!     bridge.initialize().await?;
//!     tokio::signal::ctrl_c().await.ok();
//!     bridge.shutdown().await
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`core`]: error types shared across the crate
//! - [`transport`]: the transport contract, factory, and the STDIO and
//!   HTTP/SSE implementations
//! - [`bridge`]: the bridge engine — configuration, message pump, and
//!   lifecycle controller

pub mod bridge;
pub mod core;
pub mod transport;

// Re-export commonly used types for convenience
pub use bridge::{BridgeConfig, McpBridge, ShutdownPolicy, TransportKind};
pub use core::error::{BridgeError, BridgeResult};
pub use transport::{InboundEvent, Transport, TransportSource};

/// Prelude module for convenient imports
///
/// Use `use mcp_bridge_rs::prelude::*;` to import everything you need.
pub mod prelude {
    pub use crate::bridge::{
        BridgeConfig, McpBridge, ShutdownPolicy, TransportKind,
    };
    pub use crate::core::error::{BridgeError, BridgeResult};
    pub use crate::transport::{
        DefaultTransportFactory, InboundEvent, SseClientOptions, SseClientTransport,
        SseServerOptions, SseServerTransport, StdioClientOptions, StdioClientTransport,
        StdioServerTransport, Transport, TransportFactory, TransportSource,
    };
}
