//! Transport layer implementations
//!
//! This module provides the abstract transport contract the bridge binds
//! to, the factory that builds transports from configuration, and concrete
//! implementations for the recognized kinds (STDIO and HTTP/SSE).

pub mod factory;
pub mod http;
pub mod stdio;
pub mod traits;

// Re-export commonly used types
pub use traits::{InboundEvent, Transport, TransportSource};

pub use factory::{
    DefaultTransportFactory, SseClientOptions, SseServerOptions, StdioClientOptions,
    TransportFactory, create_client_transport, create_server_transport,
};

pub use http::{SseClientTransport, SseServerTransport};
pub use stdio::{StdioClientTransport, StdioServerTransport};
