//! Transport layer traits and abstractions
//!
//! Module defines the transport contract the bridge binds to. Both the
//! server-side and the client-side of a bridge are described by the same
//! capability set: an inbound frame stream, an outbound send operation,
//! idempotent close, and a one-shot closed signal.

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use crate::core::error::{BridgeError, BridgeResult};

/// Which side of the bridge an event came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportSource {
    /// The server-side transport (where the MCP server is reached)
    Server,
    /// The client-side transport (where the MCP client is reached)
    Client,
}

impl std::fmt::Display for TransportSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportSource::Server => write!(f, "server"),
            TransportSource::Client => write!(f, "client"),
        }
    }
}

/// One item of a transport's inbound sequence
///
/// Stream errors are emitted as events rather than terminating the
/// sequence; the sequence only ends when the transport closes.
#[derive(Debug, Clone)]
pub enum InboundEvent {
    /// One received JSON-RPC frame, passed through verbatim
    Message(String),
    /// An error observed on the underlying stream
    Error(BridgeError),
}

/// Buffered capacity of the inbound broadcast channel.
///
/// Subscribers that fall further behind than this observe a lag event and
/// lose frames, which the bridge surfaces as a transport I/O error.
pub const INBOUND_CHANNEL_CAPACITY: usize = 1024;

/// Bidirectional message channel carrying newline-delimited JSON-RPC frames
///
/// The bridge treats transports as opaque beyond these four operations and
/// never inspects frame content. Implementations signal remote disconnection
/// by cancelling their closed token, which ends `inbound()` and resolves
/// every `closed()` future.
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Subscribe to the inbound frame sequence
    ///
    /// The sequence is broadcast-able: every subscriber observes frames
    /// emitted after it subscribed. It terminates when the transport
    /// closes.
    fn inbound(&self) -> broadcast::Receiver<InboundEvent>;

    /// Enqueue one outbound frame
    ///
    /// Fails with [`BridgeError::TransportClosed`] when invoked after
    /// close; any other failure is kind-specific and forwarded verbatim
    /// to the bridge's error callback.
    async fn send(&self, message: &str) -> BridgeResult<()>;

    /// Close the transport
    ///
    /// Idempotent. Releases underlying resources, ends `inbound()` and
    /// resolves `closed()`.
    async fn close(&self) -> BridgeResult<()>;

    /// One-shot future resolving when the transport enters the closed
    /// state, by local `close()` or by remote disconnection
    ///
    /// May be requested any number of times; every future resolves.
    fn closed(&self) -> WaitForCancellationFutureOwned;

    /// Human-readable description for logs
    fn describe(&self) -> String;
}

/// Shared plumbing for transport implementations: the inbound broadcast
/// sender paired with the closed token.
#[derive(Debug, Clone)]
pub(crate) struct TransportChannels {
    pub(crate) inbound_tx: broadcast::Sender<InboundEvent>,
    pub(crate) closed: CancellationToken,
}

impl TransportChannels {
    pub(crate) fn new() -> Self {
        let (inbound_tx, _) = broadcast::channel(INBOUND_CHANNEL_CAPACITY);
        Self {
            inbound_tx,
            closed: CancellationToken::new(),
        }
    }

    /// Publish one inbound event, ignoring the no-subscriber case.
    pub(crate) fn publish(&self, event: InboundEvent) {
        let _ = self.inbound_tx.send(event);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Mark the transport closed. Idempotent.
    pub(crate) fn mark_closed(&self) {
        self.closed.cancel();
    }
}
