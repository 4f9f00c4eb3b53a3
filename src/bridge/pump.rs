//! Message pump
//!
//! Module implements the subscription set installed against a transport
//! pair: two forwarder tasks (server→client and client→server) and two
//! close watchers, all tied to one cancellation token so the set can be
//! cancelled atomically before a replacement pair is installed.

use futures::future::BoxFuture;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::error::BridgeError;
use crate::transport::traits::{InboundEvent, Transport, TransportSource};

/// Invoked with the side an error belongs to; reads the application's
/// current callback slot at call time.
pub(crate) type ErrorHook = Arc<dyn Fn(TransportSource, BridgeError) + Send + Sync>;

/// Invoked once when a watched transport closes.
pub(crate) type ClosedHook = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Lifecycle hand-offs out of the pump tasks
pub(crate) struct PumpHooks {
    pub(crate) error: ErrorHook,
    pub(crate) server_closed: ClosedHook,
    pub(crate) client_closed: ClosedHook,
}

/// The live subscriptions against the current transport pair
///
/// Cancellation is cooperative: forwarders observe the token on the
/// current or next pulled frame, watchers on their pending select. A
/// watcher that already fired keeps running its lifecycle hand-off to
/// completion; only un-fired subscriptions are torn down.
pub(crate) struct SubscriptionSet {
    token: CancellationToken,
    #[allow(dead_code)]
    tasks: Vec<JoinHandle<()>>,
}

impl SubscriptionSet {
    /// Install forwarders and close watchers against a transport pair
    pub(crate) fn install(
        server: &Arc<dyn Transport>,
        client: &Arc<dyn Transport>,
        hooks: PumpHooks,
    ) -> Self {
        let token = CancellationToken::new();
        let mut tasks = Vec::with_capacity(4);

        tasks.push(tokio::spawn(forward(
            TransportSource::Server,
            server.inbound(),
            TransportSource::Client,
            Arc::clone(client),
            hooks.error.clone(),
            token.clone(),
        )));
        tasks.push(tokio::spawn(forward(
            TransportSource::Client,
            client.inbound(),
            TransportSource::Server,
            Arc::clone(server),
            hooks.error,
            token.clone(),
        )));
        tasks.push(tokio::spawn(watch_close(
            TransportSource::Server,
            Arc::clone(server),
            hooks.server_closed,
            token.clone(),
        )));
        tasks.push(tokio::spawn(watch_close(
            TransportSource::Client,
            Arc::clone(client),
            hooks.client_closed,
            token.clone(),
        )));

        Self { token, tasks }
    }

    /// Cancel every subscription in the set
    pub(crate) fn cancel(&self) {
        self.token.cancel();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.tasks.len()
    }
}

impl Drop for SubscriptionSet {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Forward frames from `source`'s inbound stream into `sink`
///
/// Stream errors are surfaced and consumption continues; send failures
/// are surfaced and the frame is dropped. The bridge is payload-opaque,
/// so there is no retry and no buffering.
async fn forward(
    source: TransportSource,
    mut inbound: broadcast::Receiver<InboundEvent>,
    sink_source: TransportSource,
    sink: Arc<dyn Transport>,
    error_hook: ErrorHook,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                tracing::debug!("{source}->{sink_source} forwarder cancelled");
                break;
            }
            event = inbound.recv() => match event {
                Ok(InboundEvent::Message(frame)) => {
                    tracing::trace!("forwarding {source}->{sink_source}: {frame}");
                    if let Err(e) = sink.send(&frame).await {
                        tracing::warn!("{sink_source} send failed, frame dropped: {e}");
                        (error_hook)(sink_source, e);
                    }
                }
                Ok(InboundEvent::Error(e)) => {
                    tracing::warn!("{source} inbound stream error: {e}");
                    (error_hook)(source, e);
                }
                Err(broadcast::error::RecvError::Lagged(lost)) => {
                    (error_hook)(
                        source,
                        BridgeError::transport_io(format!(
                            "{lost} inbound frames lost to a lagging forwarder"
                        )),
                    );
                }
                Err(broadcast::error::RecvError::Closed) => {
                    tracing::debug!("{source} inbound stream ended");
                    break;
                }
            }
        }
    }
}

/// Run the lifecycle hand-off when `transport` closes
async fn watch_close(
    source: TransportSource,
    transport: Arc<dyn Transport>,
    on_closed: ClosedHook,
    token: CancellationToken,
) {
    tokio::select! {
        _ = token.cancelled() => {}
        _ = transport.closed() => {
            tracing::debug!("{source} transport close observed");
            (on_closed)().await;
        }
    }
}
