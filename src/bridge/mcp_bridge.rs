//! The bridge engine
//!
//! Module implements [`McpBridge`]: the public surface and the lifecycle
//! controller behind it. The bridge owns one server-side and one
//! client-side transport, pumps frames between them full-duplex, observes
//! transport closures, and drives the two reconnection policies.
//!
//! State mutations are serialized through a single async mutex; the status
//! flags are mirrored in atomics so the synchronous getters never contend
//! with lifecycle operations. Callbacks are read late-bound at every call
//! site and invoked outside the state lock.

use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

use crate::bridge::config::{BridgeConfig, ShutdownPolicy, TransportKind};
use crate::bridge::pump::{ClosedHook, ErrorHook, PumpHooks, SubscriptionSet};
use crate::core::error::{BridgeError, BridgeResult};
use crate::transport::factory::{
    DefaultTransportFactory, SseClientOptions, SseServerOptions, StdioClientOptions,
    TransportFactory,
};
use crate::transport::traits::{Transport, TransportSource};

/// Callback slot invoked when a transport surfaces an error
pub type TransportErrorCallback = Arc<dyn Fn(TransportSource, &BridgeError) + Send + Sync>;
/// Callback slot invoked when a transport closes
pub type TransportClosedCallback = Arc<dyn Fn(TransportSource) + Send + Sync>;
/// Callback slot invoked after a side reconnects
pub type TransportReconnectedCallback = Arc<dyn Fn(TransportSource) + Send + Sync>;
/// Async hook consulted before each server reconnection attempt; return
/// `false` to abandon reconnection and shut the bridge down
pub type ServerReconnectHook = Arc<dyn Fn() -> BoxFuture<'static, bool> + Send + Sync>;

const DEFAULT_CLIENT_MAX_RECONNECT_ATTEMPTS: u32 = 3;
const DEFAULT_CLIENT_RECONNECT_DELAY: Duration = Duration::from_secs(2);
const DEFAULT_SERVER_RECONNECT_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Reconnection tuning knobs, adjustable through the setters
#[derive(Debug, Clone, Copy)]
struct ReconnectTuning {
    client_auto_reconnect: bool,
    client_max_attempts: u32,
    client_delay: Duration,
    /// 0 means unbounded
    server_max_attempts: u32,
    server_check_interval: Duration,
}

impl Default for ReconnectTuning {
    fn default() -> Self {
        Self {
            client_auto_reconnect: true,
            client_max_attempts: DEFAULT_CLIENT_MAX_RECONNECT_ATTEMPTS,
            client_delay: DEFAULT_CLIENT_RECONNECT_DELAY,
            server_max_attempts: 0,
            server_check_interval: DEFAULT_SERVER_RECONNECT_CHECK_INTERVAL,
        }
    }
}

#[derive(Default)]
struct CallbackSlots {
    error: StdMutex<Option<TransportErrorCallback>>,
    closed: StdMutex<Option<TransportClosedCallback>>,
    reconnected: StdMutex<Option<TransportReconnectedCallback>>,
    server_reconnect: StdMutex<Option<ServerReconnectHook>>,
}

/// The mutable half of the bridge, guarded by the lifecycle mutex
#[derive(Default)]
struct BridgeState {
    server_transport: Option<Arc<dyn Transport>>,
    client_transport: Option<Arc<dyn Transport>>,
    subscriptions: Option<SubscriptionSet>,
    client_reconnect_attempts: u32,
    server_reconnect_attempts: u32,
}

struct Inner {
    config: BridgeConfig,
    factory: Arc<dyn TransportFactory>,
    initialized: AtomicBool,
    shutting_down: AtomicBool,
    server_active: AtomicBool,
    waiting_for_server: AtomicBool,
    /// Wakes reconnect sleeps promptly when a shutdown begins.
    shutdown_notify: Notify,
    state: Mutex<BridgeState>,
    tuning: StdMutex<ReconnectTuning>,
    callbacks: CallbackSlots,
}

/// Transport bridge between an MCP client and an MCP server
///
/// Constructed un-initialized from a [`BridgeConfig`]; [`initialize`]
/// creates both transports and starts forwarding, [`shutdown`] tears
/// everything down and returns the bridge to its un-initialized state.
/// Both operations are idempotent and a bridge may be re-initialized.
///
/// Callback closures supplied by the application may capture a clone of
/// the bridge; to avoid a reference cycle keeping both alive, such
/// closures should capture whatever application state they need rather
/// than the bridge itself, or be dropped by reassigning the slot.
///
/// [`initialize`]: McpBridge::initialize
/// [`shutdown`]: McpBridge::shutdown
#[derive(Clone)]
pub struct McpBridge {
    inner: Arc<Inner>,
}

impl McpBridge {
    /// Create an un-initialized bridge over the concrete transport kinds
    pub fn new(config: BridgeConfig) -> Self {
        Self::with_factory(config, Arc::new(DefaultTransportFactory))
    }

    /// Create an un-initialized bridge with a custom transport factory
    ///
    /// The factory seam lets tests and embedders supply in-memory or
    /// otherwise custom transports without touching the lifecycle engine.
    pub fn with_factory(config: BridgeConfig, factory: Arc<dyn TransportFactory>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                factory,
                initialized: AtomicBool::new(false),
                shutting_down: AtomicBool::new(false),
                server_active: AtomicBool::new(false),
                waiting_for_server: AtomicBool::new(false),
                shutdown_notify: Notify::new(),
                state: Mutex::new(BridgeState::default()),
                tuning: StdMutex::new(ReconnectTuning::default()),
                callbacks: CallbackSlots::default(),
            }),
        }
    }

    /// Bridge a stdio server (current process streams) to an SSE client
    ///
    /// A stdio server cannot outlive its peer process, so the effective
    /// shutdown policy is always [`ShutdownPolicy::ShutdownBridge`]
    /// regardless of `policy`.
    pub fn stdio_server_to_sse_client(
        client: SseClientOptions,
        policy: ShutdownPolicy,
    ) -> BridgeResult<Self> {
        let config = BridgeConfig::with_kinds(
            TransportKind::Stdio,
            TransportKind::Sse,
            Map::new(),
            options_to_map(&client)?,
            policy,
        );
        Ok(Self::new(config))
    }

    /// Bridge an SSE server to a stdio client (spawned child process)
    pub fn sse_server_to_stdio_client(
        server: SseServerOptions,
        client: StdioClientOptions,
        policy: ShutdownPolicy,
    ) -> BridgeResult<Self> {
        let config = BridgeConfig::with_kinds(
            TransportKind::Sse,
            TransportKind::Stdio,
            options_to_map(&server)?,
            options_to_map(&client)?,
            policy,
        );
        Ok(Self::new(config))
    }

    /// Create both transports and start forwarding
    ///
    /// The client transport is created first, then the server transport;
    /// if either creation fails the partially built state is torn down
    /// before the error is returned. Calling this on an initialized
    /// bridge logs a warning and returns without effect.
    pub async fn initialize(&self) -> BridgeResult<()> {
        let inner = &self.inner;
        let mut state = inner.state.lock().await;
        if inner.initialized.load(Ordering::SeqCst) {
            tracing::warn!("bridge already initialized, ignoring initialize call");
            return Ok(());
        }
        if inner.is_shutting_down() {
            tracing::warn!("bridge is shutting down, ignoring initialize call");
            return Ok(());
        }
        tracing::info!(
            "initializing bridge: {} server <-> {} client",
            inner.config.server_kind(),
            inner.config.client_kind()
        );

        let client = match inner
            .factory
            .create_client(inner.config.client_kind(), inner.config.client_config())
            .await
        {
            Ok(client) => client,
            Err(e) => {
                drop(state);
                tracing::error!("client transport creation failed: {e}");
                inner.emit_error(TransportSource::Client, &e);
                inner.shutdown_internal().await;
                return Err(e);
            }
        };
        state.client_transport = Some(Arc::clone(&client));

        let server = match inner
            .factory
            .create_server(inner.config.server_kind(), inner.config.server_config())
            .await
        {
            Ok(server) => server,
            Err(e) => {
                drop(state);
                tracing::error!("server transport creation failed: {e}");
                inner.emit_error(TransportSource::Server, &e);
                inner.shutdown_internal().await;
                return Err(e);
            }
        };
        state.server_transport = Some(Arc::clone(&server));

        state.subscriptions = Some(install_subscriptions(inner, &server, &client));
        inner.server_active.store(true, Ordering::SeqCst);
        inner.initialized.store(true, Ordering::SeqCst);
        tracing::info!("bridge initialized");
        Ok(())
    }

    /// Tear the bridge down and return it to the un-initialized state
    ///
    /// Idempotent from any state, including mid-reconnection: pending
    /// reconnect loops observe the shutdown and exit promptly.
    pub async fn shutdown(&self) -> BridgeResult<()> {
        self.inner.shutdown_internal().await;
        Ok(())
    }

    /// Tune client-side auto-reconnection
    pub fn set_auto_reconnect(&self, enabled: bool, max_attempts: u32, delay: Duration) {
        let mut tuning = self.inner.tuning.lock().expect("tuning lock poisoned");
        tuning.client_auto_reconnect = enabled;
        tuning.client_max_attempts = max_attempts;
        tuning.client_delay = delay;
    }

    /// Tune the server wait-for-reconnection loop
    ///
    /// `max_attempts` of 0 means unbounded.
    pub fn set_server_reconnection_options(&self, max_attempts: u32, check_interval: Duration) {
        let mut tuning = self.inner.tuning.lock().expect("tuning lock poisoned");
        tuning.server_max_attempts = max_attempts;
        tuning.server_check_interval = check_interval;
    }

    /// Assign the transport-error callback
    pub fn on_transport_error(
        &self,
        callback: impl Fn(TransportSource, &BridgeError) + Send + Sync + 'static,
    ) {
        *self.inner.callbacks.error.lock().expect("callback lock poisoned") =
            Some(Arc::new(callback));
    }

    /// Assign the transport-closed callback
    pub fn on_transport_closed(&self, callback: impl Fn(TransportSource) + Send + Sync + 'static) {
        *self.inner.callbacks.closed.lock().expect("callback lock poisoned") =
            Some(Arc::new(callback));
    }

    /// Assign the transport-reconnected callback
    pub fn on_transport_reconnected(
        &self,
        callback: impl Fn(TransportSource) + Send + Sync + 'static,
    ) {
        *self.inner.callbacks.reconnected.lock().expect("callback lock poisoned") =
            Some(Arc::new(callback));
    }

    /// Assign the server-reconnect hook
    ///
    /// Awaited before every server reconnection attempt; returning
    /// `false` abandons reconnection and shuts the bridge down. The hook
    /// lets the application veto an attempt or provision a replacement
    /// backing server out-of-band first.
    pub fn on_server_reconnect_requested(
        &self,
        hook: impl Fn() -> BoxFuture<'static, bool> + Send + Sync + 'static,
    ) {
        *self
            .inner
            .callbacks
            .server_reconnect
            .lock()
            .expect("callback lock poisoned") = Some(Arc::new(hook));
    }

    /// Whether the bridge is initialized
    pub fn is_initialized(&self) -> bool {
        self.inner.initialized.load(Ordering::SeqCst)
    }

    /// Whether the server-side transport is active
    pub fn is_server_active(&self) -> bool {
        self.inner.server_active.load(Ordering::SeqCst)
    }

    /// Whether the bridge is waiting for a server transport to return
    pub fn is_waiting_for_server_reconnection(&self) -> bool {
        self.inner.waiting_for_server.load(Ordering::SeqCst)
    }

    /// The configured server-side transport kind
    pub fn server_transport_kind(&self) -> TransportKind {
        self.inner.config.server_kind()
    }

    /// The configured client-side transport kind
    pub fn client_transport_kind(&self) -> TransportKind {
        self.inner.config.client_kind()
    }

    /// The effective server-shutdown policy
    pub fn server_shutdown_policy(&self) -> ShutdownPolicy {
        self.inner.config.server_shutdown_policy()
    }

    /// The bridge configuration
    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }
}

/// Wire the pump hooks to the lifecycle controller and install the
/// subscription set against a transport pair.
fn install_subscriptions(
    inner: &Arc<Inner>,
    server: &Arc<dyn Transport>,
    client: &Arc<dyn Transport>,
) -> SubscriptionSet {
    let error_inner = Arc::clone(inner);
    let error: ErrorHook = Arc::new(move |source, error| error_inner.emit_error(source, &error));

    let server_inner = Arc::clone(inner);
    let server_closed: ClosedHook = Arc::new(move || {
        let inner = Arc::clone(&server_inner);
        Box::pin(async move { inner.handle_server_closed().await })
    });

    let client_inner = Arc::clone(inner);
    let client_closed: ClosedHook = Arc::new(move || {
        let inner = Arc::clone(&client_inner);
        Box::pin(async move { inner.handle_client_closed().await })
    });

    SubscriptionSet::install(
        server,
        client,
        PumpHooks {
            error,
            server_closed,
            client_closed,
        },
    )
}

fn options_to_map<T: Serialize>(options: &T) -> BridgeResult<Map<String, Value>> {
    match serde_json::to_value(options)? {
        Value::Object(map) => Ok(map),
        other => Err(BridgeError::Serialization(format!(
            "transport options serialized to {other:?}, expected an object"
        ))),
    }
}

impl Inner {
    fn emit_error(&self, source: TransportSource, error: &BridgeError) {
        tracing::debug!(
            "transport error on {source} (category: {}): {error}",
            error.category()
        );
        let callback = self.callbacks.error.lock().expect("callback lock poisoned").clone();
        if let Some(callback) = callback {
            callback(source, error);
        }
    }

    fn emit_closed(&self, source: TransportSource) {
        let callback = self.callbacks.closed.lock().expect("callback lock poisoned").clone();
        if let Some(callback) = callback {
            callback(source);
        }
    }

    fn emit_reconnected(&self, source: TransportSource) {
        let callback = self
            .callbacks
            .reconnected
            .lock()
            .expect("callback lock poisoned")
            .clone();
        if let Some(callback) = callback {
            callback(source);
        }
    }

    fn server_reconnect_hook(&self) -> Option<ServerReconnectHook> {
        self.callbacks
            .server_reconnect
            .lock()
            .expect("callback lock poisoned")
            .clone()
    }

    fn tuning(&self) -> ReconnectTuning {
        *self.tuning.lock().expect("tuning lock poisoned")
    }

    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Sleep for `delay`, waking early when a shutdown begins. Returns
    /// false when the caller should stop.
    async fn sleep_unless_shutdown(&self, delay: Duration) -> bool {
        let notified = self.shutdown_notify.notified();
        if self.is_shutting_down() {
            return false;
        }
        tokio::select! {
            _ = notified => false,
            _ = tokio::time::sleep(delay) => !self.is_shutting_down(),
        }
    }

    async fn shutdown_internal(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown_notify.notify_waiters();
        tracing::info!("shutting down bridge");

        let mut state = self.state.lock().await;
        if let Some(subscriptions) = state.subscriptions.take() {
            subscriptions.cancel();
        }
        let server = state.server_transport.take();
        let client = state.client_transport.take();
        state.client_reconnect_attempts = 0;
        state.server_reconnect_attempts = 0;
        drop(state);

        if let Some(server) = server {
            if let Err(e) = server.close().await {
                tracing::warn!("error closing server transport: {e}");
            }
        }
        self.server_active.store(false, Ordering::SeqCst);

        if let Some(client) = client {
            if let Err(e) = client.close().await {
                tracing::warn!("error closing client transport: {e}");
            }
        }

        self.waiting_for_server.store(false, Ordering::SeqCst);
        self.initialized.store(false, Ordering::SeqCst);
        self.shutting_down.store(false, Ordering::SeqCst);
        tracing::info!("bridge shutdown complete");
    }

    /// Lifecycle hand-off from the server close watcher
    async fn handle_server_closed(self: Arc<Self>) {
        if self.is_shutting_down() || !self.initialized.load(Ordering::SeqCst) {
            return;
        }
        tracing::warn!("server transport closed");
        self.server_active.store(false, Ordering::SeqCst);
        self.emit_closed(TransportSource::Server);

        match self.config.server_shutdown_policy() {
            ShutdownPolicy::ShutdownBridge => {
                tracing::info!("server shutdown policy is shutdownBridge, shutting down");
                self.shutdown_internal().await;
            }
            ShutdownPolicy::WaitForReconnection => {
                self.wait_for_server_reconnection().await;
            }
        }
    }

    /// Lifecycle hand-off from the client close watcher
    async fn handle_client_closed(self: Arc<Self>) {
        if self.is_shutting_down()
            || self.waiting_for_server.load(Ordering::SeqCst)
            || !self.initialized.load(Ordering::SeqCst)
        {
            return;
        }
        tracing::warn!("client transport closed");
        self.emit_closed(TransportSource::Client);

        let tuning = self.tuning();
        if !tuning.client_auto_reconnect {
            tracing::info!("client auto-reconnect disabled, leaving client disconnected");
            return;
        }
        if !self.server_active.load(Ordering::SeqCst) {
            tracing::debug!("server inactive, skipping client reconnection");
            return;
        }
        self.client_reconnect_loop(tuning).await;
    }

    /// Iterative client auto-reconnection with a flat retry delay
    async fn client_reconnect_loop(self: Arc<Self>, tuning: ReconnectTuning) {
        loop {
            if self.is_shutting_down() {
                return;
            }
            let attempts = {
                let mut state = self.state.lock().await;
                state.client_reconnect_attempts += 1;
                state.client_reconnect_attempts
            };
            if attempts > tuning.client_max_attempts {
                tracing::error!(
                    "client reconnection attempts exhausted after {} tries, giving up",
                    tuning.client_max_attempts
                );
                return;
            }
            tracing::info!(
                "attempting client reconnection ({attempts}/{})",
                tuning.client_max_attempts
            );

            if !self.sleep_unless_shutdown(tuning.client_delay).await {
                return;
            }
            // The server may have dropped while we slept.
            if !self.server_active.load(Ordering::SeqCst) {
                tracing::info!("server no longer active, abandoning client reconnection");
                return;
            }

            let created = self
                .factory
                .create_client(self.config.client_kind(), self.config.client_config())
                .await;
            match created {
                Ok(client) => {
                    let mut state = self.state.lock().await;
                    if self.is_shutting_down() || !self.initialized.load(Ordering::SeqCst) {
                        drop(state);
                        let _ = client.close().await;
                        return;
                    }
                    let Some(server) = state.server_transport.clone() else {
                        drop(state);
                        let _ = client.close().await;
                        return;
                    };
                    if let Some(old) = state.subscriptions.take() {
                        old.cancel();
                    }
                    state.client_transport = Some(Arc::clone(&client));
                    state.subscriptions = Some(install_subscriptions(&self, &server, &client));
                    state.client_reconnect_attempts = 0;
                    drop(state);

                    tracing::info!("client transport reconnected");
                    self.emit_reconnected(TransportSource::Client);
                    return;
                }
                Err(e) => {
                    tracing::warn!("client reconnection attempt failed: {e}");
                    self.emit_error(TransportSource::Client, &e);
                    if !self.server_active.load(Ordering::SeqCst) {
                        return;
                    }
                }
            }
        }
    }

    /// Server wait-for-reconnection loop
    ///
    /// The client cannot function with no server, so it is closed on
    /// entry; a successful attempt recreates the pair atomically. A
    /// failed client re-creation rolls the fresh server back rather than
    /// leaving the bridge active with no client.
    async fn wait_for_server_reconnection(self: Arc<Self>) {
        if self.waiting_for_server.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("waiting for server transport to reconnect");

        {
            let mut state = self.state.lock().await;
            state.server_reconnect_attempts = 0;
            if let Some(subscriptions) = state.subscriptions.take() {
                subscriptions.cancel();
            }
            let server = state.server_transport.take();
            let client = state.client_transport.take();
            drop(state);

            if let Some(client) = client {
                let _ = client.close().await;
            }
            if let Some(server) = server {
                let _ = server.close().await;
            }
        }

        let tuning = self.tuning();
        loop {
            if self.is_shutting_down() || !self.waiting_for_server.load(Ordering::SeqCst) {
                return;
            }
            let attempts = {
                let mut state = self.state.lock().await;
                state.server_reconnect_attempts += 1;
                state.server_reconnect_attempts
            };
            if tuning.server_max_attempts > 0 && attempts > tuning.server_max_attempts {
                let error = BridgeError::reconnect_exhausted(format!(
                    "server did not return within {} attempts",
                    tuning.server_max_attempts
                ));
                tracing::error!("{error}, shutting down");
                self.emit_error(TransportSource::Server, &error);
                self.waiting_for_server.store(false, Ordering::SeqCst);
                self.shutdown_internal().await;
                return;
            }
            tracing::info!("attempting server reconnection (attempt {attempts})");

            if let Some(hook) = self.server_reconnect_hook() {
                if !hook().await {
                    tracing::info!("server reconnection vetoed by application, shutting down");
                    self.waiting_for_server.store(false, Ordering::SeqCst);
                    self.shutdown_internal().await;
                    return;
                }
            }

            match self
                .factory
                .create_server(self.config.server_kind(), self.config.server_config())
                .await
            {
                Ok(server) => {
                    match self
                        .factory
                        .create_client(self.config.client_kind(), self.config.client_config())
                        .await
                    {
                        Ok(client) => {
                            let mut state = self.state.lock().await;
                            if self.is_shutting_down() {
                                drop(state);
                                let _ = server.close().await;
                                let _ = client.close().await;
                                return;
                            }
                            if let Some(old) = state.subscriptions.take() {
                                old.cancel();
                            }
                            state.server_transport = Some(Arc::clone(&server));
                            state.client_transport = Some(Arc::clone(&client));
                            state.subscriptions =
                                Some(install_subscriptions(&self, &server, &client));
                            state.server_reconnect_attempts = 0;
                            drop(state);

                            self.server_active.store(true, Ordering::SeqCst);
                            self.waiting_for_server.store(false, Ordering::SeqCst);
                            tracing::info!("server transport reconnected");
                            self.emit_reconnected(TransportSource::Server);
                            return;
                        }
                        Err(e) => {
                            // Keep the pair atomic: no server_active without a client.
                            tracing::warn!("client re-creation failed after new server: {e}");
                            let _ = server.close().await;
                            self.emit_error(TransportSource::Client, &e);
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!("server reconnection attempt failed: {e}");
                    self.emit_error(TransportSource::Server, &e);
                }
            }

            if !self.sleep_unless_shutdown(tuning.server_check_interval).await {
                return;
            }
        }
    }
}
