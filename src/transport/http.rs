//! HTTP/SSE transport implementations
//!
//! Module provides the two `sse`-kind transports. The server side runs an
//! axum HTTP server exposing an SSE event stream for outbound frames and a
//! POST endpoint for inbound frames. The client side opens an outbound SSE
//! stream with reqwest, performs the MCP `endpoint` handshake to learn the
//! message-POST URL, and posts outbound frames there.

use axum::{
    Router,
    extract::State,
    http::{HeaderMap, StatusCode, header},
    response::{Sse, sse::Event, sse::KeepAlive},
    routing::{get, post},
};
use futures::stream::{Stream, StreamExt};
use reqwest::Client;
use std::{convert::Infallible, sync::Arc, time::Duration};
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::WaitForCancellationFutureOwned;
use tower_http::cors::{Any, CorsLayer};
use url::Url;

use crate::core::error::{BridgeError, BridgeResult};
use crate::transport::factory::{SseClientOptions, SseServerOptions};
use crate::transport::traits::{InboundEvent, Transport, TransportChannels};

/// Capacity of the outbound SSE broadcast; slow SSE consumers beyond this
/// lose frames.
const OUTBOUND_CHANNEL_CAPACITY: usize = 1024;

/// How long the client waits for the server's `endpoint` handshake event.
const ENDPOINT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

const SSE_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(30);

// ============================================================================
// SSE Server Transport
// ============================================================================

/// Shared state for the SSE server routes
struct SseServerState {
    channels: TransportChannels,
    outbound_tx: broadcast::Sender<String>,
    messages_endpoint: String,
    auth_token: Option<String>,
}

impl SseServerState {
    /// Bearer-token gate applied to both routes when a token is configured.
    fn authorize(&self, headers: &HeaderMap) -> Result<(), StatusCode> {
        let Some(expected) = &self.auth_token else {
            return Ok(());
        };
        let presented = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        if presented == Some(format!("Bearer {expected}").as_str()) {
            Ok(())
        } else {
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}

/// Server-side SSE transport
///
/// Serves `GET {endpoint}` as the outbound event stream and accepts
/// inbound frames on `POST {messages_endpoint}`. Binds the configured
/// port, falling back through `fallback_ports` in order.
#[derive(Debug)]
pub struct SseServerTransport {
    channels: TransportChannels,
    outbound_tx: broadcast::Sender<String>,
    server_task: Mutex<Option<JoinHandle<()>>>,
    local_addr: std::net::SocketAddr,
    endpoint: String,
}

impl SseServerTransport {
    /// Bind the HTTP server and start serving
    pub async fn bind(options: SseServerOptions) -> BridgeResult<Self> {
        for path in [&options.endpoint, &options.messages_endpoint] {
            if !path.starts_with('/') {
                return Err(BridgeError::invalid_config(format!(
                    "endpoint path must start with '/': {path}"
                )));
            }
        }
        if options.endpoint == options.messages_endpoint {
            return Err(BridgeError::invalid_config(
                "endpoint and messagesEndpoint must differ",
            ));
        }
        let channels = TransportChannels::new();
        let (outbound_tx, _) = broadcast::channel(OUTBOUND_CHANNEL_CAPACITY);

        let state = Arc::new(SseServerState {
            channels: channels.clone(),
            outbound_tx: outbound_tx.clone(),
            messages_endpoint: options.messages_endpoint.clone(),
            auth_token: options.auth_token.clone(),
        });

        let app = Router::new()
            .route(&options.endpoint, get(handle_sse_stream))
            .route(&options.messages_endpoint, post(handle_posted_message))
            .with_state(state)
            .layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            );

        let listener = Self::bind_with_fallback(options.port, &options.fallback_ports).await?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| BridgeError::transport_create(format!("failed to read local addr: {e}")))?;

        tracing::info!("SSE server transport listening on {local_addr}");

        let serve_channels = channels.clone();
        let server_task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!("SSE server error: {e}");
                serve_channels.publish(InboundEvent::Error(BridgeError::Http(format!(
                    "SSE server failed: {e}"
                ))));
            }
            serve_channels.mark_closed();
        });

        Ok(Self {
            channels,
            outbound_tx,
            server_task: Mutex::new(Some(server_task)),
            local_addr,
            endpoint: options.endpoint,
        })
    }

    async fn bind_with_fallback(
        port: u16,
        fallback_ports: &[u16],
    ) -> BridgeResult<tokio::net::TcpListener> {
        let mut last_error = None;
        for candidate in std::iter::once(port).chain(fallback_ports.iter().copied()) {
            match tokio::net::TcpListener::bind(("0.0.0.0", candidate)).await {
                Ok(listener) => {
                    if candidate != port {
                        tracing::warn!("port {port} unavailable, bound fallback port {candidate}");
                    }
                    return Ok(listener);
                }
                Err(e) => {
                    tracing::debug!("failed to bind port {candidate}: {e}");
                    last_error = Some(e);
                }
            }
        }
        Err(BridgeError::transport_create(format!(
            "no bindable port among {port} and fallbacks: {}",
            last_error.map_or_else(|| "none tried".to_string(), |e| e.to_string())
        )))
    }

    /// The address the server actually bound (relevant with fallback ports)
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }
}

#[async_trait::async_trait]
impl Transport for SseServerTransport {
    fn inbound(&self) -> broadcast::Receiver<InboundEvent> {
        self.channels.inbound_tx.subscribe()
    }

    async fn send(&self, message: &str) -> BridgeResult<()> {
        if self.channels.is_closed() {
            return Err(BridgeError::transport_closed("SSE server transport is closed"));
        }
        tracing::trace!("SSE server sending: {message}");
        if self.outbound_tx.send(message.to_string()).is_err() {
            tracing::warn!("no SSE clients connected, frame dropped");
        }
        Ok(())
    }

    async fn close(&self) -> BridgeResult<()> {
        if self.channels.is_closed() {
            return Ok(());
        }
        tracing::debug!("closing SSE server transport on {}", self.local_addr);

        if let Some(task) = self.server_task.lock().await.take() {
            task.abort();
        }
        self.channels.mark_closed();
        Ok(())
    }

    fn closed(&self) -> WaitForCancellationFutureOwned {
        self.channels.closed.clone().cancelled_owned()
    }

    fn describe(&self) -> String {
        format!(
            "SSE server transport ({}{}, closed: {})",
            self.local_addr,
            self.endpoint,
            self.channels.is_closed()
        )
    }
}

impl Drop for SseServerTransport {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.server_task.try_lock() {
            if let Some(task) = guard.take() {
                task.abort();
            }
        }
    }
}

/// Serve the outbound frame stream, opening with the MCP `endpoint` event.
async fn handle_sse_stream(
    State(state): State<Arc<SseServerState>>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, StatusCode> {
    state.authorize(&headers)?;

    let endpoint_event = Event::default()
        .event("endpoint")
        .data(state.messages_endpoint.clone());
    let frames =
        BroadcastStream::new(state.outbound_tx.subscribe()).filter_map(|result| async move {
            match result {
                Ok(frame) => Some(Ok(Event::default().event("message").data(frame))),
                // Lagged receiver: frames lost to a slow consumer, stream continues.
                Err(_) => None,
            }
        });
    let stream = futures::stream::once(async move { Ok(endpoint_event) }).chain(frames);

    Ok(Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(SSE_KEEP_ALIVE_INTERVAL).text("keep-alive")))
}

/// Accept one posted inbound frame, passed through opaque.
async fn handle_posted_message(
    State(state): State<Arc<SseServerState>>,
    headers: HeaderMap,
    body: String,
) -> Result<StatusCode, StatusCode> {
    state.authorize(&headers)?;

    let frame = body.trim();
    if frame.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    tracing::trace!("SSE server received: {frame}");
    state.channels.publish(InboundEvent::Message(frame.to_string()));
    Ok(StatusCode::ACCEPTED)
}

// ============================================================================
// SSE Client Transport
// ============================================================================

/// One parsed server-sent event
#[derive(Debug, PartialEq)]
struct SseEvent {
    event: String,
    data: String,
}

/// Incremental server-sent-event field parser
///
/// Feeds on raw byte-stream chunks; lines may be split across chunks.
/// Dispatches an event per blank line, joining multi-line data fields.
#[derive(Default)]
struct SseParser {
    pending: String,
    event_type: String,
    data: Vec<String>,
}

impl SseParser {
    fn feed(&mut self, chunk: &str, out: &mut Vec<SseEvent>) {
        self.pending.push_str(chunk);
        while let Some(pos) = self.pending.find('\n') {
            let line: String = self.pending.drain(..=pos).collect();
            self.process_line(line.trim_end_matches(['\r', '\n']), out);
        }
    }

    fn process_line(&mut self, line: &str, out: &mut Vec<SseEvent>) {
        if line.is_empty() {
            if !self.data.is_empty() {
                let event = if self.event_type.is_empty() {
                    "message".to_string()
                } else {
                    std::mem::take(&mut self.event_type)
                };
                out.push(SseEvent {
                    event,
                    data: self.data.join("\n"),
                });
            }
            self.event_type.clear();
            self.data.clear();
        } else if line.starts_with(':') {
            // Comment line, used for keep-alives.
        } else if let Some(value) = line.strip_prefix("event:") {
            self.event_type = value.strip_prefix(' ').unwrap_or(value).to_string();
        } else if let Some(value) = line.strip_prefix("data:") {
            self.data
                .push(value.strip_prefix(' ').unwrap_or(value).to_string());
        }
    }
}

/// Client-side SSE transport
///
/// Opens the event stream at `server_url`, resolves the message-POST URL
/// from the server's `endpoint` handshake event, then forwards outbound
/// frames as POSTs and inbound `message` events into the broadcast.
#[derive(Debug)]
pub struct SseClientTransport {
    channels: TransportChannels,
    http: Client,
    headers: reqwest::header::HeaderMap,
    messages_url: Url,
    server_url: String,
}

impl SseClientTransport {
    /// Connect the event stream and complete the endpoint handshake
    pub async fn connect(options: SseClientOptions) -> BridgeResult<Self> {
        let base_url = Url::parse(&options.server_url)
            .map_err(|e| BridgeError::invalid_config(format!("serverUrl: {e}")))?;
        let headers = build_headers(&options)?;

        let http = Client::builder()
            .build()
            .map_err(|e| BridgeError::transport_create(format!("failed to build HTTP client: {e}")))?;

        tracing::debug!("connecting SSE stream to {}", options.server_url);
        let response = http
            .get(base_url.clone())
            .headers(headers.clone())
            .header(header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| BridgeError::transport_create(format!("SSE connection failed: {e}")))?;

        if !response.status().is_success() {
            return Err(BridgeError::transport_create(format!(
                "SSE connection refused: {} {}",
                response.status().as_u16(),
                response.status().canonical_reason().unwrap_or("unknown")
            )));
        }

        let mut stream = response.bytes_stream();
        let mut parser = SseParser::default();

        // The server announces where messages are POSTed before anything else.
        let endpoint_data = timeout(ENDPOINT_HANDSHAKE_TIMEOUT, async {
            let mut events = Vec::new();
            loop {
                if let Some(event) = events.iter().position(|e: &SseEvent| e.event == "endpoint") {
                    return Ok(events.swap_remove(event).data);
                }
                events.clear();
                match stream.next().await {
                    Some(Ok(bytes)) => {
                        parser.feed(&String::from_utf8_lossy(&bytes), &mut events);
                    }
                    Some(Err(e)) => {
                        return Err(BridgeError::transport_create(format!(
                            "SSE stream failed during handshake: {e}"
                        )));
                    }
                    None => {
                        return Err(BridgeError::transport_create(
                            "SSE stream ended before endpoint event",
                        ));
                    }
                }
            }
        })
        .await
        .map_err(|_| BridgeError::transport_create("timed out waiting for endpoint event"))??;

        let messages_url = base_url
            .join(&endpoint_data)
            .map_err(|e| BridgeError::transport_create(format!("bad endpoint event: {e}")))?;
        tracing::debug!("SSE endpoint handshake complete, messages go to {messages_url}");

        let channels = TransportChannels::new();
        let stream_channels = channels.clone();
        tokio::spawn(async move {
            loop {
                let mut events = Vec::new();
                tokio::select! {
                    _ = stream_channels.closed.cancelled() => break,
                    chunk = stream.next() => match chunk {
                        Some(Ok(bytes)) => {
                            parser.feed(&String::from_utf8_lossy(&bytes), &mut events);
                        }
                        Some(Err(e)) => {
                            tracing::error!("SSE stream error: {e}");
                            stream_channels.publish(InboundEvent::Error(
                                BridgeError::transport_io(format!("SSE stream failed: {e}")),
                            ));
                            break;
                        }
                        None => {
                            tracing::debug!("SSE stream ended");
                            break;
                        }
                    }
                }
                for event in events {
                    match event.event.as_str() {
                        "message" => {
                            tracing::trace!("SSE client received: {}", event.data);
                            stream_channels.publish(InboundEvent::Message(event.data));
                        }
                        other => tracing::trace!("ignoring SSE event type '{other}'"),
                    }
                }
            }
            stream_channels.mark_closed();
        });

        Ok(Self {
            channels,
            http,
            headers,
            messages_url,
            server_url: options.server_url,
        })
    }
}

fn build_headers(options: &SseClientOptions) -> BridgeResult<reqwest::header::HeaderMap> {
    let mut headers = reqwest::header::HeaderMap::new();
    for (name, value) in &options.headers {
        let name: reqwest::header::HeaderName = name
            .parse()
            .map_err(|_| BridgeError::invalid_config(format!("invalid header name: {name}")))?;
        let value: reqwest::header::HeaderValue = value
            .parse()
            .map_err(|_| BridgeError::invalid_config(format!("invalid value for header {name}")))?;
        headers.insert(name, value);
    }
    Ok(headers)
}

#[async_trait::async_trait]
impl Transport for SseClientTransport {
    fn inbound(&self) -> broadcast::Receiver<InboundEvent> {
        self.channels.inbound_tx.subscribe()
    }

    async fn send(&self, message: &str) -> BridgeResult<()> {
        if self.channels.is_closed() {
            return Err(BridgeError::transport_closed("SSE client transport is closed"));
        }
        tracing::trace!("SSE client sending: {message}");

        let response = self
            .http
            .post(self.messages_url.clone())
            .headers(self.headers.clone())
            .header(header::CONTENT_TYPE, "application/json")
            .body(message.to_string())
            .send()
            .await
            .map_err(|e| BridgeError::transport_io(format!("message POST failed: {e}")))?;

        if !response.status().is_success() {
            return Err(BridgeError::transport_io(format!(
                "message POST rejected: {} {}",
                response.status().as_u16(),
                response.status().canonical_reason().unwrap_or("unknown")
            )));
        }
        Ok(())
    }

    async fn close(&self) -> BridgeResult<()> {
        if self.channels.is_closed() {
            return Ok(());
        }
        tracing::debug!("closing SSE client transport to {}", self.server_url);
        self.channels.mark_closed();
        Ok(())
    }

    fn closed(&self) -> WaitForCancellationFutureOwned {
        self.channels.closed.clone().cancelled_owned()
    }

    fn describe(&self) -> String {
        format!(
            "SSE client transport ({}, closed: {})",
            self.server_url,
            self.channels.is_closed()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_sse_parser_single_event() {
        let mut parser = SseParser::default();
        let mut events = Vec::new();
        parser.feed("event: endpoint\ndata: /messages\n\n", &mut events);
        assert_eq!(
            events,
            vec![SseEvent {
                event: "endpoint".to_string(),
                data: "/messages".to_string()
            }]
        );
    }

    #[test]
    fn test_sse_parser_chunk_boundaries() {
        let mut parser = SseParser::default();
        let mut events = Vec::new();
        parser.feed("data: {\"json", &mut events);
        assert!(events.is_empty());
        parser.feed("rpc\":\"2.0\"}\n", &mut events);
        assert!(events.is_empty());
        parser.feed("\n", &mut events);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "message");
        assert_eq!(events[0].data, "{\"jsonrpc\":\"2.0\"}");
    }

    #[test]
    fn test_sse_parser_multi_line_data_and_comments() {
        let mut parser = SseParser::default();
        let mut events = Vec::new();
        parser.feed(": keep-alive\ndata: one\ndata: two\n\n", &mut events);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "one\ntwo");
    }

    #[test]
    fn test_sse_parser_crlf_lines() {
        let mut parser = SseParser::default();
        let mut events = Vec::new();
        parser.feed("event: message\r\ndata: hi\r\n\r\n", &mut events);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "hi");
    }

    #[test]
    fn test_build_headers_rejects_garbage() {
        let options = SseClientOptions {
            server_url: "http://localhost:1/sse".to_string(),
            headers: HashMap::from([("bad header\n".to_string(), "x".to_string())]),
        };
        assert!(matches!(
            build_headers(&options).unwrap_err(),
            BridgeError::InvalidConfig(_)
        ));
    }

    #[tokio::test]
    async fn test_connect_rejects_malformed_url() {
        let options = SseClientOptions {
            server_url: "not a url".to_string(),
            headers: HashMap::new(),
        };
        let err = SseClientTransport::connect(options).await.unwrap_err();
        assert!(matches!(err, BridgeError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_server_bind_fallback_and_roundtrip() {
        // Occupy a port, then ask the transport to bind it with a fallback of 0.
        let blocker = tokio::net::TcpListener::bind(("0.0.0.0", 0)).await.unwrap();
        let taken = blocker.local_addr().unwrap().port();

        let server = SseServerTransport::bind(SseServerOptions {
            port: taken,
            fallback_ports: vec![0],
            ..Default::default()
        })
        .await
        .unwrap();
        assert_ne!(server.local_addr().port(), taken);

        // Full loop through a real client: handshake, inbound, outbound.
        let client = SseClientTransport::connect(SseClientOptions {
            server_url: format!("http://127.0.0.1:{}/sse", server.local_addr().port()),
            headers: HashMap::new(),
        })
        .await
        .unwrap();

        let mut server_inbound = server.inbound();
        let mut client_inbound = client.inbound();

        client.send("{\"id\":1}").await.unwrap();
        match timeout(Duration::from_secs(5), server_inbound.recv())
            .await
            .unwrap()
            .unwrap()
        {
            InboundEvent::Message(frame) => assert_eq!(frame, "{\"id\":1}"),
            other => panic!("expected message, got {other:?}"),
        }

        server.send("{\"id\":2}").await.unwrap();
        match timeout(Duration::from_secs(5), client_inbound.recv())
            .await
            .unwrap()
            .unwrap()
        {
            InboundEvent::Message(frame) => assert_eq!(frame, "{\"id\":2}"),
            other => panic!("expected message, got {other:?}"),
        }

        client.close().await.unwrap();
        server.close().await.unwrap();
        assert!(matches!(
            server.send("{}").await.unwrap_err(),
            BridgeError::TransportClosed(_)
        ));
    }

    #[tokio::test]
    async fn test_server_auth_token_enforced() {
        let server = SseServerTransport::bind(SseServerOptions {
            port: 0,
            auth_token: Some("s3cret".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
        let base = format!("http://127.0.0.1:{}", server.local_addr().port());

        // Unauthenticated connect fails the handshake with a 401.
        let err = SseClientTransport::connect(SseClientOptions {
            server_url: format!("{base}/sse"),
            headers: HashMap::new(),
        })
        .await
        .unwrap_err();
        assert!(err.to_string().contains("401"));

        // The matching bearer token is accepted.
        let client = SseClientTransport::connect(SseClientOptions {
            server_url: format!("{base}/sse"),
            headers: HashMap::from([(
                "Authorization".to_string(),
                "Bearer s3cret".to_string(),
            )]),
        })
        .await
        .unwrap();

        client.close().await.unwrap();
        server.close().await.unwrap();
    }
}
