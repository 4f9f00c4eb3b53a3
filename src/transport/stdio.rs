//! STDIO transport implementations
//!
//! Module provides the two stdio-based transports: the server side binds
//! the current process's standard streams, the client side spawns a child
//! process and speaks over its piped streams. Frames are newline-delimited
//! and passed through opaque.

use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, broadcast};
use tokio::time::{Duration, timeout};
use tokio_util::sync::WaitForCancellationFutureOwned;

use crate::core::error::{BridgeError, BridgeResult};
use crate::transport::factory::StdioClientOptions;
use crate::transport::traits::{InboundEvent, Transport, TransportChannels};

/// How long `close` waits for a spawned child to exit before killing it.
const CHILD_EXIT_GRACE: Duration = Duration::from_secs(5);

/// Reads newline-delimited frames into the inbound broadcast until EOF,
/// read error, or local close.
async fn pump_lines<R: AsyncRead + Unpin>(
    mut reader: BufReader<R>,
    channels: TransportChannels,
    label: &str,
) {
    let mut line = String::new();
    loop {
        line.clear();
        tokio::select! {
            _ = channels.closed.cancelled() => {
                tracing::debug!("{label} reader stopping, transport closed");
                break;
            }
            read = reader.read_line(&mut line) => match read {
                Ok(0) => {
                    tracing::debug!("{label} reached EOF");
                    break;
                }
                Ok(_) => {
                    let frame = line.trim();
                    if frame.is_empty() {
                        continue;
                    }
                    tracing::trace!("{label} received: {frame}");
                    channels.publish(InboundEvent::Message(frame.to_string()));
                }
                Err(e) => {
                    tracing::error!("{label} read error: {e}");
                    channels.publish(InboundEvent::Error(BridgeError::transport_io(format!(
                        "{label} read failed: {e}"
                    ))));
                    break;
                }
            }
        }
    }
    channels.mark_closed();
}

async fn write_frame<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut BufWriter<W>,
    message: &str,
) -> BridgeResult<()> {
    writer
        .write_all(message.as_bytes())
        .await
        .map_err(|e| BridgeError::transport_io(format!("failed to write frame: {e}")))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| BridgeError::transport_io(format!("failed to write newline: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| BridgeError::transport_io(format!("failed to flush: {e}")))?;
    Ok(())
}

/// Server-side stdio transport
///
/// Bound to the current process's standard streams: inbound frames are
/// lines read from stdin, outbound frames are written to stdout. Closes
/// when stdin reaches EOF or on local `close()`.
#[derive(Debug)]
pub struct StdioServerTransport {
    channels: TransportChannels,
    stdout_writer: Mutex<Option<BufWriter<tokio::io::Stdout>>>,
}

impl StdioServerTransport {
    /// Create a transport over the current process's standard streams
    pub fn new() -> Self {
        let channels = TransportChannels::new();

        let reader_channels = channels.clone();
        tokio::spawn(async move {
            let reader = BufReader::new(tokio::io::stdin());
            pump_lines(reader, reader_channels, "stdio server").await;
        });

        Self {
            channels,
            stdout_writer: Mutex::new(Some(BufWriter::new(tokio::io::stdout()))),
        }
    }
}

impl Default for StdioServerTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Transport for StdioServerTransport {
    fn inbound(&self) -> broadcast::Receiver<InboundEvent> {
        self.channels.inbound_tx.subscribe()
    }

    async fn send(&self, message: &str) -> BridgeResult<()> {
        let mut guard = self.stdout_writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| BridgeError::transport_closed("stdio server transport is closed"))?;
        tracing::trace!("stdio server sending: {message}");
        write_frame(writer, message).await
    }

    async fn close(&self) -> BridgeResult<()> {
        if self.channels.is_closed() {
            return Ok(());
        }
        tracing::debug!("closing stdio server transport");

        if let Some(mut writer) = self.stdout_writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        self.channels.mark_closed();
        Ok(())
    }

    fn closed(&self) -> WaitForCancellationFutureOwned {
        self.channels.closed.clone().cancelled_owned()
    }

    fn describe(&self) -> String {
        format!("stdio server transport (closed: {})", self.channels.is_closed())
    }
}

/// Client-side stdio transport
///
/// Spawns the configured command as a child process: outbound frames are
/// written to its stdin, inbound frames are lines read from its stdout,
/// and stderr is drained to the log. Child exit is observed as remote
/// disconnection.
#[derive(Debug)]
pub struct StdioClientTransport {
    channels: TransportChannels,
    child: Mutex<Option<Child>>,
    stdin_writer: Mutex<Option<BufWriter<tokio::process::ChildStdin>>>,
    command: String,
}

impl StdioClientTransport {
    /// Spawn the child process and wire its streams
    pub fn spawn(options: StdioClientOptions) -> BridgeResult<Self> {
        tracing::debug!(
            "spawning stdio client process: {} {:?}",
            options.command,
            options.arguments
        );

        let mut command = Command::new(&options.command);
        command
            .args(&options.arguments)
            .envs(&options.environment)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &options.working_directory {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| {
            BridgeError::transport_create(format!(
                "failed to spawn process '{}': {e}",
                options.command
            ))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BridgeError::transport_create("failed to get child stdin handle"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BridgeError::transport_create("failed to get child stdout handle"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| BridgeError::transport_create("failed to get child stderr handle"))?;

        let channels = TransportChannels::new();

        let reader_channels = channels.clone();
        tokio::spawn(async move {
            pump_lines(BufReader::new(stdout), reader_channels, "stdio client").await;
        });

        let stderr_command = options.command.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!("[{stderr_command} stderr] {line}");
            }
        });

        Ok(Self {
            channels,
            child: Mutex::new(Some(child)),
            stdin_writer: Mutex::new(Some(BufWriter::new(stdin))),
            command: options.command,
        })
    }
}

#[async_trait::async_trait]
impl Transport for StdioClientTransport {
    fn inbound(&self) -> broadcast::Receiver<InboundEvent> {
        self.channels.inbound_tx.subscribe()
    }

    async fn send(&self, message: &str) -> BridgeResult<()> {
        let mut guard = self.stdin_writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| BridgeError::transport_closed("stdio client transport is closed"))?;
        tracing::trace!("stdio client sending: {message}");
        write_frame(writer, message).await
    }

    async fn close(&self) -> BridgeResult<()> {
        if self.channels.is_closed() && self.child.lock().await.is_none() {
            return Ok(());
        }
        tracing::debug!("closing stdio client transport for '{}'", self.command);

        // Close stdin first to let the child exit on its own.
        if let Some(mut writer) = self.stdin_writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }

        if let Some(mut child) = self.child.lock().await.take() {
            match timeout(CHILD_EXIT_GRACE, child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::debug!("child process exited with status: {status}");
                }
                Ok(Err(e)) => {
                    tracing::warn!("error waiting for child process: {e}");
                }
                Err(_) => {
                    tracing::warn!("timeout waiting for child process, killing it");
                    let _ = child.kill().await;
                }
            }
        }

        self.channels.mark_closed();
        Ok(())
    }

    fn closed(&self) -> WaitForCancellationFutureOwned {
        self.channels.closed.clone().cancelled_owned()
    }

    fn describe(&self) -> String {
        format!(
            "stdio client transport ('{}', closed: {})",
            self.command,
            self.channels.is_closed()
        )
    }
}

impl Drop for StdioClientTransport {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.child.try_lock() {
            if let Some(child) = guard.as_mut() {
                let _ = child.start_kill();
            }
        }
    }
}
