//! The transport contract and the line-oriented reference bindings.
//!
//! A transport is a bidirectional framed message pipe: `connect` hands it a
//! sink that receives whole decoded envelopes in arrival order, `send` puts
//! one envelope on the wire, and `close` drains and releases resources.
//! Inbound delivery is strictly sequential; outbound ordering is preserved
//! because the endpoint serializes `send` calls.

use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;

use crate::message::{Malformed, Message, INVALID_REQUEST};
use crate::Error;

/// Inbound sink: each item is either a classified envelope or a malformed one
/// that the endpoint may still answer.
pub type MessageSink = mpsc::Sender<Result<Message, Malformed>>;

#[async_trait]
pub trait Transport: Send + 'static {
    /// Starts inbound delivery into `sink`. Completes when the transport is
    /// ready to carry traffic. Called exactly once.
    async fn connect(&mut self, sink: MessageSink) -> Result<(), Error>;

    /// Completes when the envelope has been handed to the wire.
    async fn send(&mut self, message: &Message) -> Result<(), Error>;

    /// Drains and releases resources. Idempotent.
    async fn close(&mut self) -> Result<(), Error>;
}

#[derive(Debug, Clone)]
pub struct Limits {
    /// Maximum bytes for a single JSON-RPC message (one line or SSE event).
    pub max_message_bytes: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            // Large enough for typical MCP messages, but bounded to reduce DoS risk.
            max_message_bytes: 16 * 1024 * 1024,
        }
    }
}

/// Newline-delimited JSON over an arbitrary `AsyncRead`/`AsyncWrite` pair.
///
/// This is the framing shared by the stdio binding and by in-memory duplex
/// pipes in tests.
pub struct IoTransport<R, W> {
    read: Option<R>,
    write: W,
    limits: Limits,
    reader_task: Option<tokio::task::JoinHandle<()>>,
    invalid_json_lines: Arc<AtomicU64>,
}

impl<R, W> IoTransport<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(read: R, write: W) -> Self {
        Self::with_limits(read, write, Limits::default())
    }

    pub fn with_limits(read: R, write: W, limits: Limits) -> Self {
        Self {
            read: Some(read),
            write,
            limits,
            reader_task: None,
            invalid_json_lines: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Number of inbound lines that were not valid JSON (counted, then dropped).
    pub fn invalid_json_lines(&self) -> u64 {
        self.invalid_json_lines.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl<R, W> Transport for IoTransport<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn connect(&mut self, sink: MessageSink) -> Result<(), Error> {
        let read = self
            .read
            .take()
            .ok_or_else(|| Error::InvalidInput("transport already connected".to_string()))?;
        self.reader_task = Some(tokio::spawn(read_loop(
            read,
            sink,
            self.limits.clone(),
            self.invalid_json_lines.clone(),
        )));
        Ok(())
    }

    async fn send(&mut self, message: &Message) -> Result<(), Error> {
        let mut line = serde_json::to_string(&message.to_value())?;
        line.push('\n');
        self.write.write_all(line.as_bytes()).await?;
        self.write.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), Error> {
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        let _ = self.write.shutdown().await;
        Ok(())
    }
}

async fn read_loop<R>(
    read: R,
    sink: MessageSink,
    limits: Limits,
    invalid_json_lines: Arc<AtomicU64>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    let max_message_bytes = limits.max_message_bytes.max(1);
    let mut reader = tokio::io::BufReader::new(read);
    loop {
        match read_line_limited(&mut reader, max_message_bytes).await {
            Ok(Some(line)) => {
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                let value: Value = match serde_json::from_slice(&line) {
                    Ok(value) => value,
                    Err(err) => {
                        invalid_json_lines.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(error = %err, "dropping inbound line that is not valid JSON");
                        continue;
                    }
                };
                if deliver(&sink, value).await.is_err() {
                    // Receiver gone: the endpoint is shutting down.
                    return;
                }
            }
            Ok(None) => return,
            Err(err) => {
                tracing::warn!(error = %err, "transport read failed");
                return;
            }
        }
    }
}

/// Flattens JSON-RPC batch arrays in arrival order; single objects pass through.
async fn deliver(sink: &MessageSink, value: Value) -> Result<(), ()> {
    match value {
        Value::Array(items) if items.is_empty() => sink
            .send(Err(Malformed {
                id: None,
                raw_id: None,
                code: INVALID_REQUEST,
                message: "empty batch".to_string(),
            }))
            .await
            .map_err(drop),
        Value::Array(items) => {
            for item in items {
                sink.send(Message::from_value(item)).await.map_err(drop)?;
            }
            Ok(())
        }
        other => sink.send(Message::from_value(other)).await.map_err(drop),
    }
}

/// Reads one `\n`-terminated line, failing if it exceeds `max_bytes`.
/// Returns `None` at EOF. The trailing `\n` (and `\r`) are stripped.
pub(crate) async fn read_line_limited<R: tokio::io::AsyncBufRead + Unpin>(
    reader: &mut R,
    max_bytes: usize,
) -> Result<Option<Vec<u8>>, std::io::Error> {
    use tokio::io::AsyncBufReadExt;

    let mut buf = Vec::new();
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            if buf.is_empty() {
                return Ok(None);
            }
            break;
        }

        let newline_pos = available.iter().position(|b| *b == b'\n');
        let take = newline_pos
            .map(|idx| idx.saturating_add(1))
            .unwrap_or(available.len());
        if buf.len().saturating_add(take) > max_bytes {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "json-rpc message too large",
            ));
        }
        buf.extend_from_slice(&available[..take]);
        reader.consume(take);

        if newline_pos.is_some() {
            break;
        }
    }

    if buf.ends_with(b"\n") {
        buf.pop();
        if buf.ends_with(b"\r") {
            buf.pop();
        }
    }

    Ok(Some(buf))
}

#[derive(Debug, Clone)]
pub struct StdioOptions {
    pub limits: Limits,
    /// How long `close` waits for the child to exit after its stdin is closed
    /// before killing it, and again after the kill signal.
    pub kill_grace: Duration,
}

impl Default for StdioOptions {
    fn default() -> Self {
        Self {
            limits: Limits::default(),
            kill_grace: Duration::from_secs(2),
        }
    }
}

/// Spawned child process speaking newline-delimited JSON on stdin/stdout.
///
/// stderr is inherited. The child is killed if the transport is dropped
/// without a `close`.
pub struct StdioTransport {
    command: Option<Command>,
    options: StdioOptions,
    child: Option<Child>,
    io: Option<IoTransport<ChildStdout, ChildStdin>>,
}

impl StdioTransport {
    pub fn new(
        program: impl AsRef<std::ffi::OsStr>,
        args: impl IntoIterator<Item = std::ffi::OsString>,
    ) -> Self {
        let mut command = Command::new(program);
        command.args(args);
        command.stderr(Stdio::inherit());
        Self::from_command(command)
    }

    pub fn from_command(command: Command) -> Self {
        Self {
            command: Some(command),
            options: StdioOptions::default(),
            child: None,
            io: None,
        }
    }

    pub fn with_options(mut self, options: StdioOptions) -> Self {
        self.options = options;
        self
    }

    pub fn child_id(&self) -> Option<u32> {
        self.child.as_ref().and_then(|child| child.id())
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn connect(&mut self, sink: MessageSink) -> Result<(), Error> {
        let mut command = self
            .command
            .take()
            .ok_or_else(|| Error::InvalidInput("transport already connected".to_string()))?;
        command.stdin(Stdio::piped());
        command.stdout(Stdio::piped());
        command.kill_on_drop(true);

        let mut child = command.spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Transport("child stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Transport("child stdout not captured".to_string()))?;

        let mut io = IoTransport::with_limits(stdout, stdin, self.options.limits.clone());
        io.connect(sink).await?;
        self.io = Some(io);
        self.child = Some(child);
        Ok(())
    }

    async fn send(&mut self, message: &Message) -> Result<(), Error> {
        let io = self
            .io
            .as_mut()
            .ok_or_else(|| Error::Transport("stdio transport not connected".to_string()))?;
        io.send(message).await
    }

    async fn close(&mut self) -> Result<(), Error> {
        if let Some(mut io) = self.io.take() {
            let _ = io.close().await;
            // `ChildStdin` only fully closes on drop; dropping `io` signals EOF
            // to the child.
        }

        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        let grace = self.options.kill_grace;
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(status) => {
                status?;
            }
            Err(_) => {
                let child_id = child.id();
                if let Err(err) = child.start_kill() {
                    tracing::warn!(?child_id, error = %err, "failed to kill child process");
                }
                if tokio::time::timeout(grace, child.wait()).await.is_err() {
                    tracing::warn!(?child_id, "child process did not exit after kill");
                }
            }
        }
        Ok(())
    }
}
