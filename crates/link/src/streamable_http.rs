//! "Streamable HTTP" transport: HTTP POST for outbound messages plus a
//! long-lived SSE GET stream for server-initiated traffic.
//!
//! Outbound requests are POSTed one at a time. The response may be a JSON
//! body (delivered straight into the sink), an SSE stream scoped to that
//! request (pumped in a background task until `[DONE]` or EOF), or
//! `202 Accepted` (no payload; typical for notifications). Per-request HTTP
//! failures are bridged into JSON-RPC error responses for the posted id, so
//! one bad exchange does not tear the session down; losing the SSE stream is
//! terminal and surfaces on the next `send`.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio_util::io::StreamReader;

use crate::message::{Message, RpcError};
use crate::transport::{read_line_limited, Limits, MessageSink, Transport};
use crate::Error;

const HTTP_TRANSPORT_ERROR: i64 = -32000;
const SESSION_ID_HEADER: &str = "mcp-session-id";

#[derive(Debug, Clone)]
pub struct StreamableHttpOptions {
    /// Extra HTTP headers to include on all requests.
    pub headers: HashMap<String, String>,
    /// Optional timeout applied while establishing HTTP connections.
    pub connect_timeout: Option<Duration>,
    /// Optional timeout applied to individual POST request/response bodies.
    ///
    /// Note: do not use this to limit the long-lived SSE connection.
    pub request_timeout: Option<Duration>,
    /// Whether to follow HTTP redirects (default: false, to reduce SSRF risk).
    pub follow_redirects: bool,
}

impl Default for StreamableHttpOptions {
    fn default() -> Self {
        Self {
            headers: HashMap::new(),
            connect_timeout: Some(Duration::from_secs(10)),
            request_timeout: None,
            follow_redirects: false,
        }
    }
}

pub struct StreamableHttpTransport {
    sse_url: String,
    post_url: String,
    options: StreamableHttpOptions,
    limits: Limits,
    http: Option<reqwest::Client>,
    sink: Option<MessageSink>,
    session_id: Arc<Mutex<Option<String>>>,
    failure: Arc<std::sync::Mutex<Option<String>>>,
    sse_wake: Option<mpsc::Sender<()>>,
    sse_task: Option<tokio::task::JoinHandle<()>>,
    pump_tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl StreamableHttpTransport {
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        Self::split(url.clone(), url)
    }

    /// Separate SSE and POST endpoints (some servers split them).
    pub fn split(sse_url: impl Into<String>, post_url: impl Into<String>) -> Self {
        Self {
            sse_url: sse_url.into(),
            post_url: post_url.into(),
            options: StreamableHttpOptions::default(),
            limits: Limits::default(),
            http: None,
            sink: None,
            session_id: Arc::new(Mutex::new(None)),
            failure: Arc::new(std::sync::Mutex::new(None)),
            sse_wake: None,
            sse_task: None,
            pump_tasks: Vec::new(),
        }
    }

    pub fn with_options(mut self, options: StreamableHttpOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    fn check_failed(&self) -> Result<(), Error> {
        let guard = self
            .failure
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match guard.as_ref() {
            Some(reason) => Err(Error::Transport(reason.clone())),
            None => Ok(()),
        }
    }

    fn build_http_client(&self) -> Result<reqwest::Client, Error> {
        let mut headers = reqwest::header::HeaderMap::new();
        for (key, value) in &self.options.headers {
            let name = reqwest::header::HeaderName::from_bytes(key.as_bytes())
                .map_err(|_| Error::InvalidInput(format!("invalid http header name: {key}")))?;
            let value = reqwest::header::HeaderValue::from_str(value)
                .map_err(|_| Error::InvalidInput(format!("invalid http header value: {key}")))?;
            headers.insert(name, value);
        }

        let mut builder = reqwest::Client::builder()
            // Avoid automatic proxy environment variable loading by default.
            .no_proxy()
            .redirect(if self.options.follow_redirects {
                reqwest::redirect::Policy::limited(10)
            } else {
                reqwest::redirect::Policy::none()
            })
            .default_headers(headers);
        if let Some(timeout) = self.options.connect_timeout {
            builder = builder.connect_timeout(timeout);
        }
        builder
            .build()
            .map_err(|err| Error::InvalidInput(format!("build http client failed: {err}")))
    }
}

#[async_trait]
impl Transport for StreamableHttpTransport {
    async fn connect(&mut self, sink: MessageSink) -> Result<(), Error> {
        if self.sink.is_some() {
            return Err(Error::InvalidInput("transport already connected".to_string()));
        }
        let http = self.build_http_client()?;

        let (sse_wake_tx, sse_wake_rx) = mpsc::channel::<()>(1);
        let sse_resp = try_connect_sse(
            &http,
            &self.sse_url,
            self.options.connect_timeout,
            &self.session_id,
        )
        .await?;

        let ctx = SseContext {
            http: http.clone(),
            sse_url: self.sse_url.clone(),
            connect_timeout: self.options.connect_timeout,
            session_id: self.session_id.clone(),
            sink: sink.clone(),
            max_message_bytes: self.limits.max_message_bytes,
            failure: self.failure.clone(),
        };
        self.sse_task = Some(tokio::spawn(ctx.run(sse_resp, sse_wake_rx)));

        self.http = Some(http);
        self.sink = Some(sink);
        self.sse_wake = Some(sse_wake_tx);
        Ok(())
    }

    async fn send(&mut self, message: &Message) -> Result<(), Error> {
        self.check_failed()?;
        self.pump_tasks.retain(|task| !task.is_finished());

        let (http, sink) = match (self.http.as_ref(), self.sink.as_ref()) {
            (Some(http), Some(sink)) => (http.clone(), sink.clone()),
            _ => return Err(Error::Transport("http transport not connected".to_string())),
        };
        let body = serde_json::to_vec(&message.to_value())?;
        let id = message.id().cloned();

        let mut req = http
            .post(&self.post_url)
            .header(
                reqwest::header::ACCEPT,
                "application/json, text/event-stream",
            )
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body);
        if let Some(session) = self.session_id.lock().await.clone() {
            req = req.header(SESSION_ID_HEADER, session);
        }

        let send = req.send();
        let resp = match self.options.request_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, send).await {
                Ok(resp) => resp,
                Err(_) => {
                    bridge_error(&sink, id, "http request timed out".to_string(), None).await;
                    return Ok(());
                }
            },
            None => send.await,
        };
        let resp = match resp {
            Ok(resp) => resp,
            Err(err) => {
                bridge_error(
                    &sink,
                    id,
                    format!("http request failed: {}", redact_reqwest_error(&err)),
                    None,
                )
                .await;
                return Ok(());
            }
        };

        let mut should_wake_sse = resp.status() == reqwest::StatusCode::ACCEPTED;
        if let Some(value) = resp.headers().get(SESSION_ID_HEADER) {
            if let Ok(value) = value.to_str() {
                let mut guard = self.session_id.lock().await;
                let was_none = guard.is_none();
                *guard = Some(value.to_string());
                if was_none {
                    should_wake_sse = true;
                }
            }
        }
        if should_wake_sse {
            if let Some(wake) = &self.sse_wake {
                let _ = wake.try_send(());
            }
        }

        let status = resp.status();
        if !status.is_success() {
            bridge_error(&sink, id, format!("http error: {status}"), None).await;
            return Ok(());
        }

        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();

        if content_type.starts_with("text/event-stream") {
            // A per-request SSE stream: pump it off-path so `send` completes
            // once the envelope is on the wire.
            let sink = sink.clone();
            let max_message_bytes = self.limits.max_message_bytes;
            let request_timeout = self.options.request_timeout;
            self.pump_tasks.push(tokio::spawn(async move {
                let pump = pump_sse_response(resp, &sink, max_message_bytes, true);
                let result = match request_timeout {
                    Some(timeout) => match tokio::time::timeout(timeout, pump).await {
                        Ok(result) => result,
                        Err(_) => Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "http response stream timed out",
                        )),
                    },
                    None => pump.await,
                };
                if let Err(err) = result {
                    bridge_error(&sink, id, format!("http response stream failed: {err}"), None)
                        .await;
                }
            }));
            return Ok(());
        }

        let is_json = content_type.is_empty()
            || content_type.starts_with("application/json")
            || (content_type.starts_with("application/") && content_type.contains("+json"));
        if !is_json {
            bridge_error(
                &sink,
                id,
                "unexpected content-type for json response".to_string(),
                Some(serde_json::json!({ "content_type": content_type })),
            )
            .await;
            return Ok(());
        }

        let read = resp.bytes();
        let body = match self.options.request_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, read).await {
                Ok(body) => body,
                Err(_) => {
                    bridge_error(&sink, id, "http response timed out".to_string(), None).await;
                    return Ok(());
                }
            },
            None => read.await,
        };
        match body {
            Ok(body) if body.is_empty() => {
                if status != reqwest::StatusCode::ACCEPTED && id.is_some() {
                    bridge_error(&sink, id, "http response is empty".to_string(), None).await;
                }
            }
            Ok(body) => {
                if body.len() > self.limits.max_message_bytes {
                    bridge_error(
                        &sink,
                        id,
                        "http response too large".to_string(),
                        Some(serde_json::json!({
                            "max_bytes": self.limits.max_message_bytes,
                            "actual_bytes": body.len(),
                        })),
                    )
                    .await;
                    return Ok(());
                }
                match serde_json::from_slice::<Value>(&body) {
                    Ok(value) => {
                        deliver_value(&sink, value).await;
                    }
                    Err(_) => {
                        bridge_error(&sink, id, "http response is not valid json".to_string(), None)
                            .await;
                    }
                }
            }
            Err(err) => {
                bridge_error(
                    &sink,
                    id,
                    format!("http response read failed: {}", redact_reqwest_error(&err)),
                    None,
                )
                .await;
            }
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), Error> {
        if let Some(task) = self.sse_task.take() {
            task.abort();
        }
        for task in self.pump_tasks.drain(..) {
            task.abort();
        }
        self.sink = None;
        self.http = None;
        self.sse_wake = None;
        Ok(())
    }
}

impl Drop for StreamableHttpTransport {
    fn drop(&mut self) {
        if let Some(task) = self.sse_task.take() {
            task.abort();
        }
        for task in self.pump_tasks.drain(..) {
            task.abort();
        }
    }
}

struct SseContext {
    http: reqwest::Client,
    sse_url: String,
    connect_timeout: Option<Duration>,
    session_id: Arc<Mutex<Option<String>>>,
    sink: MessageSink,
    max_message_bytes: usize,
    failure: Arc<std::sync::Mutex<Option<String>>>,
}

impl SseContext {
    async fn run(self, initial: Option<reqwest::Response>, mut wake_rx: mpsc::Receiver<()>) {
        let resp = match initial {
            Some(resp) => Some(resp),
            None => {
                // The server answered 405 on the first GET: it will only open
                // the stream once a session exists. Wait to be woken by the
                // POST path.
                let mut connected = None;
                while wake_rx.recv().await.is_some() {
                    match try_connect_sse(
                        &self.http,
                        &self.sse_url,
                        self.connect_timeout,
                        &self.session_id,
                    )
                    .await
                    {
                        Ok(Some(resp)) => {
                            connected = Some(resp);
                            break;
                        }
                        Ok(None) => continue,
                        Err(err) => {
                            self.fail(format!("sse connection failed: {err}"));
                            return;
                        }
                    }
                }
                connected
            }
        };

        let Some(resp) = resp else {
            return;
        };

        match pump_sse_response(resp, &self.sink, self.max_message_bytes, false).await {
            Ok(()) => self.fail("sse connection closed".to_string()),
            Err(err) => self.fail(format!("sse connection failed: {err}")),
        }
    }

    fn fail(&self, reason: String) {
        tracing::warn!(%reason, "streamable http transport lost its event stream");
        let mut guard = self
            .failure
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if guard.is_none() {
            *guard = Some(reason);
        }
    }
}

async fn try_connect_sse(
    http: &reqwest::Client,
    sse_url: &str,
    connect_timeout: Option<Duration>,
    session_id: &Arc<Mutex<Option<String>>>,
) -> Result<Option<reqwest::Response>, Error> {
    let mut req = http
        .get(sse_url)
        .header(reqwest::header::ACCEPT, "text/event-stream");
    if let Some(session) = session_id.lock().await.clone() {
        req = req.header(SESSION_ID_HEADER, session);
    }

    let send = req.send();
    let resp = match connect_timeout {
        Some(timeout) => match tokio::time::timeout(timeout, send).await {
            Ok(resp) => resp,
            Err(_) => {
                return Err(Error::Transport(
                    "sse connect failed: request timed out".to_string(),
                ));
            }
        },
        None => send.await,
    }
    .map_err(|err| Error::Transport(format!("sse connect failed: {}", redact_reqwest_error(&err))))?;

    if resp.status() == reqwest::StatusCode::METHOD_NOT_ALLOWED {
        return Ok(None);
    }
    if !resp.status().is_success() {
        return Err(Error::Transport(format!(
            "sse connect failed: status={}",
            resp.status()
        )));
    }

    let content_type = resp
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !content_type.to_ascii_lowercase().starts_with("text/event-stream") {
        return Err(Error::Transport(format!(
            "sse connect failed: expected content-type text/event-stream, got {content_type}"
        )));
    }

    if let Some(value) = resp.headers().get(SESSION_ID_HEADER) {
        if let Ok(value) = value.to_str() {
            *session_id.lock().await = Some(value.to_string());
        }
    }

    Ok(Some(resp))
}

/// Reads SSE events from a response body and delivers each accumulated `data:`
/// payload as a JSON-RPC message.
async fn pump_sse_response(
    resp: reqwest::Response,
    sink: &MessageSink,
    max_message_bytes: usize,
    stop_on_done: bool,
) -> Result<(), io::Error> {
    let stream = resp.bytes_stream().map(|chunk| chunk.map_err(io::Error::other));
    let reader = StreamReader::new(stream);
    let mut reader = tokio::io::BufReader::new(reader);
    pump_sse_reader(&mut reader, sink, max_message_bytes, stop_on_done).await
}

async fn pump_sse_reader<R: tokio::io::AsyncBufRead + Unpin>(
    reader: &mut R,
    sink: &MessageSink,
    max_message_bytes: usize,
    stop_on_done: bool,
) -> Result<(), io::Error> {
    let mut data = Vec::new();
    loop {
        let line = read_line_limited(&mut *reader, max_message_bytes).await?;
        let Some(line) = line else {
            return Ok(());
        };

        if line.is_empty() {
            if data.is_empty() {
                continue;
            }
            if stop_on_done && data == b"[DONE]" {
                return Ok(());
            }
            match serde_json::from_slice::<Value>(&data) {
                Ok(value) => {
                    if !deliver_value(sink, value).await {
                        return Ok(());
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "dropping sse event that is not valid JSON");
                }
            }
            data.clear();
            continue;
        }

        if let Some(rest) = line.strip_prefix(b"data:") {
            let mut rest = rest;
            while rest.first().is_some_and(|b| b.is_ascii_whitespace()) {
                rest = &rest[1..];
            }

            if !data.is_empty() {
                data.push(b'\n');
            }
            if data.len().saturating_add(rest.len()) > max_message_bytes {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "sse event too large",
                ));
            }
            data.extend_from_slice(rest);
        }
    }
}

/// Returns false when the sink's receiver is gone.
async fn deliver_value(sink: &MessageSink, value: Value) -> bool {
    match value {
        Value::Array(items) => {
            for item in items {
                if sink.send(Message::from_value(item)).await.is_err() {
                    return false;
                }
            }
            true
        }
        other => sink.send(Message::from_value(other)).await.is_ok(),
    }
}

/// Synthesizes a JSON-RPC error response for a failed HTTP exchange so the
/// posted request's awaiter resolves; exchanges without an id are dropped.
async fn bridge_error(
    sink: &MessageSink,
    id: Option<crate::message::Id>,
    message: String,
    data: Option<Value>,
) {
    let Some(id) = id else {
        tracing::warn!(%message, "http exchange without id failed");
        return;
    };
    let mut error = RpcError::new(HTTP_TRANSPORT_ERROR, message);
    if let Some(data) = data {
        error = error.with_data(data);
    }
    let _ = sink.send(Ok(Message::error(id, error))).await;
}

fn redact_reqwest_error(err: &reqwest::Error) -> String {
    let mut msg = err.to_string();
    let Some(url) = err.url() else {
        return msg;
    };

    let full = url.as_str();
    let redacted = redact_url_for_error(url);
    msg = msg.replace(full, &redacted);
    msg
}

fn redact_url_for_error(url: &reqwest::Url) -> String {
    let mut url = url.clone();
    let _ = url.set_username("");
    let _ = url.set_password(None);
    url.set_path("/");
    url.set_query(None);
    url.set_fragment(None);
    url.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Id, Malformed};

    /// Runs the production SSE pump over an in-memory body.
    async fn pump_events(
        input: &str,
        max_bytes: usize,
        stop_on_done: bool,
    ) -> (Result<(), io::Error>, Vec<Result<Message, Malformed>>) {
        let (tx, mut rx) = mpsc::channel(16);
        let mut reader = tokio::io::BufReader::new(input.as_bytes());
        let result = pump_sse_reader(&mut reader, &tx, max_bytes, stop_on_done).await;
        drop(tx);

        let mut out = Vec::new();
        while let Some(item) = rx.recv().await {
            out.push(item);
        }
        (result, out)
    }

    #[tokio::test]
    async fn sse_data_events_become_messages() {
        let events = concat!(
            "event: message\n",
            "data: {\"jsonrpc\":\"2.0\",\"method\":\"demo/notify\",\"params\":{}}\n",
            "\n",
            "data: {\"jsonrpc\":\"2.0\",\"id\":3,\"result\":{}}\n",
            "\n",
        );
        let (result, delivered) = pump_events(events, 1024, false).await;
        result.unwrap();
        assert_eq!(delivered.len(), 2);
        assert_eq!(
            delivered[0].as_ref().unwrap().method(),
            Some("demo/notify")
        );
        assert!(matches!(
            delivered[1].as_ref().unwrap(),
            Message::Response { id: Id::Integer(3), .. }
        ));
    }

    #[tokio::test]
    async fn done_sentinel_stops_request_scoped_streams() {
        let events = concat!(
            "data: {\"jsonrpc\":\"2.0\",\"method\":\"first\"}\n",
            "\n",
            "data: [DONE]\n",
            "\n",
            "data: {\"jsonrpc\":\"2.0\",\"method\":\"after-done\"}\n",
            "\n",
        );
        let (result, delivered) = pump_events(events, 1024, true).await;
        result.unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].as_ref().unwrap().method(), Some("first"));
    }

    #[tokio::test]
    async fn done_sentinel_is_not_special_on_long_lived_streams() {
        let events = concat!(
            "data: [DONE]\n",
            "\n",
            "data: {\"jsonrpc\":\"2.0\",\"method\":\"after-done\"}\n",
            "\n",
        );
        let (result, delivered) = pump_events(events, 1024, false).await;
        result.unwrap();
        // `[DONE]` is not valid JSON and is dropped; the stream keeps going.
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].as_ref().unwrap().method(), Some("after-done"));
    }

    #[tokio::test]
    async fn oversized_event_fails_the_pump() {
        // Each data line fits the line limit, but the accumulated event does
        // not.
        let events = concat!(
            "data: aaaaaaaaaaaaaaaaaaaa\n",
            "data: bbbbbbbbbbbbbbbbbbbb\n",
            "\n",
        );
        let (result, delivered) = pump_events(events, 32, false).await;
        let err = result.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(err.to_string().contains("sse event too large"), "{err}");
        assert!(delivered.is_empty());
    }

    #[tokio::test]
    async fn bridge_error_resolves_posted_request() {
        let (tx, mut rx) = mpsc::channel(1);
        bridge_error(&tx, Some(Id::Integer(9)), "http error: 500".to_string(), None).await;
        let item = rx.recv().await.unwrap().unwrap();
        let Message::Error { id, error } = item else {
            panic!("expected error response");
        };
        assert_eq!(id, Some(Id::Integer(9)));
        assert_eq!(error.code, HTTP_TRANSPORT_ERROR);
    }
}
