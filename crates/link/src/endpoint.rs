//! The bidirectional endpoint: request correlation and inbound dispatch.
//!
//! One endpoint owns one transport. Outbound requests mint monotonically
//! increasing integer ids (seeded at 0) and park a oneshot awaiter keyed by
//! id; a single inbound task classifies everything the transport delivers and
//! either completes an awaiter, queues a server-initiated request, or queues
//! a notification. Every awaiter is resolved exactly once: by a response, an
//! error response, a timeout, a cancellation, or shutdown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::message::{Id, Malformed, Message, RpcError, METHOD_NOT_FOUND, SERVER_OVERLOADED};
use crate::transport::Transport;
use crate::Error;

/// Sent (best effort) whenever a parked request is abandoned locally, so the
/// peer can stop working on it.
pub const CANCELLED_NOTIFICATION_METHOD: &str = "notifications/cancelled";

#[derive(Debug, Clone)]
pub struct EndpointOptions {
    /// Capacity of the transport-to-endpoint channel.
    pub inbound_buffer: usize,
    /// Maximum buffered server->client requests.
    pub requests_capacity: usize,
    /// Maximum buffered notifications from the peer.
    pub notifications_capacity: usize,
}

impl Default for EndpointOptions {
    fn default() -> Self {
        Self {
            inbound_buffer: 64,
            requests_capacity: 64,
            notifications_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EndpointStats {
    /// Responses whose id matched no parked awaiter (dropped, session continues).
    pub unknown_response_ids: u64,
    pub dropped_notifications_full: u64,
    pub dropped_notifications_closed: u64,
    /// Malformed envelopes without a recoverable id (dropped with a log entry).
    pub malformed_dropped: u64,
}

#[derive(Debug, Default)]
struct StatsInner {
    unknown_response_ids: AtomicU64,
    dropped_notifications_full: AtomicU64,
    dropped_notifications_closed: AtomicU64,
    malformed_dropped: AtomicU64,
}

impl StatsInner {
    fn snapshot(&self) -> EndpointStats {
        EndpointStats {
            unknown_response_ids: self.unknown_response_ids.load(Ordering::Relaxed),
            dropped_notifications_full: self.dropped_notifications_full.load(Ordering::Relaxed),
            dropped_notifications_closed: self.dropped_notifications_closed.load(Ordering::Relaxed),
            malformed_dropped: self.malformed_dropped.load(Ordering::Relaxed),
        }
    }
}

type PendingMap = Mutex<HashMap<Id, oneshot::Sender<Result<Value, Error>>>>;

struct Shared {
    transport: tokio::sync::Mutex<Box<dyn Transport>>,
    next_id: AtomicI64,
    pending: PendingMap,
    closed: AtomicBool,
    close_reason: Mutex<Option<String>>,
    stats: StatsInner,
}

/// Cloneable handle used to issue requests and write responses.
#[derive(Clone)]
pub struct EndpointHandle {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for EndpointHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointHandle").finish_non_exhaustive()
    }
}

pub struct Endpoint {
    handle: EndpointHandle,
    requests_rx: Option<mpsc::Receiver<IncomingRequest>>,
    notifications_rx: Option<mpsc::Receiver<Notification>>,
    dispatch_task: tokio::task::JoinHandle<()>,
}

#[derive(Debug, Clone)]
pub struct Notification {
    pub method: String,
    pub params: Option<Value>,
}

/// A server-initiated request, carrying its responder.
#[derive(Debug, Clone)]
pub struct IncomingRequest {
    pub id: Id,
    pub method: String,
    pub params: Option<Value>,
    responder: EndpointHandle,
}

impl IncomingRequest {
    pub async fn respond_ok(&self, result: Value) -> Result<(), Error> {
        self.responder.respond_ok(self.id.clone(), result).await
    }

    pub async fn respond_error(
        &self,
        code: i64,
        message: impl Into<String>,
        data: Option<Value>,
    ) -> Result<(), Error> {
        self.responder
            .respond_error(self.id.clone(), code, message, data)
            .await
    }
}

impl Endpoint {
    /// Connects the transport and starts the inbound dispatch task.
    pub async fn connect<T: Transport>(
        transport: T,
        options: EndpointOptions,
    ) -> Result<Endpoint, Error> {
        let (sink_tx, sink_rx) = mpsc::channel(options.inbound_buffer.max(1));
        let mut transport: Box<dyn Transport> = Box::new(transport);
        transport.connect(sink_tx).await?;

        let (request_tx, requests_rx) = mpsc::channel(options.requests_capacity.max(1));
        let (notify_tx, notifications_rx) = mpsc::channel(options.notifications_capacity.max(1));

        let handle = EndpointHandle {
            shared: Arc::new(Shared {
                transport: tokio::sync::Mutex::new(transport),
                next_id: AtomicI64::new(0),
                pending: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
                close_reason: Mutex::new(None),
                stats: StatsInner::default(),
            }),
        };

        let dispatch_task = tokio::spawn(dispatch_loop(
            sink_rx,
            handle.clone(),
            request_tx,
            notify_tx,
        ));

        Ok(Endpoint {
            handle,
            requests_rx: Some(requests_rx),
            notifications_rx: Some(notifications_rx),
            dispatch_task,
        })
    }

    pub fn handle(&self) -> EndpointHandle {
        self.handle.clone()
    }

    pub fn take_requests(&mut self) -> Option<mpsc::Receiver<IncomingRequest>> {
        self.requests_rx.take()
    }

    pub fn take_notifications(&mut self) -> Option<mpsc::Receiver<Notification>> {
        self.notifications_rx.take()
    }

    /// Closes the endpoint: fails every parked awaiter with `reason` and
    /// closes the transport. Calling this twice is a no-op the second time.
    pub async fn close(&mut self, reason: impl Into<String>) {
        self.handle.close(reason).await;
        self.dispatch_task.abort();
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.dispatch_task.abort();
        self.handle.mark_closed("endpoint dropped");
        drain_pending(
            &self.handle.shared.pending,
            &Error::Closed {
                reason: "endpoint dropped".to_string(),
            },
        );
    }
}

impl EndpointHandle {
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Relaxed)
    }

    pub fn close_reason(&self) -> Option<String> {
        self.shared
            .close_reason
            .lock()
            .ok()
            .and_then(|guard| guard.clone())
    }

    pub fn stats(&self) -> EndpointStats {
        self.shared.stats.snapshot()
    }

    fn check_closed(&self) -> Result<(), Error> {
        if !self.is_closed() {
            return Ok(());
        }
        let reason = self
            .close_reason()
            .unwrap_or_else(|| "endpoint closed".to_string());
        Err(Error::Closed { reason })
    }

    /// Returns true when this call transitioned the endpoint to closed.
    fn mark_closed(&self, reason: &str) -> bool {
        let first = !self.shared.closed.swap(true, Ordering::SeqCst);
        if first {
            if let Ok(mut guard) = self.shared.close_reason.lock() {
                if guard.is_none() {
                    *guard = Some(reason.to_string());
                }
            }
        }
        first
    }

    /// Fails every parked awaiter with `reason` and closes the transport.
    pub async fn close(&self, reason: impl Into<String>) {
        let reason = reason.into();
        if !self.mark_closed(&reason) {
            return;
        }
        drain_pending(
            &self.shared.pending,
            &Error::Closed {
                reason: reason.clone(),
            },
        );
        let mut transport = self.shared.transport.lock().await;
        let _ = transport.close().await;
    }

    async fn send_message(&self, message: &Message) -> Result<(), Error> {
        self.check_closed()?;
        let result = {
            let mut transport = self.shared.transport.lock().await;
            transport.send(message).await
        };
        if let Err(err) = result {
            self.close(format!("transport failed: {err}")).await;
            return Err(err);
        }
        Ok(())
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), Error> {
        self.send_message(&Message::notification(method, params))
            .await
    }

    pub async fn respond_ok(&self, id: Id, result: Value) -> Result<(), Error> {
        self.send_message(&Message::response(id, result)).await
    }

    pub async fn respond_error(
        &self,
        id: Id,
        code: i64,
        message: impl Into<String>,
        data: Option<Value>,
    ) -> Result<(), Error> {
        let mut error = RpcError::new(code, message);
        if let Some(data) = data {
            error = error.with_data(data);
        }
        self.send_message(&Message::error(id, error)).await
    }

    /// Writes an error response echoing a verbatim wire id, normalized to
    /// `null` when it is not a valid request id. Used for malformed
    /// request-shaped envelopes whose id could not be parsed.
    pub async fn respond_error_raw_id(
        &self,
        raw: Value,
        code: i64,
        message: impl Into<String>,
        data: Option<Value>,
    ) -> Result<(), Error> {
        let mut error = RpcError::new(code, message);
        if let Some(data) = data {
            error = error.with_data(data);
        }
        let id = crate::message::parse_id(&raw);
        self.send_message(&Message::Error { id, error }).await
    }

    /// Issues a request and waits for its correlated response.
    ///
    /// On expiry the awaiter is removed, a best-effort
    /// `notifications/cancelled` is sent for the id, and the caller gets
    /// [`Error::Timeout`]. Dropping the returned future mid-flight removes the
    /// awaiter and sends the same notification with reason `"cancelled"`.
    pub async fn request_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, Error> {
        self.check_closed()?;
        let id = Id::Integer(self.shared.next_id.fetch_add(1, Ordering::Relaxed));

        let (tx, mut rx) = oneshot::channel::<Result<Value, Error>>();
        {
            let mut pending = lock_pending(&self.shared.pending);
            pending.insert(id.clone(), tx);
        }
        let mut guard = PendingGuard::new(self.clone(), id.clone());

        let message = Message::request(id.clone(), method, params);
        if let Err(err) = self.send_message(&message).await {
            guard.disarm();
            self.remove_pending(&id);
            return Err(err);
        }

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(result)) => {
                guard.disarm();
                result
            }
            Ok(Err(_)) => {
                guard.disarm();
                Err(Error::Closed {
                    reason: self
                        .close_reason()
                        .unwrap_or_else(|| "response channel closed".to_string()),
                })
            }
            Err(_) => {
                guard.disarm();
                if self.remove_pending(&id).is_some() {
                    self.send_cancelled(&id, "timeout").await;
                    Err(Error::Timeout {
                        method: method.to_string(),
                        timeout,
                    })
                } else {
                    // The completion raced ahead of the deadline and already
                    // resolved the awaiter; honour whichever value it sent.
                    match rx.try_recv() {
                        Ok(result) => result,
                        Err(_) => Err(Error::Timeout {
                            method: method.to_string(),
                            timeout,
                        }),
                    }
                }
            }
        }
    }

    /// Resolves a parked awaiter with a cancelled error. Used when the peer
    /// announces it will not answer a request. Returns false if the id was
    /// not parked.
    pub fn abort_pending(&self, id: &Id, reason: impl Into<String>) -> bool {
        match self.remove_pending(id) {
            Some(tx) => {
                let _ = tx.send(Err(Error::Cancelled {
                    reason: reason.into(),
                }));
                true
            }
            None => false,
        }
    }

    fn remove_pending(&self, id: &Id) -> Option<oneshot::Sender<Result<Value, Error>>> {
        let mut pending = lock_pending(&self.shared.pending);
        pending.remove(id)
    }

    async fn send_cancelled(&self, id: &Id, reason: &str) {
        let params = serde_json::json!({ "requestId": id, "reason": reason });
        if let Err(err) = self
            .notify(CANCELLED_NOTIFICATION_METHOD, Some(params))
            .await
        {
            tracing::debug!(%id, error = %err, "failed to send cancelled notification");
        }
    }

    fn complete(&self, id: &Id, outcome: Result<Value, Error>) {
        match self.remove_pending(id) {
            Some(tx) => {
                // The receiver may have been dropped concurrently; that is the
                // caller abandoning the request and is not an error here.
                let _ = tx.send(outcome);
            }
            None => {
                // Late response after a timeout or cancellation.
                self.shared
                    .stats
                    .unknown_response_ids
                    .fetch_add(1, Ordering::Relaxed);
                tracing::debug!(%id, "dropping response with unknown id");
            }
        }
    }
}

struct PendingGuard {
    handle: EndpointHandle,
    id: Id,
    armed: bool,
}

impl PendingGuard {
    fn new(handle: EndpointHandle, id: Id) -> Self {
        Self {
            handle,
            id,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if self.handle.remove_pending(&self.id).is_none() || self.handle.is_closed() {
            return;
        }
        // The caller dropped the request future mid-flight; tell the peer.
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let handle = self.handle.clone();
            let id = self.id.clone();
            runtime.spawn(async move {
                handle.send_cancelled(&id, "cancelled").await;
            });
        }
    }
}

async fn dispatch_loop(
    mut sink_rx: mpsc::Receiver<Result<Message, Malformed>>,
    handle: EndpointHandle,
    request_tx: mpsc::Sender<IncomingRequest>,
    notify_tx: mpsc::Sender<Notification>,
) {
    while let Some(item) = sink_rx.recv().await {
        match item {
            Ok(Message::Response { id, result }) => {
                handle.complete(&id, Ok(result));
            }
            Ok(Message::Error { id: Some(id), error }) => {
                handle.complete(
                    &id,
                    Err(Error::Rpc {
                        code: error.code,
                        message: error.message,
                        data: error.data,
                    }),
                );
            }
            Ok(Message::Error { id: None, error }) => {
                // The peer rejected something it could not attribute to a
                // request; nothing to correlate.
                handle
                    .shared
                    .stats
                    .unknown_response_ids
                    .fetch_add(1, Ordering::Relaxed);
                tracing::warn!(code = error.code, message = %error.message, "peer error without id");
            }
            Ok(Message::Request { id, method, params }) => {
                let request = IncomingRequest {
                    id: id.clone(),
                    method,
                    params,
                    responder: handle.clone(),
                };
                match request_tx.try_send(request) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        let _ = handle
                            .respond_error(id, SERVER_OVERLOADED, "client overloaded", None)
                            .await;
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        let _ = handle
                            .respond_error(
                                id,
                                METHOD_NOT_FOUND,
                                "no request handler installed",
                                None,
                            )
                            .await;
                    }
                }
            }
            Ok(Message::Notification { method, params }) => {
                match notify_tx.try_send(Notification { method, params }) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(note)) => {
                        handle
                            .shared
                            .stats
                            .dropped_notifications_full
                            .fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(
                            method = %note.method,
                            "inbound notification queue full; dropping"
                        );
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        handle
                            .shared
                            .stats
                            .dropped_notifications_closed
                            .fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            Err(malformed) => {
                // A malformed response to one of our requests fails that
                // awaiter; anything else gets an error reply when an id (even
                // an invalid one, echoed verbatim) can be recovered.
                if let Some(id) = malformed.id {
                    if let Some(tx) = handle.remove_pending(&id) {
                        let _ = tx.send(Err(Error::InvalidMessage(malformed.message)));
                    } else {
                        let _ = handle
                            .respond_error(id, malformed.code, malformed.message, None)
                            .await;
                    }
                } else if let Some(raw) = malformed.raw_id {
                    let _ = handle
                        .respond_error_raw_id(raw, malformed.code, malformed.message, None)
                        .await;
                } else {
                    handle
                        .shared
                        .stats
                        .malformed_dropped
                        .fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(reason = %malformed.message, "dropping malformed message");
                }
            }
        }
    }

    // Transport delivery ended (EOF or failure).
    handle.close("connection closed").await;
}

fn lock_pending(
    pending: &PendingMap,
) -> std::sync::MutexGuard<'_, HashMap<Id, oneshot::Sender<Result<Value, Error>>>> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn drain_pending(pending: &PendingMap, err: &Error) {
    let drained = {
        let mut pending = lock_pending(pending);
        std::mem::take(&mut *pending)
    };

    for (_id, tx) in drained {
        let _ = tx.send(Err(err.clone_for_drain()));
    }
}
