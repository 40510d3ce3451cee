use std::time::Duration;

use mcp_link::{Endpoint, EndpointOptions, Error, Id, IoTransport};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};

struct Peer {
    lines: tokio::io::Lines<BufReader<ReadHalf<DuplexStream>>>,
    write: WriteHalf<DuplexStream>,
}

impl Peer {
    async fn read(&mut self) -> Value {
        let line = tokio::time::timeout(Duration::from_secs(2), self.lines.next_line())
            .await
            .expect("peer read timed out")
            .expect("peer read")
            .expect("peer stream open");
        serde_json::from_str(&line).expect("valid json")
    }

    async fn write(&mut self, value: Value) {
        let mut line = serde_json::to_string(&value).expect("serialize");
        line.push('\n');
        self.write.write_all(line.as_bytes()).await.expect("peer write");
        self.write.flush().await.expect("peer flush");
    }
}

async fn connect() -> (Endpoint, Peer) {
    connect_with(EndpointOptions::default()).await
}

async fn connect_with(options: EndpointOptions) -> (Endpoint, Peer) {
    let (client_stream, server_stream) = tokio::io::duplex(64 * 1024);
    let (client_read, client_write) = tokio::io::split(client_stream);
    let (server_read, server_write) = tokio::io::split(server_stream);

    let endpoint = Endpoint::connect(IoTransport::new(client_read, client_write), options)
        .await
        .expect("connect");
    let peer = Peer {
        lines: BufReader::new(server_read).lines(),
        write: server_write,
    };
    (endpoint, peer)
}

#[tokio::test]
async fn request_ids_start_at_zero_and_increase() {
    let (endpoint, mut peer) = connect().await;
    let handle = endpoint.handle();

    let first = tokio::spawn({
        let handle = handle.clone();
        async move {
            handle
                .request_with_timeout("ping", None, Duration::from_secs(1))
                .await
        }
    });
    let request = peer.read().await;
    assert_eq!(request["id"], 0);
    assert_eq!(request["method"], "ping");
    peer.write(json!({ "jsonrpc": "2.0", "id": 0, "result": {} }))
        .await;
    first.await.unwrap().unwrap();

    let second = tokio::spawn({
        let handle = handle.clone();
        async move {
            handle
                .request_with_timeout("ping", None, Duration::from_secs(1))
                .await
        }
    });
    let request = peer.read().await;
    assert_eq!(request["id"], 1);
    peer.write(json!({ "jsonrpc": "2.0", "id": 1, "result": {} }))
        .await;
    second.await.unwrap().unwrap();
}

#[tokio::test]
async fn responses_correlate_out_of_order() {
    let (endpoint, mut peer) = connect().await;
    let handle = endpoint.handle();

    let a = tokio::spawn({
        let handle = handle.clone();
        async move {
            handle
                .request_with_timeout("a", None, Duration::from_secs(2))
                .await
        }
    });
    let req_a = peer.read().await;
    let b = tokio::spawn({
        let handle = handle.clone();
        async move {
            handle
                .request_with_timeout("b", None, Duration::from_secs(2))
                .await
        }
    });
    let req_b = peer.read().await;

    // Answer the second request first.
    peer.write(json!({ "jsonrpc": "2.0", "id": req_b["id"], "result": { "which": "b" } }))
        .await;
    peer.write(json!({ "jsonrpc": "2.0", "id": req_a["id"], "result": { "which": "a" } }))
        .await;

    assert_eq!(b.await.unwrap().unwrap()["which"], "b");
    assert_eq!(a.await.unwrap().unwrap()["which"], "a");
}

#[tokio::test]
async fn error_response_surfaces_code_message_data() {
    let (endpoint, mut peer) = connect().await;
    let handle = endpoint.handle();

    let call = tokio::spawn({
        let handle = handle.clone();
        async move {
            handle
                .request_with_timeout("tools/call", Some(json!({ "name": "x" })), Duration::from_secs(1))
                .await
        }
    });
    let request = peer.read().await;
    peer.write(json!({
        "jsonrpc": "2.0",
        "id": request["id"],
        "error": { "code": -32602, "message": "bad params", "data": { "field": "name" } },
    }))
    .await;

    let err = call.await.unwrap().unwrap_err();
    match err {
        Error::Rpc { code, message, data } => {
            assert_eq!(code, -32602);
            assert_eq!(message, "bad params");
            assert_eq!(data, Some(json!({ "field": "name" })));
        }
        other => panic!("expected rpc error, got {other:?}"),
    }
}

#[tokio::test]
async fn unknown_response_id_is_dropped_and_session_continues() {
    let (endpoint, mut peer) = connect().await;
    let handle = endpoint.handle();

    peer.write(json!({ "jsonrpc": "2.0", "id": 999, "result": {} }))
        .await;

    let call = tokio::spawn({
        let handle = handle.clone();
        async move {
            handle
                .request_with_timeout("ping", None, Duration::from_secs(1))
                .await
        }
    });
    let request = peer.read().await;
    peer.write(json!({ "jsonrpc": "2.0", "id": request["id"], "result": { "ok": true } }))
        .await;
    assert_eq!(call.await.unwrap().unwrap()["ok"], true);

    assert_eq!(handle.stats().unknown_response_ids, 1);
}

#[tokio::test]
async fn incoming_request_is_delivered_and_answered() {
    let (mut endpoint, mut peer) = connect().await;
    let mut requests = endpoint.take_requests().expect("requests queue");

    peer.write(json!({ "jsonrpc": "2.0", "id": 7, "method": "roots/list" }))
        .await;

    let request = requests.recv().await.expect("incoming request");
    assert_eq!(request.id, Id::Integer(7));
    assert_eq!(request.method, "roots/list");
    request
        .respond_ok(json!({ "roots": [] }))
        .await
        .expect("respond");

    let response = peer.read().await;
    assert_eq!(response["id"], 7);
    assert_eq!(response["result"], json!({ "roots": [] }));
}

#[tokio::test]
async fn incoming_notification_is_delivered() {
    let (mut endpoint, mut peer) = connect().await;
    let mut notifications = endpoint.take_notifications().expect("notifications queue");

    peer.write(json!({
        "jsonrpc": "2.0",
        "method": "notifications/message",
        "params": { "level": "info", "data": "hello" },
    }))
    .await;

    let note = notifications.recv().await.expect("notification");
    assert_eq!(note.method, "notifications/message");
    assert_eq!(note.params.unwrap()["level"], "info");
}

#[tokio::test]
async fn timeout_fails_future_and_emits_cancelled_notification() {
    let (endpoint, mut peer) = connect().await;
    let handle = endpoint.handle();

    let call = tokio::spawn({
        let handle = handle.clone();
        async move {
            handle
                .request_with_timeout("ping", None, Duration::from_millis(50))
                .await
        }
    });
    let request = peer.read().await;
    let id = request["id"].clone();

    let err = call.await.unwrap().unwrap_err();
    assert!(err.is_timeout(), "expected timeout, got {err:?}");

    let cancelled = peer.read().await;
    assert_eq!(cancelled["method"], "notifications/cancelled");
    assert_eq!(cancelled["params"]["requestId"], id);
    assert_eq!(cancelled["params"]["reason"], "timeout");
}

#[tokio::test]
async fn dropping_request_future_emits_cancelled_notification() {
    let (endpoint, mut peer) = connect().await;
    let handle = endpoint.handle();

    let call = tokio::spawn({
        let handle = handle.clone();
        async move {
            handle
                .request_with_timeout("slow", None, Duration::from_secs(30))
                .await
        }
    });
    let request = peer.read().await;
    let id = request["id"].clone();

    call.abort();
    let _ = call.await;

    let cancelled = peer.read().await;
    assert_eq!(cancelled["method"], "notifications/cancelled");
    assert_eq!(cancelled["params"]["requestId"], id);
    assert_eq!(cancelled["params"]["reason"], "cancelled");
}

#[tokio::test]
async fn late_response_after_timeout_is_ignored() {
    let (endpoint, mut peer) = connect().await;
    let handle = endpoint.handle();

    let call = tokio::spawn({
        let handle = handle.clone();
        async move {
            handle
                .request_with_timeout("ping", None, Duration::from_millis(50))
                .await
        }
    });
    let request = peer.read().await;
    assert!(call.await.unwrap().unwrap_err().is_timeout());
    let _cancelled = peer.read().await;

    // The server answers anyway; the endpoint must drop it and keep working.
    peer.write(json!({ "jsonrpc": "2.0", "id": request["id"], "result": {} }))
        .await;

    let next = tokio::spawn({
        let handle = handle.clone();
        async move {
            handle
                .request_with_timeout("ping", None, Duration::from_secs(1))
                .await
        }
    });
    let request = peer.read().await;
    peer.write(json!({ "jsonrpc": "2.0", "id": request["id"], "result": {} }))
        .await;
    next.await.unwrap().unwrap();
}

#[tokio::test]
async fn close_fails_pending_and_is_idempotent() {
    let (mut endpoint, mut peer) = connect().await;
    let handle = endpoint.handle();

    let call = tokio::spawn({
        let handle = handle.clone();
        async move {
            handle
                .request_with_timeout("ping", None, Duration::from_secs(30))
                .await
        }
    });
    let _request = peer.read().await;

    endpoint.close("session closed").await;
    let err = call.await.unwrap().unwrap_err();
    assert!(err.is_closed(), "expected closed, got {err:?}");
    assert_eq!(handle.close_reason().as_deref(), Some("session closed"));

    // Second close observes the same state.
    endpoint.close("other reason").await;
    assert_eq!(handle.close_reason().as_deref(), Some("session closed"));

    let err = handle
        .request_with_timeout("ping", None, Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(err.is_closed());
}

#[tokio::test]
async fn peer_eof_closes_endpoint_and_fails_pending() {
    let (endpoint, peer) = connect().await;
    let handle = endpoint.handle();

    let call = tokio::spawn({
        let handle = handle.clone();
        async move {
            handle
                .request_with_timeout("ping", None, Duration::from_secs(30))
                .await
        }
    });

    // Give the request a chance to be written, then hang up.
    tokio::time::sleep(Duration::from_millis(20)).await;
    drop(peer);

    let err = call.await.unwrap().unwrap_err();
    assert!(err.is_closed(), "expected closed, got {err:?}");
}

#[tokio::test]
async fn request_queue_overflow_answers_overloaded() {
    let (_endpoint, mut peer) = connect_with(EndpointOptions {
        requests_capacity: 1,
        ..Default::default()
    })
    .await;

    // Nothing consumes the requests queue, so the second request overflows.
    peer.write(json!({ "jsonrpc": "2.0", "id": 1, "method": "a" }))
        .await;
    peer.write(json!({ "jsonrpc": "2.0", "id": 2, "method": "b" }))
        .await;

    let response = peer.read().await;
    assert_eq!(response["id"], 2);
    assert_eq!(response["error"]["code"], -32000);
}

#[tokio::test]
async fn dropped_request_queue_answers_method_not_found() {
    let (mut endpoint, mut peer) = connect().await;
    drop(endpoint.take_requests());

    peer.write(json!({ "jsonrpc": "2.0", "id": 5, "method": "sampling/createMessage" }))
        .await;

    let response = peer.read().await;
    assert_eq!(response["id"], 5);
    assert_eq!(response["error"]["code"], -32601);
}

#[tokio::test]
async fn malformed_envelope_with_id_gets_invalid_request_reply() {
    let (_endpoint, mut peer) = connect().await;

    peer.write(json!({ "jsonrpc": "1.0", "id": 11, "method": "ping" }))
        .await;

    let response = peer.read().await;
    assert_eq!(response["id"], 11);
    assert_eq!(response["error"]["code"], -32600);
}

#[tokio::test]
async fn unparseable_request_id_gets_null_id_reply() {
    let (_endpoint, mut peer) = connect().await;

    peer.write(json!({ "jsonrpc": "2.0", "id": [1], "method": "ping" }))
        .await;

    let response = peer.read().await;
    assert_eq!(response["id"], Value::Null);
    assert_eq!(response["error"]["code"], -32600);
}

#[tokio::test]
async fn malformed_response_fails_the_parked_awaiter() {
    let (endpoint, mut peer) = connect().await;
    let handle = endpoint.handle();

    let call = tokio::spawn({
        let handle = handle.clone();
        async move {
            handle
                .request_with_timeout("ping", None, Duration::from_secs(2))
                .await
        }
    });
    let request = peer.read().await;

    // Both result and error present: invalid.
    peer.write(json!({
        "jsonrpc": "2.0",
        "id": request["id"],
        "result": {},
        "error": { "code": 1, "message": "x" },
    }))
    .await;

    let err = call.await.unwrap().unwrap_err();
    assert!(
        matches!(err, Error::InvalidMessage(_)),
        "expected invalid message, got {err:?}"
    );
}
