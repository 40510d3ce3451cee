//! Built-in handlers for server-initiated traffic, plus the worker tasks that
//! keep user consumers off the dispatch path.
//!
//! Two queues come from the link layer: server->client requests and
//! notifications. The request worker answers `ping`, `roots/list`, and
//! `sampling/createMessage` sequentially. The notification router fans events
//! out: each `*_changed` kind gets its own serial refresh worker (paginate the
//! full list, then call every registered consumer with it), so a slow consumer
//! can never stall response correlation.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;

use mcp_link::{IncomingRequest, Notification, INTERNAL_ERROR, INVALID_PARAMS, METHOD_NOT_FOUND};

use crate::client::Client;
use crate::protocol::methods;
use crate::types::{
    CancelledParams, CreateMessageRequestParams, CreateMessageResult, ListRootsResult,
    LoggingMessageParams, Prompt, ProgressParams, Resource, ResourceUpdatedParams, Tool,
};

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Maps a `sampling/createMessage` request to its result. Errors become an
/// internal-error response to the server.
pub type SamplingHandler = Arc<
    dyn Fn(CreateMessageRequestParams) -> BoxFuture<anyhow::Result<CreateMessageResult>>
        + Send
        + Sync,
>;

/// Receives the full refreshed list after a list-changed notification, not a
/// diff. Errors are logged and isolated.
pub type ToolsChangeConsumer = Arc<dyn Fn(Vec<Tool>) -> BoxFuture<anyhow::Result<()>> + Send + Sync>;
pub type ResourcesChangeConsumer =
    Arc<dyn Fn(Vec<Resource>) -> BoxFuture<anyhow::Result<()>> + Send + Sync>;
pub type PromptsChangeConsumer =
    Arc<dyn Fn(Vec<Prompt>) -> BoxFuture<anyhow::Result<()>> + Send + Sync>;
pub type LoggingConsumer =
    Arc<dyn Fn(LoggingMessageParams) -> BoxFuture<anyhow::Result<()>> + Send + Sync>;
pub type ProgressConsumer =
    Arc<dyn Fn(ProgressParams) -> BoxFuture<anyhow::Result<()>> + Send + Sync>;
pub type ResourceUpdatedConsumer =
    Arc<dyn Fn(ResourceUpdatedParams) -> BoxFuture<anyhow::Result<()>> + Send + Sync>;

pub(crate) struct HandlerConfig {
    pub sampling_handler: Option<SamplingHandler>,
    pub tools_consumers: Arc<Vec<ToolsChangeConsumer>>,
    pub resources_consumers: Arc<Vec<ResourcesChangeConsumer>>,
    pub prompts_consumers: Arc<Vec<PromptsChangeConsumer>>,
    pub logging_consumer: Option<LoggingConsumer>,
}

pub(crate) fn spawn_workers(
    client: &Client,
    requests_rx: Option<mpsc::Receiver<IncomingRequest>>,
    notifications_rx: Option<mpsc::Receiver<Notification>>,
    config: HandlerConfig,
) -> Vec<tokio::task::JoinHandle<()>> {
    let mut tasks = Vec::new();

    if let Some(mut requests_rx) = requests_rx {
        let client = client.clone();
        let sampling = config.sampling_handler.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(request) = requests_rx.recv().await {
                handle_server_request(&client, sampling.as_ref(), request).await;
            }
        }));
    }

    if let Some(mut notifications_rx) = notifications_rx {
        // Per-kind serial refresh workers. Capacity 1 with try_send coalesces
        // bursts: a queued trigger will fetch the latest list anyway.
        let tools_tx =
            spawn_refresh_worker(client, config.tools_consumers.clone(), &mut tasks, |client| {
                Box::pin(async move { client.list_all_tools().await }) as BoxFuture<_>
            });
        let resources_tx =
            spawn_refresh_worker(client, config.resources_consumers.clone(), &mut tasks, |client| {
                Box::pin(async move { client.list_all_resources().await }) as BoxFuture<_>
            });
        let prompts_tx =
            spawn_refresh_worker(client, config.prompts_consumers.clone(), &mut tasks, |client| {
                Box::pin(async move { client.list_all_prompts().await }) as BoxFuture<_>
            });

        let client = client.clone();
        let logging = config.logging_consumer.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(note) = notifications_rx.recv().await {
                route_notification(
                    &client,
                    &tools_tx,
                    &resources_tx,
                    &prompts_tx,
                    logging.as_ref(),
                    note,
                )
                .await;
            }
        }));
    }

    tasks
}

fn spawn_refresh_worker<T: Send + 'static>(
    client: &Client,
    consumers: Arc<Vec<Arc<dyn Fn(Vec<T>) -> BoxFuture<anyhow::Result<()>> + Send + Sync>>>,
    tasks: &mut Vec<tokio::task::JoinHandle<()>>,
    refresh: impl Fn(Client) -> BoxFuture<crate::Result<Vec<T>>> + Send + 'static,
) -> mpsc::Sender<&'static str>
where
    Vec<T>: Clone,
{
    let (tx, mut rx) = mpsc::channel::<&'static str>(1);
    let client = client.clone();
    tasks.push(tokio::spawn(async move {
        while let Some(kind) = rx.recv().await {
            if consumers.is_empty() {
                continue;
            }
            let list = match refresh(client.clone()).await {
                Ok(list) => list,
                Err(err) => {
                    tracing::warn!(%kind, error = %err, "list refresh after change notification failed");
                    continue;
                }
            };
            for consumer in consumers.iter() {
                if let Err(err) = invoke_consumer(consumer.clone(), list.clone()).await {
                    tracing::warn!(%kind, error = %err, "change consumer failed");
                }
            }
        }
    }));
    tx
}

/// Runs a consumer on its own task so a panic is isolated from the worker.
async fn invoke_consumer<T: Send + 'static>(
    consumer: Arc<dyn Fn(Vec<T>) -> BoxFuture<anyhow::Result<()>> + Send + Sync>,
    list: Vec<T>,
) -> anyhow::Result<()> {
    match tokio::spawn(async move { consumer(list).await }).await {
        Ok(result) => result,
        Err(err) if err.is_panic() => anyhow::bail!("consumer panicked"),
        Err(_) => Ok(()),
    }
}

async fn handle_server_request(
    client: &Client,
    sampling: Option<&SamplingHandler>,
    request: IncomingRequest,
) {
    let method = request.method.clone();
    match method.as_str() {
        methods::PING => {
            let _ = request.respond_ok(serde_json::json!({})).await;
        }
        methods::ROOTS_LIST => {
            let result = ListRootsResult {
                roots: client.roots(),
            };
            match serde_json::to_value(&result) {
                Ok(value) => {
                    let _ = request.respond_ok(value).await;
                }
                Err(err) => {
                    let _ = request
                        .respond_error(INTERNAL_ERROR, format!("serialize roots: {err}"), None)
                        .await;
                }
            }
        }
        methods::SAMPLING_CREATE_MESSAGE => {
            handle_create_message(sampling, request).await;
        }
        other => {
            let _ = request
                .respond_error(METHOD_NOT_FOUND, format!("method not found: {other}"), None)
                .await;
        }
    }
}

async fn handle_create_message(sampling: Option<&SamplingHandler>, request: IncomingRequest) {
    let Some(handler) = sampling else {
        let _ = request
            .respond_error(
                METHOD_NOT_FOUND,
                "method not found: sampling/createMessage",
                None,
            )
            .await;
        return;
    };

    let params: CreateMessageRequestParams =
        match serde_json::from_value(request.params.clone().unwrap_or(Value::Null)) {
            Ok(params) => params,
            Err(err) => {
                let _ = request
                    .respond_error(INVALID_PARAMS, format!("invalid sampling params: {err}"), None)
                    .await;
                return;
            }
        };

    // Run the user handler on its own task so a panic is bridged into an
    // error response instead of killing the request worker.
    let handler = handler.clone();
    let outcome = match tokio::spawn(async move { handler(params).await }).await {
        Ok(outcome) => outcome,
        Err(err) if err.is_panic() => Err(anyhow::anyhow!("sampling handler panicked")),
        Err(_) => Err(anyhow::anyhow!("sampling handler cancelled")),
    };

    match outcome {
        Ok(result) => match serde_json::to_value(&result) {
            Ok(value) => {
                let _ = request.respond_ok(value).await;
            }
            Err(err) => {
                let _ = request
                    .respond_error(
                        INTERNAL_ERROR,
                        format!("serialize sampling result: {err}"),
                        None,
                    )
                    .await;
            }
        },
        Err(err) => {
            tracing::warn!(error = %err, "sampling handler failed");
            let _ = request
                .respond_error(INTERNAL_ERROR, format!("sampling handler failed: {err}"), None)
                .await;
        }
    }
}

async fn route_notification(
    client: &Client,
    tools_tx: &mpsc::Sender<&'static str>,
    resources_tx: &mpsc::Sender<&'static str>,
    prompts_tx: &mpsc::Sender<&'static str>,
    logging: Option<&LoggingConsumer>,
    note: Notification,
) {
    match note.method.as_str() {
        methods::NOTIFICATION_TOOLS_LIST_CHANGED => {
            let _ = tools_tx.try_send("tools");
        }
        methods::NOTIFICATION_RESOURCES_LIST_CHANGED => {
            let _ = resources_tx.try_send("resources");
        }
        methods::NOTIFICATION_PROMPTS_LIST_CHANGED => {
            let _ = prompts_tx.try_send("prompts");
        }
        methods::NOTIFICATION_MESSAGE => {
            let params: LoggingMessageParams =
                match serde_json::from_value(note.params.unwrap_or(Value::Null)) {
                    Ok(params) => params,
                    Err(err) => {
                        tracing::warn!(error = %err, "invalid logging notification");
                        return;
                    }
                };
            match logging {
                Some(consumer) => {
                    let consumer = consumer.clone();
                    let outcome =
                        tokio::spawn(async move { consumer(params).await }).await;
                    match outcome {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => {
                            tracing::warn!(error = %err, "logging consumer failed");
                        }
                        Err(err) if err.is_panic() => {
                            tracing::warn!("logging consumer panicked");
                        }
                        Err(_) => {}
                    }
                }
                None => {
                    tracing::debug!(
                        level = params.level.as_str(),
                        logger = params.logger.as_deref().unwrap_or(""),
                        "server log message (no consumer registered)"
                    );
                }
            }
        }
        methods::NOTIFICATION_CANCELLED => {
            let params: CancelledParams =
                match serde_json::from_value(note.params.unwrap_or(Value::Null)) {
                    Ok(params) => params,
                    Err(err) => {
                        tracing::warn!(error = %err, "invalid cancelled notification");
                        return;
                    }
                };
            let reason = params
                .reason
                .unwrap_or_else(|| "cancelled by server".to_string());
            if !client.link_handle().abort_pending(&params.request_id, reason) {
                tracing::debug!(id = %params.request_id, "cancelled notification for unknown request");
            }
        }
        methods::NOTIFICATION_PROGRESS => {
            let params: ProgressParams =
                match serde_json::from_value(note.params.unwrap_or(Value::Null)) {
                    Ok(params) => params,
                    Err(err) => {
                        tracing::warn!(error = %err, "invalid progress notification");
                        return;
                    }
                };
            match client.progress_consumer(&params.progress_token) {
                Some(consumer) => {
                    if let Err(err) = consumer(params).await {
                        tracing::warn!(error = %err, "progress consumer failed");
                    }
                }
                None => {
                    tracing::debug!(token = %params.progress_token, "progress for unknown token");
                }
            }
        }
        methods::NOTIFICATION_RESOURCES_UPDATED => {
            let params: ResourceUpdatedParams =
                match serde_json::from_value(note.params.unwrap_or(Value::Null)) {
                    Ok(params) => params,
                    Err(err) => {
                        tracing::warn!(error = %err, "invalid resource-updated notification");
                        return;
                    }
                };
            match client.updated_consumer(&params.uri) {
                Some(consumer) => {
                    if let Err(err) = consumer(params).await {
                        tracing::warn!(error = %err, "resource subscription consumer failed");
                    }
                }
                None => {
                    tracing::debug!(uri = %params.uri, "update for unsubscribed resource");
                }
            }
        }
        other => {
            tracing::debug!(method = %other, "ignoring unhandled notification");
        }
    }
}
