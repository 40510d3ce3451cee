//! Typed wrappers for the MCP wire schema.
//!
//! These types are intentionally a *subset* of the full MCP schema: list
//! identity and the fields invocation needs are typed, everything a server may
//! extend freely stays `serde_json::Value`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use mcp_link::Id;

use crate::protocol::{methods, McpNotification, McpRequest};

/// Identity advertised by one side of the session (`clientInfo`/`serverInfo`).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Implementation {
    pub name: String,
    pub version: String,
}

impl Implementation {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct ClientCapabilities {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experimental: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roots: Option<RootsCapability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sampling: Option<SamplingCapability>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct RootsCapability {
    #[serde(
        rename = "listChanged",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub list_changed: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct SamplingCapability {}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct ServerCapabilities {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experimental: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingCapability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completions: Option<CompletionsCapability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompts: Option<PromptsCapability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourcesCapability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<ToolsCapability>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct LoggingCapability {}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct CompletionsCapability {}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct PromptsCapability {
    #[serde(
        rename = "listChanged",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub list_changed: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct ResourcesCapability {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscribe: Option<bool>,
    #[serde(
        rename = "listChanged",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub list_changed: Option<bool>,
}

impl ResourcesCapability {
    pub fn supports_subscribe(&self) -> bool {
        self.subscribe == Some(true)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct ToolsCapability {
    #[serde(
        rename = "listChanged",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub list_changed: Option<bool>,
}

pub enum InitializeRequest {}

impl McpRequest for InitializeRequest {
    const METHOD: &'static str = methods::INITIALIZE;
    type Params = InitializeRequestParams;
    type Result = InitializeResult;
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct InitializeRequestParams {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    pub capabilities: ClientCapabilities,
    #[serde(rename = "clientInfo")]
    pub client_info: Implementation,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct InitializeResult {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    pub capabilities: ServerCapabilities,
    #[serde(rename = "serverInfo")]
    pub server_info: Implementation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

/// A file-or-namespace anchor the client authorizes the server to address.
/// Keyed by `uri`; unique within a session.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Root {
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ListRootsResult {
    pub roots: Vec<Root>,
}

pub enum PingRequest {}

impl McpRequest for PingRequest {
    const METHOD: &'static str = methods::PING;
    type Params = Option<Value>;
    type Result = Value;
}

pub enum ListToolsRequest {}

impl McpRequest for ListToolsRequest {
    const METHOD: &'static str = methods::TOOLS_LIST;
    type Params = Option<PaginatedRequestParams>;
    type Result = ListToolsResult;
}

/// Cursor-bearing params shared by every list operation.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct PaginatedRequestParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

impl PaginatedRequestParams {
    pub fn cursor(cursor: Option<String>) -> Option<Self> {
        cursor.map(|cursor| Self {
            cursor: Some(cursor),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ListToolsResult {
    #[serde(
        rename = "nextCursor",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub next_cursor: Option<String>,
    pub tools: Vec<Tool>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Tool {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "inputSchema")]
    pub input_schema: ToolInputSchema,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ToolInputSchema {
    #[serde(default = "json_schema_object_type_default")]
    pub r#type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<Vec<String>>,
}

fn json_schema_object_type_default() -> String {
    "object".to_string()
}

pub enum CallToolRequest {}

impl McpRequest for CallToolRequest {
    const METHOD: &'static str = methods::TOOLS_CALL;
    type Params = CallToolRequestParams;
    type Result = CallToolResult;
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CallToolRequestParams {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CallToolResult {
    pub content: Vec<Value>,
    #[serde(rename = "isError", default, skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
    #[serde(
        rename = "structuredContent",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub structured_content: Option<Value>,
}

pub enum ListResourcesRequest {}

impl McpRequest for ListResourcesRequest {
    const METHOD: &'static str = methods::RESOURCES_LIST;
    type Params = Option<PaginatedRequestParams>;
    type Result = ListResourcesResult;
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ListResourcesResult {
    #[serde(
        rename = "nextCursor",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub next_cursor: Option<String>,
    pub resources: Vec<Resource>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Resource {
    pub uri: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "mimeType", default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Value>,
}

pub enum ListResourceTemplatesRequest {}

impl McpRequest for ListResourceTemplatesRequest {
    const METHOD: &'static str = methods::RESOURCES_TEMPLATES_LIST;
    type Params = Option<PaginatedRequestParams>;
    type Result = ListResourceTemplatesResult;
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ListResourceTemplatesResult {
    #[serde(
        rename = "nextCursor",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub next_cursor: Option<String>,
    #[serde(rename = "resourceTemplates")]
    pub resource_templates: Vec<ResourceTemplate>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ResourceTemplate {
    #[serde(rename = "uriTemplate")]
    pub uri_template: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "mimeType", default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

pub enum ReadResourceRequest {}

impl McpRequest for ReadResourceRequest {
    const METHOD: &'static str = methods::RESOURCES_READ;
    type Params = ReadResourceRequestParams;
    type Result = ReadResourceResult;
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ReadResourceRequestParams {
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ReadResourceResult {
    pub contents: Vec<ResourceContents>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ResourceContents {
    Text(TextResourceContents),
    Blob(BlobResourceContents),
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TextResourceContents {
    pub uri: String,
    pub text: String,
    #[serde(rename = "mimeType", default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BlobResourceContents {
    pub uri: String,
    pub blob: String,
    #[serde(rename = "mimeType", default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

pub enum SubscribeRequest {}

impl McpRequest for SubscribeRequest {
    const METHOD: &'static str = methods::RESOURCES_SUBSCRIBE;
    type Params = SubscribeRequestParams;
    type Result = Value;
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SubscribeRequestParams {
    pub uri: String,
}

pub enum UnsubscribeRequest {}

impl McpRequest for UnsubscribeRequest {
    const METHOD: &'static str = methods::RESOURCES_UNSUBSCRIBE;
    type Params = SubscribeRequestParams;
    type Result = Value;
}

pub enum ListPromptsRequest {}

impl McpRequest for ListPromptsRequest {
    const METHOD: &'static str = methods::PROMPTS_LIST;
    type Params = Option<PaginatedRequestParams>;
    type Result = ListPromptsResult;
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ListPromptsResult {
    #[serde(
        rename = "nextCursor",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub next_cursor: Option<String>,
    pub prompts: Vec<Prompt>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Prompt {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Vec<PromptArgument>>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PromptArgument {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
}

pub enum GetPromptRequest {}

impl McpRequest for GetPromptRequest {
    const METHOD: &'static str = methods::PROMPTS_GET;
    type Params = GetPromptRequestParams;
    type Result = GetPromptResult;
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct GetPromptRequestParams {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct GetPromptResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub messages: Vec<PromptMessage>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PromptMessage {
    pub role: Role,
    pub content: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Assistant,
    User,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoggingLevel {
    Debug,
    Info,
    Notice,
    Warning,
    Error,
    Critical,
    Alert,
    Emergency,
}

impl LoggingLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoggingLevel::Debug => "debug",
            LoggingLevel::Info => "info",
            LoggingLevel::Notice => "notice",
            LoggingLevel::Warning => "warning",
            LoggingLevel::Error => "error",
            LoggingLevel::Critical => "critical",
            LoggingLevel::Alert => "alert",
            LoggingLevel::Emergency => "emergency",
        }
    }
}

pub enum SetLevelRequest {}

impl McpRequest for SetLevelRequest {
    const METHOD: &'static str = methods::LOGGING_SET_LEVEL;
    type Params = SetLevelRequestParams;
    type Result = Value;
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SetLevelRequestParams {
    pub level: LoggingLevel,
}

/// `notifications/message` payload.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LoggingMessageParams {
    pub level: LoggingLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logger: Option<String>,
    pub data: Value,
}

pub enum CompleteRequest {}

impl McpRequest for CompleteRequest {
    const METHOD: &'static str = methods::COMPLETION_COMPLETE;
    type Params = Value;
    type Result = Value;
}

/// `sampling/createMessage` params. Message contents are opaque to the
/// runtime; only the routing fields are typed.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CreateMessageRequestParams {
    pub messages: Vec<SamplingMessage>,
    #[serde(
        rename = "modelPreferences",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub model_preferences: Option<Value>,
    #[serde(
        rename = "systemPrompt",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub system_prompt: Option<String>,
    #[serde(
        rename = "includeContext",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub include_context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(rename = "maxTokens", default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<i64>,
    #[serde(
        rename = "stopSequences",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub stop_sequences: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SamplingMessage {
    pub role: Role,
    pub content: Value,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CreateMessageResult {
    pub role: Role,
    pub content: Value,
    pub model: String,
    #[serde(rename = "stopReason", default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
}

/// `notifications/cancelled` payload.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CancelledParams {
    #[serde(rename = "requestId")]
    pub request_id: Id,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// `notifications/progress` payload. The token has request-id shape.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ProgressParams {
    #[serde(rename = "progressToken")]
    pub progress_token: Id,
    pub progress: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// `notifications/resources/updated` payload.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ResourceUpdatedParams {
    pub uri: String,
}

pub enum InitializedNotification {}

impl McpNotification for InitializedNotification {
    const METHOD: &'static str = methods::NOTIFICATION_INITIALIZED;
    type Params = Value;
}

pub enum RootsListChangedNotification {}

impl McpNotification for RootsListChangedNotification {
    const METHOD: &'static str = methods::NOTIFICATION_ROOTS_LIST_CHANGED;
    type Params = Option<Value>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn client_capabilities_omit_absent_features() {
        let caps = ClientCapabilities::default();
        assert_eq!(serde_json::to_value(&caps).unwrap(), json!({}));

        let caps = ClientCapabilities {
            roots: Some(RootsCapability {
                list_changed: Some(true),
            }),
            sampling: Some(SamplingCapability::default()),
            ..Default::default()
        };
        assert_eq!(
            serde_json::to_value(&caps).unwrap(),
            json!({ "roots": { "listChanged": true }, "sampling": {} })
        );
    }

    #[test]
    fn server_capabilities_deserialize_from_initialize_shape() {
        let caps: ServerCapabilities = serde_json::from_value(json!({
            "tools": { "listChanged": true },
            "resources": { "subscribe": true, "listChanged": false },
            "logging": {},
        }))
        .unwrap();
        assert_eq!(caps.tools.unwrap().list_changed, Some(true));
        assert!(caps.resources.as_ref().unwrap().supports_subscribe());
        assert!(caps.logging.is_some());
        assert!(caps.prompts.is_none());
    }

    #[test]
    fn logging_level_serializes_lowercase() {
        assert_eq!(
            serde_json::to_value(LoggingLevel::Warning).unwrap(),
            json!("warning")
        );
        let level: LoggingLevel = serde_json::from_value(json!("emergency")).unwrap();
        assert_eq!(level, LoggingLevel::Emergency);
        assert!(LoggingLevel::Debug < LoggingLevel::Error);
    }

    #[test]
    fn tool_deserializes_with_defaulted_schema_type() {
        let tool: Tool = serde_json::from_value(json!({
            "name": "echo",
            "inputSchema": { "properties": { "x": { "type": "number" } } },
        }))
        .unwrap();
        assert_eq!(tool.input_schema.r#type, "object");
    }

    #[test]
    fn resource_contents_split_on_shape() {
        let text: ResourceContents = serde_json::from_value(json!({
            "uri": "file:///a",
            "text": "hello",
        }))
        .unwrap();
        assert!(matches!(text, ResourceContents::Text(_)));

        let blob: ResourceContents = serde_json::from_value(json!({
            "uri": "file:///b",
            "blob": "aGVsbG8=",
        }))
        .unwrap();
        assert!(matches!(blob, ResourceContents::Blob(_)));
    }

    #[test]
    fn create_message_result_matches_wire_shape() {
        let result = CreateMessageResult {
            role: Role::Assistant,
            content: json!({ "type": "text", "text": "ok" }),
            model: "m".to_string(),
            stop_reason: Some("endTurn".to_string()),
        };
        assert_eq!(
            serde_json::to_value(&result).unwrap(),
            json!({
                "role": "assistant",
                "content": { "type": "text", "text": "ok" },
                "model": "m",
                "stopReason": "endTurn",
            })
        );
    }

    #[test]
    fn cancelled_params_accept_string_and_integer_ids() {
        let params: CancelledParams =
            serde_json::from_value(json!({ "requestId": 4, "reason": "timeout" })).unwrap();
        assert_eq!(params.request_id, Id::Integer(4));

        let params: CancelledParams =
            serde_json::from_value(json!({ "requestId": "r-9" })).unwrap();
        assert_eq!(params.request_id, Id::String("r-9".to_string()));
        assert_eq!(params.reason, None);
    }
}
