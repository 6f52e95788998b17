//! Jupyter message model shared by every backend.
//!
//! Mirrors the subset of the Jupyter messaging spec the managers actually
//! rely on: the `execute_request` envelope sent to a kernel and the family
//! of IOPub/shell messages that come back. Unknown message types decode to
//! [`KernelMessage::Other`] and are ignored by callers rather than treated
//! as protocol errors.
//!
//! See <https://jupyter-client.readthedocs.io/en/latest/messaging.html>.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::BoxResult;

/// Message header. All fields except `msg_id`/`msg_type` are optional in
/// requests; kernels fill them in on responses.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExecutionHeader {
    #[serde(default)]
    pub msg_id: String,
    #[serde(default)]
    pub msg_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl ExecutionHeader {
    /// Fresh header for an outgoing `execute_request`. The `msg_id` is a
    /// uuid4 hex string; responses echo it back as `parent_header.msg_id`.
    pub fn execute_request() -> Self {
        Self {
            msg_id: Uuid::new_v4().simple().to_string(),
            msg_type: "execute_request".to_string(),
            ..Self::default()
        }
    }
}

/// Body of an `execute_request`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionContent {
    pub code: String,
    pub silent: bool,
    pub store_history: bool,
    pub user_expressions: serde_json::Map<String, Value>,
    pub allow_stdin: bool,
}

impl ExecutionContent {
    pub fn of_code(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            silent: false,
            store_history: false,
            user_expressions: serde_json::Map::new(),
            allow_stdin: false,
        }
    }
}

/// Full `execute_request` envelope.
///
/// `parent_header` and `metadata` must be present (as empty objects) or the
/// kernel drops the connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionRequest {
    pub header: ExecutionHeader,
    pub parent_header: serde_json::Map<String, Value>,
    pub metadata: serde_json::Map<String, Value>,
    pub content: ExecutionContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buffers: Option<Vec<Value>>,
    pub channel: String,
}

impl ExecutionRequest {
    pub fn of_code(code: impl Into<String>) -> Self {
        Self {
            header: ExecutionHeader::execute_request(),
            parent_header: serde_json::Map::new(),
            metadata: serde_json::Map::new(),
            content: ExecutionContent::of_code(code),
            buffers: None,
            channel: "shell".to_string(),
        }
    }

    /// The request message id responses will carry in `parent_header`.
    pub fn msg_id(&self) -> &str {
        &self.header.msg_id
    }
}

/// Kernel execution state reported on the IOPub status channel.
///
/// Unrecognized states decode to [`ExecutionState::Unknown`] instead of
/// failing, since the messaging spec leaves the state set open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ExecutionState {
    Starting,
    Busy,
    Idle,
    Restarting,
    Dead,
    Unknown,
}

impl From<String> for ExecutionState {
    fn from(s: String) -> Self {
        match s.as_str() {
            "starting" => Self::Starting,
            "busy" => Self::Busy,
            "idle" => Self::Idle,
            "restarting" => Self::Restarting,
            "dead" => Self::Dead,
            _ => Self::Unknown,
        }
    }
}

impl From<ExecutionState> for String {
    fn from(state: ExecutionState) -> Self {
        match state {
            ExecutionState::Starting => "starting",
            ExecutionState::Busy => "busy",
            ExecutionState::Idle => "idle",
            ExecutionState::Restarting => "restarting",
            ExecutionState::Dead => "dead",
            ExecutionState::Unknown => "unknown",
        }
        .to_string()
    }
}

/// Reply status on the shell channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ReplyStatus {
    Ok,
    Error,
    Abort,
    Unknown,
}

impl From<String> for ReplyStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "ok" => Self::Ok,
            "error" => Self::Error,
            "abort" => Self::Abort,
            _ => Self::Unknown,
        }
    }
}

impl From<ReplyStatus> for String {
    fn from(status: ReplyStatus) -> Self {
        match status {
            ReplyStatus::Ok => "ok",
            ReplyStatus::Error => "error",
            ReplyStatus::Abort => "abort",
            ReplyStatus::Unknown => "unknown",
        }
        .to_string()
    }
}

/// `status` message content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusContent {
    pub execution_state: ExecutionState,
}

/// `execute_reply` content. Error details are only present when
/// `status == "error"`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReplyContent {
    pub status: ReplyStatus,
    #[serde(default)]
    pub execution_count: Option<i64>,
    #[serde(default)]
    pub ename: Option<String>,
    #[serde(default)]
    pub evalue: Option<String>,
    #[serde(default)]
    pub traceback: Option<Vec<String>>,
}

/// `execute_input` broadcast content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InputContent {
    pub code: String,
    #[serde(default)]
    pub execution_count: Option<i64>,
}

/// `stream` content (stdout/stderr text).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamContent {
    pub name: String,
    pub text: String,
}

/// `error` content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorContent {
    pub ename: String,
    pub evalue: String,
    #[serde(default)]
    pub traceback: Vec<String>,
}

/// Display payload keyed by MIME type. Only the types the library surfaces
/// are modeled; anything else is dropped on decode.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MimeBundle {
    #[serde(rename = "text/plain", default, skip_serializing_if = "Option::is_none")]
    pub text_plain: Option<String>,
    #[serde(rename = "image/png", default, skip_serializing_if = "Option::is_none")]
    pub image_png: Option<String>,
}

impl MimeBundle {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text_plain: Some(text.into()),
            image_png: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text_plain.is_none() && self.image_png.is_none()
    }
}

/// `execute_result` / `display_data` content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResultContent {
    pub data: MimeBundle,
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
    #[serde(default)]
    pub execution_count: Option<i64>,
}

/// A kernel message decoded according to its `msg_type`.
#[derive(Debug, Clone, PartialEq)]
pub enum KernelMessage {
    Status(StatusContent),
    Reply(ReplyContent),
    Input(InputContent),
    Stream(StreamContent),
    Error(ErrorContent),
    Result(ResultContent),
    DisplayData(ResultContent),
    Other,
}

/// Response envelope as received from a kernel, on any channel.
///
/// `content` stays raw until [`ExecutionResponse::message`] decodes it based
/// on the message type, so a malformed payload of an irrelevant type never
/// aborts an execution.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionResponse {
    pub header: ExecutionHeader,
    #[serde(default)]
    pub parent_header: ExecutionHeader,
    /// Duplicated from `header.msg_type` by most kernels; may be absent.
    #[serde(default)]
    pub msg_type: String,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default)]
    pub content: Value,
    #[serde(default)]
    pub channel: Option<String>,
}

impl ExecutionResponse {
    /// Effective message type, preferring the envelope-level field.
    pub fn msg_type(&self) -> &str {
        if self.msg_type.is_empty() {
            &self.header.msg_type
        } else {
            &self.msg_type
        }
    }

    /// Decode `content` according to the message type.
    pub fn message(&self) -> BoxResult<KernelMessage> {
        let msg = match self.msg_type() {
            "status" => KernelMessage::Status(serde_json::from_value(self.content.clone())?),
            "execute_reply" => KernelMessage::Reply(serde_json::from_value(self.content.clone())?),
            "execute_input" => KernelMessage::Input(serde_json::from_value(self.content.clone())?),
            "stream" => KernelMessage::Stream(serde_json::from_value(self.content.clone())?),
            "error" => KernelMessage::Error(serde_json::from_value(self.content.clone())?),
            "execute_result" => {
                KernelMessage::Result(serde_json::from_value(self.content.clone())?)
            }
            "display_data" => {
                KernelMessage::DisplayData(serde_json::from_value(self.content.clone())?)
            }
            _ => KernelMessage::Other,
        };
        Ok(msg)
    }
}

/// Body of `POST /api/kernels` against an Enterprise Gateway compatible
/// service. `None` fields are omitted from the serialized request.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CreateKernelRequest {
    /// Kernel spec name; the server default is used when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Environment passed to the kernel process, subject to server filtering.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<BTreeMap<String, Value>>,
}

impl CreateKernelRequest {
    pub fn with_env(env: BTreeMap<String, Value>) -> Self {
        Self {
            name: None,
            env: Some(normalize_env(env)),
        }
    }
}

/// Keys whose values the gateway expects as JSON-encoded strings.
const JSON_ENCODED_ENV_KEYS: [&str; 2] = ["KERNEL_VOLUME_MOUNTS", "KERNEL_VOLUMES"];

/// Stringify the structured volume keys; everything else passes through.
pub fn normalize_env(mut env: BTreeMap<String, Value>) -> BTreeMap<String, Value> {
    for key in JSON_ENCODED_ENV_KEYS {
        if let Some(value) = env.get(key) {
            if !value.is_string() {
                let encoded = value.to_string();
                env.insert(key.to_string(), Value::String(encoded));
            }
        }
    }
    env
}

/// Kernel record returned by the gateway's kernels API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KernelInfo {
    pub id: String,
    pub name: String,
    pub last_activity: DateTime<Utc>,
    pub execution_state: ExecutionState,
    pub connections: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_of_code_uses_shell_channel_and_defaults() {
        let req = ExecutionRequest::of_code("print('hi')");
        assert_eq!(req.channel, "shell");
        assert_eq!(req.header.msg_type, "execute_request");
        assert_eq!(req.content.code, "print('hi')");
        assert!(!req.content.silent);
        assert!(!req.content.store_history);
        assert!(!req.content.allow_stdin);
        assert_eq!(req.header.msg_id.len(), 32);
    }

    #[test]
    fn request_serialization_omits_none_fields() {
        let req = ExecutionRequest::of_code("1 + 1");
        let value = serde_json::to_value(&req).unwrap();
        let header = value.get("header").unwrap().as_object().unwrap();
        assert!(!header.contains_key("username"));
        assert!(!header.contains_key("session"));
        assert!(!header.contains_key("date"));
        assert!(!value.as_object().unwrap().contains_key("buffers"));
        assert_eq!(value["parent_header"], json!({}));
        assert_eq!(value["metadata"], json!({}));
    }

    #[test]
    fn response_decodes_status_message() {
        let raw = json!({
            "header": {"msg_id": "a1", "msg_type": "status", "session": "s1"},
            "parent_header": {"msg_id": "p1", "msg_type": "execute_request"},
            "msg_type": "status",
            "metadata": {},
            "content": {"execution_state": "idle"},
            "buffers": [],
            "channel": "iopub"
        });
        let resp: ExecutionResponse = serde_json::from_value(raw).unwrap();
        assert_eq!(resp.parent_header.msg_id, "p1");
        assert_eq!(
            resp.message().unwrap(),
            KernelMessage::Status(StatusContent {
                execution_state: ExecutionState::Idle
            })
        );
    }

    #[test]
    fn response_with_empty_parent_header_decodes() {
        let raw = json!({
            "header": {"msg_id": "a1", "msg_type": "stream"},
            "parent_header": {},
            "content": {"name": "stdout", "text": "hello\n"}
        });
        let resp: ExecutionResponse = serde_json::from_value(raw).unwrap();
        assert_eq!(resp.parent_header.msg_id, "");
        assert_eq!(
            resp.message().unwrap(),
            KernelMessage::Stream(StreamContent {
                name: "stdout".to_string(),
                text: "hello\n".to_string(),
            })
        );
    }

    #[test]
    fn response_with_unknown_msg_type_is_other() {
        let raw = json!({
            "header": {"msg_id": "a1", "msg_type": "comm_open"},
            "parent_header": {},
            "content": {"whatever": true}
        });
        let resp: ExecutionResponse = serde_json::from_value(raw).unwrap();
        assert_eq!(resp.message().unwrap(), KernelMessage::Other);
    }

    #[test]
    fn mime_bundle_uses_mime_type_keys() {
        let raw = json!({"text/plain": "42", "image/png": "aGk="});
        let bundle: MimeBundle = serde_json::from_value(raw).unwrap();
        assert_eq!(bundle.text_plain.as_deref(), Some("42"));
        assert_eq!(bundle.image_png.as_deref(), Some("aGk="));

        let back = serde_json::to_value(&bundle).unwrap();
        assert_eq!(back["text/plain"], "42");
    }

    #[test]
    fn normalize_env_encodes_volume_keys() {
        let mut env = BTreeMap::new();
        env.insert("VAR1".to_string(), json!("value1"));
        env.insert(
            "KERNEL_VOLUME_MOUNTS".to_string(),
            json!({"mount1": "/mnt1"}),
        );
        env.insert("KERNEL_VOLUMES".to_string(), json!([{"volume1": "data1"}]));

        let normalized = normalize_env(env);
        assert_eq!(normalized["VAR1"], json!("value1"));
        assert_eq!(
            normalized["KERNEL_VOLUME_MOUNTS"],
            json!(r#"{"mount1":"/mnt1"}"#)
        );
        assert_eq!(
            normalized["KERNEL_VOLUMES"],
            json!(r#"[{"volume1":"data1"}]"#)
        );
    }

    #[test]
    fn normalize_env_passes_string_volume_values_through() {
        let mut env = BTreeMap::new();
        env.insert("KERNEL_VOLUMES".to_string(), json!("already-a-string"));
        let normalized = normalize_env(env);
        assert_eq!(normalized["KERNEL_VOLUMES"], json!("already-a-string"));
    }

    #[test]
    fn create_kernel_request_omits_absent_fields() {
        let req = CreateKernelRequest::default();
        assert_eq!(serde_json::to_value(&req).unwrap(), json!({}));

        let req = CreateKernelRequest {
            name: Some("python3".to_string()),
            env: None,
        };
        assert_eq!(
            serde_json::to_value(&req).unwrap(),
            json!({"name": "python3"})
        );
    }

    #[test]
    fn kernel_info_decodes_gateway_payload() {
        let raw = json!({
            "id": "6f32f59a-7c3f-4a31-9c65-2e9a5f3b0a11",
            "name": "python_kubernetes",
            "last_activity": "2024-05-06T03:30:00.000000Z",
            "execution_state": "starting",
            "connections": 0
        });
        let kernel: KernelInfo = serde_json::from_value(raw).unwrap();
        assert_eq!(kernel.execution_state, ExecutionState::Starting);
        assert_eq!(kernel.connections, 0);
    }
}
