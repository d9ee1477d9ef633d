//! Wire envelope exchanged between routers.
//!
//! Every frame carries one [`Message`]:
//!
//! ```json
//! {"id": "...", "type": "request", "method": "worker.runTask", "params": {...}}
//! ```
//!
//! Responses reuse the request's id and carry either `result` or `error`.
//! Bulk data rides along either as `inline` (base64, below the inline
//! threshold) or as a `bufferHandle` naming a shared-memory region.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorPayload;
use crate::process::ProcessId;

/// Request parameters: always a JSON object on the wire.
pub type Params = serde_json::Map<String, Value>;

/// Links a request to its response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(uuid::Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn from_uuid(uuid: uuid::Uuid) -> Self {
        Self(uuid)
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(uuid::Uuid::parse_str(s)?))
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Request,
    Response,
    Event,
}

/// Name of a POSIX shared-memory object, always `/sy-` followed by 24 hex digits.
///
/// Handles arrive from peers and are passed to `shm_open`, so anything that
/// does not look like one of ours is rejected at deserialization.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BufferHandle(String);

const HANDLE_PREFIX: &str = "/sy-";
const HANDLE_HEX_LEN: usize = 24;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid buffer handle {0:?}")]
pub struct InvalidBufferHandle(pub String);

impl BufferHandle {
    pub fn generate() -> Self {
        let hex = uuid::Uuid::new_v4().simple().to_string();
        Self(format!("{HANDLE_PREFIX}{}", &hex[..HANDLE_HEX_LEN]))
    }

    pub fn parse(s: impl Into<String>) -> Result<Self, InvalidBufferHandle> {
        let s = s.into();
        let valid = s
            .strip_prefix(HANDLE_PREFIX)
            .is_some_and(|hex| {
                hex.len() == HANDLE_HEX_LEN
                    && hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
            });
        if valid {
            Ok(Self(s))
        } else {
            Err(InvalidBufferHandle(s))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for BufferHandle {
    type Error = InvalidBufferHandle;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<BufferHandle> for String {
    fn from(handle: BufferHandle) -> Self {
        handle.0
    }
}

impl std::fmt::Display for BufferHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything a receiver needs to map and verify a shared buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferRef {
    pub handle: BufferHandle,
    pub size: u64,
    /// CRC-32 of the first `size` bytes.
    pub checksum: u32,
    pub content_type: String,
    pub owner: ProcessId,
}

/// Small binary payload carried inside the envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlinePayload {
    pub content_type: String,
    /// Standard base64.
    pub data: String,
}

impl InlinePayload {
    pub fn encode(content_type: impl Into<String>, bytes: &[u8]) -> Self {
        Self {
            content_type: content_type.into(),
            data: BASE64.encode(bytes),
        }
    }

    pub fn decode(&self) -> Result<Vec<u8>, base64::DecodeError> {
        BASE64.decode(&self.data)
    }
}

/// One framed unit on a channel. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    id: CorrelationId,
    #[serde(rename = "type")]
    kind: MessageKind,
    method: String,
    #[serde(default)]
    params: Params,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(
        rename = "bufferHandle",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    buffer: Option<BufferRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    inline: Option<InlinePayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<ErrorPayload>,
}

impl Message {
    pub fn request(id: CorrelationId, method: impl Into<String>, params: Params) -> Self {
        Self::bare(id, MessageKind::Request, method.into(), params)
    }

    pub fn event(method: impl Into<String>, params: Params) -> Self {
        Self::bare(CorrelationId::new(), MessageKind::Event, method.into(), params)
    }

    /// Successful response to `request`.
    pub fn response_to(request: &Message, result: Value) -> Self {
        Self::response(request.id, request.method.clone(), result)
    }

    /// Successful response for the request with `id`.
    pub fn response(id: CorrelationId, method: impl Into<String>, result: Value) -> Self {
        let mut msg = Self::bare(id, MessageKind::Response, method.into(), Params::new());
        msg.result = Some(result);
        msg
    }

    /// Error response for the request with `id`.
    pub fn error_response(id: CorrelationId, method: impl Into<String>, error: ErrorPayload) -> Self {
        let mut msg = Self::bare(id, MessageKind::Response, method.into(), Params::new());
        msg.error = Some(error);
        msg
    }

    fn bare(id: CorrelationId, kind: MessageKind, method: String, params: Params) -> Self {
        Self {
            id,
            kind,
            method,
            params,
            result: None,
            buffer: None,
            inline: None,
            error: None,
        }
    }

    pub fn with_buffer(mut self, buffer: BufferRef) -> Self {
        self.inline = None;
        self.buffer = Some(buffer);
        self
    }

    pub fn with_inline(mut self, inline: InlinePayload) -> Self {
        self.buffer = None;
        self.inline = Some(inline);
        self
    }

    pub fn id(&self) -> CorrelationId {
        self.id
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn result(&self) -> Option<&Value> {
        self.result.as_ref()
    }

    pub fn buffer(&self) -> Option<&BufferRef> {
        self.buffer.as_ref()
    }

    pub fn inline(&self) -> Option<&InlinePayload> {
        self.inline.as_ref()
    }

    pub fn error(&self) -> Option<&ErrorPayload> {
        self.error.as_ref()
    }

    pub fn is_control(&self) -> bool {
        control::is_control(&self.method)
    }

    pub fn into_parts(self) -> MessageParts {
        MessageParts {
            id: self.id,
            kind: self.kind,
            method: self.method,
            params: self.params,
            result: self.result,
            buffer: self.buffer,
            inline: self.inline,
            error: self.error,
        }
    }
}

/// Owned fields of a [`Message`], for consumers that take it apart.
#[derive(Debug)]
pub struct MessageParts {
    pub id: CorrelationId,
    pub kind: MessageKind,
    pub method: String,
    pub params: Params,
    pub result: Option<Value>,
    pub buffer: Option<BufferRef>,
    pub inline: Option<InlinePayload>,
    pub error: Option<ErrorPayload>,
}

/// Router-internal events. Never seen by the enforcer or by handlers.
pub mod control {
    use serde::{Deserialize, Serialize};

    use super::{BufferHandle, CorrelationId};

    pub const HEARTBEAT: &str = "$heartbeat";
    pub const CANCEL: &str = "$cancel";
    pub const RELEASE: &str = "$release";

    pub fn is_control(method: &str) -> bool {
        method.starts_with('$')
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct Cancel {
        pub id: CorrelationId,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct Release {
        pub handle: BufferHandle,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid method name {0:?}: expected namespace.method with [A-Za-z0-9_-] segments")]
pub struct InvalidMethodName(pub String);

/// `namespace.method`: at least two non-empty dot-separated segments of
/// `[A-Za-z0-9_-]`.
pub fn validate_method_name(name: &str) -> Result<(), InvalidMethodName> {
    let mut segments = 0;
    for segment in name.split('.') {
        if segment.is_empty()
            || !segment
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
        {
            return Err(InvalidMethodName(name.to_string()));
        }
        segments += 1;
    }
    if segments < 2 {
        return Err(InvalidMethodName(name.to_string()));
    }
    Ok(())
}
