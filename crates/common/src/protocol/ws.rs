// WebSocket wire protocol: `{operation, data, time?}` JSON envelopes.
//
// The envelope tag selects a strongly typed payload. Anything that does not
// decode into a known operation is a `SyncError::MalformedMessage`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SyncError;
use crate::types::{line_count, Anchor, LineId, PeerInfo, Position};

/// Every operation tag the protocol recognizes.
pub const OPERATIONS: &[&str] = &[
    "userJoined",
    "userLeft",
    "activeUsers",
    "cursorMoved",
    "textReplaced",
    "sendFile",
    "idArray",
    "chatMsg",
    "getCursors",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserJoined {
    pub user_id: String,
    pub user_name: String,
    pub user_display_name: String,
    pub project: String,
}

impl UserJoined {
    pub fn peer_info(&self) -> PeerInfo {
        PeerInfo {
            user_id: self.user_id.clone(),
            user_name: self.user_name.clone(),
            user_display_name: self.user_display_name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserLeft {
    pub user_id: String,
    pub project: String,
}

/// Presence: `cursor` is the active end of the selection, `selection_end`
/// the other end. Both are raw line/character positions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorMoved {
    pub path_name: String,
    pub cursor: Position,
    pub selection_end: Position,
    pub user_id: String,
    pub project: String,
}

/// Replace the text between `from` and `to` with `content`; the line breaks
/// in `content` create lines identified by `new_line_ids`, in order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextReplaced {
    pub path_name: String,
    pub from: Anchor,
    pub to: Anchor,
    pub content: String,
    #[serde(default)]
    pub new_line_ids: Vec<LineId>,
    pub user_id: String,
    pub project: String,
}

/// Client announcement of a document's current shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendFile {
    pub path_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    pub user_id: String,
    pub project: String,
}

impl SendFile {
    /// Number of lines the relay should mint ids for.
    pub fn resolved_line_count(&self) -> Option<usize> {
        self.line_count.or_else(|| self.content.as_deref().map(line_count))
    }
}

/// Relay request for a client to (re-)announce a document. Shares the
/// `sendFile` tag; carries no file data.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdArray {
    pub project: String,
    pub path_name: String,
    pub id_array: Vec<LineId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMsg {
    pub msg: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<i64>,
    pub project: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetCursors {
    pub user_id: String,
    pub project: String,
}

/// All protocol operations with their typed payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    UserJoined(UserJoined),
    UserLeft(UserLeft),
    /// Server -> Client: current room members, sent to a joiner.
    ActiveUsers(Vec<PeerInfo>),
    CursorMoved(CursorMoved),
    TextReplaced(TextReplaced),
    /// Client -> Server: document announcement.
    SendFile(SendFile),
    /// Server -> Client: please announce the document again.
    FileRequest(FileRequest),
    /// Server -> Client: the authoritative table for a document.
    IdArray(IdArray),
    ChatMsg(ChatMsg),
    GetCursors(GetCursors),
}

impl Operation {
    /// The wire tag of this operation.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::UserJoined(_) => "userJoined",
            Self::UserLeft(_) => "userLeft",
            Self::ActiveUsers(_) => "activeUsers",
            Self::CursorMoved(_) => "cursorMoved",
            Self::TextReplaced(_) => "textReplaced",
            Self::SendFile(_) | Self::FileRequest(_) => "sendFile",
            Self::IdArray(_) => "idArray",
            Self::ChatMsg(_) => "chatMsg",
            Self::GetCursors(_) => "getCursors",
        }
    }

    /// Room this operation is addressed to, when it names one.
    pub fn project(&self) -> Option<&str> {
        match self {
            Self::UserJoined(data) => Some(&data.project),
            Self::UserLeft(data) => Some(&data.project),
            Self::ActiveUsers(_) => None,
            Self::CursorMoved(data) => Some(&data.project),
            Self::TextReplaced(data) => Some(&data.project),
            Self::SendFile(data) => Some(&data.project),
            Self::FileRequest(data) => data.project.as_deref(),
            Self::IdArray(data) => Some(&data.project),
            Self::ChatMsg(data) => Some(&data.project),
            Self::GetCursors(data) => Some(&data.project),
        }
    }

    /// Originating user, when the operation carries one.
    pub fn user_id(&self) -> Option<&str> {
        match self {
            Self::UserJoined(data) => Some(&data.user_id),
            Self::UserLeft(data) => Some(&data.user_id),
            Self::CursorMoved(data) => Some(&data.user_id),
            Self::TextReplaced(data) => Some(&data.user_id),
            Self::SendFile(data) => Some(&data.user_id),
            Self::ChatMsg(data) => Some(&data.user_id),
            Self::GetCursors(data) => Some(&data.user_id),
            Self::ActiveUsers(_) | Self::FileRequest(_) | Self::IdArray(_) => None,
        }
    }

    fn data(&self) -> Result<Value, serde_json::Error> {
        match self {
            Self::UserJoined(data) => serde_json::to_value(data),
            Self::UserLeft(data) => serde_json::to_value(data),
            Self::ActiveUsers(data) => serde_json::to_value(data),
            Self::CursorMoved(data) => serde_json::to_value(data),
            Self::TextReplaced(data) => serde_json::to_value(data),
            Self::SendFile(data) => serde_json::to_value(data),
            Self::FileRequest(data) => serde_json::to_value(data),
            Self::IdArray(data) => serde_json::to_value(data),
            Self::ChatMsg(data) => serde_json::to_value(data),
            Self::GetCursors(data) => serde_json::to_value(data),
        }
    }
}

/// One framed protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub operation: Operation,
    /// Relay broadcast time, Unix epoch milliseconds.
    pub time: Option<i64>,
}

#[derive(Deserialize)]
struct RawEnvelope {
    operation: String,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    time: Option<i64>,
}

#[derive(Serialize)]
struct WireEnvelope<'a> {
    operation: &'a str,
    data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    time: Option<i64>,
}

impl Envelope {
    pub fn new(operation: Operation) -> Self {
        Self { operation, time: None }
    }

    pub fn stamped(operation: Operation, time: i64) -> Self {
        Self { operation, time: Some(time) }
    }

    /// Decode a text frame.
    pub fn decode(raw: &str) -> Result<Self, SyncError> {
        let envelope: RawEnvelope = serde_json::from_str(raw)
            .map_err(|e| SyncError::malformed(format!("invalid envelope: {e}")))?;
        let RawEnvelope { operation, data, time } = envelope;

        let operation = match operation.as_str() {
            "userJoined" => Operation::UserJoined(payload(&operation, data)?),
            "userLeft" => Operation::UserLeft(payload(&operation, data)?),
            "activeUsers" => Operation::ActiveUsers(payload(&operation, data)?),
            "cursorMoved" => Operation::CursorMoved(payload(&operation, data)?),
            "textReplaced" => Operation::TextReplaced(payload(&operation, data)?),
            "sendFile" if carries_file_data(&data) => {
                Operation::SendFile(payload(&operation, data)?)
            }
            "sendFile" if data.is_null() => Operation::FileRequest(FileRequest::default()),
            "sendFile" => Operation::FileRequest(payload(&operation, data)?),
            "idArray" => Operation::IdArray(payload(&operation, data)?),
            "chatMsg" => Operation::ChatMsg(payload(&operation, data)?),
            "getCursors" => Operation::GetCursors(payload(&operation, data)?),
            other => return Err(SyncError::malformed(format!("unknown operation '{other}'"))),
        };

        Ok(Self { operation, time })
    }

    /// Encode as a single-line JSON text frame.
    pub fn encode(&self) -> Result<String, SyncError> {
        let data = self
            .operation
            .data()
            .map_err(|e| SyncError::malformed(format!("unencodable payload: {e}")))?;
        let wire = WireEnvelope { operation: self.operation.tag(), data, time: self.time };
        serde_json::to_string(&wire)
            .map_err(|e| SyncError::malformed(format!("unencodable envelope: {e}")))
    }
}

impl From<Operation> for Envelope {
    fn from(operation: Operation) -> Self {
        Self::new(operation)
    }
}

fn carries_file_data(data: &Value) -> bool {
    ["lineCount", "content"].iter().any(|key| data.get(key).is_some_and(|v| !v.is_null()))
}

fn payload<T: DeserializeOwned>(operation: &str, data: Value) -> Result<T, SyncError> {
    serde_json::from_value(data)
        .map_err(|e| SyncError::malformed(format!("invalid '{operation}' payload: {e}")))
}
