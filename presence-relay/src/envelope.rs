use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::transport::FrameError;

/// Envelopes a participant sends to the directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "message_type", rename_all = "snake_case")]
pub enum DirectoryRequest {
    Register {
        username: String,
        host: String,
        port: u16,
    },
    SendMessage {
        username: String,
        host: String,
        port: u16,
        target: String,
        message: String,
    },
    Leave {
        username: String,
    },
    Delete {
        username: String,
    },
}

impl DirectoryRequest {
    pub fn message_type(&self) -> &'static str {
        match self {
            DirectoryRequest::Register { .. } => "register",
            DirectoryRequest::SendMessage { .. } => "send_message",
            DirectoryRequest::Leave { .. } => "leave",
            DirectoryRequest::Delete { .. } => "delete",
        }
    }

    pub fn username(&self) -> &str {
        match self {
            DirectoryRequest::Register { username, .. }
            | DirectoryRequest::SendMessage { username, .. }
            | DirectoryRequest::Leave { username }
            | DirectoryRequest::Delete { username } => username,
        }
    }
}

/// Envelopes delivered to a participant's listener, either as a directory
/// response or as a relayed message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "message_type", rename_all = "snake_case")]
pub enum ParticipantNotice {
    Registered { message: String },
    UsernameTaken,
    UserNotFound,
    UserOffline,
    SendMessage { sender: String, message: String },
}

impl ParticipantNotice {
    pub fn message_type(&self) -> &'static str {
        match self {
            ParticipantNotice::Registered { .. } => "registered",
            ParticipantNotice::UsernameTaken => "username_taken",
            ParticipantNotice::UserNotFound => "user_not_found",
            ParticipantNotice::UserOffline => "user_offline",
            ParticipantNotice::SendMessage { .. } => "send_message",
        }
    }
}

/// Decodes one complete frame.
///
/// The frame is parsed as generic JSON first so that "not JSON at all" and
/// "JSON, but not an envelope we understand" come back as different errors.
pub fn decode<T>(frame: &[u8]) -> Result<T, FrameError>
where
    T: DeserializeOwned,
{
    if frame.is_empty() {
        return Err(FrameError::Empty);
    }
    let document: serde_json::Value =
        serde_json::from_slice(frame).map_err(FrameError::Malformed)?;
    serde_json::from_value(document).map_err(FrameError::Protocol)
}

pub fn encode<T>(message: &T) -> Result<Vec<u8>, FrameError>
where
    T: Serialize,
{
    serde_json::to_vec(message).map_err(FrameError::Encode)
}
