//! JSON frames exchanged with chat clients.
//!
//! Every frame has the same envelope:
//! ```text
//! { "type": "join" | "leave" | "message" | "user_list" | "message_history",
//!   "data": <any>, "roomId": "...", "userId": "...", "token": "..."? }
//! ```

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameType {
    Join,
    Leave,
    Message,
    UserList,
    MessageHistory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatFrame {
    #[serde(rename = "type")]
    pub frame_type: FrameType,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub room_id: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl ChatFrame {
    pub fn new(frame_type: FrameType, room_id: impl Into<String>, user_id: impl Into<String>, data: Value) -> Self {
        Self {
            frame_type,
            data,
            room_id: room_id.into(),
            user_id: user_id.into(),
            token: None,
        }
    }

    /// A client message relayed to the rest of the room.
    pub fn message(room_id: &str, message: &ChatMessage) -> Result<Self, ProtocolError> {
        Ok(Self::new(
            FrameType::Message,
            room_id,
            message.user_id.clone(),
            serde_json::to_value(message)?,
        ))
    }

    /// System notice that `user` joined or left.
    pub fn presence_notice(frame_type: FrameType, room_id: &str, user: &OnlineUser) -> Self {
        let verb = match frame_type {
            FrameType::Leave => "left",
            _ => "joined",
        };
        Self::new(
            frame_type,
            room_id,
            user.user_id.clone(),
            json!({
                "userId": user.user_id,
                "userName": user.user_name,
                "message": format!("{} {verb} the room", user.user_name),
                "timestamp": Utc::now().timestamp_millis(),
            }),
        )
    }

    pub fn user_list(room_id: &str, users: &[OnlineUser]) -> Result<Self, ProtocolError> {
        Ok(Self::new(FrameType::UserList, room_id, "", serde_json::to_value(users)?))
    }

    pub fn message_history(room_id: &str, history: &[ChatMessage]) -> Result<Self, ProtocolError> {
        Ok(Self::new(
            FrameType::MessageHistory,
            room_id,
            "",
            serde_json::to_value(history)?,
        ))
    }

    /// Text of a client `message` frame: either a bare string or an object
    /// with a `message` (or `content`) field.
    pub fn message_text(&self) -> Option<&str> {
        match &self.data {
            Value::String(text) => Some(text),
            Value::Object(fields) => fields
                .get("message")
                .or_else(|| fields.get("content"))
                .and_then(Value::as_str),
            _ => None,
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// One chat message as kept in room history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub user_id: String,
    pub user_name: String,
    pub message: String,
    /// Unix milliseconds at the server
    pub timestamp: i64,
}

impl ChatMessage {
    pub fn new(user: &OnlineUser, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user.user_id.clone(),
            user_name: user.user_name.clone(),
            message: message.into(),
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

/// Identity attached to a live socket.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnlineUser {
    pub user_id: String,
    pub user_name: String,
}

impl OnlineUser {
    pub fn new(user_id: impl Into<String>, user_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            user_name: user_name.into(),
        }
    }
}

/// Query parameters of the upgrade request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectParams {
    pub room_id: String,
    pub user: OnlineUser,
    pub token: Option<String>,
}

impl ConnectParams {
    /// Parse `roomId`, `userId`, `userName` and `token` from a query string.
    /// `userName` falls back to the user id.
    pub fn from_query(query: Option<&str>) -> Result<Self, ProtocolError> {
        let (mut room_id, mut user_id, mut user_name, mut token) = (None, None, None, None);
        for (key, value) in url::form_urlencoded::parse(query.unwrap_or("").as_bytes()) {
            let value = value.into_owned();
            match key.as_ref() {
                "roomId" => room_id = Some(value),
                "userId" => user_id = Some(value),
                "userName" => user_name = Some(value),
                "token" => token = Some(value),
                _ => {}
            }
        }

        let room_id = room_id
            .filter(|v| !v.is_empty())
            .ok_or(ProtocolError::MissingParam("roomId"))?;
        let user_id = user_id
            .filter(|v| !v.is_empty())
            .ok_or(ProtocolError::MissingParam("userId"))?;
        let user_name = user_name
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| user_id.clone());

        Ok(Self {
            room_id,
            user: OnlineUser::new(user_id, user_name),
            token: token.filter(|v| !v.is_empty()),
        })
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Missing query parameter: {0}")]
    MissingParam(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_wire_shape() {
        let frame = ChatFrame::new(FrameType::UserList, "room1", "u1", json!([]));
        let value: Value = serde_json::from_str(&frame.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "user_list");
        assert_eq!(value["roomId"], "room1");
        assert_eq!(value["userId"], "u1");
        assert!(value.get("token").is_none());
    }

    #[test]
    fn test_decode_client_message() {
        let frame = ChatFrame::decode(
            r#"{"type":"message","data":{"message":"hi"},"roomId":"r","userId":"u1","token":"t"}"#,
        )
        .unwrap();
        assert_eq!(frame.frame_type, FrameType::Message);
        assert_eq!(frame.message_text(), Some("hi"));
        assert_eq!(frame.token.as_deref(), Some("t"));

        let bare = ChatFrame::decode(r#"{"type":"message","data":"plain"}"#).unwrap();
        assert_eq!(bare.message_text(), Some("plain"));
        assert!(bare.room_id.is_empty());
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        assert!(ChatFrame::decode(r#"{"type":"shout","data":null}"#).is_err());
        assert!(ChatFrame::decode("not json").is_err());
    }

    #[test]
    fn test_presence_notice_text() {
        let user = OnlineUser::new("u1", "Alice");
        let frame = ChatFrame::presence_notice(FrameType::Leave, "r", &user);
        assert_eq!(frame.data["message"], "Alice left the room");
        assert_eq!(frame.data["userId"], "u1");
    }

    #[test]
    fn test_connect_params_from_query() {
        let params =
            ConnectParams::from_query(Some("roomId=repo%201&userId=u1&userName=Al+Ice&token=abc")).unwrap();
        assert_eq!(params.room_id, "repo 1");
        assert_eq!(params.user, OnlineUser::new("u1", "Al Ice"));
        assert_eq!(params.token.as_deref(), Some("abc"));

        let unnamed = ConnectParams::from_query(Some("roomId=r&userId=u2")).unwrap();
        assert_eq!(unnamed.user.user_name, "u2");
        assert!(unnamed.token.is_none());
    }

    #[test]
    fn test_connect_params_missing() {
        assert!(matches!(
            ConnectParams::from_query(Some("userId=u1")),
            Err(ProtocolError::MissingParam("roomId"))
        ));
        assert!(matches!(
            ConnectParams::from_query(Some("roomId=r&userId=")),
            Err(ProtocolError::MissingParam("userId"))
        ));
        assert!(ConnectParams::from_query(None).is_err());
    }
}
