use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::role::Role;

/// Field every inbound payload must carry as a string.
pub const TYPE_FIELD: &str = "type";

/// Inbound `type` the display may send back to the controller.
pub const POSITION_UPDATE: &str = "positionUpdate";

/// Milliseconds since the unix epoch, as stamped on every outbound message.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Connected,
    Disconnected,
}

impl LinkState {
    pub fn from_occupied(occupied: bool) -> Self {
        if occupied {
            LinkState::Connected
        } else {
            LinkState::Disconnected
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// The requested role already has a connected client
    AlreadyConnected,
}

/// Messages originated by the relay itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    /// Relay -> newly admitted client
    Welcome {
        message: String,
        role: String,
        timestamp: i64,
    },

    /// Relay -> every bound client after a slot transition
    ConnectionStatus {
        controller: LinkState,
        display: LinkState,
        timestamp: i64,
    },

    /// Relay -> rejected client, or a controller whose peer is absent
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<ErrorCode>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<i64>,
    },
}

impl ServerMessage {
    pub fn welcome(role: Option<Role>) -> Self {
        let label = Role::label(role);
        ServerMessage::Welcome {
            message: format!("connected as {label}"),
            role: label.to_string(),
            timestamp: now_millis(),
        }
    }

    pub fn connection_status(controller: bool, display: bool) -> Self {
        ServerMessage::ConnectionStatus {
            controller: LinkState::from_occupied(controller),
            display: LinkState::from_occupied(display),
            timestamp: now_millis(),
        }
    }

    /// Sent to a client whose requested role is already taken.
    pub fn already_connected(role: Role) -> Self {
        let message = match role {
            Role::Controller => {
                "a controller device is already connected; disconnect it and try again"
            }
            Role::Display => "a display device is already connected; disconnect it and try again",
        };
        ServerMessage::Error {
            message: message.to_string(),
            code: Some(ErrorCode::AlreadyConnected),
            timestamp: None,
        }
    }

    /// Sent to the source when its forward target has no open connection.
    pub fn peer_unavailable(target: Role) -> Self {
        ServerMessage::Error {
            message: format!("{target} not connected"),
            code: None,
            timestamp: Some(now_millis()),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("payload is not valid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("payload is not a json object")]
    NotAnObject,
    #[error("payload has no string `type` field")]
    MissingType,
}

/// A client payload: a JSON object with a string `type`. Every other field is
/// opaque to the relay.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    fields: Map<String, Value>,
}

impl InboundMessage {
    pub fn parse(payload: &[u8]) -> Result<Self, MessageError> {
        let Value::Object(fields) = serde_json::from_slice::<Value>(payload)? else {
            return Err(MessageError::NotAnObject);
        };
        match fields.get(TYPE_FIELD) {
            Some(Value::String(_)) => Ok(Self { fields }),
            _ => Err(MessageError::MissingType),
        }
    }

    pub fn kind(&self) -> &str {
        self.fields
            .get(TYPE_FIELD)
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Copy of this message as delivered to the peer. Relay fields win over
    /// client fields of the same name.
    pub fn relayed(&self, timestamp: i64) -> Value {
        let mut fields = self.fields.clone();
        fields.insert("forwarded".to_string(), Value::Bool(true));
        fields.insert("timestamp".to_string(), Value::from(timestamp));
        Value::Object(fields)
    }
}
