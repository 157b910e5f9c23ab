use base64::Engine;
use serde::{Deserialize, Serialize};

use super::{ConnId, TunnelId};
use crate::tunnel::TunnelType;

/// Outgoing message types (Client -> Relay)
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutgoingMessage {
    /// Ask for a fresh tunnel of the given kind
    Hello { tunnel_type: TunnelType },
    /// Re-attach to a tunnel allocated earlier
    Resume { tunnel_id: TunnelId, token: String },
    ConnData { conn_id: ConnId, data: String },
    ConnClose { conn_id: ConnId, reason: String },
    Pong { timestamp: u64 },
}

/// Incoming message types (Relay -> Client)
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IncomingMessage {
    Ready {
        tunnel_id: TunnelId,
        token: String,
        address: String,
        #[serde(default)]
        version: Option<String>,
    },
    Rejected {
        code: String,
        message: String,
    },
    ConnOpen {
        conn_id: ConnId,
        #[serde(default)]
        remote_addr: Option<String>,
    },
    ConnData {
        conn_id: ConnId,
        data: String,
    },
    ConnClose {
        conn_id: ConnId,
        #[serde(default)]
        reason: Option<String>,
    },
    Ping {
        timestamp: u64,
    },
    Error {
        code: String,
        message: String,
    },
}

impl OutgoingMessage {
    pub fn hello(tunnel_type: TunnelType) -> Self {
        OutgoingMessage::Hello { tunnel_type }
    }

    pub fn resume(tunnel_id: &TunnelId, token: &str) -> Self {
        OutgoingMessage::Resume {
            tunnel_id: tunnel_id.clone(),
            token: token.to_string(),
        }
    }

    pub fn conn_data(conn_id: &ConnId, data: &[u8]) -> Self {
        OutgoingMessage::ConnData {
            conn_id: conn_id.clone(),
            data: base64::engine::general_purpose::STANDARD.encode(data),
        }
    }

    pub fn conn_close(conn_id: &ConnId, reason: &str) -> Self {
        OutgoingMessage::ConnClose {
            conn_id: conn_id.clone(),
            reason: reason.to_string(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl IncomingMessage {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

pub fn decode_data(data: &str) -> Option<Vec<u8>> {
    base64::engine::general_purpose::STANDARD.decode(data).ok()
}
