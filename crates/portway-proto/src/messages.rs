//! Control channel message envelope
//!
//! Every message is a JSON object discriminated by its `type` field
//! (`"REQUEST"`, `"TCP_DATA"`, ...). Field names are camelCase on the wire.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// HTTP headers as carried on the wire (single value per name)
pub type Headers = BTreeMap<String, String>;

/// Messages exchanged between the relay and a tunnel client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum TunnelMessage {
    /// Client → relay: open a tunnel on this channel
    Register { payload: RegisterPayload },
    /// Relay → client: tunnel is live
    Registered { payload: RegisteredPayload },
    /// Relay → client: forward an HTTP request to the local service
    Request {
        request_id: String,
        payload: HttpRequestPayload,
    },
    /// Client → relay: response for a previously forwarded request
    Response {
        request_id: String,
        payload: HttpResponsePayload,
    },
    /// Either direction: a failure, optionally tied to one request
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        payload: ErrorPayload,
    },
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
    /// Relay → client: a public TCP connection was accepted
    TcpConnect {
        connection_id: String,
        payload: TcpConnectPayload,
    },
    /// Either direction: raw bytes for one TCP connection
    TcpData {
        connection_id: String,
        payload: TcpDataPayload,
    },
    /// Either direction: the TCP connection was closed
    TcpClose { connection_id: String },
    /// Either direction: the TCP connection failed
    TcpError {
        connection_id: String,
        payload: ErrorPayload,
    },
}

impl TunnelMessage {
    /// Wire name of the message type, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            TunnelMessage::Register { .. } => "REGISTER",
            TunnelMessage::Registered { .. } => "REGISTERED",
            TunnelMessage::Request { .. } => "REQUEST",
            TunnelMessage::Response { .. } => "RESPONSE",
            TunnelMessage::Error { .. } => "ERROR",
            TunnelMessage::Ping { .. } => "PING",
            TunnelMessage::Pong { .. } => "PONG",
            TunnelMessage::TcpConnect { .. } => "TCP_CONNECT",
            TunnelMessage::TcpData { .. } => "TCP_DATA",
            TunnelMessage::TcpClose { .. } => "TCP_CLOSE",
            TunnelMessage::TcpError { .. } => "TCP_ERROR",
        }
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        TunnelMessage::Error {
            request_id: None,
            payload: ErrorPayload::new(code, message),
        }
    }
}

/// Kind of tunnel requested during registration
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TunnelKind {
    #[default]
    Http,
    Tcp,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RegisterPayload {
    #[serde(default)]
    pub tunnel_type: TunnelKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subdomain: Option<String>,
    pub local_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Comma/space separated literal IPs or CIDR ranges
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_allow_list: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in_secs: Option<u64>,
    #[serde(default)]
    pub inspect: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredPayload {
    pub tunnel_id: String,
    pub subdomain: String,
    pub public_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HttpRequestPayload {
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HttpResponsePayload {
    pub status_code: u16,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

impl ErrorPayload {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            retry_after_secs: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TcpConnectPayload {
    pub remote_address: String,
    pub remote_port: u16,
    pub local_port: u16,
}

/// Base64-encoded chunk of a TCP stream
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TcpDataPayload {
    pub data: String,
}

impl TcpDataPayload {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            data: STANDARD.encode(bytes),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, base64::DecodeError> {
        STANDARD.decode(&self.data)
    }
}
