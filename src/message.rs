// =============================================================================
// SYNAPSE NODE : message.rs
// Wire envelope, typed payloads and newline framing
// =============================================================================
//
// Envelope on the wire (one JSON object + '\n'):
//
//   {"type":"PING","id":"PING-…","sender":"<node>","timestamp":"…","payload":{…}}
//
// `type` stays a string in the envelope so unknown kinds survive a round trip.
// `MessageBody` is the closed set of payloads the node understands, decoded
// on demand and matched exhaustively at the dispatch site.
// =============================================================================

use crate::constants::MAX_PEER_LIST_SIZE;
use crate::error::ProtocolError;
use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tokio_util::codec::AnyDelimiterCodec;

// -----------------------------------------------------------------------------
// MessageType
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageType {
    Hello,
    PeerList,
    DataSync,
    Heartbeat,
    Error,
    Ping,
    Pong,
    SyncRequest,
    SyncResponse,
    Other(String),
}

impl MessageType {
    pub fn parse(code: &str) -> Self {
        match code {
            "HELLO" => MessageType::Hello,
            "PEER_LIST" => MessageType::PeerList,
            "DATA_SYNC" => MessageType::DataSync,
            "HEARTBEAT" => MessageType::Heartbeat,
            "ERROR" => MessageType::Error,
            "PING" => MessageType::Ping,
            "PONG" => MessageType::Pong,
            "SYNC_REQUEST" => MessageType::SyncRequest,
            "SYNC_RESPONSE" => MessageType::SyncResponse,
            other => MessageType::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            MessageType::Hello => "HELLO",
            MessageType::PeerList => "PEER_LIST",
            MessageType::DataSync => "DATA_SYNC",
            MessageType::Heartbeat => "HEARTBEAT",
            MessageType::Error => "ERROR",
            MessageType::Ping => "PING",
            MessageType::Pong => "PONG",
            MessageType::SyncRequest => "SYNC_REQUEST",
            MessageType::SyncResponse => "SYNC_RESPONSE",
            MessageType::Other(code) => code,
        }
    }

    /// Kinds served by a fixed handler on the read loop; the rest go to the backlog.
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            MessageType::Hello
                | MessageType::Heartbeat
                | MessageType::PeerList
                | MessageType::Ping
                | MessageType::Pong
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// -----------------------------------------------------------------------------
// Payloads
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelloPayload {
    pub node_id: String,
    pub version: String,
    pub listen_port: u16,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub id: String,
    pub address: String,
    pub version: String,
    pub last_seen: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerListPayload {
    pub peers: Vec<PeerRecord>,
}

impl PeerListPayload {
    pub fn capped(mut peers: Vec<PeerRecord>) -> Self {
        peers.truncate(MAX_PEER_LIST_SIZE);
        PeerListPayload { peers }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSyncPayload {
    pub data_id: String,
    #[serde(rename = "type")]
    pub data_type: String,
    pub content: Value,
    pub version: i64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub node_id: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingPayload {
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PongPayload {
    pub timestamp_ms: i64,
    pub request_id: String,
    /// The `timestamp_ms` of the PING being answered.
    pub echo_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRequestPayload {
    pub data_id: String,
    #[serde(default)]
    pub since_version: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncResponsePayload {
    pub data_id: String,
    #[serde(default)]
    pub items: Vec<Value>,
}

// -----------------------------------------------------------------------------
// MessageBody : typed view of an envelope payload
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    Hello(HelloPayload),
    PeerList(PeerListPayload),
    DataSync(DataSyncPayload),
    Heartbeat(HeartbeatPayload),
    Error(ErrorPayload),
    Ping(PingPayload),
    Pong(PongPayload),
    SyncRequest(SyncRequestPayload),
    SyncResponse(SyncResponsePayload),
    Other { kind: String, payload: Value },
}

impl MessageBody {
    pub fn message_type(&self) -> MessageType {
        match self {
            MessageBody::Hello(_) => MessageType::Hello,
            MessageBody::PeerList(_) => MessageType::PeerList,
            MessageBody::DataSync(_) => MessageType::DataSync,
            MessageBody::Heartbeat(_) => MessageType::Heartbeat,
            MessageBody::Error(_) => MessageType::Error,
            MessageBody::Ping(_) => MessageType::Ping,
            MessageBody::Pong(_) => MessageType::Pong,
            MessageBody::SyncRequest(_) => MessageType::SyncRequest,
            MessageBody::SyncResponse(_) => MessageType::SyncResponse,
            MessageBody::Other { kind, .. } => MessageType::parse(kind),
        }
    }

    fn to_payload(&self) -> Result<Value, serde_json::Error> {
        match self {
            MessageBody::Hello(p) => serde_json::to_value(p),
            MessageBody::PeerList(p) => serde_json::to_value(p),
            MessageBody::DataSync(p) => serde_json::to_value(p),
            MessageBody::Heartbeat(p) => serde_json::to_value(p),
            MessageBody::Error(p) => serde_json::to_value(p),
            MessageBody::Ping(p) => serde_json::to_value(p),
            MessageBody::Pong(p) => serde_json::to_value(p),
            MessageBody::SyncRequest(p) => serde_json::to_value(p),
            MessageBody::SyncResponse(p) => serde_json::to_value(p),
            MessageBody::Other { payload, .. } => Ok(payload.clone()),
        }
    }
}

// -----------------------------------------------------------------------------
// Message : the envelope
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type", default)]
    pub msg_type: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub sender: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: Value,
}

impl Message {
    pub fn new(sender: &str, body: MessageBody) -> Result<Self, ProtocolError> {
        let kind = body.message_type();
        Ok(Message {
            id: format!("{}-{}", kind, uuid::Uuid::new_v4()),
            msg_type: kind.as_str().to_string(),
            sender: sender.to_string(),
            timestamp: Utc::now(),
            payload: body.to_payload()?,
        })
    }

    pub fn kind(&self) -> MessageType {
        MessageType::parse(&self.msg_type)
    }

    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.msg_type.is_empty() {
            return Err(ProtocolError::EmptyField("type"));
        }
        if self.id.is_empty() {
            return Err(ProtocolError::EmptyField("id"));
        }
        if self.sender.is_empty() {
            return Err(ProtocolError::EmptyField("sender"));
        }
        Ok(())
    }

    /// Decode the payload into its typed form.
    pub fn body(&self) -> Result<MessageBody, ProtocolError> {
        let kind = self.kind();
        let body = match &kind {
            MessageType::Hello => MessageBody::Hello(self.decode_payload(&kind)?),
            MessageType::PeerList => MessageBody::PeerList(self.decode_payload(&kind)?),
            MessageType::DataSync => MessageBody::DataSync(self.decode_payload(&kind)?),
            MessageType::Heartbeat => MessageBody::Heartbeat(self.decode_payload(&kind)?),
            MessageType::Error => MessageBody::Error(self.decode_payload(&kind)?),
            MessageType::Ping => MessageBody::Ping(self.decode_payload(&kind)?),
            MessageType::Pong => MessageBody::Pong(self.decode_payload(&kind)?),
            MessageType::SyncRequest => MessageBody::SyncRequest(self.decode_payload(&kind)?),
            MessageType::SyncResponse => MessageBody::SyncResponse(self.decode_payload(&kind)?),
            MessageType::Other(code) => MessageBody::Other {
                kind: code.clone(),
                payload: self.payload.clone(),
            },
        };
        Ok(body)
    }

    fn decode_payload<T: DeserializeOwned>(&self, kind: &MessageType) -> Result<T, ProtocolError> {
        T::deserialize(&self.payload).map_err(|e| ProtocolError::PayloadMismatch {
            kind: kind.to_string(),
            reason: e.to_string(),
        })
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Serialize and append the frame delimiter. `max_len` is the same cap
    /// the read side enforces, so a frame we send is one a peer can read.
    pub fn encode_frame(&self, max_len: usize) -> Result<Bytes, ProtocolError> {
        let json = serde_json::to_vec(self)?;
        if json.len() > max_len {
            return Err(ProtocolError::FrameTooLarge { limit: max_len });
        }
        let mut buf = BytesMut::with_capacity(json.len() + 1);
        buf.put_slice(&json);
        buf.put_u8(FRAME_DELIMITER);
        Ok(buf.freeze())
    }

    /// Parse one frame (delimiter already stripped) and validate it.
    /// Bytes are not required to be UTF-8 up front; serde reports that.
    pub fn from_frame(line: &[u8]) -> Result<Self, ProtocolError> {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let msg: Message = serde_json::from_slice(line)?;
        msg.validate()?;
        Ok(msg)
    }
}

pub const FRAME_DELIMITER: u8 = b'\n';

/// Read-side codec: newline-delimited byte frames capped at `max_len` bytes.
/// Works on raw bytes so a non-UTF-8 frame is one bad message, not a broken
/// stream.
pub fn frame_codec(max_len: usize) -> AnyDelimiterCodec {
    AnyDelimiterCodec::new_with_max_length(vec![FRAME_DELIMITER], Vec::new(), max_len)
}
