//! Wire framing
//!
//! Outbound: `type "\n" JSON(payload)`, or the bare type for payload-less
//! packets. Inbound: one JSON object per frame whose `packet` field names
//! the type.

use serde::de::DeserializeOwned;
use serde::Serialize;
use shc_core::{ShcError, ShcResult};

/// A typed outbound request. `KIND` is the packet type tag.
pub trait Request: Serialize {
    const KIND: &'static str;

    /// Packets like `get_chats` go out as the bare type with no payload line.
    const BARE: bool = false;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundPacket {
    pub kind: String,
    pub body: Option<String>,
}

impl OutboundPacket {
    pub fn new(kind: impl Into<String>, payload: &impl Serialize) -> ShcResult<Self> {
        let body = serde_json::to_string(payload)
            .map_err(|e| ShcError::Transport(format!("serializing packet payload: {e}")))?;
        Ok(Self {
            kind: kind.into(),
            body: Some(body),
        })
    }

    pub fn bare(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            body: None,
        }
    }

    pub fn from_request<R: Request>(request: &R) -> ShcResult<Self> {
        if R::BARE {
            Ok(Self::bare(R::KIND))
        } else {
            Self::new(R::KIND, request)
        }
    }

    /// The frame as written to the socket.
    pub fn frame(&self) -> String {
        match &self.body {
            Some(body) => format!("{}\n{}", self.kind, body),
            None => self.kind.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InboundPacket {
    pub kind: String,
    pub payload: serde_json::Value,
}

impl InboundPacket {
    pub fn parse(frame: &str) -> ShcResult<Self> {
        let payload: serde_json::Value = serde_json::from_str(frame)
            .map_err(|e| ShcError::Transport(format!("inbound frame is not JSON: {e}")))?;
        let kind = payload
            .get("packet")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ShcError::Transport("inbound frame has no packet field".into()))?
            .to_owned();
        Ok(Self { kind, payload })
    }

    /// Deserialize the whole object into a typed payload.
    pub fn decode<T: DeserializeOwned>(&self) -> ShcResult<T> {
        T::deserialize(&self.payload).map_err(|e| {
            ShcError::Transport(format!("decoding {} packet: {e}", self.kind))
        })
    }
}
