//! Relay wire messages.
//!
//! Frames are JSON text of the shape `{ "type", "src", "dst", "payload" }`.
//! Every inbound frame is parsed exactly once into [`SignalingMessage`]; the
//! rest of the crate never touches raw JSON.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

const MEDIA_CONNECTION_TYPE: &str = "media";
const BROWSER_TAG: &str = "peercall";

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid json: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("{kind} message is missing `{field}`")]
    MissingField { kind: String, field: &'static str },
    #[error("{kind} message has an invalid payload: {reason}")]
    InvalidPayload { kind: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

impl SdpType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescriptor {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescriptor {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidateRecord {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_m_line_index: Option<u32>,
}

/// A typed relay message. `src` is stamped by the relay on delivery and is
/// therefore absent on messages built locally.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingMessage {
    /// The relay accepted our identity.
    Open,
    Offer {
        src: Option<String>,
        dst: Option<String>,
        description: SessionDescriptor,
        connection_id: String,
    },
    Answer {
        src: Option<String>,
        dst: Option<String>,
        description: SessionDescriptor,
        connection_id: String,
    },
    Candidate {
        src: Option<String>,
        dst: Option<String>,
        candidate: IceCandidateRecord,
        connection_id: String,
    },
    Leave {
        src: Option<String>,
        dst: Option<String>,
    },
    Heartbeat,
    /// The identity we connected with is already in use.
    IdTaken,
    /// A message we sent could not be delivered to `src`.
    Expire {
        src: Option<String>,
    },
    Error {
        message: String,
    },
    Unknown {
        kind: String,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    src: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    dst: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<Value>,
}

impl SignalingMessage {
    pub fn offer(dst: &str, description: SessionDescriptor, connection_id: &str) -> Self {
        Self::Offer {
            src: None,
            dst: Some(dst.to_string()),
            description,
            connection_id: connection_id.to_string(),
        }
    }

    pub fn answer(dst: &str, description: SessionDescriptor, connection_id: &str) -> Self {
        Self::Answer {
            src: None,
            dst: Some(dst.to_string()),
            description,
            connection_id: connection_id.to_string(),
        }
    }

    pub fn candidate(dst: &str, candidate: IceCandidateRecord, connection_id: &str) -> Self {
        Self::Candidate {
            src: None,
            dst: Some(dst.to_string()),
            candidate,
            connection_id: connection_id.to_string(),
        }
    }

    pub fn leave(dst: &str) -> Self {
        Self::Leave {
            src: None,
            dst: Some(dst.to_string()),
        }
    }

    /// Wire name of the message type.
    pub fn kind(&self) -> &str {
        match self {
            Self::Open => "OPEN",
            Self::Offer { .. } => "OFFER",
            Self::Answer { .. } => "ANSWER",
            Self::Candidate { .. } => "CANDIDATE",
            Self::Leave { .. } => "LEAVE",
            Self::Heartbeat => "HEARTBEAT",
            Self::IdTaken => "ID-TAKEN",
            Self::Expire { .. } => "EXPIRE",
            Self::Error { .. } => "ERROR",
            Self::Unknown { kind } => kind,
        }
    }

    /// The identity that sent this message, when the relay stamped one.
    pub fn source(&self) -> Option<&str> {
        match self {
            Self::Offer { src, .. }
            | Self::Answer { src, .. }
            | Self::Candidate { src, .. }
            | Self::Leave { src, .. }
            | Self::Expire { src } => src.as_deref(),
            _ => None,
        }
    }

    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let envelope: Envelope = serde_json::from_str(text)?;
        let Envelope {
            kind,
            src,
            dst,
            payload,
        } = envelope;

        let message = match kind.as_str() {
            "OPEN" => Self::Open,
            "HEARTBEAT" => Self::Heartbeat,
            "ID-TAKEN" | "ID_TAKEN" => Self::IdTaken,
            "EXPIRE" => Self::Expire { src },
            "LEAVE" => Self::Leave { src, dst },
            "ERROR" => Self::Error {
                message: payload
                    .as_ref()
                    .and_then(|p| p.get("msg"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            },
            "OFFER" | "ANSWER" => {
                let payload = payload.ok_or_else(|| ProtocolError::MissingField {
                    kind: kind.clone(),
                    field: "payload",
                })?;
                let expected = if kind == "OFFER" {
                    SdpType::Offer
                } else {
                    SdpType::Answer
                };
                let description = extract_description(&kind, &payload, expected)?;
                let connection_id = connection_id_of(&payload);
                if expected == SdpType::Offer {
                    Self::Offer {
                        src,
                        dst,
                        description,
                        connection_id,
                    }
                } else {
                    Self::Answer {
                        src,
                        dst,
                        description,
                        connection_id,
                    }
                }
            }
            "CANDIDATE" => {
                let payload = payload.ok_or_else(|| ProtocolError::MissingField {
                    kind: kind.clone(),
                    field: "payload",
                })?;
                let candidate = extract_candidate(&kind, &payload)?;
                Self::Candidate {
                    src,
                    dst,
                    candidate,
                    connection_id: connection_id_of(&payload),
                }
            }
            _ => Self::Unknown { kind },
        };
        Ok(message)
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        let envelope = match self {
            Self::Offer {
                src,
                dst,
                description,
                connection_id,
            } => Envelope {
                kind: "OFFER".to_string(),
                src: src.clone(),
                dst: dst.clone(),
                payload: Some(json!({
                    "sdp": description,
                    "type": MEDIA_CONNECTION_TYPE,
                    "connectionId": connection_id,
                    "browser": BROWSER_TAG,
                    "metadata": {},
                })),
            },
            Self::Answer {
                src,
                dst,
                description,
                connection_id,
            } => Envelope {
                kind: "ANSWER".to_string(),
                src: src.clone(),
                dst: dst.clone(),
                payload: Some(json!({
                    "sdp": description,
                    "type": MEDIA_CONNECTION_TYPE,
                    "connectionId": connection_id,
                    "browser": BROWSER_TAG,
                })),
            },
            Self::Candidate {
                src,
                dst,
                candidate,
                connection_id,
            } => Envelope {
                kind: "CANDIDATE".to_string(),
                src: src.clone(),
                dst: dst.clone(),
                payload: Some(json!({
                    "candidate": candidate,
                    "type": MEDIA_CONNECTION_TYPE,
                    "connectionId": connection_id,
                })),
            },
            Self::Leave { src, dst } => Envelope {
                kind: "LEAVE".to_string(),
                src: src.clone(),
                dst: dst.clone(),
                payload: None,
            },
            Self::Expire { src } => Envelope {
                kind: "EXPIRE".to_string(),
                src: src.clone(),
                dst: None,
                payload: None,
            },
            Self::Error { message } => Envelope {
                kind: "ERROR".to_string(),
                src: None,
                dst: None,
                payload: Some(json!({ "msg": message })),
            },
            other => Envelope {
                kind: other.kind().to_string(),
                src: None,
                dst: None,
                payload: None,
            },
        };
        Ok(serde_json::to_string(&envelope)?)
    }
}

fn connection_id_of(payload: &Value) -> String {
    payload
        .get("connectionId")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Peers in the wild put the description in `payload.sdp` as an object, as a
/// JSON-encoded string of that object, or as the bare SDP text.
fn extract_description(
    kind: &str,
    payload: &Value,
    expected: SdpType,
) -> Result<SessionDescriptor, ProtocolError> {
    let raw = payload.get("sdp").ok_or_else(|| ProtocolError::MissingField {
        kind: kind.to_string(),
        field: "sdp",
    })?;

    let sdp = match raw {
        Value::Object(_) => sdp_text_of(raw),
        Value::String(text) => match serde_json::from_str::<Value>(text) {
            Ok(inner @ Value::Object(_)) => sdp_text_of(&inner),
            _ => Some(text.clone()),
        },
        _ => None,
    };

    match sdp {
        Some(sdp) if !sdp.trim().is_empty() => Ok(SessionDescriptor {
            sdp_type: expected,
            sdp,
        }),
        _ => Err(ProtocolError::InvalidPayload {
            kind: kind.to_string(),
            reason: "no usable session description".to_string(),
        }),
    }
}

fn sdp_text_of(object: &Value) -> Option<String> {
    object.get("sdp").and_then(Value::as_str).map(str::to_string)
}

fn extract_candidate(kind: &str, payload: &Value) -> Result<IceCandidateRecord, ProtocolError> {
    let raw = payload
        .get("candidate")
        .ok_or_else(|| ProtocolError::MissingField {
            kind: kind.to_string(),
            field: "candidate",
        })?;
    let invalid = |e: serde_json::Error| ProtocolError::InvalidPayload {
        kind: kind.to_string(),
        reason: e.to_string(),
    };
    let candidate: IceCandidateRecord = match raw {
        Value::String(text) => serde_json::from_str(text).map_err(invalid)?,
        other => serde_json::from_value(other.clone()).map_err(invalid)?,
    };
    if candidate.candidate.is_empty() {
        return Err(ProtocolError::InvalidPayload {
            kind: kind.to_string(),
            reason: "empty candidate line".to_string(),
        });
    }
    Ok(candidate)
}
