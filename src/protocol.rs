use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Random token naming one participant for the length of a call. Only used
/// to break symmetry between the two negotiating sides.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ParticipantId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for ParticipantId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DescriptionKind {
    Offer,
    Answer,
    Rollback,
}

/// Opaque session description blob plus its discriminant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: DescriptionKind,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: DescriptionKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: DescriptionKind::Answer,
            sdp: sdp.into(),
        }
    }

    pub fn rollback() -> Self {
        Self {
            kind: DescriptionKind::Rollback,
            sdp: String::new(),
        }
    }
}

/// Opaque network-path descriptor, carried through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PathCandidate(pub serde_json::Value);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("envelope carries both a description and a candidate")]
    Ambiguous,
    #[error("envelope carries neither a description nor a candidate")]
    Empty,
}

/// The only message shape exchanged over the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireEnvelope", into = "WireEnvelope")]
pub enum SignalingEnvelope {
    Description {
        sender: ParticipantId,
        description: SessionDescription,
    },
    Candidate {
        sender: ParticipantId,
        candidate: PathCandidate,
    },
}

impl SignalingEnvelope {
    pub fn sender(&self) -> &ParticipantId {
        match self {
            Self::Description { sender, .. } | Self::Candidate { sender, .. } => sender,
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

// Flat JSON form: `{"id": ..., "description": {...}}` or `{"id": ..., "candidate": ...}`.
#[derive(Serialize, Deserialize)]
struct WireEnvelope {
    id: ParticipantId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    candidate: Option<PathCandidate>,
}

impl TryFrom<WireEnvelope> for SignalingEnvelope {
    type Error = EnvelopeError;

    fn try_from(wire: WireEnvelope) -> Result<Self, Self::Error> {
        match (wire.description, wire.candidate) {
            (Some(description), None) => Ok(Self::Description {
                sender: wire.id,
                description,
            }),
            (None, Some(candidate)) => Ok(Self::Candidate {
                sender: wire.id,
                candidate,
            }),
            (Some(_), Some(_)) => Err(EnvelopeError::Ambiguous),
            (None, None) => Err(EnvelopeError::Empty),
        }
    }
}

impl From<SignalingEnvelope> for WireEnvelope {
    fn from(envelope: SignalingEnvelope) -> Self {
        match envelope {
            SignalingEnvelope::Description {
                sender,
                description,
            } => Self {
                id: sender,
                description: Some(description),
                candidate: None,
            },
            SignalingEnvelope::Candidate { sender, candidate } => Self {
                id: sender,
                description: None,
                candidate: Some(candidate),
            },
        }
    }
}
