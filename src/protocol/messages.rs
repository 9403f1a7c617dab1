//! Sync protocol messages
//!
//! Client -> server frames:
//! - `{"id": string, "x": number, "y": number}` - position update
//! - `{"leave": string}` - explicit departure
//!
//! Server -> client frames are full presence snapshots:
//! `{"<identity>": {"x": number, "y": number}, ...}`

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;
use crate::protocol::MAX_FRAME_SIZE;

/// A position in world-tile space.
///
/// Coordinates are forwarded as received; no bounds checking is done.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Position update sent by a client for one identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionUpdate {
    pub id: String,
    pub x: f64,
    pub y: f64,
}

impl PositionUpdate {
    pub fn new(id: impl Into<String>, position: Position) -> Self {
        Self {
            id: id.into(),
            x: position.x,
            y: position.y,
        }
    }

    pub fn position(&self) -> Position {
        Position::new(self.x, self.y)
    }

    /// Encode as a JSON text frame
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Explicit departure of an identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaveRequest {
    pub leave: String,
}

impl LeaveRequest {
    pub fn new(id: impl Into<String>) -> Self {
        Self { leave: id.into() }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// A decoded client frame
#[derive(Debug, Clone, PartialEq)]
pub enum ClientFrame {
    Update(PositionUpdate),
    Leave(LeaveRequest),
}

impl ClientFrame {
    /// Identity the frame refers to
    pub fn identity(&self) -> &str {
        match self {
            ClientFrame::Update(update) => &update.id,
            ClientFrame::Leave(leave) => &leave.leave,
        }
    }
}

/// Decode a client text frame.
///
/// Objects carrying a `leave` key are departures; everything else must be a
/// complete position update.
pub fn decode_client_frame(text: &str) -> Result<ClientFrame, ProtocolError> {
    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: text.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    let value: Value =
        serde_json::from_str(text).map_err(|e| ProtocolError::MalformedFrame(e.to_string()))?;

    if !value.is_object() {
        return Err(ProtocolError::MalformedFrame(
            "expected a JSON object".to_string(),
        ));
    }

    if value.get("leave").is_some() {
        let leave = LeaveRequest::deserialize(value)
            .map_err(|e| ProtocolError::MalformedFrame(e.to_string()))?;
        return Ok(ClientFrame::Leave(leave));
    }

    let update = PositionUpdate::deserialize(value)
        .map_err(|e| ProtocolError::MalformedFrame(e.to_string()))?;
    Ok(ClientFrame::Update(update))
}

/// Full presence snapshot: identity -> last known position
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Snapshot(BTreeMap<String, Position>);

impl Snapshot {
    pub fn get(&self, id: &str) -> Option<&Position> {
        self.0.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.0.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Position)> {
        self.0.iter()
    }

    /// Encode as a JSON text frame
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.0)
    }

    /// Decode a snapshot text frame
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::MalformedFrame(e.to_string()))
    }
}

impl FromIterator<(String, Position)> for Snapshot {
    fn from_iter<I: IntoIterator<Item = (String, Position)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
