//! Wire protocol module
//!
//! JSON text frames exchanged over the sync WebSocket:
//! - `messages` - frame types and the JSON codec

pub mod messages;

pub use messages::{decode_client_frame, ClientFrame, LeaveRequest, Position, PositionUpdate, Snapshot};

/// Largest inbound text frame the server will try to decode
pub const MAX_FRAME_SIZE: usize = 16 * 1024;
