//! Frames exchanged over the wire channel between the foreground process and the sync process.
//!
//! A frame is a one-byte tag, optionally followed by a single payload byte:
//!
//! | tag | meaning | payload |
//! |-----|---------|---------|
//! | `1` | ready   | none |
//! | `2` | done    | optional exit code byte |

use crate::error::SyncError;

pub const READY_TAG: u8 = 1;
pub const DONE_TAG: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireMessage {
    Ready,
    Done { exit_code: Option<u8> },
}

impl WireMessage {
    pub fn tag(self) -> u8 {
        match self {
            WireMessage::Ready => READY_TAG,
            WireMessage::Done { .. } => DONE_TAG,
        }
    }

    pub fn encode(self) -> Vec<u8> {
        match self {
            WireMessage::Ready => vec![READY_TAG],
            WireMessage::Done { exit_code: None } => vec![DONE_TAG],
            WireMessage::Done {
                exit_code: Some(code),
            } => vec![DONE_TAG, code],
        }
    }

    /// Decode one complete frame.
    pub fn decode(frame: &[u8]) -> Result<Self, SyncError> {
        match frame {
            [READY_TAG] => Ok(WireMessage::Ready),
            [DONE_TAG] => Ok(WireMessage::Done { exit_code: None }),
            [DONE_TAG, code] => Ok(WireMessage::Done {
                exit_code: Some(*code),
            }),
            [] => Err(SyncError::Protocol("empty frame".to_string())),
            [tag, ..] if *tag != READY_TAG && *tag != DONE_TAG => {
                Err(SyncError::Protocol(format!("unexpected tag {tag}")))
            }
            other => Err(SyncError::Protocol(format!(
                "frame of {} bytes for tag {}",
                other.len(),
                other[0]
            ))),
        }
    }

    /// Exit code the sync side should record for a done message without a payload.
    pub fn exit_code_or_default(self) -> Option<i32> {
        match self {
            WireMessage::Ready => None,
            WireMessage::Done { exit_code } => Some(exit_code.map_or(0, i32::from)),
        }
    }
}
