//! Error types for FrameLink

use std::io;
use thiserror::Error;

/// Result type for FrameLink operations
pub type Result<T> = std::result::Result<T, FrameLinkError>;

/// Errors that can occur in FrameLink operations
#[derive(Debug, Error)]
pub enum FrameLinkError {
    /// Layout cookie or version disagreement between the two sides
    #[error("Protocol mismatch: expected cookie 0x{expected:016X}, got 0x{got:016X}")]
    ProtocolMismatch { expected: u64, got: u64 },

    /// Operation on a segment that has reached the dead state
    #[error("Segment is closed")]
    SegmentClosed,

    /// Ring is full on a non-blocking enqueue
    #[error("Event ring saturated ({capacity} slots in use)")]
    Saturated { capacity: usize },

    /// Rejected geometry in a resize or subsegment request
    #[error("Invalid geometry {width}x{height}: {reason}")]
    InvalidGeometry {
        width: u32,
        height: u32,
        reason: &'static str,
    },

    /// Handle passing failed; the caller falls back to readback
    #[error("Buffer transfer failed: {0}")]
    TransferFailed(String),

    /// The other process is gone (broken semaphore, closed socket)
    #[error("Peer lost: {0}")]
    PeerLost(String),

    /// Failed to create shared memory
    #[error("Failed to create shared memory '{name}': {source}")]
    ShmCreate {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Failed to open shared memory
    #[error("Failed to open shared memory '{name}': {source}")]
    ShmOpen {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Failed to map memory
    #[error("Failed to map memory: {0}")]
    Mmap(#[source] io::Error),

    /// Failed to truncate shared memory
    #[error("Failed to set shared memory size: {0}")]
    Truncate(#[source] io::Error),

    /// Named semaphore operation failed
    #[error("Semaphore '{name}' failed: {source}")]
    Semaphore {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Connection socket error that does not indicate peer loss
    #[error("Socket error: {0}")]
    Socket(#[source] io::Error),

    /// No connection point could be resolved
    #[error("No connection point: {0}")]
    NoConnectionPoint(String),

    /// The client presented the wrong authentication key
    #[error("Connection rejected: authentication key mismatch")]
    AuthRejected,

    /// A frame is already signalled and not yet consumed
    #[error("A {0} frame is already in flight")]
    FrameInFlight(&'static str),

    /// Frame submission while a resize is being negotiated
    #[error("Resize pending, submission suspended")]
    ResizePending,

    /// The operation is not valid in the current segment state
    #[error("Operation '{op}' not valid in state {state}")]
    InvalidState { op: &'static str, state: String },

    /// Name too long for the shared memory namespace
    #[error("Name too long: max {max} chars, got {got}")]
    NameTooLong { max: usize, got: usize },

    /// Region access outside the currently mapped size
    #[error("Region access out of bounds: offset {offset} + {len} > {size}")]
    OutOfBounds { offset: usize, len: usize, size: usize },
}

impl FrameLinkError {
    /// Structural errors end the segment; everything else is answered in-protocol.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FrameLinkError::ProtocolMismatch { .. }
                | FrameLinkError::SegmentClosed
                | FrameLinkError::PeerLost(_)
        )
    }

    pub(crate) fn invalid_state(op: &'static str, state: impl std::fmt::Debug) -> Self {
        FrameLinkError::InvalidState {
            op,
            state: format!("{:?}", state),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_classification() {
        assert!(FrameLinkError::SegmentClosed.is_terminal());
        assert!(FrameLinkError::PeerLost("socket hangup".into()).is_terminal());
        assert!(FrameLinkError::ProtocolMismatch { expected: 1, got: 2 }.is_terminal());

        assert!(!FrameLinkError::Saturated { capacity: 8 }.is_terminal());
        assert!(!FrameLinkError::TransferFailed("export".into()).is_terminal());
        assert!(!FrameLinkError::InvalidGeometry {
            width: 0,
            height: 10,
            reason: "zero dimension"
        }
        .is_terminal());
    }
}
