//! Error kinds for the mesh.
//!
//! Protocol errors blame a remote peer and are always recoverable by
//! disconnecting someone. Internal errors are local bugs and never blame a
//! remote. The simulation layer only ever sees a [`DisconnectReason`].

use crate::{ConnectionId, Frame, InputSlot, JleId};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors from [`crate::Timeline`] mutation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimelineError {
    #[error("frame {frame} already holds a different value")]
    ConflictingValue { frame: Frame },
}

/// Malformed or out-of-range content received from a remote peer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("message truncated: needed {needed} more bits")]
    Truncated { needed: u32 },
    #[error("message has {bytes} trailing bytes")]
    TrailingBytes { bytes: usize },
    #[error("message of {size} bytes exceeds limit of {limit}")]
    TooLarge { size: usize, limit: usize },
    #[error("could not decode message: {0}")]
    Malformed(String),
    #[error("input value {value:#x} does not fit in {bits} bits")]
    ValueOutOfRange { value: u32, bits: u8 },
    #[error("input batch ending at frame {end} is more than {limit} frames ahead of frame {local}")]
    TooFarAhead { end: Frame, local: Frame, limit: i32 },
    #[error("conflicting input for slot {slot} at frame {frame}")]
    ConflictingInput { slot: InputSlot, frame: Frame },
    #[error("input for frame {frame} precedes the retained history")]
    InputTooOld { frame: Frame },
    #[error("input slot {0} is out of range")]
    BadSlot(InputSlot),
    #[error("unknown peer {0}")]
    UnknownPeer(ConnectionId),
    #[error("unexpected {0} message for the current role")]
    Unexpected(&'static str),
    #[error("application version {remote} does not match {local}")]
    VersionMismatch { local: u32, remote: u32 },
    #[error("application signature mismatch")]
    SignatureMismatch,
    #[error("field {field} is {len} long, limit {limit}")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        limit: usize,
    },
    #[error("join/leave event {id} is inconsistent: {detail}")]
    BadEvent { id: JleId, detail: &'static str },
    #[error("snapshot rejected: {0}")]
    BadSnapshot(String),
    #[error("desync dump of {frames} frames / {bytes} bytes exceeds caps")]
    DumpTooLarge { frames: usize, bytes: usize },
    #[error("more than {0} host migration messages buffered")]
    MigrationBufferFull(usize),
    #[error("more than {0} messages queued before application connect")]
    QueueFull(usize),
    #[error("slot {slot} has not delivered input for frame {frame}")]
    Stalled { slot: InputSlot, frame: Frame },
}

impl From<bincode::Error> for ProtocolError {
    fn from(error: bincode::Error) -> Self {
        match *error {
            bincode::ErrorKind::SizeLimit => ProtocolError::TooLarge {
                size: 0,
                limit: crate::protocol::MAX_CONTROL_MESSAGE_BYTES,
            },
            other => ProtocolError::Malformed(other.to_string()),
        }
    }
}

/// A broken local invariant. Always a bug in this process.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InternalError {
    #[error("NCF {ncf} exceeds simulation frame {simulation}")]
    NcfAheadOfSimulation { ncf: Frame, simulation: Frame },
    #[error("no snapshot at or before frame {0}")]
    MissingSnapshot(Frame),
    #[error("frame {dirty} marked dirty at or below NCF {ncf}")]
    DirtyBelowNcf { dirty: Frame, ncf: Frame },
    #[error("local simulation failed to restore its own snapshot: {0}")]
    SnapshotRestore(String),
    #[error("own input slot stalled at frame {0}")]
    LocalStall(Frame),
    #[error("could not encode message: {0}")]
    Encode(String),
}

/// Error surfaced by [`crate::Simulation::deserialize`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("simulation state rejected: {0}")]
pub struct SimulationError(pub String);

/// User-visible reason attached to the terminal `Disconnected` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DisconnectReason {
    ServerFull,
    VersionMismatch,
    SignatureMismatch,
    SideChannelRejected,
    HostMigrationTimedOut,
    HostMigrationFailed,
    LostConnectionToServer,
    KickedByServer,
    ProtocolError,
    UserRequested,
    ServerShutdown,
    InternalError,
}

impl DisconnectReason {
    const ALL: [DisconnectReason; 12] = [
        DisconnectReason::ServerFull,
        DisconnectReason::VersionMismatch,
        DisconnectReason::SignatureMismatch,
        DisconnectReason::SideChannelRejected,
        DisconnectReason::HostMigrationTimedOut,
        DisconnectReason::HostMigrationFailed,
        DisconnectReason::LostConnectionToServer,
        DisconnectReason::KickedByServer,
        DisconnectReason::ProtocolError,
        DisconnectReason::UserRequested,
        DisconnectReason::ServerShutdown,
        DisconnectReason::InternalError,
    ];

    /// Recovers a reason from the text a transport carried across a denial.
    pub fn parse(text: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.to_string() == text)
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            DisconnectReason::ServerFull => "server full",
            DisconnectReason::VersionMismatch => "version mismatch",
            DisconnectReason::SignatureMismatch => "signature mismatch",
            DisconnectReason::SideChannelRejected => "side channel rejected",
            DisconnectReason::HostMigrationTimedOut => "host migration timed out",
            DisconnectReason::HostMigrationFailed => "host migration failed",
            DisconnectReason::LostConnectionToServer => "lost connection to server",
            DisconnectReason::KickedByServer => "kicked by server",
            DisconnectReason::ProtocolError => "protocol error",
            DisconnectReason::UserRequested => "disconnected",
            DisconnectReason::ServerShutdown => "server shut down",
            DisconnectReason::InternalError => "internal error",
        };
        f.write_str(text)
    }
}

impl From<&ProtocolError> for DisconnectReason {
    fn from(error: &ProtocolError) -> Self {
        match error {
            ProtocolError::VersionMismatch { .. } => DisconnectReason::VersionMismatch,
            ProtocolError::SignatureMismatch => DisconnectReason::SignatureMismatch,
            _ => DisconnectReason::ProtocolError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_strings_are_short() {
        let reasons = [
            DisconnectReason::ServerFull,
            DisconnectReason::VersionMismatch,
            DisconnectReason::HostMigrationTimedOut,
            DisconnectReason::LostConnectionToServer,
            DisconnectReason::InternalError,
        ];
        for reason in reasons {
            let text = reason.to_string();
            assert!(!text.is_empty());
            assert!(text.len() < 32);
        }
        assert_eq!(DisconnectReason::ServerFull.to_string(), "server full");
    }

    #[test]
    fn test_reason_parses_back() {
        assert_eq!(
            DisconnectReason::parse("server full"),
            Some(DisconnectReason::ServerFull)
        );
        assert_eq!(DisconnectReason::parse("no such reason"), None);
    }

    #[test]
    fn test_protocol_error_maps_to_reason() {
        let mismatch = ProtocolError::VersionMismatch { local: 2, remote: 1 };
        assert_eq!(
            DisconnectReason::from(&mismatch),
            DisconnectReason::VersionMismatch
        );
        assert_eq!(
            DisconnectReason::from(&ProtocolError::Truncated { needed: 3 }),
            DisconnectReason::ProtocolError
        );
    }
}
