//! Wire messages for connection hails, topology control and desync dumps.
//!
//! Everything here is serde + bincode with fixed-int encoding, a size limit
//! and trailing-byte rejection. Decoding is followed by structural
//! validation; any violation is a [`ProtocolError`].

use crate::error::{DisconnectReason, InternalError, ProtocolError};
use crate::input_codec::InputBatch;
use crate::transport::Endpoint;
use crate::{ConnectionId, Frame, InputSlot, JleId, MAX_INPUT_SLOTS};
use bincode::Options;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub const MAX_CONTROL_MESSAGE_BYTES: usize = 8 * 1024 * 1024;
pub const MAX_NAME_LEN: usize = 32;
pub const MAX_PLAYER_DATA_LEN: usize = 1024;
pub const MAX_SIGNATURE_LEN: usize = 64;

fn wire_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_limit(MAX_CONTROL_MESSAGE_BYTES as u64)
        .reject_trailing_bytes()
}

fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, InternalError> {
    wire_options()
        .serialize(message)
        .map_err(|e| InternalError::Encode(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    if bytes.len() > MAX_CONTROL_MESSAGE_BYTES {
        return Err(ProtocolError::TooLarge {
            size: bytes.len(),
            limit: MAX_CONTROL_MESSAGE_BYTES,
        });
    }
    Ok(wire_options().deserialize(bytes)?)
}

fn check_len(field: &'static str, len: usize, limit: usize) -> Result<(), ProtocolError> {
    if len > limit {
        return Err(ProtocolError::FieldTooLong { field, len, limit });
    }
    Ok(())
}

fn check_slot(slot: InputSlot) -> Result<(), ProtocolError> {
    if slot as usize >= MAX_INPUT_SLOTS {
        return Err(ProtocolError::BadSlot(slot));
    }
    Ok(())
}

/// Identity of one participant in the mesh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub connection_id: ConnectionId,
    pub name: String,
    pub player_data: Vec<u8>,
    pub input_slot: InputSlot,
    pub internal_endpoint: Option<Endpoint>,
    pub external_endpoint: Option<Endpoint>,
    pub side_channel_id: Option<u64>,
    pub is_server: bool,
    pub is_application_connected: bool,
}

impl PeerInfo {
    pub fn validate(&self) -> Result<(), ProtocolError> {
        check_len("name", self.name.len(), MAX_NAME_LEN)?;
        check_len("player_data", self.player_data.len(), MAX_PLAYER_DATA_LEN)?;
        check_slot(self.input_slot)
    }

    /// Endpoints worth trying for a direct link, external first.
    pub fn endpoints(&self) -> Vec<Endpoint> {
        let mut endpoints = Vec::new();
        endpoints.extend(self.external_endpoint);
        if self.internal_endpoint != self.external_endpoint {
            endpoints.extend(self.internal_endpoint);
        }
        endpoints
    }
}

/// First message on every transport connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Hail {
    /// A new peer asking the coordinator for admission.
    Join(JoinRequest),
    /// A member opening its direct link to another member.
    Mesh {
        connection_id: ConnectionId,
        token: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub app_version: u32,
    pub app_signature: Vec<u8>,
    /// The requester's own view of its endpoint (its internal address).
    pub observed_endpoint: Option<Endpoint>,
    pub side_channel_id: Option<u64>,
    pub side_channel_token: Option<u64>,
    pub name: String,
    pub player_data: Vec<u8>,
}

impl Hail {
    pub fn encode(&self) -> Result<Vec<u8>, InternalError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let hail: Hail = decode(bytes)?;
        if let Hail::Join(request) = &hail {
            check_len("app_signature", request.app_signature.len(), MAX_SIGNATURE_LEN)?;
            check_len("name", request.name.len(), MAX_NAME_LEN)?;
            check_len("player_data", request.player_data.len(), MAX_PLAYER_DATA_LEN)?;
        }
        Ok(hail)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JleKind {
    Join { name: String, player_data: Vec<u8> },
    Leave,
}

/// One slot going online or offline, agreed network-wide.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinLeaveEvent {
    pub id: JleId,
    pub slot: InputSlot,
    /// Coordinator NCF when the event was authorized.
    pub consistent_frame: Frame,
    /// First frame simulated with the new online state.
    pub effective_frame: Frame,
    pub kind: JleKind,
}

impl JoinLeaveEvent {
    pub fn is_join(&self) -> bool {
        matches!(self.kind, JleKind::Join { .. })
    }

    pub fn validate(&self) -> Result<(), ProtocolError> {
        check_slot(self.slot)?;
        if self.id == 0 {
            return Err(ProtocolError::BadEvent {
                id: self.id,
                detail: "zero id",
            });
        }
        if self.effective_frame <= self.consistent_frame {
            return Err(ProtocolError::BadEvent {
                id: self.id,
                detail: "effective frame not after its consistent frame",
            });
        }
        if let JleKind::Join { name, player_data } = &self.kind {
            check_len("name", name.len(), MAX_NAME_LEN)?;
            check_len("player_data", player_data.len(), MAX_PLAYER_DATA_LEN)?;
        }
        Ok(())
    }
}

/// Known inputs of one slot over a frame range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotInputs {
    pub slot: InputSlot,
    pub start_frame: Frame,
    pub values: Vec<u32>,
}

impl SlotInputs {
    pub fn batch(&self) -> InputBatch {
        InputBatch::new(self.start_frame, self.values.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshIntroduction {
    pub peer: PeerInfo,
    /// Random per-pair token both sides present when linking.
    pub token: u64,
}

/// Game history a newly application-connected peer starts from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Welcome {
    /// Frame the snapshot was taken after; equals the join's consistent frame.
    pub frame: Frame,
    pub snapshot: Vec<u8>,
    /// Events needed to rebuild online state at `frame` and after it.
    pub events: Vec<JoinLeaveEvent>,
    pub host_for_jle: Vec<(JleId, ConnectionId)>,
    pub inputs: Vec<SlotInputs>,
}

/// Everything a surviving member needs to follow a new coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostMigration {
    pub coordinator: ConnectionId,
    pub ncf: Frame,
    pub members: Vec<ConnectionId>,
    pub events: Vec<JoinLeaveEvent>,
    pub host_for_jle: Vec<(JleId, ConnectionId)>,
    pub departed_inputs: Vec<SlotInputs>,
}

/// Channel 0 traffic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMessage {
    /// Coordinator → joiner on approval.
    NetworkStartInfo {
        you: PeerInfo,
        coordinator: ConnectionId,
        peers: Vec<MeshIntroduction>,
    },
    /// Coordinator → existing members: expect a link from this peer.
    PeerJoined(MeshIntroduction),
    /// Member → coordinator: a direct link to `peer` is up.
    MeshLinkUp { peer: ConnectionId },
    /// Coordinator → all: `peer` is now visible to the simulation.
    PeerBecameApplicationConnected {
        peer: ConnectionId,
        event: JoinLeaveEvent,
    },
    /// Coordinator → the newly application-connected peer.
    Welcome(Welcome),
    /// `inputs` fills the departed slot up to the frame before the leave.
    PeerLeft {
        peer: ConnectionId,
        event: Option<JoinLeaveEvent>,
        inputs: Option<SlotInputs>,
    },
    /// Member → coordinator: the direct link to `peer` dropped.
    LostConnectionTo { peer: ConnectionId },
    /// Coordinator → accused: `reporter` lost you; dispute or be kicked.
    DisconnectedBy { reporter: ConnectionId },
    /// Accused → coordinator: still here.
    DisputeDisconnect { reporter: ConnectionId },
    Kicked { reason: DisconnectReason },
    /// Coordinator leaving cleanly; migration may proceed at once.
    CoordinatorShutdown,
    HostMigration(HostMigration),
}

impl ControlMessage {
    pub fn name(&self) -> &'static str {
        match self {
            ControlMessage::NetworkStartInfo { .. } => "NetworkStartInfo",
            ControlMessage::PeerJoined(_) => "PeerJoined",
            ControlMessage::MeshLinkUp { .. } => "MeshLinkUp",
            ControlMessage::PeerBecameApplicationConnected { .. } => {
                "PeerBecameApplicationConnected"
            }
            ControlMessage::Welcome(_) => "Welcome",
            ControlMessage::PeerLeft { .. } => "PeerLeft",
            ControlMessage::LostConnectionTo { .. } => "LostConnectionTo",
            ControlMessage::DisconnectedBy { .. } => "DisconnectedBy",
            ControlMessage::DisputeDisconnect { .. } => "DisputeDisconnect",
            ControlMessage::Kicked { .. } => "Kicked",
            ControlMessage::CoordinatorShutdown => "CoordinatorShutdown",
            ControlMessage::HostMigration(_) => "HostMigration",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, InternalError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let message: ControlMessage = decode(bytes)?;
        message.validate()?;
        Ok(message)
    }

    fn validate(&self) -> Result<(), ProtocolError> {
        match self {
            ControlMessage::NetworkStartInfo { you, peers, .. } => {
                you.validate()?;
                for intro in peers {
                    intro.peer.validate()?;
                }
            }
            ControlMessage::PeerJoined(intro) => intro.peer.validate()?,
            ControlMessage::PeerBecameApplicationConnected { event, .. } => event.validate()?,
            ControlMessage::PeerLeft { event, inputs, .. } => {
                if let Some(event) = event {
                    event.validate()?;
                }
                if let Some(inputs) = inputs {
                    check_slot(inputs.slot)?;
                }
            }
            ControlMessage::Welcome(welcome) => {
                for event in &welcome.events {
                    event.validate()?;
                }
                for inputs in &welcome.inputs {
                    check_slot(inputs.slot)?;
                }
            }
            ControlMessage::HostMigration(migration) => {
                for event in &migration.events {
                    event.validate()?;
                }
                for inputs in &migration.departed_inputs {
                    check_slot(inputs.slot)?;
                }
                let ordered = migration.events.windows(2).all(|w| w[0].id + 1 == w[1].id);
                if !ordered {
                    return Err(ProtocolError::BadEvent {
                        id: migration.events.first().map(|e| e.id).unwrap_or(0),
                        detail: "migration log is not contiguous",
                    });
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// Channel 2: a window of raw snapshots ending at a mismatched frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesyncDump {
    pub jle_epoch: JleId,
    pub coordinator: ConnectionId,
    pub start_frame: Frame,
    pub snapshots: Vec<Vec<u8>>,
}

impl DesyncDump {
    pub fn frame_count(&self) -> usize {
        self.snapshots.len()
    }

    pub fn byte_size(&self) -> usize {
        self.snapshots.iter().map(Vec::len).sum()
    }

    pub fn encode(&self) -> Result<Vec<u8>, InternalError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8], max_frames: usize, max_bytes: usize) -> Result<Self, ProtocolError> {
        let dump: DesyncDump = decode(bytes)?;
        if dump.frame_count() > max_frames || dump.byte_size() > max_bytes {
            return Err(ProtocolError::DumpTooLarge {
                frames: dump.frame_count(),
                bytes: dump.byte_size(),
            });
        }
        Ok(dump)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(id: ConnectionId, slot: InputSlot) -> PeerInfo {
        PeerInfo {
            connection_id: id,
            name: format!("peer-{}", id),
            player_data: vec![1, 2, 3],
            input_slot: slot,
            internal_endpoint: Some("10.0.0.2:7000".parse().unwrap()),
            external_endpoint: Some("203.0.113.9:7000".parse().unwrap()),
            side_channel_id: None,
            is_server: id == 0,
            is_application_connected: true,
        }
    }

    fn join_event(id: JleId) -> JoinLeaveEvent {
        JoinLeaveEvent {
            id,
            slot: 1,
            consistent_frame: 40,
            effective_frame: 43,
            kind: JleKind::Join {
                name: "bob".to_string(),
                player_data: vec![],
            },
        }
    }

    #[test]
    fn test_hail_roundtrip() {
        let hail = Hail::Join(JoinRequest {
            app_version: 3,
            app_signature: b"build-77".to_vec(),
            observed_endpoint: None,
            side_channel_id: Some(9),
            side_channel_token: Some(0xABCD),
            name: "alice".to_string(),
            player_data: vec![7; 16],
        });
        let bytes = hail.encode().unwrap();
        assert_eq!(Hail::decode(&bytes).unwrap(), hail);
    }

    #[test]
    fn test_hail_with_oversized_name_rejected() {
        let hail = Hail::Join(JoinRequest {
            app_version: 1,
            app_signature: vec![],
            observed_endpoint: None,
            side_channel_id: None,
            side_channel_token: None,
            name: "x".repeat(MAX_NAME_LEN + 1),
            player_data: vec![],
        });
        let bytes = hail.encode().unwrap();
        assert!(matches!(
            Hail::decode(&bytes),
            Err(ProtocolError::FieldTooLong { field: "name", .. })
        ));
    }

    #[test]
    fn test_control_roundtrip() {
        let message = ControlMessage::NetworkStartInfo {
            you: peer(3, 2),
            coordinator: 0,
            peers: vec![MeshIntroduction {
                peer: peer(1, 1),
                token: 42,
            }],
        };
        let bytes = message.encode().unwrap();
        assert_eq!(ControlMessage::decode(&bytes).unwrap(), message);
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = ControlMessage::CoordinatorShutdown.encode().unwrap();
        bytes.push(0);
        assert!(ControlMessage::decode(&bytes).is_err());
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(ControlMessage::decode(&[0xFF, 0xFF, 0xFF, 0xFF]).is_err());
        assert!(ControlMessage::decode(&[]).is_err());
    }

    #[test]
    fn test_event_must_take_effect_after_consistent_frame() {
        let mut event = join_event(1);
        event.effective_frame = event.consistent_frame;
        let message = ControlMessage::PeerBecameApplicationConnected { peer: 1, event };
        let bytes = message.encode().unwrap();
        assert!(matches!(
            ControlMessage::decode(&bytes),
            Err(ProtocolError::BadEvent { .. })
        ));
    }

    #[test]
    fn test_migration_log_must_be_contiguous() {
        let migration = HostMigration {
            coordinator: 1,
            ncf: 40,
            members: vec![1, 2],
            events: vec![join_event(3), join_event(5)],
            host_for_jle: vec![],
            departed_inputs: vec![],
        };
        let bytes = ControlMessage::HostMigration(migration).encode().unwrap();
        assert!(ControlMessage::decode(&bytes).is_err());
    }

    #[test]
    fn test_bad_slot_rejected() {
        let mut info = peer(1, 0);
        info.input_slot = MAX_INPUT_SLOTS as InputSlot;
        let bytes = ControlMessage::PeerJoined(MeshIntroduction {
            peer: info,
            token: 1,
        })
        .encode()
        .unwrap();
        assert_eq!(
            ControlMessage::decode(&bytes),
            Err(ProtocolError::BadSlot(MAX_INPUT_SLOTS as InputSlot))
        );
    }

    #[test]
    fn test_dump_caps() {
        let dump = DesyncDump {
            jle_epoch: 2,
            coordinator: 0,
            start_frame: 90,
            snapshots: vec![vec![1; 100]; 4],
        };
        let bytes = dump.encode().unwrap();
        assert_eq!(DesyncDump::decode(&bytes, 4, 400).unwrap(), dump);
        assert!(DesyncDump::decode(&bytes, 3, 400).is_err());
        assert!(DesyncDump::decode(&bytes, 4, 399).is_err());
    }

    #[test]
    fn test_endpoints_dedup() {
        let mut info = peer(1, 0);
        info.internal_endpoint = info.external_endpoint;
        assert_eq!(info.endpoints().len(), 1);
    }
}
