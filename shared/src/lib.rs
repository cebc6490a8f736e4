//! # Shared Mesh Primitives
//!
//! Types shared by every peer in the lockstep mesh: the frame clock, the
//! frame-indexed [`Timeline`] store, the bit-packed input codec, the fast
//! state hash, the wire protocol for topology control and desync dumps, and
//! the two narrow interfaces the mesh consumes from its environment
//! ([`Transport`] and [`Simulation`]).
//!
//! Nothing in this crate performs I/O. The `mesh` crate drives these types
//! from its single-threaded update loop.

pub mod bitstream;
pub mod config;
pub mod error;
pub mod hash;
pub mod input_codec;
pub mod protocol;
pub mod simulation;
pub mod timeline;
pub mod transport;

pub use config::MeshConfig;
pub use error::{DisconnectReason, InternalError, ProtocolError, SimulationError, TimelineError};
pub use hash::StateHash;
pub use input_codec::{ConsistencyReport, InputBatch};
pub use simulation::Simulation;
pub use timeline::Timeline;
pub use transport::{Channel, Endpoint, LinkId, Transport, TransportEvent};

/// The sole logical clock. Frames only move forward except during rollback.
pub type Frame = i32;

/// Identity assigned by the coordinator, unique and monotonic per topology epoch.
pub type ConnectionId = u32;

/// Index of an input slot, `0..MAX_INPUT_SLOTS`.
pub type InputSlot = u8;

/// Sequence number of a join/leave event. Event ids start at 1; 0 means "none".
pub type JleId = u32;

/// Hard upper bound on concurrently assigned input slots.
pub const MAX_INPUT_SLOTS: usize = 8;

/// Per-slot inputs handed to [`Simulation::step`]. Offline slots read as zero.
pub type InputVector = [u32; MAX_INPUT_SLOTS];

/// One-hot mask for a slot index.
pub fn slot_mask(slot: InputSlot) -> u8 {
    1u8 << slot
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_mask_is_one_hot() {
        for slot in 0..MAX_INPUT_SLOTS as InputSlot {
            assert_eq!(slot_mask(slot).count_ones(), 1);
        }
        assert_eq!(slot_mask(0), 0b0000_0001);
        assert_eq!(slot_mask(7), 0b1000_0000);
    }
}
