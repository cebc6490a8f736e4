//! The narrow interface the mesh uses to drive the game.

use crate::error::SimulationError;
use crate::{InputSlot, InputVector};

/// A deterministic game simulation.
///
/// `first_time` is false when a frame is being resimulated after rollback, so
/// the game can suppress one-shot effects (sounds, particles).
pub trait Simulation {
    fn serialize(&self) -> Vec<u8>;

    /// Must reject malformed input rather than load partial state.
    fn deserialize(&mut self, bytes: &[u8]) -> Result<(), SimulationError>;

    fn step(&mut self, inputs: &InputVector, first_time: bool);

    fn player_join(&mut self, slot: InputSlot, name: &str, data: &[u8], first_time: bool);

    fn player_leave(&mut self, slot: InputSlot, first_time: bool);

    fn before_frame(&mut self) {}

    fn after_frame(&mut self) {}

    /// Data advertised to LAN/lobby listings.
    fn write_discovery_data(&self, _out: &mut Vec<u8>) {}
}
