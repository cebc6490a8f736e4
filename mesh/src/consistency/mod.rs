//! Rollback and consistency bookkeeping.
//!
//! [`Engine`] owns the simulation and every frame-indexed buffer. The
//! topology layer reaches it only through [`Ledger`], which covers the
//! membership decisions that have to be ordered against the frame clock.

mod engine;
mod online_state;

pub use engine::{Engine, ReceivedInput, RemoteStatus, StalledSlot};
pub use online_state::{OnlineState, SlotChange};

use shared::protocol::{HostMigration, JoinLeaveEvent, SlotInputs, Welcome};
use shared::{ConnectionId, Frame, InputSlot, InternalError, JleId, ProtocolError};

/// Membership operations on the frame-indexed history.
pub trait Ledger {
    fn is_running(&self) -> bool;

    fn ncf(&self) -> Frame;

    fn input_frame(&self) -> Frame;

    fn jle_epoch(&self) -> JleId;

    /// Lowest slot below `max_slots` that is offline as of NCF, has no event
    /// pending after NCF and is not in `reserved`.
    fn free_slot(&self, reserved: u8, max_slots: usize) -> Option<InputSlot>;

    /// Starts a fresh history with the local peer online in `slot`.
    fn start_host(
        &mut self,
        slot: InputSlot,
        name: &str,
        player_data: &[u8],
        host: ConnectionId,
    ) -> JoinLeaveEvent;

    fn authorize_join(
        &mut self,
        slot: InputSlot,
        name: &str,
        player_data: &[u8],
        host: ConnectionId,
    ) -> JoinLeaveEvent;

    /// Returns the leave event and the inputs the coordinator vouches for
    /// between the slot's last known input and the leave.
    fn authorize_leave(
        &mut self,
        slot: InputSlot,
        host: ConnectionId,
    ) -> Option<(JoinLeaveEvent, Option<SlotInputs>)>;

    fn apply_event(
        &mut self,
        event: &JoinLeaveEvent,
        host: ConnectionId,
        inputs: Option<&SlotInputs>,
    ) -> Result<(), ProtocolError>;

    fn welcome(&mut self, event: &JoinLeaveEvent) -> Result<Welcome, InternalError>;

    fn accept_welcome(
        &mut self,
        welcome: &Welcome,
        local_slot: InputSlot,
    ) -> Result<(), ProtocolError>;

    /// Takes over as coordinator: leaves `departed` slots and packages the
    /// history the `members` need to follow.
    fn migration_payload(
        &mut self,
        coordinator: ConnectionId,
        members: Vec<ConnectionId>,
        departed: &[InputSlot],
    ) -> HostMigration;

    fn reconcile_migration(&mut self, migration: &HostMigration) -> Result<(), ProtocolError>;

    fn forget_remote(&mut self, peer: ConnectionId);
}
