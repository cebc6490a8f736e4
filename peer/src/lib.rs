//! Demo peer for the lockstep mesh
//!
//! Provides a deterministic platformer simulation and a driver that runs a
//! swarm of peers over the in-process loopback transport.

pub mod driver;
pub mod game;

pub use driver::{platformer_config, InputScript, PeerSession, Swarm};
pub use game::{Buttons, Platformer, Player};
