//! # Lockstep Mesh
//!
//! Peer-to-peer session layer for deterministic lockstep simulation:
//!
//! - [`topology`] brings peers into a fully-connected mesh behind one
//!   coordinator, arbitrates disconnect disputes and migrates the
//!   coordinator role when it disappears
//! - [`consistency`] tracks per-slot input history and the Newest Consistent
//!   Frame, predicts past it and rolls back when predictions fail
//! - [`desync`] compares state hashes between peers and exports diverging
//!   snapshots
//! - [`session`] ties these together behind a single `update` call per tick
//!
//! [`loopback`] provides an in-memory [`shared::Transport`] for tests and the
//! demo driver.

pub mod clock;
pub mod consistency;
pub mod desync;
pub mod loopback;
pub mod remote_peer;
pub mod session;
pub mod topology;

pub use desync::{DesyncExporter, ExportRecord, FileExporter, MemoryExporter};
pub use loopback::{LoopbackHub, LoopbackTransport};
pub use session::{MeshEvent, MeshSession};
pub use topology::PeerState;
