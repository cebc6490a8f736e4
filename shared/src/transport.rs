//! Boundary to the underlying message transport.
//!
//! The transport owns sockets, acknowledgement, fragmentation and RTT
//! estimation. Everything it hands over must already be on the update thread.

use std::net::SocketAddr;
use std::time::Duration;

pub type Endpoint = SocketAddr;

/// Transport-level handle for one connection, distinct from the
/// coordinator-assigned `ConnectionId`.
pub type LinkId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Reliable ordered. Reserved for mesh management traffic.
    Control,
    /// Reliable unordered. Input batches and consistency reports.
    Input,
    /// Reliable ordered. Desync dumps.
    Diagnostics,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A remote asked to connect. Must be answered with `approve` or `deny`.
    IncomingConnection {
        link: LinkId,
        remote: Endpoint,
        hail: Vec<u8>,
    },
    Connected {
        link: LinkId,
    },
    Disconnected {
        link: LinkId,
        reason: String,
    },
    Message {
        link: LinkId,
        channel: Channel,
        payload: Vec<u8>,
    },
}

pub trait Transport {
    fn local_endpoint(&self) -> Endpoint;

    /// Starts an outbound connection carrying `hail`.
    fn connect(&mut self, remote: Endpoint, hail: Vec<u8>) -> LinkId;

    fn approve(&mut self, link: LinkId);

    fn deny(&mut self, link: LinkId, reason: &str);

    fn send(&mut self, link: LinkId, channel: Channel, payload: Vec<u8>);

    fn disconnect(&mut self, link: LinkId, reason: &str);

    fn round_trip_time(&self, link: LinkId) -> Option<Duration>;

    /// Best-effort packet to open a NAT mapping towards `remote`.
    fn punch_through(&mut self, _remote: Endpoint) {}

    fn poll(&mut self) -> Vec<TransportEvent>;
}
