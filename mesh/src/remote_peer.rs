//! Per-remote connection bookkeeping
//!
//! Every peer we know about in the mesh has one [`RemotePeer`] entry, whether
//! or not a direct link to it exists yet. The entry tracks:
//! - The peer's identity as announced by the coordinator
//! - The transport link carrying traffic to it, once one is up
//! - Input messages that arrived before the peer became application-connected
//! - How far our own input stream has been sent to it

use shared::protocol::PeerInfo;
use shared::{Channel, ConnectionId, Frame, LinkId};
use std::collections::VecDeque;

/// Message held back until its sender is visible to the simulation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    pub channel: Channel,
    pub payload: Vec<u8>,
}

/// One remote participant in the mesh
#[derive(Debug)]
pub struct RemotePeer {
    /// Identity and slot assignment as announced by the coordinator
    pub info: PeerInfo,
    /// Transport link, once one has been opened or accepted
    pub link: Option<LinkId>,
    /// Set when the link dropped; links are never re-formed
    pub link_lost: bool,
    /// True when we opened the link rather than accepted it
    pub initiated: bool,
    /// True once the transport reported the link connected
    pub connected: bool,
    /// Token both sides present when the direct link is formed
    pub token: u64,
    /// Last frame of our own input this peer has been sent
    pub sent_through: Frame,
    queue: VecDeque<QueuedMessage>,
}

impl RemotePeer {
    /// Creates an entry for a peer introduced by the coordinator
    ///
    /// The entry starts without a link. `sent_through` starts before any
    /// possible frame so the first outgoing batch covers our whole stream
    /// until the welcome frame is known.
    pub fn new(info: PeerInfo, token: u64) -> Self {
        Self {
            info,
            link: None,
            link_lost: false,
            initiated: false,
            connected: false,
            token,
            sent_through: Frame::MIN,
            queue: VecDeque::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.info.connection_id
    }

    pub fn is_application_connected(&self) -> bool {
        self.info.is_application_connected
    }

    /// True when messages can be sent to this peer right now
    pub fn is_reachable(&self) -> bool {
        self.link.is_some() && self.connected && !self.link_lost
    }

    /// Holds a message until the peer becomes application-connected
    ///
    /// Returns false without queueing when `cap` messages are already held;
    /// the caller treats that as a protocol fault of the sender.
    pub fn enqueue(&mut self, channel: Channel, payload: Vec<u8>, cap: usize) -> bool {
        if self.queue.len() >= cap {
            return false;
        }
        self.queue.push_back(QueuedMessage { channel, payload });
        true
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Hands back held messages in arrival order
    pub fn drain_queue(&mut self) -> Vec<QueuedMessage> {
        self.queue.drain(..).collect()
    }

    /// Marks the link gone; the entry stays until the coordinator rules
    pub fn lose_link(&mut self) {
        self.link_lost = true;
        self.connected = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(id: ConnectionId) -> PeerInfo {
        PeerInfo {
            connection_id: id,
            name: format!("peer-{}", id),
            player_data: Vec::new(),
            input_slot: 1,
            internal_endpoint: None,
            external_endpoint: None,
            side_channel_id: None,
            is_server: false,
            is_application_connected: false,
        }
    }

    #[test]
    fn test_new_peer_has_no_link() {
        let peer = RemotePeer::new(info(3), 99);
        assert_eq!(peer.id(), 3);
        assert!(!peer.is_reachable());
        assert_eq!(peer.sent_through, Frame::MIN);
        assert_eq!(peer.token, 99);
    }

    #[test]
    fn test_queue_respects_cap_and_order() {
        let mut peer = RemotePeer::new(info(3), 0);
        assert!(peer.enqueue(Channel::Input, vec![1], 2));
        assert!(peer.enqueue(Channel::Diagnostics, vec![2], 2));
        assert!(!peer.enqueue(Channel::Input, vec![3], 2));
        assert_eq!(peer.queued(), 2);

        let drained = peer.drain_queue();
        assert_eq!(drained[0].payload, vec![1]);
        assert_eq!(drained[1].channel, Channel::Diagnostics);
        assert_eq!(peer.queued(), 0);
    }

    #[test]
    fn test_lost_link_is_unreachable() {
        let mut peer = RemotePeer::new(info(3), 0);
        peer.link = Some(7);
        peer.connected = true;
        assert!(peer.is_reachable());
        peer.lose_link();
        assert!(!peer.is_reachable());
        assert!(peer.link_lost);
    }
}
