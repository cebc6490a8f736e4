//! Mesh topology and membership
//!
//! This module turns raw transport events into a fully-connected mesh with
//! one coordinator. It handles:
//! - Admission of new peers and assignment of connection ids and input slots
//! - Pairwise link formation between members, matched by per-pair tokens
//! - Gating of application traffic until the sender is application-connected
//! - Disconnect disputes between members
//! - Host migration when the coordinator disappears
//!
//! The coordinator side lives in `coordinator.rs`, the member side in
//! `member.rs`. Every protocol error from a remote funnels through
//! [`Topology::fault`], which decides whether to kick the offender, drop a
//! link, or give up on the session.

mod coordinator;
mod member;

use crate::consistency::Ledger;
use crate::remote_peer::RemotePeer;
use crate::session::MeshEvent;
use coordinator::CoordinatorState;
use log::{debug, error, info, warn};
use member::MemberState;
use shared::protocol::{ControlMessage, Hail, PeerInfo};
use shared::{
    Channel, ConnectionId, DisconnectReason, Endpoint, Frame, InputSlot, InternalError, LinkId,
    MeshConfig, ProtocolError, Transport, TransportEvent,
};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

/// Connection id of the peer that starts a session.
pub const FIRST_CONNECTION_ID: ConnectionId = 1;

/// Lifecycle of the local peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Unstarted,
    /// Waiting for the coordinator to approve our join
    Connecting,
    /// Admitted; forming direct links to every other member
    PendingFullMesh,
    /// Visible to the simulation as a member
    ApplicationConnected,
    /// Coordinator gone; waiting for a new one or validating ourselves
    MigratingToCoordinator,
    Coordinator,
    Disconnected(DisconnectReason),
}

impl PeerState {
    /// True while the local simulation is live.
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            PeerState::ApplicationConnected
                | PeerState::MigratingToCoordinator
                | PeerState::Coordinator
        )
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(self, PeerState::Disconnected(_))
    }
}

/// Application traffic released to the consistency layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routed {
    Input {
        peer: ConnectionId,
        slot: InputSlot,
        payload: Vec<u8>,
    },
    Diagnostics {
        peer: ConnectionId,
        payload: Vec<u8>,
    },
}

enum Role {
    Idle,
    Coordinator(CoordinatorState),
    Member(MemberState),
}

pub struct Topology {
    config: MeshConfig,
    state: PeerState,
    role: Role,
    local: Option<PeerInfo>,
    peers: BTreeMap<ConnectionId, RemotePeer>,
    links: HashMap<LinkId, ConnectionId>,
    side_channels: HashMap<u64, u64>,
    /// Highest connection id ever seen; a new coordinator allocates above it.
    highest_id: ConnectionId,
    now: Duration,
    events: Vec<MeshEvent>,
    ready: Vec<Routed>,
}

impl Topology {
    pub fn new(config: MeshConfig) -> Self {
        Self {
            config,
            state: PeerState::Unstarted,
            role: Role::Idle,
            local: None,
            peers: BTreeMap::new(),
            links: HashMap::new(),
            side_channels: HashMap::new(),
            highest_id: 0,
            now: Duration::ZERO,
            events: Vec::new(),
            ready: Vec::new(),
        }
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn local(&self) -> Option<&PeerInfo> {
        self.local.as_ref()
    }

    pub fn local_id(&self) -> ConnectionId {
        self.local.as_ref().map_or(0, |info| info.connection_id)
    }

    pub fn local_slot(&self) -> Option<InputSlot> {
        self.local.as_ref().map(|info| info.input_slot)
    }

    pub fn is_coordinator(&self) -> bool {
        matches!(self.role, Role::Coordinator(_))
    }

    /// Current coordinator, if one is known.
    pub fn coordinator_id(&self) -> Option<ConnectionId> {
        match &self.role {
            Role::Coordinator(_) => Some(self.local_id()),
            Role::Member(member) => member.coordinator,
            Role::Idle => None,
        }
    }

    pub fn peer(&self, id: ConnectionId) -> Option<&RemotePeer> {
        self.peers.get(&id)
    }

    pub fn peers(&self) -> impl Iterator<Item = &RemotePeer> {
        self.peers.values()
    }

    pub fn register_side_channel(&mut self, id: u64, token: u64) {
        self.side_channels.insert(id, token);
    }

    pub fn advance(&mut self, elapsed: Duration) {
        self.now += elapsed;
    }

    pub fn take_events(&mut self) -> Vec<MeshEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn take_ready(&mut self) -> Vec<Routed> {
        std::mem::take(&mut self.ready)
    }

    /// Application-connected peer currently holding `slot`.
    pub fn slot_owner(&self, slot: InputSlot) -> Option<ConnectionId> {
        self.peers
            .values()
            .find(|peer| peer.is_application_connected() && peer.info.input_slot == slot)
            .map(RemotePeer::id)
    }

    /// Peers that should receive our input stream, with how far it was sent.
    pub fn input_targets(&self) -> Vec<(ConnectionId, Frame)> {
        self.peers
            .values()
            .filter(|peer| peer.is_application_connected() && peer.is_reachable())
            .map(|peer| (peer.id(), peer.sent_through))
            .collect()
    }

    pub fn set_sent_through(&mut self, id: ConnectionId, frame: Frame) {
        if let Some(peer) = self.peers.get_mut(&id) {
            peer.sent_through = frame;
        }
    }

    /// Earliest frame buffered topology traffic may still touch.
    pub fn retention_hold(&self) -> Option<Frame> {
        match &self.role {
            Role::Member(member) => member.retention_hold(),
            _ => None,
        }
    }

    pub fn send(
        &mut self,
        transport: &mut dyn Transport,
        to: ConnectionId,
        channel: Channel,
        payload: Vec<u8>,
    ) -> bool {
        match self.peers.get(&to) {
            Some(peer) if !peer.link_lost => match peer.link {
                Some(link) => {
                    transport.send(link, channel, payload);
                    true
                }
                None => false,
            },
            _ => false,
        }
    }

    fn send_control(
        &mut self,
        transport: &mut dyn Transport,
        to: ConnectionId,
        message: &ControlMessage,
    ) -> bool {
        match message.encode() {
            Ok(bytes) => self.send(transport, to, Channel::Control, bytes),
            Err(e) => {
                error!("Dropping {} to {}: {}", message.name(), to, e);
                false
            }
        }
    }

    fn send_on_link(transport: &mut dyn Transport, link: LinkId, message: &ControlMessage) {
        match message.encode() {
            Ok(bytes) => transport.send(link, Channel::Control, bytes),
            Err(e) => error!("Dropping {}: {}", message.name(), e),
        }
    }

    /// Sends to every known peer except `except`.
    fn broadcast_control(
        &mut self,
        transport: &mut dyn Transport,
        message: &ControlMessage,
        except: Option<ConnectionId>,
    ) {
        let targets: Vec<ConnectionId> = self
            .peers
            .keys()
            .copied()
            .filter(|id| Some(*id) != except)
            .collect();
        for id in targets {
            self.send_control(transport, id, message);
        }
    }

    fn insert_peer(&mut self, peer: RemotePeer) {
        self.highest_id = self.highest_id.max(peer.id());
        if let Some(link) = peer.link {
            self.links.insert(link, peer.id());
        }
        self.peers.insert(peer.id(), peer);
    }

    /// Forgets a peer entirely, closing any link to it.
    fn remove_remote(
        &mut self,
        id: ConnectionId,
        transport: &mut dyn Transport,
        ledger: &mut dyn Ledger,
    ) -> Option<RemotePeer> {
        let peer = self.peers.remove(&id)?;
        if let Some(link) = peer.link {
            self.links.remove(&link);
            if !peer.link_lost {
                transport.disconnect(link, "peer left");
            }
        }
        ledger.forget_remote(id);
        self.events.push(MeshEvent::PeerLeft(id));
        info!("Peer {} left the mesh", id);
        Some(peer)
    }

    fn is_welcomed(&self) -> bool {
        self.state.is_running()
    }

    /// Releases queued traffic from `id` once both sides can use it.
    fn flush(&mut self, id: ConnectionId) {
        if !self.is_welcomed() {
            return;
        }
        let peer = match self.peers.get_mut(&id) {
            Some(peer) if peer.is_application_connected() => peer,
            _ => return,
        };
        let slot = peer.info.input_slot;
        for queued in peer.drain_queue() {
            self.ready.push(route(id, slot, queued.channel, queued.payload));
        }
    }

    fn flush_all(&mut self) {
        let ids: Vec<ConnectionId> = self.peers.keys().copied().collect();
        for id in ids {
            self.flush(id);
        }
    }

    /// Processes one transport event, returning traffic for the consistency layer.
    pub fn handle(
        &mut self,
        event: TransportEvent,
        transport: &mut dyn Transport,
        ledger: &mut dyn Ledger,
    ) -> Option<Routed> {
        if self.state.is_disconnected() {
            return None;
        }
        match event {
            TransportEvent::IncomingConnection { link, remote, hail } => {
                self.on_incoming(link, remote, &hail, transport, ledger);
                None
            }
            TransportEvent::Connected { link } => {
                self.on_connected(link, transport);
                None
            }
            TransportEvent::Disconnected { link, reason } => {
                self.on_link_down(link, &reason, transport, ledger);
                None
            }
            TransportEvent::Message {
                link,
                channel: Channel::Control,
                payload,
            } => {
                self.on_control(link, &payload, transport, ledger);
                None
            }
            TransportEvent::Message {
                link,
                channel,
                payload,
            } => self.on_application(link, channel, payload, transport, ledger),
        }
    }

    fn on_incoming(
        &mut self,
        link: LinkId,
        remote: Endpoint,
        hail: &[u8],
        transport: &mut dyn Transport,
        ledger: &mut dyn Ledger,
    ) {
        let hail = match Hail::decode(hail) {
            Ok(hail) => hail,
            Err(e) => {
                warn!("Rejecting connection from {}: {}", remote, e);
                transport.deny(link, &DisconnectReason::ProtocolError.to_string());
                return;
            }
        };
        match (&self.role, hail) {
            (Role::Coordinator(_), Hail::Join(request)) => {
                self.admit(link, remote, request, transport, ledger)
            }
            (Role::Member(_), Hail::Mesh {
                connection_id,
                token,
            }) => self.accept_mesh_link(link, connection_id, token, transport),
            _ => {
                debug!("Denying unexpected hail from {}", remote);
                transport.deny(link, &DisconnectReason::ProtocolError.to_string());
            }
        }
    }

    fn on_connected(&mut self, link: LinkId, transport: &mut dyn Transport) {
        let id = match self.links.get(&link) {
            Some(id) => *id,
            None => return,
        };
        let initiated = match self.peers.get_mut(&id) {
            Some(peer) => {
                peer.connected = true;
                peer.initiated
            }
            None => return,
        };
        debug!("Link {} to peer {} is up", link, id);
        if initiated {
            if let Some(coordinator) = self.coordinator_id() {
                self.send_control(transport, coordinator, &ControlMessage::MeshLinkUp { peer: id });
            }
        }
    }

    fn on_link_down(
        &mut self,
        link: LinkId,
        reason: &str,
        transport: &mut dyn Transport,
        ledger: &mut dyn Ledger,
    ) {
        let id = self.links.remove(&link);
        match &self.role {
            Role::Coordinator(_) => {
                if let Some(id) = id {
                    info!("Lost link to peer {}: {}", id, reason);
                    if let Some(peer) = self.peers.get_mut(&id) {
                        peer.lose_link();
                    }
                    self.remove_member(id, None, transport, ledger);
                }
            }
            Role::Member(_) => self.member_link_down(link, id, reason, transport, ledger),
            Role::Idle => {}
        }
    }

    fn on_control(
        &mut self,
        link: LinkId,
        payload: &[u8],
        transport: &mut dyn Transport,
        ledger: &mut dyn Ledger,
    ) {
        let from = self.links.get(&link).copied();
        let result = ControlMessage::decode(payload).and_then(|message| {
            debug!("Control {} from {:?}", message.name(), from);
            match &self.role {
                Role::Coordinator(_) => match from {
                    Some(from) => self.coordinator_control(from, message, transport, ledger),
                    None => Err(ProtocolError::Unexpected(message.name())),
                },
                Role::Member(_) => self.member_control(from, link, message, transport, ledger),
                Role::Idle => Ok(()),
            }
        });
        if let Err(e) = result {
            match from {
                Some(from) => self.fault(from, e, transport, ledger),
                None => {
                    warn!("Protocol error on link {}: {}", link, e);
                    self.fail(DisconnectReason::ProtocolError, transport);
                }
            }
        }
    }

    fn on_application(
        &mut self,
        link: LinkId,
        channel: Channel,
        payload: Vec<u8>,
        transport: &mut dyn Transport,
        ledger: &mut dyn Ledger,
    ) -> Option<Routed> {
        let id = match self.links.get(&link) {
            Some(id) => *id,
            None => {
                debug!("Dropping {:?} message on unbound link {}", channel, link);
                return None;
            }
        };
        let welcomed = self.is_welcomed();
        let cap = self.config.max_queued_messages;
        let peer = self.peers.get_mut(&id)?;
        if welcomed && peer.is_application_connected() {
            return Some(route(id, peer.info.input_slot, channel, payload));
        }
        if !peer.enqueue(channel, payload, cap) {
            self.fault(id, ProtocolError::QueueFull(cap), transport, ledger);
        }
        None
    }

    /// Single decision point for misbehaving remotes.
    pub fn fault(
        &mut self,
        peer: ConnectionId,
        error: ProtocolError,
        transport: &mut dyn Transport,
        ledger: &mut dyn Ledger,
    ) {
        warn!("Protocol error from peer {}: {}", peer, error);
        let blames_coordinator = match &self.role {
            Role::Idle => return,
            Role::Coordinator(_) => {
                self.remove_member(peer, Some(DisconnectReason::ProtocolError), transport, ledger);
                return;
            }
            Role::Member(member) => {
                member.coordinator == Some(peer) || member.migration_candidate() == Some(peer)
            }
        };
        if blames_coordinator {
            self.fail(DisconnectReason::ProtocolError, transport);
        } else {
            self.drop_link(peer, transport);
        }
    }

    /// Closes our link to a member and tells the coordinator.
    fn drop_link(&mut self, id: ConnectionId, transport: &mut dyn Transport) {
        if let Some(peer) = self.peers.get_mut(&id) {
            if let Some(link) = peer.link {
                if !peer.link_lost {
                    transport.disconnect(link, &DisconnectReason::ProtocolError.to_string());
                }
                self.links.remove(&link);
            }
            peer.lose_link();
        }
        self.report_lost(id, transport);
    }

    fn report_lost(&mut self, id: ConnectionId, transport: &mut dyn Transport) {
        if let Some(coordinator) = self.coordinator_id() {
            if coordinator != self.local_id() {
                self.send_control(transport, coordinator, &ControlMessage::LostConnectionTo { peer: id });
            }
        }
    }

    /// Enters the terminal state, closing every link.
    pub fn fail(&mut self, reason: DisconnectReason, transport: &mut dyn Transport) {
        if self.state.is_disconnected() {
            return;
        }
        warn!("Disconnecting: {}", reason);
        let text = reason.to_string();
        for peer in self.peers.values() {
            if let (Some(link), false) = (peer.link, peer.link_lost) {
                transport.disconnect(link, &text);
            }
        }
        if let Role::Member(member) = &self.role {
            if !self.links.contains_key(&member.join_link) && member.coordinator.is_none() {
                transport.disconnect(member.join_link, &text);
            }
        }
        self.links.clear();
        self.role = Role::Idle;
        self.state = PeerState::Disconnected(reason);
        self.events.push(MeshEvent::Disconnected(reason));
    }

    pub fn fail_internal(&mut self, error: InternalError, transport: &mut dyn Transport) {
        error!("Internal error: {}", error);
        self.fail(DisconnectReason::InternalError, transport);
    }

    /// Leaves the session on request. Coordinators announce it first so
    /// members can migrate at once.
    pub fn shutdown(&mut self, transport: &mut dyn Transport) {
        if self.is_coordinator() {
            self.broadcast_control(transport, &ControlMessage::CoordinatorShutdown, None);
        }
        self.fail(DisconnectReason::UserRequested, transport);
    }

    /// Time-driven work: dispute deadlines, hail expiry, migration.
    pub fn tick(&mut self, transport: &mut dyn Transport, ledger: &mut dyn Ledger) {
        match &self.role {
            Role::Coordinator(_) => self.coordinator_tick(transport, ledger),
            Role::Member(_) => self.member_tick(transport, ledger),
            Role::Idle => {}
        }
    }
}

fn route(peer: ConnectionId, slot: InputSlot, channel: Channel, payload: Vec<u8>) -> Routed {
    match channel {
        Channel::Diagnostics => Routed::Diagnostics { peer, payload },
        _ => Routed::Input {
            peer,
            slot,
            payload,
        },
    }
}
