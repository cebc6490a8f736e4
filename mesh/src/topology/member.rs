//! Member side of the mesh: joining, forming links to other members, and
//! host migration when the coordinator goes away.

use super::coordinator::CoordinatorState;
use super::{PeerState, Role, Topology};
use crate::consistency::Ledger;
use crate::remote_peer::RemotePeer;
use crate::session::MeshEvent;
use log::{debug, info, warn};
use shared::protocol::{
    ControlMessage, Hail, HostMigration, JoinRequest, MeshIntroduction, PeerInfo,
};
use shared::{
    ConnectionId, DisconnectReason, Endpoint, Frame, InputSlot, InternalError, LinkId,
    ProtocolError, Transport,
};
use std::time::Duration;

/// A mesh hail that arrived before the coordinator introduced its sender.
#[derive(Debug, Clone, Copy)]
pub(super) struct UnmatchedHail {
    link: LinkId,
    connection_id: ConnectionId,
    token: u64,
    expires: Duration,
}

#[derive(Debug, Clone)]
pub(super) struct Migration {
    candidate: ConnectionId,
    started: Duration,
    /// Slots of members that left along with the old coordinator.
    departed: Vec<InputSlot>,
}

#[derive(Debug)]
pub(super) struct MemberState {
    pub(super) join_link: LinkId,
    pub(super) coordinator: Option<ConnectionId>,
    unmatched: Vec<UnmatchedHail>,
    clean_shutdown: bool,
    accused_by: Option<ConnectionId>,
    migration: Option<Migration>,
    buffered: Vec<(ConnectionId, HostMigration)>,
}

impl MemberState {
    fn new(join_link: LinkId) -> Self {
        Self {
            join_link,
            coordinator: None,
            unmatched: Vec::new(),
            clean_shutdown: false,
            accused_by: None,
            migration: None,
            buffered: Vec::new(),
        }
    }

    pub(super) fn migration_candidate(&self) -> Option<ConnectionId> {
        self.migration.as_ref().map(|migration| migration.candidate)
    }

    /// Earliest effective frame among buffered migration events.
    pub(super) fn retention_hold(&self) -> Option<Frame> {
        self.buffered
            .iter()
            .flat_map(|(_, migration)| migration.events.iter())
            .map(|event| event.effective_frame)
            .min()
    }
}

impl Topology {
    fn member(&mut self) -> Option<&mut MemberState> {
        match &mut self.role {
            Role::Member(state) => Some(state),
            _ => None,
        }
    }

    /// Asks the coordinator at `remote` for admission.
    pub fn join(
        &mut self,
        remote: Endpoint,
        request: JoinRequest,
        transport: &mut dyn Transport,
    ) -> Result<(), InternalError> {
        let hail = Hail::Join(request).encode()?;
        let link = transport.connect(remote, hail);
        self.role = Role::Member(MemberState::new(link));
        self.state = PeerState::Connecting;
        info!("Joining session at {}", remote);
        Ok(())
    }

    /// Answers a hail from another member, matching it to the token the
    /// coordinator handed us. Hails from peers not yet introduced wait.
    pub(super) fn accept_mesh_link(
        &mut self,
        link: LinkId,
        connection_id: ConnectionId,
        token: u64,
        transport: &mut dyn Transport,
    ) {
        if !self.peers.contains_key(&connection_id) {
            let expires = self.now + self.config.dispute_timeout;
            if let Some(member) = self.member() {
                debug!("Holding hail from unknown peer {}", connection_id);
                member.unmatched.push(UnmatchedHail {
                    link,
                    connection_id,
                    token,
                    expires,
                });
            }
            return;
        }
        self.bind_hail(link, connection_id, token, transport);
    }

    fn bind_hail(
        &mut self,
        link: LinkId,
        connection_id: ConnectionId,
        token: u64,
        transport: &mut dyn Transport,
    ) {
        let accepted = match self.peers.get_mut(&connection_id) {
            Some(peer) if peer.token == token && peer.link.is_none() && !peer.link_lost => {
                peer.link = Some(link);
                peer.initiated = false;
                true
            }
            _ => false,
        };
        if accepted {
            self.links.insert(link, connection_id);
            transport.approve(link);
            debug!("Accepted link {} from peer {}", link, connection_id);
        } else {
            warn!("Rejecting mesh hail from peer {} with a bad token", connection_id);
            transport.deny(link, &DisconnectReason::ProtocolError.to_string());
        }
    }

    fn match_unmatched(&mut self, connection_id: ConnectionId, transport: &mut dyn Transport) {
        let held: Vec<UnmatchedHail> = match self.member() {
            Some(member) => {
                let (held, rest): (Vec<UnmatchedHail>, Vec<UnmatchedHail>) = member
                    .unmatched
                    .iter()
                    .partition(|hail| hail.connection_id == connection_id);
                member.unmatched = rest;
                held
            }
            None => return,
        };
        for hail in held {
            self.bind_hail(hail.link, hail.connection_id, hail.token, transport);
        }
    }

    /// Opens our side of the link to a lower-id member.
    fn open_mesh_link(&mut self, id: ConnectionId, transport: &mut dyn Transport) {
        let (endpoint, token) = match self.peers.get(&id) {
            Some(peer) => (peer.info.endpoints().first().copied(), peer.token),
            None => return,
        };
        let endpoint = match endpoint {
            Some(endpoint) => endpoint,
            None => {
                warn!("Peer {} has no endpoint to connect to", id);
                self.report_lost(id, transport);
                return;
            }
        };
        let hail = Hail::Mesh {
            connection_id: self.local_id(),
            token,
        };
        let bytes = match hail.encode() {
            Ok(bytes) => bytes,
            Err(e) => return self.fail_internal(e, transport),
        };
        let link = transport.connect(endpoint, bytes);
        if let Some(peer) = self.peers.get_mut(&id) {
            peer.link = Some(link);
            peer.initiated = true;
        }
        self.links.insert(link, id);
        debug!("Connecting to peer {} at {}", id, endpoint);
    }

    fn introduce(
        &mut self,
        introduction: MeshIntroduction,
        transport: &mut dyn Transport,
    ) -> Result<(), ProtocolError> {
        introduction.peer.validate()?;
        let id = introduction.peer.connection_id;
        if id == self.local_id() || self.peers.contains_key(&id) {
            return Ok(());
        }
        let endpoints = introduction.peer.endpoints();
        self.insert_peer(RemotePeer::new(introduction.peer, introduction.token));
        if id < self.local_id() {
            self.open_mesh_link(id, transport);
        } else {
            for endpoint in endpoints {
                transport.punch_through(endpoint);
            }
            self.match_unmatched(id, transport);
        }
        Ok(())
    }

    pub(super) fn member_control(
        &mut self,
        from: Option<ConnectionId>,
        link: LinkId,
        message: ControlMessage,
        transport: &mut dyn Transport,
        ledger: &mut dyn Ledger,
    ) -> Result<(), ProtocolError> {
        let (join_link, coordinator) = match self.member() {
            Some(member) => (member.join_link, member.coordinator),
            None => return Ok(()),
        };

        if let ControlMessage::NetworkStartInfo {
            you,
            coordinator,
            peers,
        } = message
        {
            if link != join_link || self.state != PeerState::Connecting {
                return Err(ProtocolError::Unexpected("NetworkStartInfo"));
            }
            return self.start_mesh(link, you, coordinator, peers, transport);
        }

        let from = from.ok_or(ProtocolError::Unexpected(message.name()))?;
        if let ControlMessage::HostMigration(migration) = message {
            return self.on_host_migration(from, migration, transport, ledger);
        }
        if Some(from) != coordinator {
            return Err(ProtocolError::Unexpected(message.name()));
        }

        match message {
            ControlMessage::PeerJoined(introduction) => self.introduce(introduction, transport),
            ControlMessage::PeerBecameApplicationConnected { peer, event } => {
                if ledger.is_running() {
                    ledger.apply_event(&event, from, None)?;
                }
                if peer == self.local_id() {
                    return Ok(());
                }
                let info = match self.peers.get_mut(&peer) {
                    Some(remote) => {
                        remote.info.is_application_connected = true;
                        remote.sent_through = event.consistent_frame;
                        remote.info.clone()
                    }
                    None => return Err(ProtocolError::UnknownPeer(peer)),
                };
                info!("Peer {} is application-connected", peer);
                self.flush(peer);
                self.events.push(MeshEvent::PeerJoined(info));
                Ok(())
            }
            ControlMessage::Welcome(welcome) => {
                if self.state != PeerState::PendingFullMesh {
                    return Err(ProtocolError::Unexpected("Welcome"));
                }
                let slot = self.local_slot().ok_or(ProtocolError::Unexpected("Welcome"))?;
                ledger.accept_welcome(&welcome, slot)?;
                if let Some(local) = self.local.as_mut() {
                    local.is_application_connected = true;
                }
                self.state = PeerState::ApplicationConnected;
                info!(
                    "Welcomed into the session at frame {} as peer {}",
                    welcome.frame,
                    self.local_id()
                );
                let connected: Vec<_> = self
                    .peers
                    .values()
                    .filter(|peer| peer.is_application_connected())
                    .map(|peer| peer.info.clone())
                    .collect();
                self.flush_all();
                self.events
                    .extend(connected.into_iter().map(MeshEvent::PeerJoined));
                Ok(())
            }
            ControlMessage::PeerLeft {
                peer,
                event,
                inputs,
            } => {
                if peer == self.local_id() {
                    self.fail(DisconnectReason::KickedByServer, transport);
                    return Ok(());
                }
                if let (Some(event), true) = (&event, ledger.is_running()) {
                    ledger.apply_event(event, from, inputs.as_ref())?;
                }
                self.remove_remote(peer, transport, ledger);
                Ok(())
            }
            ControlMessage::DisconnectedBy { reporter } => {
                info!("Peer {} reports losing us; disputing", reporter);
                if let Some(member) = self.member() {
                    member.accused_by = Some(reporter);
                }
                self.send_control(transport, from, &ControlMessage::DisputeDisconnect { reporter });
                Ok(())
            }
            ControlMessage::Kicked { reason } => {
                self.fail(reason, transport);
                Ok(())
            }
            ControlMessage::CoordinatorShutdown => {
                info!("Coordinator {} is shutting down", from);
                if let Some(member) = self.member() {
                    member.clean_shutdown = true;
                }
                Ok(())
            }
            other => Err(ProtocolError::Unexpected(other.name())),
        }
    }

    fn start_mesh(
        &mut self,
        link: LinkId,
        you: PeerInfo,
        coordinator: ConnectionId,
        peers: Vec<MeshIntroduction>,
        transport: &mut dyn Transport,
    ) -> Result<(), ProtocolError> {
        you.validate()?;
        let host = peers
            .iter()
            .find(|introduction| introduction.peer.connection_id == coordinator)
            .map(|introduction| introduction.peer.clone())
            .ok_or(ProtocolError::UnknownPeer(coordinator))?;
        host.validate()?;

        info!(
            "Admitted as peer {} in slot {}; linking to {} members",
            you.connection_id,
            you.input_slot,
            peers.len().saturating_sub(1)
        );
        self.highest_id = self.highest_id.max(you.connection_id);
        self.local = Some(you);
        let mut entry = RemotePeer::new(host, 0);
        entry.link = Some(link);
        entry.connected = true;
        self.insert_peer(entry);
        if let Some(member) = self.member() {
            member.coordinator = Some(coordinator);
        }
        self.state = PeerState::PendingFullMesh;

        for introduction in peers {
            if introduction.peer.connection_id != coordinator {
                self.introduce(introduction, transport)?;
            }
        }
        Ok(())
    }

    pub(super) fn member_link_down(
        &mut self,
        link: LinkId,
        id: Option<ConnectionId>,
        reason: &str,
        transport: &mut dyn Transport,
        ledger: &mut dyn Ledger,
    ) {
        let (join_link, coordinator, candidate) = match self.member() {
            Some(member) => (member.join_link, member.coordinator, member.migration_candidate()),
            None => return,
        };
        let id = match id {
            Some(id) => id,
            None => {
                if link == join_link && coordinator.is_none() && self.state == PeerState::Connecting {
                    let reason = DisconnectReason::parse(reason)
                        .unwrap_or(DisconnectReason::LostConnectionToServer);
                    self.fail(reason, transport);
                } else if let Some(member) = self.member() {
                    member.unmatched.retain(|hail| hail.link != link);
                }
                return;
            }
        };

        if let Some(peer) = self.peers.get_mut(&id) {
            peer.lose_link();
        }
        if Some(id) == coordinator {
            if self.state == PeerState::ApplicationConnected {
                self.start_migration(id, transport, ledger);
            } else {
                let reason = DisconnectReason::parse(reason)
                    .unwrap_or(DisconnectReason::LostConnectionToServer);
                self.fail(reason, transport);
            }
            return;
        }

        info!("Lost link to peer {}: {}", id, reason);
        self.report_lost(id, transport);
        if Some(id) == candidate {
            self.elect(transport, ledger);
        }
    }

    fn start_migration(
        &mut self,
        old: ConnectionId,
        transport: &mut dyn Transport,
        ledger: &mut dyn Ledger,
    ) {
        warn!("Lost coordinator {}; starting host migration", old);
        let departed: Vec<InputSlot> = self
            .remove_remote(old, transport, ledger)
            .filter(RemotePeer::is_application_connected)
            .map(|peer| peer.info.input_slot)
            .into_iter()
            .collect();
        let now = self.now;
        if let Some(member) = self.member() {
            member.coordinator = None;
            member.migration = Some(Migration {
                candidate: 0,
                started: now,
                departed,
            });
        }
        self.state = PeerState::MigratingToCoordinator;
        self.elect(transport, ledger);
    }

    /// Picks the lowest reachable application-connected id, possibly ourselves.
    fn elect(&mut self, transport: &mut dyn Transport, ledger: &mut dyn Ledger) {
        let me = self.local_id();
        let candidate = self
            .peers
            .values()
            .filter(|peer| peer.is_application_connected() && peer.is_reachable())
            .map(RemotePeer::id)
            .chain(std::iter::once(me))
            .min()
            .unwrap_or(me);

        let now = self.now;
        let buffered = match self.member() {
            Some(member) => {
                match member.migration.as_mut() {
                    Some(migration) => {
                        migration.candidate = candidate;
                        migration.started = now;
                    }
                    None => return,
                }
                member
                    .buffered
                    .iter()
                    .position(|(from, _)| *from == candidate)
                    .map(|index| member.buffered.remove(index))
            }
            None => return,
        };

        if candidate == me {
            info!("Electing ourselves as coordinator");
            return;
        }
        info!("Waiting for peer {} to take over as coordinator", candidate);
        if let Some((from, migration)) = buffered {
            if let Err(e) = self.accept_migration(from, migration, transport, ledger) {
                self.fault(from, e, transport, ledger);
            }
        }
    }

    fn on_host_migration(
        &mut self,
        from: ConnectionId,
        migration: HostMigration,
        transport: &mut dyn Transport,
        ledger: &mut dyn Ledger,
    ) -> Result<(), ProtocolError> {
        let cap = self.config.max_buffered_migration_messages;
        let member = match self.member() {
            Some(member) => member,
            None => return Ok(()),
        };
        if member.migration_candidate() == Some(from) {
            return self.accept_migration(from, migration, transport, ledger);
        }
        if member.buffered.len() >= cap {
            return Err(ProtocolError::MigrationBufferFull(cap));
        }
        debug!("Buffering host migration from peer {}", from);
        member.buffered.push((from, migration));
        Ok(())
    }

    fn accept_migration(
        &mut self,
        from: ConnectionId,
        migration: HostMigration,
        transport: &mut dyn Transport,
        ledger: &mut dyn Ledger,
    ) -> Result<(), ProtocolError> {
        if migration.coordinator != from {
            return Err(ProtocolError::Unexpected("HostMigration"));
        }
        ledger.reconcile_migration(&migration)?;
        if !migration.members.contains(&self.local_id()) {
            warn!("New coordinator {} did not keep us", from);
            self.fail(DisconnectReason::HostMigrationFailed, transport);
            return Ok(());
        }

        let stale: Vec<ConnectionId> = self
            .peers
            .keys()
            .copied()
            .filter(|id| *id != from && !migration.members.contains(id))
            .collect();
        for id in stale {
            self.remove_remote(id, transport, ledger);
        }
        if let Some(peer) = self.peers.get_mut(&from) {
            peer.info.is_server = true;
        }
        if let Some(member) = self.member() {
            member.coordinator = Some(from);
            member.migration = None;
            member.clean_shutdown = false;
            member.accused_by = None;
            member.buffered.clear();
        }
        self.state = PeerState::ApplicationConnected;
        info!("Peer {} is the new coordinator (NCF {})", from, migration.ncf);
        Ok(())
    }

    fn become_coordinator(
        &mut self,
        departed: Vec<InputSlot>,
        transport: &mut dyn Transport,
        ledger: &mut dyn Ledger,
    ) {
        let mut departed = departed;
        let unreachable: Vec<ConnectionId> = self
            .peers
            .values()
            .filter(|peer| !peer.is_reachable() || !peer.is_application_connected())
            .map(RemotePeer::id)
            .collect();
        for id in unreachable {
            if let Some(peer) = self.remove_remote(id, transport, ledger) {
                if peer.is_application_connected() {
                    departed.push(peer.info.input_slot);
                }
            }
        }

        let me = self.local_id();
        let members: Vec<ConnectionId> = self.peers.keys().copied().collect();
        let payload = ledger.migration_payload(me, members, &departed);
        let message = ControlMessage::HostMigration(payload);
        self.broadcast_control(transport, &message, None);

        self.role = Role::Coordinator(CoordinatorState::new(self.highest_id + 1));
        if let Some(local) = self.local.as_mut() {
            local.is_server = true;
        }
        self.state = PeerState::Coordinator;
        self.events.push(MeshEvent::BecameCoordinator);
        info!(
            "Took over as coordinator with {} members, NCF {}",
            self.peers.len(),
            ledger.ncf()
        );
    }

    pub(super) fn member_tick(&mut self, transport: &mut dyn Transport, ledger: &mut dyn Ledger) {
        let now = self.now;
        let me = self.local_id();
        let grace = self.config.migration_grace;
        let timeout = self.config.host_migration_timeout;
        let any_link = self.peers.values().any(RemotePeer::is_reachable);

        let (expired, verdict) = match self.member() {
            Some(member) => {
                let (expired, held): (Vec<UnmatchedHail>, Vec<UnmatchedHail>) =
                    member.unmatched.iter().partition(|hail| hail.expires <= now);
                member.unmatched = held;

                let verdict = member.migration.as_ref().map(|migration| {
                    let waited = now.saturating_sub(migration.started);
                    if migration.candidate != me {
                        if waited > timeout {
                            Verdict::Fail(DisconnectReason::HostMigrationTimedOut)
                        } else {
                            Verdict::Wait
                        }
                    } else if member.clean_shutdown {
                        Verdict::TakeOver(migration.departed.clone())
                    } else if waited < grace {
                        Verdict::Wait
                    } else if member.accused_by.is_none() && any_link {
                        Verdict::TakeOver(migration.departed.clone())
                    } else {
                        Verdict::Fail(DisconnectReason::HostMigrationFailed)
                    }
                });
                (expired, verdict)
            }
            None => return,
        };

        for hail in expired {
            debug!("Hail from peer {} expired", hail.connection_id);
            transport.deny(hail.link, &DisconnectReason::ProtocolError.to_string());
        }
        match verdict {
            Some(Verdict::TakeOver(departed)) => {
                self.become_coordinator(departed, transport, ledger)
            }
            Some(Verdict::Fail(reason)) => self.fail(reason, transport),
            Some(Verdict::Wait) | None => {}
        }
    }
}

enum Verdict {
    Wait,
    TakeOver(Vec<InputSlot>),
    Fail(DisconnectReason),
}
