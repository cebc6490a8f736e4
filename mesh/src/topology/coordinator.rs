//! Coordinator side of the mesh: admission, join completion, disputes and
//! member removal.

use super::{PeerState, Role, Topology, FIRST_CONNECTION_ID};
use crate::consistency::Ledger;
use crate::remote_peer::RemotePeer;
use crate::session::MeshEvent;
use log::{debug, info, warn};
use shared::protocol::{ControlMessage, JoinRequest, MeshIntroduction, PeerInfo};
use shared::{
    slot_mask, ConnectionId, DisconnectReason, Endpoint, Frame, LinkId, ProtocolError, Transport,
};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

/// A joiner still forming links to existing members.
#[derive(Debug)]
pub(super) struct PendingJoin {
    waiting_on: BTreeSet<ConnectionId>,
}

/// A member accused of being unreachable by a higher-id reporter.
#[derive(Debug, Clone, Copy)]
pub(super) struct Dispute {
    accused: ConnectionId,
    reporter: ConnectionId,
    deadline: Duration,
}

#[derive(Debug)]
pub(super) struct CoordinatorState {
    next_id: ConnectionId,
    pending: BTreeMap<ConnectionId, PendingJoin>,
    disputes: Vec<Dispute>,
}

impl CoordinatorState {
    pub(super) fn new(next_id: ConnectionId) -> Self {
        Self {
            next_id,
            pending: BTreeMap::new(),
            disputes: Vec::new(),
        }
    }
}

impl Topology {
    fn coordinator(&mut self) -> Option<&mut CoordinatorState> {
        match &mut self.role {
            Role::Coordinator(state) => Some(state),
            _ => None,
        }
    }

    /// Starts a new session with the local peer as coordinator in slot 0.
    pub fn host(
        &mut self,
        name: &str,
        player_data: &[u8],
        endpoint: Endpoint,
        ledger: &mut dyn Ledger,
    ) {
        let info = PeerInfo {
            connection_id: FIRST_CONNECTION_ID,
            name: name.to_string(),
            player_data: player_data.to_vec(),
            input_slot: 0,
            internal_endpoint: Some(endpoint),
            external_endpoint: Some(endpoint),
            side_channel_id: None,
            is_server: true,
            is_application_connected: true,
        };
        ledger.start_host(0, name, player_data, FIRST_CONNECTION_ID);
        self.highest_id = FIRST_CONNECTION_ID;
        self.local = Some(info);
        self.role = Role::Coordinator(CoordinatorState::new(FIRST_CONNECTION_ID + 1));
        self.state = PeerState::Coordinator;
        info!("Hosting session on {} as peer {}", endpoint, FIRST_CONNECTION_ID);
    }

    fn check_request(&self, request: &JoinRequest) -> Result<(), DisconnectReason> {
        if request.app_version != self.config.app_version {
            return Err(DisconnectReason::VersionMismatch);
        }
        if request.app_signature != self.config.app_signature {
            return Err(DisconnectReason::SignatureMismatch);
        }
        if self.config.require_side_channel {
            let registered = request
                .side_channel_id
                .and_then(|id| self.side_channels.get(&id));
            match (registered, request.side_channel_token) {
                (Some(expected), Some(token)) if *expected == token => {}
                _ => return Err(DisconnectReason::SideChannelRejected),
            }
        }
        Ok(())
    }

    /// Validates a join request and, if it passes, introduces the joiner to
    /// every existing member.
    pub(super) fn admit(
        &mut self,
        link: LinkId,
        remote: Endpoint,
        request: JoinRequest,
        transport: &mut dyn Transport,
        ledger: &mut dyn Ledger,
    ) {
        if let Err(reason) = self.check_request(&request) {
            info!("Rejecting join from {}: {}", remote, reason);
            transport.deny(link, &reason.to_string());
            return;
        }

        let reserved = self
            .peers
            .values()
            .filter(|peer| !peer.is_application_connected())
            .fold(0u8, |mask, peer| mask | slot_mask(peer.info.input_slot));
        let slot = match ledger.free_slot(reserved, self.config.max_slots) {
            Some(slot) => slot,
            None => {
                info!("Rejecting join from {}: no free input slot", remote);
                transport.deny(link, &DisconnectReason::ServerFull.to_string());
                return;
            }
        };

        let id = match self.coordinator() {
            Some(state) => {
                let id = state.next_id;
                state.next_id += 1;
                id
            }
            None => return,
        };
        let joiner = PeerInfo {
            connection_id: id,
            name: request.name,
            player_data: request.player_data,
            input_slot: slot,
            internal_endpoint: request.observed_endpoint,
            external_endpoint: Some(remote),
            side_channel_id: request.side_channel_id,
            is_server: false,
            is_application_connected: false,
        };
        transport.approve(link);
        info!(
            "Peer {} ({}) admitted from {} into slot {}",
            id, joiner.name, remote, slot
        );

        let others: Vec<ConnectionId> = self.peers.keys().copied().collect();
        let mut introductions = Vec::with_capacity(others.len() + 1);
        if let Some(local) = &self.local {
            introductions.push(MeshIntroduction {
                peer: local.clone(),
                token: 0,
            });
        }
        for other in &others {
            let token = rand::random::<u64>();
            let introduction = MeshIntroduction {
                peer: joiner.clone(),
                token,
            };
            self.send_control(transport, *other, &ControlMessage::PeerJoined(introduction));
            if let Some(peer) = self.peers.get(other) {
                introductions.push(MeshIntroduction {
                    peer: peer.info.clone(),
                    token,
                });
            }
        }

        let mut entry = RemotePeer::new(joiner.clone(), 0);
        entry.link = Some(link);
        self.insert_peer(entry);
        self.send_control(
            transport,
            id,
            &ControlMessage::NetworkStartInfo {
                you: joiner,
                coordinator: self.local_id(),
                peers: introductions,
            },
        );

        if let Some(state) = self.coordinator() {
            state.pending.insert(
                id,
                PendingJoin {
                    waiting_on: others.into_iter().collect(),
                },
            );
        }
        self.try_complete_join(id, transport, ledger);
    }

    fn try_complete_join(
        &mut self,
        id: ConnectionId,
        transport: &mut dyn Transport,
        ledger: &mut dyn Ledger,
    ) {
        let ready = match self.coordinator() {
            Some(state) => {
                let linked = state
                    .pending
                    .get(&id)
                    .map_or(false, |pending| pending.waiting_on.is_empty());
                if linked {
                    state.pending.remove(&id);
                }
                linked
            }
            None => false,
        };
        if ready {
            self.complete_join(id, transport, ledger);
        }
    }

    /// Makes a fully linked joiner visible to the simulation.
    fn complete_join(
        &mut self,
        id: ConnectionId,
        transport: &mut dyn Transport,
        ledger: &mut dyn Ledger,
    ) {
        let info = match self.peers.get(&id) {
            Some(peer) => peer.info.clone(),
            None => return,
        };
        let event = ledger.authorize_join(
            info.input_slot,
            &info.name,
            &info.player_data,
            self.local_id(),
        );
        let welcome = match ledger.welcome(&event) {
            Ok(welcome) => welcome,
            Err(e) => return self.fail_internal(e, transport),
        };

        let local_slot = self.local_slot();
        let sent_through = welcome
            .inputs
            .iter()
            .find(|inputs| Some(inputs.slot) == local_slot)
            .map_or(welcome.frame, |inputs| {
                inputs.start_frame + inputs.values.len() as Frame - 1
            });
        if let Some(peer) = self.peers.get_mut(&id) {
            peer.info.is_application_connected = true;
            peer.sent_through = sent_through;
        }
        info!(
            "Peer {} is application-connected in slot {} from frame {}",
            id, info.input_slot, event.effective_frame
        );

        self.send_control(transport, id, &ControlMessage::Welcome(welcome));
        self.broadcast_control(
            transport,
            &ControlMessage::PeerBecameApplicationConnected { peer: id, event },
            Some(id),
        );
        self.flush(id);
        let mut joined = info;
        joined.is_application_connected = true;
        self.events.push(MeshEvent::PeerJoined(joined));
    }

    pub(super) fn coordinator_control(
        &mut self,
        from: ConnectionId,
        message: ControlMessage,
        transport: &mut dyn Transport,
        ledger: &mut dyn Ledger,
    ) -> Result<(), ProtocolError> {
        match message {
            ControlMessage::MeshLinkUp { peer } => {
                if let Some(pending) = self
                    .coordinator()
                    .and_then(|state| state.pending.get_mut(&from))
                {
                    pending.waiting_on.remove(&peer);
                } else {
                    debug!("Link report from {} outside a pending join", from);
                }
                self.try_complete_join(from, transport, ledger);
                Ok(())
            }
            ControlMessage::LostConnectionTo { peer: accused } => {
                self.on_lost_report(from, accused, transport, ledger);
                Ok(())
            }
            ControlMessage::DisputeDisconnect { reporter } => {
                let disputed = self.coordinator().and_then(|state| {
                    let index = state
                        .disputes
                        .iter()
                        .position(|d| d.accused == from && d.reporter == reporter)?;
                    Some(state.disputes.remove(index))
                });
                if disputed.is_some() {
                    info!(
                        "Peer {} disputed the report from {}; removing the reporter",
                        from, reporter
                    );
                    let kick = Some(DisconnectReason::KickedByServer);
                    self.remove_member(reporter, kick, transport, ledger);
                }
                Ok(())
            }
            other => Err(ProtocolError::Unexpected(other.name())),
        }
    }

    /// A lower id losing a higher id wins outright. The other way round the
    /// accused gets a window to prove it is alive.
    fn on_lost_report(
        &mut self,
        reporter: ConnectionId,
        accused: ConnectionId,
        transport: &mut dyn Transport,
        ledger: &mut dyn Ledger,
    ) {
        if !self.peers.contains_key(&accused) || accused == reporter {
            return;
        }
        if reporter < accused {
            info!("Peer {} lost peer {}; removing {}", reporter, accused, accused);
            self.remove_member(accused, Some(DisconnectReason::KickedByServer), transport, ledger);
            return;
        }

        let deadline = self.now + self.config.dispute_timeout;
        let opened = match self.coordinator() {
            Some(state)
                if !state
                    .disputes
                    .iter()
                    .any(|d| d.accused == accused && d.reporter == reporter) =>
            {
                state.disputes.push(Dispute {
                    accused,
                    reporter,
                    deadline,
                });
                true
            }
            _ => false,
        };
        if opened {
            info!(
                "Peer {} reports losing peer {}; waiting for a dispute",
                reporter, accused
            );
            self.send_control(transport, accused, &ControlMessage::DisconnectedBy { reporter });
        }
    }

    /// Removes a member, authorizing its leave if it was in the simulation.
    pub(super) fn remove_member(
        &mut self,
        id: ConnectionId,
        kick: Option<DisconnectReason>,
        transport: &mut dyn Transport,
        ledger: &mut dyn Ledger,
    ) {
        let peer = match self.peers.get(&id) {
            Some(peer) => peer,
            None => return,
        };
        if let (Some(reason), Some(link), false) = (kick, peer.link, peer.link_lost) {
            warn!("Kicking peer {}: {}", id, reason);
            Self::send_on_link(transport, link, &ControlMessage::Kicked { reason });
        }
        let was_connected = peer.is_application_connected();
        let slot = peer.info.input_slot;
        self.remove_remote(id, transport, ledger);

        let (event, inputs) = if was_connected {
            match ledger.authorize_leave(slot, self.local_id()) {
                Some((event, inputs)) => (Some(event), inputs),
                None => (None, None),
            }
        } else {
            (None, None)
        };
        self.broadcast_control(
            transport,
            &ControlMessage::PeerLeft {
                peer: id,
                event,
                inputs,
            },
            None,
        );

        let unblocked: Vec<ConnectionId> = match self.coordinator() {
            Some(state) => {
                state.pending.remove(&id);
                state.disputes.retain(|d| d.accused != id && d.reporter != id);
                state
                    .pending
                    .iter_mut()
                    .filter_map(|(joiner, pending)| {
                        pending.waiting_on.remove(&id);
                        pending.waiting_on.is_empty().then_some(*joiner)
                    })
                    .collect()
            }
            None => Vec::new(),
        };
        for joiner in unblocked {
            self.try_complete_join(joiner, transport, ledger);
        }
    }

    pub(super) fn coordinator_tick(
        &mut self,
        transport: &mut dyn Transport,
        ledger: &mut dyn Ledger,
    ) {
        let now = self.now;
        let expired: Vec<Dispute> = match self.coordinator() {
            Some(state) => {
                let (expired, open): (Vec<Dispute>, Vec<Dispute>) =
                    state.disputes.iter().partition(|d| d.deadline <= now);
                state.disputes = open;
                expired
            }
            None => return,
        };
        for dispute in expired {
            info!(
                "Peer {} did not dispute the report from {}; removing it",
                dispute.accused, dispute.reporter
            );
            let kick = Some(DisconnectReason::KickedByServer);
            self.remove_member(dispute.accused, kick, transport, ledger);
        }
    }
}
