//! The per-tick driver
//!
//! A [`MeshSession`] owns the transport, the topology manager, the
//! consistency engine and the desync detector. The application calls
//! [`MeshSession::update`] once per rendered frame with the elapsed time and
//! its current local input; everything else happens inside that call:
//!
//! 1. Drain transport events through the topology manager
//! 2. Run time-driven topology work (disputes, migration)
//! 3. Resimulate any frame invalidated by new input
//! 4. Advance the frame clock and simulate new frames
//! 5. Advance NCF and compare consistency reports
//! 6. Send local input to every peer
//! 7. Trim history no peer can still need

use crate::clock::FrameClock;
use crate::consistency::{Engine, Ledger, StalledSlot};
use crate::desync::{DesyncDetector, DesyncExporter, MemoryExporter};
use crate::topology::{PeerState, Routed, Topology};
use log::{debug, info};
use shared::protocol::{JoinLeaveEvent, JoinRequest, PeerInfo};
use shared::{
    Channel, ConnectionId, DisconnectReason, Endpoint, Frame, InternalError, MeshConfig,
    ProtocolError, Simulation, StateHash, Transport,
};
use std::time::Duration;

/// Notifications for the application, drained with [`MeshSession::drain_events`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshEvent {
    PeerJoined(PeerInfo),
    PeerLeft(ConnectionId),
    BecameCoordinator,
    DesyncDetected { peer: ConnectionId, frame: Frame },
    Disconnected(DisconnectReason),
}

pub struct MeshSession<S, T> {
    config: MeshConfig,
    transport: T,
    topology: Topology,
    engine: Engine<S>,
    clock: FrameClock,
    desync: DesyncDetector,
    events: Vec<MeshEvent>,
    last_coordinator: Option<ConnectionId>,
    disconnect_requested: bool,
}

impl<S: Simulation, T: Transport> MeshSession<S, T> {
    pub fn new(config: MeshConfig, simulation: S, transport: T) -> Self {
        Self::with_exporter(config, simulation, transport, Box::new(MemoryExporter::new()))
    }

    pub fn with_exporter(
        config: MeshConfig,
        simulation: S,
        transport: T,
        exporter: Box<dyn DesyncExporter>,
    ) -> Self {
        let config = config.sanitized();
        Self {
            topology: Topology::new(config.clone()),
            engine: Engine::new(config.clone(), simulation),
            clock: FrameClock::new(&config),
            desync: DesyncDetector::new(&config, exporter),
            config,
            transport,
            events: Vec::new(),
            last_coordinator: None,
            disconnect_requested: false,
        }
    }

    /// Starts a new session with ourselves as coordinator.
    pub fn host(&mut self, name: &str, player_data: &[u8]) {
        if self.topology.state() != PeerState::Unstarted {
            return;
        }
        let endpoint = self.transport.local_endpoint();
        self.topology.host(name, player_data, endpoint, &mut self.engine);
    }

    /// Asks the coordinator at `remote` to admit us.
    pub fn join(
        &mut self,
        remote: Endpoint,
        name: &str,
        player_data: &[u8],
        side_channel: Option<(u64, u64)>,
    ) -> Result<(), InternalError> {
        if self.topology.state() != PeerState::Unstarted {
            return Ok(());
        }
        let request = JoinRequest {
            app_version: self.config.app_version,
            app_signature: self.config.app_signature.clone(),
            observed_endpoint: Some(self.transport.local_endpoint()),
            side_channel_id: side_channel.map(|(id, _)| id),
            side_channel_token: side_channel.map(|(_, token)| token),
            name: name.to_string(),
            player_data: player_data.to_vec(),
        };
        self.topology.join(remote, request, &mut self.transport)
    }

    /// Leaves the session at the start of the next update.
    pub fn disconnect(&mut self) {
        self.disconnect_requested = true;
    }

    pub fn register_side_channel(&mut self, id: u64, token: u64) {
        self.topology.register_side_channel(id, token);
    }

    pub fn state(&self) -> PeerState {
        self.topology.state()
    }

    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        match self.topology.state() {
            PeerState::Disconnected(reason) => Some(reason),
            _ => None,
        }
    }

    pub fn local_peer(&self) -> Option<&PeerInfo> {
        self.topology.local()
    }

    pub fn peers(&self) -> Vec<&PeerInfo> {
        self.topology.peers().map(|peer| &peer.info).collect()
    }

    pub fn coordinator(&self) -> Option<ConnectionId> {
        self.topology.coordinator_id()
    }

    pub fn ncf(&self) -> Frame {
        self.engine.ncf()
    }

    pub fn simulation_frame(&self) -> Frame {
        self.engine.simulation_frame()
    }

    pub fn input_frame(&self) -> Frame {
        self.engine.input_frame()
    }

    pub fn jle_epoch(&self) -> u32 {
        self.engine.jle_epoch()
    }

    /// Oldest frame whose inputs are still retained.
    pub fn history_floor(&self) -> Frame {
        self.engine.floor()
    }

    /// Join/leave events this peer still retains, oldest first.
    pub fn join_leave_events(&self) -> Vec<JoinLeaveEvent> {
        self.engine.events().cloned().collect()
    }

    pub fn simulation(&self) -> &S {
        self.engine.simulation()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Hash of our snapshot after `frame`, while it is retained.
    pub fn state_hash(&mut self, frame: Frame) -> Option<StateHash> {
        self.engine.hash_at(frame)
    }

    pub fn discovery_data(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.engine.simulation().write_discovery_data(&mut out);
        out
    }

    pub fn drain_events(&mut self) -> Vec<MeshEvent> {
        self.collect_events();
        std::mem::take(&mut self.events)
    }

    fn collect_events(&mut self) {
        for event in self.topology.take_events() {
            if let MeshEvent::PeerLeft(id) = event {
                self.desync.forget(id);
            }
            self.events.push(event);
        }
        let coordinator = self.topology.coordinator_id();
        if coordinator != self.last_coordinator {
            if let Some(id) = coordinator {
                info!("Coordinator is now peer {}", id);
            }
            self.clock.forget();
            self.last_coordinator = coordinator;
        }
    }

    pub fn update(&mut self, elapsed: Duration, local_input: u32) {
        if self.disconnect_requested {
            self.disconnect_requested = false;
            self.topology.shutdown(&mut self.transport);
        }
        if self.topology.state().is_disconnected() {
            self.collect_events();
            return;
        }

        self.topology.advance(elapsed);
        for event in self.transport.poll() {
            let routed = self
                .topology
                .handle(event, &mut self.transport, &mut self.engine);
            if let Some(routed) = routed {
                self.dispatch(routed);
            }
            for routed in self.topology.take_ready() {
                self.dispatch(routed);
            }
        }
        self.topology.tick(&mut self.transport, &mut self.engine);

        if self.topology.state().is_running() && self.engine.is_running() {
            if let Err(e) = self.run_frames(elapsed, local_input) {
                self.topology.fail_internal(e, &mut self.transport);
            }
        }
        self.collect_events();
    }

    fn run_frames(&mut self, elapsed: Duration, local_input: u32) -> Result<(), InternalError> {
        self.engine.resimulate()?;

        let ticks = if self.topology.is_coordinator() {
            self.clock.coordinator_ticks(elapsed)
        } else {
            self.clock.member_ticks(self.engine.input_frame(), elapsed)
        };
        for _ in 0..ticks {
            self.engine.tick(local_input)?;
        }

        if let Some(stall) = self.engine.advance_ncf()? {
            self.on_stall(stall);
        }

        let coordinator = self.topology.coordinator_id().unwrap_or(0);
        let epoch = self.engine.jle_epoch();
        for mismatch in self.desync.process(&mut self.engine, epoch, coordinator) {
            if let Some(dump) = mismatch.dump {
                self.topology
                    .send(&mut self.transport, mismatch.peer, Channel::Diagnostics, dump);
            }
            self.events.push(MeshEvent::DesyncDetected {
                peer: mismatch.peer,
                frame: mismatch.frame,
            });
        }

        self.send_inputs(coordinator);
        self.engine.trim(self.topology.retention_hold());
        Ok(())
    }

    fn send_inputs(&mut self, coordinator: ConnectionId) {
        for (peer, mut sent_through) in self.topology.input_targets() {
            while let Some((payload, last)) =
                self.engine.outgoing_input(sent_through, coordinator)
            {
                self.topology
                    .send(&mut self.transport, peer, Channel::Input, payload);
                sent_through = last;
            }
            self.topology.set_sent_through(peer, sent_through);
        }
    }

    fn on_stall(&mut self, stall: StalledSlot) {
        if let Some(peer) = self.topology.slot_owner(stall.slot) {
            let error = ProtocolError::Stalled {
                slot: stall.slot,
                frame: stall.frame,
            };
            self.topology
                .fault(peer, error, &mut self.transport, &mut self.engine);
        }
    }

    fn dispatch(&mut self, routed: Routed) {
        match routed {
            Routed::Input {
                peer,
                slot,
                payload,
            } => match self.engine.receive_input(slot, &payload) {
                Ok(received) => {
                    let coordinator = self.topology.coordinator_id();
                    if Some(peer) == coordinator {
                        let rtt = self
                            .topology
                            .peer(peer)
                            .and_then(|remote| remote.link)
                            .and_then(|link| self.transport.round_trip_time(link))
                            .unwrap_or_default();
                        self.clock.observe(received.last_frame, rtt);
                    }
                    if let Some(report) = received.report {
                        let vouching = Some(peer) == coordinator
                            && Some(report.coordinator) == coordinator;
                        self.engine.note_report(peer, &report, vouching);
                        self.desync.note_report(peer, report);
                    }
                }
                Err(e) => {
                    self.topology
                        .fault(peer, e, &mut self.transport, &mut self.engine);
                }
            },
            Routed::Diagnostics { peer, payload } => {
                let coordinator = self.topology.coordinator_id().unwrap_or(0);
                let epoch = self.engine.jle_epoch();
                match self
                    .desync
                    .on_dump(peer, &payload, &self.engine, epoch, coordinator)
                {
                    Ok(Some(frame)) => debug!("Dump from {} diverges at frame {}", peer, frame),
                    Ok(None) => {}
                    Err(e) => self
                        .topology
                        .fault(peer, e, &mut self.transport, &mut self.engine),
                }
            }
        }
    }
}
